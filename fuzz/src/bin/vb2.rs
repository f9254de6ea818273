// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use vbsign::bios::slot;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = slot::verify_chain(data);
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
