// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use vbsign::format::gbb::GbbHeader;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let Ok(header) = GbbHeader::parse(data) else {
                    return;
                };

                if header.validate(data).is_ok() {
                    let _ = header.hwid(data);
                    let _ = header.hwid_digest_status(data);
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
