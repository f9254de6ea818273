// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use vbsign::bios::{self, AreaTable, BiosComponent, show};

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let Ok(table) = AreaTable::find(data) else {
                    return;
                };

                for component in BiosComponent::ALL {
                    if let Ok(area) = table.resolve(component) {
                        let _ = area.data(data);
                    }
                }

                let _ = bios::is_bios_image(data);
                let _ = show::show(data, &table).to_string();
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
