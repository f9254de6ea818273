// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use bstr::ByteSlice;
use serde::Serialize;

use crate::{
    bios::{AreaRecord, BiosComponent, Error, FormatError, KeyInfo, serialize_error},
    format::{
        gbb::{self, GbbHeader, HwidDigestStatus, SubRegion},
        vb2::PackedKey,
    },
};

/// An embedded GBB key.
#[derive(Debug, Serialize)]
pub struct KeyReport {
    /// Absolute offset of the key within the image.
    pub offset: u64,
    pub size: u32,
    pub info: Option<KeyInfo>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
    #[serde(skip)]
    pub key: Option<PackedKey>,
}

impl KeyReport {
    pub fn is_valid(&self) -> bool {
        self.key.is_some()
    }
}

#[derive(Debug, Serialize)]
pub struct GbbReport {
    pub area: AreaRecord,
    pub header: Option<GbbHeader>,
    /// Number of bytes needed by the header and all sub-regions.
    pub max_extent: Option<u64>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
    pub hwid: Option<String>,
    pub hwid_digest: Option<HwidDigestStatus>,
    pub root_key: Option<KeyReport>,
    pub recovery_key: Option<KeyReport>,
}

impl GbbReport {
    /// Whether the header and both keys are valid.
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
            && self.root_key.as_ref().is_some_and(|k| k.is_valid())
            && self.recovery_key.as_ref().is_some_and(|k| k.is_valid())
    }

    /// The root key, if it is well-formed.
    pub fn root_key(&self) -> Option<&PackedKey> {
        self.root_key.as_ref().and_then(|k| k.key.as_ref())
    }
}

fn format_error(e: gbb::Error) -> Error {
    Error::Format {
        component: BiosComponent::Gbb,
        source: FormatError::Gbb(e),
    }
}

fn inspect_key(data: &[u8], gbb_offset: usize, region: &SubRegion) -> KeyReport {
    let mut report = KeyReport {
        offset: gbb_offset as u64 + u64::from(region.offset),
        size: region.size,
        info: None,
        error: None,
        key: None,
    };

    // The header was validated, so the region is always in bounds.
    let key_data = region.range(data.len()).map_or(&[][..], |r| &data[r]);

    match PackedKey::parse(key_data) {
        Ok(key) => {
            report.info = Some(KeyInfo::new(&key));
            report.key = Some(key);
        }
        Err(e) => {
            report.error = Some(Error::Format {
                component: BiosComponent::Gbb,
                source: FormatError::Vb2(e),
            });
        }
    }

    report
}

/// Validate and describe a GBB region. Problems are recorded in the report
/// instead of aborting so that as much information as possible is available.
pub fn inspect(area: &AreaRecord, image: &[u8]) -> GbbReport {
    let mut report = GbbReport {
        area: *area,
        header: None,
        max_extent: None,
        error: None,
        hwid: None,
        hwid_digest: None,
        root_key: None,
        recovery_key: None,
    };

    let data = match area.data(image) {
        Some(d) if !d.is_empty() => d,
        _ => {
            report.error = Some(Error::RegionTooSmall {
                component: BiosComponent::Gbb,
                needed: gbb::HEADER_SIZE as u64,
                available: 0,
            });
            return report;
        }
    };

    let header = match GbbHeader::parse(data) {
        Ok(h) => h,
        Err(e) => {
            report.error = Some(format_error(e));
            return report;
        }
    };

    report.max_extent = Some(header.max_extent());

    if let Err(e) = header.validate(data) {
        report.error = Some(format_error(e));
        report.header = Some(header);
        return report;
    }

    report.hwid = header.hwid(data).map(|h| h.to_str_lossy().into_owned());
    report.hwid_digest = Some(header.hwid_digest_status(data));
    report.root_key = Some(inspect_key(data, area.offset, &header.rootkey));
    report.recovery_key = Some(inspect_key(data, area.offset, &header.recovery_key));
    report.header = Some(header);

    report
}

fn write_key(f: &mut fmt::Formatter<'_>, name: &str, key: &KeyReport) -> fmt::Result {
    match &key.info {
        Some(info) if key.is_valid() => {
            writeln!(f, "  {name}")?;
            info.write(f, "    ")
        }
        _ => writeln!(f, "  {name:<23}<invalid>"),
    }
}

impl fmt::Display for GbbReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.area.component.area_name();

        let Some(header) = &self.header else {
            writeln!(f, "GBB header:              {name} <invalid>")?;
            if let Some(e) = &self.error {
                writeln!(f, "  Error:                 {}", super::error_chain(e))?;
            }
            return Ok(());
        };

        writeln!(f, "GBB header:              {name}")?;
        writeln!(
            f,
            "  Version:               {}.{}",
            header.major_version, header.minor_version,
        )?;
        writeln!(f, "  Flags:                 {:#010x}", header.flags.bits())?;
        writeln!(f, "  Regions:                 offset       size")?;
        for (region_name, region) in [
            ("hwid", &header.hwid),
            ("bmpvf", &header.bmpfv),
            ("rootkey", &header.rootkey),
            ("recovery_key", &header.recovery_key),
        ] {
            writeln!(
                f,
                "    {region_name:<21}{:#010x}   {:#010x}",
                region.offset, region.size,
            )?;
        }

        let max_extent = self.max_extent.unwrap_or_default();
        writeln!(
            f,
            "  Size:                  {max_extent:#010x} / {:#010x}{}",
            self.area.size,
            if max_extent > self.area.size as u64 {
                "  (not enough)"
            } else {
                ""
            },
        )?;

        if self.root_key.is_none() {
            if let Some(e) = &self.error {
                writeln!(f, "  Error:                 {}", super::error_chain(e))?;
            }
            return writeln!(f, "GBB header is invalid, ignoring content");
        }

        writeln!(f, "GBB content:")?;
        writeln!(
            f,
            "  HWID:                  {}",
            self.hwid.as_deref().unwrap_or_default(),
        )?;
        match self.hwid_digest {
            Some(HwidDigestStatus::Absent) | None => {
                writeln!(f, "     digest:             <none>")?;
            }
            Some(status) => {
                writeln!(
                    f,
                    "     digest:             {}   {}",
                    hex::encode(header.hwid_digest),
                    if status == HwidDigestStatus::Valid {
                        "valid"
                    } else {
                        "<invalid>"
                    },
                )?;
            }
        }

        if let Some(key) = &self.root_key {
            write_key(f, "Root Key:", key)?;
        }
        if let Some(key) = &self.recovery_key {
            write_key(f, "Recovery Key:", key)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        crypto,
        format::{
            gbb::{GbbFlags, GbbLayout},
            vb2::Algorithm,
        },
    };

    fn packed_key() -> Vec<u8> {
        let key = crypto::generate_rsa_key_pair(1024, 65537).unwrap();
        PackedKey::from_public_key(&key.to_public_key(), Algorithm::Rsa1024Sha256, 1)
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    fn image_with_gbb(root_key: &[u8], recovery_key: &[u8]) -> (Vec<u8>, AreaRecord) {
        let layout = GbbLayout {
            hwid_size: 0x40,
            rootkey_size: 0x200,
            bmpfv_size: 0,
            recovery_key_size: 0x200,
        };
        let gbb = gbb::create(&layout, "HWID", root_key, recovery_key, GbbFlags::empty()).unwrap();

        let mut image = vec![0xffu8; 0x100];
        image.extend_from_slice(&gbb);

        let area = AreaRecord {
            component: BiosComponent::Gbb,
            offset: 0x100,
            size: gbb.len(),
            is_valid: true,
            declared_end: image.len() as u64,
        };

        (image, area)
    }

    #[test]
    fn valid_gbb() {
        let key = packed_key();
        let (image, area) = image_with_gbb(&key, &key);

        let report = inspect(&area, &image);
        assert!(report.is_valid(), "{report}");
        assert_eq!(report.hwid.as_deref(), Some("HWID"));
        assert_eq!(report.hwid_digest, Some(HwidDigestStatus::Valid));

        let root_key = report.root_key.as_ref().unwrap();
        assert_eq!(root_key.offset, 0x100 + 128 + 0x40);
        assert!(report.root_key().is_some());
    }

    #[test]
    fn invalid_recovery_key_does_not_hide_root_key() {
        let key = packed_key();
        let (image, area) = image_with_gbb(&key, &[0u8; 16]);

        let report = inspect(&area, &image);
        assert!(!report.is_valid());
        assert!(report.root_key.as_ref().unwrap().is_valid());
        assert_matches!(
            report.recovery_key.as_ref().unwrap().error,
            Some(Error::Format { .. })
        );
    }

    #[test]
    fn truncated_gbb() {
        let key = packed_key();
        let (image, mut area) = image_with_gbb(&key, &key);
        area.size -= 1;

        let report = inspect(&area, &image);
        assert!(!report.is_valid());
        assert_eq!(report.max_extent, Some(area.size as u64 + 1));
        assert!(report.header.is_some());
        assert!(report.to_string().contains("(not enough)"));
    }

    #[test]
    fn empty_gbb() {
        let area = AreaRecord {
            component: BiosComponent::Gbb,
            offset: 0,
            size: 0,
            is_valid: false,
            declared_end: 0x1000,
        };

        let report = inspect(&area, &[0u8; 16]);
        assert_matches!(report.error, Some(Error::RegionTooSmall { .. }));
        assert!(report.to_string().contains("<invalid>"));
    }
}
