// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Inspection and re-signing of verified boot BIOS images.
//!
//! A BIOS image contains an FMAP that locates a GBB and one or two
//! (`FW_MAIN_*`, `VBLOCK_*`) slot pairs. Every region is resolved fresh for
//! each operation and all access to region contents goes through bounds
//! checked views of the image buffer.

use std::{error, fmt, io, ops::Range, path::PathBuf};

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::format::{
    fmap::{self, Fmap},
    vb2::{self, PackedKey},
};

pub mod cbfs;
pub mod gbb;
pub mod show;
pub mod sign;
pub mod slot;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error(transparent)]
    Gbb(#[from] crate::format::gbb::Error),
    #[error(transparent)]
    Vb2(#[from] vb2::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} area not found in FMAP")]
    MissingRegion(BiosComponent),
    #[error("{component} needs {needed:#x} bytes, but only {available:#x} are available")]
    RegionTooSmall {
        component: BiosComponent,
        needed: u64,
        available: u64,
    },
    #[error("{component} is malformed")]
    Format {
        component: BiosComponent,
        #[source]
        source: FormatError,
    },
    #[error("{0} keyblock and preamble cannot be verified")]
    ChainNotVerifiable(BiosComponent, #[source] vb2::Error),
    #[error("Failed to create new signature for {0}")]
    Signature(BiosComponent, #[source] vb2::Error),
    #[error("CBFS metadata hash not found in {component}, but it is required for images with VBOOT_CBFS_INTEGRATION")]
    MetadataHashRequired {
        component: BiosComponent,
        #[source]
        source: Option<cbfs::Error>,
    },
    #[error("Keyblock data key is invalid")]
    InvalidKeyblock(#[source] vb2::Error),
    #[error("Signing key does not match the keyblock data key")]
    KeyMismatch,
    #[error("Invalid LOEM ID: {0:?}")]
    InvalidLoemId(String),
    #[error("Failed to write file: {0:?}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Failed to find FMAP")]
    Fmap(#[from] fmap::Error),
}

impl Error {
    /// Whether the error must abort the whole operation. Non-fatal errors only
    /// downgrade trust in existing data or affect best-effort side outputs.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ChainNotVerifiable(..) | Self::Io(..))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Render an error and all of its sources on one line.
pub fn error_chain(e: &dyn error::Error) -> String {
    let mut result = e.to_string();
    let mut source = e.source();

    while let Some(s) = source {
        result.push_str(": ");
        result.push_str(&s.to_string());
        source = s.source();
    }

    result
}

fn serialize_error<S: Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_str(&error_chain(e)),
        None => serializer.serialize_none(),
    }
}

/// The fixed set of regions that make up a BIOS image. The declaration order
/// is the order in which regions are processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BiosComponent {
    Gbb,
    FwMainA,
    FwMainB,
    VblockA,
    VblockB,
}

impl BiosComponent {
    pub const ALL: [Self; 5] = [
        Self::Gbb,
        Self::FwMainA,
        Self::FwMainB,
        Self::VblockA,
        Self::VblockB,
    ];

    pub fn area_name(self) -> &'static str {
        match self {
            Self::Gbb => "GBB",
            Self::FwMainA => "FW_MAIN_A",
            Self::FwMainB => "FW_MAIN_B",
            Self::VblockA => "VBLOCK_A",
            Self::VblockB => "VBLOCK_B",
        }
    }

    /// Whether every BIOS image must contain this region.
    pub fn is_mandatory(self) -> bool {
        matches!(self, Self::Gbb | Self::FwMainA | Self::VblockA)
    }
}

impl fmt::Display for BiosComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.area_name())
    }
}

/// One of the redundant firmware slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub const ALL: [Self; 2] = [Self::A, Self::B];

    pub fn body(self) -> BiosComponent {
        match self {
            Self::A => BiosComponent::FwMainA,
            Self::B => BiosComponent::FwMainB,
        }
    }

    pub fn vblock(self) -> BiosComponent {
        match self {
            Self::A => BiosComponent::VblockA,
            Self::B => BiosComponent::VblockB,
        }
    }

    pub fn letter(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

/// A resolved region. If the FMAP entry extends past the end of the image or
/// its end overflows, the offset and size are zero and `is_valid` is false.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AreaRecord {
    pub component: BiosComponent,
    pub offset: usize,
    pub size: usize,
    pub is_valid: bool,
    /// End offset declared in the FMAP, before clamping.
    pub declared_end: u64,
}

impl AreaRecord {
    pub fn range(&self) -> Option<Range<usize>> {
        self.offset
            .checked_add(self.size)
            .map(|end| self.offset..end)
    }

    /// View of the region's bytes or [`None`] if it does not lie within
    /// `image`.
    pub fn data<'a>(&self, image: &'a [u8]) -> Option<&'a [u8]> {
        self.range().and_then(|r| image.get(r))
    }

    pub fn data_mut<'a>(&self, image: &'a mut [u8]) -> Option<&'a mut [u8]> {
        self.range().and_then(|r| image.get_mut(r))
    }

    /// Fail if the region was clamped during resolution.
    pub fn require_valid(&self, image_len: usize) -> Result<()> {
        if !self.is_valid {
            return Err(Error::RegionTooSmall {
                component: self.component,
                needed: self.declared_end,
                available: image_len as u64,
            });
        }

        Ok(())
    }
}

/// The FMAP of one image along with the image length needed to bounds check
/// its entries.
#[derive(Clone, Debug)]
pub struct AreaTable {
    fmap_offset: usize,
    fmap: Fmap,
    image_len: usize,
}

impl AreaTable {
    pub fn find(image: &[u8]) -> Result<Self> {
        let (fmap_offset, fmap) = Fmap::find(image)?;
        debug!("Found FMAP at {fmap_offset:#x} with {} areas", fmap.areas.len());

        Ok(Self {
            fmap_offset,
            fmap,
            image_len: image.len(),
        })
    }

    pub fn fmap_offset(&self) -> usize {
        self.fmap_offset
    }

    pub fn fmap(&self) -> &Fmap {
        &self.fmap
    }

    pub fn image_len(&self) -> usize {
        self.image_len
    }

    pub fn contains(&self, component: BiosComponent) -> bool {
        self.fmap.area(component.area_name()).is_some()
    }

    /// Look up a component's area. Areas that do not fit in the image are
    /// returned with a zero offset and size and marked invalid.
    pub fn resolve(&self, component: BiosComponent) -> Result<AreaRecord> {
        let area = self
            .fmap
            .area(component.area_name())
            .ok_or(Error::MissingRegion(component))?;
        let declared_end = u64::from(area.offset) + u64::from(area.size);

        if declared_end > self.image_len as u64 {
            debug!(
                "{component} {:#x} + {:#x} > {:#x}",
                area.offset, area.size, self.image_len,
            );

            return Ok(AreaRecord {
                component,
                offset: 0,
                size: 0,
                is_valid: false,
                declared_end,
            });
        }

        Ok(AreaRecord {
            component,
            offset: area.offset as usize,
            size: area.size as usize,
            is_valid: true,
            declared_end,
        })
    }
}

/// Check if an image looks like a BIOS image. It must have an FMAP with at
/// least the GBB and the slot A regions.
pub fn is_bios_image(image: &[u8]) -> bool {
    let Ok(table) = AreaTable::find(image) else {
        return false;
    };

    BiosComponent::ALL
        .into_iter()
        .filter(|c| c.is_mandatory())
        .all(|c| table.contains(c))
}

/// Human-readable summary of a packed key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub algorithm: u32,
    pub algorithm_name: &'static str,
    pub key_version: u32,
    pub sha1sum: String,
}

impl KeyInfo {
    pub fn new(key: &PackedKey) -> Self {
        Self {
            algorithm: key.algorithm,
            algorithm_name: key.algorithm().map_or("(invalid)", |a| a.name()),
            key_version: key.key_version,
            sha1sum: key.sha1sum(),
        }
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        writeln!(
            f,
            "{indent}Algorithm:           {} {}",
            self.algorithm, self.algorithm_name,
        )?;
        writeln!(f, "{indent}Key Version:         {}", self.key_version)?;
        writeln!(f, "{indent}Key sha1sum:         {}", self.sha1sum)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::format::fmap::FmapArea;

    fn table(areas: &[(&str, u32, u32)], image_len: usize) -> AreaTable {
        let mut fmap = Fmap::new("FMAP", image_len as u32).unwrap();
        for (name, offset, size) in areas {
            fmap.areas.push(FmapArea::new(name, *offset, *size).unwrap());
        }

        AreaTable {
            fmap_offset: 0,
            fmap,
            image_len,
        }
    }

    #[test]
    fn resolve_clamps_out_of_bounds() {
        let table = table(
            &[
                ("GBB", 0x100, 0x100),
                ("FW_MAIN_A", 0x800, 0x900),
                ("VBLOCK_A", u32::MAX, u32::MAX),
            ],
            0x1000,
        );

        let gbb = table.resolve(BiosComponent::Gbb).unwrap();
        assert!(gbb.is_valid);
        assert_eq!(gbb.range(), Some(0x100..0x200));

        let body = table.resolve(BiosComponent::FwMainA).unwrap();
        assert!(!body.is_valid);
        assert_eq!((body.offset, body.size), (0, 0));
        assert_eq!(body.declared_end, 0x1100);

        let vblock = table.resolve(BiosComponent::VblockA).unwrap();
        assert!(!vblock.is_valid);
        assert_eq!((vblock.offset, vblock.size), (0, 0));
        assert_matches!(
            vblock.require_valid(0x1000),
            Err(Error::RegionTooSmall {
                component: BiosComponent::VblockA,
                ..
            })
        );

        assert_matches!(
            table.resolve(BiosComponent::FwMainB),
            Err(Error::MissingRegion(BiosComponent::FwMainB))
        );
    }

    #[test]
    fn record_views_fail_closed() {
        let record = AreaRecord {
            component: BiosComponent::FwMainA,
            offset: 8,
            size: 8,
            is_valid: true,
            declared_end: 16,
        };

        assert_eq!(record.data(&[0u8; 16]).map(|d| d.len()), Some(8));
        assert_eq!(record.data(&[0u8; 15]), None);

        let overflowing = AreaRecord {
            offset: usize::MAX,
            ..record
        };
        assert_eq!(overflowing.data(&[0u8; 16]), None);
    }

    #[test]
    fn error_severity() {
        let chain = Error::ChainNotVerifiable(BiosComponent::VblockA, vb2::Error::HashMismatch);
        assert!(!chain.is_fatal());
        assert!(Error::MissingRegion(BiosComponent::FwMainA).is_fatal());
        assert!(!Error::Io(PathBuf::from("vblock_A.x"), io::ErrorKind::NotFound.into()).is_fatal());
    }
}
