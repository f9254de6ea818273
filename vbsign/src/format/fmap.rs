// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, mem};

use bstr::ByteSlice;
use memchr::memmem;
use thiserror::Error;
use tracing::debug;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::util;

/// Magic value for [`RawHeader::signature`].
pub const SIGNATURE: &[u8; 8] = b"__FMAP__";

/// Supported major version.
pub const MAJOR_VERSION: u8 = 1;
/// Minor version used when writing.
pub const MINOR_VERSION: u8 = 1;

/// Size of the fixed-width name fields.
pub const NAME_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("FMAP signature not found")]
    NotFound,
    #[error("Invalid FMAP signature: {:?}", .0.as_bstr())]
    InvalidSignature([u8; 8]),
    #[error("Unsupported FMAP major version: {0}")]
    UnsupportedMajorVersion(u8),
    #[error("FMAP header is truncated")]
    HeaderTruncated,
    #[error("FMAP area table ({0} areas) is truncated")]
    AreasTruncated(u16),
    #[error("Name too long ({0} > {NAME_LEN} bytes): {1:?}")]
    NameTooLong(usize, String),
    #[error("Too many areas: {0}")]
    TooManyAreas(usize),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the FMAP header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`SIGNATURE`].
    signature: [u8; 8],
    /// Major version. Only [`MAJOR_VERSION`] is supported.
    ver_major: u8,
    ver_minor: u8,
    /// Address of the flash the image is mapped to.
    base: little_endian::U64,
    /// Size of the flash in bytes.
    size: little_endian::U32,
    /// NULL-padded name.
    name: [u8; NAME_LEN],
    /// Number of [`RawArea`] entries that immediately follow the header.
    nareas: little_endian::U16,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("signature", &self.signature.as_bstr())
            .field("ver_major", &self.ver_major)
            .field("ver_minor", &self.ver_minor)
            .field("base", &format_args!("{:#x}", self.base.get()))
            .field("size", &self.size.get())
            .field("name", &util::until_nul(&self.name).as_bstr())
            .field("nareas", &self.nareas.get())
            .finish()
    }
}

/// Raw on-disk layout for an area entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawArea {
    /// Offset relative to the start of the image.
    offset: little_endian::U32,
    size: little_endian::U32,
    /// NULL-padded name.
    name: [u8; NAME_LEN],
    flags: little_endian::U16,
}

fn pad_name(name: &str) -> Result<[u8; NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.len() > NAME_LEN {
        return Err(Error::NameTooLong(bytes.len(), name.to_owned()));
    }

    let mut result = [0u8; NAME_LEN];
    result[..bytes.len()].copy_from_slice(bytes);

    Ok(result)
}

/// A named region of the image.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FmapArea {
    pub offset: u32,
    pub size: u32,
    pub name: [u8; NAME_LEN],
    pub flags: u16,
}

impl fmt::Debug for FmapArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FmapArea")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &format_args!("{:#x}", self.size))
            .field("name", &self.display_name())
            .field("flags", &self.flags)
            .finish()
    }
}

impl FmapArea {
    pub fn new(name: &str, offset: u32, size: u32) -> Result<Self> {
        Ok(Self {
            offset,
            size,
            name: pad_name(name)?,
            flags: 0,
        })
    }

    /// Compare the full fixed-width name field against `name`. Bytes after the
    /// first NULL terminator must be zero for the names to match.
    pub fn name_matches(&self, name: &str) -> bool {
        match pad_name(name) {
            Ok(padded) => padded == self.name,
            Err(_) => false,
        }
    }

    /// Name for display purposes only. Anything after the first NULL byte is
    /// ignored.
    pub fn display_name(&self) -> String {
        util::until_nul(&self.name).to_str_lossy().into_owned()
    }

    /// Exclusive end offset or [`None`] if it overflows.
    pub fn end(&self) -> Option<u64> {
        u64::from(self.offset).checked_add(u64::from(self.size))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Fmap {
    pub ver_major: u8,
    pub ver_minor: u8,
    pub base: u64,
    pub size: u32,
    pub name: [u8; NAME_LEN],
    pub areas: Vec<FmapArea>,
}

impl fmt::Debug for Fmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fmap")
            .field("ver_major", &self.ver_major)
            .field("ver_minor", &self.ver_minor)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("name", &util::until_nul(&self.name).as_bstr())
            .field("areas", &self.areas)
            .finish()
    }
}

impl Fmap {
    pub fn new(name: &str, size: u32) -> Result<Self> {
        Ok(Self {
            ver_major: MAJOR_VERSION,
            ver_minor: MINOR_VERSION,
            base: 0,
            size,
            name: pad_name(name)?,
            areas: vec![],
        })
    }

    /// Parse an FMAP that starts at the beginning of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header, rest) = RawHeader::ref_from_prefix(data).map_err(|_| Error::HeaderTruncated)?;

        if &header.signature != SIGNATURE {
            return Err(Error::InvalidSignature(header.signature));
        } else if header.ver_major != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(header.ver_major));
        }

        let nareas = header.nareas.get();
        let (raw_areas, _) = <[RawArea]>::ref_from_prefix_with_elems(rest, nareas.into())
            .map_err(|_| Error::AreasTruncated(nareas))?;

        let areas = raw_areas
            .iter()
            .map(|a| FmapArea {
                offset: a.offset.get(),
                size: a.size.get(),
                name: a.name,
                flags: a.flags.get(),
            })
            .collect();

        Ok(Self {
            ver_major: header.ver_major,
            ver_minor: header.ver_minor,
            base: header.base.get(),
            size: header.size.get(),
            name: header.name,
            areas,
        })
    }

    /// Scan `data` for the first valid FMAP. Returns the offset of the header
    /// and the parsed table. Candidates with an unsupported version or a
    /// truncated area table are skipped.
    pub fn find(data: &[u8]) -> Result<(usize, Self)> {
        for offset in memmem::find_iter(data, SIGNATURE) {
            match Self::parse(&data[offset..]) {
                Ok(fmap) => return Ok((offset, fmap)),
                Err(e) => {
                    debug!("Skipping FMAP candidate at {offset:#x}: {e}");
                }
            }
        }

        Err(Error::NotFound)
    }

    /// Find an area by its exact name.
    pub fn area(&self, name: &str) -> Option<&FmapArea> {
        self.areas.iter().find(|a| a.name_matches(name))
    }

    /// Serialized size of the header and area table.
    pub fn encoded_len(&self) -> usize {
        mem::size_of::<RawHeader>() + self.areas.len() * mem::size_of::<RawArea>()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let nareas =
            u16::try_from(self.areas.len()).map_err(|_| Error::TooManyAreas(self.areas.len()))?;

        let header = RawHeader {
            signature: *SIGNATURE,
            ver_major: self.ver_major,
            ver_minor: self.ver_minor,
            base: self.base.into(),
            size: self.size.into(),
            name: self.name,
            nareas: nareas.into(),
        };

        let mut result = Vec::with_capacity(self.encoded_len());
        result.extend_from_slice(header.as_bytes());

        for area in &self.areas {
            let raw = RawArea {
                offset: area.offset.into(),
                size: area.size.into(),
                name: area.name,
                flags: area.flags.into(),
            };
            result.extend_from_slice(raw.as_bytes());
        }

        Ok(result)
    }
}
