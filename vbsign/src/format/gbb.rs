// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, mem, ops::Range};

use bitflags::bitflags;
use bstr::ByteSlice;
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::util;

/// Magic value for [`RawHeader::signature`].
pub const SIGNATURE: [u8; 4] = *b"$GBB";

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;
/// Minor version used when writing.
pub const MINOR_VERSION: u16 = 2;
/// Minor version that introduced the HWID digest.
pub const MINOR_VERSION_HWID_DIGEST: u16 = 2;

pub const HEADER_SIZE: usize = mem::size_of::<RawHeader>();

const HWID_DIGEST_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("GBB is too small: {0} < {HEADER_SIZE}")]
    TooSmall(usize),
    #[error("Invalid GBB signature: {:?}", .0.as_bstr())]
    InvalidSignature([u8; 4]),
    #[error("Unsupported GBB major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Invalid GBB header size: {0}")]
    InvalidHeaderSize(u32),
    #[error("GBB {0} region overlaps the header")]
    RegionOverlapsHeader(&'static str),
    #[error("GBB {0} region ends at {1:#x}, past the end of the GBB ({2:#x})")]
    RegionOutOfBounds(&'static str, u64, usize),
    #[error("GBB HWID is not NULL-terminated")]
    HwidNotTerminated,
    #[error("GBB {0} ({1} bytes) does not fit in its region ({2} bytes)")]
    ContentTooLarge(&'static str, usize, u32),
    #[error("GBB size overflows")]
    SizeOverflow,
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct GbbFlags: u32 {
        /// Reduce the developer screen delay.
        const DEV_SCREEN_SHORT_DELAY = 1 << 0;
        const LOAD_OPTION_ROMS = 1 << 1;
        const ENABLE_ALTERNATE_OS = 1 << 2;
        const FORCE_DEV_SWITCH_ON = 1 << 3;
        const FORCE_DEV_BOOT_USB = 1 << 4;
        /// Allow booting firmware with an older version.
        const DISABLE_FW_ROLLBACK_CHECK = 1 << 5;
        const ENTER_TRIGGERS_TONORM = 1 << 6;
        const FORCE_DEV_BOOT_ALTFW = 1 << 7;
        const RUNNING_FAFT = 1 << 8;
        const DISABLE_EC_SOFTWARE_SYNC = 1 << 9;
        const DEFAULT_DEV_BOOT_ALTFW = 1 << 10;
        const DISABLE_AUXFW_SOFTWARE_SYNC = 1 << 11;
        const DISABLE_LID_SHUTDOWN = 1 << 12;
        const FORCE_DEV_BOOT_FASTBOOT_FULL_CAP = 1 << 13;
        const FORCE_MANUAL_RECOVERY = 1 << 14;
        const DISABLE_FWMP = 1 << 15;
        const ENABLE_UDC = 1 << 16;

        const _ = !0;
    }
}

/// Raw on-disk layout for the GBB header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`SIGNATURE`].
    signature: [u8; 4],
    major_version: little_endian::U16,
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    header_size: little_endian::U32,
    flags: little_endian::U32,
    // All offsets are relative to the start of the GBB.
    hwid_offset: little_endian::U32,
    hwid_size: little_endian::U32,
    rootkey_offset: little_endian::U32,
    rootkey_size: little_endian::U32,
    bmpfv_offset: little_endian::U32,
    bmpfv_size: little_endian::U32,
    recovery_key_offset: little_endian::U32,
    recovery_key_size: little_endian::U32,
    /// SHA-256 digest of the HWID string. Only valid since version 1.2.
    hwid_digest: [u8; HWID_DIGEST_SIZE],
    pad: [u8; 48],
}

/// A sub-region of the GBB, relative to the start of the GBB.
#[derive(Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubRegion {
    pub offset: u32,
    pub size: u32,
}

impl fmt::Debug for SubRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{:#x}", self.offset, self.size)
    }
}

impl SubRegion {
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }

    /// Byte range within a GBB of `gbb_size` bytes or [`None`] if the region
    /// does not fit.
    pub fn range(&self, gbb_size: usize) -> Option<Range<usize>> {
        if self.end() > gbb_size as u64 {
            return None;
        }

        Some(self.offset as usize..self.end() as usize)
    }
}

/// Status of the HWID digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HwidDigestStatus {
    /// The header version predates the HWID digest.
    Absent,
    Valid,
    Invalid,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct GbbHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub header_size: u32,
    pub flags: GbbFlags,
    pub hwid: SubRegion,
    pub rootkey: SubRegion,
    pub bmpfv: SubRegion,
    pub recovery_key: SubRegion,
    #[serde(with = "hex")]
    pub hwid_digest: [u8; HWID_DIGEST_SIZE],
}

impl fmt::Debug for GbbHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbbHeader")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("header_size", &self.header_size)
            .field("flags", &self.flags)
            .field("hwid", &self.hwid)
            .field("rootkey", &self.rootkey)
            .field("bmpfv", &self.bmpfv)
            .field("recovery_key", &self.recovery_key)
            .field("hwid_digest", &hex::encode(self.hwid_digest))
            .finish()
    }
}

impl GbbHeader {
    /// Parse the header at the start of `data`. Only the signature and major
    /// version are checked. Use [`Self::validate`] to check the layout.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (raw, _) =
            RawHeader::ref_from_prefix(data).map_err(|_| Error::TooSmall(data.len()))?;

        if raw.signature != SIGNATURE {
            return Err(Error::InvalidSignature(raw.signature));
        }

        let major_version = raw.major_version.get();
        if major_version != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(major_version));
        }

        Ok(Self {
            major_version,
            minor_version: raw.minor_version.get(),
            header_size: raw.header_size.get(),
            flags: GbbFlags::from_bits_retain(raw.flags.get()),
            hwid: SubRegion {
                offset: raw.hwid_offset.get(),
                size: raw.hwid_size.get(),
            },
            rootkey: SubRegion {
                offset: raw.rootkey_offset.get(),
                size: raw.rootkey_size.get(),
            },
            bmpfv: SubRegion {
                offset: raw.bmpfv_offset.get(),
                size: raw.bmpfv_size.get(),
            },
            recovery_key: SubRegion {
                offset: raw.recovery_key_offset.get(),
                size: raw.recovery_key_size.get(),
            },
            hwid_digest: raw.hwid_digest,
        })
    }

    fn regions(&self) -> [(&'static str, &SubRegion); 4] {
        [
            ("hwid", &self.hwid),
            ("rootkey", &self.rootkey),
            ("bmpfv", &self.bmpfv),
            ("recovery_key", &self.recovery_key),
        ]
    }

    /// Number of bytes the GBB needs to hold the header and every sub-region.
    /// This is computed even if the header is invalid to help diagnose
    /// truncated GBBs.
    pub fn max_extent(&self) -> u64 {
        self.regions()
            .iter()
            .map(|(_, r)| r.end())
            .fold(u64::from(self.header_size), u64::max)
    }

    /// Check that the header size is correct and that every sub-region lies
    /// after the header and within the `data.len()` bytes of the GBB.
    pub fn validate(&self, data: &[u8]) -> Result<()> {
        if self.header_size as usize != HEADER_SIZE || self.header_size as usize > data.len() {
            return Err(Error::InvalidHeaderSize(self.header_size));
        }

        for (name, region) in self.regions() {
            if (region.offset as usize) < HEADER_SIZE {
                return Err(Error::RegionOverlapsHeader(name));
            } else if region.range(data.len()).is_none() {
                return Err(Error::RegionOutOfBounds(name, region.end(), data.len()));
            }
        }

        if self.hwid.size != 0 {
            let hwid = &data[self.hwid.range(data.len()).unwrap_or_default()];
            if hwid.find_byte(0).is_none() {
                return Err(Error::HwidNotTerminated);
            }
        }

        Ok(())
    }

    /// The NULL-terminated HWID string or [`None`] if the region is invalid.
    pub fn hwid<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        self.hwid
            .range(data.len())
            .map(|r| util::until_nul(&data[r]))
    }

    pub fn hwid_digest_status(&self, data: &[u8]) -> HwidDigestStatus {
        if self.minor_version < MINOR_VERSION_HWID_DIGEST {
            return HwidDigestStatus::Absent;
        }

        match self.hwid(data) {
            Some(hwid) if digest(&SHA256, hwid).as_ref() == self.hwid_digest => {
                HwidDigestStatus::Valid
            }
            _ => HwidDigestStatus::Invalid,
        }
    }

    /// Bytes of a sub-region or [`None`] if it does not fit in `data`.
    pub fn region_data<'a>(&self, data: &'a [u8], region: &SubRegion) -> Option<&'a [u8]> {
        region.range(data.len()).map(|r| &data[r])
    }
}

/// Sizes of the GBB sub-regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GbbLayout {
    pub hwid_size: u32,
    pub rootkey_size: u32,
    pub bmpfv_size: u32,
    pub recovery_key_size: u32,
}

/// Build a GBB with the sub-regions laid out back to back after the header,
/// in the order: HWID, root key, bitmap FV, and recovery key. The contents are
/// zero padded to the region sizes.
pub fn create(
    layout: &GbbLayout,
    hwid: &str,
    root_key: &[u8],
    recovery_key: &[u8],
    flags: GbbFlags,
) -> Result<Vec<u8>> {
    if hwid.len() >= layout.hwid_size as usize {
        return Err(Error::ContentTooLarge("hwid", hwid.len() + 1, layout.hwid_size));
    } else if root_key.len() > layout.rootkey_size as usize {
        return Err(Error::ContentTooLarge(
            "rootkey",
            root_key.len(),
            layout.rootkey_size,
        ));
    } else if recovery_key.len() > layout.recovery_key_size as usize {
        return Err(Error::ContentTooLarge(
            "recovery_key",
            recovery_key.len(),
            layout.recovery_key_size,
        ));
    }

    let mut offset = HEADER_SIZE as u32;
    let mut next = |size: u32| -> Result<SubRegion> {
        let region = SubRegion { offset, size };
        offset = offset.checked_add(size).ok_or(Error::SizeOverflow)?;
        Ok(region)
    };

    let hwid_region = next(layout.hwid_size)?;
    let rootkey_region = next(layout.rootkey_size)?;
    let bmpfv_region = next(layout.bmpfv_size)?;
    let recovery_region = next(layout.recovery_key_size)?;

    let hwid_digest = digest(&SHA256, hwid.as_bytes());

    let mut raw = RawHeader {
        signature: SIGNATURE,
        major_version: MAJOR_VERSION.into(),
        minor_version: MINOR_VERSION.into(),
        header_size: (HEADER_SIZE as u32).into(),
        flags: flags.bits().into(),
        hwid_offset: hwid_region.offset.into(),
        hwid_size: hwid_region.size.into(),
        rootkey_offset: rootkey_region.offset.into(),
        rootkey_size: rootkey_region.size.into(),
        bmpfv_offset: bmpfv_region.offset.into(),
        bmpfv_size: bmpfv_region.size.into(),
        recovery_key_offset: recovery_region.offset.into(),
        recovery_key_size: recovery_region.size.into(),
        hwid_digest: [0u8; HWID_DIGEST_SIZE],
        pad: [0u8; 48],
    };
    raw.hwid_digest.copy_from_slice(hwid_digest.as_ref());

    let mut data = vec![0u8; recovery_region.end() as usize];
    data[..HEADER_SIZE].copy_from_slice(raw.as_bytes());

    for (region, contents) in [
        (&hwid_region, hwid.as_bytes()),
        (&rootkey_region, root_key),
        (&recovery_region, recovery_key),
    ] {
        let start = region.offset as usize;
        data[start..start + contents.len()].copy_from_slice(contents);
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn sample() -> Vec<u8> {
        let layout = GbbLayout {
            hwid_size: 0x40,
            rootkey_size: 0x20,
            bmpfv_size: 0x10,
            recovery_key_size: 0x20,
        };

        create(
            &layout,
            "TEST HWID 1234",
            &[1u8; 8],
            &[2u8; 8],
            GbbFlags::FORCE_DEV_SWITCH_ON,
        )
        .unwrap()
    }

    #[test]
    fn raw_size() {
        assert_eq!(HEADER_SIZE, 128);
    }

    #[test]
    fn parse_and_validate() {
        let data = sample();
        let header = GbbHeader::parse(&data).unwrap();

        assert_eq!(header.minor_version, MINOR_VERSION);
        assert_eq!(header.flags, GbbFlags::FORCE_DEV_SWITCH_ON);
        assert_eq!(header.max_extent(), data.len() as u64);
        header.validate(&data).unwrap();

        assert_eq!(header.hwid(&data), Some(&b"TEST HWID 1234"[..]));
        assert_eq!(header.hwid_digest_status(&data), HwidDigestStatus::Valid);
        assert_eq!(
            header.region_data(&data, &header.rootkey).unwrap()[..8],
            [1u8; 8]
        );
    }

    #[test]
    fn truncated_gbb_reports_extent() {
        let data = sample();
        let truncated = &data[..data.len() - 1];
        let header = GbbHeader::parse(truncated).unwrap();

        assert_eq!(header.max_extent(), data.len() as u64);
        assert_matches!(
            header.validate(truncated),
            Err(Error::RegionOutOfBounds("recovery_key", _, _))
        );
    }

    #[test]
    fn hwid_digest_mismatch() {
        let mut data = sample();
        data[HEADER_SIZE] = b'X';
        let header = GbbHeader::parse(&data).unwrap();

        assert_eq!(header.hwid_digest_status(&data), HwidDigestStatus::Invalid);
    }

    #[test]
    fn hwid_not_terminated() {
        let mut data = sample();
        data[HEADER_SIZE..HEADER_SIZE + 0x40].fill(b'A');
        let header = GbbHeader::parse(&data).unwrap();

        assert_matches!(header.validate(&data), Err(Error::HwidNotTerminated));
    }

    #[test]
    fn bad_signature() {
        let mut data = sample();
        data[0] = b'#';

        assert_matches!(GbbHeader::parse(&data), Err(Error::InvalidSignature(_)));
        assert_matches!(GbbHeader::parse(&data[..10]), Err(Error::TooSmall(10)));
    }
}
