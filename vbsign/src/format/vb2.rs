// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Verified boot 2.x keys, keyblocks, and firmware preambles.
//!
//! All offsets stored inside these structures are relative to the start of
//! the structure that contains them (eg. the signature data offset is
//! relative to the signature descriptor itself). Every bounds check is done
//! with checked arithmetic and fails closed.

use std::{fmt, mem};

use bstr::ByteSlice;
use num_bigint_dig::{ModInverse, ToBigInt};
use num_traits::{Pow, ToPrimitive};
use ring::digest;
use rsa::{BigUint, RsaPublicKey, traits::PublicKeyParts};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::crypto::{self, RsaPublicKeyExt, RsaSigningKey, SignatureAlgorithm};

pub const KEYBLOCK_MAGIC: [u8; 8] = *b"CHROMEOS";
pub const KEYBLOCK_VERSION_MAJOR: u32 = 2;
pub const KEYBLOCK_VERSION_MINOR: u32 = 1;

pub const FW_PREAMBLE_VERSION_MAJOR: u32 = 2;
pub const FW_PREAMBLE_VERSION_MINOR: u32 = 1;

/// Largest key version that fits in the anti-rollback counters.
pub const MAX_KEY_VERSION: u32 = 0xffff;

pub const PACKED_KEY_HEADER_SIZE: usize = mem::size_of::<RawPackedKey>();
pub const SIGNATURE_HEADER_SIZE: usize = mem::size_of::<RawSignature>();
pub const KEYBLOCK_HEADER_SIZE: usize = mem::size_of::<RawKeyblock>();
pub const FW_PREAMBLE_HEADER_SIZE: usize = mem::size_of::<RawFwPreamble>();

const SHA512_DIGEST_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown key algorithm: {0}")]
    UnknownAlgorithm(u32),
    #[error("Unknown hash algorithm: {0}")]
    UnknownHashAlgorithm(u32),
    #[error("{0} is too small: {1} < {2}")]
    TooSmall(&'static str, usize, usize),
    #[error("{0} lies outside of its container")]
    MemberOutside(&'static str),
    #[error("{0} size overflows")]
    SizeOverflow(&'static str),
    #[error("Invalid keyblock magic: {:?}", .0.as_bstr())]
    InvalidMagic([u8; 8]),
    #[error("Unsupported {0} version: {1}.{2}")]
    UnsupportedVersion(&'static str, u32, u32),
    #[error("{0} declares size {1}, but only {2} bytes are available")]
    DeclaredSizeTooLarge(&'static str, u32, usize),
    #[error("{0} signs too much data: {1} > {2}")]
    SignedTooMuch(&'static str, u32, u32),
    #[error("{0} signs too little data: {1} < {2}")]
    SignedTooLittle(&'static str, u32, usize),
    #[error("Keyblock hash has invalid size: {0}")]
    InvalidHashSize(u32),
    #[error("Keyblock hash does not match")]
    HashMismatch,
    #[error("{0} has signature size {1}, but {2:?} requires {3}")]
    InvalidSignatureSize(&'static str, u32, Algorithm, usize),
    #[error("Key data size {0} does not match {1:?} ({2})")]
    InvalidKeySize(u32, Algorithm, usize),
    #[error("Key version too large: {0} > {MAX_KEY_VERSION}")]
    InvalidKeyVersion(u32),
    #[error("Key data is malformed: {0}")]
    InvalidKeyData(&'static str),
    #[error("No algorithm for {0}-bit RSA key with exponent {1}")]
    NoMatchingAlgorithm(usize, BigUint),
    #[error("Signature from a hash cannot be verified with a key")]
    HashOnlySignature,
    #[error("Failed to create {0} signature")]
    Sign(&'static str, #[source] crypto::Error),
    #[error("Failed to verify {0} signature")]
    Verify(&'static str, #[source] crypto::Error),
    #[error("Failed to construct RSA public key")]
    RsaPublicKey(#[source] rsa::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Check that a member of `member_size` bytes at `member_offset` and its
/// out-of-line data, located `data_offset` bytes after the start of the
/// member, both lie within a parent of `parent_size` bytes.
pub fn verify_member_inside(
    parent_size: usize,
    member_offset: usize,
    member_size: usize,
    data_offset: u32,
    data_size: u32,
    name: &'static str,
) -> Result<()> {
    let parent_size = parent_size as u64;
    let member_offset = member_offset as u64;

    let member_end = member_offset
        .checked_add(member_size as u64)
        .ok_or(Error::MemberOutside(name))?;
    if member_end > parent_size {
        return Err(Error::MemberOutside(name));
    }

    let data_end = member_offset
        .checked_add(data_offset.into())
        .and_then(|o| o.checked_add(data_size.into()))
        .ok_or(Error::MemberOutside(name))?;
    if data_end > parent_size {
        return Err(Error::MemberOutside(name));
    }

    Ok(())
}

fn to_u32(value: usize, name: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::SizeOverflow(name))
}

/// Hash algorithm identifiers used by content metadata hashes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
    Sha224,
    Sha384,
}

impl HashAlgorithm {
    pub fn from_raw(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Sha1),
            2 => Ok(Self::Sha256),
            3 => Ok(Self::Sha512),
            4 => Ok(Self::Sha224),
            5 => Ok(Self::Sha384),
            v => Err(Error::UnknownHashAlgorithm(v)),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::Sha1 => 1,
            Self::Sha256 => 2,
            Self::Sha512 => 3,
            Self::Sha224 => 4,
            Self::Sha384 => 5,
        }
    }

    /// Look up an algorithm by name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            Self::Sha1,
            Self::Sha256,
            Self::Sha512,
            Self::Sha224,
            Self::Sha384,
        ]
        .into_iter()
        .find(|a| a.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
            Self::Sha224 => "SHA224",
            Self::Sha384 => "SHA384",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
            Self::Sha224 => 28,
            Self::Sha384 => 48,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let algorithm = match self {
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &digest::SHA256,
            Self::Sha512 => &digest::SHA512,
            Self::Sha384 => &digest::SHA384,
            // ring does not implement SHA-224.
            Self::Sha224 => return Sha224::digest(data).to_vec(),
        };

        digest::digest(algorithm, data).as_ref().to_vec()
    }
}

/// A digest tagged with the algorithm that produced it.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    #[serde(with = "hex")]
    pub digest: Vec<u8>,
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hash")
            .field("algorithm", &self.algorithm)
            .field("digest", &hex::encode(&self.digest))
            .finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), hex::encode(&self.digest))
    }
}

/// Signing algorithms understood by verified boot. The discriminants are the
/// on-disk algorithm identifiers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum Algorithm {
    Rsa1024Sha1,
    Rsa1024Sha256,
    Rsa1024Sha512,
    Rsa2048Sha1,
    Rsa2048Sha256,
    Rsa2048Sha512,
    Rsa4096Sha1,
    Rsa4096Sha256,
    Rsa4096Sha512,
    Rsa8192Sha1,
    Rsa8192Sha256,
    Rsa8192Sha512,
    Rsa2048Exp3Sha1,
    Rsa2048Exp3Sha256,
    Rsa2048Exp3Sha512,
    Rsa3072Exp3Sha1,
    Rsa3072Exp3Sha256,
    Rsa3072Exp3Sha512,
}

impl Algorithm {
    pub const ALL: [Self; 18] = [
        Self::Rsa1024Sha1,
        Self::Rsa1024Sha256,
        Self::Rsa1024Sha512,
        Self::Rsa2048Sha1,
        Self::Rsa2048Sha256,
        Self::Rsa2048Sha512,
        Self::Rsa4096Sha1,
        Self::Rsa4096Sha256,
        Self::Rsa4096Sha512,
        Self::Rsa8192Sha1,
        Self::Rsa8192Sha256,
        Self::Rsa8192Sha512,
        Self::Rsa2048Exp3Sha1,
        Self::Rsa2048Exp3Sha256,
        Self::Rsa2048Exp3Sha512,
        Self::Rsa3072Exp3Sha1,
        Self::Rsa3072Exp3Sha256,
        Self::Rsa3072Exp3Sha512,
    ];

    pub fn from_raw(value: u32) -> Result<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(Error::UnknownAlgorithm(value))
    }

    pub fn to_raw(self) -> u32 {
        self as u32
    }

    /// Find the algorithm for an RSA key with the specified hash.
    pub fn for_key(key: &RsaPublicKey, hash: HashAlgorithm) -> Result<Self> {
        let bits = key.size() * 8;

        Self::ALL
            .into_iter()
            .find(|a| {
                a.key_bits() == bits
                    && a.hash_algorithm() == hash
                    && key.e() == &BigUint::from(a.exponent())
            })
            .ok_or_else(|| Error::NoMatchingAlgorithm(bits, key.e().clone()))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rsa1024Sha1 => "RSA1024 SHA1",
            Self::Rsa1024Sha256 => "RSA1024 SHA256",
            Self::Rsa1024Sha512 => "RSA1024 SHA512",
            Self::Rsa2048Sha1 => "RSA2048 SHA1",
            Self::Rsa2048Sha256 => "RSA2048 SHA256",
            Self::Rsa2048Sha512 => "RSA2048 SHA512",
            Self::Rsa4096Sha1 => "RSA4096 SHA1",
            Self::Rsa4096Sha256 => "RSA4096 SHA256",
            Self::Rsa4096Sha512 => "RSA4096 SHA512",
            Self::Rsa8192Sha1 => "RSA8192 SHA1",
            Self::Rsa8192Sha256 => "RSA8192 SHA256",
            Self::Rsa8192Sha512 => "RSA8192 SHA512",
            Self::Rsa2048Exp3Sha1 => "RSA2048 EXP3 SHA1",
            Self::Rsa2048Exp3Sha256 => "RSA2048 EXP3 SHA256",
            Self::Rsa2048Exp3Sha512 => "RSA2048 EXP3 SHA512",
            Self::Rsa3072Exp3Sha1 => "RSA3072 EXP3 SHA1",
            Self::Rsa3072Exp3Sha256 => "RSA3072 EXP3 SHA256",
            Self::Rsa3072Exp3Sha512 => "RSA3072 EXP3 SHA512",
        }
    }

    pub fn key_bits(self) -> usize {
        match self {
            Self::Rsa1024Sha1 | Self::Rsa1024Sha256 | Self::Rsa1024Sha512 => 1024,
            Self::Rsa2048Sha1
            | Self::Rsa2048Sha256
            | Self::Rsa2048Sha512
            | Self::Rsa2048Exp3Sha1
            | Self::Rsa2048Exp3Sha256
            | Self::Rsa2048Exp3Sha512 => 2048,
            Self::Rsa3072Exp3Sha1 | Self::Rsa3072Exp3Sha256 | Self::Rsa3072Exp3Sha512 => 3072,
            Self::Rsa4096Sha1 | Self::Rsa4096Sha256 | Self::Rsa4096Sha512 => 4096,
            Self::Rsa8192Sha1 | Self::Rsa8192Sha256 | Self::Rsa8192Sha512 => 8192,
        }
    }

    pub fn exponent(self) -> u32 {
        match self {
            Self::Rsa2048Exp3Sha1
            | Self::Rsa2048Exp3Sha256
            | Self::Rsa2048Exp3Sha512
            | Self::Rsa3072Exp3Sha1
            | Self::Rsa3072Exp3Sha256
            | Self::Rsa3072Exp3Sha512 => 3,
            _ => 65537,
        }
    }

    pub fn hash_algorithm(self) -> HashAlgorithm {
        match self.to_raw() % 3 {
            0 => HashAlgorithm::Sha1,
            1 => HashAlgorithm::Sha256,
            _ => HashAlgorithm::Sha512,
        }
    }

    pub fn signature_algorithm(self) -> SignatureAlgorithm {
        match self.hash_algorithm() {
            HashAlgorithm::Sha256 => SignatureAlgorithm::Sha256WithRsa,
            HashAlgorithm::Sha512 => SignatureAlgorithm::Sha512WithRsa,
            _ => SignatureAlgorithm::Sha1WithRsa,
        }
    }

    /// Size of an RSA signature in bytes.
    pub fn signature_len(self) -> usize {
        self.key_bits() / 8
    }

    /// Size of the packed key data: `arrsize`, `n0inv`, `n[]`, and `rr[]`.
    pub fn packed_key_len(self) -> usize {
        2 * mem::size_of::<u32>() + 2 * self.key_bits() / 8
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        self.hash_algorithm().digest(data)
    }
}

/// Raw on-disk layout for a packed key header.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPackedKey {
    /// Offset of the key data relative to the start of this header.
    key_offset: little_endian::U32,
    reserved0: little_endian::U32,
    key_size: little_endian::U32,
    reserved1: little_endian::U32,
    algorithm: little_endian::U32,
    reserved2: little_endian::U32,
    key_version: little_endian::U32,
    reserved3: little_endian::U32,
}

impl RawPackedKey {
    fn new(key_offset: u32, key_size: u32, algorithm: u32, key_version: u32) -> Self {
        Self {
            key_offset: key_offset.into(),
            reserved0: 0.into(),
            key_size: key_size.into(),
            reserved1: 0.into(),
            algorithm: algorithm.into(),
            reserved2: 0.into(),
            key_version: key_version.into(),
            reserved3: 0.into(),
        }
    }
}

/// Raw on-disk layout for a signature descriptor.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawSignature {
    /// Offset of the signature data relative to the start of this header.
    sig_offset: little_endian::U32,
    reserved0: little_endian::U32,
    sig_size: little_endian::U32,
    reserved1: little_endian::U32,
    /// Number of bytes of data covered by the signature.
    data_size: little_endian::U32,
    reserved2: little_endian::U32,
}

impl RawSignature {
    fn new(sig_offset: u32, sig_size: u32, data_size: u32) -> Self {
        Self {
            sig_offset: sig_offset.into(),
            reserved0: 0.into(),
            sig_size: sig_size.into(),
            reserved1: 0.into(),
            data_size: data_size.into(),
            reserved2: 0.into(),
        }
    }

    fn empty() -> Self {
        Self::new(0, 0, 0)
    }
}

/// Raw on-disk layout for the keyblock header.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawKeyblock {
    /// Magic value. This should be equal to [`KEYBLOCK_MAGIC`].
    magic: [u8; 8],
    header_version_major: little_endian::U32,
    header_version_minor: little_endian::U32,
    /// Size of the keyblock, including signatures and key data.
    keyblock_size: little_endian::U32,
    reserved0: little_endian::U32,
    /// RSA signature by the root key. May be empty for developer keyblocks.
    keyblock_signature: RawSignature,
    /// SHA-512 digest of the signed portion of the keyblock.
    keyblock_hash: RawSignature,
    keyblock_flags: little_endian::U32,
    reserved1: little_endian::U32,
    data_key: RawPackedKey,
}

/// Raw on-disk layout for the firmware preamble header.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawFwPreamble {
    /// Size of the preamble, including signatures and key data.
    preamble_size: little_endian::U32,
    reserved0: little_endian::U32,
    /// RSA signature by the keyblock's data key.
    preamble_signature: RawSignature,
    header_version_major: little_endian::U32,
    header_version_minor: little_endian::U32,
    firmware_version: little_endian::U32,
    reserved1: little_endian::U32,
    kernel_subkey: RawPackedKey,
    /// Signature of the firmware body.
    body_signature: RawSignature,
    /// Only present when the minor version is at least 1.
    flags: little_endian::U32,
}

const KEYBLOCK_SIGNATURE_OFFSET: usize = mem::offset_of!(RawKeyblock, keyblock_signature);
const KEYBLOCK_HASH_OFFSET: usize = mem::offset_of!(RawKeyblock, keyblock_hash);
const KEYBLOCK_DATA_KEY_OFFSET: usize = mem::offset_of!(RawKeyblock, data_key);
const PREAMBLE_SIGNATURE_OFFSET: usize = mem::offset_of!(RawFwPreamble, preamble_signature);
const PREAMBLE_SUBKEY_OFFSET: usize = mem::offset_of!(RawFwPreamble, kernel_subkey);
const PREAMBLE_BODY_SIGNATURE_OFFSET: usize = mem::offset_of!(RawFwPreamble, body_signature);

/// A public key in the verified boot packed format.
#[derive(Clone, PartialEq, Eq)]
pub struct PackedKey {
    /// Raw algorithm identifier. This is not necessarily a valid
    /// [`Algorithm`] for keys read from untrusted data.
    pub algorithm: u32,
    pub key_version: u32,
    pub key_data: Vec<u8>,
}

impl fmt::Debug for PackedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedKey")
            .field("algorithm", &self.algorithm)
            .field("key_version", &self.key_version)
            .field("key_data", &crate::util::NumBytes(self.key_data.len() as u64))
            .finish()
    }
}

impl PackedKey {
    /// Pack an RSA public key. The key size and exponent must match the
    /// algorithm.
    pub fn from_public_key(
        key: &RsaPublicKey,
        algorithm: Algorithm,
        key_version: u32,
    ) -> Result<Self> {
        let bits = algorithm.key_bits();
        if key.size() * 8 != bits || key.e() != &BigUint::from(algorithm.exponent()) {
            return Err(Error::NoMatchingAlgorithm(key.size() * 8, key.e().clone()));
        } else if key_version > MAX_KEY_VERSION {
            return Err(Error::InvalidKeyVersion(key_version));
        }

        // The firmware's Montgomery multiplication needs:
        //   n0inv = -1 / n[0] (mod 2 ^ 32)
        //   rr = (2 ^ bits) ^ 2 (mod n)
        let b = BigUint::from(2u64.pow(32));
        let inverse = key
            .n()
            .mod_inverse(&b)
            .ok_or(Error::InvalidKeyData("modulus is not odd"))?;
        let n0inv = b
            .to_bigint()
            .map(|b| b - inverse)
            .and_then(|v| v.to_u32())
            .ok_or(Error::InvalidKeyData("n0inv out of range"))?;
        let r = BigUint::from(2u32).pow(bits);
        let rr = r.modpow(&BigUint::from(2u32), key.n());

        let mut data = Vec::with_capacity(algorithm.packed_key_len());
        data.extend_from_slice(&to_u32(bits / 32, "key array")?.to_le_bytes());
        data.extend_from_slice(&n0inv.to_le_bytes());

        for value in [key.n(), &rr] {
            let raw = value.to_bytes_le();
            data.extend_from_slice(&raw);
            data.resize(data.len() + bits / 8 - raw.len(), 0);
        }

        Ok(Self {
            algorithm: algorithm.to_raw(),
            key_version,
            key_data: data,
        })
    }

    /// Get the algorithm, checking that it is known.
    pub fn algorithm(&self) -> Result<Algorithm> {
        Algorithm::from_raw(self.algorithm)
    }

    /// Check that the key is self-consistent: known algorithm, key data sized
    /// for the algorithm, and a key version within range.
    pub fn validate(&self) -> Result<Algorithm> {
        let algorithm = self.algorithm()?;

        if self.key_data.len() != algorithm.packed_key_len() {
            return Err(Error::InvalidKeySize(
                to_u32(self.key_data.len(), "key data")?,
                algorithm,
                algorithm.packed_key_len(),
            ));
        } else if self.key_version > MAX_KEY_VERSION {
            return Err(Error::InvalidKeyVersion(self.key_version));
        }

        Ok(algorithm)
    }

    /// Unpack the RSA public key.
    pub fn to_public_key(&self) -> Result<RsaPublicKey> {
        let algorithm = self.validate()?;
        let bits = algorithm.key_bits();

        let (arrsize, rest) = self
            .key_data
            .split_first_chunk::<4>()
            .ok_or(Error::InvalidKeyData("missing array size"))?;
        if u32::from_le_bytes(*arrsize) as usize != bits / 32 {
            return Err(Error::InvalidKeyData("array size does not match algorithm"));
        }

        // Skip n0inv.
        let modulus = rest
            .get(4..4 + bits / 8)
            .ok_or(Error::InvalidKeyData("missing modulus"))?;

        RsaPublicKey::new_with_max_size(
            BigUint::from_bytes_le(modulus),
            BigUint::from(algorithm.exponent()),
            8192,
        )
        .map_err(Error::RsaPublicKey)
    }

    /// SHA-1 digest of the key data. This is what `futility show` prints to
    /// identify a key.
    pub fn sha1sum(&self) -> String {
        hex::encode(HashAlgorithm::Sha1.digest(&self.key_data))
    }

    /// Read a packed key whose header is at `offset` in `parent`. Both the
    /// header and the key data must lie within `parent`.
    pub fn read_member(parent: &[u8], offset: usize, name: &'static str) -> Result<Self> {
        let raw = parent
            .get(offset..)
            .and_then(|d| RawPackedKey::read_from_prefix(d).ok())
            .map(|(r, _)| r)
            .ok_or(Error::MemberOutside(name))?;
        Self::from_raw(parent, offset, &raw, name)
    }

    fn from_raw(
        parent: &[u8],
        offset: usize,
        raw: &RawPackedKey,
        name: &'static str,
    ) -> Result<Self> {
        let key_offset = raw.key_offset.get();
        let key_size = raw.key_size.get();

        verify_member_inside(
            parent.len(),
            offset,
            PACKED_KEY_HEADER_SIZE,
            key_offset,
            key_size,
            name,
        )?;

        let start = offset + key_offset as usize;
        let key_data = parent[start..start + key_size as usize].to_vec();

        Ok(Self {
            algorithm: raw.algorithm.get(),
            key_version: raw.key_version.get(),
            key_data,
        })
    }

    /// Parse a standalone packed key (eg. a `.vbpubk` file or a GBB key
    /// region) and check that it looks like a well-formed key.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let key = Self::read_member(data, 0, "packed key")?;
        key.validate()?;
        Ok(key)
    }

    fn raw_header(&self, key_offset: usize) -> Result<RawPackedKey> {
        Ok(RawPackedKey::new(
            to_u32(key_offset, "packed key offset")?,
            to_u32(self.key_data.len(), "packed key data")?,
            self.algorithm,
            self.key_version,
        ))
    }

    /// Serialize as a standalone packed key with the data immediately after
    /// the header.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = self.raw_header(PACKED_KEY_HEADER_SIZE)?;

        let mut data = Vec::with_capacity(PACKED_KEY_HEADER_SIZE + self.key_data.len());
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(&self.key_data);

        Ok(data)
    }
}

/// A signature and the amount of data it covers.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    #[serde(with = "hex")]
    pub sig: Vec<u8>,
    pub data_size: u32,
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature")
            .field("sig", &hex::encode(&self.sig))
            .field("data_size", &self.data_size)
            .finish()
    }
}

impl Signature {
    /// Sign the first `data.len()` bytes of `data`.
    pub fn create(
        data: &[u8],
        key: &RsaSigningKey,
        algorithm: Algorithm,
        name: &'static str,
    ) -> Result<Self> {
        let digest = algorithm.digest(data);
        let sig = key
            .sign(algorithm.signature_algorithm(), &digest)
            .map_err(|e| Error::Sign(name, e))?;

        if sig.len() != algorithm.signature_len() {
            return Err(Error::InvalidSignatureSize(
                name,
                to_u32(sig.len(), name)?,
                algorithm,
                algorithm.signature_len(),
            ));
        }

        Ok(Self {
            sig,
            data_size: to_u32(data.len(), name)?,
        })
    }

    /// Wrap a precomputed digest. The data size is zero because the digest
    /// was not computed over any contiguous region.
    pub fn from_hash(hash: &Hash) -> Self {
        Self {
            sig: hash.digest.clone(),
            data_size: 0,
        }
    }

    /// Read the signature whose descriptor is at `offset` in `parent`. The
    /// descriptor and the signature data must lie within `parent`.
    fn read_member(parent: &[u8], offset: usize, name: &'static str) -> Result<Self> {
        let raw = parent
            .get(offset..)
            .and_then(|d| RawSignature::read_from_prefix(d).ok())
            .map(|(r, _)| r)
            .ok_or(Error::MemberOutside(name))?;
        let sig_offset = raw.sig_offset.get();
        let sig_size = raw.sig_size.get();

        verify_member_inside(
            parent.len(),
            offset,
            SIGNATURE_HEADER_SIZE,
            sig_offset,
            sig_size,
            name,
        )?;

        let start = offset + sig_offset as usize;

        Ok(Self {
            sig: parent[start..start + sig_size as usize].to_vec(),
            data_size: raw.data_size.get(),
        })
    }

    /// Verify the signature over the first [`Self::data_size`] bytes of
    /// `data` with `key`.
    pub fn verify(&self, data: &[u8], key: &PackedKey, name: &'static str) -> Result<()> {
        if self.data_size == 0 {
            return Err(Error::HashOnlySignature);
        }

        let algorithm = key.validate()?;

        if self.sig.len() != algorithm.signature_len() {
            return Err(Error::InvalidSignatureSize(
                name,
                to_u32(self.sig.len(), name)?,
                algorithm,
                algorithm.signature_len(),
            ));
        }

        let signed = data.get(..self.data_size as usize).ok_or(Error::DeclaredSizeTooLarge(
            name,
            self.data_size,
            data.len(),
        ))?;
        let digest = algorithm.digest(signed);

        key.to_public_key()?
            .verify_sig(algorithm.signature_algorithm(), &digest, &self.sig)
            .map_err(|e| Error::Verify(name, e))
    }
}

/// A keyblock whose structure and integrity hash have been checked.
#[derive(Clone, PartialEq, Eq)]
pub struct Keyblock {
    pub flags: u32,
    pub data_key: PackedKey,
    /// The complete keyblock, including signatures.
    data: Vec<u8>,
}

impl fmt::Debug for Keyblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyblock")
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("data_key", &self.data_key)
            .field("size", &self.data.len())
            .finish()
    }
}

impl Keyblock {
    /// Build a keyblock for `data_key`. If `signer` is specified, the keyblock
    /// is also signed with that key. Otherwise, only the integrity hash is
    /// present.
    pub fn create(
        data_key: &PackedKey,
        signer: Option<(&RsaSigningKey, Algorithm)>,
        flags: u32,
    ) -> Result<Self> {
        let signed_size = KEYBLOCK_HEADER_SIZE + data_key.key_data.len();
        let sig_len = signer.map_or(0, |(_, a)| a.signature_len());
        let block_size = signed_size + SHA512_DIGEST_LEN + sig_len;
        let signed_size_u32 = to_u32(signed_size, "keyblock")?;

        let keyblock_signature = match signer {
            Some(_) => RawSignature::new(
                to_u32(
                    signed_size + SHA512_DIGEST_LEN - KEYBLOCK_SIGNATURE_OFFSET,
                    "keyblock",
                )?,
                to_u32(sig_len, "keyblock")?,
                signed_size_u32,
            ),
            None => RawSignature::empty(),
        };

        let header = RawKeyblock {
            magic: KEYBLOCK_MAGIC,
            header_version_major: KEYBLOCK_VERSION_MAJOR.into(),
            header_version_minor: KEYBLOCK_VERSION_MINOR.into(),
            keyblock_size: to_u32(block_size, "keyblock")?.into(),
            reserved0: 0.into(),
            keyblock_signature,
            keyblock_hash: RawSignature::new(
                to_u32(signed_size - KEYBLOCK_HASH_OFFSET, "keyblock")?,
                SHA512_DIGEST_LEN as u32,
                signed_size_u32,
            ),
            keyblock_flags: flags.into(),
            reserved1: 0.into(),
            data_key: data_key.raw_header(KEYBLOCK_HEADER_SIZE - KEYBLOCK_DATA_KEY_OFFSET)?,
        };

        let mut data = Vec::with_capacity(block_size);
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(&data_key.key_data);

        let hash = HashAlgorithm::Sha512.digest(&data);
        data.extend_from_slice(&hash);

        if let Some((key, algorithm)) = signer {
            let signature = Signature::create(&data[..signed_size], key, algorithm, "keyblock")?;
            data.extend_from_slice(&signature.sig);
        }

        Ok(Self {
            flags,
            data_key: data_key.clone(),
            data,
        })
    }

    /// Parse a keyblock at the start of `data` and verify its integrity hash.
    /// `data` may extend past the end of the keyblock.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header, _) = RawKeyblock::ref_from_prefix(data)
            .map_err(|_| Error::TooSmall("keyblock", data.len(), KEYBLOCK_HEADER_SIZE))?;

        if header.magic != KEYBLOCK_MAGIC {
            return Err(Error::InvalidMagic(header.magic));
        }

        let major = header.header_version_major.get();
        if major != KEYBLOCK_VERSION_MAJOR {
            return Err(Error::UnsupportedVersion(
                "keyblock",
                major,
                header.header_version_minor.get(),
            ));
        }

        let keyblock_size = header.keyblock_size.get();
        if keyblock_size as usize > data.len() {
            return Err(Error::DeclaredSizeTooLarge("keyblock", keyblock_size, data.len()));
        } else if (keyblock_size as usize) < KEYBLOCK_HEADER_SIZE {
            return Err(Error::TooSmall(
                "keyblock",
                keyblock_size as usize,
                KEYBLOCK_HEADER_SIZE,
            ));
        }
        let block = &data[..keyblock_size as usize];

        let hash = Signature::read_member(block, KEYBLOCK_HASH_OFFSET, "keyblock hash")?;
        if hash.data_size > keyblock_size {
            return Err(Error::SignedTooMuch("keyblock", hash.data_size, keyblock_size));
        } else if (hash.data_size as usize) < KEYBLOCK_HEADER_SIZE {
            return Err(Error::SignedTooLittle(
                "keyblock",
                hash.data_size,
                KEYBLOCK_HEADER_SIZE,
            ));
        }
        let signed = &block[..hash.data_size as usize];

        let data_key = PackedKey::from_raw(
            signed,
            KEYBLOCK_DATA_KEY_OFFSET,
            &header.data_key,
            "keyblock data key",
        )?;

        if hash.sig.len() != SHA512_DIGEST_LEN {
            return Err(Error::InvalidHashSize(to_u32(hash.sig.len(), "keyblock hash")?));
        } else if HashAlgorithm::Sha512.digest(signed) != hash.sig {
            return Err(Error::HashMismatch);
        }

        Ok(Self {
            flags: header.keyblock_flags.get(),
            data_key,
            data: block.to_vec(),
        })
    }

    /// Verify the keyblock signature with the root key.
    pub fn verify_signature(&self, key: &PackedKey) -> Result<()> {
        let signature =
            Signature::read_member(&self.data, KEYBLOCK_SIGNATURE_OFFSET, "keyblock signature")?;
        let keyblock_size = self.data.len() as u32;

        if signature.data_size > keyblock_size {
            return Err(Error::SignedTooMuch(
                "keyblock signature",
                signature.data_size,
                keyblock_size,
            ));
        } else if (signature.data_size as usize) < KEYBLOCK_HEADER_SIZE {
            return Err(Error::SignedTooLittle(
                "keyblock signature",
                signature.data_size,
                KEYBLOCK_HEADER_SIZE,
            ));
        }

        let signed = &self.data[..signature.data_size as usize];
        verify_member_inside(
            signed.len(),
            KEYBLOCK_DATA_KEY_OFFSET,
            PACKED_KEY_HEADER_SIZE,
            KEYBLOCK_HEADER_SIZE as u32 - KEYBLOCK_DATA_KEY_OFFSET as u32,
            self.data_key.key_data.len() as u32,
            "keyblock data key",
        )?;

        signature.verify(&self.data, key, "keyblock")
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A firmware preamble whose signature has been verified with the keyblock's
/// data key.
#[derive(Clone, PartialEq, Eq)]
pub struct FwPreamble {
    pub header_version_minor: u32,
    pub firmware_version: u32,
    pub flags: u32,
    pub kernel_subkey: PackedKey,
    pub body_signature: Signature,
    /// The complete preamble, including signatures.
    data: Vec<u8>,
}

impl fmt::Debug for FwPreamble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FwPreamble")
            .field("header_version_minor", &self.header_version_minor)
            .field("firmware_version", &self.firmware_version)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("kernel_subkey", &self.kernel_subkey)
            .field("body_signature", &self.body_signature)
            .field("size", &self.data.len())
            .finish()
    }
}

impl FwPreamble {
    /// Build a preamble signed by `key`.
    pub fn create(
        firmware_version: u32,
        kernel_subkey: &PackedKey,
        body_signature: &Signature,
        key: &RsaSigningKey,
        algorithm: Algorithm,
        flags: u32,
    ) -> Result<Self> {
        let subkey_data_offset = FW_PREAMBLE_HEADER_SIZE;
        let body_sig_offset = subkey_data_offset + kernel_subkey.key_data.len();
        let signed_size = body_sig_offset + body_signature.sig.len();
        let block_size = signed_size + algorithm.signature_len();

        let header = RawFwPreamble {
            preamble_size: to_u32(block_size, "preamble")?.into(),
            reserved0: 0.into(),
            preamble_signature: RawSignature::new(
                to_u32(signed_size - PREAMBLE_SIGNATURE_OFFSET, "preamble")?,
                to_u32(algorithm.signature_len(), "preamble")?,
                to_u32(signed_size, "preamble")?,
            ),
            header_version_major: FW_PREAMBLE_VERSION_MAJOR.into(),
            header_version_minor: FW_PREAMBLE_VERSION_MINOR.into(),
            firmware_version: firmware_version.into(),
            reserved1: 0.into(),
            kernel_subkey: kernel_subkey
                .raw_header(subkey_data_offset - PREAMBLE_SUBKEY_OFFSET)?,
            body_signature: RawSignature::new(
                to_u32(body_sig_offset - PREAMBLE_BODY_SIGNATURE_OFFSET, "preamble")?,
                to_u32(body_signature.sig.len(), "body signature")?,
                body_signature.data_size,
            ),
            flags: flags.into(),
        };

        let mut data = Vec::with_capacity(block_size);
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(&kernel_subkey.key_data);
        data.extend_from_slice(&body_signature.sig);

        let signature = Signature::create(&data, key, algorithm, "preamble")?;
        data.extend_from_slice(&signature.sig);

        Ok(Self {
            header_version_minor: FW_PREAMBLE_VERSION_MINOR,
            firmware_version,
            flags,
            kernel_subkey: kernel_subkey.clone(),
            body_signature: body_signature.clone(),
            data,
        })
    }

    /// Parse a preamble at the start of `data` and verify its signature with
    /// `key`. `data` may extend past the end of the preamble.
    pub fn parse(data: &[u8], key: &PackedKey) -> Result<Self> {
        let (header, _) = RawFwPreamble::ref_from_prefix(data)
            .map_err(|_| Error::TooSmall("preamble", data.len(), FW_PREAMBLE_HEADER_SIZE))?;

        let major = header.header_version_major.get();
        let minor = header.header_version_minor.get();
        if major != FW_PREAMBLE_VERSION_MAJOR {
            return Err(Error::UnsupportedVersion("preamble", major, minor));
        }

        let preamble_size = header.preamble_size.get();
        if preamble_size as usize > data.len() {
            return Err(Error::DeclaredSizeTooLarge("preamble", preamble_size, data.len()));
        }
        let block = &data[..preamble_size as usize];

        let signature =
            Signature::read_member(block, PREAMBLE_SIGNATURE_OFFSET, "preamble signature")?;
        signature.verify(block, key, "preamble")?;

        if (signature.data_size as usize) < FW_PREAMBLE_HEADER_SIZE {
            return Err(Error::SignedTooLittle(
                "preamble",
                signature.data_size,
                FW_PREAMBLE_HEADER_SIZE,
            ));
        }
        let signed = &block[..signature.data_size as usize];

        let body_signature =
            Signature::read_member(signed, PREAMBLE_BODY_SIGNATURE_OFFSET, "body signature")?;
        let kernel_subkey = PackedKey::from_raw(
            signed,
            PREAMBLE_SUBKEY_OFFSET,
            &header.kernel_subkey,
            "kernel subkey",
        )?;

        Ok(Self {
            header_version_minor: minor,
            firmware_version: header.firmware_version.get(),
            flags: if minor >= 1 { header.flags.get() } else { 0 },
            kernel_subkey,
            body_signature,
            data: block.to_vec(),
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use assert_matches::assert_matches;
    use rsa::RsaPrivateKey;

    use super::*;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

        KEY.get_or_init(|| crypto::generate_rsa_key_pair(1024, 65537).unwrap())
    }

    fn packed_test_key() -> PackedKey {
        PackedKey::from_public_key(&test_key().to_public_key(), Algorithm::Rsa1024Sha256, 1)
            .unwrap()
    }

    #[test]
    fn raw_sizes() {
        assert_eq!(PACKED_KEY_HEADER_SIZE, 32);
        assert_eq!(SIGNATURE_HEADER_SIZE, 24);
        assert_eq!(KEYBLOCK_HEADER_SIZE, 112);
        assert_eq!(FW_PREAMBLE_HEADER_SIZE, 108);
        assert_eq!(KEYBLOCK_DATA_KEY_OFFSET, 80);
        assert_eq!(PREAMBLE_BODY_SIGNATURE_OFFSET, 80);
    }

    #[test]
    fn algorithm_properties() {
        assert_eq!(Algorithm::from_raw(4).unwrap(), Algorithm::Rsa2048Sha256);
        assert_eq!(Algorithm::Rsa2048Sha256.packed_key_len(), 520);
        assert_eq!(Algorithm::Rsa3072Exp3Sha512.key_bits(), 3072);
        assert_eq!(Algorithm::Rsa3072Exp3Sha512.exponent(), 3);
        assert_eq!(
            Algorithm::Rsa3072Exp3Sha512.hash_algorithm(),
            HashAlgorithm::Sha512
        );
        assert_eq!(
            Algorithm::Rsa2048Exp3Sha1.hash_algorithm(),
            HashAlgorithm::Sha1
        );
        assert_matches!(Algorithm::from_raw(18), Err(Error::UnknownAlgorithm(18)));
    }

    #[test]
    fn member_bounds_fail_closed() {
        verify_member_inside(100, 10, 24, 24, 66, "m").unwrap();
        assert_matches!(
            verify_member_inside(100, 10, 24, 24, 67, "m"),
            Err(Error::MemberOutside("m"))
        );
        assert_matches!(
            verify_member_inside(100, 90, 24, 0, 0, "m"),
            Err(Error::MemberOutside("m"))
        );
        assert_matches!(
            verify_member_inside(100, 0, 24, u32::MAX, u32::MAX, "m"),
            Err(Error::MemberOutside("m"))
        );
    }

    #[test]
    fn packed_key_round_trip() {
        let packed = packed_test_key();
        assert_eq!(packed.key_data.len(), 264);
        assert_eq!(packed.validate().unwrap(), Algorithm::Rsa1024Sha256);
        assert_eq!(packed.to_public_key().unwrap(), test_key().to_public_key());

        let encoded = packed.to_bytes().unwrap();
        assert_eq!(PackedKey::parse(&encoded).unwrap(), packed);

        // Montgomery parameter: n[0] * n0inv == -1 (mod 2^32)
        let n0 = u32::from_le_bytes(packed.key_data[8..12].try_into().unwrap());
        let n0inv = u32::from_le_bytes(packed.key_data[4..8].try_into().unwrap());
        assert_eq!(n0.wrapping_mul(n0inv), u32::MAX);
    }

    #[test]
    fn packed_key_rejects_inconsistent_size() {
        let mut packed = packed_test_key();
        packed.key_data.pop();
        let encoded = packed.to_bytes().unwrap();

        assert_matches!(
            PackedKey::parse(&encoded),
            Err(Error::InvalidKeySize(263, Algorithm::Rsa1024Sha256, 264))
        );
        assert_matches!(
            PackedKey::parse(&encoded[..encoded.len() - 1]),
            Err(Error::MemberOutside(_))
        );
    }

    #[test]
    fn keyblock_hash_and_signature() {
        let root = packed_test_key();
        let signer = RsaSigningKey::Internal(test_key().clone());
        let keyblock =
            Keyblock::create(&root, Some((&signer, Algorithm::Rsa1024Sha256)), 0x7).unwrap();
        assert_eq!(keyblock.size(), 112 + 264 + 64 + 128);

        let mut data = keyblock.as_bytes().to_vec();
        data.extend_from_slice(&[0xaa; 16]);

        let parsed = Keyblock::parse(&data).unwrap();
        assert_eq!(parsed, keyblock);
        assert_eq!(parsed.flags, 0x7);
        parsed.verify_signature(&root).unwrap();

        // Corrupt a byte in the signed region.
        data[KEYBLOCK_HEADER_SIZE + 20] ^= 1;
        assert_matches!(Keyblock::parse(&data), Err(Error::HashMismatch));

        // Unsigned keyblocks only carry the hash.
        let unsigned = Keyblock::create(&root, None, 0).unwrap();
        let parsed = Keyblock::parse(unsigned.as_bytes()).unwrap();
        assert!(parsed.verify_signature(&root).is_err());
    }

    #[test]
    fn keyblock_truncated() {
        let keyblock = Keyblock::create(&packed_test_key(), None, 0).unwrap();
        let data = keyblock.as_bytes();

        assert_matches!(
            Keyblock::parse(&data[..data.len() - 1]),
            Err(Error::DeclaredSizeTooLarge("keyblock", _, _))
        );
        assert_matches!(
            Keyblock::parse(&data[..50]),
            Err(Error::TooSmall("keyblock", 50, 112))
        );
    }

    #[test]
    fn preamble_round_trip() {
        let data_key = packed_test_key();
        let signer = RsaSigningKey::Internal(test_key().clone());
        let body = vec![0x5a; 1000];
        let body_signature =
            Signature::create(&body, &signer, Algorithm::Rsa1024Sha256, "body").unwrap();

        let preamble = FwPreamble::create(
            3,
            &data_key,
            &body_signature,
            &signer,
            Algorithm::Rsa1024Sha256,
            0x2,
        )
        .unwrap();
        assert_eq!(preamble.size(), 108 + 264 + 128 + 128);

        let parsed = FwPreamble::parse(preamble.as_bytes(), &data_key).unwrap();
        assert_eq!(parsed, preamble);
        assert_eq!(parsed.firmware_version, 3);
        assert_eq!(parsed.flags, 0x2);
        assert_eq!(parsed.body_signature.data_size, 1000);

        parsed.body_signature.verify(&body, &data_key, "body").unwrap();

        let mut modified = body.clone();
        modified[0] = 0;
        assert_matches!(
            parsed.body_signature.verify(&modified, &data_key, "body"),
            Err(Error::Verify("body", _))
        );

        let mut corrupt = preamble.as_bytes().to_vec();
        corrupt[40] ^= 1;
        assert_matches!(
            FwPreamble::parse(&corrupt, &data_key),
            Err(Error::Verify("preamble", _))
        );
    }

    #[test]
    fn hash_signature() {
        let hash = Hash {
            algorithm: HashAlgorithm::Sha256,
            digest: HashAlgorithm::Sha256.digest(b"metadata"),
        };
        let signature = Signature::from_hash(&hash);
        assert_eq!(signature.data_size, 0);
        assert_eq!(signature.sig.len(), 32);
        assert_matches!(
            signature.verify(b"", &packed_test_key(), "body"),
            Err(Error::HashOnlySignature)
        );
    }

    #[test]
    fn sha224_digest() {
        assert_eq!(
            hex::encode(HashAlgorithm::Sha224.digest(b"")),
            "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f",
        );
        assert_eq!(HashAlgorithm::from_name("sha256"), Some(HashAlgorithm::Sha256));
    }
}
