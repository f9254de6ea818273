// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use tracing::{debug, warn};

use crate::{
    bios::{AreaRecord, AreaTable, Error, Result, Slot},
    format::vb2::{self, FwPreamble, Hash, Keyblock},
};

/// Default firmware version when neither the caller nor a verified preamble
/// provides one.
pub const DEFAULT_VERSION: u32 = 1;
/// Default preamble flags when neither the caller nor a verified preamble
/// provides them.
pub const DEFAULT_FLAGS: u32 = 0;

/// Information about a firmware body that was obtained from its contents
/// rather than from the signature block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BodyHint {
    /// Number of bytes of actual content at the start of the region.
    pub signed_size: Option<u32>,
    /// Hash covering the body's content metadata.
    pub metadata_hash: Option<Hash>,
}

/// Values that always take precedence over what the existing preamble says.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Overrides {
    pub version: Option<u32>,
    pub flags: Option<u32>,
}

/// A slot that is ready to be re-signed.
#[derive(Debug)]
pub struct PreparedSlot {
    pub slot: Slot,
    pub body: AreaRecord,
    pub vblock: AreaRecord,
    /// Number of bytes at the start of the body to sign.
    pub signed_size: usize,
    pub metadata_hash: Option<Hash>,
    pub version: u32,
    pub flags: u32,
    /// Why the existing keyblock and preamble could not be verified. A slot
    /// with an unverifiable chain can still be re-signed.
    pub chain_error: Option<Error>,
}

impl PreparedSlot {
    pub fn chain_verified(&self) -> bool {
        self.chain_error.is_none()
    }

    /// The portion of the body covered by the new signature.
    pub fn signed_body<'a>(&self, image: &'a [u8]) -> Option<&'a [u8]> {
        self.body.data(image).and_then(|d| d.get(..self.signed_size))
    }
}

/// Parse the keyblock and the preamble that immediately follows it, checking
/// the keyblock hash, the data key, and the preamble signature.
pub fn verify_chain(vblock: &[u8]) -> std::result::Result<(Keyblock, FwPreamble), vb2::Error> {
    let keyblock = Keyblock::parse(vblock).inspect_err(|e| debug!("Invalid keyblock: {e}"))?;
    keyblock
        .data_key
        .validate()
        .inspect_err(|e| debug!("Invalid data key: {e}"))?;

    let preamble = FwPreamble::parse(&vblock[keyblock.size()..], &keyblock.data_key)
        .inspect_err(|e| debug!("Invalid preamble: {e}"))?;

    Ok((keyblock, preamble))
}

/// Resolve a slot's body and signature block and work out what to sign.
///
/// The signed size comes from the hint if one exists. Otherwise, it comes
/// from the existing preamble if it verifies, falling back to the whole body
/// region. A broken keyblock or preamble is recorded in the result instead of
/// failing because the point of re-signing may be to replace it.
pub fn prepare(
    table: &AreaTable,
    image: &[u8],
    slot: Slot,
    hint: &BodyHint,
    overrides: &Overrides,
) -> Result<PreparedSlot> {
    debug!("Preparing areas: {} and {}", slot.body(), slot.vblock());

    let body = table.resolve(slot.body())?;
    body.require_valid(image.len())?;

    let hint_size = hint.signed_size.filter(|s| *s != 0);
    let mut signed_size = match hint_size {
        Some(s) if s as usize > body.size => {
            return Err(Error::RegionTooSmall {
                component: body.component,
                needed: s.into(),
                available: body.size as u64,
            });
        }
        Some(s) => s as usize,
        None => {
            if hint.metadata_hash.is_none() {
                warn!(
                    "{} does not contain CBFS. Trying to sign entire area",
                    body.component,
                );
            }
            body.size
        }
    };

    let vblock = table.resolve(slot.vblock())?;
    vblock.require_valid(image.len())?;

    let vblock_data = vblock.data(image).ok_or(Error::RegionTooSmall {
        component: vblock.component,
        needed: vblock.declared_end,
        available: image.len() as u64,
    })?;

    let mut chain_error = None;
    let mut preamble = None;

    match verify_chain(vblock_data) {
        Ok((_, p)) => {
            let data_size = p.body_signature.data_size;

            if hint_size.is_some() {
                preamble = Some(p);
            } else if data_size as usize > signed_size {
                warn!(
                    "{} says the firmware is larger than we have: {data_size:#x} > {signed_size:#x}",
                    vblock.component,
                );
                chain_error = Some(Error::ChainNotVerifiable(
                    vblock.component,
                    vb2::Error::DeclaredSizeTooLarge("body signature", data_size, signed_size),
                ));
            } else {
                signed_size = data_size as usize;
                preamble = Some(p);
            }
        }
        Err(e) => {
            warn!("{} keyblock or preamble is invalid: {e}", vblock.component);
            chain_error = Some(Error::ChainNotVerifiable(vblock.component, e));
        }
    }

    let version = overrides
        .version
        .or(preamble.as_ref().map(|p| p.firmware_version))
        .unwrap_or(DEFAULT_VERSION);
    let flags = overrides
        .flags
        .or(preamble.as_ref().map(|p| p.flags))
        .unwrap_or(DEFAULT_FLAGS);

    Ok(PreparedSlot {
        slot,
        body,
        vblock,
        signed_size,
        metadata_hash: hint.metadata_hash.clone(),
        version,
        flags,
        chain_error,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        bios::BiosComponent,
        crypto::{self, RsaSigningKey},
        format::{
            fmap::{Fmap, FmapArea},
            vb2::{Algorithm, PackedKey, Signature},
        },
    };

    const IMAGE_SIZE: usize = 0x3000;
    const BODY_FILL: u8 = 0xa5;

    fn image() -> Vec<u8> {
        let mut fmap = Fmap::new("FMAP", IMAGE_SIZE as u32).unwrap();
        fmap.areas
            .push(FmapArea::new("VBLOCK_A", 0x1000, 0x1000).unwrap());
        fmap.areas
            .push(FmapArea::new("FW_MAIN_A", 0x2000, 0x1000).unwrap());
        let data = fmap.to_bytes().unwrap();

        let mut image = vec![0u8; IMAGE_SIZE];
        image[..data.len()].copy_from_slice(&data);
        image[0x2000..].fill(BODY_FILL);
        image
    }

    /// Write a keyblock and preamble whose body signature covers `data_size`
    /// bytes of filler.
    fn write_chain(image: &mut [u8], version: u32, flags: u32, data_size: usize) {
        let key = crypto::generate_rsa_key_pair(1024, 65537).unwrap();
        let algorithm = Algorithm::Rsa1024Sha256;
        let data_key = PackedKey::from_public_key(&key.to_public_key(), algorithm, 1).unwrap();
        let signing_key = RsaSigningKey::Internal(key);

        let keyblock = Keyblock::create(&data_key, None, 0).unwrap();
        let body = vec![BODY_FILL; data_size];
        let body_signature = Signature::create(&body, &signing_key, algorithm, "body").unwrap();
        let preamble = FwPreamble::create(
            version,
            &data_key,
            &body_signature,
            &signing_key,
            algorithm,
            flags,
        )
        .unwrap();

        let keyblock = keyblock.as_bytes();
        let preamble_start = 0x1000 + keyblock.len();
        image[0x1000..preamble_start].copy_from_slice(keyblock);
        image[preamble_start..preamble_start + preamble.size()]
            .copy_from_slice(preamble.as_bytes());
    }

    fn prepare_a(image: &[u8], hint: &BodyHint, overrides: &Overrides) -> Result<PreparedSlot> {
        let table = AreaTable::find(image).unwrap();

        prepare(&table, image, Slot::A, hint, overrides)
    }

    #[test]
    fn unverifiable_chain_uses_defaults() {
        let image = image();

        let prepared = prepare_a(&image, &BodyHint::default(), &Overrides::default()).unwrap();
        assert_eq!(prepared.signed_size, 0x1000);
        assert!(!prepared.chain_verified());
        assert_matches!(
            prepared.chain_error.as_ref(),
            Some(Error::ChainNotVerifiable(BiosComponent::VblockA, _))
        );
        assert_eq!(prepared.version, DEFAULT_VERSION);
        assert_eq!(prepared.flags, DEFAULT_FLAGS);
        assert_eq!(prepared.signed_body(&image).map(<[u8]>::len), Some(0x1000));

        let overrides = Overrides {
            version: Some(9),
            flags: Some(2),
        };
        let prepared = prepare_a(&image, &BodyHint::default(), &overrides).unwrap();
        assert_eq!(prepared.version, 9);
        assert_eq!(prepared.flags, 2);
    }

    #[test]
    fn verified_chain_is_inherited() {
        let mut image = image();
        write_chain(&mut image, 4, 3, 0x800);

        let prepared = prepare_a(&image, &BodyHint::default(), &Overrides::default()).unwrap();
        assert!(prepared.chain_verified());
        assert_eq!(prepared.signed_size, 0x800);
        assert_eq!(prepared.version, 4);
        assert_eq!(prepared.flags, 3);

        let overrides = Overrides {
            version: Some(6),
            flags: None,
        };
        let prepared = prepare_a(&image, &BodyHint::default(), &overrides).unwrap();
        assert_eq!(prepared.version, 6);
        assert_eq!(prepared.flags, 3);
    }

    #[test]
    fn size_hints() {
        let mut image = image();
        write_chain(&mut image, 1, 0, 0x800);

        let hint = |size| BodyHint {
            signed_size: Some(size),
            metadata_hash: None,
        };

        // A zero hint is ignored.
        let prepared = prepare_a(&image, &hint(0), &Overrides::default()).unwrap();
        assert_eq!(prepared.signed_size, 0x800);

        let prepared = prepare_a(&image, &hint(0x400), &Overrides::default()).unwrap();
        assert_eq!(prepared.signed_size, 0x400);
        assert!(prepared.chain_verified());

        assert_matches!(
            prepare_a(&image, &hint(0x1001), &Overrides::default()),
            Err(Error::RegionTooSmall {
                component: BiosComponent::FwMainA,
                needed: 0x1001,
                available: 0x1000,
            })
        );
    }

    #[test]
    fn declared_size_larger_than_body() {
        let mut image = image();
        write_chain(&mut image, 5, 0, 0x1800);

        let prepared = prepare_a(&image, &BodyHint::default(), &Overrides::default()).unwrap();
        assert!(!prepared.chain_verified());
        assert_eq!(prepared.signed_size, 0x1000);
        assert_eq!(prepared.version, DEFAULT_VERSION);
    }

    #[test]
    fn missing_regions() {
        let image = image();
        let table = AreaTable::find(&image).unwrap();

        assert_matches!(
            prepare(
                &table,
                &image,
                Slot::B,
                &BodyHint::default(),
                &Overrides::default(),
            ),
            Err(Error::MissingRegion(BiosComponent::FwMainB))
        );
    }
}
