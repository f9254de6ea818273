// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, sync::OnceLock};

use assert_matches::assert_matches;
use rsa::RsaPrivateKey;
use vbsign::{
    bios::{
        self, AreaTable, BiosComponent, Error, Slot,
        cbfs::SlotHints,
        show::{self, BodyCheck, ComponentReport, ShowReport, SignatureCheck, VblockReport},
        sign::{self, LoemExport, SignOptions, SignReport},
        slot::{self, BodyHint, Overrides},
    },
    crypto::{self, RsaSigningKey},
    format::{
        fmap::{Fmap, FmapArea},
        gbb::{self, GbbFlags, GbbLayout},
        vb2::{Algorithm, Hash, HashAlgorithm, Keyblock, PackedKey, Signature},
    },
};

const ALGORITHM: Algorithm = Algorithm::Rsa1024Sha256;
const IMAGE_SIZE: usize = 0x5000;
const FMAP_OFFSET: usize = 0x100;
const GBB_OFFSET: u32 = 0x400;

struct Keys {
    root: RsaPrivateKey,
    data: RsaPrivateKey,
}

fn keys() -> &'static Keys {
    static KEYS: OnceLock<Keys> = OnceLock::new();

    KEYS.get_or_init(|| Keys {
        root: crypto::generate_rsa_key_pair(1024, 65537).unwrap(),
        data: crypto::generate_rsa_key_pair(1024, 65537).unwrap(),
    })
}

fn packed(key: &RsaPrivateKey) -> PackedKey {
    PackedKey::from_public_key(&key.to_public_key(), ALGORITHM, 1).unwrap()
}

fn layout(component: BiosComponent) -> (u32, u32) {
    match component {
        BiosComponent::Gbb => (GBB_OFFSET, 0xc00),
        BiosComponent::VblockA => (0x1000, 0x1000),
        BiosComponent::FwMainA => (0x2000, 0x1000),
        BiosComponent::VblockB => (0x3000, 0x1000),
        BiosComponent::FwMainB => (0x4000, 0x1000),
    }
}

fn areas_without(excluded: &[BiosComponent]) -> Vec<(&'static str, u32, u32)> {
    BiosComponent::ALL
        .into_iter()
        .filter(|c| !excluded.contains(c))
        .map(|c| {
            let (offset, size) = layout(c);
            (c.area_name(), offset, size)
        })
        .collect()
}

fn write_fmap(image: &mut [u8], areas: &[(&str, u32, u32)]) {
    let mut fmap = Fmap::new("FMAP", IMAGE_SIZE as u32).unwrap();
    for (name, offset, size) in areas {
        fmap.areas.push(FmapArea::new(name, *offset, *size).unwrap());
    }
    let data = fmap.to_bytes().unwrap();

    image[FMAP_OFFSET..GBB_OFFSET as usize].fill(0xff);
    image[FMAP_OFFSET..FMAP_OFFSET + data.len()].copy_from_slice(&data);
}

/// Build an image with every region laid out, but with empty signature blocks.
fn unsigned_image() -> Vec<u8> {
    let mut image = vec![0xffu8; IMAGE_SIZE];
    write_fmap(&mut image, &areas_without(&[]));

    let root_key = packed(&keys().root).to_bytes().unwrap();
    let gbb_layout = GbbLayout {
        hwid_size: 0x40,
        rootkey_size: 0x400,
        bmpfv_size: 0,
        recovery_key_size: 0x400,
    };
    let gbb = gbb::create(&gbb_layout, "TEST HWID", &root_key, &root_key, GbbFlags::empty())
        .unwrap();
    let gbb_offset = GBB_OFFSET as usize;
    image[gbb_offset..gbb_offset + gbb.len()].copy_from_slice(&gbb);

    for (i, b) in image[0x2000..0x3000].iter_mut().enumerate() {
        *b = i as u8;
    }
    for (i, b) in image[0x4000..0x5000].iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(3);
    }
    image[0x1000..0x2000].fill(0);
    image[0x3000..0x4000].fill(0);

    image
}

fn options_with_keyblock(
    keyblock: Keyblock,
    overrides: Overrides,
    loem: Option<LoemExport>,
) -> SignOptions {
    SignOptions::new(
        RsaSigningKey::Internal(keys().data.clone()),
        keyblock,
        packed(&keys().root),
        overrides,
        loem,
    )
    .unwrap()
}

fn options(overrides: Overrides) -> SignOptions {
    let root = RsaSigningKey::Internal(keys().root.clone());
    let keyblock = Keyblock::create(&packed(&keys().data), Some((&root, ALGORITHM)), 0).unwrap();

    options_with_keyblock(keyblock, overrides, None)
}

fn sign_image(
    image: &mut [u8],
    hints: &SlotHints,
    options: &SignOptions,
) -> bios::Result<SignReport> {
    let table = AreaTable::find(image).unwrap();

    sign::sign(image, &table, hints, options)
}

fn signed_image() -> Vec<u8> {
    let mut image = unsigned_image();
    sign_image(&mut image, &SlotHints::default(), &options(Overrides::default())).unwrap();
    image
}

fn show_image(image: &[u8]) -> ShowReport {
    let table = AreaTable::find(image).unwrap();

    show::show(image, &table)
}

fn vblock_report(report: &ShowReport, component: BiosComponent) -> &VblockReport {
    report
        .components
        .iter()
        .find_map(|c| match c {
            ComponentReport::Vblock(r) if r.area.component == component => Some(r),
            _ => None,
        })
        .unwrap()
}

fn vblock_data(image: &[u8], slot: Slot) -> &[u8] {
    let (offset, size) = layout(slot.vblock());
    &image[offset as usize..(offset + size) as usize]
}

fn body_data(image: &[u8], slot: Slot) -> &[u8] {
    let (offset, size) = layout(slot.body());
    &image[offset as usize..(offset + size) as usize]
}

fn metadata_hash(fill: u8) -> Hash {
    Hash {
        algorithm: HashAlgorithm::Sha256,
        digest: vec![fill; 32],
    }
}

#[test]
fn show_valid_image() {
    let image = signed_image();
    let report = show_image(&image);

    assert_eq!(report.invalid_count, 0, "{report}");
    assert!(bios::is_bios_image(&image));

    for component in [BiosComponent::VblockA, BiosComponent::VblockB] {
        let vblock = vblock_report(&report, component);
        let keyblock = vblock.keyblock.as_ref().unwrap();
        let preamble = vblock.preamble.as_ref().unwrap();

        assert_eq!(keyblock.signature, SignatureCheck::Valid);
        assert_eq!(preamble.body, BodyCheck::Valid);
        assert_eq!(preamble.firmware_version, 1);
        assert_eq!(preamble.flags, 0);
        assert_eq!(preamble.body_data_size, 0x1000);
    }

    let text = report.to_string();
    assert!(text.contains("HWID:                  TEST HWID"), "{text}");
    assert!(text.contains("All components are valid"), "{text}");
}

#[test]
fn show_counts_missing_mandatory_regions() {
    let mut image = signed_image();
    write_fmap(
        &mut image,
        &areas_without(&[
            BiosComponent::Gbb,
            BiosComponent::FwMainA,
            BiosComponent::VblockA,
        ]),
    );

    let report = show_image(&image);
    assert_eq!(report.invalid_count, 3, "{report}");
    assert!(!bios::is_bios_image(&image));

    // Without a GBB, there is no root key to check the keyblock against.
    let vblock = vblock_report(&report, BiosComponent::VblockB);
    assert_eq!(
        vblock.keyblock.as_ref().unwrap().signature,
        SignatureCheck::Ignored,
    );
}

#[test]
fn show_ignores_absent_slot_b() {
    let mut image = signed_image();
    write_fmap(
        &mut image,
        &areas_without(&[BiosComponent::FwMainB, BiosComponent::VblockB]),
    );

    let report = show_image(&image);
    assert_eq!(report.invalid_count, 0, "{report}");
}

#[test]
fn show_truncated_image() {
    let mut image = signed_image();
    image.truncate(0x4800);

    let report = show_image(&image);
    assert_eq!(report.invalid_count, 1, "{report}");

    let body = report
        .components
        .iter()
        .find_map(|c| match c {
            ComponentReport::Body(r) if r.area.component == BiosComponent::FwMainB => Some(r),
            _ => None,
        })
        .unwrap();
    assert!(!body.area.is_valid);
    assert_eq!((body.area.offset, body.area.size), (0, 0));

    let vblock = vblock_report(&report, BiosComponent::VblockB);
    assert_eq!(
        vblock.preamble.as_ref().unwrap().body,
        BodyCheck::Unavailable,
    );
}

#[test]
fn show_detects_modified_body() {
    let mut image = signed_image();
    image[0x2000] ^= 0xff;

    let report = show_image(&image);
    assert_eq!(report.invalid_count, 1, "{report}");
    assert_eq!(
        vblock_report(&report, BiosComponent::VblockA)
            .preamble
            .as_ref()
            .unwrap()
            .body,
        BodyCheck::Invalid,
    );
}

#[test]
fn show_detects_wrong_root_key() {
    let mut image = unsigned_image();

    // Self-signed by the data key instead of the root key.
    let data = RsaSigningKey::Internal(keys().data.clone());
    let keyblock = Keyblock::create(&packed(&keys().data), Some((&data, ALGORITHM)), 0).unwrap();
    let options = options_with_keyblock(keyblock, Overrides::default(), None);
    sign_image(&mut image, &SlotHints::default(), &options).unwrap();

    let report = show_image(&image);
    assert_eq!(report.invalid_count, 2, "{report}");
    assert_eq!(
        vblock_report(&report, BiosComponent::VblockA)
            .keyblock
            .as_ref()
            .unwrap()
            .signature,
        SignatureCheck::Invalid,
    );
}

#[test]
fn sign_requires_slot_a() {
    let mut image = unsigned_image();
    write_fmap(&mut image, &areas_without(&[BiosComponent::VblockA]));
    let original = image.clone();

    assert_matches!(
        sign_image(&mut image, &SlotHints::default(), &options(Overrides::default())),
        Err(Error::MissingRegion(BiosComponent::VblockA))
    );
    assert_eq!(image, original);

    let mut areas = areas_without(&[BiosComponent::FwMainA]);
    areas.push(("FW_MAIN_A", 0x2000, 0x10000));
    write_fmap(&mut image, &areas);
    let original = image.clone();

    assert_matches!(
        sign_image(&mut image, &SlotHints::default(), &options(Overrides::default())),
        Err(Error::RegionTooSmall {
            component: BiosComponent::FwMainA,
            ..
        })
    );
    assert_eq!(image, original);
}

#[test]
fn sign_single_slot() {
    let mut image = unsigned_image();
    write_fmap(
        &mut image,
        &areas_without(&[BiosComponent::FwMainB, BiosComponent::VblockB]),
    );
    image[0x3000..0x4000].fill(0xaa);

    let report = sign_image(&mut image, &SlotHints::default(), &options(Overrides::default()))
        .unwrap();
    assert_eq!(report.slots.len(), 1);
    assert_eq!(report.slots[0].slot, Slot::A);

    assert!(image[0x3000..0x4000].iter().all(|b| *b == 0xaa));
    slot::verify_chain(vblock_data(&image, Slot::A)).unwrap();
}

#[test]
fn present_but_broken_slot_b_is_fatal() {
    let mut image = unsigned_image();
    write_fmap(&mut image, &areas_without(&[BiosComponent::VblockB]));
    let original = image.clone();

    assert_matches!(
        sign_image(&mut image, &SlotHints::default(), &options(Overrides::default())),
        Err(Error::MissingRegion(BiosComponent::VblockB))
    );
    assert_eq!(image, original);
}

#[test]
fn sign_round_trip() {
    let mut image = unsigned_image();
    let overrides = Overrides {
        version: Some(7),
        flags: Some(1),
    };

    let report = sign_image(&mut image, &SlotHints::default(), &options(overrides)).unwrap();
    assert_eq!(report.slots.len(), 2);
    assert!(report.slots.iter().all(|s| !s.previous_chain_verified));

    let root_key = packed(&keys().root);

    for slot in Slot::ALL {
        let (keyblock, preamble) = slot::verify_chain(vblock_data(&image, slot)).unwrap();

        assert_eq!(keyblock.data_key, packed(&keys().data));
        keyblock.verify_signature(&root_key).unwrap();
        assert_eq!(preamble.firmware_version, 7);
        assert_eq!(preamble.flags, 1);
        assert_eq!(preamble.kernel_subkey, root_key);
        preamble
            .body_signature
            .verify(body_data(&image, slot), &keyblock.data_key, "body")
            .unwrap();
    }

    // The version and flags are inherited from the verified preambles.
    let report = sign_image(&mut image, &SlotHints::default(), &options(Overrides::default()))
        .unwrap();
    for signed in &report.slots {
        assert!(signed.previous_chain_verified);
        assert_eq!(signed.version, 7);
        assert_eq!(signed.flags, 1);
    }
}

#[test]
fn sign_is_idempotent() {
    let first = signed_image();
    let mut second = first.clone();

    sign_image(&mut second, &SlotHints::default(), &options(Overrides::default())).unwrap();
    assert_eq!(first, second);
}

#[test]
fn sign_records_gbb_keys() {
    let mut image = unsigned_image();

    let report = sign_image(&mut image, &SlotHints::default(), &options(Overrides::default()))
        .unwrap();
    assert_eq!(report.root_key_offset, Some(u64::from(GBB_OFFSET) + 128 + 0x40));
    assert_eq!(
        report.recovery_key_offset,
        Some(u64::from(GBB_OFFSET) + 128 + 0x40 + 0x400),
    );
}

#[test]
fn sign_replaces_unverifiable_chain() {
    let mut image = unsigned_image();
    let overrides = Overrides {
        version: Some(5),
        flags: None,
    };
    sign_image(&mut image, &SlotHints::default(), &options(overrides)).unwrap();

    // Break the slot A keyblock magic.
    image[0x1000] ^= 0xff;

    let report = sign_image(&mut image, &SlotHints::default(), &options(Overrides::default()))
        .unwrap();
    assert!(!report.slots[0].previous_chain_verified);
    assert_eq!(report.slots[0].version, slot::DEFAULT_VERSION);
    assert!(report.slots[1].previous_chain_verified);
    assert_eq!(report.slots[1].version, 5);

    let (_, preamble) = slot::verify_chain(vblock_data(&image, Slot::A)).unwrap();
    assert_eq!(preamble.firmware_version, slot::DEFAULT_VERSION);
}

#[test]
fn sign_content_size_hint() {
    let mut image = unsigned_image();
    let hints = SlotHints {
        integration: false,
        a: BodyHint {
            signed_size: Some(0x800),
            metadata_hash: None,
        },
        b: BodyHint::default(),
    };

    sign_image(&mut image, &hints, &options(Overrides::default())).unwrap();

    let (_, preamble) = slot::verify_chain(vblock_data(&image, Slot::A)).unwrap();
    assert_eq!(preamble.body_signature.data_size, 0x800);
    let (_, preamble) = slot::verify_chain(vblock_data(&image, Slot::B)).unwrap();
    assert_eq!(preamble.body_signature.data_size, 0x1000);

    // Without a hint, the size from the verified preamble is used.
    let report = sign_image(&mut image, &SlotHints::default(), &options(Overrides::default()))
        .unwrap();
    assert_eq!(report.slots[0].signed_size, 0x800);

    let hints = SlotHints {
        a: BodyHint {
            signed_size: Some(0x2000),
            metadata_hash: None,
        },
        ..Default::default()
    };
    let original = image.clone();
    assert_matches!(
        sign_image(&mut image, &hints, &options(Overrides::default())),
        Err(Error::RegionTooSmall {
            component: BiosComponent::FwMainA,
            ..
        })
    );
    assert_eq!(image, original);
}

#[test]
fn sign_vblock_too_small() {
    let mut image = unsigned_image();
    let mut areas = areas_without(&[BiosComponent::VblockA]);
    areas.push(("VBLOCK_A", 0x1000, 0x100));
    write_fmap(&mut image, &areas);
    let original = image.clone();

    assert_matches!(
        sign_image(&mut image, &SlotHints::default(), &options(Overrides::default())),
        Err(Error::RegionTooSmall {
            component: BiosComponent::VblockA,
            ..
        })
    );
    assert_eq!(image, original);
}

#[test]
fn integration_requires_metadata_hash() {
    let mut image = unsigned_image();
    let hints = SlotHints {
        integration: true,
        a: BodyHint {
            signed_size: None,
            metadata_hash: Some(metadata_hash(0x11)),
        },
        b: BodyHint::default(),
    };
    let original = image.clone();

    assert_matches!(
        sign_image(&mut image, &hints, &options(Overrides::default())),
        Err(Error::MetadataHashRequired {
            component: BiosComponent::FwMainB,
            source: None,
        })
    );
    assert_eq!(image, original);
}

#[test]
fn integration_signs_metadata_hash() {
    let mut image = unsigned_image();
    let hints = SlotHints {
        integration: true,
        a: BodyHint {
            signed_size: None,
            metadata_hash: Some(metadata_hash(0x11)),
        },
        b: BodyHint {
            signed_size: None,
            metadata_hash: Some(metadata_hash(0x22)),
        },
    };

    sign_image(&mut image, &hints, &options(Overrides::default())).unwrap();

    let (_, preamble) = slot::verify_chain(vblock_data(&image, Slot::A)).unwrap();
    assert_eq!(
        preamble.body_signature,
        Signature::from_hash(&metadata_hash(0x11)),
    );

    let report = show_image(&image);
    assert_eq!(report.invalid_count, 0, "{report}");
    assert_eq!(
        vblock_report(&report, BiosComponent::VblockB)
            .preamble
            .as_ref()
            .unwrap()
            .body,
        BodyCheck::MetadataHash,
    );
}

fn loem_options(dir: &std::path::Path) -> SignOptions {
    let root = RsaSigningKey::Internal(keys().root.clone());
    let keyblock = Keyblock::create(&packed(&keys().data), Some((&root, ALGORITHM)), 0).unwrap();
    let loem = LoemExport::new(dir, "test").unwrap();

    options_with_keyblock(keyblock, Overrides::default(), Some(loem))
}

#[test]
fn loem_export() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = unsigned_image();
    let options = loem_options(dir.path());

    let report = sign_image(&mut image, &SlotHints::default(), &options).unwrap();
    assert!(report.export_errors.is_empty());
    assert_eq!(report.exported.len(), 2);

    // The whole region is exported, not just the new keyblock and preamble.
    for signed in &report.slots {
        let exported = fs::read(dir.path().join(format!("vblock_{}.test", signed.slot))).unwrap();
        assert_eq!(exported.len(), 0x1000);
        assert!(signed.vblock_size < exported.len());
        assert_eq!(exported, vblock_data(&image, signed.slot));
    }
}

#[test]
fn loem_export_failure_keeps_signed_image() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = unsigned_image();
    let original = image.clone();
    let options = loem_options(&dir.path().join("missing"));

    let report = sign_image(&mut image, &SlotHints::default(), &options).unwrap();
    assert_eq!(report.slots.len(), 2);
    assert!(report.exported.is_empty());
    assert_eq!(report.export_errors.len(), 2);
    assert_matches!(report.export_errors[0], Error::Io(_, _));

    assert_ne!(image, original);
    for slot in Slot::ALL {
        slot::verify_chain(vblock_data(&image, slot)).unwrap();
    }
}

#[test]
fn slot_b_failure_keeps_slot_a() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = unsigned_image();
    let mut areas = areas_without(&[BiosComponent::VblockB]);
    areas.push(("VBLOCK_B", 0x3000, 0x100));
    write_fmap(&mut image, &areas);
    let original = image.clone();
    let options = loem_options(dir.path());

    assert_matches!(
        sign_image(&mut image, &SlotHints::default(), &options),
        Err(Error::RegionTooSmall {
            component: BiosComponent::VblockB,
            ..
        })
    );

    // Slot A was rewritten and exported. Slot B is untouched.
    assert_ne!(vblock_data(&image, Slot::A), vblock_data(&original, Slot::A));
    slot::verify_chain(vblock_data(&image, Slot::A)).unwrap();
    assert_eq!(image[0x3000..0x4000], original[0x3000..0x4000]);

    let exported = fs::read(dir.path().join("vblock_A.test")).unwrap();
    assert_eq!(exported, vblock_data(&image, Slot::A));
    assert!(!dir.path().join("vblock_B.test").exists());
}
