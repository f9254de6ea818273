// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    path::{Path, PathBuf},
};

use cap_std::{ambient_authority, fs::Dir};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    bios::{
        AreaTable, BiosComponent, Error, Result, Slot,
        cbfs::SlotHints,
        gbb,
        slot::{self, Overrides, PreparedSlot},
    },
    crypto::RsaSigningKey,
    format::vb2::{Algorithm, FwPreamble, Keyblock, PackedKey, Signature},
    util,
};

/// Destination for standalone copies of the signature block regions. The
/// directory is only opened when exporting, so a bad destination never
/// prevents signing.
#[derive(Clone, Debug)]
pub struct LoemExport {
    dir_path: PathBuf,
    id: String,
}

impl LoemExport {
    pub fn new(dir_path: &Path, id: &str) -> Result<Self> {
        if !util::is_safe_file_name(id) {
            return Err(Error::InvalidLoemId(id.to_owned()));
        }

        Ok(Self {
            dir_path: dir_path.to_owned(),
            id: id.to_owned(),
        })
    }

    pub fn file_name(&self, slot: Slot) -> String {
        format!("vblock_{}.{}", slot.letter(), self.id)
    }

    fn write(&self, slot: Slot, data: &[u8]) -> Result<PathBuf> {
        let name = self.file_name(slot);
        let path = self.dir_path.join(&name);

        let dir = Dir::open_ambient_dir(&self.dir_path, ambient_authority())
            .map_err(|e| Error::Io(self.dir_path.clone(), e))?;
        dir.write(&name, data)
            .map_err(|e| Error::Io(path.clone(), e))?;

        Ok(path)
    }
}

/// Key material and settings for re-signing.
pub struct SignOptions {
    pub signing_key: RsaSigningKey,
    pub keyblock: Keyblock,
    pub kernel_subkey: PackedKey,
    /// Algorithm of the keyblock's data key, which the signing key must match.
    pub algorithm: Algorithm,
    pub overrides: Overrides,
    pub loem: Option<LoemExport>,
}

impl fmt::Debug for SignOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignOptions")
            .field("keyblock", &self.keyblock)
            .field("kernel_subkey", &self.kernel_subkey)
            .field("algorithm", &self.algorithm)
            .field("overrides", &self.overrides)
            .field("loem", &self.loem)
            .finish_non_exhaustive()
    }
}

impl SignOptions {
    pub fn new(
        signing_key: RsaSigningKey,
        keyblock: Keyblock,
        kernel_subkey: PackedKey,
        overrides: Overrides,
        loem: Option<LoemExport>,
    ) -> Result<Self> {
        let algorithm = keyblock
            .data_key
            .validate()
            .map_err(Error::InvalidKeyblock)?;
        let data_key = keyblock
            .data_key
            .to_public_key()
            .map_err(Error::InvalidKeyblock)?;

        if data_key != signing_key.to_public_key() {
            return Err(Error::KeyMismatch);
        }

        Ok(Self {
            signing_key,
            keyblock,
            kernel_subkey,
            algorithm,
            overrides,
            loem,
        })
    }
}

/// What was written for one slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SignedSlot {
    pub slot: Slot,
    pub signed_size: usize,
    pub version: u32,
    pub flags: u32,
    /// Whether the signature block that was replaced could be verified.
    pub previous_chain_verified: bool,
    /// Number of bytes written at the start of the signature block region.
    pub vblock_size: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct SignReport {
    /// Absolute image offset of the GBB root key, if it is valid.
    pub root_key_offset: Option<u64>,
    /// Absolute image offset of the GBB recovery key, if it is valid.
    pub recovery_key_offset: Option<u64>,
    pub slots: Vec<SignedSlot>,
    pub exported: Vec<PathBuf>,
    /// Exports that failed. These do not undo the changes to the image.
    #[serde(skip)]
    pub export_errors: Vec<Error>,
}

/// Compute the new body signature and write the keyblock followed by a new
/// preamble to the start of the slot's signature block region. Nothing is
/// written if the region is too small. Returns the bytes that were written.
pub fn rewrite(
    image: &mut [u8],
    prepared: &PreparedSlot,
    options: &SignOptions,
) -> Result<Vec<u8>> {
    let body_signature = match &prepared.metadata_hash {
        Some(hash) => Signature::from_hash(hash),
        None => {
            let body = prepared
                .signed_body(image)
                .ok_or(Error::RegionTooSmall {
                    component: prepared.body.component,
                    needed: prepared.signed_size as u64,
                    available: prepared.body.size as u64,
                })?;

            Signature::create(body, &options.signing_key, options.algorithm, "body")
                .map_err(|e| Error::Signature(prepared.body.component, e))?
        }
    };

    let preamble = FwPreamble::create(
        prepared.version,
        &options.kernel_subkey,
        &body_signature,
        &options.signing_key,
        options.algorithm,
        prepared.flags,
    )
    .map_err(|e| Error::Signature(prepared.vblock.component, e))?;

    let keyblock = options.keyblock.as_bytes();
    let needed = keyblock.len() + preamble.size();

    let vblock = prepared
        .vblock
        .data_mut(image)
        .filter(|v| v.len() >= needed)
        .ok_or(Error::RegionTooSmall {
            component: prepared.vblock.component,
            needed: needed as u64,
            available: prepared.vblock.size as u64,
        })?;

    vblock[..keyblock.len()].copy_from_slice(keyblock);
    vblock[keyblock.len()..needed].copy_from_slice(preamble.as_bytes());

    debug!(
        "Wrote {needed:#x} bytes to {}: keyblock={:#x}, preamble={:#x}",
        prepared.vblock.component,
        keyblock.len(),
        preamble.size(),
    );

    Ok(vblock[..needed].to_vec())
}

/// Record where the GBB keys are. This is informational only and never fails.
fn find_gbb_keys(table: &AreaTable, image: &[u8], report: &mut SignReport) {
    let area = match table.resolve(BiosComponent::Gbb) {
        Ok(a) => a,
        Err(e) => {
            debug!("Not recording GBB keys: {e}");
            return;
        }
    };

    let gbb = gbb::inspect(&area, image);

    report.root_key_offset = gbb
        .root_key
        .as_ref()
        .filter(|k| k.is_valid())
        .map(|k| k.offset);
    report.recovery_key_offset = gbb
        .recovery_key
        .as_ref()
        .filter(|k| k.is_valid())
        .map(|k| k.offset);

    debug!(
        "GBB keys: root={:?}, recovery={:?}",
        report.root_key_offset, report.recovery_key_offset,
    );
}

/// Re-sign slot A and, if present, slot B of a BIOS image in place.
///
/// Slot A is mandatory. Slot B is skipped only if its body region does not
/// exist. Any other failure aborts the operation. Signature blocks that were
/// already rewritten are not restored, so on failure, slot A may have been
/// updated even though slot B was not. Whatever was rewritten is still
/// exported before the error is returned.
pub fn sign(
    image: &mut [u8],
    table: &AreaTable,
    hints: &SlotHints,
    options: &SignOptions,
) -> Result<SignReport> {
    let mut report = SignReport::default();

    find_gbb_keys(table, image, &mut report);

    let slot_a = slot::prepare(table, image, Slot::A, hints.get(Slot::A), &options.overrides)?;

    let slot_b = match slot::prepare(table, image, Slot::B, hints.get(Slot::B), &options.overrides)
    {
        Ok(s) => Some(s),
        Err(e) if !table.contains(Slot::B.body()) => {
            info!("Signing slot A only: {e}");
            None
        }
        Err(e) => return Err(e),
    };

    let prepared = [Some(slot_a), slot_b];
    let prepared = prepared.iter().flatten().collect::<Vec<_>>();

    if hints.integration {
        if let Some(p) = prepared.iter().find(|p| p.metadata_hash.is_none()) {
            return Err(Error::MetadataHashRequired {
                component: p.body.component,
                source: None,
            });
        }
    }

    let mut rewritten = vec![];
    let mut rewrite_error = None;

    for p in &prepared {
        if let Some(e) = &p.chain_error {
            info!("Replacing unverifiable signature block: {e}");
        }

        let data = match rewrite(image, p, options) {
            Ok(d) => d,
            Err(e) => {
                rewrite_error = Some(e);
                break;
            }
        };

        report.slots.push(SignedSlot {
            slot: p.slot,
            signed_size: p.signed_size,
            version: p.version,
            flags: p.flags,
            previous_chain_verified: p.chain_verified(),
            vblock_size: data.len(),
        });
        rewritten.push((p.slot, p.vblock));
    }

    if let Some(loem) = &options.loem {
        for (slot, vblock) in &rewritten {
            // The region was just written, so it is always in bounds.
            let data = vblock.data(image).unwrap_or_default();

            match loem.write(*slot, data) {
                Ok(path) => report.exported.push(path),
                Err(e) => {
                    warn!("Failed to export slot {slot} signature block: {e}");
                    report.export_errors.push(e);
                }
            }
        }
    }

    match rewrite_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
