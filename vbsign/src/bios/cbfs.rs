// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Content metadata lookups for firmware bodies that contain a CBFS.
//!
//! The metadata comes from coreboot's `cbfstool`, which is run as an external
//! program. The output parsers are kept separate from process handling so that
//! they can be tested without the tool being installed.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    bios::{self, AreaTable, BiosComponent, Slot, slot::BodyHint},
    format::vb2::{Hash, HashAlgorithm},
    util::DebugString,
};

/// Build configuration key that enables CBFS verification integration.
pub const INTEGRATION_CONFIG_KEY: &str = "CONFIG_VBOOT_CBFS_INTEGRATION";

const METADATA_HASH_PREFIX: &str = "[METADATA HASH]";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run command: {0:?}")]
    CommandSpawn(DebugString, #[source] io::Error),
    #[error("Command failed with status: {1}: {0:?}")]
    CommandExecution(DebugString, ExitStatus),
    #[error("Failed to create temporary file")]
    TempFile(#[source] io::Error),
    #[error("Failed to read extracted build config")]
    ReadConfig(#[source] io::Error),
    #[error("Invalid truncate output: {0:?}")]
    InvalidTruncateOutput(String),
    #[error("Metadata hash not found")]
    MetadataHashNotFound,
    #[error("Metadata hash is not valid: {0:?}")]
    MetadataHashInvalid(String),
    #[error("Unknown metadata hash algorithm: {0:?}")]
    UnknownHashAlgorithm(String),
    #[error("Invalid metadata hash digest: {0:?}")]
    InvalidDigest(String),
}

type Result<T> = std::result::Result<T, Error>;

/// Access to the content metadata of the regions in a firmware image.
pub trait ContentMetadata {
    /// Look up a build configuration value. Returns [`None`] if the key is
    /// not set.
    fn config_value(&self, key: &str) -> Result<Option<String>>;

    /// Truncate the CBFS in `region` to its contents and return the new size.
    fn truncate(&self, region: &str) -> Result<u32>;

    /// Get the metadata hash of the CBFS in `region`.
    fn metadata_hash(&self, region: &str) -> Result<Hash>;
}

/// Parse a Kconfig-style config file and find the value of `key`. String
/// values are unquoted. Keys that are commented out as `# KEY is not set` are
/// treated as missing.
pub fn parse_config_value(config: &str, key: &str) -> Option<String> {
    config.lines().find_map(|line| {
        let line = line.trim();
        let value = line.strip_prefix(key)?.strip_prefix('=')?;

        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);

        Some(value.to_owned())
    })
}

/// Parse the new region size printed by `cbfstool truncate`. Like `strtoul`
/// with base 0, both hex (`0x` prefix) and decimal are accepted.
pub fn parse_truncate_output(output: &str) -> Result<u32> {
    let value = output.trim();

    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };

    parsed.map_err(|_| Error::InvalidTruncateOutput(value.to_owned()))
}

/// Parse the metadata hash line from `cbfstool print -kv`. The line has the
/// form `[METADATA HASH]\t<algorithm>:<hex digest>[:valid]`.
pub fn parse_metadata_hash(output: &str) -> Result<Hash> {
    let line = output
        .lines()
        .find_map(|l| l.trim_start().strip_prefix(METADATA_HASH_PREFIX))
        .ok_or(Error::MetadataHashNotFound)?
        .trim();

    let mut pieces = line.split(':');
    let algorithm_name = pieces.next().unwrap_or_default();
    let digest_hex = pieces.next().unwrap_or_default();

    if let Some(status) = pieces.next() {
        if status != "valid" {
            return Err(Error::MetadataHashInvalid(line.to_owned()));
        }
    }

    let algorithm = HashAlgorithm::from_name(algorithm_name)
        .ok_or_else(|| Error::UnknownHashAlgorithm(algorithm_name.to_owned()))?;
    let digest =
        hex::decode(digest_hex).map_err(|_| Error::InvalidDigest(digest_hex.to_owned()))?;

    if digest.len() != algorithm.digest_len() {
        return Err(Error::InvalidDigest(digest_hex.to_owned()));
    }

    Ok(Hash { algorithm, digest })
}

/// [`ContentMetadata`] backed by the `cbfstool` program operating on an image
/// file.
pub struct CbfsTool {
    program: PathBuf,
    image: PathBuf,
}

impl CbfsTool {
    pub fn new(program: &Path, image: &Path) -> Self {
        Self {
            program: program.to_owned(),
            image: image.to_owned(),
        }
    }

    /// Run `cbfstool <image> <args...>` and return its stdout.
    fn run(&self, args: &[&str]) -> Result<String> {
        let mut command = Command::new(&self.program);
        command.arg(&self.image);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        debug!("Running: {command:?}");

        let output = command
            .output()
            .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

        if !output.status.success() {
            debug!(
                "cbfstool stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim_end(),
            );
            return Err(Error::CommandExecution(
                DebugString::new(&command),
                output.status,
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ContentMetadata for CbfsTool {
    fn config_value(&self, key: &str) -> Result<Option<String>> {
        let temp = tempfile::NamedTempFile::new().map_err(Error::TempFile)?;
        let temp_path = temp.path().to_string_lossy().into_owned();

        self.run(&["extract", "-n", "config", "-f", &temp_path])?;

        let config = fs::read_to_string(temp.path()).map_err(Error::ReadConfig)?;

        Ok(parse_config_value(&config, key))
    }

    fn truncate(&self, region: &str) -> Result<u32> {
        let output = self.run(&["truncate", "-r", region])?;

        parse_truncate_output(&output)
    }

    fn metadata_hash(&self, region: &str) -> Result<Hash> {
        let output = self.run(&["print", "-kv", "-r", region])?;

        parse_metadata_hash(&output)
    }
}

/// Check if the image uses CBFS verification integration. Any failure to read
/// the build config means that it does not.
pub fn detect(metadata: &impl ContentMetadata) -> bool {
    match metadata.config_value(INTEGRATION_CONFIG_KEY) {
        Ok(value) => value.as_deref() == Some("y"),
        Err(e) => {
            debug!("Failed to read {INTEGRATION_CONFIG_KEY}: {e}");
            false
        }
    }
}

/// Get the content-derived information for a body region. Without integration,
/// the CBFS is truncated to its contents and a failure just means that the
/// region has no CBFS. With integration, the metadata hash is mandatory.
pub fn derive_hint(
    metadata: &impl ContentMetadata,
    component: BiosComponent,
    integration: bool,
) -> bios::Result<BodyHint> {
    let region = component.area_name();

    if !integration {
        return match metadata.truncate(region) {
            Ok(size) => {
                debug!("CBFS found in area {region}: {size:#x} bytes");
                Ok(BodyHint {
                    signed_size: Some(size),
                    metadata_hash: None,
                })
            }
            Err(e) => {
                debug!("CBFS not found in area {region}: {e}");
                Ok(BodyHint::default())
            }
        };
    }

    match metadata.metadata_hash(region) {
        Ok(hash) => {
            debug!("CBFS metadata hash found in area {region}: {hash}");
            Ok(BodyHint {
                signed_size: None,
                metadata_hash: Some(hash),
            })
        }
        Err(e) => Err(bios::Error::MetadataHashRequired {
            component,
            source: Some(e),
        }),
    }
}

/// Content-derived information for both slots of an image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotHints {
    pub integration: bool,
    pub a: BodyHint,
    pub b: BodyHint,
}

impl SlotHints {
    pub fn get(&self, slot: Slot) -> &BodyHint {
        match slot {
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }

    pub fn get_mut(&mut self, slot: Slot) -> &mut BodyHint {
        match slot {
            Slot::A => &mut self.a,
            Slot::B => &mut self.b,
        }
    }
}

/// Derive hints for every body region that exists in the FMAP.
///
/// Without integration, truncating the CBFS modifies the image file, so this
/// must run before the image is loaded for signing.
pub fn derive_hints(metadata: &impl ContentMetadata, table: &AreaTable) -> bios::Result<SlotHints> {
    let mut hints = SlotHints {
        integration: detect(metadata),
        ..Default::default()
    };

    if hints.integration {
        debug!("Image uses CBFS verification integration");
    }

    for slot in Slot::ALL {
        let component = slot.body();

        if !table.contains(component) {
            if slot == Slot::A {
                warn!("{component} not found in FMAP");
            }
            continue;
        }

        *hints.get_mut(slot) = derive_hint(metadata, component, hints.integration)?;
    }

    Ok(hints)
}
