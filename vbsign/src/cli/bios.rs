// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use crate::{
    bios::{
        self, AreaTable,
        cbfs::{self, CbfsTool},
        show::{self, ShowReport},
        sign::{self, LoemExport, SignOptions},
        slot::Overrides,
    },
    cli::{status, warning},
    crypto::{self, PassphraseSource, RsaSigningKey},
    format::vb2::{Keyblock, PackedKey},
    util,
};

/// Parse an integer that may be written in hex with a `0x` prefix.
pub fn parse_u32(value: &str) -> std::result::Result<u32, String> {
    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };

    parsed.map_err(|e| e.to_string())
}

fn read_image(path: &Path) -> Result<(Vec<u8>, AreaTable)> {
    let image = fs::read(path).with_context(|| format!("Failed to read image: {path:?}"))?;
    let table = AreaTable::find(&image).with_context(|| format!("Failed to find FMAP: {path:?}"))?;

    Ok((image, table))
}

/// Atomically replace the contents of `path`.
fn write_image(path: &Path, data: &[u8]) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new_in(util::parent_path(path))
        .with_context(|| format!("Failed to create temporary file next to: {path:?}"))?;

    temp.write_all(data)
        .with_context(|| format!("Failed to write temporary file: {:?}", temp.path()))?;
    temp.persist(path)
        .with_context(|| format!("Failed to replace image: {path:?}"))?;

    Ok(())
}

fn write_info(path: &Path, report: &ShowReport) -> Result<()> {
    let data = toml_edit::ser::to_string_pretty(report)
        .with_context(|| format!("Failed to serialize BIOS info TOML: {path:?}"))?;
    fs::write(path, data).with_context(|| format!("Failed to write BIOS info TOML: {path:?}"))?;

    Ok(())
}

fn load_key(group: &KeyGroup) -> Result<RsaSigningKey> {
    let source = PassphraseSource::new(
        &group.signing_key,
        group.pass_file.as_deref(),
        group.pass_env_var.as_deref(),
    );
    let signing_key = if let Some(helper) = &group.signing_helper {
        let public_key = crypto::read_pem_public_key_file(&group.signing_key)
            .with_context(|| format!("Failed to load key: {:?}", group.signing_key))?;

        RsaSigningKey::External {
            program: helper.clone(),
            public_key_file: group.signing_key.clone(),
            public_key,
            passphrase_source: source,
        }
    } else {
        let private_key = crypto::read_pem_key_file(&group.signing_key, &source)
            .with_context(|| format!("Failed to load key: {:?}", group.signing_key))?;

        RsaSigningKey::Internal(private_key)
    };

    Ok(signing_key)
}

fn load_options(cli: &SignCli) -> Result<SignOptions> {
    let signing_key = load_key(&cli.key)?;

    let data = fs::read(&cli.keyblock)
        .with_context(|| format!("Failed to read keyblock: {:?}", cli.keyblock))?;
    let keyblock = Keyblock::parse(&data)
        .with_context(|| format!("Failed to parse keyblock: {:?}", cli.keyblock))?;

    let data = fs::read(&cli.kernel_subkey)
        .with_context(|| format!("Failed to read kernel subkey: {:?}", cli.kernel_subkey))?;
    let kernel_subkey = PackedKey::parse(&data)
        .with_context(|| format!("Failed to parse kernel subkey: {:?}", cli.kernel_subkey))?;

    let loem = cli
        .loem_id
        .as_deref()
        .map(|id| {
            let dir = cli.loem_dir.as_deref().unwrap_or(Path::new("."));
            LoemExport::new(dir, id)
        })
        .transpose()
        .context("Invalid signature block export ID")?;

    let overrides = Overrides {
        version: cli.version,
        flags: cli.flags,
    };

    SignOptions::new(signing_key, keyblock, kernel_subkey, overrides, loem)
        .context("Invalid signing key material")
}

fn show_subcommand(cli: &ShowCli) -> Result<()> {
    let (image, table) = read_image(&cli.input)?;

    if !bios::is_bios_image(&image) {
        warning!("FMAP does not contain all mandatory BIOS regions");
    }

    let report = show::show(&image, &table);

    if !cli.quiet {
        println!("BIOS:                    {}", cli.input.display());
        print!("{report}");
    }

    if let Some(path) = &cli.output_info {
        write_info(path, &report)?;
    }

    if report.invalid_count != 0 {
        bail!("Found {} invalid components", report.invalid_count);
    }

    Ok(())
}

fn sign_subcommand(cli: &SignCli) -> Result<()> {
    // Key material must be valid before the image is touched.
    let options = load_options(cli)?;

    let path = match &cli.output {
        Some(output) => {
            fs::copy(&cli.input, output)
                .with_context(|| format!("Failed to copy {:?} to {output:?}", cli.input))?;
            output
        }
        None => &cli.input,
    };

    // Truncating the CBFS modifies the file, so the image can only be loaded
    // for signing afterwards.
    let (_, table) = read_image(path)?;
    let cbfstool = CbfsTool::new(&cli.cbfstool, path);
    let hints = cbfs::derive_hints(&cbfstool, &table)
        .with_context(|| format!("Failed to query CBFS metadata: {path:?}"))?;

    let (original, table) = read_image(path)?;
    let mut image = original.clone();

    status!("Signing BIOS image: {path:?}");

    let result = sign::sign(&mut image, &table, &hints, &options);

    // Slot A may have been rewritten even if slot B failed.
    if image != original {
        write_image(path, &image)?;
    }

    let report = result.with_context(|| format!("Failed to sign image: {path:?}"))?;

    for slot in &report.slots {
        info!(
            "Slot {}: signed {:#x} bytes, version {}, flags {:#x}",
            slot.slot, slot.signed_size, slot.version, slot.flags,
        );
    }

    for exported in &report.exported {
        status!("Exported signature block: {exported:?}");
    }

    if !report.export_errors.is_empty() {
        for e in &report.export_errors {
            error!("{}", bios::error_chain(e));
        }
        bail!(
            "Failed to export {} signature blocks",
            report.export_errors.len(),
        );
    }

    Ok(())
}

pub fn bios_main(cli: &BiosCli) -> Result<()> {
    match &cli.command {
        BiosCommand::Show(c) => show_subcommand(c),
        BiosCommand::Sign(c) => sign_subcommand(c),
    }
}

/// Describe and validate every region of a BIOS image.
///
/// The command fails if any mandatory region is missing or if any region that
/// is present is invalid.
#[derive(Debug, Parser)]
struct ShowCli {
    /// Path to BIOS image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output info TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    output_info: Option<PathBuf>,

    /// Don't print the report.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Args)]
struct KeyGroup {
    /// Private key for signing the firmware bodies and preambles.
    ///
    /// This must be the private key for the keyblock's data key. If
    /// --signing-helper is used, then this is the public key instead.
    #[arg(short = 'k', long, value_name = "FILE", value_parser)]
    signing_key: PathBuf,

    /// Environment variable containing the private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pass_env_var: Option<OsString>,

    /// File containing the private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pass_file: Option<PathBuf>,

    /// External program for signing.
    ///
    /// If this option is specified, then --signing-key must refer to a public
    /// key. The program will be invoked as:
    ///
    /// <program> <algo> <public key> [file <pass file>|env <pass env>]
    #[arg(long, value_name = "PROGRAM", value_parser)]
    signing_helper: Option<PathBuf>,
}

/// Re-sign the firmware bodies of a BIOS image.
///
/// Slot A is required. Slot B is signed too if the image has a FW_MAIN_B
/// region.
#[derive(Debug, Parser)]
struct SignCli {
    /// Path to BIOS image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output BIOS image.
    ///
    /// If unspecified, the input image is modified in place.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: Option<PathBuf>,

    #[command(flatten)]
    key: KeyGroup,

    /// Keyblock containing the data key.
    #[arg(short = 'b', long, value_name = "FILE", value_parser)]
    keyblock: PathBuf,

    /// Packed kernel subkey to embed in the preambles.
    #[arg(long, value_name = "FILE", value_parser)]
    kernel_subkey: PathBuf,

    /// Firmware version.
    ///
    /// Defaults to the version in the existing preamble, or 1.
    #[arg(long, value_name = "NUM", value_parser = parse_u32)]
    version: Option<u32>,

    /// Preamble flags.
    ///
    /// Defaults to the flags in the existing preamble, or 0.
    #[arg(long, value_name = "FLAGS", value_parser = parse_u32)]
    flags: Option<u32>,

    /// Directory for standalone signature block copies.
    #[arg(long, value_name = "DIR", value_parser, requires = "loem_id")]
    loem_dir: Option<PathBuf>,

    /// Identifier for standalone signature block copies.
    ///
    /// If specified, the new signature blocks are also written to
    /// vblock_A.<ID> and vblock_B.<ID>.
    #[arg(long, value_name = "ID")]
    loem_id: Option<String>,

    /// Path to cbfstool.
    #[arg(long, value_name = "PROGRAM", value_parser, default_value = "cbfstool")]
    cbfstool: PathBuf,
}

#[derive(Debug, Subcommand)]
enum BiosCommand {
    Show(ShowCli),
    Sign(SignCli),
}

/// Show or re-sign verified boot BIOS images.
#[derive(Debug, Parser)]
pub struct BiosCli {
    #[command(subcommand)]
    command: BiosCommand,
}
