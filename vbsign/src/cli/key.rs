// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    bios::KeyInfo,
    cli::bios::parse_u32,
    crypto::{self, PassphraseSource, RsaSigningKey},
    format::vb2::{Algorithm, HashAlgorithm, Keyblock, PackedKey},
};

fn get_passphrase_source(group: &PassphraseGroup, key_path: &Path) -> PassphraseSource {
    PassphraseSource::new(
        key_path,
        group.pass_file.as_deref(),
        group.pass_env_var.as_deref(),
    )
}

fn parse_hash_algorithm(value: &str) -> std::result::Result<HashAlgorithm, String> {
    HashAlgorithm::from_name(value).ok_or_else(|| format!("Unknown hash algorithm: {value}"))
}

fn read_packed_key(path: &Path) -> Result<PackedKey> {
    let data = fs::read(path).with_context(|| format!("Failed to read packed key: {path:?}"))?;

    PackedKey::parse(&data).with_context(|| format!("Failed to parse packed key: {path:?}"))
}

fn print_key_info(key: &PackedKey) {
    let info = KeyInfo::new(key);

    println!("Algorithm:   {} {}", info.algorithm, info.algorithm_name);
    println!("Key Version: {}", info.key_version);
    println!("Key sha1sum: {}", info.sha1sum);
}

pub fn key_main(cli: &KeyCli) -> Result<()> {
    match &cli.command {
        KeyCommand::GenerateKey(c) => {
            let source = get_passphrase_source(&c.passphrase, &c.output);
            let private_key = crypto::generate_rsa_key_pair(c.bits, c.exponent)
                .context("Failed to generate RSA keypair")?;

            crypto::write_pem_key_file(&c.output, &private_key, &source)
                .with_context(|| format!("Failed to write private key: {:?}", c.output))?;
        }
        KeyCommand::ExtractVbpubk(c) => {
            let public_key = if let Some(p) = &c.input.key {
                let passphrase = get_passphrase_source(&c.passphrase, p);
                let private_key = crypto::read_pem_key_file(p, &passphrase)
                    .with_context(|| format!("Failed to load key: {p:?}"))?;

                private_key.to_public_key()
            } else if let Some(p) = &c.input.public_key {
                crypto::read_pem_public_key_file(p)
                    .with_context(|| format!("Failed to load public key: {p:?}"))?
            } else {
                unreachable!()
            };

            let algorithm = Algorithm::for_key(&public_key, c.hash)
                .context("Key cannot be used with vboot")?;
            let packed = PackedKey::from_public_key(&public_key, algorithm, c.key_version)
                .context("Failed to pack public key")?;
            let encoded = packed
                .to_bytes()
                .context("Failed to encode packed key")?;

            fs::write(&c.output, encoded)
                .with_context(|| format!("Failed to write packed key: {:?}", c.output))?;

            print_key_info(&packed);
        }
        KeyCommand::DecodeVbpubk(c) => {
            let packed = read_packed_key(&c.key)?;
            let public_key = packed
                .to_public_key()
                .with_context(|| format!("Failed to decode packed key: {:?}", c.key))?;

            crypto::write_pem_public_key_file(&c.output, &public_key)
                .with_context(|| format!("Failed to write public key: {:?}", c.output))?;

            print_key_info(&packed);
        }
        KeyCommand::CreateKeyblock(c) => {
            let data_key = read_packed_key(&c.data_key)?;

            let signer = match &c.signing_key {
                Some(p) => {
                    let source = get_passphrase_source(&c.passphrase, p);
                    let private_key = crypto::read_pem_key_file(p, &source)
                        .with_context(|| format!("Failed to load key: {p:?}"))?;
                    let algorithm = Algorithm::for_key(&private_key.to_public_key(), c.hash)
                        .context("Signing key cannot be used with vboot")?;

                    Some((RsaSigningKey::Internal(private_key), algorithm))
                }
                None => None,
            };

            let keyblock = Keyblock::create(
                &data_key,
                signer.as_ref().map(|(k, a)| (k, *a)),
                c.flags,
            )
            .context("Failed to create keyblock")?;

            fs::write(&c.output, keyblock.as_bytes())
                .with_context(|| format!("Failed to write keyblock: {:?}", c.output))?;
        }
    }

    Ok(())
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct PublicKeyInputGroup {
    /// Path to private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: Option<PathBuf>,

    /// Path to PKCS8-encoded public key.
    #[arg(short, long, value_name = "FILE", value_parser, conflicts_with_all = ["pass_env_var", "pass_file"])]
    public_key: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PassphraseGroup {
    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pass_file: Option<PathBuf>,
}

/// Generate an RSA keypair.
///
/// The output is saved in the standard PKCS8 format.
#[derive(Debug, Parser)]
struct GenerateKeyCli {
    /// Path to output private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Key size in bits.
    #[arg(short, long, value_name = "BITS", default_value_t = 4096)]
    bits: usize,

    /// Public exponent.
    #[arg(short, long, value_name = "NUM", default_value_t = 65537)]
    exponent: u32,

    #[command(flatten)]
    passphrase: PassphraseGroup,
}

/// Convert a private or public key to a vboot packed key.
#[derive(Debug, Parser)]
struct ExtractVbpubkCli {
    /// Path to output packed key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[command(flatten)]
    input: PublicKeyInputGroup,

    #[command(flatten)]
    passphrase: PassphraseGroup,

    /// Hash algorithm that signatures made with the key use.
    #[arg(long, value_name = "HASH", value_parser = parse_hash_algorithm, default_value = "sha256")]
    hash: HashAlgorithm,

    /// Key version.
    #[arg(long, value_name = "NUM", default_value_t = 1)]
    key_version: u32,
}

/// Convert a vboot packed key to a PKCS8-encoded public key.
#[derive(Debug, Parser)]
struct DecodeVbpubkCli {
    /// Path to output PKCS8-encoded public key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to packed key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: PathBuf,
}

/// Create a keyblock for a data key.
///
/// Without --signing-key, the keyblock only contains the integrity hash.
#[derive(Debug, Parser)]
struct CreateKeyblockCli {
    /// Path to output keyblock.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Packed data key to embed.
    #[arg(short, long, value_name = "FILE", value_parser)]
    data_key: PathBuf,

    /// Private key (usually the root key) for signing the keyblock.
    #[arg(short = 'k', long, value_name = "FILE", value_parser)]
    signing_key: Option<PathBuf>,

    #[command(flatten)]
    passphrase: PassphraseGroup,

    /// Hash algorithm for the keyblock signature.
    #[arg(long, value_name = "HASH", value_parser = parse_hash_algorithm, default_value = "sha256")]
    hash: HashAlgorithm,

    /// Keyblock flags.
    #[arg(short, long, value_name = "FLAGS", value_parser = parse_u32, default_value = "0")]
    flags: u32,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    GenerateKey(GenerateKeyCli),
    ExtractVbpubk(ExtractVbpubkCli),
    DecodeVbpubk(DecodeVbpubkCli),
    CreateKeyblock(CreateKeyblockCli),
}

/// Generate and convert keys.
#[derive(Debug, Parser)]
pub struct KeyCli {
    #[command(subcommand)]
    command: KeyCommand,
}
