// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Since vbsign is primarily an application and not a library, the semver
//! versioning covers the CLI only. All Rust APIs can change at any time, even
//! in patch releases.
//!
//! The byte formats live in [`format`] and only know about their own
//! structure. [`bios`] ties them together into operations on whole firmware
//! images.

pub mod bios;
pub mod cli;
pub mod crypto;
pub mod format;
pub mod util;
