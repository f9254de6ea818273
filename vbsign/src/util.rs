// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsStr,
    fmt,
    path::Path,
};

use bstr::ByteSlice;

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes(pub u64);

impl fmt::Debug for NumBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 1 {
            write!(f, "<{} byte>", self.0)
        } else {
            write!(f, "<{} bytes>", self.0)
        }
    }
}

/// A string that is formatted with [`fmt::Debug`] when the value it was
/// created from is only useful for debugging (eg. a [`std::process::Command`]).
#[derive(Clone, PartialEq, Eq)]
pub struct DebugString(String);

impl DebugString {
    pub fn new(value: impl fmt::Debug) -> Self {
        Self(format!("{value:?}"))
    }
}

impl fmt::Debug for DebugString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Return the bytes of a fixed-width, possibly NULL-terminated string field up
/// to (but not including) the first NULL byte.
pub fn until_nul(buf: &[u8]) -> &[u8] {
    match buf.find_byte(0) {
        Some(n) => &buf[..n],
        None => buf,
    }
}

/// Get the non-empty parent of a path. If the path has no parent in the string,
/// then `.` is returned. This does not perform any filesystem operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            return parent;
        }
    }

    Path::new(".")
}

/// Check that a name refers to a single path component and thus cannot cause
/// directory traversals.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && Path::new(name).file_name() == Some(OsStr::new(name))
}
