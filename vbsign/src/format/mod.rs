// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod fmap;
pub mod gbb;
pub mod vb2;
