// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Read-only description of every region of a BIOS image.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::{
    bios::{
        AreaRecord, AreaTable, BiosComponent, Error, KeyInfo, Slot,
        gbb::{self, GbbReport},
        serialize_error,
    },
    format::vb2::{self, Keyblock, PackedKey},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SignatureCheck {
    Valid,
    Invalid,
    /// There was no key to check against.
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BodyCheck {
    Valid,
    Invalid,
    /// The body signature is a CBFS metadata hash, which can only be checked
    /// by walking the CBFS.
    MetadataHash,
    /// The paired body region is missing or truncated.
    Unavailable,
}

#[derive(Debug, Serialize)]
pub struct BodyReport {
    pub area: AreaRecord,
}

impl BodyReport {
    pub fn is_valid(&self) -> bool {
        self.area.is_valid && self.area.size != 0
    }
}

#[derive(Debug, Serialize)]
pub struct KeyblockInfo {
    pub size: usize,
    pub flags: u32,
    pub signature: SignatureCheck,
    pub data_key: KeyInfo,
}

#[derive(Debug, Serialize)]
pub struct PreambleInfo {
    pub size: usize,
    pub header_version_minor: u32,
    pub firmware_version: u32,
    pub flags: u32,
    pub kernel_subkey: KeyInfo,
    pub body_signature_size: usize,
    pub body_data_size: u32,
    pub body: BodyCheck,
}

#[derive(Debug, Serialize)]
pub struct VblockReport {
    pub area: AreaRecord,
    pub keyblock: Option<KeyblockInfo>,
    pub preamble: Option<PreambleInfo>,
    /// The first problem found.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
}

impl VblockReport {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
            && self
                .keyblock
                .as_ref()
                .is_some_and(|k| k.signature != SignatureCheck::Invalid)
            && self
                .preamble
                .as_ref()
                .is_some_and(|p| p.body != BodyCheck::Invalid)
    }
}

/// A component whose region is not in the FMAP.
#[derive(Debug, Serialize)]
pub struct MissingReport {
    pub component: BiosComponent,
    pub mandatory: bool,
}

#[derive(Debug, Serialize)]
pub enum ComponentReport {
    Missing(MissingReport),
    Gbb(GbbReport),
    Body(BodyReport),
    Vblock(VblockReport),
}

impl ComponentReport {
    pub fn component(&self) -> BiosComponent {
        match self {
            Self::Missing(r) => r.component,
            Self::Gbb(r) => r.area.component,
            Self::Body(r) => r.area.component,
            Self::Vblock(r) => r.area.component,
        }
    }

    /// Whether the component is usable. Optional components that are absent
    /// are not counted as invalid.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Missing(r) => !r.mandatory,
            Self::Gbb(r) => r.is_valid(),
            Self::Body(r) => r.is_valid(),
            Self::Vblock(r) => r.is_valid(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ShowReport {
    /// Number of components that are missing or invalid. Zero means the
    /// image is fully valid.
    pub invalid_count: usize,
    pub components: Vec<ComponentReport>,
}

/// State carried from one component to the next. Components are described in
/// [`BiosComponent::ALL`] order, so the GBB root key and the bodies are known
/// by the time the signature blocks are checked.
struct ShowContext<'a> {
    image: &'a [u8],
    table: &'a AreaTable,
    root_key: Option<PackedKey>,
    body_a: Option<AreaRecord>,
    body_b: Option<AreaRecord>,
}

impl<'a> ShowContext<'a> {
    fn new(image: &'a [u8], table: &'a AreaTable) -> Self {
        Self {
            image,
            table,
            root_key: None,
            body_a: None,
            body_b: None,
        }
    }

    fn body_mut(&mut self, slot: Slot) -> &mut Option<AreaRecord> {
        match slot {
            Slot::A => &mut self.body_a,
            Slot::B => &mut self.body_b,
        }
    }

    fn body(&self, slot: Slot) -> Option<&AreaRecord> {
        match slot {
            Slot::A => self.body_a.as_ref(),
            Slot::B => self.body_b.as_ref(),
        }
    }

    fn describe(&mut self, component: BiosComponent) -> ComponentReport {
        let area = match self.table.resolve(component) {
            Ok(a) => a,
            Err(e) => {
                debug!("{e}");
                return ComponentReport::Missing(MissingReport {
                    component,
                    mandatory: component.is_mandatory(),
                });
            }
        };

        debug!(
            "Showing {component}: offset={:#x}, size={:#x}",
            area.offset, area.size,
        );

        match component {
            BiosComponent::Gbb => {
                let report = gbb::inspect(&area, self.image);
                self.root_key = report.root_key().cloned();
                ComponentReport::Gbb(report)
            }
            BiosComponent::FwMainA | BiosComponent::FwMainB => {
                let slot = if component == BiosComponent::FwMainA {
                    Slot::A
                } else {
                    Slot::B
                };
                let report = BodyReport { area };
                if report.is_valid() {
                    *self.body_mut(slot) = Some(area);
                }
                ComponentReport::Body(report)
            }
            BiosComponent::VblockA => ComponentReport::Vblock(self.describe_vblock(area, Slot::A)),
            BiosComponent::VblockB => ComponentReport::Vblock(self.describe_vblock(area, Slot::B)),
        }
    }

    fn describe_vblock(&self, area: AreaRecord, slot: Slot) -> VblockReport {
        let mut report = VblockReport {
            area,
            keyblock: None,
            preamble: None,
            error: None,
        };
        let chain_error = |e| Error::ChainNotVerifiable(area.component, e);

        let data = area.data(self.image).unwrap_or_default();

        let keyblock = match Keyblock::parse(data) {
            Ok(k) => k,
            Err(e) => {
                report.error = Some(chain_error(e));
                return report;
            }
        };

        let signature = match &self.root_key {
            Some(root_key) => match keyblock.verify_signature(root_key) {
                Ok(()) => SignatureCheck::Valid,
                Err(e) => {
                    debug!("{} keyblock signature is invalid: {e}", area.component);
                    SignatureCheck::Invalid
                }
            },
            None => SignatureCheck::Ignored,
        };

        report.keyblock = Some(KeyblockInfo {
            size: keyblock.size(),
            flags: keyblock.flags,
            signature,
            data_key: KeyInfo::new(&keyblock.data_key),
        });

        if let Err(e) = keyblock.data_key.validate() {
            report.error = Some(chain_error(e));
            return report;
        }

        let preamble = match vb2::FwPreamble::parse(&data[keyblock.size()..], &keyblock.data_key)
        {
            Ok(p) => p,
            Err(e) => {
                report.error = Some(chain_error(e));
                return report;
            }
        };

        let body = match self.body(slot).and_then(|b| b.data(self.image)) {
            None => BodyCheck::Unavailable,
            Some(body) => match preamble
                .body_signature
                .verify(body, &keyblock.data_key, "body")
            {
                Ok(()) => BodyCheck::Valid,
                Err(vb2::Error::HashOnlySignature) => BodyCheck::MetadataHash,
                Err(e) => {
                    debug!("{} body signature is invalid: {e}", area.component);
                    BodyCheck::Invalid
                }
            },
        };

        report.preamble = Some(PreambleInfo {
            size: preamble.size(),
            header_version_minor: preamble.header_version_minor,
            firmware_version: preamble.firmware_version,
            flags: preamble.flags,
            kernel_subkey: KeyInfo::new(&preamble.kernel_subkey),
            body_signature_size: preamble.body_signature.sig.len(),
            body_data_size: preamble.body_signature.data_size,
            body,
        });

        report
    }
}

/// Describe every component of the image. This never fails. Problems are
/// recorded in the per-component reports and counted.
pub fn show(image: &[u8], table: &AreaTable) -> ShowReport {
    let mut context = ShowContext::new(image, table);

    let components = BiosComponent::ALL
        .into_iter()
        .map(|c| context.describe(c))
        .collect::<Vec<_>>();
    let invalid_count = components.iter().filter(|c| !c.is_valid()).count();

    ShowReport {
        invalid_count,
        components,
    }
}

fn label(component: BiosComponent) -> &'static str {
    match component {
        BiosComponent::Gbb => "GBB header:",
        BiosComponent::FwMainA | BiosComponent::FwMainB => "Firmware body:",
        BiosComponent::VblockA | BiosComponent::VblockB => "Signature block:",
    }
}

impl fmt::Display for BodyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.area.component.area_name();

        if !self.is_valid() {
            return writeln!(f, "Firmware body:           {name} <invalid>");
        }

        writeln!(f, "Firmware body:           {name}")?;
        writeln!(f, "  Offset:                {:#010x}", self.area.offset)?;
        writeln!(f, "  Size:                  {:#010x}", self.area.size)
    }
}

impl fmt::Display for VblockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.area.component.area_name();

        if self.is_valid() {
            writeln!(f, "Signature block:         {name}")?;
        } else {
            writeln!(f, "Signature block:         {name} <invalid>")?;
        }

        if let Some(keyblock) = &self.keyblock {
            writeln!(f, "  Keyblock:")?;
            writeln!(f, "    Size:                {:#x}", keyblock.size)?;
            writeln!(
                f,
                "    Signature:           {}",
                match keyblock.signature {
                    SignatureCheck::Valid => "valid",
                    SignatureCheck::Invalid => "<invalid>",
                    SignatureCheck::Ignored => "ignored",
                },
            )?;
            writeln!(f, "    Flags:               {:#x}", keyblock.flags)?;
            writeln!(f, "    Data key:")?;
            keyblock.data_key.write(f, "      ")?;
        }

        if let Some(preamble) = &self.preamble {
            writeln!(f, "  Firmware Preamble:")?;
            writeln!(f, "    Size:                {:#x}", preamble.size)?;
            writeln!(
                f,
                "    Header version:      {}.{}",
                vb2::FW_PREAMBLE_VERSION_MAJOR,
                preamble.header_version_minor,
            )?;
            writeln!(f, "    Firmware version:    {}", preamble.firmware_version)?;
            writeln!(f, "    Preamble flags:      {:#x}", preamble.flags)?;
            writeln!(f, "    Kernel key:")?;
            preamble.kernel_subkey.write(f, "      ")?;
            writeln!(
                f,
                "    Body signature:      {:#x} bytes over {:#x} bytes",
                preamble.body_signature_size, preamble.body_data_size,
            )?;
            writeln!(
                f,
                "  Body verification:     {}",
                match preamble.body {
                    BodyCheck::Valid => "valid",
                    BodyCheck::Invalid => "<invalid>",
                    BodyCheck::MetadataHash => "skipped (CBFS metadata hash)",
                    BodyCheck::Unavailable => "skipped (no firmware body)",
                },
            )?;
        }

        if let Some(e) = &self.error {
            writeln!(f, "  Error:                 {}", super::error_chain(e))?;
        }

        Ok(())
    }
}

impl fmt::Display for ComponentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(r) => {
                let suffix = if r.mandatory { "<missing>" } else { "(not present)" };
                writeln!(f, "{:<25}{} {suffix}", label(r.component), r.component)
            }
            Self::Gbb(r) => write!(f, "{r}"),
            Self::Body(r) => write!(f, "{r}"),
            Self::Vblock(r) => write!(f, "{r}"),
        }
    }
}

impl fmt::Display for ShowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            write!(f, "{component}")?;
        }

        if self.invalid_count == 0 {
            writeln!(f, "All components are valid")
        } else {
            writeln!(f, "Invalid components: {}", self.invalid_count)
        }
    }
}
