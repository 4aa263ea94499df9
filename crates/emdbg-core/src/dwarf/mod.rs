//! # DWARF Debug Information
//!
//! Decoding and indexing of the DWARF sections of an embedded ARM image.
//!
//! [`DwarfData`] borrows the raw section bytes and, at construction, builds
//! two indexes that every later query relies on:
//!
//! - the **DIE fingerprint index**: one `(DIE offset, abbreviation offset)`
//!   pair per entry of `.debug_info` and `.debug_types`, sorted by offset and
//!   including null entries, so any DIE's abbreviation is one binary search
//!   away and tree shape can be recovered without re-decoding attributes;
//! - the **compilation unit table**: one [`CompilationUnitFingerprint`] per
//!   unit with its header, base attributes and address ranges.
//!
//! `.debug_types` offsets are biased by the length of `.debug_info`, so the
//! two sections share a single offset space.
//!
//! ## Supported input
//!
//! - DWARF versions 2 through 5, 32-bit format only
//! - 4-byte addresses, little-endian
//! - `.debug_frame` CIE versions 1, 3 and 4
//!
//! ## Example
//!
//! ```rust
//! use emdbg_core::dwarf::{DebugSections, DwarfData};
//!
//! let dwarf = DwarfData::new(DebugSections::default()).unwrap();
//! assert!(dwarf.units().is_empty());
//! ```

use std::cell::Cell;
use std::collections::HashMap;

pub mod abbrev;
pub mod context;
pub mod die;
pub mod expression;
pub mod form;
pub mod frame;
pub mod line;
pub mod ranges;
pub mod reader;
pub mod render;
pub mod types;
pub mod unit;

pub use abbrev::{Abbreviation, AbbreviationTable, AttributeSpec};
pub use context::{DataObject, ExecutionContext};
pub use die::{Attribute, Die, DieFingerprint, NULL_DIE};
pub use expression::{CompileMode, ExpressionCompiler};
pub use form::{Encoding, FormValue};
pub use frame::DwarfUnwinder;
pub use line::{LineLookup, LineProgram, LineState, SourceCoordinates};
pub use ranges::{AddressRange, LocationListEntry};
pub use render::{DataNode, RECURSION_MARKER};
pub use types::{ArrayDimension, DwarfTypeNode, TypeReader};
pub use unit::{CompilationUnitFingerprint, UnitBases, UnitHeader};

use crate::error::{EmdbgError, EmdbgResult};

/// Raw DWARF sections of one image
///
/// Missing sections are left empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugSections<'a>
{
    pub debug_info: &'a [u8],
    pub debug_types: &'a [u8],
    pub debug_abbrev: &'a [u8],
    pub debug_str: &'a [u8],
    pub debug_str_offsets: &'a [u8],
    pub debug_line: &'a [u8],
    pub debug_line_str: &'a [u8],
    pub debug_addr: &'a [u8],
    pub debug_ranges: &'a [u8],
    pub debug_rnglists: &'a [u8],
    pub debug_loc: &'a [u8],
    pub debug_loclists: &'a [u8],
    pub debug_frame: &'a [u8],
}

impl<'a> DebugSections<'a>
{
    /// Section names in ELF spelling, for loaders
    pub const NAMES: [&'static str; 13] = [
        ".debug_info",
        ".debug_types",
        ".debug_abbrev",
        ".debug_str",
        ".debug_str_offsets",
        ".debug_line",
        ".debug_line_str",
        ".debug_addr",
        ".debug_ranges",
        ".debug_rnglists",
        ".debug_loc",
        ".debug_loclists",
        ".debug_frame",
    ];

    /// Build from a lookup by ELF section name
    pub fn from_lookup(mut lookup: impl FnMut(&'static str) -> Option<&'a [u8]>) -> Self
    {
        let mut get = |name| lookup(name).unwrap_or(&[]);
        Self {
            debug_info: get(".debug_info"),
            debug_types: get(".debug_types"),
            debug_abbrev: get(".debug_abbrev"),
            debug_str: get(".debug_str"),
            debug_str_offsets: get(".debug_str_offsets"),
            debug_line: get(".debug_line"),
            debug_line_str: get(".debug_line_str"),
            debug_addr: get(".debug_addr"),
            debug_ranges: get(".debug_ranges"),
            debug_rnglists: get(".debug_rnglists"),
            debug_loc: get(".debug_loc"),
            debug_loclists: get(".debug_loclists"),
            debug_frame: get(".debug_frame"),
        }
    }
}

/// Indexed DWARF data for one image
///
/// All queries take `&self`. The only interior mutability is the pair of
/// one-slot unit lookup caches, so a `DwarfData` is not `Sync`.
#[derive(Debug)]
pub struct DwarfData<'a>
{
    sections: DebugSections<'a>,
    abbreviations: HashMap<u32, Abbreviation>,
    fingerprints: Vec<DieFingerprint>,
    units: Vec<CompilationUnitFingerprint>,
    type_signatures: HashMap<u64, u32>,
    unwinder: DwarfUnwinder<'a>,
    address_cache: Cell<Option<usize>>,
    die_offset_cache: Cell<Option<usize>>,
}

impl<'a> DwarfData<'a>
{
    /// Decode unit headers, abbreviation tables and the fingerprint index
    ///
    /// ## Errors
    ///
    /// Fails on the first unit that cannot be decoded: truncated sections,
    /// 64-bit DWARF, versions outside 2..=5, address sizes other than 4,
    /// unknown forms or missing abbreviation codes.
    pub fn new(sections: DebugSections<'a>) -> EmdbgResult<Self>
    {
        let types_bias = u32::try_from(sections.debug_info.len())
            .map_err(|_| EmdbgError::malformed(".debug_info", 0, "section larger than 4 GiB"))?;

        let mut headers = unit::parse_unit_headers(".debug_info", sections.debug_info, 0, false)?;
        headers.extend(unit::parse_unit_headers(
            ".debug_types",
            sections.debug_types,
            types_bias,
            true,
        )?);

        let mut tables: HashMap<u32, AbbreviationTable> = HashMap::new();
        let mut abbreviations = HashMap::new();
        for header in &headers {
            if tables.contains_key(&header.abbrev_offset) {
                continue;
            }
            let table = AbbreviationTable::parse(sections.debug_abbrev, header.abbrev_offset)?;
            for abbreviation in table.iter() {
                abbreviations.insert(abbreviation.offset, abbreviation.clone());
            }
            tables.insert(header.abbrev_offset, table);
        }

        let mut fingerprints = Vec::new();
        for header in &headers {
            let table = tables
                .get(&header.abbrev_offset)
                .ok_or(EmdbgError::AbbreviationNotFound {
                    code: 0,
                    table: header.abbrev_offset,
                })?;
            let (section, data, bias) = if header.is_type_unit_section {
                (".debug_types", sections.debug_types, types_bias)
            } else {
                (".debug_info", sections.debug_info, 0)
            };
            die::scan_unit(section, data, bias, header, table, &mut fingerprints)?;
        }

        let mut dwarf = Self {
            sections,
            abbreviations,
            fingerprints,
            units: Vec::with_capacity(headers.len()),
            type_signatures: HashMap::new(),
            unwinder: DwarfUnwinder::new(sections.debug_frame)?,
            address_cache: Cell::new(None),
            die_offset_cache: Cell::new(None),
        };

        let mut units = Vec::with_capacity(headers.len());
        for header in headers {
            units.push(dwarf.build_unit_fingerprint(header)?);
        }
        for unit in &units {
            if let (Some(signature), Some(type_offset)) = (unit.header.type_signature, unit.header.type_offset) {
                dwarf.type_signatures.insert(signature, unit.header.offset + type_offset);
            }
        }
        dwarf.units = units;

        tracing::debug!(
            units = dwarf.units.len(),
            dies = dwarf.fingerprints.len(),
            abbreviations = dwarf.abbreviations.len(),
            "Indexed DWARF sections"
        );
        Ok(dwarf)
    }

    pub fn sections(&self) -> &DebugSections<'a>
    {
        &self.sections
    }

    /// Call-frame unwinder over `.debug_frame`
    pub fn unwinder(&self) -> &DwarfUnwinder<'a>
    {
        &self.unwinder
    }

    /// Offset of the first `.debug_types` byte in the shared offset space
    pub fn types_bias(&self) -> u32
    {
        self.sections.debug_info.len() as u32
    }

    /// Cursor positioned at a (possibly biased) DIE offset
    pub(crate) fn info_reader(&self, offset: u32) -> reader::Reader<'a>
    {
        let offset = offset as usize;
        let info_len = self.sections.debug_info.len();
        if offset < info_len {
            reader::Reader::at(".debug_info", self.sections.debug_info, offset)
        } else {
            reader::Reader::at(".debug_types", self.sections.debug_types, offset - info_len)
        }
    }

    pub(crate) fn abbreviation_at(&self, abbrev_offset: u32) -> EmdbgResult<&Abbreviation>
    {
        self.abbreviations
            .get(&abbrev_offset)
            .ok_or(EmdbgError::AbbreviationNotFound {
                code: 0,
                table: abbrev_offset,
            })
    }

    /// DIE offset of the type described by a `.debug_types` signature
    pub fn type_unit_die(&self, signature: u64) -> Option<u32>
    {
        self.type_signatures.get(&signature).copied()
    }
}
