//! # DIE Fingerprint Index
//!
//! Random access to debugging information entries.
//!
//! The fingerprint vector holds one entry per DIE in preorder, null entries
//! included, sorted by offset. Because every fingerprint names its
//! abbreviation, a DIE's tag and `has_children` flag come from one binary
//! search, and tree shape falls out of walking the vector:
//!
//! - a DIE with children is followed by its children and then a null entry
//! - a DIE without children is followed directly by its next sibling
//!
//! Attribute values are only decoded when a caller asks for them.

use gimli::constants as dw;
use gimli::{DwAt, DwTag};

use super::abbrev::{Abbreviation, AbbreviationTable};
use super::form::{read_form, skip_form, Encoding, FormValue};
use super::reader::Reader;
use super::unit::UnitHeader;
use super::DwarfData;
use crate::error::{EmdbgError, EmdbgResult};

/// Abbreviation offset recorded for null entries
pub const NULL_DIE: u32 = u32::MAX;

/// `(DIE offset, abbreviation offset)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DieFingerprint
{
    pub offset: u32,
    /// Offset of the abbreviation in `.debug_abbrev`, or [`NULL_DIE`]
    pub abbrev_offset: u32,
}

impl DieFingerprint
{
    pub fn is_null(&self) -> bool
    {
        self.abbrev_offset == NULL_DIE
    }
}

/// A DIE and, optionally, its subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Die
{
    pub tag: DwTag,
    pub offset: u32,
    pub abbrev_offset: u32,
    pub has_children: bool,
    /// Populated by [`DwarfData::debug_tree_of_die`] up to the requested depth
    pub children: Vec<Die>,
}

impl Die
{
    /// Number of DIEs in this tree, the root included
    pub fn count(&self) -> usize
    {
        1 + self.children.iter().map(Die::count).sum::<usize>()
    }

    /// Direct children with the given tag
    pub fn children_with_tag(&self, tag: DwTag) -> impl Iterator<Item = &Die>
    {
        self.children.iter().filter(move |child| child.tag == tag)
    }
}

/// One decoded attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute<'a>
{
    pub name: DwAt,
    pub value: FormValue<'a>,
}

/// Append the fingerprints of one unit
pub(crate) fn scan_unit(
    section: &'static str,
    data: &[u8],
    bias: u32,
    header: &UnitHeader,
    table: &AbbreviationTable,
    out: &mut Vec<DieFingerprint>,
) -> EmdbgResult<()>
{
    let start = (header.first_die_offset - bias) as usize;
    let end = (header.end - bias) as usize;
    let mut reader = Reader::at(section, data, start).truncated(end.saturating_sub(start))?;
    let encoding = header.encoding();

    while !reader.is_empty() {
        let offset = reader.offset() as u32 + bias;
        let code = reader.uleb128()?;
        if code == 0 {
            out.push(DieFingerprint {
                offset,
                abbrev_offset: NULL_DIE,
            });
            continue;
        }
        let abbreviation = table.get(code)?;
        out.push(DieFingerprint {
            offset,
            abbrev_offset: abbreviation.offset,
        });
        for spec in &abbreviation.attributes {
            skip_form(&mut reader, spec.form, encoding)?;
        }
    }
    Ok(())
}

impl<'a> DwarfData<'a>
{
    /// The full fingerprint index
    pub fn fingerprints(&self) -> &[DieFingerprint]
    {
        &self.fingerprints
    }

    /// Position of `offset` in the index, null entries included
    fn fingerprint_position(&self, offset: u32) -> Option<usize>
    {
        self.fingerprints
            .binary_search_by_key(&offset, |fingerprint| fingerprint.offset)
            .ok()
    }

    /// Position of the non-null DIE at `offset`
    pub(crate) fn fingerprint_index(&self, offset: u32) -> EmdbgResult<usize>
    {
        match self.fingerprint_position(offset) {
            Some(index) if !self.fingerprints[index].is_null() => Ok(index),
            _ => Err(EmdbgError::NotADie(offset)),
        }
    }

    pub fn abbreviation_for_die(&self, offset: u32) -> EmdbgResult<&Abbreviation>
    {
        let index = self.fingerprint_index(offset)?;
        self.abbreviation_at(self.fingerprints[index].abbrev_offset)
    }

    /// The DIE at `offset`, without children
    ///
    /// ## Errors
    ///
    /// `NotADie` if `offset` is not in the index or names a null entry.
    pub fn die_for_offset(&self, offset: u32) -> EmdbgResult<Die>
    {
        let index = self.fingerprint_index(offset)?;
        self.die_at(index)
    }

    fn die_at(&self, index: usize) -> EmdbgResult<Die>
    {
        let fingerprint = self.fingerprints[index];
        let abbreviation = self.abbreviation_at(fingerprint.abbrev_offset)?;
        Ok(Die {
            tag: abbreviation.tag,
            offset: fingerprint.offset,
            abbrev_offset: fingerprint.abbrev_offset,
            has_children: abbreviation.has_children,
            children: Vec::new(),
        })
    }

    /// The DIE at `offset` with its children, `max_depth` levels deep
    ///
    /// `Some(0)` returns the DIE alone, `Some(1)` adds its direct children,
    /// `None` reads the whole subtree. Truncated subtrees are skipped using
    /// `DW_AT_sibling` when the DIE carries one.
    pub fn debug_tree_of_die(&self, offset: u32, max_depth: Option<usize>) -> EmdbgResult<Die>
    {
        let index = self.fingerprint_index(offset)?;
        self.build_tree(index, 0, max_depth).map(|(die, _)| die)
    }

    fn build_tree(&self, index: usize, depth: usize, max_depth: Option<usize>) -> EmdbgResult<(Die, usize)>
    {
        let mut die = self.die_at(index)?;
        if !die.has_children {
            return Ok((die, index + 1));
        }
        if max_depth.is_some_and(|max| depth >= max) {
            return Ok((die, self.subtree_end(index)?));
        }

        let mut next = index + 1;
        loop {
            let Some(child) = self.fingerprints.get(next) else {
                return Err(EmdbgError::malformed(
                    ".debug_info",
                    die.offset as usize,
                    "children list is not terminated",
                ));
            };
            if child.is_null() {
                return Ok((die, next + 1));
            }
            let (child, after) = self.build_tree(next, depth + 1, max_depth)?;
            die.children.push(child);
            next = after;
        }
    }

    /// Index just past the subtree rooted at `index`
    fn subtree_end(&self, index: usize) -> EmdbgResult<usize>
    {
        let root = self.fingerprints[index];
        let abbreviation = self.abbreviation_at(root.abbrev_offset)?;
        if abbreviation.has_attribute(dw::DW_AT_sibling) {
            if let Some(sibling) = self.reference_attribute(root.offset, dw::DW_AT_sibling)? {
                if let Some(position) = self.fingerprint_position(sibling).filter(|&position| position > index) {
                    return Ok(position);
                }
                tracing::warn!(offset = root.offset, sibling, "Ignoring bogus DW_AT_sibling");
            }
        }

        let mut depth = 0usize;
        let mut position = index;
        loop {
            let fingerprint = self.fingerprints.get(position).ok_or_else(|| {
                EmdbgError::malformed(".debug_info", root.offset as usize, "children list is not terminated")
            })?;
            position += 1;
            if fingerprint.is_null() {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    EmdbgError::malformed(".debug_info", fingerprint.offset as usize, "unbalanced null entry")
                })?;
                if depth == 0 {
                    return Ok(position);
                }
            } else if self.abbreviation_at(fingerprint.abbrev_offset)?.has_children {
                depth += 1;
            } else if depth == 0 {
                return Ok(position);
            }
        }
    }

    /// Offsets of every DIE with `tag`, in offset order
    pub fn dies_with_tag(&self, tag: DwTag) -> Vec<u32>
    {
        self.fingerprints
            .iter()
            .filter(|fingerprint| {
                !fingerprint.is_null()
                    && self
                        .abbreviations
                        .get(&fingerprint.abbrev_offset)
                        .is_some_and(|abbreviation| abbreviation.tag == tag)
            })
            .map(|fingerprint| fingerprint.offset)
            .collect()
    }

    /// All attributes of the DIE at `offset`
    pub fn attributes_of_die(&self, offset: u32) -> EmdbgResult<Vec<Attribute<'a>>>
    {
        let encoding = self.unit_for_die_offset(offset)?.encoding();
        self.read_attributes_with(encoding, offset)
    }

    pub(crate) fn read_attributes_with(&self, encoding: Encoding, offset: u32) -> EmdbgResult<Vec<Attribute<'a>>>
    {
        let abbreviation = self.abbreviation_for_die(offset)?;
        let mut reader = self.info_reader(offset);
        reader.uleb128()?;
        abbreviation
            .attributes
            .iter()
            .map(|spec| {
                read_form(&mut reader, spec.form, encoding, spec.implicit_const).map(|value| Attribute {
                    name: spec.name,
                    value,
                })
            })
            .collect()
    }

    /// The first attribute named `name`, decoding only what precedes it
    pub fn attribute(&self, offset: u32, name: DwAt) -> EmdbgResult<Option<FormValue<'a>>>
    {
        let abbreviation = self.abbreviation_for_die(offset)?;
        if !abbreviation.has_attribute(name) {
            return Ok(None);
        }
        let encoding = self.unit_for_die_offset(offset)?.encoding();
        let mut reader = self.info_reader(offset);
        reader.uleb128()?;
        for spec in &abbreviation.attributes {
            if spec.name == name {
                return read_form(&mut reader, spec.form, encoding, spec.implicit_const).map(Some);
            }
            skip_form(&mut reader, spec.form, encoding)?;
        }
        Ok(None)
    }

    /// Resolve a reference-class value found in the unit at `unit_offset`
    pub fn resolve_reference(&self, value: &FormValue<'a>, unit_offset: u32) -> Option<u32>
    {
        match *value {
            FormValue::TypeSignature(signature) => self.type_unit_die(signature),
            ref other => other.reference(unit_offset),
        }
    }

    /// Absolute DIE offset named by a reference attribute
    pub fn reference_attribute(&self, offset: u32, name: DwAt) -> EmdbgResult<Option<u32>>
    {
        let Some(value) = self.attribute(offset, name)? else {
            return Ok(None);
        };
        let unit_offset = self.unit_for_die_offset(offset)?.cu_header_offset();
        Ok(self.resolve_reference(&value, unit_offset))
    }

    pub fn constant_attribute(&self, offset: u32, name: DwAt) -> EmdbgResult<Option<u64>>
    {
        Ok(self.attribute(offset, name)?.and_then(|value| value.as_constant()))
    }

    pub fn flag_attribute(&self, offset: u32, name: DwAt) -> EmdbgResult<bool>
    {
        Ok(self
            .attribute(offset, name)?
            .and_then(|value| value.as_flag())
            .unwrap_or(false))
    }

    pub fn string_attribute(&self, offset: u32, name: DwAt) -> EmdbgResult<Option<&'a str>>
    {
        let Some(value) = self.attribute(offset, name)? else {
            return Ok(None);
        };
        let bases = self.unit_for_die_offset(offset)?.bases;
        self.resolve_string(&value, &bases)
    }
}
