//! `.debug_abbrev` tables.

use std::collections::HashMap;

use gimli::constants as dw;
use gimli::{DwAt, DwForm, DwTag};

use super::reader::Reader;
use crate::error::{EmdbgError, EmdbgResult};

const SECTION: &str = ".debug_abbrev";

/// One `(attribute, form)` pair of an abbreviation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec
{
    pub name: DwAt,
    pub form: DwForm,
    /// Value carried in the table for `DW_FORM_implicit_const`
    pub implicit_const: Option<i64>,
}

/// A decoded abbreviation declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abbreviation
{
    pub code: u64,
    pub tag: DwTag,
    pub has_children: bool,
    /// Offset of this declaration in `.debug_abbrev`
    pub offset: u32,
    pub attributes: Vec<AttributeSpec>,
}

impl Abbreviation
{
    /// Decode the declaration starting at the reader's position
    ///
    /// Returns `None` for the table terminator (code 0).
    pub fn parse(reader: &mut Reader<'_>) -> EmdbgResult<Option<Self>>
    {
        let offset = reader.offset() as u32;
        let code = reader.uleb128()?;
        if code == 0 {
            return Ok(None);
        }
        let raw_tag = reader.uleb128()?;
        let tag = DwTag(u16::try_from(raw_tag).map_err(|_| reader.malformed(format!("tag 0x{raw_tag:x} out of range")))?);
        let has_children = match reader.u8()? {
            0 => false,
            1 => true,
            other => return Err(reader.malformed(format!("invalid DW_CHILDREN value {other}"))),
        };

        let mut attributes = Vec::new();
        loop {
            let name = reader.uleb128()?;
            let form = reader.uleb128()?;
            if name == 0 && form == 0 {
                break;
            }
            let name = u16::try_from(name).map_err(|_| reader.malformed(format!("attribute 0x{name:x} out of range")))?;
            let form = u16::try_from(form).map_err(|_| reader.malformed(format!("form 0x{form:x} out of range")))?;
            let form = DwForm(form);
            let implicit_const = if form == dw::DW_FORM_implicit_const {
                Some(reader.sleb128()?)
            } else {
                None
            };
            attributes.push(AttributeSpec {
                name: DwAt(name),
                form,
                implicit_const,
            });
        }

        Ok(Some(Self {
            code,
            tag,
            has_children,
            offset,
            attributes,
        }))
    }

    pub fn has_attribute(&self, name: DwAt) -> bool
    {
        self.attributes.iter().any(|spec| spec.name == name)
    }
}

/// One abbreviation table, as referenced by a unit header
#[derive(Debug, Clone, Default)]
pub struct AbbreviationTable
{
    offset: u32,
    by_code: HashMap<u64, Abbreviation>,
}

impl AbbreviationTable
{
    /// Decode the whole table starting at `offset`
    pub fn parse(debug_abbrev: &[u8], offset: u32) -> EmdbgResult<Self>
    {
        let mut reader = Reader::at(SECTION, debug_abbrev, offset as usize);
        let mut by_code = HashMap::new();
        while let Some(abbreviation) = Abbreviation::parse(&mut reader)? {
            if by_code.contains_key(&abbreviation.code) {
                return Err(EmdbgError::malformed(
                    SECTION,
                    abbreviation.offset as usize,
                    format!("duplicate abbreviation code {}", abbreviation.code),
                ));
            }
            by_code.insert(abbreviation.code, abbreviation);
        }
        Ok(Self { offset, by_code })
    }

    pub fn offset(&self) -> u32
    {
        self.offset
    }

    pub fn get(&self, code: u64) -> EmdbgResult<&Abbreviation>
    {
        self.by_code.get(&code).ok_or(EmdbgError::AbbreviationNotFound {
            code,
            table: self.offset,
        })
    }

    pub fn len(&self) -> usize
    {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.by_code.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Abbreviation>
    {
        self.by_code.values()
    }
}
