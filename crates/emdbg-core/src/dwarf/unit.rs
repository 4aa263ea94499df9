//! Unit headers and the compilation unit table.

use gimli::constants as dw;
use gimli::{DwLang, DwTag, DwUt};

use super::form::{Encoding, FormValue};
use super::ranges::AddressRange;
use super::reader::Reader;
use super::DwarfData;
use crate::error::{EmdbgError, EmdbgResult};

/// Decoded unit header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHeader
{
    /// Offset of the header in the shared `.debug_info`/`.debug_types` space
    pub offset: u32,
    /// One past the last byte of the unit
    pub end: u32,
    pub version: u16,
    pub unit_type: DwUt,
    pub abbrev_offset: u32,
    pub address_size: u8,
    /// Offset of the unit's first DIE
    pub first_die_offset: u32,
    pub type_signature: Option<u64>,
    /// Type DIE offset relative to `offset`
    pub type_offset: Option<u32>,
    /// Whether the unit lives in `.debug_types`
    pub is_type_unit_section: bool,
}

impl UnitHeader
{
    pub fn encoding(&self) -> Encoding
    {
        Encoding {
            version: self.version,
            address_size: self.address_size,
        }
    }

    /// Decode the header at the reader position
    ///
    /// `bias` is added to every offset so `.debug_types` units land after
    /// `.debug_info`.
    pub fn parse(reader: &mut Reader<'_>, bias: u32, in_types_section: bool) -> EmdbgResult<Self>
    {
        let local_offset = reader.offset();
        let unit_length = reader.u32()?;
        if unit_length == 0xffff_ffff {
            return Err(EmdbgError::Dwarf64Unsupported(local_offset));
        }
        if unit_length >= 0xffff_fff0 {
            return Err(reader.malformed(format!("reserved unit length 0x{unit_length:x}")));
        }
        let local_end = reader.offset() + unit_length as usize;
        let mut body = reader.truncated(unit_length as usize)?;

        let version = body.u16()?;
        if !(2..=5).contains(&version) {
            return Err(EmdbgError::UnsupportedDwarfVersion(version));
        }

        let (unit_type, abbrev_offset, address_size) = if version >= 5 {
            let unit_type = DwUt(body.u8()?);
            let address_size = body.u8()?;
            let abbrev_offset = body.u32()?;
            (unit_type, abbrev_offset, address_size)
        } else {
            let abbrev_offset = body.u32()?;
            let address_size = body.u8()?;
            let unit_type = if in_types_section {
                dw::DW_UT_type
            } else {
                dw::DW_UT_compile
            };
            (unit_type, abbrev_offset, address_size)
        };
        if address_size != 4 {
            return Err(EmdbgError::UnsupportedAddressSize(address_size));
        }

        let mut type_signature = None;
        let mut type_offset = None;
        match unit_type {
            dw::DW_UT_type | dw::DW_UT_split_type => {
                type_signature = Some(body.u64()?);
                type_offset = Some(body.u32()?);
            }
            dw::DW_UT_skeleton | dw::DW_UT_split_compile => {
                body.u64()?;
            }
            dw::DW_UT_compile | dw::DW_UT_partial => {}
            other => return Err(body.malformed(format!("unknown unit type {other}"))),
        }

        let header = Self {
            offset: local_offset as u32 + bias,
            end: local_end as u32 + bias,
            version,
            unit_type,
            abbrev_offset,
            address_size,
            first_die_offset: body.offset() as u32 + bias,
            type_signature,
            type_offset,
            is_type_unit_section: in_types_section,
        };
        reader.seek(local_end);
        Ok(header)
    }
}

/// Every unit header in a section
pub(crate) fn parse_unit_headers(
    section: &'static str,
    data: &[u8],
    bias: u32,
    in_types_section: bool,
) -> EmdbgResult<Vec<UnitHeader>>
{
    let mut reader = Reader::new(section, data);
    let mut headers = Vec::new();
    while !reader.is_empty() {
        headers.push(UnitHeader::parse(&mut reader, bias, in_types_section)?);
    }
    Ok(headers)
}

/// Unit attributes that other sections are decoded relative to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitBases
{
    pub version: u16,
    pub address_size: u8,
    /// `DW_AT_low_pc` of the unit DIE; base for legacy range and location lists
    pub base_address: Option<u32>,
    pub str_offsets_base: Option<u32>,
    pub addr_base: Option<u32>,
    pub rnglists_base: Option<u32>,
    pub loclists_base: Option<u32>,
}

/// Summary of one unit, built once at load time
#[derive(Debug, Clone)]
pub struct CompilationUnitFingerprint
{
    pub header: UnitHeader,
    /// Tag of the unit DIE (`DW_TAG_compile_unit`, `DW_TAG_type_unit`, ...)
    pub tag: DwTag,
    pub name: Option<String>,
    pub compilation_directory: Option<String>,
    pub producer: Option<String>,
    pub language: Option<DwLang>,
    pub statement_list_offset: Option<u32>,
    pub bases: UnitBases,
    pub ranges: AddressRange,
}

impl CompilationUnitFingerprint
{
    pub fn cu_header_offset(&self) -> u32
    {
        self.header.offset
    }

    /// Inclusive start of the unit's DIE offset interval
    pub fn debug_info_start_offset(&self) -> u32
    {
        self.header.offset
    }

    /// Exclusive end of the unit's DIE offset interval
    pub fn debug_info_end_offset(&self) -> u32
    {
        self.header.end
    }

    pub fn contains_die_offset(&self, offset: u32) -> bool
    {
        (self.header.offset..self.header.end).contains(&offset)
    }

    pub fn is_type_unit(&self) -> bool
    {
        self.header.type_signature.is_some()
    }

    pub fn encoding(&self) -> Encoding
    {
        self.header.encoding()
    }
}

impl<'a> DwarfData<'a>
{
    /// The compilation unit table, ordered by header offset
    pub fn units(&self) -> &[CompilationUnitFingerprint]
    {
        &self.units
    }

    pub fn unit(&self, index: usize) -> Option<&CompilationUnitFingerprint>
    {
        self.units.get(index)
    }

    /// Index of the unit whose address ranges contain `address`
    ///
    /// The most recent hit is cached; consecutive queries in one function
    /// skip the linear scan.
    pub fn cu_fingerprint_index_for_address(&self, address: u32) -> Option<usize>
    {
        if let Some(index) = self.address_cache.get() {
            if self.units.get(index).is_some_and(|unit| unit.ranges.contains(address)) {
                return Some(index);
            }
        }
        let index = self
            .units
            .iter()
            .position(|unit| !unit.is_type_unit() && unit.ranges.contains(address))?;
        self.address_cache.set(Some(index));
        Some(index)
    }

    /// Index of the unit whose offset interval contains `offset`
    pub fn cu_fingerprint_index_for_die_offset(&self, offset: u32) -> Option<usize>
    {
        if let Some(index) = self.die_offset_cache.get() {
            if self.units.get(index).is_some_and(|unit| unit.contains_die_offset(offset)) {
                return Some(index);
            }
        }
        let candidate = self
            .units
            .partition_point(|unit| unit.header.offset <= offset)
            .checked_sub(1)?;
        if !self.units[candidate].contains_die_offset(offset) {
            return None;
        }
        self.die_offset_cache.set(Some(candidate));
        Some(candidate)
    }

    pub fn unit_for_die_offset(&self, offset: u32) -> EmdbgResult<&CompilationUnitFingerprint>
    {
        self.cu_fingerprint_index_for_die_offset(offset)
            .map(|index| &self.units[index])
            .ok_or(EmdbgError::NotADie(offset))
    }

    pub fn unit_for_address(&self, address: u32) -> Option<&CompilationUnitFingerprint>
    {
        self.cu_fingerprint_index_for_address(address)
            .map(|index| &self.units[index])
    }

    /// Unit whose header starts exactly at `offset`
    pub fn unit_by_header_offset(&self, offset: u32) -> Option<&CompilationUnitFingerprint>
    {
        self.units
            .binary_search_by_key(&offset, |unit| unit.header.offset)
            .ok()
            .map(|index| &self.units[index])
    }

    pub(crate) fn build_unit_fingerprint(&self, header: UnitHeader) -> EmdbgResult<CompilationUnitFingerprint>
    {
        let mut bases = UnitBases {
            version: header.version,
            address_size: header.address_size,
            ..UnitBases::default()
        };
        let mut unit = CompilationUnitFingerprint {
            tag: dw::DW_TAG_null,
            name: None,
            compilation_directory: None,
            producer: None,
            language: None,
            statement_list_offset: None,
            bases,
            ranges: AddressRange::default(),
            header,
        };

        let first = unit.header.first_die_offset;
        if first >= unit.header.end || self.fingerprint_index(first).is_err() {
            tracing::warn!(offset = unit.header.offset, "Unit has no root DIE");
            return Ok(unit);
        }
        unit.tag = self.abbreviation_for_die(first)?.tag;
        let attributes = self.read_attributes_with(unit.header.encoding(), first)?;

        for attribute in &attributes {
            match attribute.name {
                dw::DW_AT_str_offsets_base => bases.str_offsets_base = attribute.value.as_section_offset(),
                dw::DW_AT_addr_base | dw::DW_AT_GNU_addr_base => bases.addr_base = attribute.value.as_section_offset(),
                dw::DW_AT_rnglists_base => bases.rnglists_base = attribute.value.as_section_offset(),
                dw::DW_AT_loclists_base => bases.loclists_base = attribute.value.as_section_offset(),
                _ => {}
            }
        }

        let mut low_pc = None;
        let mut high_pc = None;
        let mut ranges = None;
        for attribute in &attributes {
            let value = attribute.value;
            match attribute.name {
                dw::DW_AT_name => unit.name = self.resolve_string(&value, &bases)?.map(str::to_owned),
                dw::DW_AT_comp_dir => {
                    unit.compilation_directory = self.resolve_string(&value, &bases)?.map(str::to_owned);
                }
                dw::DW_AT_producer => unit.producer = self.resolve_string(&value, &bases)?.map(str::to_owned),
                dw::DW_AT_language => {
                    unit.language = value.as_constant().and_then(|v| u16::try_from(v).ok()).map(DwLang);
                }
                dw::DW_AT_stmt_list => unit.statement_list_offset = value.as_section_offset(),
                dw::DW_AT_low_pc => low_pc = self.resolve_address(&value, &bases)?,
                dw::DW_AT_high_pc => high_pc = Some(value),
                dw::DW_AT_ranges => ranges = Some(value),
                _ => {}
            }
        }

        bases.base_address = low_pc;
        unit.ranges = if let Some(value) = ranges {
            self.range_list(&value, &bases)?
        } else {
            match (low_pc, high_pc) {
                (Some(low), Some(high)) => self.low_high_range(low, &high, &bases)?,
                _ => AddressRange::default(),
            }
        };
        unit.bases = bases;

        tracing::trace!(
            offset = unit.header.offset,
            version = unit.header.version,
            name = unit.name.as_deref().unwrap_or("<unnamed>"),
            "Indexed compilation unit"
        );
        Ok(unit)
    }

    /// Resolve any string-class attribute value
    pub fn resolve_string(&self, value: &FormValue<'a>, bases: &UnitBases) -> EmdbgResult<Option<&'a str>>
    {
        use super::reader::string_at;

        let text = match *value {
            FormValue::String(text) => text,
            FormValue::StrOffset(offset) => string_at(".debug_str", self.sections.debug_str, offset as usize)?,
            FormValue::LineStrOffset(offset) => {
                string_at(".debug_line_str", self.sections.debug_line_str, offset as usize)?
            }
            FormValue::StrIndex(index) => {
                let base = u64::from(bases.str_offsets_base.unwrap_or(0));
                let entry = index
                    .checked_mul(4)
                    .and_then(|size| size.checked_add(base))
                    .and_then(|entry| usize::try_from(entry).ok())
                    .ok_or_else(|| EmdbgError::malformed(".debug_str_offsets", 0, "string index overflow"))?;
                let offset = Reader::at(".debug_str_offsets", self.sections.debug_str_offsets, entry).u32()?;
                string_at(".debug_str", self.sections.debug_str, offset as usize)?
            }
            _ => return Ok(None),
        };
        Ok(Some(text))
    }
}
