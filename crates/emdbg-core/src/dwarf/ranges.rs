//! Address ranges, range lists and location lists.
//!
//! Both the DWARF 2–4 encodings (`.debug_ranges`, `.debug_loc`) and the
//! DWARF 5 encodings (`.debug_rnglists`, `.debug_loclists`, indexed through
//! `.debug_addr`) are decoded here.

use std::ops::Range;

use gimli::constants as dw;
use gimli::{DwLle, DwRle};

use super::form::FormValue;
use super::reader::Reader;
use super::unit::{CompilationUnitFingerprint, UnitBases};
use super::DwarfData;
use crate::error::{EmdbgError, EmdbgResult};

/// Set of half-open address intervals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRange
{
    pub ranges: Vec<Range<u32>>,
}

impl AddressRange
{
    pub fn new(ranges: Vec<Range<u32>>) -> Self
    {
        Self { ranges }
    }

    pub fn from_bounds(low: u32, high: u32) -> Self
    {
        let mut range = Self::default();
        range.push(low..high);
        range
    }

    /// Add an interval; empty intervals are dropped
    pub fn push(&mut self, range: Range<u32>)
    {
        if range.start < range.end {
            self.ranges.push(range);
        }
    }

    pub fn contains(&self, address: u32) -> bool
    {
        self.ranges.iter().any(|range| range.contains(&address))
    }

    pub fn is_empty(&self) -> bool
    {
        self.ranges.is_empty()
    }

    pub fn lowest_address(&self) -> Option<u32>
    {
        self.ranges.iter().map(|range| range.start).min()
    }
}

/// Decode a DWARF 2–4 range list
///
/// Entries are offsets from `base_address` until a base-address selection
/// entry (`start == 0xffffffff`) replaces it. `(0, 0)` ends the list.
pub fn decode_legacy_ranges(debug_ranges: &[u8], offset: u32, base_address: u32) -> EmdbgResult<AddressRange>
{
    let mut reader = Reader::at(".debug_ranges", debug_ranges, offset as usize);
    let mut base = base_address;
    let mut range = AddressRange::default();
    loop {
        let start = reader.u32()?;
        let end = reader.u32()?;
        match (start, end) {
            (0, 0) => return Ok(range),
            (0xffff_ffff, new_base) => base = new_base,
            (start, end) => range.push(base.wrapping_add(start)..base.wrapping_add(end)),
        }
    }
}

/// Decode a DWARF 5 range list
///
/// `address_at` resolves `.debug_addr` indexes for the `*x` entry kinds.
pub fn decode_rnglists(
    debug_rnglists: &[u8],
    offset: u32,
    base_address: u32,
    mut address_at: impl FnMut(u64) -> EmdbgResult<u32>,
) -> EmdbgResult<AddressRange>
{
    let mut reader = Reader::at(".debug_rnglists", debug_rnglists, offset as usize);
    let mut base = base_address;
    let mut range = AddressRange::default();
    loop {
        let kind = DwRle(reader.u8()?);
        match kind {
            dw::DW_RLE_end_of_list => return Ok(range),
            dw::DW_RLE_base_addressx => base = address_at(reader.uleb128()?)?,
            dw::DW_RLE_startx_endx => {
                let start = address_at(reader.uleb128()?)?;
                let end = address_at(reader.uleb128()?)?;
                range.push(start..end);
            }
            dw::DW_RLE_startx_length => {
                let start = address_at(reader.uleb128()?)?;
                let length = reader.uleb128_u32()?;
                range.push(start..start.wrapping_add(length));
            }
            dw::DW_RLE_offset_pair => {
                let start = reader.uleb128_u32()?;
                let end = reader.uleb128_u32()?;
                range.push(base.wrapping_add(start)..base.wrapping_add(end));
            }
            dw::DW_RLE_base_address => base = reader.u32()?,
            dw::DW_RLE_start_end => {
                let start = reader.u32()?;
                let end = reader.u32()?;
                range.push(start..end);
            }
            dw::DW_RLE_start_length => {
                let start = reader.u32()?;
                let length = reader.uleb128_u32()?;
                range.push(start..start.wrapping_add(length));
            }
            other => return Err(reader.malformed(format!("unknown range list entry {other}"))),
        }
    }
}

/// One entry of a location list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationListEntry<'a>
{
    /// Addresses the expression is valid for; `None` for a default location
    pub range: Option<Range<u32>>,
    pub expression: &'a [u8],
}

fn decode_legacy_locations<'a>(debug_loc: &'a [u8], offset: u32, base_address: u32)
    -> EmdbgResult<Vec<LocationListEntry<'a>>>
{
    let mut reader = Reader::at(".debug_loc", debug_loc, offset as usize);
    let mut base = base_address;
    let mut entries = Vec::new();
    loop {
        let start = reader.u32()?;
        let end = reader.u32()?;
        match (start, end) {
            (0, 0) => return Ok(entries),
            (0xffff_ffff, new_base) => base = new_base,
            (start, end) => {
                let length = reader.u16()?;
                let expression = reader.bytes(usize::from(length))?;
                entries.push(LocationListEntry {
                    range: Some(base.wrapping_add(start)..base.wrapping_add(end)),
                    expression,
                });
            }
        }
    }
}

fn decode_loclists<'a>(
    debug_loclists: &'a [u8],
    offset: u32,
    base_address: u32,
    mut address_at: impl FnMut(u64) -> EmdbgResult<u32>,
) -> EmdbgResult<Vec<LocationListEntry<'a>>>
{
    let mut reader = Reader::at(".debug_loclists", debug_loclists, offset as usize);
    let mut base = base_address;
    let mut entries = Vec::new();
    loop {
        let kind = DwLle(reader.u8()?);
        let range = match kind {
            dw::DW_LLE_end_of_list => return Ok(entries),
            dw::DW_LLE_base_addressx => {
                base = address_at(reader.uleb128()?)?;
                continue;
            }
            dw::DW_LLE_base_address => {
                base = reader.u32()?;
                continue;
            }
            dw::DW_LLE_startx_endx => {
                let start = address_at(reader.uleb128()?)?;
                let end = address_at(reader.uleb128()?)?;
                Some(start..end)
            }
            dw::DW_LLE_startx_length => {
                let start = address_at(reader.uleb128()?)?;
                let length = reader.uleb128_u32()?;
                Some(start..start.wrapping_add(length))
            }
            dw::DW_LLE_offset_pair => {
                let start = reader.uleb128_u32()?;
                let end = reader.uleb128_u32()?;
                Some(base.wrapping_add(start)..base.wrapping_add(end))
            }
            dw::DW_LLE_default_location => None,
            dw::DW_LLE_start_end => {
                let start = reader.u32()?;
                let end = reader.u32()?;
                Some(start..end)
            }
            dw::DW_LLE_start_length => {
                let start = reader.u32()?;
                let length = reader.uleb128_u32()?;
                Some(start..start.wrapping_add(length))
            }
            other => return Err(reader.malformed(format!("unknown location list entry {other}"))),
        };
        let length = reader.uleb128()?;
        let length = usize::try_from(length).map_err(|_| reader.malformed("expression length overflow"))?;
        let expression = reader.bytes(length)?;
        entries.push(LocationListEntry { range, expression });
    }
}

impl<'a> DwarfData<'a>
{
    /// Address number `index` of the unit's `.debug_addr` contribution
    pub fn address_at_index(&self, bases: &UnitBases, index: u64) -> EmdbgResult<u32>
    {
        let base = u64::from(bases.addr_base.unwrap_or(0));
        let entry = index
            .checked_mul(u64::from(bases.address_size))
            .and_then(|scaled| scaled.checked_add(base))
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| EmdbgError::malformed(".debug_addr", 0, format!("address index {index} overflows")))?;
        Reader::at(".debug_addr", self.sections.debug_addr, entry).address(bases.address_size)
    }

    /// Address-class value, resolving `DW_FORM_addrx*`
    pub fn resolve_address(&self, value: &FormValue<'a>, bases: &UnitBases) -> EmdbgResult<Option<u32>>
    {
        match *value {
            FormValue::Address(address) => Ok(Some(address)),
            FormValue::AddressIndex(index) => self.address_at_index(bases, index).map(Some),
            _ => Ok(None),
        }
    }

    /// `[low_pc, high_pc)` where `high_pc` is an address or a length
    pub(crate) fn low_high_range(&self, low: u32, high: &FormValue<'a>, bases: &UnitBases) -> EmdbgResult<AddressRange>
    {
        let high = match self.resolve_address(high, bases)? {
            Some(address) => address,
            None => match high.as_constant() {
                Some(length) => low.wrapping_add(length as u32),
                None => return Ok(AddressRange::default()),
            },
        };
        Ok(AddressRange::from_bounds(low, high))
    }

    /// Decode a `DW_AT_ranges` value
    pub fn range_list(&self, value: &FormValue<'a>, bases: &UnitBases) -> EmdbgResult<AddressRange>
    {
        let base_address = bases.base_address.unwrap_or(0);
        let address_at = |index| self.address_at_index(bases, index);
        match *value {
            FormValue::RngListIndex(index) => {
                let offset = self.list_offset_from_index(
                    ".debug_rnglists",
                    self.sections.debug_rnglists,
                    bases.rnglists_base,
                    index,
                )?;
                decode_rnglists(self.sections.debug_rnglists, offset, base_address, address_at)
            }
            ref other => {
                let Some(offset) = other.as_section_offset() else {
                    return Ok(AddressRange::default());
                };
                if bases.version >= 5 {
                    decode_rnglists(self.sections.debug_rnglists, offset, base_address, address_at)
                } else {
                    decode_legacy_ranges(self.sections.debug_ranges, offset, base_address)
                }
            }
        }
    }

    fn list_offset_from_index(
        &self,
        section: &'static str,
        data: &[u8],
        list_base: Option<u32>,
        index: u64,
    ) -> EmdbgResult<u32>
    {
        let base = list_base.unwrap_or(12);
        let entry = usize::try_from(index)
            .ok()
            .and_then(|index| index.checked_mul(4))
            .and_then(|scaled| scaled.checked_add(base as usize))
            .ok_or_else(|| EmdbgError::malformed(section, base as usize, format!("list index {index} overflows")))?;
        let relative = Reader::at(section, data, entry).u32()?;
        Ok(base.wrapping_add(relative))
    }

    /// Address ranges covered by the DIE at `offset`
    ///
    /// Uses `DW_AT_ranges` when present, else `DW_AT_low_pc`/`DW_AT_high_pc`.
    /// A DIE with neither covers nothing.
    pub fn address_range_of_die(&self, offset: u32) -> EmdbgResult<AddressRange>
    {
        let bases = self.unit_for_die_offset(offset)?.bases;
        let mut low = None;
        let mut high = None;
        for attribute in self.attributes_of_die(offset)? {
            match attribute.name {
                dw::DW_AT_ranges => return self.range_list(&attribute.value, &bases),
                dw::DW_AT_low_pc => low = self.resolve_address(&attribute.value, &bases)?,
                dw::DW_AT_high_pc => high = Some(attribute.value),
                _ => {}
            }
        }
        match (low, high) {
            (Some(low), Some(high)) => self.low_high_range(low, &high, &bases),
            (Some(low), None) => Ok(AddressRange::from_bounds(low, low.wrapping_add(1))),
            _ => Ok(AddressRange::default()),
        }
    }

    /// Every entry of the location list a `DW_AT_location`-style value names
    ///
    /// A single expression (`exprloc`/`block`) comes back as one entry with
    /// no range.
    pub fn location_list(
        &self,
        value: &FormValue<'a>,
        unit: &CompilationUnitFingerprint,
    ) -> EmdbgResult<Vec<LocationListEntry<'a>>>
    {
        if let Some(expression) = value.as_block() {
            return Ok(vec![LocationListEntry {
                range: None,
                expression,
            }]);
        }
        let bases = &unit.bases;
        let base_address = bases.base_address.unwrap_or(0);
        let address_at = |index| self.address_at_index(bases, index);
        match *value {
            FormValue::LocListIndex(index) => {
                let offset = self.list_offset_from_index(
                    ".debug_loclists",
                    self.sections.debug_loclists,
                    bases.loclists_base,
                    index,
                )?;
                decode_loclists(self.sections.debug_loclists, offset, base_address, address_at)
            }
            ref other => {
                let Some(offset) = other.as_section_offset() else {
                    return Ok(Vec::new());
                };
                if bases.version >= 5 {
                    decode_loclists(self.sections.debug_loclists, offset, base_address, address_at)
                } else {
                    decode_legacy_locations(self.sections.debug_loc, offset, base_address)
                }
            }
        }
    }

    /// Expression valid at `pc`, if any
    ///
    /// A default location entry applies only when no bounded entry matches.
    pub fn location_expression_for_pc(
        &self,
        value: &FormValue<'a>,
        unit: &CompilationUnitFingerprint,
        pc: u32,
    ) -> EmdbgResult<Option<&'a [u8]>>
    {
        let entries = self.location_list(value, unit)?;
        let mut default = None;
        for entry in entries {
            match entry.range {
                Some(range) if range.contains(&pc) => return Ok(Some(entry.expression)),
                Some(_) => {}
                None => default = default.or(Some(entry.expression)),
            }
        }
        Ok(default)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn words(values: &[u32]) -> Vec<u8>
    {
        values.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    #[test]
    fn test_legacy_ranges_relative_to_base()
    {
        let bytes = words(&[0x100, 0x200, 0x300, 0x400, 0, 0]);
        let range = decode_legacy_ranges(&bytes, 0, 0x1000).unwrap();
        assert_eq!(range.ranges, vec![0x1100..0x1200, 0x1300..0x1400]);
        assert!(range.contains(0x1100));
        assert!(!range.contains(0x1200));
        assert_eq!(range.lowest_address(), Some(0x1100));
    }

    #[test]
    fn test_legacy_ranges_base_selection()
    {
        let bytes = words(&[0xffff_ffff, 0x8000, 0x10, 0x20, 0, 0]);
        let range = decode_legacy_ranges(&bytes, 0, 0x1000).unwrap();
        assert_eq!(range.ranges, vec![0x8010..0x8020]);
    }

    #[test]
    fn test_rnglists_entry_kinds()
    {
        let mut bytes = vec![0x05];
        bytes.extend_from_slice(&0x2000u32.to_le_bytes()); // base_address
        bytes.extend_from_slice(&[0x04, 0x10, 0x20]); // offset_pair
        bytes.extend_from_slice(&[0x03, 0x01, 0x08]); // startx_length
        bytes.push(0x06); // start_end
        bytes.extend_from_slice(&0x3000u32.to_le_bytes());
        bytes.extend_from_slice(&0x3004u32.to_le_bytes());
        bytes.push(0x00);

        let range = decode_rnglists(&bytes, 0, 0, |index| Ok(0x4000 + index as u32 * 0x100)).unwrap();
        assert_eq!(range.ranges, vec![0x2010..0x2020, 0x4100..0x4108, 0x3000..0x3004]);
    }

    #[test]
    fn test_legacy_locations()
    {
        let mut bytes = words(&[0x0, 0x10]);
        bytes.extend_from_slice(&[0x01, 0x00, 0x50]);
        bytes.extend(words(&[0x10, 0x40]));
        bytes.extend_from_slice(&[0x02, 0x00, 0x91, 0x74]);
        bytes.extend(words(&[0, 0]));

        let entries = decode_legacy_locations(&bytes, 0, 0x1000).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].range, Some(0x1000..0x1010));
        assert_eq!(entries[0].expression, &[0x50]);
        assert_eq!(entries[1].expression, &[0x91, 0x74]);
    }

    #[test]
    fn test_loclists_default_location()
    {
        let bytes = [
            0x04, 0x00, 0x04, 0x01, 0x50, // offset_pair 0..4: DW_OP_reg0
            0x05, 0x01, 0x51, // default: DW_OP_reg1
            0x00,
        ];
        let entries = decode_loclists(&bytes, 0, 0x100, |_| Ok(0)).unwrap();
        assert_eq!(entries[0].range, Some(0x100..0x104));
        assert_eq!(entries[1].range, None);
        assert_eq!(entries[1].expression, &[0x51]);
    }
}
