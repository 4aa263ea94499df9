//! Attribute form decoding.
//!
//! [`read_form`] turns the bytes of one attribute into a [`FormValue`];
//! [`skip_form`] advances past them without building a value. Skipping is
//! what the load-time fingerprint scan does for every attribute of every DIE,
//! so fixed-size forms are answered from [`fixed_form_size`] without decoding.
//!
//! Strings, address indexes and list indexes are returned unresolved. The
//! owning [`DwarfData`](super::DwarfData) resolves them against the unit's
//! base attributes.

use gimli::constants as dw;
use gimli::DwForm;

use super::reader::Reader;
use crate::error::{EmdbgError, EmdbgResult};

/// Unit properties that change how forms are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding
{
    pub version: u16,
    pub address_size: u8,
}

impl Encoding
{
    /// Size of a `DW_FORM_ref_addr` value (address sized in DWARF 2)
    fn ref_addr_size(self) -> u8
    {
        if self.version <= 2 {
            self.address_size
        } else {
            4
        }
    }
}

/// Decoded attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormValue<'a>
{
    Address(u32),
    /// Index into `.debug_addr` relative to the unit's `DW_AT_addr_base`
    AddressIndex(u64),
    /// `data1/2/4/8` and `udata`
    Constant(u64),
    /// `sdata` and `implicit_const`
    Signed(i64),
    Flag(bool),
    /// Reference relative to the unit header
    UnitRef(u32),
    /// Reference relative to the start of `.debug_info`
    InfoRef(u32),
    /// Reference into a supplementary object file
    SupRef(u64),
    TypeSignature(u64),
    String(&'a str),
    StrOffset(u32),
    StrIndex(u64),
    LineStrOffset(u32),
    SupStrOffset(u32),
    Block(&'a [u8]),
    Expression(&'a [u8]),
    SecOffset(u32),
    LocListIndex(u64),
    RngListIndex(u64),
    Data16(&'a [u8]),
}

impl<'a> FormValue<'a>
{
    pub fn as_constant(&self) -> Option<u64>
    {
        match *self {
            FormValue::Constant(value) => Some(value),
            FormValue::Signed(value) => Some(value as u64),
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<i64>
    {
        match *self {
            FormValue::Constant(value) => Some(value as i64),
            FormValue::Signed(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool>
    {
        match *self {
            FormValue::Flag(value) => Some(value),
            FormValue::Constant(value) => Some(value != 0),
            _ => None,
        }
    }

    /// Expression or block bytes
    pub fn as_block(&self) -> Option<&'a [u8]>
    {
        match *self {
            FormValue::Block(bytes) | FormValue::Expression(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Section offset; DWARF 2 and 3 encode these as `data4`
    pub fn as_section_offset(&self) -> Option<u32>
    {
        match *self {
            FormValue::SecOffset(offset) => Some(offset),
            FormValue::Constant(offset) => u32::try_from(offset).ok(),
            _ => None,
        }
    }

    /// Absolute `.debug_info` offset of a unit-relative or section reference
    pub fn reference(&self, unit_offset: u32) -> Option<u32>
    {
        match *self {
            FormValue::UnitRef(offset) => unit_offset.checked_add(offset),
            FormValue::InfoRef(offset) => Some(offset),
            _ => None,
        }
    }
}

/// Size of forms whose encoding has a fixed length
pub fn fixed_form_size(form: DwForm, encoding: Encoding) -> Option<usize>
{
    let size = match form {
        dw::DW_FORM_flag_present | dw::DW_FORM_implicit_const => 0,
        dw::DW_FORM_addr => encoding.address_size,
        dw::DW_FORM_data1 | dw::DW_FORM_ref1 | dw::DW_FORM_flag | dw::DW_FORM_strx1 | dw::DW_FORM_addrx1 => 1,
        dw::DW_FORM_data2 | dw::DW_FORM_ref2 | dw::DW_FORM_strx2 | dw::DW_FORM_addrx2 => 2,
        dw::DW_FORM_strx3 | dw::DW_FORM_addrx3 => 3,
        dw::DW_FORM_data4
        | dw::DW_FORM_ref4
        | dw::DW_FORM_strp
        | dw::DW_FORM_line_strp
        | dw::DW_FORM_sec_offset
        | dw::DW_FORM_strp_sup
        | dw::DW_FORM_ref_sup4
        | dw::DW_FORM_strx4
        | dw::DW_FORM_addrx4
        | dw::DW_FORM_GNU_ref_alt
        | dw::DW_FORM_GNU_strp_alt => 4,
        dw::DW_FORM_data8 | dw::DW_FORM_ref8 | dw::DW_FORM_ref_sig8 | dw::DW_FORM_ref_sup8 => 8,
        dw::DW_FORM_data16 => 16,
        dw::DW_FORM_ref_addr => encoding.ref_addr_size(),
        _ => return None,
    };
    Some(usize::from(size))
}

/// Advance `reader` past one attribute value of `form`
pub fn skip_form(reader: &mut Reader<'_>, form: DwForm, encoding: Encoding) -> EmdbgResult<()>
{
    if let Some(size) = fixed_form_size(form, encoding) {
        return reader.skip(size);
    }
    match form {
        dw::DW_FORM_string => reader.cstr().map(|_| ()),
        dw::DW_FORM_block1 => {
            let length = reader.u8()?;
            reader.skip(usize::from(length))
        }
        dw::DW_FORM_block2 => {
            let length = reader.u16()?;
            reader.skip(usize::from(length))
        }
        dw::DW_FORM_block4 => {
            let length = reader.u32()?;
            reader.skip(length as usize)
        }
        dw::DW_FORM_block | dw::DW_FORM_exprloc => {
            let length = reader.uleb128()?;
            reader.skip(usize::try_from(length).map_err(|_| reader.malformed("block length overflow"))?)
        }
        dw::DW_FORM_sdata => reader.sleb128().map(|_| ()),
        dw::DW_FORM_udata
        | dw::DW_FORM_ref_udata
        | dw::DW_FORM_strx
        | dw::DW_FORM_addrx
        | dw::DW_FORM_loclistx
        | dw::DW_FORM_rnglistx
        | dw::DW_FORM_GNU_addr_index
        | dw::DW_FORM_GNU_str_index => reader.uleb128().map(|_| ()),
        dw::DW_FORM_indirect => {
            let actual = indirect_form(reader)?;
            skip_form(reader, actual, encoding)
        }
        other => Err(EmdbgError::UnsupportedForm(other)),
    }
}

fn indirect_form(reader: &mut Reader<'_>) -> EmdbgResult<DwForm>
{
    let raw = reader.uleb128()?;
    let form = u16::try_from(raw).map_err(|_| reader.malformed(format!("indirect form 0x{raw:x} out of range")))?;
    Ok(DwForm(form))
}

fn offset_u32(reader: &Reader<'_>, value: u64) -> EmdbgResult<u32>
{
    u32::try_from(value).map_err(|_| reader.malformed(format!("offset 0x{value:x} exceeds 32 bits")))
}

/// Decode one attribute value of `form`
///
/// `implicit_const` is the value stored in the abbreviation for
/// `DW_FORM_implicit_const`.
pub fn read_form<'a>(
    reader: &mut Reader<'a>,
    form: DwForm,
    encoding: Encoding,
    implicit_const: Option<i64>,
) -> EmdbgResult<FormValue<'a>>
{
    let value = match form {
        dw::DW_FORM_addr => FormValue::Address(reader.address(encoding.address_size)?),
        dw::DW_FORM_addrx | dw::DW_FORM_GNU_addr_index => FormValue::AddressIndex(reader.uleb128()?),
        dw::DW_FORM_addrx1 => FormValue::AddressIndex(reader.sized(1)?),
        dw::DW_FORM_addrx2 => FormValue::AddressIndex(reader.sized(2)?),
        dw::DW_FORM_addrx3 => FormValue::AddressIndex(read_u24(reader)?),
        dw::DW_FORM_addrx4 => FormValue::AddressIndex(reader.sized(4)?),
        dw::DW_FORM_data1 => FormValue::Constant(reader.sized(1)?),
        dw::DW_FORM_data2 => FormValue::Constant(reader.sized(2)?),
        dw::DW_FORM_data4 => FormValue::Constant(reader.sized(4)?),
        dw::DW_FORM_data8 => FormValue::Constant(reader.sized(8)?),
        dw::DW_FORM_data16 => FormValue::Data16(reader.bytes(16)?),
        dw::DW_FORM_udata => FormValue::Constant(reader.uleb128()?),
        dw::DW_FORM_sdata => FormValue::Signed(reader.sleb128()?),
        dw::DW_FORM_implicit_const => FormValue::Signed(implicit_const.unwrap_or_default()),
        dw::DW_FORM_flag => FormValue::Flag(reader.u8()? != 0),
        dw::DW_FORM_flag_present => FormValue::Flag(true),
        dw::DW_FORM_ref1 => FormValue::UnitRef(u32::from(reader.u8()?)),
        dw::DW_FORM_ref2 => FormValue::UnitRef(u32::from(reader.u16()?)),
        dw::DW_FORM_ref4 => FormValue::UnitRef(reader.u32()?),
        dw::DW_FORM_ref8 | dw::DW_FORM_ref_udata => {
            let raw = if form == dw::DW_FORM_ref8 {
                reader.u64()?
            } else {
                reader.uleb128()?
            };
            FormValue::UnitRef(offset_u32(reader, raw)?)
        }
        dw::DW_FORM_ref_addr => {
            let raw = reader.sized(encoding.ref_addr_size())?;
            FormValue::InfoRef(offset_u32(reader, raw)?)
        }
        dw::DW_FORM_ref_sup4 | dw::DW_FORM_GNU_ref_alt => FormValue::SupRef(reader.sized(4)?),
        dw::DW_FORM_ref_sup8 => FormValue::SupRef(reader.u64()?),
        dw::DW_FORM_ref_sig8 => FormValue::TypeSignature(reader.u64()?),
        dw::DW_FORM_string => FormValue::String(reader.cstr()?),
        dw::DW_FORM_strp => FormValue::StrOffset(reader.u32()?),
        dw::DW_FORM_line_strp => FormValue::LineStrOffset(reader.u32()?),
        dw::DW_FORM_strp_sup | dw::DW_FORM_GNU_strp_alt => FormValue::SupStrOffset(reader.u32()?),
        dw::DW_FORM_strx | dw::DW_FORM_GNU_str_index => FormValue::StrIndex(reader.uleb128()?),
        dw::DW_FORM_strx1 => FormValue::StrIndex(reader.sized(1)?),
        dw::DW_FORM_strx2 => FormValue::StrIndex(reader.sized(2)?),
        dw::DW_FORM_strx3 => FormValue::StrIndex(read_u24(reader)?),
        dw::DW_FORM_strx4 => FormValue::StrIndex(reader.sized(4)?),
        dw::DW_FORM_block1 => {
            let length = reader.u8()?;
            FormValue::Block(reader.bytes(usize::from(length))?)
        }
        dw::DW_FORM_block2 => {
            let length = reader.u16()?;
            FormValue::Block(reader.bytes(usize::from(length))?)
        }
        dw::DW_FORM_block4 => {
            let length = reader.u32()?;
            FormValue::Block(reader.bytes(length as usize)?)
        }
        dw::DW_FORM_block | dw::DW_FORM_exprloc => {
            let raw = reader.uleb128()?;
            let length = usize::try_from(raw).map_err(|_| reader.malformed("block length overflow"))?;
            let bytes = reader.bytes(length)?;
            if form == dw::DW_FORM_exprloc {
                FormValue::Expression(bytes)
            } else {
                FormValue::Block(bytes)
            }
        }
        dw::DW_FORM_sec_offset => FormValue::SecOffset(reader.u32()?),
        dw::DW_FORM_loclistx => FormValue::LocListIndex(reader.uleb128()?),
        dw::DW_FORM_rnglistx => FormValue::RngListIndex(reader.uleb128()?),
        dw::DW_FORM_indirect => {
            let actual = indirect_form(reader)?;
            return read_form(reader, actual, encoding, implicit_const);
        }
        other => return Err(EmdbgError::UnsupportedForm(other)),
    };
    Ok(value)
}

fn read_u24(reader: &mut Reader<'_>) -> EmdbgResult<u64>
{
    let bytes = reader.bytes(3)?;
    Ok(u64::from(bytes[0]) | (u64::from(bytes[1]) << 8) | (u64::from(bytes[2]) << 16))
}

#[cfg(test)]
mod tests
{
    use super::*;

    const V4: Encoding = Encoding {
        version: 4,
        address_size: 4,
    };

    #[test]
    fn test_skip_matches_read_for_variable_forms()
    {
        let bytes = [0x03, 0xaa, 0xbb, 0xcc, b'h', b'i', 0, 0x7f, 0x05];
        let forms = [dw::DW_FORM_exprloc, dw::DW_FORM_string, dw::DW_FORM_sdata, dw::DW_FORM_udata];

        let mut skipping = Reader::new("test", &bytes);
        let mut reading = Reader::new("test", &bytes);
        for form in forms {
            skip_form(&mut skipping, form, V4).unwrap();
            read_form(&mut reading, form, V4, None).unwrap();
            assert_eq!(skipping.offset(), reading.offset());
        }
        assert!(skipping.is_empty());
    }

    #[test]
    fn test_read_form_values()
    {
        let bytes = [0x10, 0x00, 0x00, 0x00, 0x2a, 0x7e, 0x02, 0x91, 0x78];
        let mut reader = Reader::new("test", &bytes);
        assert_eq!(read_form(&mut reader, dw::DW_FORM_ref4, V4, None).unwrap(), FormValue::UnitRef(0x10));
        assert_eq!(read_form(&mut reader, dw::DW_FORM_data1, V4, None).unwrap(), FormValue::Constant(42));
        assert_eq!(read_form(&mut reader, dw::DW_FORM_sdata, V4, None).unwrap(), FormValue::Signed(-2));
        assert_eq!(
            read_form(&mut reader, dw::DW_FORM_exprloc, V4, None).unwrap(),
            FormValue::Expression(&[0x91, 0x78])
        );
    }

    #[test]
    fn test_implicit_const_consumes_nothing()
    {
        let mut reader = Reader::new("test", &[]);
        let value = read_form(&mut reader, dw::DW_FORM_implicit_const, V4, Some(-7)).unwrap();
        assert_eq!(value.as_signed(), Some(-7));
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn test_ref_addr_is_address_sized_in_dwarf2()
    {
        let v2 = Encoding {
            version: 2,
            address_size: 4,
        };
        assert_eq!(fixed_form_size(dw::DW_FORM_ref_addr, v2), Some(4));
        assert_eq!(fixed_form_size(dw::DW_FORM_strx3, V4), Some(3));
        assert_eq!(fixed_form_size(dw::DW_FORM_exprloc, V4), None);
    }

    #[test]
    fn test_indirect_form()
    {
        // DW_FORM_indirect -> DW_FORM_data2
        let mut reader = Reader::new("test", &[0x05, 0x34, 0x12]);
        assert_eq!(
            read_form(&mut reader, dw::DW_FORM_indirect, V4, None).unwrap(),
            FormValue::Constant(0x1234)
        );
    }

    #[test]
    fn test_unknown_form_is_rejected()
    {
        let mut reader = Reader::new("test", &[0; 4]);
        assert!(matches!(
            skip_form(&mut reader, DwForm(0x7f), V4),
            Err(EmdbgError::UnsupportedForm(DwForm(0x7f)))
        ));
    }

    #[test]
    fn test_reference_resolution()
    {
        assert_eq!(FormValue::UnitRef(0x20).reference(0x100), Some(0x120));
        assert_eq!(FormValue::InfoRef(0x20).reference(0x100), Some(0x20));
        assert_eq!(FormValue::Constant(1).reference(0x100), None);
    }
}
