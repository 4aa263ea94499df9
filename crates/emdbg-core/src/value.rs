//! # Value Formatting
//!
//! Turns the bytes fetched for a data object into display text, guided by
//! the [`DataNode`] layout of its type.
//!
//! ```text
//! pair = {
//!   a = 5
//!   b = 120 'x'
//! }
//! ```
//!
//! Bytes that could not be read are `None`; any scalar touching one renders
//! as `??`.

use std::fmt;

use gimli::constants as dw;

use crate::dwarf::{ArrayDimension, DataNode, RECURSION_MARKER};

/// Shown instead of a scalar with unreadable bytes
pub const UNAVAILABLE: &str = "??";
/// Shown for scalars whose size is not 1, 2, 4 or 8 bytes
pub const UNKNOWN_SIZE: &str = "<<< UNKNOWN SIZE >>>";
/// Arrays longer than this are cut short
pub const MAX_ARRAY_ELEMENTS: usize = 256;

/// Radix for integer values; pointers are always hexadecimal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NumericBase
{
    #[default]
    Decimal,
    Hexadecimal,
}

/// A formatted value, one node per member or element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueTree
{
    pub name: String,
    pub type_string: String,
    /// Text of a scalar; `None` for aggregates and arrays
    pub value: Option<String>,
    pub children: Vec<ValueTree>,
}

impl ValueTree
{
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result
    {
        let indent = depth * 2;
        let name = if self.name.is_empty() { "<anonymous>" } else { &self.name };
        match &self.value {
            Some(value) => writeln!(f, "{:indent$}{name} = {value}", ""),
            None => {
                writeln!(f, "{:indent$}{name} = {{", "")?;
                for child in &self.children {
                    child.write_indented(f, depth + 1)?;
                }
                writeln!(f, "{:indent$}}}", "")
            }
        }
    }
}

impl fmt::Display for ValueTree
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        self.write_indented(f, 0)
    }
}

/// Format `bytes` as a value of the type laid out in `node`
///
/// ## Example
///
/// ```rust
/// use emdbg_core::dwarf::DataNode;
/// use emdbg_core::value::{format_value, NumericBase};
/// use gimli::constants as dw;
///
/// let node = DataNode {
///     name: "count".into(),
///     type_string: "int".into(),
///     bytesize: 4,
///     base_type_encoding: Some(dw::DW_ATE_signed),
///     ..DataNode::default()
/// };
/// let bytes = (-2i32).to_le_bytes().map(Some);
/// assert_eq!(format_value(&node, &bytes, NumericBase::Decimal).value.as_deref(), Some("-2"));
/// ```
pub fn format_value(node: &DataNode, bytes: &[Option<u8>], base: NumericBase) -> ValueTree
{
    let mut tree = ValueTree {
        name: node.name.clone(),
        type_string: node.type_string.clone(),
        ..ValueTree::default()
    };
    if node.is_variable_length {
        tree.value = Some("<variable length array>".to_owned());
    } else if node.is_recursive {
        tree.value = Some(RECURSION_MARKER.to_owned());
    } else if !node.array_dimensions.is_empty() {
        format_array(node, bytes, base, &mut tree);
    } else if node.is_pointer {
        tree.value = Some(match read_scalar(bytes, node.bytesize) {
            Ok(Some(address)) => format!("0x{address:08x}"),
            Ok(None) => UNAVAILABLE.to_owned(),
            Err(text) => text.to_owned(),
        });
    } else if !node.children.is_empty() {
        for member in &node.children {
            let member_bytes = slice(bytes, member.data_member_location as usize, member.bytesize as usize);
            tree.children.push(format_value(member, &member_bytes, base));
        }
    } else if node.bytesize == 0 && node.base_type_encoding.is_none() && node.enumeration.is_empty() {
        tree.value = Some("{}".to_owned());
    } else {
        tree.value = Some(format_scalar(node, bytes, base));
    }
    tree
}

fn format_array(node: &DataNode, bytes: &[Option<u8>], base: NumericBase, tree: &mut ValueTree)
{
    let Some(element) = node.children.first() else {
        tree.value = Some("[]".to_owned());
        return;
    };
    let count = match node.array_dimensions[0] {
        ArrayDimension::Known(count) => count as usize,
        ArrayDimension::Flexible | ArrayDimension::Variable(_) => {
            tree.value = Some("[...]".to_owned());
            return;
        }
    };
    // Outer dimension first; an element of a 2-D array is a 1-D array
    let element = if node.array_dimensions.len() > 1 {
        DataNode {
            array_dimensions: node.array_dimensions[1..].iter().copied().collect(),
            bytesize: if count == 0 { 0 } else { node.bytesize / count as u32 },
            type_string: element.type_string.clone(),
            ..node.clone()
        }
    } else {
        element.clone()
    };
    let stride = element.bytesize as usize;
    for index in 0..count.min(MAX_ARRAY_ELEMENTS) {
        let mut child = format_value(&element, &slice(bytes, index * stride, stride), base);
        child.name = format!("[{index}]");
        tree.children.push(child);
    }
    if count > MAX_ARRAY_ELEMENTS {
        tree.children.push(ValueTree {
            name: "...".to_owned(),
            value: Some(format!("{} more elements", count - MAX_ARRAY_ELEMENTS)),
            ..ValueTree::default()
        });
    }
}

/// `bytes[offset..offset + length]`, missing bytes as `None`
fn slice(bytes: &[Option<u8>], offset: usize, length: usize) -> Vec<Option<u8>>
{
    (offset..offset + length)
        .map(|index| bytes.get(index).copied().flatten())
        .collect()
}

/// Little-endian integer of `size` bytes; `Ok(None)` when a byte is missing
fn read_scalar(bytes: &[Option<u8>], size: u32) -> Result<Option<u64>, &'static str>
{
    if !matches!(size, 1 | 2 | 4 | 8) {
        return Err(UNKNOWN_SIZE);
    }
    let mut value = 0u64;
    for index in (0..size as usize).rev() {
        let Some(byte) = bytes.get(index).copied().flatten() else {
            return Ok(None);
        };
        value = (value << 8) | u64::from(byte);
    }
    Ok(Some(value))
}

fn sign_extend(value: u64, bits: u32) -> i64
{
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn format_scalar(node: &DataNode, bytes: &[Option<u8>], base: NumericBase) -> String
{
    let mut raw = match read_scalar(bytes, node.bytesize) {
        Ok(Some(raw)) => raw,
        Ok(None) => return UNAVAILABLE.to_owned(),
        Err(text) => return text.to_owned(),
    };
    let mut bits = node.bytesize * 8;
    if node.bitsize > 0 {
        raw >>= node.bitposition;
        raw &= (1u64 << node.bitsize.min(63)) - 1;
        bits = node.bitsize;
    }
    let signed = matches!(
        node.base_type_encoding,
        Some(dw::DW_ATE_signed) | Some(dw::DW_ATE_signed_char)
    ) || (node.base_type_encoding.is_none() && node.enumeration.iter().any(|(_, value)| *value < 0));

    if !node.enumeration.is_empty() {
        let value = if signed { sign_extend(raw, bits) } else { raw as i64 };
        let number = format_integer(raw, value, signed, base);
        return match node.enumeration.iter().find(|(_, enumerator)| *enumerator == value) {
            Some((name, _)) => format!("{number} ({name})"),
            None => number,
        };
    }

    match node.base_type_encoding {
        Some(dw::DW_ATE_boolean) => (raw != 0).to_string(),
        Some(dw::DW_ATE_float) => match node.bytesize {
            4 => f32::from_bits(raw as u32).to_string(),
            8 => f64::from_bits(raw).to_string(),
            _ => UNKNOWN_SIZE.to_owned(),
        },
        Some(dw::DW_ATE_signed_char) | Some(dw::DW_ATE_unsigned_char) if node.bytesize == 1 => {
            let value = if signed { sign_extend(raw, bits) } else { raw as i64 };
            let character = char::from(raw as u8).escape_default();
            format!("{} '{character}'", format_integer(raw, value, signed, base))
        }
        _ => {
            let value = if signed { sign_extend(raw, bits) } else { raw as i64 };
            format_integer(raw, value, signed, base)
        }
    }
}

fn format_integer(raw: u64, value: i64, signed: bool, base: NumericBase) -> String
{
    match base {
        NumericBase::Hexadecimal => format!("0x{raw:x}"),
        NumericBase::Decimal if signed => value.to_string(),
        NumericBase::Decimal => raw.to_string(),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn base_type(name: &str, type_string: &str, bytesize: u32, encoding: gimli::DwAte) -> DataNode
    {
        DataNode {
            name: name.into(),
            type_string: type_string.into(),
            bytesize,
            base_type_encoding: Some(encoding),
            ..DataNode::default()
        }
    }

    fn available(bytes: &[u8]) -> Vec<Option<u8>>
    {
        bytes.iter().copied().map(Some).collect()
    }

    #[test]
    fn test_struct_members()
    {
        let mut char_member = base_type("b", "char", 1, dw::DW_ATE_signed_char);
        char_member.data_member_location = 4;
        let pair = DataNode {
            name: "pair".into(),
            type_string: "struct pair".into(),
            bytesize: 8,
            children: vec![base_type("a", "int", 4, dw::DW_ATE_signed), char_member],
            ..DataNode::default()
        };
        let tree = format_value(&pair, &available(&[5, 0, 0, 0, b'x', 0, 0, 0]), NumericBase::Decimal);
        assert_eq!(tree.value, None);
        assert_eq!(tree.children[0].value.as_deref(), Some("5"));
        assert_eq!(tree.children[1].value.as_deref(), Some("120 'x'"));
        assert_eq!(tree.to_string(), "pair = {\n  a = 5\n  b = 120 'x'\n}\n");
    }

    #[test]
    fn test_bit_fields()
    {
        let mut low = base_type("low", "unsigned int", 4, dw::DW_ATE_unsigned);
        low.bitsize = 3;
        let mut high = base_type("high", "int", 4, dw::DW_ATE_signed);
        high.bitposition = 3;
        high.bitsize = 5;
        let bytes = available(&[0b1111_1101, 0, 0, 0]);
        assert_eq!(format_value(&low, &bytes, NumericBase::Decimal).value.as_deref(), Some("5"));
        assert_eq!(format_value(&high, &bytes, NumericBase::Decimal).value.as_deref(), Some("-1"));
    }

    #[test]
    fn test_enumeration_pointer_and_float()
    {
        let colour = DataNode {
            name: "colour".into(),
            bytesize: 4,
            enumeration: vec![("RED".into(), 0), ("GREEN".into(), 1)],
            ..DataNode::default()
        };
        assert_eq!(
            format_value(&colour, &available(&[1, 0, 0, 0]), NumericBase::Decimal).value.as_deref(),
            Some("1 (GREEN)")
        );
        assert_eq!(
            format_value(&colour, &available(&[7, 0, 0, 0]), NumericBase::Decimal).value.as_deref(),
            Some("7")
        );

        let pointer = DataNode {
            name: "next".into(),
            bytesize: 4,
            is_pointer: true,
            ..DataNode::default()
        };
        assert_eq!(
            format_value(&pointer, &available(&[0x10, 0x00, 0x00, 0x20]), NumericBase::Decimal)
                .value
                .as_deref(),
            Some("0x20000010")
        );

        let ratio = base_type("ratio", "float", 4, dw::DW_ATE_float);
        assert_eq!(
            format_value(&ratio, &1.5f32.to_le_bytes().map(Some), NumericBase::Hexadecimal)
                .value
                .as_deref(),
            Some("1.5")
        );
    }

    #[test]
    fn test_arrays()
    {
        let values = DataNode {
            name: "values".into(),
            type_string: "int [2][2]".into(),
            bytesize: 16,
            array_dimensions: [ArrayDimension::Known(2), ArrayDimension::Known(2)].into_iter().collect(),
            children: vec![base_type("", "int", 4, dw::DW_ATE_signed)],
            ..DataNode::default()
        };
        let bytes: Vec<Option<u8>> = [1u32, 2, 3, 4].iter().flat_map(|value| value.to_le_bytes().map(Some)).collect();
        let tree = format_value(&values, &bytes, NumericBase::Hexadecimal);
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[1].name, "[1]");
        assert_eq!(tree.children[1].children[0].value.as_deref(), Some("0x3"));

        let flexible = DataNode {
            array_dimensions: [ArrayDimension::Flexible].into_iter().collect(),
            children: vec![base_type("", "char", 1, dw::DW_ATE_signed_char)],
            ..DataNode::default()
        };
        assert_eq!(format_value(&flexible, &[], NumericBase::Decimal).value.as_deref(), Some("[...]"));
    }

    #[test]
    fn test_unavailable_and_unknown_size()
    {
        let value = base_type("value", "int", 4, dw::DW_ATE_signed);
        assert_eq!(
            format_value(&value, &[Some(1), None, Some(0), Some(0)], NumericBase::Decimal)
                .value
                .as_deref(),
            Some(UNAVAILABLE)
        );
        let odd = base_type("odd", "__int24", 3, dw::DW_ATE_signed);
        assert_eq!(
            format_value(&odd, &available(&[1, 2, 3]), NumericBase::Decimal).value.as_deref(),
            Some(UNKNOWN_SIZE)
        );
    }
}
