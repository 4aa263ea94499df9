//! # Type Rendering
//!
//! Two walks over a type graph built by [`TypeReader`](super::TypeReader):
//!
//! - [`DwarfData::type_string`] prints a C declarator, e.g.
//!   `struct pair { int a; char b; }` or `int (*)(int, char)`
//! - [`DwarfData::data_for_type`] builds a [`DataNode`] tree with sizes,
//!   member offsets and bit-field positions, used to interpret raw bytes
//!
//! Both walks terminate on cyclic graphs. A named aggregate met again while
//! its own body is being printed renders as `struct name <recursive>`.

use std::collections::HashSet;

use gimli::constants as dw;
use gimli::{DwAte, DwTag};
use smallvec::SmallVec;

use super::form::FormValue;
use super::reader::Reader;
use super::types::{ArrayDimension, DwarfTypeNode};
use super::DwarfData;
use crate::error::{EmdbgError, EmdbgResult};

/// Printed in place of an aggregate body already being printed
pub const RECURSION_MARKER: &str = "<recursive>";

/// Size of pointers and references on the target
const POINTER_SIZE: u32 = 4;

/// Layout of one value, ready to be laid over target bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataNode
{
    pub name: String,
    pub type_string: String,
    pub bytesize: u32,
    /// Byte offset within the enclosing aggregate
    pub data_member_location: u32,
    /// Bit-field position counted from the least significant bit
    pub bitposition: u32,
    /// Bit-field width, 0 for ordinary members
    pub bitsize: u32,
    pub array_dimensions: SmallVec<[ArrayDimension; 2]>,
    pub base_type_encoding: Option<DwAte>,
    /// Enumerator names and values, for enumeration types
    pub enumeration: Vec<(String, i64)>,
    pub is_pointer: bool,
    /// DIE offset of the pointed-to type, for pointers
    pub type_die_offset: Option<u32>,
    /// Array with a run-time bound; `bytesize` is 0
    pub is_variable_length: bool,
    /// Aggregate already being laid out by an enclosing node; members omitted
    pub is_recursive: bool,
    /// Members, or the element template of an array
    pub children: Vec<DataNode>,
}

/// Clears a node's `processed` flag when printing of its body ends
struct Printing<'n>(&'n DwarfTypeNode);

impl<'n> Printing<'n>
{
    fn enter(node: &'n DwarfTypeNode) -> Option<Self>
    {
        if node.processed.replace(true) {
            return None;
        }
        Some(Self(node))
    }
}

impl Drop for Printing<'_>
{
    fn drop(&mut self)
    {
        self.0.processed.set(false);
    }
}

fn aggregate_keyword(tag: DwTag) -> Option<&'static str>
{
    match tag {
        dw::DW_TAG_structure_type => Some("struct"),
        dw::DW_TAG_union_type => Some("union"),
        dw::DW_TAG_class_type => Some("class"),
        dw::DW_TAG_enumeration_type => Some("enum"),
        _ => None,
    }
}

fn join_declarator(prefix: &str, suffix: &str) -> String
{
    if suffix.is_empty() {
        return prefix.to_string();
    }
    if prefix.ends_with('*') || prefix.ends_with('(') || prefix.ends_with('&') {
        format!("{prefix}{suffix}")
    } else {
        format!("{prefix} {suffix}")
    }
}

impl<'a> DwarfData<'a>
{
    fn node_name(&self, node: &DwarfTypeNode) -> EmdbgResult<Option<&'a str>>
    {
        self.string_attribute(node.die.offset, dw::DW_AT_name)
    }

    /// C declarator for the type at `root`, aggregate bodies expanded
    ///
    /// ## Errors
    ///
    /// `UnhandledTag` when the graph contains a DIE that is not a type.
    pub fn type_string(&self, nodes: &[DwarfTypeNode], root: usize) -> EmdbgResult<String>
    {
        let (prefix, suffix) = self.declarator(nodes, Some(root), true)?;
        Ok(join_declarator(&prefix, &suffix))
    }

    /// Like [`type_string`](Self::type_string) but named aggregates print
    /// only their name
    pub fn type_name(&self, nodes: &[DwarfTypeNode], root: Option<usize>) -> EmdbgResult<String>
    {
        let (prefix, suffix) = self.declarator(nodes, root, false)?;
        Ok(join_declarator(&prefix, &suffix))
    }

    fn declarator(&self, nodes: &[DwarfTypeNode], index: Option<usize>, expand: bool) -> EmdbgResult<(String, String)>
    {
        let Some(node) = index.and_then(|index| nodes.get(index)) else {
            return Ok(("void".to_string(), String::new()));
        };
        let tag = node.die.tag;
        match tag {
            dw::DW_TAG_base_type | dw::DW_TAG_typedef | dw::DW_TAG_unspecified_type => {
                let name = self.node_name(node)?.unwrap_or("void");
                Ok((name.to_string(), String::new()))
            }
            dw::DW_TAG_member
            | dw::DW_TAG_variable
            | dw::DW_TAG_formal_parameter
            | dw::DW_TAG_constant
            | dw::DW_TAG_subrange_type => self.declarator(nodes, node.next, expand),
            dw::DW_TAG_const_type
            | dw::DW_TAG_volatile_type
            | dw::DW_TAG_restrict_type
            | dw::DW_TAG_atomic_type => {
                let qualifier = match tag {
                    dw::DW_TAG_const_type => "const",
                    dw::DW_TAG_volatile_type => "volatile",
                    dw::DW_TAG_restrict_type => "restrict",
                    _ => "_Atomic",
                };
                let (prefix, suffix) = self.declarator(nodes, node.next, expand)?;
                if super::types::is_pointer_type(nodes, node.next) {
                    Ok((format!("{prefix} {qualifier}"), suffix))
                } else {
                    Ok((format!("{qualifier} {prefix}"), suffix))
                }
            }
            dw::DW_TAG_pointer_type
            | dw::DW_TAG_reference_type
            | dw::DW_TAG_rvalue_reference_type
            | dw::DW_TAG_ptr_to_member_type => {
                let sigil = match tag {
                    dw::DW_TAG_pointer_type => "*",
                    dw::DW_TAG_reference_type => "&",
                    dw::DW_TAG_rvalue_reference_type => "&&",
                    _ => "::*",
                };
                let (prefix, suffix) = self.declarator(nodes, node.next, expand)?;
                let wraps = super::types::is_array_type(nodes, node.next)
                    || super::types::is_subroutine_type(nodes, node.next);
                if wraps {
                    Ok((format!("{prefix} ({sigil}"), format!("){suffix}")))
                } else {
                    Ok((format!("{prefix} {sigil}"), suffix))
                }
            }
            dw::DW_TAG_array_type => {
                let (prefix, suffix) = self.declarator(nodes, node.next, expand)?;
                let dimensions: String = node
                    .array_dimensions
                    .iter()
                    .map(|dimension| match dimension {
                        ArrayDimension::Known(count) => format!("[{count}]"),
                        ArrayDimension::Flexible => "[]".to_string(),
                        ArrayDimension::Variable(_) => "[*]".to_string(),
                    })
                    .collect();
                Ok((prefix, format!("{dimensions}{suffix}")))
            }
            dw::DW_TAG_subroutine_type => {
                let (prefix, suffix) = self.declarator(nodes, node.next, expand)?;
                let mut parameters = Vec::new();
                for &child in &node.children {
                    match nodes[child].die.tag {
                        dw::DW_TAG_formal_parameter => parameters.push(self.type_name(nodes, Some(child))?),
                        dw::DW_TAG_unspecified_parameters => parameters.push("...".to_string()),
                        _ => {}
                    }
                }
                if parameters.is_empty() {
                    parameters.push("void".to_string());
                }
                Ok((prefix, format!("({}){suffix}", parameters.join(", "))))
            }
            _ => match aggregate_keyword(tag) {
                Some(keyword) => Ok((self.aggregate(nodes, node, keyword, expand)?, String::new())),
                None => Err(EmdbgError::UnhandledTag(tag)),
            },
        }
    }

    fn aggregate(&self, nodes: &[DwarfTypeNode], node: &DwarfTypeNode, keyword: &str, expand: bool) -> EmdbgResult<String>
    {
        let name = self.node_name(node)?;
        let head = match name {
            Some(name) => format!("{keyword} {name}"),
            None => keyword.to_string(),
        };
        if name.is_some() && !expand {
            return Ok(head);
        }
        let Some(_printing) = Printing::enter(node) else {
            tracing::trace!(offset = node.die.offset, "Aggregate recursion while printing");
            return Ok(format!("{head} {RECURSION_MARKER}"));
        };

        let mut body = Vec::new();
        for &child in &node.children {
            let member = &nodes[child];
            match member.die.tag {
                dw::DW_TAG_member | dw::DW_TAG_variable => {
                    let (prefix, suffix) = self.declarator(nodes, member.next, expand)?;
                    let member_name = self.node_name(member)?.unwrap_or("");
                    let mut line = join_declarator(&prefix, &format!("{member_name}{suffix}"));
                    if let Some(bits) = self.constant_attribute(member.die.offset, dw::DW_AT_bit_size)? {
                        line.push_str(&format!(" : {bits}"));
                    }
                    body.push(format!("{line};"));
                }
                dw::DW_TAG_enumerator => {
                    let enumerator = self.node_name(member)?.unwrap_or("");
                    match self.enumerator_value(member.die.offset)? {
                        Some(value) => body.push(format!("{enumerator} = {value},")),
                        None => body.push(format!("{enumerator},")),
                    }
                }
                _ => {}
            }
        }
        if body.is_empty() {
            Ok(format!("{head} {{ }}"))
        } else {
            Ok(format!("{head} {{ {} }}", body.join(" ")))
        }
    }

    fn enumerator_value(&self, offset: u32) -> EmdbgResult<Option<i64>>
    {
        Ok(match self.attribute(offset, dw::DW_AT_const_value)? {
            Some(FormValue::Signed(value)) => Some(value),
            Some(value) => value.as_constant().map(|value| value as i64),
            None => None,
        })
    }

    /// Byte offset of a member, from a constant or a `DW_OP_plus_uconst` block
    fn member_location(&self, offset: u32) -> EmdbgResult<Option<u32>>
    {
        let Some(value) = self.attribute(offset, dw::DW_AT_data_member_location)? else {
            return Ok(None);
        };
        if let Some(block) = value.as_block() {
            let mut reader = Reader::new("DW_AT_data_member_location", block);
            let opcode = reader.u8()?;
            if opcode != dw::DW_OP_plus_uconst.0 && opcode != dw::DW_OP_constu.0 {
                return Err(reader.malformed(format!(
                    "unsupported member location opcode {}",
                    gimli::DwOp(opcode)
                )));
            }
            return Ok(Some(reader.uleb128()? as u32));
        }
        Ok(value.as_constant().map(|location| location as u32))
    }

    /// Layout of the type at `root`
    ///
    /// ## Errors
    ///
    /// `UnhandledTag` for DIEs that do not describe data.
    pub fn data_for_type(&self, nodes: &[DwarfTypeNode], root: usize) -> EmdbgResult<DataNode>
    {
        let mut visiting = HashSet::new();
        self.data_node(nodes, Some(root), &mut visiting)
    }

    fn data_node(&self, nodes: &[DwarfTypeNode], index: Option<usize>, visiting: &mut HashSet<usize>) -> EmdbgResult<DataNode>
    {
        let Some(node) = index.and_then(|index| nodes.get(index)) else {
            return Ok(DataNode {
                type_string: "void".to_string(),
                ..DataNode::default()
            });
        };
        let offset = node.die.offset;
        let tag = node.die.tag;
        let mut data = DataNode {
            name: self.node_name(node)?.unwrap_or_default().to_string(),
            type_string: self.type_name(nodes, index)?,
            ..DataNode::default()
        };

        match tag {
            dw::DW_TAG_member | dw::DW_TAG_variable | dw::DW_TAG_formal_parameter => {
                let mut member = self.data_node(nodes, node.next, visiting)?;
                member.name = data.name;
                member.data_member_location = self.member_location(offset)?.unwrap_or(0);
                if let Some(bitsize) = self.constant_attribute(offset, dw::DW_AT_bit_size)? {
                    self.place_bit_field(offset, bitsize as u32, &mut member)?;
                }
                return Ok(member);
            }
            dw::DW_TAG_typedef
            | dw::DW_TAG_const_type
            | dw::DW_TAG_volatile_type
            | dw::DW_TAG_restrict_type
            | dw::DW_TAG_atomic_type => {
                let mut inner = self.data_node(nodes, node.next, visiting)?;
                inner.type_string = data.type_string;
                inner.name = String::new();
                return Ok(inner);
            }
            dw::DW_TAG_base_type => {
                data.name = String::new();
                data.bytesize = self.byte_size(offset)?;
                data.base_type_encoding = self
                    .constant_attribute(offset, dw::DW_AT_encoding)?
                    .map(|encoding| DwAte(encoding as u8));
            }
            dw::DW_TAG_pointer_type
            | dw::DW_TAG_reference_type
            | dw::DW_TAG_rvalue_reference_type
            | dw::DW_TAG_ptr_to_member_type => {
                data.name = String::new();
                data.bytesize = self
                    .constant_attribute(offset, dw::DW_AT_byte_size)?
                    .map_or(POINTER_SIZE, |size| size as u32);
                data.is_pointer = true;
                data.type_die_offset = node.next.map(|next| nodes[next].die.offset);
            }
            dw::DW_TAG_structure_type | dw::DW_TAG_class_type | dw::DW_TAG_union_type => {
                data.name = String::new();
                data.bytesize = self.byte_size(offset)?;
                let index = index.unwrap_or_default();
                if !visiting.insert(index) {
                    tracing::trace!(offset, "Aggregate recursion in data layout");
                    data.type_string = format!("{} {RECURSION_MARKER}", data.type_string);
                    data.is_recursive = true;
                    return Ok(data);
                }
                for &child in &node.children {
                    if nodes[child].die.tag == dw::DW_TAG_member {
                        data.children.push(self.data_node(nodes, Some(child), visiting)?);
                    }
                }
                visiting.remove(&index);
            }
            dw::DW_TAG_enumeration_type => {
                data.name = String::new();
                data.bytesize = self.byte_size(offset)?;
                data.base_type_encoding = Some(
                    self.constant_attribute(offset, dw::DW_AT_encoding)?
                        .map_or(dw::DW_ATE_signed, |encoding| DwAte(encoding as u8)),
                );
                for &child in &node.children {
                    let enumerator = &nodes[child];
                    if enumerator.die.tag != dw::DW_TAG_enumerator {
                        continue;
                    }
                    let name = self.node_name(enumerator)?.unwrap_or_default().to_string();
                    let value = self.enumerator_value(enumerator.die.offset)?.unwrap_or(0);
                    data.enumeration.push((name, value));
                }
            }
            dw::DW_TAG_array_type => {
                data.name = String::new();
                let element = self.data_node(nodes, node.next, visiting)?;
                data.array_dimensions = node.array_dimensions.clone();
                let mut count = 1u32;
                for dimension in &data.array_dimensions {
                    match dimension {
                        ArrayDimension::Known(extent) => count = count.saturating_mul(*extent),
                        ArrayDimension::Flexible => count = 0,
                        ArrayDimension::Variable(_) => data.is_variable_length = true,
                    }
                }
                data.bytesize = if data.is_variable_length {
                    0
                } else {
                    count.saturating_mul(element.bytesize)
                };
                data.children.push(element);
            }
            dw::DW_TAG_subroutine_type | dw::DW_TAG_unspecified_type => {
                data.name = String::new();
            }
            _ => return Err(EmdbgError::UnhandledTag(tag)),
        }
        Ok(data)
    }

    fn byte_size(&self, offset: u32) -> EmdbgResult<u32>
    {
        Ok(self
            .constant_attribute(offset, dw::DW_AT_byte_size)?
            .map_or(0, |size| size as u32))
    }

    /// Convert a member's bit-field attributes into an LSB-relative position
    fn place_bit_field(&self, member: u32, bitsize: u32, data: &mut DataNode) -> EmdbgResult<()>
    {
        data.bitsize = bitsize;
        let storage = self
            .constant_attribute(member, dw::DW_AT_byte_size)?
            .map_or(data.bytesize, |size| size as u32);
        if let Some(bit_offset) = self.constant_attribute(member, dw::DW_AT_bit_offset)? {
            // DWARF 2/3 count from the most significant bit of the storage unit
            data.bitposition = (storage * 8)
                .saturating_sub(bit_offset as u32)
                .saturating_sub(bitsize);
            data.bytesize = storage;
        } else if let Some(data_bit_offset) = self.constant_attribute(member, dw::DW_AT_data_bit_offset)? {
            let data_bit_offset = data_bit_offset as u32;
            let unit_bits = (storage * 8).max(8);
            let location = data_bit_offset / unit_bits * (unit_bits / 8);
            data.data_member_location = location;
            data.bitposition = data_bit_offset - location * 8;
            data.bytesize = storage;
        }
        Ok(())
    }
}
