//! # Type Graph
//!
//! Materializes the type DIEs reachable from one DIE into an arena of
//! [`DwarfTypeNode`]s.
//!
//! Type graphs may contain cycles (a list node pointing to its own struct),
//! so nodes refer to each other by index into the caller's vector, never by
//! reference. A recursion detector maps DIE offsets to node indexes; a DIE
//! seen before in the same top-level read yields the existing node.
//!
//! ```text
//! struct node { int value; struct node *next; }
//!
//! [0] structure_type "node"  children [1, 3]
//! [1] member "value"         next -> [2]
//! [2] base_type "int"
//! [3] member "next"          next -> [4]
//! [4] pointer_type           next -> [0]
//! ```

use std::cell::Cell;
use std::collections::HashMap;

use gimli::constants as dw;
use smallvec::SmallVec;

use super::die::Die;
use super::form::FormValue;
use super::DwarfData;
use crate::error::{EmdbgError, EmdbgResult};

/// Bound on declaration/definition indirections followed for one DIE
const MAX_INDIRECTIONS: usize = 16;

/// Extent of one array dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayDimension
{
    /// Element count known from the debug information
    Known(u32),
    /// No upper bound given, e.g. a flexible array member
    Flexible,
    /// Bound held in the variable at this DIE offset, known only at run time
    Variable(u32),
}

/// One node of a type graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DwarfTypeNode
{
    pub die: Die,
    /// Node of the DIE named by `DW_AT_type`
    pub next: Option<usize>,
    /// Nodes of the DIE's children (members, enumerators, subranges, ...)
    pub children: Vec<usize>,
    pub array_dimensions: SmallVec<[ArrayDimension; 2]>,
    /// Set while a renderer is inside this node
    pub processed: Cell<bool>,
}

impl DwarfTypeNode
{
    fn new(die: Die) -> Self
    {
        Self {
            die,
            next: None,
            children: Vec::new(),
            array_dimensions: SmallVec::new(),
            processed: Cell::new(false),
        }
    }
}

/// Whether `node` is a pointer, reference or pointer-to-member
pub fn is_pointer_type(nodes: &[DwarfTypeNode], node: Option<usize>) -> bool
{
    node.and_then(|index| nodes.get(index)).is_some_and(|node| {
        matches!(
            node.die.tag,
            dw::DW_TAG_pointer_type
                | dw::DW_TAG_reference_type
                | dw::DW_TAG_rvalue_reference_type
                | dw::DW_TAG_ptr_to_member_type
        )
    })
}

pub fn is_array_type(nodes: &[DwarfTypeNode], node: Option<usize>) -> bool
{
    node.and_then(|index| nodes.get(index))
        .is_some_and(|node| node.die.tag == dw::DW_TAG_array_type)
}

pub fn is_subroutine_type(nodes: &[DwarfTypeNode], node: Option<usize>) -> bool
{
    node.and_then(|index| nodes.get(index))
        .is_some_and(|node| node.die.tag == dw::DW_TAG_subroutine_type)
}

/// Reads type graphs, sharing one recursion detector per top-level read
#[derive(Debug)]
pub struct TypeReader<'d, 'a>
{
    dwarf: &'d DwarfData<'a>,
    recursion_detector: HashMap<u32, usize>,
}

impl<'d, 'a> TypeReader<'d, 'a>
{
    pub fn new(dwarf: &'d DwarfData<'a>) -> Self
    {
        Self {
            dwarf,
            recursion_detector: HashMap::new(),
        }
    }

    /// Append the graph rooted at `offset` to `nodes`, returning the root's index
    ///
    /// Pass `reset_recursion_detector = true` for an independent read. Nested
    /// reads made while expanding one graph must share the detector.
    ///
    /// ## Errors
    ///
    /// `NotADie` for dangling references, `Malformed` for indirection
    /// loops, and decoding errors.
    pub fn read_type(
        &mut self,
        offset: u32,
        nodes: &mut Vec<DwarfTypeNode>,
        reset_recursion_detector: bool,
    ) -> EmdbgResult<usize>
    {
        if reset_recursion_detector {
            self.recursion_detector.clear();
        }
        if let Some(&index) = self.recursion_detector.get(&offset) {
            tracing::trace!(offset = format_args!("0x{offset:x}"), index, "Type chain recursion");
            return Ok(index);
        }

        let definition = self.follow_indirections(offset)?;
        if definition != offset {
            let index = self.read_type(definition, nodes, false)?;
            self.recursion_detector.insert(offset, index);
            return Ok(index);
        }

        let tree = self.dwarf.debug_tree_of_die(offset, Some(1))?;
        let child_offsets: Vec<u32> = tree.children.iter().map(|child| child.offset).collect();
        let index = nodes.len();
        nodes.push(DwarfTypeNode::new(Die {
            children: Vec::new(),
            ..tree
        }));
        self.recursion_detector.insert(offset, index);

        // DW_AT_type may point into another unit
        if let Some(type_offset) = self.dwarf.reference_attribute(offset, dw::DW_AT_type)? {
            let next = self.read_type(type_offset, nodes, false)?;
            nodes[index].next = Some(next);
        }

        for child_offset in child_offsets {
            let child = self.read_type(child_offset, nodes, false)?;
            nodes[index].children.push(child);
            if nodes[child].die.tag == dw::DW_TAG_subrange_type {
                let dimension = self.array_dimension(child_offset)?;
                nodes[index].array_dimensions.push(dimension);
            }
        }
        Ok(index)
    }

    /// Follow `abstract_origin`, `import` and `specification` to the DIE that
    /// carries the type
    fn follow_indirections(&self, offset: u32) -> EmdbgResult<u32>
    {
        let mut current = offset;
        for _ in 0..MAX_INDIRECTIONS {
            let target = [dw::DW_AT_abstract_origin, dw::DW_AT_import, dw::DW_AT_specification]
                .into_iter()
                .map(|name| self.dwarf.reference_attribute(current, name))
                .find_map(|reference| reference.transpose());
            match target.transpose()? {
                Some(next) if next == current => {
                    return Err(EmdbgError::malformed(
                        ".debug_info",
                        current as usize,
                        "DIE refers to itself as its own origin",
                    ))
                }
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(EmdbgError::malformed(
            ".debug_info",
            offset as usize,
            "too many origin indirections",
        ))
    }

    fn array_dimension(&self, subrange: u32) -> EmdbgResult<ArrayDimension>
    {
        let unit_offset = self.dwarf.unit_for_die_offset(subrange)?.cu_header_offset();
        let bound = match self.dwarf.attribute(subrange, dw::DW_AT_upper_bound)? {
            Some(value) => Some((value, 1)),
            None => self.dwarf.attribute(subrange, dw::DW_AT_count)?.map(|value| (value, 0)),
        };
        let Some((value, adjust)) = bound else {
            return Ok(ArrayDimension::Flexible);
        };
        if let Some(variable) = value.reference(unit_offset) {
            return Ok(ArrayDimension::Variable(variable));
        }
        // Bounds are 32-bit on this target, so an unsigned 0xffffffff upper
        // bound is -1 and describes a zero-length array
        let count = match value {
            FormValue::Signed(bound) => u32::try_from(bound.saturating_add(adjust).max(0)).unwrap_or(u32::MAX),
            other => match other.as_constant() {
                Some(bound) => (bound as u32).wrapping_add(adjust as u32),
                None => {
                    tracing::warn!(
                        subrange = format_args!("0x{subrange:x}"),
                        "Array bound given as an expression, treating as flexible"
                    );
                    return Ok(ArrayDimension::Flexible);
                }
            },
        };
        Ok(ArrayDimension::Known(count))
    }
}

impl<'a> DwarfData<'a>
{
    /// Type graph of the DIE at `offset`, root at index 0
    ///
    /// ## Example
    ///
    /// ```rust,ignore
    /// let nodes = dwarf.read_type_of_die(variable_type_offset)?;
    /// println!("{}", dwarf.type_string(&nodes, 0)?);
    /// ```
    pub fn read_type_of_die(&self, offset: u32) -> EmdbgResult<Vec<DwarfTypeNode>>
    {
        let mut nodes = Vec::new();
        TypeReader::new(self).read_type(offset, &mut nodes, true)?;
        Ok(nodes)
    }
}
