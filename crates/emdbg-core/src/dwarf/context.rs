//! # Execution Context Queries
//!
//! Answers "where is the program" questions for a program counter: which
//! nested scopes contain it, which call site returns there, which data
//! objects are visible, and how to compute their locations.
//!
//! An [`ExecutionContext`] lists the DIEs enclosing an address, outermost
//! first:
//!
//! ```text
//! compile_unit "main.c"
//!   subprogram "main"
//!     lexical_block
//!       inlined_subroutine "helper"
//! ```

use gimli::constants as dw;
use gimli::DwTag;

use super::die::Die;
use super::expression::{le_value, CompileMode, ExpressionCompiler};
use super::form::FormValue;
use super::line::SourceCoordinates;
use super::DwarfData;
use crate::bytecode::{Program, Word};
use crate::error::{EmdbgError, EmdbgResult};

/// DIEs enclosing an address, compilation unit first
pub type ExecutionContext = Vec<Die>;

/// Bound on `abstract_origin`/`specification` chains
const MAX_ORIGIN_DEPTH: usize = 16;

/// A variable or parameter visible in some scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObject<'a>
{
    pub name: Option<String>,
    pub die_offset: u32,
    /// Type DIE, found through the abstract origin when needed
    pub type_offset: Option<u32>,
    pub tag: DwTag,
    /// `DW_AT_location` of the concrete DIE
    pub location: Option<FormValue<'a>>,
    pub const_value: Option<FormValue<'a>>,
}

/// A function with code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subprogram
{
    pub name: Option<String>,
    pub die_offset: u32,
    pub low_pc: u32,
    pub high_pc: u32,
}

fn is_scope(tag: DwTag) -> bool
{
    matches!(
        tag,
        dw::DW_TAG_subprogram | dw::DW_TAG_lexical_block | dw::DW_TAG_inlined_subroutine
    )
}

fn is_data_object(tag: DwTag) -> bool
{
    matches!(tag, dw::DW_TAG_variable | dw::DW_TAG_formal_parameter)
}

fn is_call_site(tag: DwTag) -> bool
{
    matches!(tag, dw::DW_TAG_call_site | dw::DW_TAG_GNU_call_site)
}

/// Inlined subroutines of `context`, innermost first
pub fn inlining_chain_of_context(context: &[Die]) -> Vec<Die>
{
    context
        .iter()
        .rev()
        .filter(|die| die.tag == dw::DW_TAG_inlined_subroutine)
        .cloned()
        .collect()
}

/// The out-of-line function of `context`
pub fn top_level_subprogram_of_context(context: &[Die]) -> Option<&Die>
{
    context.iter().find(|die| die.tag == dw::DW_TAG_subprogram)
}

impl<'a> DwarfData<'a>
{
    /// Scopes containing `pc`
    ///
    /// Empty when no compilation unit covers `pc`, which is normal for
    /// assembly modules without debug information.
    pub fn execution_context_for_address(&self, pc: u32) -> EmdbgResult<ExecutionContext>
    {
        let Some(unit) = self.unit_for_address(pc) else {
            tracing::debug!(pc = format_args!("0x{pc:08x}"), "No compilation unit for address");
            return Ok(Vec::new());
        };
        let root = unit.header.first_die_offset;
        let mut context = vec![self.die_for_offset(root)?];
        let mut current = root;
        'descend: loop {
            let tree = self.debug_tree_of_die(current, Some(1))?;
            for child in tree.children {
                if is_scope(child.tag) && self.address_range_of_die(child.offset)?.contains(pc) {
                    current = child.offset;
                    context.push(child);
                    continue 'descend;
                }
            }
            break;
        }
        tracing::trace!(pc = format_args!("0x{pc:08x}"), depth = context.len(), "Execution context");
        Ok(context)
    }

    /// The call site whose call returns to `return_address`
    ///
    /// Searches the scopes of the calling instruction, innermost first.
    pub fn call_site_at_address(&self, return_address: u32) -> EmdbgResult<Option<Die>>
    {
        let context = self.execution_context_for_address(return_address.wrapping_sub(1))?;
        for scope in context.iter().rev().filter(|die| die.tag != dw::DW_TAG_compile_unit) {
            let tree = self.debug_tree_of_die(scope.offset, None)?;
            if let Some(site) = self.find_call_site(&tree, return_address)? {
                return Ok(Some(site));
            }
        }
        Ok(None)
    }

    fn find_call_site(&self, die: &Die, return_address: u32) -> EmdbgResult<Option<Die>>
    {
        for child in &die.children {
            if is_call_site(child.tag) && self.call_site_return_address(child.offset)? == Some(return_address) {
                return Ok(Some(Die {
                    children: Vec::new(),
                    ..child.clone()
                }));
            }
            if let Some(site) = self.find_call_site(child, return_address)? {
                return Ok(Some(site));
            }
        }
        Ok(None)
    }

    fn call_site_return_address(&self, offset: u32) -> EmdbgResult<Option<u32>>
    {
        let bases = self.unit_for_die_offset(offset)?.bases;
        let value = match self.attribute(offset, dw::DW_AT_call_return_pc)? {
            Some(value) => value,
            None => match self.attribute(offset, dw::DW_AT_low_pc)? {
                Some(value) => value,
                None => return Ok(None),
            },
        };
        self.resolve_address(&value, &bases)
    }

    /// Variables and parameters of every scope in `context`, innermost first
    pub fn local_data_objects_for_context(&self, context: &[Die]) -> EmdbgResult<Vec<DataObject<'a>>>
    {
        let mut objects = Vec::new();
        for scope in context.iter().rev().filter(|die| die.tag != dw::DW_TAG_compile_unit) {
            let tree = self.debug_tree_of_die(scope.offset, Some(1))?;
            for child in tree.children.iter().filter(|child| is_data_object(child.tag)) {
                objects.push(self.data_object(child)?);
            }
        }
        Ok(objects)
    }

    /// File-scope variables with a location, across all units
    pub fn static_data_objects(&self) -> EmdbgResult<Vec<DataObject<'a>>>
    {
        let _span = tracing::debug_span!("static_data_objects").entered();
        let mut objects = Vec::new();
        for unit in self.units().iter().filter(|unit| !unit.is_type_unit()) {
            let tree = self.debug_tree_of_die(unit.header.first_die_offset, Some(1))?;
            for child in tree.children.iter().filter(|child| child.tag == dw::DW_TAG_variable) {
                let object = self.data_object(child)?;
                if object.location.is_some() {
                    objects.push(object);
                }
            }
        }
        tracing::debug!(count = objects.len(), "Static data objects");
        Ok(objects)
    }

    fn data_object(&self, die: &Die) -> EmdbgResult<DataObject<'a>>
    {
        Ok(DataObject {
            name: self.name_of_die(die.offset)?,
            die_offset: die.offset,
            type_offset: self.origin_reference(die.offset, dw::DW_AT_type)?,
            tag: die.tag,
            location: self.attribute(die.offset, dw::DW_AT_location)?,
            const_value: self.origin_attribute(die.offset, dw::DW_AT_const_value)?,
        })
    }

    /// Subprograms that have code, sorted by address
    pub fn subprograms(&self) -> EmdbgResult<Vec<Subprogram>>
    {
        let mut subprograms = Vec::new();
        for offset in self.dies_with_tag(dw::DW_TAG_subprogram) {
            let range = self.address_range_of_die(offset)?;
            let (Some(low_pc), Some(high_pc)) = (
                range.lowest_address(),
                range.ranges.iter().map(|range| range.end).max(),
            ) else {
                continue;
            };
            subprograms.push(Subprogram {
                name: self.name_of_die(offset)?,
                die_offset: offset,
                low_pc,
                high_pc,
            });
        }
        subprograms.sort_by_key(|subprogram| subprogram.low_pc);
        Ok(subprograms)
    }

    /// Compiled `DW_AT_frame_base` of the function executing at `pc`
    pub fn frame_base_code_for_context(&self, context: &[Die], pc: u32) -> EmdbgResult<Option<Program>>
    {
        let Some(subprogram) = top_level_subprogram_of_context(context) else {
            return Ok(None);
        };
        let Some(value) = self.attribute(subprogram.offset, dw::DW_AT_frame_base)? else {
            return Ok(None);
        };
        self.compile_location_value(subprogram.offset, &value, pc)
    }

    /// Compiled location of `object` at `pc`
    ///
    /// Objects without a location but with `DW_AT_const_value` get a
    /// program producing that constant. `None` means optimized out.
    pub fn location_code_for_data_object(&self, object: &DataObject<'a>, pc: u32) -> EmdbgResult<Option<Program>>
    {
        if let Some(location) = &object.location {
            return self.compile_location_value(object.die_offset, location, pc);
        }
        let program = match object.const_value {
            Some(FormValue::Block(bytes)) | Some(FormValue::Data16(bytes)) if bytes.len() <= 4 => {
                Program::new(vec![Word::ImplicitValue(le_value(bytes))])
            }
            Some(value) => match value.as_constant() {
                Some(constant) => Program::new(vec![Word::Literal(constant as u32), Word::StackValue]),
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        Ok(Some(program))
    }

    fn compile_location_value(&self, die_offset: u32, value: &FormValue<'a>, pc: u32) -> EmdbgResult<Option<Program>>
    {
        let unit = self.unit_for_die_offset(die_offset)?;
        let Some(expression) = self.location_expression_for_pc(value, unit, pc)? else {
            return Ok(None);
        };
        ExpressionCompiler::new(self, CompileMode::Strict)
            .compile(expression, unit.cu_header_offset())
            .map(Some)
    }

    /// `DW_AT_name`, looking through origins and specifications
    pub fn name_of_die(&self, offset: u32) -> EmdbgResult<Option<String>>
    {
        Ok(self
            .origin_attribute(offset, dw::DW_AT_name)?
            .map(|value| self.attribute_string(offset, &value))
            .transpose()?
            .flatten())
    }

    fn attribute_string(&self, offset: u32, value: &FormValue<'a>) -> EmdbgResult<Option<String>>
    {
        let bases = self.unit_for_die_offset(offset)?.bases;
        Ok(self.resolve_string(value, &bases)?.map(str::to_owned))
    }

    /// Declaration coordinates from `DW_AT_decl_file`/`DW_AT_decl_line`
    pub fn source_code_coordinates_for_die_offset(&self, offset: u32) -> EmdbgResult<Option<SourceCoordinates>>
    {
        let (Some(file), Some(line)) = (
            self.origin_attribute(offset, dw::DW_AT_decl_file)?.and_then(|value| value.as_constant()),
            self.origin_attribute(offset, dw::DW_AT_decl_line)?.and_then(|value| value.as_constant()),
        ) else {
            return Ok(None);
        };
        let column = self
            .origin_attribute(offset, dw::DW_AT_decl_column)?
            .and_then(|value| value.as_constant())
            .unwrap_or(0);
        let unit = self.unit_for_die_offset(offset)?;
        let Some(program) = self.line_program(unit)? else {
            return Ok(None);
        };
        Ok(Some(SourceCoordinates {
            file: program.file_path(file as u32).unwrap_or_else(|| "??".to_owned()),
            line: line as u32,
            column: column as u32,
            is_address_on_exact_line_number_boundary: false,
        }))
    }

    /// First DIE on the origin chain of `offset` carrying `name`, and its value
    fn origin_attribute(&self, offset: u32, name: gimli::DwAt) -> EmdbgResult<Option<FormValue<'a>>>
    {
        let mut current = offset;
        for _ in 0..MAX_ORIGIN_DEPTH {
            if let Some(value) = self.attribute(current, name)? {
                return Ok(Some(value));
            }
            let origin = match self.reference_attribute(current, dw::DW_AT_abstract_origin)? {
                Some(origin) => Some(origin),
                None => self.reference_attribute(current, dw::DW_AT_specification)?,
            };
            match origin {
                Some(origin) if origin != current => current = origin,
                Some(_) => {
                    return Err(EmdbgError::malformed(
                        ".debug_info",
                        current as usize,
                        "DIE refers to itself as its own origin",
                    ))
                }
                None => return Ok(None),
            }
        }
        tracing::warn!(offset = format_args!("0x{offset:x}"), "Origin chain too long");
        Ok(None)
    }

    fn origin_reference(&self, offset: u32, name: gimli::DwAt) -> EmdbgResult<Option<u32>>
    {
        let mut current = offset;
        for _ in 0..MAX_ORIGIN_DEPTH {
            if let Some(reference) = self.reference_attribute(current, name)? {
                return Ok(Some(reference));
            }
            match self.reference_attribute(current, dw::DW_AT_abstract_origin)? {
                Some(origin) if origin != current => current = origin,
                _ => return Ok(None),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn die(tag: DwTag, offset: u32) -> Die
    {
        Die {
            tag,
            offset,
            abbrev_offset: 0,
            has_children: true,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_inlining_chain_is_innermost_first()
    {
        let context = vec![
            die(dw::DW_TAG_compile_unit, 0x0b),
            die(dw::DW_TAG_subprogram, 0x20),
            die(dw::DW_TAG_inlined_subroutine, 0x30),
            die(dw::DW_TAG_lexical_block, 0x40),
            die(dw::DW_TAG_inlined_subroutine, 0x50),
        ];
        let chain: Vec<u32> = inlining_chain_of_context(&context).iter().map(|die| die.offset).collect();
        assert_eq!(chain, vec![0x50, 0x30]);
        assert_eq!(top_level_subprogram_of_context(&context).map(|die| die.offset), Some(0x20));
        assert!(top_level_subprogram_of_context(&context[..1]).is_none());
    }
}
