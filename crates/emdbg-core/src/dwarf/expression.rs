//! # DWARF Expression Compiler
//!
//! Translates DWARF location expressions into stack machine [`Program`]s.
//!
//! ## Control flow
//!
//! `DW_OP_bra` and `DW_OP_skip` are accepted only as forward branches, and
//! only one may be pending at a time. A branch becomes `If` and the opcode
//! at its target is preceded by `Then`:
//!
//! - `DW_OP_bra` compiles to `0= if`, skipping the body when the popped
//!   value is non-zero
//! - `DW_OP_skip` compiles to `0 if`, always skipping the body
//!
//! ## Modes
//!
//! In [`CompileMode::Strict`] an untranslatable opcode is an error. In
//! [`CompileMode::Diagnostic`] compilation stops at that opcode and the
//! program ends with [`Word::Unsupported`]; the opcode is tallied so a
//! coverage report can list what the debug information needs.

use std::collections::BTreeMap;

use gimli::constants as dw;
use gimli::DwOp;

use super::reader::Reader;
use super::DwarfData;
use crate::bytecode::{Program, Word};
use crate::error::{EmdbgError, EmdbgResult};

const SECTION: &str = "DWARF expression";

/// How untranslatable opcodes are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompileMode
{
    /// Fail the whole expression
    #[default]
    Strict,
    /// Emit a placeholder and stop translating
    Diagnostic,
}

/// Expression compiler bound to one image's debug information
#[derive(Debug)]
pub struct ExpressionCompiler<'d, 'a>
{
    dwarf: &'d DwarfData<'a>,
    mode: CompileMode,
    unsupported: BTreeMap<u8, usize>,
}

impl<'d, 'a> ExpressionCompiler<'d, 'a>
{
    pub fn new(dwarf: &'d DwarfData<'a>, mode: CompileMode) -> Self
    {
        Self {
            dwarf,
            mode,
            unsupported: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> CompileMode
    {
        self.mode
    }

    /// Opcodes that could not be translated, with how often each was seen
    pub fn unsupported_opcodes(&self) -> &BTreeMap<u8, usize>
    {
        &self.unsupported
    }

    /// Compile one expression block
    ///
    /// `cu_header_offset` is the header offset of the unit the expression
    /// came from; typed operations carry unit-relative DIE offsets.
    ///
    /// ## Errors
    ///
    /// - `UnsupportedOpcode`, `NegativeBranch`, `NestedBranch` in strict mode
    /// - `UnexpectedEof` when an operand runs past the block
    /// - `Malformed` when a branch target is not an opcode boundary
    pub fn compile(&mut self, expression: &[u8], cu_header_offset: u32) -> EmdbgResult<Program>
    {
        let mut reader = Reader::new(SECTION, expression);
        let mut program = Program::default();
        let mut pending_branch: Option<usize> = None;

        while !reader.is_empty() {
            let position = reader.offset();
            if let Some(target) = pending_branch {
                if target == position {
                    program.push(Word::Then);
                    pending_branch = None;
                } else if target < position {
                    return Err(reader.malformed(format!("branch target {target} is inside an operand")));
                }
            }

            let opcode = DwOp(reader.u8()?);
            let result = self.translate(opcode, &mut reader, cu_header_offset, &mut pending_branch, &mut program);
            match result {
                Ok(()) => {}
                Err(error) if Self::is_untranslatable(&error) => {
                    *self.unsupported.entry(opcode.0).or_default() += 1;
                    if self.mode == CompileMode::Strict {
                        return Err(error);
                    }
                    tracing::debug!(%opcode, position, %error, "Stopping expression translation");
                    program.push(Word::Unsupported(opcode.0));
                    return Ok(program);
                }
                Err(error) => return Err(error),
            }
        }

        match pending_branch {
            Some(target) if target == expression.len() => program.push(Word::Then),
            Some(target) => {
                return Err(EmdbgError::malformed(
                    SECTION,
                    target,
                    "branch target lies beyond the expression",
                ))
            }
            None => {}
        }
        Ok(program)
    }

    fn is_untranslatable(error: &EmdbgError) -> bool
    {
        matches!(
            error,
            EmdbgError::UnsupportedOpcode { .. } | EmdbgError::NegativeBranch(_) | EmdbgError::NestedBranch
        )
    }

    #[allow(clippy::too_many_lines)]
    fn translate(
        &mut self,
        opcode: DwOp,
        reader: &mut Reader<'_>,
        cu_header_offset: u32,
        pending_branch: &mut Option<usize>,
        program: &mut Program,
    ) -> EmdbgResult<()>
    {
        let offset = reader.offset() - 1;
        let unsupported = || EmdbgError::UnsupportedOpcode { opcode, offset };

        let raw = opcode.0;
        let word = match opcode {
            dw::DW_OP_addr => Word::Literal(reader.u32()?),
            dw::DW_OP_const1u => Word::Literal(u32::from(reader.u8()?)),
            dw::DW_OP_const1s => Word::Literal(i32::from(reader.i8()?) as u32),
            dw::DW_OP_const2u => Word::Literal(u32::from(reader.u16()?)),
            dw::DW_OP_const2s => Word::Literal(i32::from(reader.i16()?) as u32),
            dw::DW_OP_const4u => Word::Literal(reader.u32()?),
            dw::DW_OP_const4s => Word::Literal(reader.i32()? as u32),
            dw::DW_OP_const8u | dw::DW_OP_const8s => Word::Literal(reader.u64()? as u32),
            dw::DW_OP_constu => Word::Literal(reader.uleb128()? as u32),
            dw::DW_OP_consts => Word::Literal(reader.sleb128()? as u32),
            _ if (dw::DW_OP_lit0.0..=dw::DW_OP_lit31.0).contains(&raw) => {
                Word::Literal(u32::from(raw - dw::DW_OP_lit0.0))
            }
            _ if (dw::DW_OP_reg0.0..=dw::DW_OP_reg31.0).contains(&raw) => {
                Word::Register(u32::from(raw - dw::DW_OP_reg0.0))
            }
            dw::DW_OP_regx => Word::Register(reader.uleb128_u32()?),
            _ if (dw::DW_OP_breg0.0..=dw::DW_OP_breg31.0).contains(&raw) => Word::RegisterValue {
                register: u32::from(raw - dw::DW_OP_breg0.0),
                offset: reader.sleb128_i32()?,
            },
            dw::DW_OP_bregx => {
                let register = reader.uleb128_u32()?;
                Word::RegisterValue {
                    register,
                    offset: reader.sleb128_i32()?,
                }
            }
            dw::DW_OP_fbreg => Word::FrameBase(reader.sleb128_i32()?),
            dw::DW_OP_call_frame_cfa => Word::CallFrameCfa,

            dw::DW_OP_dup => Word::Dup,
            dw::DW_OP_drop => Word::Drop,
            dw::DW_OP_over => Word::Over,
            dw::DW_OP_pick => Word::Pick(reader.u8()?),
            dw::DW_OP_swap => Word::Swap,
            dw::DW_OP_rot => Word::Rot,
            dw::DW_OP_deref => Word::Deref,
            dw::DW_OP_deref_size => {
                let size = reader.u8()?;
                if size == 0 || size > 4 {
                    return Err(unsupported());
                }
                Word::DerefSize(size)
            }

            dw::DW_OP_abs => Word::Abs,
            dw::DW_OP_and => Word::And,
            dw::DW_OP_div => Word::Div,
            dw::DW_OP_minus => Word::Minus,
            dw::DW_OP_mod => Word::Mod,
            dw::DW_OP_mul => Word::Mul,
            dw::DW_OP_neg => Word::Neg,
            dw::DW_OP_not => Word::Not,
            dw::DW_OP_or => Word::Or,
            dw::DW_OP_plus => Word::Plus,
            dw::DW_OP_plus_uconst => {
                program.push(Word::Literal(reader.uleb128()? as u32));
                Word::Plus
            }
            dw::DW_OP_shl => Word::Shl,
            dw::DW_OP_shr => Word::Shr,
            dw::DW_OP_shra => Word::Shra,
            dw::DW_OP_xor => Word::Xor,

            dw::DW_OP_eq => Word::Eq,
            dw::DW_OP_ge => Word::Ge,
            dw::DW_OP_gt => Word::Gt,
            dw::DW_OP_le => Word::Le,
            dw::DW_OP_lt => Word::Lt,
            dw::DW_OP_ne => Word::Ne,

            dw::DW_OP_bra | dw::DW_OP_skip => {
                let displacement = reader.i16()?;
                if displacement < 0 {
                    return Err(EmdbgError::NegativeBranch(displacement));
                }
                if pending_branch.is_some() {
                    return Err(EmdbgError::NestedBranch);
                }
                *pending_branch = Some(reader.offset() + displacement as usize);
                if opcode == dw::DW_OP_bra {
                    program.push(Word::ZeroEquals);
                } else {
                    program.push(Word::Literal(0));
                }
                Word::If
            }

            dw::DW_OP_nop => return Ok(()),
            dw::DW_OP_piece => Word::Piece(reader.uleb128_u32()?),
            dw::DW_OP_bit_piece => {
                let size = reader.uleb128_u32()?;
                let bit_offset = reader.uleb128()?;
                if size % 8 != 0 || bit_offset != 0 {
                    return Err(unsupported());
                }
                Word::Piece(size / 8)
            }
            dw::DW_OP_stack_value => Word::StackValue,
            dw::DW_OP_implicit_value => {
                let length = reader.uleb128()?;
                if length > 4 {
                    return Err(unsupported());
                }
                let bytes = reader.bytes(length as usize)?;
                Word::ImplicitValue(le_value(bytes))
            }
            dw::DW_OP_entry_value | dw::DW_OP_GNU_entry_value => {
                let length = reader.uleb128()?;
                let length = usize::try_from(length).map_err(|_| reader.malformed("entry value length"))?;
                Word::EntryValue(reader.bytes(length)?.to_vec())
            }
            dw::DW_OP_addrx | dw::DW_OP_constx | dw::DW_OP_GNU_addr_index | dw::DW_OP_GNU_const_index => {
                let index = reader.uleb128()?;
                let unit = self
                    .dwarf
                    .unit_by_header_offset(cu_header_offset)
                    .ok_or(EmdbgError::NotADie(cu_header_offset))?;
                Word::Literal(self.dwarf.address_at_index(&unit.bases, index)?)
            }

            dw::DW_OP_const_type | dw::DW_OP_GNU_const_type => {
                let base_type = reader.uleb128_u32()?;
                let size = reader.u8()?;
                let bytes = reader.bytes(usize::from(size))?;
                if size > 4 {
                    return Err(unsupported());
                }
                program.push(Word::Literal(le_value(bytes)));
                self.convert(base_type, cu_header_offset).ok_or_else(unsupported)?
            }
            dw::DW_OP_regval_type | dw::DW_OP_GNU_regval_type => {
                let register = reader.uleb128_u32()?;
                let base_type = reader.uleb128_u32()?;
                program.push(Word::RegisterValue { register, offset: 0 });
                self.convert(base_type, cu_header_offset).ok_or_else(unsupported)?
            }
            dw::DW_OP_deref_type | dw::DW_OP_GNU_deref_type => {
                let size = reader.u8()?;
                let base_type = reader.uleb128_u32()?;
                if size == 0 || size > 4 {
                    return Err(unsupported());
                }
                program.push(Word::DerefSize(size));
                self.convert(base_type, cu_header_offset).ok_or_else(unsupported)?
            }
            dw::DW_OP_convert | dw::DW_OP_GNU_convert | dw::DW_OP_reinterpret | dw::DW_OP_GNU_reinterpret => {
                let base_type = reader.uleb128_u32()?;
                if base_type == 0 {
                    return Ok(());
                }
                self.convert(base_type, cu_header_offset).ok_or_else(unsupported)?
            }

            // xderef, calls, TLS, object addresses and implicit pointers
            _ => return Err(unsupported()),
        };
        program.push(word);
        Ok(())
    }

    /// `Convert` word for a unit-relative base type offset
    ///
    /// `None` when the base type is wider than a cell or cannot be read.
    fn convert(&self, relative: u32, cu_header_offset: u32) -> Option<Word>
    {
        let base_type = cu_header_offset.checked_add(relative)?;
        let byte_size = self
            .dwarf
            .constant_attribute(base_type, dw::DW_AT_byte_size)
            .ok()
            .flatten()?;
        if byte_size == 0 || byte_size > 4 {
            return None;
        }
        let encoding = self
            .dwarf
            .constant_attribute(base_type, dw::DW_AT_encoding)
            .ok()
            .flatten()
            .unwrap_or(0);
        let signed = encoding == u64::from(dw::DW_ATE_signed.0) || encoding == u64::from(dw::DW_ATE_signed_char.0);
        Some(Word::Convert {
            base_type,
            byte_size: byte_size as u8,
            signed,
        })
    }
}

pub(crate) fn le_value(bytes: &[u8]) -> u32
{
    bytes
        .iter()
        .rev()
        .fold(0u32, |value, &byte| (value << 8) | u32::from(byte))
}

/// Human readable name of an expression opcode
pub fn opcode_name(opcode: u8) -> String
{
    DwOp(opcode).to_string()
}
