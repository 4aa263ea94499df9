//! # Location Evaluator
//!
//! Runs compiled location programs against a target and reads the bytes
//! they describe.
//!
//! [`DwarfEvaluator`] is the [`MachineHost`] of the stack machine: memory
//! comes from the [`Target`], registers from the active frame of the
//! [`RegisterCache`], and `DW_OP_entry_value` is answered by finding the
//! call site in the caller and evaluating its `DW_AT_call_value` there.
//!
//! ## Unavailable data
//!
//! Missing memory, registers or frames do not fail an evaluation. The
//! location becomes [`DwarfExpressionValue::Invalid`] and fetched bytes come
//! back as `None`, which value formatting renders as `??`.
//!
//! ## Example
//!
//! ```rust
//! use emdbg_core::bytecode::{Program, Word};
//! use emdbg_core::dwarf::{DebugSections, DwarfData};
//! use emdbg_core::evaluator::{DwarfEvaluator, DwarfExpressionValue};
//! use emdbg_core::registers::RegisterCache;
//! use emdbg_core::target::CorefileTarget;
//!
//! let dwarf = DwarfData::new(DebugSections::default()).unwrap();
//! let mut target = CorefileTarget::new([0; 16]);
//! let mut registers = RegisterCache::with_registers([0; 16]);
//! let mut evaluator = DwarfEvaluator::new(&dwarf, &mut target, &mut registers);
//!
//! let frame_base = Program::new(vec![Word::CallFrameCfa]);
//! let location = Program::new(vec![Word::FrameBase(-8)]);
//! let value = evaluator
//!     .evaluate_location(Some(0x2000_0108), Some(&frame_base), &location)
//!     .unwrap();
//! assert_eq!(value, DwarfExpressionValue::MemoryAddress(0x2000_0100));
//! ```

use gimli::constants as dw;

use crate::bytecode::Program;
use crate::dwarf::{CompileMode, DataObject, DwarfData, ExpressionCompiler};
use crate::error::{EmdbgError, EmdbgResult};
use crate::machine::{Interpreter, MachineHost, StackMachine};
use crate::registers::{RegisterCache, PC, REGISTER_COUNT};
use crate::target::Target;

/// Where a value lives, or the value itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DwarfExpressionValue
{
    /// No location, e.g. optimized out or unavailable
    Invalid,
    Constant(u32),
    MemoryAddress(u32),
    RegisterNumber(u32),
    Composite(Vec<Piece>),
}

/// One part of a composite location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece
{
    pub value: DwarfExpressionValue,
    pub byte_size: u32,
}

/// Register named by a `DW_OP_regN`/`DW_OP_regx` block
fn entry_register(block: &[u8]) -> Option<u32>
{
    match *block {
        [opcode] if (dw::DW_OP_reg0.0..=dw::DW_OP_reg31.0).contains(&opcode) => {
            Some(u32::from(opcode - dw::DW_OP_reg0.0))
        }
        [opcode, ref operand @ ..] if opcode == dw::DW_OP_regx.0 => {
            let mut value = 0u32;
            for (index, byte) in operand.iter().enumerate() {
                value |= u32::from(byte & 0x7f).checked_shl(7 * index as u32)?;
                if byte & 0x80 == 0 {
                    return (index + 1 == operand.len()).then_some(value);
                }
            }
            None
        }
        _ => None,
    }
}

/// Evaluates location programs for one stopped target
pub struct DwarfEvaluator<'e, 'a, T: Target + ?Sized>
{
    dwarf: &'e DwarfData<'a>,
    target: &'e mut T,
    registers: &'e mut RegisterCache,
}

impl<'e, 'a, T: Target + ?Sized> DwarfEvaluator<'e, 'a, T>
{
    pub fn new(dwarf: &'e DwarfData<'a>, target: &'e mut T, registers: &'e mut RegisterCache) -> Self
    {
        Self {
            dwarf,
            target,
            registers,
        }
    }

    pub fn registers(&self) -> &RegisterCache
    {
        self.registers
    }

    /// Evaluate `location` in the active frame
    ///
    /// `frame_base` is the compiled `DW_AT_frame_base` of the enclosing
    /// function; `cfa` the canonical frame address of the active frame, if
    /// the caller has been unwound.
    ///
    /// ## Errors
    ///
    /// Evaluation faults such as stack underflow. Unavailable data yields
    /// `Ok(DwarfExpressionValue::Invalid)` instead.
    pub fn evaluate_location(
        &mut self,
        cfa: Option<u32>,
        frame_base: Option<&Program>,
        location: &Program,
    ) -> EmdbgResult<DwarfExpressionValue>
    {
        match self.run_location(cfa, frame_base, location) {
            Err(error) if error.is_unavailable() => {
                tracing::warn!(%error, "Cannot evaluate location");
                Ok(DwarfExpressionValue::Invalid)
            }
            result => result,
        }
    }

    fn run_location(
        &mut self,
        cfa: Option<u32>,
        frame_base: Option<&Program>,
        location: &Program,
    ) -> EmdbgResult<DwarfExpressionValue>
    {
        let mut machine = Interpreter::new();
        machine.set_cfa(cfa);
        if let Some(frame_base) = frame_base {
            // Locations that do not use DW_OP_fbreg still evaluate without it
            let base = match self.run_frame_base(&mut machine, frame_base) {
                Ok(base) => Some(base),
                Err(error) if error.is_unavailable() => {
                    tracing::debug!(%error, "Frame base unavailable");
                    None
                }
                Err(error) => return Err(error),
            };
            machine.reset();
            machine.set_frame_base(base);
        }
        machine.execute(location, self)?;
        let value = machine.expression_value();
        tracing::trace!(%location, ?value, "Evaluated location");
        Ok(value)
    }

    fn run_frame_base(&mut self, machine: &mut Interpreter, frame_base: &Program) -> EmdbgResult<u32>
    {
        machine.execute(frame_base, self)?;
        match machine.expression_value() {
            DwarfExpressionValue::RegisterNumber(register) => self.registers.register(register),
            DwarfExpressionValue::Constant(value) | DwarfExpressionValue::MemoryAddress(value) => Ok(value),
            other => Err(EmdbgError::Evaluation(format!(
                "frame base is not a single location: {other:?}"
            ))),
        }
    }

    /// Read `bytesize` bytes of the value at `value`
    ///
    /// Bytes that cannot be obtained are `None`. Register values wider than
    /// a register continue in the following registers.
    pub fn fetch_value_from_target(&mut self, value: &DwarfExpressionValue, bytesize: usize) -> Vec<Option<u8>>
    {
        let mut bytes = match value {
            DwarfExpressionValue::Invalid => Vec::new(),
            DwarfExpressionValue::Constant(constant) => constant.to_le_bytes().map(Some).to_vec(),
            DwarfExpressionValue::MemoryAddress(address) => match self.target.read_bytes(*address, bytesize, true) {
                Ok(bytes) => bytes.into_iter().map(Some).collect(),
                Err(error) => {
                    tracing::debug!(%error, "Value unavailable");
                    Vec::new()
                }
            },
            DwarfExpressionValue::RegisterNumber(register) => {
                let count = bytesize.div_ceil(4).max(1);
                (*register..)
                    .take(count)
                    .flat_map(|register| match self.registers.register(register) {
                        Ok(value) => value.to_le_bytes().map(Some),
                        Err(_) => [None; 4],
                    })
                    .collect()
            }
            DwarfExpressionValue::Composite(pieces) => pieces
                .iter()
                .flat_map(|piece| self.fetch_value_from_target(&piece.value, piece.byte_size as usize))
                .collect(),
        };
        bytes.resize(bytesize, None);
        bytes
    }

    /// Location and bytes of `object` as seen by `frame`
    ///
    /// Caller frames are looked up at `pc - 1`, inside the call instruction,
    /// so a call at the very end of a scope still resolves to that scope.
    pub fn evaluate_data_object(
        &mut self,
        frame: usize,
        object: &DataObject<'a>,
        bytesize: usize,
    ) -> EmdbgResult<(DwarfExpressionValue, Vec<Option<u8>>)>
    {
        let pc = self.registers.frame(frame)?[PC as usize];
        let lookup = if frame == 0 { pc } else { pc.wrapping_sub(1) };
        let Some(location) = self.dwarf.location_code_for_data_object(object, lookup)? else {
            return Ok((DwarfExpressionValue::Invalid, vec![None; bytesize]));
        };
        let context = self.dwarf.execution_context_for_address(lookup)?;
        let frame_base = self.dwarf.frame_base_code_for_context(&context, lookup)?;
        let cfa = self.registers.cfa_value_for_frame(frame);

        let mut guard = self.registers.enter_frame(frame)?;
        let mut nested = DwarfEvaluator::new(self.dwarf, &mut *self.target, &mut guard);
        let value = nested.evaluate_location(cfa, frame_base.as_ref(), &location)?;
        let bytes = nested.fetch_value_from_target(&value, bytesize);
        Ok((value, bytes))
    }

    /// Value the register in `block` had when the active frame was called
    fn resolve_entry_value(&mut self, block: &[u8]) -> EmdbgResult<u32>
    {
        let register = entry_register(block).ok_or_else(|| {
            EmdbgError::EntryValueUnavailable(format!("entry value of non-register expression {block:02x?}"))
        })?;
        let caller = self.registers.active_frame() + 1;
        let return_address = self.registers.frame(caller)?[PC as usize];
        let site = self.dwarf.call_site_at_address(return_address)?.ok_or_else(|| {
            EmdbgError::EntryValueUnavailable(format!("no call site returning to 0x{return_address:08x}"))
        })?;

        let tree = self.dwarf.debug_tree_of_die(site.offset, Some(1))?;
        for parameter in tree.children.iter().filter(|child| {
            matches!(
                child.tag,
                dw::DW_TAG_call_site_parameter | dw::DW_TAG_GNU_call_site_parameter
            )
        }) {
            let location = self.dwarf.attribute(parameter.offset, dw::DW_AT_location)?;
            if location.and_then(|value| value.as_block()).and_then(entry_register) != Some(register) {
                continue;
            }
            let value = match self.dwarf.attribute(parameter.offset, dw::DW_AT_call_value)? {
                Some(value) => Some(value),
                None => self.dwarf.attribute(parameter.offset, dw::DW_AT_GNU_call_site_value)?,
            };
            let Some(expression) = value.and_then(|value| value.as_block()) else {
                continue;
            };
            return self.evaluate_call_value(caller, return_address, parameter.offset, expression);
        }
        Err(EmdbgError::EntryValueUnavailable(format!(
            "call site 0x{:x} has no value for r{register}",
            site.offset
        )))
    }

    fn evaluate_call_value(
        &mut self,
        caller: usize,
        return_address: u32,
        parameter: u32,
        expression: &[u8],
    ) -> EmdbgResult<u32>
    {
        let unit_offset = self.dwarf.unit_for_die_offset(parameter)?.cu_header_offset();
        let program = ExpressionCompiler::new(self.dwarf, CompileMode::Strict).compile(expression, unit_offset)?;
        let lookup = return_address.wrapping_sub(1);
        let context = self.dwarf.execution_context_for_address(lookup)?;
        let frame_base = self.dwarf.frame_base_code_for_context(&context, lookup)?;
        let cfa = self.registers.cfa_value_for_frame(caller);

        let mut guard = self.registers.enter_frame(caller)?;
        tracing::debug!(caller, parameter = format_args!("0x{parameter:x}"), "Evaluating entry value");
        let mut nested = DwarfEvaluator::new(self.dwarf, &mut *self.target, &mut guard);
        match nested.evaluate_location(cfa, frame_base.as_ref(), &program)? {
            DwarfExpressionValue::Constant(value) | DwarfExpressionValue::MemoryAddress(value) => Ok(value),
            DwarfExpressionValue::RegisterNumber(register) => nested.registers.register(register),
            other => Err(EmdbgError::EntryValueUnavailable(format!(
                "call value evaluated to {other:?}"
            ))),
        }
    }
}

impl<T: Target + ?Sized> MachineHost for DwarfEvaluator<'_, '_, T>
{
    fn read_memory(&mut self, address: u32, length: usize) -> EmdbgResult<Vec<u8>>
    {
        self.target.read_bytes(address, length, true)
    }

    fn read_register(&mut self, register: u32) -> EmdbgResult<u32>
    {
        if register as usize >= REGISTER_COUNT {
            return Err(EmdbgError::RegisterUnavailable(register));
        }
        self.registers.register(register)
    }

    fn entry_value(&mut self, expression: &[u8]) -> EmdbgResult<u32>
    {
        self.resolve_entry_value(expression)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::bytecode::Word;
    use crate::dwarf::DebugSections;
    use crate::registers::SP;
    use crate::target::CorefileTarget;

    fn registers() -> RegisterCache
    {
        let mut frame = [0; REGISTER_COUNT];
        frame[0] = 0x1122_3344;
        frame[1] = 0x5566_7788;
        frame[7] = 0x2000_0010;
        frame[SP as usize] = 0x2000_0000;
        RegisterCache::with_registers(frame)
    }

    fn target() -> CorefileTarget
    {
        CorefileTarget::new([0; REGISTER_COUNT]).with_ram(0x2000_0000, (0u8..0x20).collect())
    }

    #[test]
    fn test_entry_register()
    {
        assert_eq!(entry_register(&[0x50]), Some(0));
        assert_eq!(entry_register(&[0x5d]), Some(13));
        assert_eq!(entry_register(&[0x90, 0x81, 0x01]), Some(129));
        assert_eq!(entry_register(&[0x90, 0x81]), None);
        assert_eq!(entry_register(&[0x91, 0x00]), None);
    }

    #[test]
    fn test_frame_base_in_register()
    {
        let dwarf = DwarfData::new(DebugSections::default()).unwrap();
        let mut target = target();
        let mut registers = registers();
        let mut evaluator = DwarfEvaluator::new(&dwarf, &mut target, &mut registers);
        let frame_base = Program::new(vec![Word::Register(7)]);
        let location = Program::new(vec![Word::FrameBase(4)]);
        let value = evaluator.evaluate_location(None, Some(&frame_base), &location).unwrap();
        assert_eq!(value, DwarfExpressionValue::MemoryAddress(0x2000_0014));
        assert_eq!(
            evaluator.fetch_value_from_target(&value, 2),
            vec![Some(0x14), Some(0x15)]
        );
    }

    #[test]
    fn test_unavailable_register_is_invalid()
    {
        let dwarf = DwarfData::new(DebugSections::default()).unwrap();
        let mut target = target();
        let mut registers = registers();
        let mut evaluator = DwarfEvaluator::new(&dwarf, &mut target, &mut registers);
        let location = Program::new(vec![Word::RegisterValue {
            register: 20,
            offset: 0,
        }]);
        assert_eq!(
            evaluator.evaluate_location(None, None, &location).unwrap(),
            DwarfExpressionValue::Invalid
        );
    }

    #[test]
    fn test_entry_value_without_caller_is_invalid()
    {
        let dwarf = DwarfData::new(DebugSections::default()).unwrap();
        let mut target = target();
        let mut registers = registers();
        let mut evaluator = DwarfEvaluator::new(&dwarf, &mut target, &mut registers);
        let location = Program::new(vec![Word::EntryValue(vec![0x50]), Word::StackValue]);
        assert_eq!(
            evaluator.evaluate_location(None, None, &location).unwrap(),
            DwarfExpressionValue::Invalid
        );
        assert_eq!(evaluator.registers().active_frame(), 0);
    }

    #[test]
    fn test_evaluation_faults_propagate()
    {
        let dwarf = DwarfData::new(DebugSections::default()).unwrap();
        let mut target = target();
        let mut registers = registers();
        let mut evaluator = DwarfEvaluator::new(&dwarf, &mut target, &mut registers);
        let location = Program::new(vec![Word::Plus]);
        assert!(matches!(
            evaluator.evaluate_location(None, None, &location),
            Err(EmdbgError::StackUnderflow(_))
        ));
    }

    #[test]
    fn test_fetch_register_pair_and_composite()
    {
        let dwarf = DwarfData::new(DebugSections::default()).unwrap();
        let mut target = target();
        let mut registers = registers();
        let mut evaluator = DwarfEvaluator::new(&dwarf, &mut target, &mut registers);

        let pair = evaluator.fetch_value_from_target(&DwarfExpressionValue::RegisterNumber(0), 8);
        assert_eq!(pair[0], Some(0x44));
        assert_eq!(pair[7], Some(0x55));

        let composite = DwarfExpressionValue::Composite(vec![
            Piece {
                value: DwarfExpressionValue::Constant(0xaabb),
                byte_size: 2,
            },
            Piece {
                value: DwarfExpressionValue::MemoryAddress(0x3000_0000),
                byte_size: 2,
            },
        ]);
        assert_eq!(
            evaluator.fetch_value_from_target(&composite, 4),
            vec![Some(0xbb), Some(0xaa), None, None]
        );
        assert_eq!(
            evaluator.fetch_value_from_target(&DwarfExpressionValue::Invalid, 3),
            vec![None; 3]
        );
    }
}
