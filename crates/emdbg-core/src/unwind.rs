//! # Cortex-M Stack Unwinder
//!
//! Reconstructs caller frames from `.debug_frame` and fills the
//! [`RegisterCache`] while walking the stack.
//!
//! ## Strategy
//!
//! For each frame, in order:
//!
//! 1. **Call frame information**: run the CFA program of the FDE covering
//!    the frame's PC up to that PC, compute the CFA and restore saved
//!    registers. The caller's SP is the CFA; its PC is the return address
//!    with the Thumb bit cleared.
//! 2. **Exception stack frame**: when the PC holds an `EXC_RETURN` value
//!    the processor pushed a basic (or FPU-extended) frame on exception
//!    entry. Pop it to reach the interrupted code.
//!
//! The walk stops when neither applies, when the PC and SP stop changing,
//! or when the frame limit is reached.

use crate::bytecode::Program;
use crate::dwarf::context::{inlining_chain_of_context, top_level_subprogram_of_context};
use crate::dwarf::{DwarfData, SourceCoordinates};
use crate::error::{EmdbgError, EmdbgResult};
use crate::machine::{Interpreter, MachineHost, RegisterRule, StackMachine};
use crate::registers::{RegisterCache, RegisterFrame, LR, PC, SP};
use crate::target::Target;

/// Frame limit used by [`CortexM0Unwinder::new`]
pub const DEFAULT_MAX_FRAMES: usize = 64;

/// Top byte pattern of `EXC_RETURN` values
const EXC_RETURN_MASK: u32 = 0xffff_ff00;
/// `EXC_RETURN` bit 4 clear: the frame holds floating-point state too
const EXC_RETURN_STANDARD_FRAME: u32 = 1 << 4;
/// xPSR bit 9: the processor aligned the stack to 8 bytes on entry
const XPSR_STACK_ALIGNED: u32 = 1 << 9;
const BASIC_FRAME_SIZE: u32 = 8 * 4;
const FPU_STATE_SIZE: u32 = 18 * 4;

/// How a frame's registers were recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus
{
    /// The registers the target reported
    Current,
    /// Call frame information restored the registers
    Complete,
    /// Popped from an exception stack frame
    Exception,
}

/// One frame of a backtrace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceFrame
{
    pub index: usize,
    pub pc: u32,
    pub sp: u32,
    pub function: Option<String>,
    /// Inlined subroutines at `pc`, innermost first
    pub inlined: Vec<String>,
    pub coordinates: Option<SourceCoordinates>,
    pub status: FrameStatus,
}

impl BacktraceFrame
{
    pub fn is_exception_frame(&self) -> bool
    {
        self.status == FrameStatus::Exception
    }
}

/// Memory and registers of the frame being unwound
struct FrameHost<'r, T: ?Sized>
{
    registers: &'r RegisterFrame,
    target: &'r mut T,
}

impl<T: Target + ?Sized> MachineHost for FrameHost<'_, T>
{
    fn read_memory(&mut self, address: u32, length: usize) -> EmdbgResult<Vec<u8>>
    {
        self.target.read_bytes(address, length, true)
    }

    fn read_register(&mut self, register: u32) -> EmdbgResult<u32>
    {
        self.registers
            .get(register as usize)
            .copied()
            .ok_or(EmdbgError::RegisterUnavailable(register))
    }

    fn entry_value(&mut self, _expression: &[u8]) -> EmdbgResult<u32>
    {
        Err(EmdbgError::EntryValueUnavailable("entry values inside call frame programs".into()))
    }
}

/// Stack unwinder for ARMv6-M and ARMv7-M cores
pub struct CortexM0Unwinder<'d, 'a>
{
    dwarf: &'d DwarfData<'a>,
    max_frames: usize,
}

impl<'d, 'a> CortexM0Unwinder<'d, 'a>
{
    pub fn new(dwarf: &'d DwarfData<'a>) -> Self
    {
        Self {
            dwarf,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    #[must_use]
    pub fn with_max_frames(mut self, max_frames: usize) -> Self
    {
        self.max_frames = max_frames.max(1);
        self
    }

    /// Registers of the caller of the frame in `registers`
    ///
    /// `program` is the CFA program of the FDE starting at
    /// `initial_location`. Returns `None` when the rules mark the outermost
    /// frame (undefined return address) or define no CFA.
    ///
    /// ## Errors
    ///
    /// `MemoryUnavailable` if a saved register cannot be read, and faults of
    /// the CFA program.
    pub fn unwind_frame<T: Target + ?Sized>(
        program: &Program,
        initial_location: u32,
        registers: &RegisterFrame,
        target: &mut T,
    ) -> EmdbgResult<Option<RegisterFrame>>
    {
        let mut machine = Interpreter::new();
        machine.prime_unwinder(initial_location, registers[PC as usize]);
        let mut host = FrameHost { registers, target };
        machine.execute(program, &mut host)?;

        let row = machine.unwind_row();
        let Some(cfa_rule) = row.cfa else {
            tracing::debug!(pc = format_args!("0x{:08x}", registers[PC as usize]), "No CFA rule");
            return Ok(None);
        };
        let return_address_register = row.return_address_register;
        if row.rule(return_address_register) == RegisterRule::Undefined {
            return Ok(None);
        }
        let cfa = host.read_register(cfa_rule.register)?.wrapping_add_signed(cfa_rule.offset);

        let mut caller = *registers;
        for (register, slot) in (0u32..).zip(caller.iter_mut()) {
            match row.rule(register) {
                RegisterRule::Undefined | RegisterRule::SameValue => {}
                RegisterRule::Offset(offset) => *slot = host.target.read_word(cfa.wrapping_add_signed(offset), true)?,
                RegisterRule::ValOffset(offset) => *slot = cfa.wrapping_add_signed(offset),
                RegisterRule::Register(source) => *slot = host.read_register(source)?,
            }
        }
        let return_address = caller
            .get(return_address_register as usize)
            .copied()
            .ok_or(EmdbgError::RegisterUnavailable(return_address_register))?;
        caller[SP as usize] = cfa;
        caller[PC as usize] = return_address & !1;
        tracing::trace!(
            cfa = format_args!("0x{cfa:08x}"),
            return_address = format_args!("0x{return_address:08x}"),
            "Unwound frame"
        );
        Ok(Some(caller))
    }

    /// Pop the exception stack frame if `registers` returned from an
    /// exception handler
    ///
    /// The PC must hold an `EXC_RETURN` value, as it does after unwinding a
    /// handler. Only one stack pointer is tracked, so the MSP/PSP selection
    /// bit is not honoured.
    pub fn architectural_unwind<T: Target + ?Sized>(
        registers: &RegisterFrame,
        target: &mut T,
    ) -> EmdbgResult<Option<RegisterFrame>>
    {
        let pc = registers[PC as usize];
        let exc_return = if pc & EXC_RETURN_MASK == EXC_RETURN_MASK {
            pc | 1
        } else {
            return Ok(None);
        };
        let sp = registers[SP as usize];
        let mut stacked = [0u32; 8];
        for (index, slot) in (0u32..).zip(stacked.iter_mut()) {
            *slot = target.read_word(sp.wrapping_add(index * 4), true)?;
        }

        let mut caller = *registers;
        for (slot, register) in [0usize, 1, 2, 3, 12, LR as usize, PC as usize].into_iter().enumerate() {
            caller[register] = stacked[slot];
        }
        let xpsr = stacked[7];
        let mut frame_size = BASIC_FRAME_SIZE;
        if exc_return & EXC_RETURN_STANDARD_FRAME == 0 {
            frame_size += FPU_STATE_SIZE;
        }
        if xpsr & XPSR_STACK_ALIGNED != 0 {
            frame_size += 4;
        }
        caller[SP as usize] = sp.wrapping_add(frame_size);
        caller[PC as usize] &= !1;
        tracing::debug!(
            exc_return = format_args!("0x{exc_return:08x}"),
            pc = format_args!("0x{:08x}", caller[PC as usize]),
            "Popped exception stack frame"
        );
        Ok(Some(caller))
    }

    /// Walk the stack of the stopped target
    ///
    /// Clears `cache` and fills it with one register frame per returned
    /// frame, innermost first.
    ///
    /// ## Errors
    ///
    /// Decoding errors in the debug information and failure to read the
    /// current registers. Unreadable stack memory ends the walk instead.
    pub fn backtrace<T: Target + ?Sized>(
        &self,
        target: &mut T,
        cache: &mut RegisterCache,
    ) -> EmdbgResult<Vec<BacktraceFrame>>
    {
        let _span = tracing::debug_span!("backtrace").entered();
        cache.clear();
        let mut registers = target.read_registers()?;
        cache.push_frame(registers);

        let mut frames = Vec::new();
        let mut status = FrameStatus::Current;
        loop {
            frames.push(self.describe_frame(frames.len(), &registers, status)?);
            if frames.len() >= self.max_frames {
                tracing::debug!(max_frames = self.max_frames, "Frame limit reached");
                break;
            }

            let Some((caller, caller_status)) = self.unwind_step(frames.len() - 1, &registers, target)? else {
                break;
            };
            if caller[PC as usize] == 0
                || (caller[PC as usize] == registers[PC as usize] && caller[SP as usize] == registers[SP as usize])
            {
                break;
            }
            cache.push_frame(caller);
            registers = caller;
            status = caller_status;
        }
        tracing::debug!(frames = frames.len(), "Backtrace complete");
        Ok(frames)
    }

    fn unwind_step<T: Target + ?Sized>(
        &self,
        index: usize,
        registers: &RegisterFrame,
        target: &mut T,
    ) -> EmdbgResult<Option<(RegisterFrame, FrameStatus)>>
    {
        let lookup = lookup_address(index, registers);
        let unwound = match self.dwarf.unwinder().unwind_code_for_address(lookup)? {
            Some((program, initial_location)) => Self::unwind_frame(&program, initial_location, registers, target),
            None => Self::architectural_unwind(registers, target),
        };
        let step = match unwound {
            Ok(step) => step,
            Err(error) if error.is_unavailable() => {
                tracing::warn!(%error, frame = index, "Stack unwinding stopped");
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        let status = if registers[PC as usize] & EXC_RETURN_MASK == EXC_RETURN_MASK {
            FrameStatus::Exception
        } else {
            FrameStatus::Complete
        };
        Ok(step.map(|caller| (caller, status)))
    }

    fn describe_frame(&self, index: usize, registers: &RegisterFrame, status: FrameStatus) -> EmdbgResult<BacktraceFrame>
    {
        let lookup = lookup_address(index, registers);
        let context = self.dwarf.execution_context_for_address(lookup)?;
        let function = match top_level_subprogram_of_context(&context) {
            Some(subprogram) => self.dwarf.name_of_die(subprogram.offset)?,
            None => None,
        };
        let mut inlined = Vec::new();
        for die in inlining_chain_of_context(&context) {
            inlined.push(self.dwarf.name_of_die(die.offset)?.unwrap_or_else(|| "??".to_owned()));
        }
        Ok(BacktraceFrame {
            index,
            pc: registers[PC as usize],
            sp: registers[SP as usize],
            function,
            inlined,
            coordinates: self.dwarf.source_code_coordinates_for_address(lookup)?,
            status,
        })
    }
}

/// Address used to look up a frame's scope and unwind rules
///
/// Caller frames hold return addresses, which can lie past the end of the
/// calling function, so they are looked up one byte earlier. Exception
/// return values are never adjusted.
fn lookup_address(index: usize, registers: &RegisterFrame) -> u32
{
    let pc = registers[PC as usize];
    if index == 0 || pc & EXC_RETURN_MASK == EXC_RETURN_MASK {
        pc
    } else {
        pc.wrapping_sub(1)
    }
}

/// Backtrace with the default unwinder settings and `max_frames` limit
///
/// ## Example
///
/// ```rust,ignore
/// let mut cache = RegisterCache::new();
/// for frame in backtrace(&dwarf, &mut target, &mut cache, 32)? {
///     println!("#{} 0x{:08x} {}", frame.index, frame.pc, frame.function.as_deref().unwrap_or("??"));
/// }
/// ```
pub fn backtrace<T: Target + ?Sized>(
    dwarf: &DwarfData<'_>,
    target: &mut T,
    cache: &mut RegisterCache,
    max_frames: usize,
) -> EmdbgResult<Vec<BacktraceFrame>>
{
    CortexM0Unwinder::new(dwarf)
        .with_max_frames(max_frames)
        .backtrace(target, cache)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::bytecode::Word;
    use crate::registers::REGISTER_COUNT;
    use crate::target::CorefileTarget;

    fn words(values: &[u32]) -> Vec<u8>
    {
        values.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    fn push_frame_program() -> Program
    {
        // push {r4, lr} at 0x1000
        Program::new(vec![
            Word::CfaReturnAddressRegister(LR),
            Word::CfaDefCfa {
                register: SP,
                offset: 0,
            },
            Word::CfaInitialInstructionsEnd,
            Word::CfaAdvanceLoc(2),
            Word::CfaDefCfaOffset(8),
            Word::CfaOffset {
                register: LR,
                offset: -4,
            },
            Word::CfaOffset {
                register: 4,
                offset: -8,
            },
        ])
    }

    #[test]
    fn test_unwind_frame_restores_saved_registers()
    {
        let mut registers = [0; REGISTER_COUNT];
        registers[SP as usize] = 0x2000_0100;
        registers[PC as usize] = 0x1010;
        let mut target = CorefileTarget::new(registers).with_ram(0x2000_0100, words(&[0x55, 0x1021]));

        let caller = CortexM0Unwinder::unwind_frame(&push_frame_program(), 0x1000, &registers, &mut target)
            .unwrap()
            .unwrap();
        assert_eq!(caller[SP as usize], 0x2000_0108);
        assert_eq!(caller[PC as usize], 0x1020);
        assert_eq!(caller[4], 0x55);
        assert_eq!(caller[LR as usize], 0x1021);
    }

    #[test]
    fn test_unwind_frame_before_prologue()
    {
        let mut registers = [0; REGISTER_COUNT];
        registers[SP as usize] = 0x2000_0100;
        registers[LR as usize] = 0x1031;
        registers[PC as usize] = 0x1000;
        let mut target = CorefileTarget::new(registers);

        let caller = CortexM0Unwinder::unwind_frame(&push_frame_program(), 0x1000, &registers, &mut target)
            .unwrap()
            .unwrap();
        assert_eq!(caller[SP as usize], 0x2000_0100);
        assert_eq!(caller[PC as usize], 0x1030);
    }

    #[test]
    fn test_undefined_return_address_ends_stack()
    {
        let mut registers = [0; REGISTER_COUNT];
        registers[PC as usize] = 0x1000;
        let program = Program::new(vec![
            Word::CfaDefCfa {
                register: SP,
                offset: 0,
            },
            Word::CfaUndefined(LR),
        ]);
        let mut target = CorefileTarget::new(registers);
        assert_eq!(
            CortexM0Unwinder::unwind_frame(&program, 0x1000, &registers, &mut target).unwrap(),
            None
        );
    }

    #[test]
    fn test_architectural_unwind()
    {
        let mut registers = [0; REGISTER_COUNT];
        registers[SP as usize] = 0x2000_0200;
        registers[PC as usize] = 0xffff_fff8;
        // r0 r1 r2 r3 r12 lr pc xpsr, stack realigned
        let stacked = words(&[1, 2, 3, 4, 12, 0x0800_0101, 0x0800_0200, 0x0100_0200]);
        let mut target = CorefileTarget::new(registers).with_ram(0x2000_0200, stacked);

        let caller = CortexM0Unwinder::architectural_unwind(&registers, &mut target)
            .unwrap()
            .unwrap();
        assert_eq!(caller[0], 1);
        assert_eq!(caller[12], 12);
        assert_eq!(caller[LR as usize], 0x0800_0101);
        assert_eq!(caller[PC as usize], 0x0800_0200);
        assert_eq!(caller[SP as usize], 0x2000_0224);
    }

    #[test]
    fn test_architectural_unwind_needs_exc_return()
    {
        let mut registers = [0; REGISTER_COUNT];
        registers[PC as usize] = 0x0800_0200;
        let mut target = CorefileTarget::new(registers);
        assert_eq!(
            CortexM0Unwinder::architectural_unwind(&registers, &mut target).unwrap(),
            None
        );
    }

    #[test]
    fn test_lookup_address()
    {
        let mut registers = [0; REGISTER_COUNT];
        registers[PC as usize] = 0x1020;
        assert_eq!(lookup_address(0, &registers), 0x1020);
        assert_eq!(lookup_address(1, &registers), 0x101f);
        registers[PC as usize] = 0xffff_fff8;
        assert_eq!(lookup_address(1, &registers), 0xffff_fff8);
    }
}
