//! # Stack Machine
//!
//! Executes [`Program`]s produced by the expression compiler and the call
//! frame translator.
//!
//! The machine itself never touches a target. Memory, registers and entry
//! values come from a [`MachineHost`], which lets the evaluator plug in a
//! live target, a core file or a test double.
//!
//! ## Expression results
//!
//! After executing a location expression, [`StackMachine::expression_value`]
//! classifies the result:
//!
//! - a `Register` word makes the value a register location
//! - `StackValue` and `ImplicitValue` make the top of stack a constant
//! - otherwise the top of stack is a memory address
//! - `Piece` words close pieces, producing a composite value
//!
//! ## Call frame programs
//!
//! CFA words update an unwind row instead of the data stack. The machine
//! must be primed with [`Interpreter::prime_unwinder`] first: execution stops
//! as soon as an advance would move past the target address, leaving the
//! row that applies there in [`Interpreter::unwind_row`].

use crate::bytecode::{Program, Word};
use crate::error::{EmdbgError, EmdbgResult};
use crate::evaluator::{DwarfExpressionValue, Piece};
use crate::registers::REGISTER_COUNT;

/// Everything a running program may ask of the outside world
pub trait MachineHost
{
    /// Read exactly `length` bytes at `address`
    fn read_memory(&mut self, address: u32, length: usize) -> EmdbgResult<Vec<u8>>;

    /// Read one little-endian word
    fn read_word(&mut self, address: u32) -> EmdbgResult<u32>
    {
        let bytes = self.read_memory(address, 4)?;
        match <[u8; 4]>::try_from(bytes.as_slice()) {
            Ok(word) => Ok(u32::from_le_bytes(word)),
            Err(_) => Err(EmdbgError::MemoryUnavailable { address, length: 4 }),
        }
    }

    /// Value of register `register` in the frame being evaluated
    fn read_register(&mut self, register: u32) -> EmdbgResult<u32>;

    /// Value the register expression `expression` had on function entry
    fn entry_value(&mut self, expression: &[u8]) -> EmdbgResult<u32>;
}

/// Interface of a machine that runs compiled programs
pub trait StackMachine
{
    fn push(&mut self, cell: u32);

    /// Run `program` to completion
    ///
    /// ## Errors
    ///
    /// Stack underflow, division by zero, unsupported words and anything
    /// the host reports while reading memory or registers.
    fn execute(&mut self, program: &Program, host: &mut dyn MachineHost) -> EmdbgResult<()>;

    /// Pop the top `count` cells, returned bottom first
    fn results(&mut self, count: usize) -> EmdbgResult<Vec<u32>>;

    /// Pieces closed so far
    fn pieces(&self) -> &[Piece];

    /// Classify what the last executed expression computed
    fn expression_value(&mut self) -> DwarfExpressionValue;

    /// Clear expression state; frame base and CFA survive
    fn reset(&mut self);
}

/// How a register is recovered in the caller's frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegisterRule
{
    Undefined,
    /// Unchanged from the callee
    #[default]
    SameValue,
    /// Saved at `CFA + n`
    Offset(i32),
    /// The value is `CFA + n`
    ValOffset(i32),
    /// Held in another register
    Register(u32),
}

/// `CFA = register + offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfaRule
{
    pub register: u32,
    pub offset: i32,
}

/// Unwind rules in effect at one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRow
{
    pub cfa: Option<CfaRule>,
    pub rules: [RegisterRule; REGISTER_COUNT],
    pub return_address_register: u32,
}

impl Default for UnwindRow
{
    fn default() -> Self
    {
        Self {
            cfa: None,
            rules: [RegisterRule::SameValue; REGISTER_COUNT],
            return_address_register: crate::registers::LR,
        }
    }
}

impl UnwindRow
{
    pub fn rule(&self, register: u32) -> RegisterRule
    {
        self.rules
            .get(register as usize)
            .copied()
            .unwrap_or(RegisterRule::Undefined)
    }

    fn set_rule(&mut self, register: u32, rule: RegisterRule)
    {
        // Registers beyond the core set are not tracked
        if let Some(slot) = self.rules.get_mut(register as usize) {
            *slot = rule;
        }
    }
}

#[derive(Debug, Clone, Default)]
struct UnwindState
{
    location: u32,
    target: u32,
    primed: bool,
    row: UnwindRow,
    initial: Option<UnwindRow>,
    remembered: Vec<UnwindRow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ValueKind
{
    #[default]
    MemoryAddress,
    Constant,
}

/// The reference [`StackMachine`]
#[derive(Debug, Clone, Default)]
pub struct Interpreter
{
    stack: Vec<u32>,
    kind: ValueKind,
    register: Option<u32>,
    pieces: Vec<Piece>,
    frame_base: Option<u32>,
    cfa: Option<u32>,
    unwind: UnwindState,
}

impl Interpreter
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Value pushed by `FrameBase` words before adding their offset
    pub fn set_frame_base(&mut self, frame_base: Option<u32>)
    {
        self.frame_base = frame_base;
    }

    /// Value pushed by `CallFrameCfa`
    pub fn set_cfa(&mut self, cfa: Option<u32>)
    {
        self.cfa = cfa;
    }

    /// Prepare to run a call frame program for the function starting at
    /// `initial_location`, stopping at the row that covers `target`
    pub fn prime_unwinder(&mut self, initial_location: u32, target: u32)
    {
        self.unwind = UnwindState {
            location: initial_location,
            target,
            primed: true,
            ..UnwindState::default()
        };
    }

    /// Rules computed by the last call frame program
    pub fn unwind_row(&self) -> &UnwindRow
    {
        &self.unwind.row
    }

    pub fn stack(&self) -> &[u32]
    {
        &self.stack
    }

    fn pop(&mut self, word: &Word) -> EmdbgResult<u32>
    {
        self.stack
            .pop()
            .ok_or_else(|| EmdbgError::StackUnderflow(word.to_string()))
    }

    fn pop_signed(&mut self, word: &Word) -> EmdbgResult<i32>
    {
        self.pop(word).map(|cell| cell as i32)
    }

    fn binary(&mut self, word: &Word, operation: impl FnOnce(u32, u32) -> u32) -> EmdbgResult<()>
    {
        let top = self.pop(word)?;
        let second = self.pop(word)?;
        self.stack.push(operation(second, top));
        Ok(())
    }

    fn compare(&mut self, word: &Word, predicate: impl FnOnce(i32, i32) -> bool) -> EmdbgResult<()>
    {
        let top = self.pop_signed(word)?;
        let second = self.pop_signed(word)?;
        self.stack.push(u32::from(predicate(second, top)));
        Ok(())
    }

    fn deref(&mut self, word: &Word, size: u8, host: &mut dyn MachineHost) -> EmdbgResult<()>
    {
        let address = self.pop(word)?;
        let value = if size == 4 {
            host.read_word(address)?
        } else {
            let bytes = host.read_memory(address, usize::from(size))?;
            if bytes.len() != usize::from(size) {
                return Err(EmdbgError::MemoryUnavailable {
                    address,
                    length: usize::from(size),
                });
            }
            bytes
                .iter()
                .rev()
                .fold(0u32, |value, &byte| (value << 8) | u32::from(byte))
        };
        self.stack.push(value);
        Ok(())
    }

    /// Index just past the `Then` that closes the `If` before `index`
    fn skip_to_then(words: &[Word], index: usize) -> EmdbgResult<usize>
    {
        let mut depth = 0usize;
        for (position, word) in words.iter().enumerate().skip(index) {
            match word {
                Word::If => depth += 1,
                Word::Then if depth == 0 => return Ok(position + 1),
                Word::Then => depth -= 1,
                _ => {}
            }
        }
        Err(EmdbgError::Evaluation("if without matching then".into()))
    }

    fn close_piece(&mut self, byte_size: u32)
    {
        let value = if let Some(register) = self.register.take() {
            DwarfExpressionValue::RegisterNumber(register)
        } else {
            match (self.stack.pop(), self.kind) {
                (Some(cell), ValueKind::Constant) => DwarfExpressionValue::Constant(cell),
                (Some(cell), ValueKind::MemoryAddress) => DwarfExpressionValue::MemoryAddress(cell),
                (None, _) => DwarfExpressionValue::Invalid,
            }
        };
        self.pieces.push(Piece { value, byte_size });
        self.kind = ValueKind::MemoryAddress;
    }

    /// Apply one CFA word; `false` once the target address has been passed
    fn execute_cfa(&mut self, word: &Word) -> EmdbgResult<bool>
    {
        let state = &mut self.unwind;
        if !state.primed {
            return Err(EmdbgError::Evaluation(format!("{word} outside a call frame program")));
        }
        match *word {
            Word::CfaReturnAddressRegister(register) => state.row.return_address_register = register,
            Word::CfaInitialInstructionsEnd => state.initial = Some(state.row.clone()),
            Word::CfaSetLoc(address) => {
                if address > state.target {
                    return Ok(false);
                }
                state.location = address;
            }
            Word::CfaAdvanceLoc(delta) => {
                let location = state.location.wrapping_add(delta);
                if location > state.target {
                    return Ok(false);
                }
                state.location = location;
            }
            Word::CfaDefCfa { register, offset } => state.row.cfa = Some(CfaRule { register, offset }),
            Word::CfaDefCfaRegister(register) => {
                let offset = state.row.cfa.map_or(0, |cfa| cfa.offset);
                state.row.cfa = Some(CfaRule { register, offset });
            }
            Word::CfaDefCfaOffset(offset) => {
                let register = state.row.cfa.map_or(crate::registers::SP, |cfa| cfa.register);
                state.row.cfa = Some(CfaRule { register, offset });
            }
            Word::CfaOffset { register, offset } => state.row.set_rule(register, RegisterRule::Offset(offset)),
            Word::CfaValOffset { register, offset } => state.row.set_rule(register, RegisterRule::ValOffset(offset)),
            Word::CfaRegister { register, source } => state.row.set_rule(register, RegisterRule::Register(source)),
            Word::CfaUndefined(register) => state.row.set_rule(register, RegisterRule::Undefined),
            Word::CfaSameValue(register) => state.row.set_rule(register, RegisterRule::SameValue),
            Word::CfaRestore(register) => {
                let rule = state
                    .initial
                    .as_ref()
                    .map_or(RegisterRule::SameValue, |initial| initial.rule(register));
                state.row.set_rule(register, rule);
            }
            Word::CfaRememberState => state.remembered.push(state.row.clone()),
            Word::CfaRestoreState => {
                let remembered = state
                    .remembered
                    .pop()
                    .ok_or_else(|| EmdbgError::StackUnderflow(word.to_string()))?;
                state.row = remembered;
            }
            _ => return Err(EmdbgError::Evaluation(format!("{word} is not a call frame word"))),
        }
        Ok(true)
    }
}

impl StackMachine for Interpreter
{
    fn push(&mut self, cell: u32)
    {
        self.stack.push(cell);
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, program: &Program, host: &mut dyn MachineHost) -> EmdbgResult<()>
    {
        let words = &program.words;
        let mut index = 0;
        while index < words.len() {
            let word = &words[index];
            index += 1;

            if word.is_cfa() {
                if !self.execute_cfa(word)? {
                    return Ok(());
                }
                continue;
            }

            match word {
                Word::Literal(value) => self.stack.push(*value),
                Word::Dup => {
                    let top = *self.stack.last().ok_or_else(|| EmdbgError::StackUnderflow(word.to_string()))?;
                    self.stack.push(top);
                }
                Word::Drop => {
                    self.pop(word)?;
                }
                Word::Over => {
                    let value = pick(&self.stack, 1, word)?;
                    self.stack.push(value);
                }
                Word::Pick(depth) => {
                    let value = pick(&self.stack, *depth, word)?;
                    self.stack.push(value);
                }
                Word::Swap => {
                    let top = self.pop(word)?;
                    let second = self.pop(word)?;
                    self.stack.push(top);
                    self.stack.push(second);
                }
                Word::Rot => {
                    let top = self.pop(word)?;
                    let second = self.pop(word)?;
                    let third = self.pop(word)?;
                    self.stack.extend([top, third, second]);
                }
                Word::Deref => self.deref(word, 4, host)?,
                Word::DerefSize(size) => self.deref(word, *size, host)?,

                Word::Abs => {
                    let value = self.pop_signed(word)?;
                    self.stack.push(value.unsigned_abs());
                }
                Word::And => self.binary(word, |a, b| a & b)?,
                Word::Div => {
                    let divisor = self.pop_signed(word)?;
                    let dividend = self.pop_signed(word)?;
                    if divisor == 0 {
                        return Err(EmdbgError::Evaluation("division by zero".into()));
                    }
                    self.stack.push(dividend.wrapping_div(divisor) as u32);
                }
                Word::Minus => self.binary(word, u32::wrapping_sub)?,
                Word::Mod => {
                    let divisor = self.pop(word)?;
                    let dividend = self.pop(word)?;
                    if divisor == 0 {
                        return Err(EmdbgError::Evaluation("modulo by zero".into()));
                    }
                    self.stack.push(dividend % divisor);
                }
                Word::Mul => self.binary(word, u32::wrapping_mul)?,
                Word::Neg => {
                    let value = self.pop_signed(word)?;
                    self.stack.push(value.wrapping_neg() as u32);
                }
                Word::Not => {
                    let value = self.pop(word)?;
                    self.stack.push(!value);
                }
                Word::Or => self.binary(word, |a, b| a | b)?,
                Word::Plus => self.binary(word, u32::wrapping_add)?,
                Word::Shl => self.binary(word, |a, b| a.checked_shl(b).unwrap_or(0))?,
                Word::Shr => self.binary(word, |a, b| a.checked_shr(b).unwrap_or(0))?,
                Word::Shra => self.binary(word, |a, b| {
                    let shift = b.min(31);
                    ((a as i32) >> shift) as u32
                })?,
                Word::Xor => self.binary(word, |a, b| a ^ b)?,

                Word::Eq => self.compare(word, |a, b| a == b)?,
                Word::Ge => self.compare(word, |a, b| a >= b)?,
                Word::Gt => self.compare(word, |a, b| a > b)?,
                Word::Le => self.compare(word, |a, b| a <= b)?,
                Word::Lt => self.compare(word, |a, b| a < b)?,
                Word::Ne => self.compare(word, |a, b| a != b)?,
                Word::ZeroEquals => {
                    let value = self.pop(word)?;
                    self.stack.push(u32::from(value == 0));
                }

                Word::If => {
                    if self.pop(word)? == 0 {
                        index = Self::skip_to_then(words, index)?;
                    }
                }
                Word::Then => {}

                Word::Register(register) => self.register = Some(*register),
                Word::RegisterValue { register, offset } => {
                    let value = host.read_register(*register)?;
                    self.stack.push(value.wrapping_add_signed(*offset));
                }
                Word::FrameBase(offset) => {
                    let base = self.frame_base.ok_or(EmdbgError::FrameBaseUnavailable)?;
                    self.stack.push(base.wrapping_add_signed(*offset));
                }
                Word::CallFrameCfa => {
                    let cfa = self.cfa.ok_or(EmdbgError::CfaUnavailable)?;
                    self.stack.push(cfa);
                }
                Word::StackValue => self.kind = ValueKind::Constant,
                Word::ImplicitValue(value) => {
                    self.stack.push(*value);
                    self.kind = ValueKind::Constant;
                }
                Word::Piece(byte_size) => self.close_piece(*byte_size),
                Word::EntryValue(block) => {
                    let value = host.entry_value(block)?;
                    self.stack.push(value);
                }
                Word::Convert {
                    byte_size, signed, ..
                } => {
                    let value = self.pop(word)?;
                    let bits = u32::from(*byte_size) * 8;
                    let converted = if bits >= 32 {
                        value
                    } else if *signed {
                        (((value << (32 - bits)) as i32) >> (32 - bits)) as u32
                    } else {
                        value & ((1 << bits) - 1)
                    };
                    self.stack.push(converted);
                }
                Word::Unsupported(opcode) => {
                    return Err(EmdbgError::Evaluation(format!(
                        "program contains untranslated opcode 0x{opcode:02x}"
                    )))
                }
                _ => return Err(EmdbgError::Evaluation(format!("unexpected word {word}"))),
            }
        }
        Ok(())
    }

    fn results(&mut self, count: usize) -> EmdbgResult<Vec<u32>>
    {
        if self.stack.len() < count {
            return Err(EmdbgError::StackUnderflow(format!("{count} results")));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn pieces(&self) -> &[Piece]
    {
        &self.pieces
    }

    fn expression_value(&mut self) -> DwarfExpressionValue
    {
        if !self.pieces.is_empty() {
            return DwarfExpressionValue::Composite(self.pieces.clone());
        }
        if let Some(register) = self.register {
            return DwarfExpressionValue::RegisterNumber(register);
        }
        match (self.stack.last(), self.kind) {
            (Some(&cell), ValueKind::Constant) => DwarfExpressionValue::Constant(cell),
            (Some(&cell), ValueKind::MemoryAddress) => DwarfExpressionValue::MemoryAddress(cell),
            (None, _) => DwarfExpressionValue::Invalid,
        }
    }

    fn reset(&mut self)
    {
        self.stack.clear();
        self.kind = ValueKind::MemoryAddress;
        self.register = None;
        self.pieces.clear();
    }
}

/// Stack entry `depth` cells below the top
fn pick(stack: &[u32], depth: u8, word: &Word) -> EmdbgResult<u32>
{
    stack
        .len()
        .checked_sub(usize::from(depth) + 1)
        .map(|index| stack[index])
        .ok_or_else(|| EmdbgError::StackUnderflow(word.to_string()))
}
