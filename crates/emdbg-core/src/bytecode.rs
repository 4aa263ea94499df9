//! # Stack Machine Bytecode
//!
//! Programs produced by the DWARF expression compiler and the call frame
//! translator, and consumed by a [`StackMachine`](crate::machine::StackMachine).
//!
//! A [`Program`] is a flat list of [`Word`]s. Cells are 32 bits wide, the
//! width of the target. Control flow is restricted to one forward construct:
//! `If ... Then`, where `If` pops a cell and skips to the matching `Then`
//! when it is zero. Both the expression compiler's `DW_OP_bra` and
//! `DW_OP_skip` translate to it.
//!
//! `Display` renders a program as Forth-style text, e.g.
//! `r13 4 breg  DW_OP_stack_value`, which is what diagnostic dumps print.

use std::fmt;

/// One instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Word
{
    /// Push a constant
    Literal(u32),

    // Stack manipulation
    Dup,
    Drop,
    Over,
    /// Copy the entry `n` cells below the top
    Pick(u8),
    Swap,
    /// `DW_OP_rot`: the top entry moves down two places
    Rot,

    // Memory
    /// Replace the top address with the word stored there
    Deref,
    /// Replace the top address with `n` zero-extended bytes stored there
    DerefSize(u8),

    // Arithmetic and logic
    Abs,
    And,
    Div,
    Minus,
    Mod,
    Mul,
    Neg,
    Not,
    Or,
    Plus,
    Shl,
    Shr,
    Shra,
    Xor,

    // Comparisons (signed), pushing 1 or 0
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    Ne,
    /// Replace the top with 1 if it is zero, else 0
    ZeroEquals,

    // Control flow
    /// Pop; when zero continue after the matching `Then`
    If,
    Then,

    // Location description
    /// The value lives in register `n`
    Register(u32),
    /// Push register `register` plus `offset`
    RegisterValue
    {
        register: u32,
        offset: i32,
    },
    /// Push the frame base plus an offset
    FrameBase(i32),
    /// Push the canonical frame address
    CallFrameCfa,
    /// The top of stack is the value itself, not its address
    StackValue,
    /// Constant value carried in the expression (at most one cell)
    ImplicitValue(u32),
    /// Close a piece of `n` bytes from the current location
    Piece(u32),
    /// Push the value a register expression had on entry to the function
    EntryValue(Vec<u8>),
    /// Truncate the top to `byte_size` bytes, sign-extending when `signed`
    ///
    /// Emitted for `DW_OP_convert`, `DW_OP_regval_type` and friends;
    /// `base_type` is the absolute offset of the base type DIE, 0 for the
    /// generic type.
    Convert
    {
        base_type: u32,
        byte_size: u8,
        signed: bool,
    },

    // Call frame information
    /// Register that holds the return address
    CfaReturnAddressRegister(u32),
    /// Marks the end of the CIE's initial instructions
    CfaInitialInstructionsEnd,
    CfaSetLoc(u32),
    CfaAdvanceLoc(u32),
    CfaDefCfa
    {
        register: u32,
        offset: i32,
    },
    CfaDefCfaRegister(u32),
    CfaDefCfaOffset(i32),
    /// Register saved at `CFA + offset`
    CfaOffset
    {
        register: u32,
        offset: i32,
    },
    /// Register value is `CFA + offset`
    CfaValOffset
    {
        register: u32,
        offset: i32,
    },
    CfaRegister
    {
        register: u32,
        source: u32,
    },
    CfaRestore(u32),
    CfaUndefined(u32),
    CfaSameValue(u32),
    CfaRememberState,
    CfaRestoreState,

    /// Placeholder for an opcode the compiler could not translate
    Unsupported(u8),
}

impl Word
{
    /// Whether this word is part of a call frame program
    pub fn is_cfa(&self) -> bool
    {
        matches!(
            self,
            Word::CfaReturnAddressRegister(_)
                | Word::CfaInitialInstructionsEnd
                | Word::CfaSetLoc(_)
                | Word::CfaAdvanceLoc(_)
                | Word::CfaDefCfa { .. }
                | Word::CfaDefCfaRegister(_)
                | Word::CfaDefCfaOffset(_)
                | Word::CfaOffset { .. }
                | Word::CfaValOffset { .. }
                | Word::CfaRegister { .. }
                | Word::CfaRestore(_)
                | Word::CfaUndefined(_)
                | Word::CfaSameValue(_)
                | Word::CfaRememberState
                | Word::CfaRestoreState
        )
    }
}

impl fmt::Display for Word
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Word::Literal(value) if *value < 0x100 => write!(f, "{value}"),
            Word::Literal(value) => write!(f, "${value:x}"),
            Word::Dup => f.write_str("dup"),
            Word::Drop => f.write_str("drop"),
            Word::Over => f.write_str("over"),
            Word::Pick(index) => write!(f, "{index} pick"),
            Word::Swap => f.write_str("swap"),
            Word::Rot => f.write_str("-rot"),
            Word::Deref => f.write_str("@"),
            Word::DerefSize(size) => write!(f, "{size} @n"),
            Word::Abs => f.write_str("abs"),
            Word::And => f.write_str("and"),
            Word::Div => f.write_str("/"),
            Word::Minus => f.write_str("-"),
            Word::Mod => f.write_str("umod"),
            Word::Mul => f.write_str("*"),
            Word::Neg => f.write_str("negate"),
            Word::Not => f.write_str("invert"),
            Word::Or => f.write_str("or"),
            Word::Plus => f.write_str("+"),
            Word::Shl => f.write_str("lshift"),
            Word::Shr => f.write_str("rshift"),
            Word::Shra => f.write_str("arshift"),
            Word::Xor => f.write_str("xor"),
            Word::Eq => f.write_str("="),
            Word::Ge => f.write_str(">="),
            Word::Gt => f.write_str(">"),
            Word::Le => f.write_str("<="),
            Word::Lt => f.write_str("<"),
            Word::Ne => f.write_str("<>"),
            Word::ZeroEquals => f.write_str("0="),
            Word::If => f.write_str("if"),
            Word::Then => f.write_str("then"),
            Word::Register(register) => write!(f, "r{register} DW_OP_reg"),
            Word::RegisterValue { register, offset } => write!(f, "r{register} {offset} breg"),
            Word::FrameBase(offset) => write!(f, "{offset} fbreg"),
            Word::CallFrameCfa => f.write_str("cfa"),
            Word::StackValue => f.write_str("DW_OP_stack_value"),
            Word::ImplicitValue(value) => write!(f, "${value:x} DW_OP_implicit_value"),
            Word::Piece(size) => write!(f, "{size} DW_OP_piece"),
            Word::EntryValue(block) => {
                f.write_str("[")?;
                for byte in block {
                    write!(f, " {byte:02x}")?;
                }
                f.write_str(" ] entry-value")
            }
            Word::Convert {
                base_type,
                byte_size,
                signed,
            } => write!(
                f,
                "<0x{base_type:x}:{byte_size}{}> convert",
                if *signed { "s" } else { "u" }
            ),
            Word::CfaReturnAddressRegister(register) => write!(f, "r{register} return-address-register"),
            Word::CfaInitialInstructionsEnd => f.write_str("initial-instructions-end"),
            Word::CfaSetLoc(address) => write!(f, "${address:08x} DW_CFA_set_loc"),
            Word::CfaAdvanceLoc(delta) => write!(f, "{delta} DW_CFA_advance_loc"),
            Word::CfaDefCfa { register, offset } => write!(f, "r{register} {offset} DW_CFA_def_cfa"),
            Word::CfaDefCfaRegister(register) => write!(f, "r{register} DW_CFA_def_cfa_register"),
            Word::CfaDefCfaOffset(offset) => write!(f, "{offset} DW_CFA_def_cfa_offset"),
            Word::CfaOffset { register, offset } => write!(f, "r{register} {offset} DW_CFA_offset"),
            Word::CfaValOffset { register, offset } => write!(f, "r{register} {offset} DW_CFA_val_offset"),
            Word::CfaRegister { register, source } => write!(f, "r{register} r{source} DW_CFA_register"),
            Word::CfaRestore(register) => write!(f, "r{register} DW_CFA_restore"),
            Word::CfaUndefined(register) => write!(f, "r{register} DW_CFA_undefined"),
            Word::CfaSameValue(register) => write!(f, "r{register} DW_CFA_same_value"),
            Word::CfaRememberState => f.write_str("DW_CFA_remember_state"),
            Word::CfaRestoreState => f.write_str("DW_CFA_restore_state"),
            Word::Unsupported(opcode) => write!(f, "<unsupported 0x{opcode:02x}>"),
        }
    }
}

/// A compiled program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program
{
    pub words: Vec<Word>,
}

impl Program
{
    pub fn new(words: Vec<Word>) -> Self
    {
        Self { words }
    }

    pub fn push(&mut self, word: Word)
    {
        self.words.push(word);
    }

    pub fn is_empty(&self) -> bool
    {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize
    {
        self.words.len()
    }

    /// Whether any word stands in for an untranslated opcode
    pub fn has_unsupported(&self) -> bool
    {
        self.words.iter().any(|word| matches!(word, Word::Unsupported(_)))
    }
}

impl FromIterator<Word> for Program
{
    fn from_iter<I: IntoIterator<Item = Word>>(iter: I) -> Self
    {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Program
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for (index, word) in self.words.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{word}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_program_display()
    {
        let program = Program::new(vec![
            Word::RegisterValue {
                register: 13,
                offset: 4,
            },
            Word::Literal(0x1234),
            Word::Plus,
            Word::StackValue,
        ]);
        assert_eq!(program.to_string(), "r13 4 breg $1234 + DW_OP_stack_value");
    }

    #[test]
    fn test_unsupported_marker()
    {
        let program: Program = [Word::Literal(1), Word::Unsupported(0xa0)].into_iter().collect();
        assert!(program.has_unsupported());
        assert!(program.to_string().ends_with("<unsupported 0xa0>"));
        assert!(!Word::Dup.is_cfa());
        assert!(Word::CfaRememberState.is_cfa());
    }
}
