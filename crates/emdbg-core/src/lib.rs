//! # emdbg-core
//!
//! DWARF debug-information engine for embedded ARM (Cortex-M) targets.
//!
//! This crate provides the pieces a debugger front end needs to make sense
//! of a stopped microcontroller:
//! - Decoding DWARF 2-5 (`.debug_info`, `.debug_line`, ranges, locations)
//! - Type graphs, C type strings and data layouts
//! - Compiling location expressions and call frame programs to a small
//!   stack language, and running them
//! - Evaluating variable locations against a target
//! - Unwinding the stack, including exception frames
//!
//! ## Targets
//!
//! The engine only sees a target through the [`target::Target`] trait.
//! [`target::CorefileTarget`] serves memory from captured images; live
//! probe connections implement the same trait.
//!
//! ## Example
//!
//! ```rust,ignore
//! use emdbg_core::dwarf::{DebugSections, DwarfData};
//! use emdbg_core::registers::RegisterCache;
//! use emdbg_core::unwind::backtrace;
//!
//! let dwarf = DwarfData::new(DebugSections::from_lookup(|name| elf.section(name)))?;
//! let mut cache = RegisterCache::new();
//! for frame in backtrace(&dwarf, &mut target, &mut cache, 32)? {
//!     println!("#{} {:08x}", frame.index, frame.pc);
//! }
//! ```

pub mod bytecode;
pub mod dwarf;
pub mod error;
pub mod evaluator;
pub mod machine;
pub mod registers;
pub mod target;
pub mod unwind;
pub mod value;

pub use dwarf::{DebugSections, DwarfData};
pub use error::{EmdbgError, EmdbgResult};
pub use evaluator::{DwarfEvaluator, DwarfExpressionValue};
pub use registers::RegisterCache;
pub use target::{CorefileTarget, Target};
