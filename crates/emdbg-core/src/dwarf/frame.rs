//! # Call Frame Information
//!
//! Reads `.debug_frame` and turns the CIE/FDE instructions covering an
//! address into a stack machine [`Program`].
//!
//! Construction only walks the entry headers and records every FDE's
//! address range. CIEs are parsed on first use and cached by offset, since
//! many FDEs share one CIE.
//!
//! The emitted program has this shape:
//!
//! ```text
//! <ra> return-address-register  <CIE initial instructions>
//! initial-instructions-end  <FDE instructions>
//! ```
//!
//! Alignment factors are already applied to every operand.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use gimli::constants as dw;
use gimli::DwCfa;

use super::reader::Reader;
use crate::bytecode::{Program, Word};
use crate::error::{EmdbgError, EmdbgResult};

const SECTION: &str = ".debug_frame";
const CIE_ID: u32 = 0xffff_ffff;

/// Common information entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie<'a>
{
    pub offset: u32,
    pub version: u8,
    pub augmentation: String,
    pub code_alignment_factor: u32,
    pub data_alignment_factor: i32,
    pub return_address_register: u32,
    pub initial_instructions: &'a [u8],
}

/// Frame description entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fde<'a>
{
    pub offset: u32,
    pub cie_pointer: u32,
    pub initial_location: u32,
    pub address_range: u32,
    pub instructions: &'a [u8],
}

impl Fde<'_>
{
    pub fn contains(&self, address: u32) -> bool
    {
        address >= self.initial_location && address - self.initial_location < self.address_range
    }
}

/// `.debug_frame` reader
#[derive(Debug, Default)]
pub struct DwarfUnwinder<'a>
{
    debug_frame: &'a [u8],
    /// Sorted by `initial_location`
    fdes: Vec<Fde<'a>>,
    cies: RefCell<HashMap<u32, Rc<Cie<'a>>>>,
}

impl<'a> DwarfUnwinder<'a>
{
    /// Index the FDEs of `debug_frame`
    ///
    /// ## Errors
    ///
    /// - `Dwarf64Unsupported` for 64-bit entries
    /// - `UnexpectedEof` when an entry overruns the section
    pub fn new(debug_frame: &'a [u8]) -> EmdbgResult<Self>
    {
        let mut reader = Reader::new(SECTION, debug_frame);
        let mut fdes = Vec::new();

        while !reader.is_empty() {
            let offset = reader.offset();
            let length = reader.u32()?;
            if length == 0xffff_ffff {
                return Err(EmdbgError::Dwarf64Unsupported(offset));
            }
            if length == 0 {
                continue;
            }
            let mut entry = reader.truncated(length as usize)?;
            let end = reader.offset() + length as usize;
            let id = entry.u32()?;
            if id != CIE_ID {
                let initial_location = entry.u32()?;
                let address_range = entry.u32()?;
                fdes.push(Fde {
                    offset: offset as u32,
                    cie_pointer: id,
                    initial_location,
                    address_range,
                    instructions: entry.remaining(),
                });
            }
            reader.seek(end);
        }

        fdes.sort_by_key(|fde| fde.initial_location);
        tracing::debug!(fdes = fdes.len(), "Indexed .debug_frame");
        Ok(Self {
            debug_frame,
            fdes,
            cies: RefCell::new(HashMap::new()),
        })
    }

    pub fn fdes(&self) -> &[Fde<'a>]
    {
        &self.fdes
    }

    /// The FDE covering `address`
    pub fn fde_for_address(&self, address: u32) -> Option<&Fde<'a>>
    {
        let index = self
            .fdes
            .partition_point(|fde| fde.initial_location <= address)
            .checked_sub(1)?;
        self.fdes.get(index).filter(|fde| fde.contains(address))
    }

    /// The CIE at `offset`, parsed once
    ///
    /// ## Errors
    ///
    /// - `UnsupportedCieVersion` for versions other than 1, 3 and 4
    /// - `UnsupportedAugmentation` for augmentations other than `""` and
    ///   `"armcc+"`
    pub fn cie(&self, offset: u32) -> EmdbgResult<Rc<Cie<'a>>>
    {
        if let Some(cie) = self.cies.borrow().get(&offset) {
            return Ok(Rc::clone(cie));
        }
        let cie = Rc::new(self.parse_cie(offset)?);
        self.cies.borrow_mut().insert(offset, Rc::clone(&cie));
        Ok(cie)
    }

    fn parse_cie(&self, offset: u32) -> EmdbgResult<Cie<'a>>
    {
        let mut reader = Reader::at(SECTION, self.debug_frame, offset as usize);
        let length = reader.u32()?;
        if length == 0xffff_ffff {
            return Err(EmdbgError::Dwarf64Unsupported(offset as usize));
        }
        let mut entry = reader.truncated(length as usize)?;
        if entry.u32()? != CIE_ID {
            return Err(EmdbgError::malformed(SECTION, offset as usize, "CIE pointer does not name a CIE"));
        }

        let version = entry.u8()?;
        if !matches!(version, 1 | 3 | 4) {
            return Err(EmdbgError::UnsupportedCieVersion(version));
        }
        let augmentation = entry.cstr()?;
        if !matches!(augmentation, "" | "armcc+") {
            return Err(EmdbgError::UnsupportedAugmentation(augmentation.to_string()));
        }
        if version == 4 {
            let address_size = entry.u8()?;
            let _segment_selector_size = entry.u8()?;
            if address_size != 4 {
                return Err(EmdbgError::UnsupportedAddressSize(address_size));
            }
        }
        let code_alignment_factor = entry.uleb128_u32()?;
        let data_alignment_factor = entry.sleb128_i32()?;
        let return_address_register = if version == 1 {
            u32::from(entry.u8()?)
        } else {
            entry.uleb128_u32()?
        };

        Ok(Cie {
            offset,
            version,
            augmentation: augmentation.to_string(),
            code_alignment_factor,
            data_alignment_factor,
            return_address_register,
            initial_instructions: entry.remaining(),
        })
    }

    /// Unwind program for the function containing `address`
    ///
    /// Returns the program and the FDE's initial location, the address the
    /// machine should be primed with, or `None` when no FDE covers `address`.
    ///
    /// ## Errors
    ///
    /// CIE errors, `UnsupportedCfaOpcode` for expression-based rules, and
    /// decoding errors.
    pub fn unwind_code_for_address(&self, address: u32) -> EmdbgResult<Option<(Program, u32)>>
    {
        let Some(fde) = self.fde_for_address(address) else {
            return Ok(None);
        };
        let cie = self.cie(fde.cie_pointer)?;

        let mut program = Program::default();
        program.push(Word::CfaReturnAddressRegister(cie.return_address_register));
        translate(cie.initial_instructions, cie.offset, &cie, &mut program)?;
        program.push(Word::CfaInitialInstructionsEnd);
        translate(fde.instructions, fde.offset, &cie, &mut program)?;
        Ok(Some((program, fde.initial_location)))
    }
}

fn translate(instructions: &[u8], entry_offset: u32, cie: &Cie<'_>, program: &mut Program) -> EmdbgResult<()>
{
    let mut reader = Reader::new(SECTION, instructions);
    let factored = |offset: u64| (offset as i32).wrapping_mul(cie.data_alignment_factor);
    let factored_signed = |offset: i64| (offset as i32).wrapping_mul(cie.data_alignment_factor);
    let advance = |delta: u32| Word::CfaAdvanceLoc(delta.wrapping_mul(cie.code_alignment_factor));

    while !reader.is_empty() {
        let byte = reader.u8()?;
        let low = u32::from(byte & 0x3f);
        let word = match DwCfa(byte & 0xc0) {
            dw::DW_CFA_advance_loc => advance(low),
            dw::DW_CFA_offset => Word::CfaOffset {
                register: low,
                offset: factored(reader.uleb128()?),
            },
            dw::DW_CFA_restore => Word::CfaRestore(low),
            _ => match DwCfa(byte) {
                dw::DW_CFA_nop => continue,
                dw::DW_CFA_set_loc => Word::CfaSetLoc(reader.u32()?),
                dw::DW_CFA_advance_loc1 => advance(u32::from(reader.u8()?)),
                dw::DW_CFA_advance_loc2 => advance(u32::from(reader.u16()?)),
                dw::DW_CFA_advance_loc4 => advance(reader.u32()?),
                dw::DW_CFA_offset_extended => {
                    let register = reader.uleb128_u32()?;
                    Word::CfaOffset {
                        register,
                        offset: factored(reader.uleb128()?),
                    }
                }
                dw::DW_CFA_offset_extended_sf => {
                    let register = reader.uleb128_u32()?;
                    Word::CfaOffset {
                        register,
                        offset: factored_signed(reader.sleb128()?),
                    }
                }
                dw::DW_CFA_GNU_negative_offset_extended => {
                    let register = reader.uleb128_u32()?;
                    Word::CfaOffset {
                        register,
                        offset: factored(reader.uleb128()?).wrapping_neg(),
                    }
                }
                dw::DW_CFA_restore_extended => Word::CfaRestore(reader.uleb128_u32()?),
                dw::DW_CFA_undefined => Word::CfaUndefined(reader.uleb128_u32()?),
                dw::DW_CFA_same_value => Word::CfaSameValue(reader.uleb128_u32()?),
                dw::DW_CFA_register => {
                    let register = reader.uleb128_u32()?;
                    Word::CfaRegister {
                        register,
                        source: reader.uleb128_u32()?,
                    }
                }
                dw::DW_CFA_remember_state => Word::CfaRememberState,
                dw::DW_CFA_restore_state => Word::CfaRestoreState,
                dw::DW_CFA_def_cfa => {
                    let register = reader.uleb128_u32()?;
                    Word::CfaDefCfa {
                        register,
                        offset: reader.uleb128()? as i32,
                    }
                }
                dw::DW_CFA_def_cfa_sf => {
                    let register = reader.uleb128_u32()?;
                    Word::CfaDefCfa {
                        register,
                        offset: factored_signed(reader.sleb128()?),
                    }
                }
                dw::DW_CFA_def_cfa_register => Word::CfaDefCfaRegister(reader.uleb128_u32()?),
                dw::DW_CFA_def_cfa_offset => Word::CfaDefCfaOffset(reader.uleb128()? as i32),
                dw::DW_CFA_def_cfa_offset_sf => Word::CfaDefCfaOffset(factored_signed(reader.sleb128()?)),
                dw::DW_CFA_val_offset => {
                    let register = reader.uleb128_u32()?;
                    Word::CfaValOffset {
                        register,
                        offset: factored(reader.uleb128()?),
                    }
                }
                dw::DW_CFA_val_offset_sf => {
                    let register = reader.uleb128_u32()?;
                    Word::CfaValOffset {
                        register,
                        offset: factored_signed(reader.sleb128()?),
                    }
                }
                dw::DW_CFA_GNU_args_size => {
                    reader.uleb128()?;
                    continue;
                }
                other => {
                    tracing::debug!(
                        opcode = %other,
                        entry = format_args!("0x{entry_offset:x}"),
                        "Unsupported call frame instruction"
                    );
                    return Err(EmdbgError::UnsupportedCfaOpcode(byte));
                }
            },
        };
        program.push(word);
    }
    Ok(())
}
