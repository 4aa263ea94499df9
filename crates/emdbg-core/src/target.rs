//! # Target Interface
//!
//! What the debug-information engine needs from the thing being debugged.
//!
//! A [`Target`] can be a live probe connection (for example a GDB remote
//! serial protocol link), or a static snapshot such as [`CorefileTarget`],
//! which serves memory from captured RAM and flash images.
//!
//! Only memory and register reads are required. Run control is optional;
//! the default implementations report
//! [`EmdbgError::TargetOperationUnsupported`].

use std::fmt;

use crate::error::{EmdbgError, EmdbgResult};
use crate::registers::{RegisterFrame, REGISTER_COUNT};

/// Kind of memory behind a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind
{
    Ram,
    Flash,
}

impl fmt::Display for MemoryKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            MemoryKind::Ram => write!(f, "ram"),
            MemoryKind::Flash => write!(f, "flash"),
        }
    }
}

/// One entry of a target memory map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    pub kind: MemoryKind,
    /// First address (inclusive)
    pub start: u32,
    pub length: u32,
    /// Erase block size, for flash
    pub block_size: Option<u32>,
}

impl MemoryRegion
{
    pub fn new(kind: MemoryKind, start: u32, length: u32) -> Self
    {
        Self {
            kind,
            start,
            length,
            block_size: None,
        }
    }

    pub fn contains(&self, address: u32, length: usize) -> bool
    {
        let end = u64::from(self.start) + u64::from(self.length);
        address >= self.start && u64::from(address) + length as u64 <= end
    }
}

/// A debuggable ARM Cortex-M target
pub trait Target
{
    /// Read `length` bytes at `address`
    ///
    /// `allow_failure` only tunes logging: probes such as stack scans expect
    /// misses and should not be reported loudly.
    ///
    /// ## Errors
    ///
    /// `MemoryUnavailable` if any byte cannot be read.
    fn read_bytes(&mut self, address: u32, length: usize, allow_failure: bool) -> EmdbgResult<Vec<u8>>;

    /// Read one little-endian word
    fn read_word(&mut self, address: u32, allow_failure: bool) -> EmdbgResult<u32>
    {
        let bytes = self.read_bytes(address, 4, allow_failure)?;
        <[u8; 4]>::try_from(bytes.as_slice())
            .map(u32::from_le_bytes)
            .map_err(|_| EmdbgError::MemoryUnavailable { address, length: 4 })
    }

    /// Read one core register of the stopped target
    fn read_register(&mut self, register: u32) -> EmdbgResult<u32>;

    /// Read r0-r15
    fn read_registers(&mut self) -> EmdbgResult<RegisterFrame>
    {
        let mut frame = [0; REGISTER_COUNT];
        for (register, slot) in (0u32..).zip(frame.iter_mut()) {
            *slot = self.read_register(register)?;
        }
        Ok(frame)
    }

    fn memory_map(&mut self) -> EmdbgResult<Vec<MemoryRegion>>
    {
        Ok(Vec::new())
    }

    fn breakpoint_set(&mut self, _address: u32) -> EmdbgResult<()>
    {
        Err(EmdbgError::TargetOperationUnsupported("breakpoint_set"))
    }

    fn breakpoint_clear(&mut self, _address: u32) -> EmdbgResult<()>
    {
        Err(EmdbgError::TargetOperationUnsupported("breakpoint_clear"))
    }

    fn request_single_step(&mut self) -> EmdbgResult<()>
    {
        Err(EmdbgError::TargetOperationUnsupported("request_single_step"))
    }

    fn resume(&mut self) -> EmdbgResult<()>
    {
        Err(EmdbgError::TargetOperationUnsupported("resume"))
    }

    fn reset(&mut self) -> EmdbgResult<()>
    {
        Err(EmdbgError::TargetOperationUnsupported("reset"))
    }
}

/// Target reconstructed from memory images and a register dump
///
/// ## Example
///
/// ```rust
/// use emdbg_core::target::{CorefileTarget, Target};
///
/// let mut target = CorefileTarget::new([0; 16]).with_ram(0x2000_0000, vec![1, 2, 3, 4]);
/// assert_eq!(target.read_word(0x2000_0000, false).unwrap(), 0x0403_0201);
/// assert!(target.read_word(0x2000_0002, true).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CorefileTarget
{
    images: Vec<(MemoryRegion, Vec<u8>)>,
    registers: RegisterFrame,
}

impl CorefileTarget
{
    pub fn new(registers: RegisterFrame) -> Self
    {
        Self {
            images: Vec::new(),
            registers,
        }
    }

    /// Add a RAM snapshot starting at `base`
    #[must_use]
    pub fn with_ram(mut self, base: u32, bytes: Vec<u8>) -> Self
    {
        self.add_image(MemoryKind::Ram, base, bytes);
        self
    }

    /// Add a flash image starting at `base`
    #[must_use]
    pub fn with_flash(mut self, base: u32, bytes: Vec<u8>) -> Self
    {
        self.add_image(MemoryKind::Flash, base, bytes);
        self
    }

    pub fn add_image(&mut self, kind: MemoryKind, base: u32, bytes: Vec<u8>)
    {
        let length = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        self.images.push((MemoryRegion::new(kind, base, length), bytes));
    }

    pub fn registers(&self) -> &RegisterFrame
    {
        &self.registers
    }
}

impl Target for CorefileTarget
{
    fn read_bytes(&mut self, address: u32, length: usize, allow_failure: bool) -> EmdbgResult<Vec<u8>>
    {
        let found = self
            .images
            .iter()
            .find(|(region, _)| region.contains(address, length));
        let Some((region, bytes)) = found else {
            if allow_failure {
                tracing::trace!(address = format_args!("0x{address:08x}"), length, "Memory not captured");
            } else {
                tracing::warn!(address = format_args!("0x{address:08x}"), length, "Memory not captured");
            }
            return Err(EmdbgError::MemoryUnavailable { address, length });
        };
        let start = (address - region.start) as usize;
        Ok(bytes[start..start + length].to_vec())
    }

    fn read_register(&mut self, register: u32) -> EmdbgResult<u32>
    {
        self.registers
            .get(register as usize)
            .copied()
            .ok_or(EmdbgError::RegisterUnavailable(register))
    }

    fn memory_map(&mut self) -> EmdbgResult<Vec<MemoryRegion>>
    {
        Ok(self.images.iter().map(|(region, _)| region.clone()).collect())
    }
}
