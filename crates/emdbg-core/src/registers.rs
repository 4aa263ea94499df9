//! # Register Cache
//!
//! Core registers of every unwound frame.
//!
//! Frame 0 is the innermost frame, the registers the target reported. Each
//! unwind step appends the caller's registers, so frame `n + 1` is the
//! caller of frame `n`. One frame is *active* at a time; expression
//! evaluation reads registers from it.
//!
//! Evaluating an entry value means looking at the caller for a moment. Use
//! [`RegisterCache::enter_frame`], which restores the previously active
//! frame when the returned guard is dropped.

use std::ops::{Deref, DerefMut};

use crate::error::{EmdbgError, EmdbgResult};

/// Number of core registers tracked (r0-r15)
pub const REGISTER_COUNT: usize = 16;
/// Stack pointer
pub const SP: u32 = 13;
/// Link register
pub const LR: u32 = 14;
/// Program counter
pub const PC: u32 = 15;

/// Registers of one frame, indexed by DWARF register number
pub type RegisterFrame = [u32; REGISTER_COUNT];

/// Register values per frame plus the active frame index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterCache
{
    frames: Vec<RegisterFrame>,
    active_frame: usize,
}

impl RegisterCache
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Cache seeded with the innermost frame
    pub fn with_registers(registers: RegisterFrame) -> Self
    {
        Self {
            frames: vec![registers],
            active_frame: 0,
        }
    }

    pub fn clear(&mut self)
    {
        self.frames.clear();
        self.active_frame = 0;
    }

    /// Append the registers of the next outer frame, returning its index
    pub fn push_frame(&mut self, registers: RegisterFrame) -> usize
    {
        self.frames.push(registers);
        self.frames.len() - 1
    }

    pub fn frame_count(&self) -> usize
    {
        self.frames.len()
    }

    pub fn frame(&self, frame: usize) -> EmdbgResult<&RegisterFrame>
    {
        self.frames.get(frame).ok_or(EmdbgError::FrameUnavailable(frame))
    }

    pub fn active_frame(&self) -> usize
    {
        self.active_frame
    }

    /// ## Errors
    ///
    /// `FrameUnavailable` if the frame has not been unwound yet.
    pub fn set_active_frame(&mut self, frame: usize) -> EmdbgResult<()>
    {
        if frame >= self.frames.len() {
            return Err(EmdbgError::FrameUnavailable(frame));
        }
        self.active_frame = frame;
        Ok(())
    }

    pub fn active_registers(&self) -> EmdbgResult<&RegisterFrame>
    {
        self.frame(self.active_frame)
    }

    /// Register `register` of the active frame
    pub fn register(&self, register: u32) -> EmdbgResult<u32>
    {
        self.active_registers()?
            .get(register as usize)
            .copied()
            .ok_or(EmdbgError::RegisterUnavailable(register))
    }

    /// Canonical frame address of `frame`
    ///
    /// The CFA of a frame is the stack pointer its caller sees, so it is
    /// only known once the caller has been unwound.
    pub fn cfa_value_for_frame(&self, frame: usize) -> Option<u32>
    {
        self.frames
            .get(frame + 1)
            .map(|registers| registers[SP as usize])
    }

    /// Make `frame` active until the guard is dropped
    ///
    /// ## Errors
    ///
    /// `FrameUnavailable` if the frame has not been unwound yet.
    pub fn enter_frame(&mut self, frame: usize) -> EmdbgResult<ActiveFrameGuard<'_>>
    {
        let previous = self.active_frame;
        self.set_active_frame(frame)?;
        Ok(ActiveFrameGuard { cache: self, previous })
    }
}

/// Restores the previously active frame on drop
#[derive(Debug)]
pub struct ActiveFrameGuard<'a>
{
    cache: &'a mut RegisterCache,
    previous: usize,
}

impl Deref for ActiveFrameGuard<'_>
{
    type Target = RegisterCache;

    fn deref(&self) -> &Self::Target
    {
        self.cache
    }
}

impl DerefMut for ActiveFrameGuard<'_>
{
    fn deref_mut(&mut self) -> &mut Self::Target
    {
        self.cache
    }
}

impl Drop for ActiveFrameGuard<'_>
{
    fn drop(&mut self)
    {
        self.cache.active_frame = self.previous;
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn frame(sp: u32, pc: u32) -> RegisterFrame
    {
        let mut registers = [0; REGISTER_COUNT];
        registers[SP as usize] = sp;
        registers[PC as usize] = pc;
        registers
    }

    #[test]
    fn test_frames_and_cfa()
    {
        let mut cache = RegisterCache::with_registers(frame(0x2000_0100, 0x1010));
        assert_eq!(cache.cfa_value_for_frame(0), None);
        assert_eq!(cache.push_frame(frame(0x2000_0108, 0x1020)), 1);
        assert_eq!(cache.cfa_value_for_frame(0), Some(0x2000_0108));
        assert_eq!(cache.register(PC).unwrap(), 0x1010);
        assert!(matches!(cache.register(16), Err(EmdbgError::RegisterUnavailable(16))));
    }

    #[test]
    fn test_enter_frame_restores_active_frame()
    {
        let mut cache = RegisterCache::with_registers(frame(0x2000_0100, 0x1010));
        cache.push_frame(frame(0x2000_0108, 0x1020));
        {
            let guard = cache.enter_frame(1).unwrap();
            assert_eq!(guard.active_frame(), 1);
            assert_eq!(guard.register(PC).unwrap(), 0x1020);
        }
        assert_eq!(cache.active_frame(), 0);
        assert!(matches!(cache.enter_frame(2), Err(EmdbgError::FrameUnavailable(2))));
    }
}
