//! Bounds-checked little-endian cursor over a DWARF section.
//!
//! Every read either returns a value or an [`EmdbgError::UnexpectedEof`]
//! naming the section and offset; nothing in the decoders indexes a slice
//! directly.

use crate::error::{EmdbgError, EmdbgResult};

/// Cursor over one section's bytes
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a>
{
    section: &'static str,
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a>
{
    pub fn new(section: &'static str, data: &'a [u8]) -> Self
    {
        Self::at(section, data, 0)
    }

    /// Cursor positioned at `offset`
    ///
    /// An offset past the end is accepted; the first read then fails with
    /// `UnexpectedEof`.
    pub fn at(section: &'static str, data: &'a [u8], offset: usize) -> Self
    {
        Self {
            section,
            data,
            position: offset,
        }
    }

    pub fn section(&self) -> &'static str
    {
        self.section
    }

    pub fn offset(&self) -> usize
    {
        self.position
    }

    pub fn seek(&mut self, offset: usize)
    {
        self.position = offset;
    }

    pub fn is_empty(&self) -> bool
    {
        self.position >= self.data.len()
    }

    /// Bytes from the cursor to the end of the section
    pub fn remaining(&self) -> &'a [u8]
    {
        self.data.get(self.position..).unwrap_or(&[])
    }

    /// A new cursor limited to the next `length` bytes, offsets unchanged
    pub fn truncated(&self, length: usize) -> EmdbgResult<Reader<'a>>
    {
        let end = self.position.checked_add(length).ok_or_else(|| self.eof())?;
        if end > self.data.len() {
            return Err(self.eof());
        }
        Ok(Reader {
            section: self.section,
            data: &self.data[..end],
            position: self.position,
        })
    }

    pub fn eof(&self) -> EmdbgError
    {
        EmdbgError::UnexpectedEof {
            section: self.section,
            offset: self.position,
        }
    }

    pub fn malformed(&self, reason: impl Into<String>) -> EmdbgError
    {
        EmdbgError::malformed(self.section, self.position, reason)
    }

    pub fn bytes(&mut self, length: usize) -> EmdbgResult<&'a [u8]>
    {
        let end = self.position.checked_add(length).ok_or_else(|| self.eof())?;
        let slice = self.data.get(self.position..end).ok_or_else(|| self.eof())?;
        self.position = end;
        Ok(slice)
    }

    pub fn skip(&mut self, length: usize) -> EmdbgResult<()>
    {
        self.bytes(length).map(|_| ())
    }

    fn chunk<const N: usize>(&mut self) -> EmdbgResult<[u8; N]>
    {
        let bytes = self.bytes(N)?;
        let mut chunk = [0u8; N];
        chunk.copy_from_slice(bytes);
        Ok(chunk)
    }

    pub fn u8(&mut self) -> EmdbgResult<u8>
    {
        Ok(self.chunk::<1>()?[0])
    }

    pub fn i8(&mut self) -> EmdbgResult<i8>
    {
        Ok(i8::from_le_bytes(self.chunk::<1>()?))
    }

    pub fn u16(&mut self) -> EmdbgResult<u16>
    {
        Ok(u16::from_le_bytes(self.chunk()?))
    }

    pub fn i16(&mut self) -> EmdbgResult<i16>
    {
        Ok(i16::from_le_bytes(self.chunk()?))
    }

    pub fn u32(&mut self) -> EmdbgResult<u32>
    {
        Ok(u32::from_le_bytes(self.chunk()?))
    }

    pub fn i32(&mut self) -> EmdbgResult<i32>
    {
        Ok(i32::from_le_bytes(self.chunk()?))
    }

    pub fn u64(&mut self) -> EmdbgResult<u64>
    {
        Ok(u64::from_le_bytes(self.chunk()?))
    }

    /// Unsigned integer of 1, 2, 4 or 8 bytes
    pub fn sized(&mut self, size: u8) -> EmdbgResult<u64>
    {
        match size {
            1 => self.u8().map(u64::from),
            2 => self.u16().map(u64::from),
            4 => self.u32().map(u64::from),
            8 => self.u64(),
            _ => Err(self.malformed(format!("unsupported integer size {size}"))),
        }
    }

    /// Target address; only 4-byte addresses are accepted
    pub fn address(&mut self, address_size: u8) -> EmdbgResult<u32>
    {
        match address_size {
            4 => self.u32(),
            other => Err(EmdbgError::UnsupportedAddressSize(other)),
        }
    }

    /// Unsigned LEB128
    pub fn uleb128(&mut self) -> EmdbgResult<u64>
    {
        let start = self.position;
        let mut result: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.u8()?;
            if shift >= u64::BITS || (shift == 63 && byte & 0x7e != 0) {
                return Err(EmdbgError::malformed(self.section, start, "ULEB128 value overflows 64 bits"));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Signed LEB128
    pub fn sleb128(&mut self) -> EmdbgResult<i64>
    {
        let start = self.position;
        let mut result: i64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.u8()?;
            if shift >= i64::BITS {
                return Err(EmdbgError::malformed(self.section, start, "SLEB128 value overflows 64 bits"));
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < i64::BITS && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Unsigned LEB128 that must fit the 32-bit target
    pub fn uleb128_u32(&mut self) -> EmdbgResult<u32>
    {
        let start = self.position;
        let value = self.uleb128()?;
        u32::try_from(value)
            .map_err(|_| EmdbgError::malformed(self.section, start, format!("value 0x{value:x} exceeds 32 bits")))
    }

    /// Signed LEB128 that must fit the 32-bit target
    pub fn sleb128_i32(&mut self) -> EmdbgResult<i32>
    {
        let start = self.position;
        let value = self.sleb128()?;
        i32::try_from(value)
            .map_err(|_| EmdbgError::malformed(self.section, start, format!("value {value} exceeds 32 bits")))
    }

    /// NUL-terminated string
    pub fn cstr(&mut self) -> EmdbgResult<&'a str>
    {
        let rest = self.remaining();
        let Some(length) = rest.iter().position(|&b| b == 0) else {
            return Err(EmdbgError::UnexpectedEof {
                section: self.section,
                offset: self.data.len(),
            });
        };
        let text = std::str::from_utf8(&rest[..length]).map_err(|_| self.malformed("string is not valid UTF-8"))?;
        self.position += length + 1;
        Ok(text)
    }
}

/// NUL-terminated string at `offset` in a string section
pub fn string_at<'a>(section: &'static str, data: &'a [u8], offset: usize) -> EmdbgResult<&'a str>
{
    Reader::at(section, data, offset).cstr()
}
