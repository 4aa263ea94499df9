//! # Line Number Programs
//!
//! Decoding of `.debug_line` headers (versions 2 through 5) and execution of
//! the line number state machine.
//!
//! ## Row pairs
//!
//! [`LineProgram::run`] hands the visitor two registers on every row
//! emission: the previously emitted row and the new one. The pair describes
//! the half-open address interval `[previous.address, current.address)`,
//! which belongs to `previous`. At `DW_LNE_end_sequence` the visitor sees the
//! final pair before the state is reset, so the last real row of a sequence
//! still gets its interval.

use std::ops::ControlFlow;

use gimli::constants as dw;
use gimli::{DwForm, DwLnct, DwLne, DwLns};

use super::form::{read_form, Encoding, FormValue};
use super::reader::{string_at, Reader};
use super::unit::CompilationUnitFingerprint;
use super::DwarfData;
use crate::error::{EmdbgError, EmdbgResult};

const SECTION: &str = ".debug_line";

/// File table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry<'a>
{
    pub name: &'a str,
    pub directory_index: u64,
}

/// Decoded line program header
#[derive(Debug, Clone)]
pub struct LineProgramHeader<'a>
{
    pub offset: u32,
    pub version: u16,
    pub address_size: u8,
    pub minimum_instruction_length: u8,
    pub maximum_operations_per_instruction: u8,
    pub default_is_stmt: bool,
    pub line_base: i8,
    pub line_range: u8,
    pub opcode_base: u8,
    pub standard_opcode_lengths: Vec<u8>,
    pub include_directories: Vec<&'a str>,
    pub file_names: Vec<FileEntry<'a>>,
    program_offset: usize,
    end: usize,
}

/// Line state machine registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineState
{
    pub address: u32,
    pub file: u32,
    pub line: u32,
    pub column: u32,
    pub is_stmt: bool,
    pub basic_block: bool,
    pub end_sequence: bool,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
    pub isa: u32,
    pub discriminator: u32,
}

impl LineState
{
    fn new(default_is_stmt: bool) -> Self
    {
        Self {
            address: 0,
            file: 1,
            line: 1,
            column: 0,
            is_stmt: default_is_stmt,
            basic_block: false,
            end_sequence: false,
            prologue_end: false,
            epilogue_begin: false,
            isa: 0,
            discriminator: 0,
        }
    }
}

/// Result of [`LineProgram::line_number_for_address`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineLookup
{
    pub line: u32,
    pub file: u32,
    pub column: u32,
    /// The address is the first address of a statement row
    pub is_address_on_exact_line_number_boundary: bool,
}

/// File and line for an address or a declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCoordinates
{
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub is_address_on_exact_line_number_boundary: bool,
}

impl<'a> LineProgramHeader<'a>
{
    /// Decode the header at `offset`
    ///
    /// `debug_str` and `debug_line_str` resolve the string forms of DWARF 5
    /// entry formats.
    pub fn parse(debug_line: &'a [u8], offset: u32, debug_str: &'a [u8], debug_line_str: &'a [u8]) -> EmdbgResult<Self>
    {
        let mut reader = Reader::at(SECTION, debug_line, offset as usize);
        let unit_length = reader.u32()?;
        if unit_length == 0xffff_ffff {
            return Err(EmdbgError::Dwarf64Unsupported(offset as usize));
        }
        let end = reader.offset() + unit_length as usize;
        let mut reader = reader.truncated(unit_length as usize)?;

        let version = reader.u16()?;
        if !(2..=5).contains(&version) {
            return Err(EmdbgError::UnsupportedDwarfVersion(version));
        }
        let mut address_size = 4;
        if version >= 5 {
            address_size = reader.u8()?;
            let _segment_selector_size = reader.u8()?;
        }
        let header_length = reader.u32()?;
        let program_offset = reader.offset() + header_length as usize;

        let minimum_instruction_length = reader.u8()?;
        let maximum_operations_per_instruction = if version >= 4 { reader.u8()? } else { 1 };
        let default_is_stmt = reader.u8()? != 0;
        let line_base = reader.i8()?;
        let line_range = reader.u8()?;
        if line_range == 0 {
            return Err(reader.malformed("line_range is zero"));
        }
        let opcode_base = reader.u8()?;
        let standard_opcode_lengths = reader.bytes(usize::from(opcode_base.saturating_sub(1)))?.to_vec();

        let mut header = Self {
            offset,
            version,
            address_size,
            minimum_instruction_length,
            maximum_operations_per_instruction,
            default_is_stmt,
            line_base,
            line_range,
            opcode_base,
            standard_opcode_lengths,
            include_directories: Vec::new(),
            file_names: Vec::new(),
            program_offset,
            end,
        };

        if version >= 5 {
            let strings = (debug_str, debug_line_str);
            let encoding = Encoding {
                version,
                address_size,
            };
            let directory_format = read_entry_format(&mut reader)?;
            let count = reader.uleb128()?;
            for _ in 0..count {
                let entry = read_entry(&mut reader, &directory_format, encoding, strings)?;
                header.include_directories.push(entry.name);
            }
            let file_format = read_entry_format(&mut reader)?;
            let count = reader.uleb128()?;
            for _ in 0..count {
                header.file_names.push(read_entry(&mut reader, &file_format, encoding, strings)?);
            }
        } else {
            loop {
                let directory = reader.cstr()?;
                if directory.is_empty() {
                    break;
                }
                header.include_directories.push(directory);
            }
            loop {
                let name = reader.cstr()?;
                if name.is_empty() {
                    break;
                }
                header.file_names.push(read_v4_file_entry(&mut reader, name)?);
            }
        }
        Ok(header)
    }

    /// File entry for a `file` register value
    ///
    /// File numbers are 1-based before DWARF 5 and 0-based from DWARF 5 on.
    pub fn file(&self, file: u32) -> Option<&FileEntry<'a>>
    {
        let index = if self.version >= 5 {
            file as usize
        } else {
            (file as usize).checked_sub(1)?
        };
        self.file_names.get(index)
    }

    /// Directory name for a directory index; `None` means the compilation directory
    pub fn directory(&self, index: u64) -> Option<&'a str>
    {
        let index = usize::try_from(index).ok()?;
        if self.version >= 5 {
            self.include_directories.get(index).copied()
        } else {
            index
                .checked_sub(1)
                .and_then(|index| self.include_directories.get(index).copied())
        }
    }
}

fn read_v4_file_entry<'a>(reader: &mut Reader<'a>, name: &'a str) -> EmdbgResult<FileEntry<'a>>
{
    let directory_index = reader.uleb128()?;
    let _modification_time = reader.uleb128()?;
    let _length = reader.uleb128()?;
    Ok(FileEntry {
        name,
        directory_index,
    })
}

fn read_entry_format(reader: &mut Reader<'_>) -> EmdbgResult<Vec<(DwLnct, DwForm)>>
{
    let count = reader.u8()?;
    (0..count)
        .map(|_| {
            let content = reader.uleb128()?;
            let form = reader.uleb128()?;
            let content = u16::try_from(content).map_err(|_| reader.malformed("content type out of range"))?;
            let form = u16::try_from(form).map_err(|_| reader.malformed("form out of range"))?;
            Ok((DwLnct(content), DwForm(form)))
        })
        .collect()
}

fn read_entry<'a>(
    reader: &mut Reader<'a>,
    format: &[(DwLnct, DwForm)],
    encoding: Encoding,
    (debug_str, debug_line_str): (&'a [u8], &'a [u8]),
) -> EmdbgResult<FileEntry<'a>>
{
    let mut entry = FileEntry {
        name: "",
        directory_index: 0,
    };
    for &(content, form) in format {
        let value = read_form(reader, form, encoding, None)?;
        match content {
            dw::DW_LNCT_path => {
                entry.name = match value {
                    FormValue::String(text) => text,
                    FormValue::StrOffset(offset) => string_at(".debug_str", debug_str, offset as usize)?,
                    FormValue::LineStrOffset(offset) => string_at(".debug_line_str", debug_line_str, offset as usize)?,
                    _ => return Err(reader.malformed(format!("unsupported path form {form}"))),
                };
            }
            dw::DW_LNCT_directory_index => entry.directory_index = value.as_constant().unwrap_or(0),
            _ => {}
        }
    }
    Ok(entry)
}

/// A line program ready to run
#[derive(Debug, Clone)]
pub struct LineProgram<'a>
{
    pub header: LineProgramHeader<'a>,
    data: &'a [u8],
    compilation_directory: Option<String>,
}

impl<'a> LineProgram<'a>
{
    pub fn new(header: LineProgramHeader<'a>, debug_line: &'a [u8], compilation_directory: Option<String>) -> Self
    {
        Self {
            header,
            data: debug_line,
            compilation_directory,
        }
    }

    /// Run the state machine, calling `emit` for every emitted row
    ///
    /// End-of-sequence rows are emitted too, with `end_sequence` set.
    pub fn execute(&self, mut emit: impl FnMut(&LineState) -> ControlFlow<()>) -> EmdbgResult<()>
    {
        let header = &self.header;
        let mut reader = Reader::at(SECTION, self.data, header.program_offset)
            .truncated(header.end.saturating_sub(header.program_offset))?;
        let min_length = u32::from(header.minimum_instruction_length);
        let line_range = header.line_range;
        let mut state = LineState::new(header.default_is_stmt);

        macro_rules! emit_row {
            () => {
                if emit(&state).is_break() {
                    return Ok(());
                }
            };
        }

        while !reader.is_empty() {
            let opcode = reader.u8()?;
            if opcode >= header.opcode_base {
                let adjusted = opcode - header.opcode_base;
                let address_advance = u32::from(adjusted / line_range) * min_length;
                let line_advance = i32::from(header.line_base) + i32::from(adjusted % line_range);
                state.address = state.address.wrapping_add(address_advance);
                state.line = state.line.wrapping_add_signed(line_advance);
                emit_row!();
                state.basic_block = false;
                state.prologue_end = false;
                state.epilogue_begin = false;
                state.discriminator = 0;
                continue;
            }

            match DwLns(opcode) {
                dw::DW_LNS_copy => {
                    emit_row!();
                    state.basic_block = false;
                    state.prologue_end = false;
                    state.epilogue_begin = false;
                    state.discriminator = 0;
                }
                dw::DW_LNS_advance_pc => {
                    let advance = reader.uleb128_u32()?;
                    state.address = state.address.wrapping_add(advance.wrapping_mul(min_length));
                }
                dw::DW_LNS_advance_line => {
                    let advance = reader.sleb128_i32()?;
                    state.line = state.line.wrapping_add_signed(advance);
                }
                dw::DW_LNS_set_file => state.file = reader.uleb128_u32()?,
                dw::DW_LNS_set_column => state.column = reader.uleb128_u32()?,
                dw::DW_LNS_negate_stmt => state.is_stmt = !state.is_stmt,
                dw::DW_LNS_set_basic_block => state.basic_block = true,
                dw::DW_LNS_const_add_pc => {
                    let adjusted = 255 - header.opcode_base;
                    state.address = state
                        .address
                        .wrapping_add(u32::from(adjusted / line_range) * min_length);
                }
                dw::DW_LNS_fixed_advance_pc => state.address = state.address.wrapping_add(u32::from(reader.u16()?)),
                dw::DW_LNS_set_prologue_end => state.prologue_end = true,
                dw::DW_LNS_set_epilogue_begin => state.epilogue_begin = true,
                dw::DW_LNS_set_isa => state.isa = reader.uleb128_u32()?,
                _ if opcode == 0 => {
                    let length = reader.uleb128()?;
                    let length = usize::try_from(length).map_err(|_| reader.malformed("extended opcode length"))?;
                    if length == 0 {
                        continue;
                    }
                    let next = reader
                        .offset()
                        .checked_add(length)
                        .ok_or_else(|| reader.malformed("extended opcode length"))?;
                    match DwLne(reader.u8()?) {
                        dw::DW_LNE_end_sequence => {
                            state.end_sequence = true;
                            emit_row!();
                            state = LineState::new(header.default_is_stmt);
                        }
                        dw::DW_LNE_set_address => {
                            let size = u8::try_from(length - 1).map_err(|_| reader.malformed("address size"))?;
                            state.address = reader.sized(size)? as u32;
                        }
                        dw::DW_LNE_define_file => {
                            reader.cstr()?;
                        }
                        dw::DW_LNE_set_discriminator => state.discriminator = reader.uleb128_u32()?,
                        other => tracing::trace!(opcode = %other, "Skipping extended line opcode"),
                    }
                    reader.seek(next);
                }
                _ => {
                    let operands = header
                        .standard_opcode_lengths
                        .get(usize::from(opcode) - 1)
                        .copied()
                        .unwrap_or(0);
                    for _ in 0..operands {
                        reader.uleb128()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the state machine with `(previous, current)` row pairs
    pub fn run(&self, mut visitor: impl FnMut(&LineState, &LineState) -> ControlFlow<()>) -> EmdbgResult<()>
    {
        let mut previous: Option<LineState> = None;
        self.execute(|row| {
            if let Some(previous_row) = previous.as_ref() {
                if visitor(previous_row, row).is_break() {
                    return ControlFlow::Break(());
                }
            }
            previous = if row.end_sequence { None } else { Some(*row) };
            ControlFlow::Continue(())
        })
    }

    /// Every emitted row, end-of-sequence rows included
    pub fn rows(&self) -> EmdbgResult<Vec<LineState>>
    {
        let mut rows = Vec::new();
        self.execute(|row| {
            rows.push(*row);
            ControlFlow::Continue(())
        })?;
        Ok(rows)
    }

    /// Line of the row whose interval contains `address`
    pub fn line_number_for_address(&self, address: u32) -> EmdbgResult<Option<LineLookup>>
    {
        let mut found = None;
        self.run(|previous, current| {
            if previous.address <= address && address < current.address {
                found = Some(LineLookup {
                    line: previous.line,
                    file: previous.file,
                    column: previous.column,
                    is_address_on_exact_line_number_boundary: previous.is_stmt && previous.address == address,
                });
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        })?;
        Ok(found)
    }

    /// Full path of a file register value
    pub fn file_path(&self, file: u32) -> Option<String>
    {
        let entry = self.header.file(file)?;
        if is_absolute(entry.name) {
            return Some(entry.name.to_owned());
        }
        let directory = self.header.directory(entry.directory_index);
        let mut path = String::new();
        match directory {
            Some(directory) if is_absolute(directory) => path.push_str(directory),
            Some(directory) => {
                if let Some(compilation_directory) = &self.compilation_directory {
                    path.push_str(compilation_directory);
                    path.push('/');
                }
                path.push_str(directory);
            }
            None => {
                if let Some(compilation_directory) = &self.compilation_directory {
                    path.push_str(compilation_directory);
                }
            }
        }
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(entry.name);
        Some(path)
    }

    /// File register values whose path ends with `file_name`
    fn matching_files(&self, file_name: &str) -> Vec<u32>
    {
        let first = u32::from(self.header.version < 5);
        (first..first + self.header.file_names.len() as u32)
            .filter(|&file| {
                self.file_path(file)
                    .is_some_and(|path| path == file_name || path.ends_with(&format!("/{file_name}")))
            })
            .collect()
    }

    /// Statement addresses that begin `line` of `file_name`
    pub fn addresses_for_file_line(&self, file_name: &str, line: u32) -> EmdbgResult<Vec<u32>>
    {
        let files = self.matching_files(file_name);
        let mut addresses = Vec::new();
        if files.is_empty() {
            return Ok(addresses);
        }
        self.run(|previous, current| {
            if previous.line == line
                && previous.is_stmt
                && previous.address < current.address
                && files.contains(&previous.file)
            {
                addresses.push(previous.address);
            }
            ControlFlow::Continue(())
        })?;
        addresses.sort_unstable();
        addresses.dedup();
        Ok(addresses)
    }

    /// Full paths of every file in the table
    pub fn source_files(&self) -> Vec<String>
    {
        let first = u32::from(self.header.version < 5);
        (first..first + self.header.file_names.len() as u32)
            .filter_map(|file| self.file_path(file))
            .collect()
    }
}

fn is_absolute(path: &str) -> bool
{
    path.starts_with('/') || path.starts_with('\\') || path.as_bytes().get(1) == Some(&b':')
}

impl<'a> DwarfData<'a>
{
    /// Line program of a unit, if it has one
    pub fn line_program(&self, unit: &CompilationUnitFingerprint) -> EmdbgResult<Option<LineProgram<'a>>>
    {
        let Some(offset) = unit.statement_list_offset else {
            return Ok(None);
        };
        let header = LineProgramHeader::parse(
            self.sections.debug_line,
            offset,
            self.sections.debug_str,
            self.sections.debug_line_str,
        )?;
        Ok(Some(LineProgram::new(
            header,
            self.sections.debug_line,
            unit.compilation_directory.clone(),
        )))
    }

    /// File and line for a code address
    pub fn source_code_coordinates_for_address(&self, address: u32) -> EmdbgResult<Option<SourceCoordinates>>
    {
        let Some(unit) = self.unit_for_address(address) else {
            return Ok(None);
        };
        let Some(program) = self.line_program(unit)? else {
            return Ok(None);
        };
        let Some(lookup) = program.line_number_for_address(address)? else {
            return Ok(None);
        };
        Ok(Some(SourceCoordinates {
            file: program.file_path(lookup.file).unwrap_or_else(|| "??".to_owned()),
            line: lookup.line,
            column: lookup.column,
            is_address_on_exact_line_number_boundary: lookup.is_address_on_exact_line_number_boundary,
        }))
    }

    /// Breakpoint addresses for `file_name:line` across all units
    pub fn addresses_for_source_line(&self, file_name: &str, line: u32) -> EmdbgResult<Vec<u32>>
    {
        let mut addresses = Vec::new();
        for unit in self.units() {
            if let Some(program) = self.line_program(unit)? {
                addresses.extend(program.addresses_for_file_line(file_name, line)?);
            }
        }
        addresses.sort_unstable();
        addresses.dedup();
        Ok(addresses)
    }

    /// Every source file named by any line program
    pub fn source_files(&self) -> EmdbgResult<Vec<String>>
    {
        let mut files = Vec::new();
        for unit in self.units() {
            if let Some(program) = self.line_program(unit)? {
                files.extend(program.source_files());
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    const STANDARD_OPCODE_LENGTHS: [u8; 12] = [0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1];

    /// Wrap a header body and a program in unit_length and header_length fields
    ///
    /// `prefix` holds the fields between version and header_length.
    fn line_unit(prefix: &[u8], header: &[u8], program: &[u8]) -> Vec<u8>
    {
        let mut body = prefix.to_vec();
        body.extend_from_slice(&(header.len() as u32).to_le_bytes());
        body.extend_from_slice(header);
        body.extend_from_slice(program);
        let mut bytes = (body.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&body);
        bytes
    }

    fn set_address(address: u32) -> Vec<u8>
    {
        let mut bytes = vec![0x00, 0x05, dw::DW_LNE_set_address.0];
        bytes.extend_from_slice(&address.to_le_bytes());
        bytes
    }

    /// DWARF 3: minimum instruction length 2, line_base -5, line_range 14
    fn v3_unit() -> Vec<u8>
    {
        let mut header = vec![2, 1, (-5i8) as u8, 14, 13];
        header.extend_from_slice(&STANDARD_OPCODE_LENGTHS);
        header.extend_from_slice(b"inc\0/abs\0\0");
        header.extend_from_slice(b"main.c\0\x00\x00\x00");
        header.extend_from_slice(b"util.h\0\x01\x00\x00");
        header.extend_from_slice(b"lib.h\0\x02\x00\x00");
        header.push(0);

        let mut program = set_address(0x1000);
        program.push(dw::DW_LNS_copy.0);
        program.extend_from_slice(&[dw::DW_LNS_advance_line.0, 9]);
        // Special opcode: two instructions (4 bytes) and one line
        program.push(13 + (1 + 5) + 14 * 2);
        program.extend_from_slice(&[dw::DW_LNS_set_file.0, 2]);
        // 17 instructions (34 bytes) to 0x1026
        program.push(dw::DW_LNS_const_add_pc.0);
        // Unscaled advance to 0x1030
        program.extend_from_slice(&[dw::DW_LNS_fixed_advance_pc.0, 0x0a, 0x00]);
        program.push(dw::DW_LNS_copy.0);
        program.extend_from_slice(&[0x00, 12, dw::DW_LNE_define_file.0]);
        program.extend_from_slice(b"extra.c\0\x00\x00\x00");
        program.extend_from_slice(&[dw::DW_LNS_advance_pc.0, 4]);
        program.extend_from_slice(&[0x00, 0x01, dw::DW_LNE_end_sequence.0]);

        line_unit(&3u16.to_le_bytes(), &header, &program)
    }

    const V5_LINE_STR: &[u8] = b"/build\0sub\0main.c\0part.c\0";

    /// DWARF 5 with `.debug_line_str` paths, udata directory indices and MD5s
    fn v5_unit() -> Vec<u8>
    {
        let mut header = vec![2, 1, 1, (-5i8) as u8, 14, 13];
        header.extend_from_slice(&STANDARD_OPCODE_LENGTHS);
        header.extend_from_slice(&[1, dw::DW_LNCT_path.0 as u8, dw::DW_FORM_line_strp.0 as u8]);
        header.push(2);
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&7u32.to_le_bytes());
        header.extend_from_slice(&[
            3,
            dw::DW_LNCT_path.0 as u8,
            dw::DW_FORM_line_strp.0 as u8,
            dw::DW_LNCT_directory_index.0 as u8,
            dw::DW_FORM_udata.0 as u8,
            dw::DW_LNCT_MD5.0 as u8,
            dw::DW_FORM_data16.0 as u8,
        ]);
        header.push(2);
        for (name, directory) in [(11u32, 0u8), (18, 1)] {
            header.extend_from_slice(&name.to_le_bytes());
            header.push(directory);
            header.extend_from_slice(&[0xa5; 16]);
        }

        let mut program = set_address(0x2000);
        program.extend_from_slice(&[dw::DW_LNS_set_file.0, 0]);
        program.push(dw::DW_LNS_copy.0);
        program.extend_from_slice(&[dw::DW_LNS_advance_line.0, 4]);
        // One instruction (2 bytes), same line
        program.push(13 + 5 + 14);
        program.extend_from_slice(&[dw::DW_LNS_advance_pc.0, 3]);
        program.extend_from_slice(&[0x00, 0x01, dw::DW_LNE_end_sequence.0]);

        // version, address_size, segment_selector_size
        line_unit(&[5, 0, 4, 0], &header, &program)
    }

    fn program<'a>(debug_line: &'a [u8], line_str: &'a [u8], compilation_directory: &str) -> LineProgram<'a>
    {
        let header = LineProgramHeader::parse(debug_line, 0, &[], line_str).unwrap();
        LineProgram::new(header, debug_line, Some(compilation_directory.to_owned()))
    }

    #[test]
    fn test_v3_header()
    {
        let bytes = v3_unit();
        let header = LineProgramHeader::parse(&bytes, 0, &[], &[]).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.maximum_operations_per_instruction, 1);
        assert_eq!(header.line_base, -5);
        assert_eq!(header.include_directories, vec!["inc", "/abs"]);
        assert_eq!(header.file_names.len(), 3);
        assert_eq!(header.file(1).map(|file| file.name), Some("main.c"));
        assert_eq!(header.file(0), None);
    }

    #[test]
    fn test_v3_file_paths()
    {
        let bytes = v3_unit();
        let program = program(&bytes, &[], "/src");
        assert_eq!(program.file_path(1).as_deref(), Some("/src/main.c"));
        assert_eq!(program.file_path(2).as_deref(), Some("/src/inc/util.h"));
        assert_eq!(program.file_path(3).as_deref(), Some("/abs/lib.h"));
        assert_eq!(program.file_path(4), None);
    }

    #[test]
    fn test_v3_rows_cover_address_opcodes()
    {
        let bytes = v3_unit();
        let program = program(&bytes, &[], "/src");
        let rows: Vec<_> = program
            .rows()
            .unwrap()
            .iter()
            .map(|row| (row.address, row.line, row.file, row.end_sequence))
            .collect();
        assert_eq!(rows, vec![
            (0x1000, 1, 1, false),
            (0x1004, 11, 1, false),
            (0x1030, 11, 2, false),
            (0x1038, 11, 2, true),
        ]);
    }

    #[test]
    fn test_v3_line_lookup()
    {
        let bytes = v3_unit();
        let program = program(&bytes, &[], "/src");

        let lookup = program.line_number_for_address(0x1002).unwrap().unwrap();
        assert_eq!((lookup.line, lookup.file), (1, 1));
        assert!(!lookup.is_address_on_exact_line_number_boundary);

        let lookup = program.line_number_for_address(0x1004).unwrap().unwrap();
        assert_eq!((lookup.line, lookup.file), (11, 1));
        assert!(lookup.is_address_on_exact_line_number_boundary);

        let lookup = program.line_number_for_address(0x1037).unwrap().unwrap();
        assert_eq!((lookup.line, lookup.file), (11, 2));

        assert_eq!(program.line_number_for_address(0x1038).unwrap(), None);
        assert_eq!(program.line_number_for_address(0x0fff).unwrap(), None);
    }

    #[test]
    fn test_v3_addresses_for_file_line()
    {
        let bytes = v3_unit();
        let program = program(&bytes, &[], "/src");
        assert_eq!(program.addresses_for_file_line("main.c", 11).unwrap(), vec![0x1004]);
        assert_eq!(program.addresses_for_file_line("inc/util.h", 11).unwrap(), vec![0x1030]);
        assert!(program.addresses_for_file_line("lib.h", 11).unwrap().is_empty());
    }

    #[test]
    fn test_v5_header()
    {
        let bytes = v5_unit();
        let header = LineProgramHeader::parse(&bytes, 0, &[], V5_LINE_STR).unwrap();
        assert_eq!(header.version, 5);
        assert_eq!(header.address_size, 4);
        assert_eq!(header.include_directories, vec!["/build", "sub"]);
        assert_eq!(header.file_names, vec![
            FileEntry {
                name: "main.c",
                directory_index: 0,
            },
            FileEntry {
                name: "part.c",
                directory_index: 1,
            },
        ]);
        assert_eq!(header.file(0).map(|file| file.name), Some("main.c"));
    }

    #[test]
    fn test_v5_file_paths_and_lookup()
    {
        let bytes = v5_unit();
        let program = program(&bytes, V5_LINE_STR, "/build");
        assert_eq!(program.file_path(0).as_deref(), Some("/build/main.c"));
        assert_eq!(program.file_path(1).as_deref(), Some("/build/sub/part.c"));
        assert_eq!(program.source_files(), vec!["/build/main.c", "/build/sub/part.c"]);

        let lookup = program.line_number_for_address(0x2004).unwrap().unwrap();
        assert_eq!((lookup.line, lookup.file), (5, 0));
        assert!(!lookup.is_address_on_exact_line_number_boundary);
        assert_eq!(program.line_number_for_address(0x2008).unwrap(), None);
    }

    #[test]
    fn test_huge_extended_opcode_length_is_malformed()
    {
        let mut header = vec![1, 1, (-5i8) as u8, 14, 13];
        header.extend_from_slice(&STANDARD_OPCODE_LENGTHS);
        header.extend_from_slice(b"\0main.c\0\x00\x00\x00\0");
        let mut program_bytes = vec![0x00];
        program_bytes.extend_from_slice(&[0xff; 9]);
        program_bytes.extend_from_slice(&[0x01, dw::DW_LNE_set_discriminator.0, 0]);
        let bytes = line_unit(&3u16.to_le_bytes(), &header, &program_bytes);

        let program = program(&bytes, &[], "/src");
        assert!(matches!(program.rows(), Err(EmdbgError::Malformed { .. })));
    }

    #[test]
    fn test_rejects_zero_line_range()
    {
        let mut header = vec![1, 1, (-5i8) as u8, 0, 13];
        header.extend_from_slice(&STANDARD_OPCODE_LENGTHS);
        header.extend_from_slice(b"\0\0");
        let bytes = line_unit(&3u16.to_le_bytes(), &header, &[]);
        assert!(matches!(
            LineProgramHeader::parse(&bytes, 0, &[], &[]),
            Err(EmdbgError::Malformed { .. })
        ));
    }
}
