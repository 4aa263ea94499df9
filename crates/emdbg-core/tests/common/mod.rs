//! Synthetic DWARF sections for integration tests.
//!
//! The fixture describes a two-unit program:
//!
//! ```text
//! main.c (DWARF 4, 0x1000..0x1060)
//!   types: int, char, unsigned int, struct pair, struct node (self
//!          referential), int[4], word_t, struct empty, char[], struct flags
//!   main   0x1000..0x1040  locals p, counter (location list), limit
//!                          (constant), lexical block with inner, call site
//!                          returning to 0x1020 that passes r4 in r0
//!   callee 0x1040..0x1060  arg (entry value of r0), scratch (fbreg -8)
//! util.c (DWARF 5, 0x2000..0x2010, strx/addrx forms)
//!   helper, static total
//! ```
//!
//! `.debug_frame` has one CIE and FDEs for `main` (outermost frame) and
//! `callee` (`push {r4, lr}` at 0x1040).

#![allow(dead_code)]

use std::collections::HashMap;

use emdbg_core::dwarf::DebugSections;
use gimli::constants as dw;
use gimli::{DwAt, DwForm, DwTag};

/// Growable section with label fixups
#[derive(Debug, Default)]
pub struct Section
{
    pub bytes: Vec<u8>,
    labels: HashMap<&'static str, u32>,
    fixups: Vec<(usize, &'static str, u32)>,
}

impl Section
{
    pub fn len(&self) -> u32
    {
        self.bytes.len() as u32
    }

    pub fn u8(&mut self, value: u8) -> &mut Self
    {
        self.bytes.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self
    {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self
    {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn uleb(&mut self, mut value: u64) -> &mut Self
    {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.bytes.push(byte);
                return self;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    pub fn sleb(&mut self, mut value: i64) -> &mut Self
    {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.bytes.push(byte);
                return self;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    pub fn cstr(&mut self, text: &str) -> &mut Self
    {
        self.bytes.extend_from_slice(text.as_bytes());
        self.bytes.push(0);
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self
    {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// `exprloc`: ULEB128 length then the expression
    pub fn exprloc(&mut self, expression: &[u8]) -> &mut Self
    {
        self.uleb(expression.len() as u64);
        self.raw(expression)
    }

    pub fn label(&mut self, name: &'static str) -> &mut Self
    {
        let offset = self.len();
        self.labels.insert(name, offset);
        self
    }

    /// 4-byte reference to `label`, minus `base`
    pub fn reference(&mut self, label: &'static str, base: u32) -> &mut Self
    {
        self.fixups.push((self.bytes.len(), label, base));
        self.u32(0)
    }

    /// Reserve a unit length field, returning its position
    pub fn begin_length(&mut self) -> usize
    {
        let position = self.bytes.len();
        self.u32(0);
        position
    }

    /// Patch the length field at `position` to cover everything after it
    pub fn end_length(&mut self, position: usize)
    {
        let length = (self.bytes.len() - position - 4) as u32;
        self.bytes[position..position + 4].copy_from_slice(&length.to_le_bytes());
    }

    pub fn offset_of(&self, label: &str) -> u32
    {
        self.labels[label]
    }

    /// Apply every pending reference
    pub fn resolve(&mut self)
    {
        for (position, label, base) in std::mem::take(&mut self.fixups) {
            let value = self.labels[label] - base;
            self.bytes[position..position + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Append an abbreviation declaration
pub fn abbreviation(section: &mut Section, code: u64, tag: DwTag, children: bool, attributes: &[(DwAt, DwForm)])
{
    section.uleb(code).uleb(u64::from(tag.0)).u8(u8::from(children));
    for (name, form) in attributes {
        section.uleb(u64::from(name.0)).uleb(u64::from(form.0));
    }
    section.u8(0).u8(0);
}

/// A lone DWARF 4 unit outside the shared fixture
///
/// `abbreviations` must declare code 1 as a compile unit with a
/// `DW_FORM_string` name; `dies` writes the children of the unit DIE.
pub fn standalone_unit(abbreviations: impl FnOnce(&mut Section), dies: impl FnOnce(&mut Section)) -> (Section, Section)
{
    let mut abbrev = Section::default();
    abbreviations(&mut abbrev);
    abbrev.u8(0);

    let mut info = Section::default();
    let length = info.begin_length();
    info.u16(4).u32(0).u8(4);
    info.uleb(1).cstr("standalone.c");
    dies(&mut info);
    info.u8(0);
    info.end_length(length);
    info.resolve();
    (info, abbrev)
}

/// Owned section contents plus named DIE offsets
#[derive(Debug, Default)]
pub struct Fixture
{
    pub info: Vec<u8>,
    pub abbrev: Vec<u8>,
    pub str: Vec<u8>,
    pub str_offsets: Vec<u8>,
    pub addr: Vec<u8>,
    pub line: Vec<u8>,
    pub loc: Vec<u8>,
    pub frame: Vec<u8>,
    pub offsets: HashMap<&'static str, u32>,
}

impl Fixture
{
    pub fn sections(&self) -> DebugSections<'_>
    {
        DebugSections {
            debug_info: &self.info,
            debug_abbrev: &self.abbrev,
            debug_str: &self.str,
            debug_str_offsets: &self.str_offsets,
            debug_addr: &self.addr,
            debug_line: &self.line,
            debug_loc: &self.loc,
            debug_frame: &self.frame,
            ..DebugSections::default()
        }
    }

    pub fn offset(&self, name: &str) -> u32
    {
        self.offsets[name]
    }
}

const LABELS: &[&str] = &[
    "cu1", "int", "char", "uint", "pair", "node", "node_ptr", "int_array", "word_t", "empty", "flex", "flags", "main",
    "p", "counter", "limit", "block", "inner", "site", "callee", "arg", "scratch", "cu2", "helper", "total",
];

// Abbreviation codes of the first unit
const CU: u64 = 1;
const BASE_TYPE: u64 = 2;
const STRUCT: u64 = 3;
const MEMBER: u64 = 4;
const POINTER: u64 = 5;
const ARRAY: u64 = 6;
const SUBRANGE: u64 = 7;
const TYPEDEF: u64 = 8;
const SUBPROGRAM: u64 = 9;
const VARIABLE: u64 = 10;
const PARAMETER_LOCLIST: u64 = 11;
const LEXICAL_BLOCK: u64 = 12;
const CALL_SITE: u64 = 13;
const CALL_SITE_PARAMETER: u64 = 14;
const EMPTY_STRUCT: u64 = 15;
const FLEXIBLE_SUBRANGE: u64 = 16;
const BIT_FIELD: u64 = 17;
const CONSTANT: u64 = 18;
const PARAMETER: u64 = 19;

fn first_unit_abbreviations(abbrev: &mut Section)
{
    use gimli::constants::*;

    abbreviation(abbrev, CU, DW_TAG_compile_unit, true, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_comp_dir, DW_FORM_string),
        (DW_AT_low_pc, DW_FORM_addr),
        (DW_AT_high_pc, DW_FORM_data4),
        (DW_AT_stmt_list, DW_FORM_sec_offset),
    ]);
    abbreviation(abbrev, BASE_TYPE, DW_TAG_base_type, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_byte_size, DW_FORM_data1),
        (DW_AT_encoding, DW_FORM_data1),
    ]);
    abbreviation(abbrev, STRUCT, DW_TAG_structure_type, true, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_byte_size, DW_FORM_data1),
    ]);
    abbreviation(abbrev, MEMBER, DW_TAG_member, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_type, DW_FORM_ref4),
        (DW_AT_data_member_location, DW_FORM_data1),
    ]);
    abbreviation(abbrev, POINTER, DW_TAG_pointer_type, false, &[
        (DW_AT_byte_size, DW_FORM_data1),
        (DW_AT_type, DW_FORM_ref4),
    ]);
    abbreviation(abbrev, ARRAY, DW_TAG_array_type, true, &[(DW_AT_type, DW_FORM_ref4)]);
    abbreviation(abbrev, SUBRANGE, DW_TAG_subrange_type, false, &[(DW_AT_upper_bound, DW_FORM_data1)]);
    abbreviation(abbrev, TYPEDEF, DW_TAG_typedef, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_type, DW_FORM_ref4),
    ]);
    abbreviation(abbrev, SUBPROGRAM, DW_TAG_subprogram, true, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_low_pc, DW_FORM_addr),
        (DW_AT_high_pc, DW_FORM_data4),
        (DW_AT_frame_base, DW_FORM_exprloc),
        (DW_AT_decl_file, DW_FORM_data1),
        (DW_AT_decl_line, DW_FORM_data1),
    ]);
    abbreviation(abbrev, VARIABLE, DW_TAG_variable, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_type, DW_FORM_ref4),
        (DW_AT_location, DW_FORM_exprloc),
    ]);
    abbreviation(abbrev, PARAMETER_LOCLIST, DW_TAG_formal_parameter, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_type, DW_FORM_ref4),
        (DW_AT_location, DW_FORM_sec_offset),
    ]);
    abbreviation(abbrev, LEXICAL_BLOCK, DW_TAG_lexical_block, true, &[
        (DW_AT_low_pc, DW_FORM_addr),
        (DW_AT_high_pc, DW_FORM_data4),
    ]);
    abbreviation(abbrev, CALL_SITE, DW_TAG_GNU_call_site, true, &[
        (DW_AT_low_pc, DW_FORM_addr),
        (DW_AT_abstract_origin, DW_FORM_ref4),
    ]);
    abbreviation(abbrev, CALL_SITE_PARAMETER, DW_TAG_GNU_call_site_parameter, false, &[
        (DW_AT_location, DW_FORM_exprloc),
        (DW_AT_GNU_call_site_value, DW_FORM_exprloc),
    ]);
    abbreviation(abbrev, EMPTY_STRUCT, DW_TAG_structure_type, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_byte_size, DW_FORM_data1),
    ]);
    abbreviation(abbrev, FLEXIBLE_SUBRANGE, DW_TAG_subrange_type, false, &[]);
    abbreviation(abbrev, BIT_FIELD, DW_TAG_member, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_type, DW_FORM_ref4),
        (DW_AT_byte_size, DW_FORM_data1),
        (DW_AT_bit_size, DW_FORM_data1),
        (DW_AT_bit_offset, DW_FORM_data1),
        (DW_AT_data_member_location, DW_FORM_data1),
    ]);
    abbreviation(abbrev, CONSTANT, DW_TAG_variable, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_type, DW_FORM_ref4),
        (DW_AT_const_value, DW_FORM_data1),
    ]);
    abbreviation(abbrev, PARAMETER, DW_TAG_formal_parameter, false, &[
        (DW_AT_name, DW_FORM_string),
        (DW_AT_type, DW_FORM_ref4),
        (DW_AT_location, DW_FORM_exprloc),
    ]);
    abbrev.u8(0);
}

fn second_unit_abbreviations(abbrev: &mut Section)
{
    use gimli::constants::*;

    abbreviation(abbrev, 1, DW_TAG_compile_unit, true, &[
        (DW_AT_name, DW_FORM_strx1),
        (DW_AT_str_offsets_base, DW_FORM_sec_offset),
        (DW_AT_addr_base, DW_FORM_sec_offset),
        (DW_AT_low_pc, DW_FORM_addrx),
        (DW_AT_high_pc, DW_FORM_data4),
    ]);
    abbreviation(abbrev, 2, DW_TAG_subprogram, false, &[
        (DW_AT_name, DW_FORM_strx1),
        (DW_AT_low_pc, DW_FORM_addrx),
        (DW_AT_high_pc, DW_FORM_data4),
        (DW_AT_type, DW_FORM_ref_addr),
    ]);
    abbreviation(abbrev, 3, DW_TAG_variable, false, &[
        (DW_AT_name, DW_FORM_strx1),
        (DW_AT_type, DW_FORM_ref_addr),
        (DW_AT_location, DW_FORM_exprloc),
    ]);
    abbrev.u8(0);
}

fn member(info: &mut Section, name: &str, type_label: &'static str, location: u8)
{
    info.uleb(MEMBER).cstr(name).reference(type_label, 0).u8(location);
}

fn first_unit(info: &mut Section)
{
    // References are written relative to the section start; the first unit
    // begins at offset 0, so they are also unit-relative.
    info.label("cu1");
    let length = info.begin_length();
    info.u16(4).u32(0).u8(4);

    info.uleb(CU).cstr("main.c").cstr("/src").u32(0x1000).u32(0x60).u32(0);

    info.label("int").uleb(BASE_TYPE).cstr("int").u8(4).u8(dw::DW_ATE_signed.0);
    info.label("char").uleb(BASE_TYPE).cstr("char").u8(1).u8(dw::DW_ATE_signed_char.0);
    info.label("uint").uleb(BASE_TYPE).cstr("unsigned int").u8(4).u8(dw::DW_ATE_unsigned.0);

    info.label("pair").uleb(STRUCT).cstr("pair").u8(8);
    member(info, "a", "int", 0);
    member(info, "b", "char", 4);
    info.u8(0);

    info.label("node").uleb(STRUCT).cstr("node").u8(8);
    member(info, "value", "int", 0);
    member(info, "next", "node_ptr", 4);
    info.u8(0);
    info.label("node_ptr").uleb(POINTER).u8(4).reference("node", 0);

    info.label("int_array").uleb(ARRAY).reference("int", 0);
    info.uleb(SUBRANGE).u8(3);
    info.u8(0);

    info.label("word_t").uleb(TYPEDEF).cstr("word_t").reference("uint", 0);
    info.label("empty").uleb(EMPTY_STRUCT).cstr("empty").u8(0);

    info.label("flex").uleb(ARRAY).reference("char", 0);
    info.uleb(FLEXIBLE_SUBRANGE);
    info.u8(0);

    info.label("flags").uleb(STRUCT).cstr("flags").u8(4);
    info.uleb(BIT_FIELD).cstr("low").reference("uint", 0).u8(4).u8(3).u8(29).u8(0);
    info.uleb(BIT_FIELD).cstr("high").reference("uint", 0).u8(4).u8(5).u8(24).u8(0);
    info.u8(0);

    info.label("main").uleb(SUBPROGRAM).cstr("main").u32(0x1000).u32(0x40);
    info.exprloc(&[dw::DW_OP_call_frame_cfa.0]).u8(1).u8(9);
    info.label("p").uleb(VARIABLE).cstr("p").reference("pair", 0);
    info.exprloc(&[dw::DW_OP_fbreg.0, 0x78]);
    info.label("counter").uleb(PARAMETER_LOCLIST).cstr("counter").reference("int", 0).u32(0);
    info.label("limit").uleb(CONSTANT).cstr("limit").reference("int", 0).u8(42);
    info.label("block").uleb(LEXICAL_BLOCK).u32(0x1008).u32(0x8);
    info.label("inner").uleb(VARIABLE).cstr("inner").reference("word_t", 0);
    info.exprloc(&[dw::DW_OP_reg4.0]);
    info.u8(0);
    info.label("site").uleb(CALL_SITE).u32(0x1020).reference("callee", 0);
    info.uleb(CALL_SITE_PARAMETER);
    info.exprloc(&[dw::DW_OP_reg0.0]);
    info.exprloc(&[dw::DW_OP_breg4.0, 0x00]);
    info.u8(0);
    info.u8(0);

    info.label("callee").uleb(SUBPROGRAM).cstr("callee").u32(0x1040).u32(0x20);
    info.exprloc(&[dw::DW_OP_call_frame_cfa.0]).u8(1).u8(19);
    info.label("arg").uleb(PARAMETER).cstr("arg").reference("int", 0);
    info.exprloc(&[dw::DW_OP_entry_value.0, 0x01, dw::DW_OP_reg0.0, dw::DW_OP_stack_value.0]);
    info.label("scratch").uleb(VARIABLE).cstr("scratch").reference("int", 0);
    info.exprloc(&[dw::DW_OP_fbreg.0, 0x78]);
    info.u8(0);

    info.u8(0);
    info.end_length(length);
}

fn second_unit(info: &mut Section, abbrev_offset: u32)
{
    info.label("cu2");
    let length = info.begin_length();
    info.u16(5).u8(dw::DW_UT_compile.0).u8(4).u32(abbrev_offset);

    info.uleb(1).u8(0).u32(8).u32(8).uleb(0).u32(0x10);
    info.label("helper").uleb(2).u8(1).uleb(0).u32(0x10).reference("int", 0);
    info.label("total").uleb(3).u8(2).reference("int", 0);
    info.exprloc(&[dw::DW_OP_addrx.0, 0x01]);
    info.u8(0);
    info.end_length(length);
}

fn line_program(line: &mut Section)
{
    let length = line.begin_length();
    line.u16(4);
    let header_length = line.begin_length();
    // minimum_instruction_length, maximum_operations_per_instruction,
    // default_is_stmt, line_base, line_range, opcode_base
    line.u8(1).u8(1).u8(1).u8(0xfb).u8(14).u8(13);
    line.raw(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
    line.u8(0);
    line.cstr("main.c").uleb(0).uleb(0).uleb(0);
    line.u8(0);
    line.end_length(header_length);

    line.u8(0).uleb(5).u8(dw::DW_LNE_set_address.0).u32(0x1000);
    line.u8(dw::DW_LNS_advance_line.0).sleb(9);
    line.u8(dw::DW_LNS_copy.0);
    // address +4, line +1
    line.u8(75);
    line.u8(75);
    line.u8(dw::DW_LNS_negate_stmt.0);
    line.u8(75);
    line.u8(dw::DW_LNS_negate_stmt.0);
    // address +8, line +1
    line.u8(131);
    line.u8(dw::DW_LNS_advance_pc.0).uleb(0x2c);
    line.u8(dw::DW_LNS_advance_line.0).sleb(6);
    line.u8(dw::DW_LNS_copy.0);
    line.u8(dw::DW_LNS_advance_pc.0).uleb(0x20);
    line.u8(0).uleb(1).u8(dw::DW_LNE_end_sequence.0);
    line.end_length(length);
}

fn location_lists(loc: &mut Section)
{
    // counter: r0 until 0x1010, then [sp + 4]
    loc.u32(0x0).u32(0x10).u16(1).u8(dw::DW_OP_reg0.0);
    loc.u32(0x10).u32(0x40).u16(2).u8(dw::DW_OP_breg13.0).u8(0x04);
    loc.u32(0).u32(0);
}

fn call_frame_information(frame: &mut Section)
{
    let cie = frame.begin_length();
    frame.u32(0xffff_ffff).u8(1).cstr("").uleb(1).sleb(-4).u8(14);
    frame.u8(dw::DW_CFA_def_cfa.0).uleb(13).uleb(0);
    frame.end_length(cie);

    let main = frame.begin_length();
    frame.u32(0).u32(0x1000).u32(0x40);
    frame.u8(dw::DW_CFA_undefined.0).uleb(14);
    frame.end_length(main);

    let callee = frame.begin_length();
    frame.u32(0).u32(0x1040).u32(0x20);
    frame.u8(dw::DW_CFA_advance_loc.0 | 2);
    frame.u8(dw::DW_CFA_def_cfa_offset.0).uleb(8);
    frame.u8(dw::DW_CFA_offset.0 | 14).uleb(1);
    frame.u8(dw::DW_CFA_offset.0 | 4).uleb(2);
    frame.end_length(callee);
}

/// Build the two-unit fixture
pub fn fixture() -> Fixture
{
    let mut abbrev = Section::default();
    first_unit_abbreviations(&mut abbrev);
    let second_abbrev = abbrev.len();
    second_unit_abbreviations(&mut abbrev);

    let mut info = Section::default();
    first_unit(&mut info);
    second_unit(&mut info, second_abbrev);
    info.resolve();

    let mut str = Section::default();
    str.cstr("util.c").cstr("helper").cstr("total");

    let mut str_offsets = Section::default();
    let header = str_offsets.begin_length();
    str_offsets.u16(5).u16(0).u32(0).u32(7).u32(14);
    str_offsets.end_length(header);

    let mut addr = Section::default();
    let header = addr.begin_length();
    addr.u16(5).u8(4).u8(0).u32(0x2000).u32(0x2000_0400);
    addr.end_length(header);

    let mut line = Section::default();
    line_program(&mut line);
    let mut loc = Section::default();
    location_lists(&mut loc);
    let mut frame = Section::default();
    call_frame_information(&mut frame);

    let offsets = LABELS
        .iter()
        .map(|&label| (label, info.offset_of(label)))
        .collect();

    Fixture {
        info: info.bytes,
        abbrev: abbrev.bytes,
        str: str.bytes,
        str_offsets: str_offsets.bytes,
        addr: addr.bytes,
        line: line.bytes,
        loc: loc.bytes,
        frame: frame.bytes,
        offsets,
    }
}

/// Memory and registers of a target stopped in `callee` at 0x1050
///
/// `callee` pushed r4 (0x55) and lr (0x1021) at 0x20000100.
pub fn stopped_in_callee() -> emdbg_core::CorefileTarget
{
    let mut registers = [0; 16];
    registers[0] = 0xdead;
    registers[4] = 0x99;
    registers[13] = 0x2000_0100;
    registers[15] = 0x1050;
    let ram: Vec<u8> = [0x55u32, 0x1021, 0, 0x1234, 0, 0, 0, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect();
    emdbg_core::CorefileTarget::new(registers).with_ram(0x2000_0100, ram)
}
