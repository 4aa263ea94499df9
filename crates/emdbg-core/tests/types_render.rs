//! Type graphs, C declarators, data layouts and value formatting.

mod common;

use emdbg_core::dwarf::{ArrayDimension, DebugSections, RECURSION_MARKER};
use emdbg_core::value::{format_value, NumericBase};
use emdbg_core::DwarfData;
use gimli::constants as dw;

fn type_string_of(dwarf: &DwarfData<'_>, offset: u32) -> String
{
    let nodes = dwarf.read_type_of_die(offset).unwrap();
    dwarf.type_string(&nodes, 0).unwrap()
}

#[test]
fn test_type_strings()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    assert_eq!(type_string_of(&dwarf, fixture.offset("int")), "int");
    assert_eq!(type_string_of(&dwarf, fixture.offset("pair")), "struct pair { int a; char b; }");
    assert_eq!(type_string_of(&dwarf, fixture.offset("int_array")), "int [4]");
    assert_eq!(type_string_of(&dwarf, fixture.offset("word_t")), "word_t");
    assert_eq!(type_string_of(&dwarf, fixture.offset("flex")), "char []");
    assert_eq!(type_string_of(&dwarf, fixture.offset("empty")), "struct empty { }");
    assert_eq!(
        type_string_of(&dwarf, fixture.offset("flags")),
        "struct flags { unsigned int low : 3; unsigned int high : 5; }"
    );
}

#[test]
fn test_self_referential_struct_terminates()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    let rendered = type_string_of(&dwarf, fixture.offset("node"));
    assert!(rendered.starts_with("struct node { int value;"));
    assert!(rendered.contains("<recursive>"));
    assert!(rendered.ends_with("*next; }"));
}

#[test]
fn test_type_name_does_not_expand_named_aggregates()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    let nodes = dwarf.read_type_of_die(fixture.offset("node_ptr")).unwrap();
    assert_eq!(dwarf.type_name(&nodes, Some(0)).unwrap(), "struct node *");
    assert_eq!(dwarf.type_name(&nodes, None).unwrap(), "void");
}

#[test]
fn test_reading_a_type_twice_gives_the_same_graph()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    let first = dwarf.read_type_of_die(fixture.offset("node")).unwrap();
    let second = dwarf.read_type_of_die(fixture.offset("node")).unwrap();
    assert_eq!(first, second);
    assert_eq!(first[0].die.tag, dw::DW_TAG_structure_type);
}

#[test]
fn test_array_dimensions()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    let nodes = dwarf.read_type_of_die(fixture.offset("int_array")).unwrap();
    assert_eq!(nodes[0].array_dimensions.as_slice(), &[ArrayDimension::Known(4)]);
    let nodes = dwarf.read_type_of_die(fixture.offset("flex")).unwrap();
    assert_eq!(nodes[0].array_dimensions.as_slice(), &[ArrayDimension::Flexible]);
}

#[test]
fn test_struct_layout()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    let nodes = dwarf.read_type_of_die(fixture.offset("pair")).unwrap();
    let data = dwarf.data_for_type(&nodes, 0).unwrap();
    assert_eq!(data.bytesize, 8);
    let members: Vec<_> = data
        .children
        .iter()
        .map(|child| (child.name.as_str(), child.data_member_location, child.bytesize))
        .collect();
    assert_eq!(members, vec![("a", 0, 4), ("b", 4, 1)]);
}

#[test]
fn test_bit_field_layout()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    let nodes = dwarf.read_type_of_die(fixture.offset("flags")).unwrap();
    let data = dwarf.data_for_type(&nodes, 0).unwrap();
    let bits: Vec<_> = data
        .children
        .iter()
        .map(|child| (child.bitposition, child.bitsize))
        .collect();
    assert_eq!(bits, vec![(0, 3), (3, 5)]);

    let tree = format_value(&data, &[Some(0xfd), Some(0), Some(0), Some(0)], NumericBase::Decimal);
    assert_eq!(tree.children[0].value.as_deref(), Some("5"));
    assert_eq!(tree.children[1].value.as_deref(), Some("31"));
}

#[test]
fn test_format_struct_with_missing_bytes()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    let nodes = dwarf.read_type_of_die(fixture.offset("pair")).unwrap();
    let data = dwarf.data_for_type(&nodes, 0).unwrap();
    let bytes = [Some(0xfe), Some(0xff), Some(0xff), Some(0xff), None, None, None, None];
    let tree = format_value(&data, &bytes, NumericBase::Decimal);
    assert_eq!(tree.children[0].value.as_deref(), Some("-2"));
    assert_eq!(tree.children[1].value.as_deref(), Some("??"));
}

#[test]
fn test_format_pointer_and_array()
{
    let fixture = common::fixture();
    let dwarf = DwarfData::new(fixture.sections()).unwrap();

    let nodes = dwarf.read_type_of_die(fixture.offset("node")).unwrap();
    let data = dwarf.data_for_type(&nodes, 0).unwrap();
    let bytes: Vec<_> = [7u32, 0x2000_0010]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .map(Some)
        .collect();
    let tree = format_value(&data, &bytes, NumericBase::Decimal);
    assert_eq!(tree.children[0].value.as_deref(), Some("7"));
    assert_eq!(tree.children[1].value.as_deref(), Some("0x20000010"));

    let nodes = dwarf.read_type_of_die(fixture.offset("int_array")).unwrap();
    let data = dwarf.data_for_type(&nodes, 0).unwrap();
    assert_eq!(data.bytesize, 16);
    let bytes: Vec<_> = [1u32, 2, 3, 4]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .map(Some)
        .collect();
    let tree = format_value(&data, &bytes, NumericBase::Hexadecimal);
    let elements: Vec<_> = tree
        .children
        .iter()
        .map(|element| (element.name.as_str(), element.value.as_deref()))
        .collect();
    assert_eq!(elements, vec![
        ("[0]", Some("0x1")),
        ("[1]", Some("0x2")),
        ("[2]", Some("0x3")),
        ("[3]", Some("0x4")),
    ]);
}

fn standalone_dwarf<'a>(info: &'a common::Section, abbrev: &'a common::Section) -> DwarfData<'a>
{
    DwarfData::new(DebugSections {
        debug_info: &info.bytes,
        debug_abbrev: &abbrev.bytes,
        ..DebugSections::default()
    })
    .unwrap()
}

#[test]
fn test_all_ones_unsigned_upper_bound_is_zero_length()
{
    use gimli::constants::*;

    let (info, abbrev) = common::standalone_unit(
        |abbrev| {
            common::abbreviation(abbrev, 1, DW_TAG_compile_unit, true, &[(DW_AT_name, DW_FORM_string)]);
            common::abbreviation(abbrev, 2, DW_TAG_base_type, false, &[
                (DW_AT_name, DW_FORM_string),
                (DW_AT_byte_size, DW_FORM_data1),
                (DW_AT_encoding, DW_FORM_data1),
            ]);
            common::abbreviation(abbrev, 3, DW_TAG_array_type, true, &[(DW_AT_type, DW_FORM_ref4)]);
            common::abbreviation(abbrev, 4, DW_TAG_subrange_type, false, &[(DW_AT_upper_bound, DW_FORM_data4)]);
        },
        |info| {
            info.label("int").uleb(2).cstr("int").u8(4).u8(dw::DW_ATE_signed.0);
            info.label("array").uleb(3).reference("int", 0);
            info.uleb(4).u32(0xffff_ffff);
            info.u8(0);
        },
    );
    let dwarf = standalone_dwarf(&info, &abbrev);
    let offset = info.offset_of("array");

    let nodes = dwarf.read_type_of_die(offset).unwrap();
    assert_eq!(nodes[0].array_dimensions.as_slice(), &[ArrayDimension::Known(0)]);
    assert_eq!(type_string_of(&dwarf, offset), "int [0]");
    assert_eq!(dwarf.data_for_type(&nodes, 0).unwrap().bytesize, 0);
}

#[test]
fn test_struct_containing_itself_is_marked_recursive()
{
    use gimli::constants::*;

    let (info, abbrev) = common::standalone_unit(
        |abbrev| {
            common::abbreviation(abbrev, 1, DW_TAG_compile_unit, true, &[(DW_AT_name, DW_FORM_string)]);
            common::abbreviation(abbrev, 2, DW_TAG_structure_type, true, &[
                (DW_AT_name, DW_FORM_string),
                (DW_AT_byte_size, DW_FORM_data1),
            ]);
            common::abbreviation(abbrev, 3, DW_TAG_member, false, &[
                (DW_AT_name, DW_FORM_string),
                (DW_AT_type, DW_FORM_ref4),
                (DW_AT_data_member_location, DW_FORM_data1),
            ]);
        },
        |info| {
            info.label("ring").uleb(2).cstr("ring").u8(4);
            info.uleb(3).cstr("inner").reference("ring", 0).u8(0);
            info.u8(0);
        },
    );
    let dwarf = standalone_dwarf(&info, &abbrev);
    let offset = info.offset_of("ring");

    assert!(type_string_of(&dwarf, offset).contains(RECURSION_MARKER));

    let nodes = dwarf.read_type_of_die(offset).unwrap();
    let data = dwarf.data_for_type(&nodes, 0).unwrap();
    assert!(!data.is_recursive);
    assert_eq!(data.children.len(), 1);
    let inner = &data.children[0];
    assert!(inner.is_recursive);
    assert!(inner.children.is_empty());
    assert_eq!(inner.name, "inner");
    assert!(inner.type_string.ends_with(RECURSION_MARKER));

    let bytes = [Some(1), Some(0), Some(0), Some(0)];
    let tree = format_value(&data, &bytes, NumericBase::Decimal);
    assert_eq!(tree.children[0].value.as_deref(), Some(RECURSION_MARKER));
}
