//! Subcommand implementations.
//!
//! Every command loads the image, indexes its debug information and prints
//! to stdout. Logging goes to stderr.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use emdbg_core::dwarf::expression::{opcode_name, CompileMode, ExpressionCompiler};
use emdbg_core::dwarf::render::DataNode;
use emdbg_core::dwarf::SourceCoordinates;
use emdbg_core::registers::{RegisterFrame, PC, REGISTER_COUNT};
use emdbg_core::unwind::{self, FrameStatus};
use emdbg_core::value::{format_value, NumericBase};
use emdbg_core::{CorefileTarget, DwarfData, DwarfEvaluator, DwarfExpressionValue, RegisterCache};
use gimli::constants as dw;
use tracing::{debug, info, warn};

use crate::image::ElfImage;

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Files describing a stopped target
#[derive(Debug, Clone)]
pub struct CoreSnapshot
{
    pub registers: PathBuf,
    pub ram: PathBuf,
    pub ram_base: u32,
    pub max_frames: usize,
}

impl CoreSnapshot
{
    /// Build a target serving the RAM dump and the image's program sections
    fn target(&self, image: &ElfImage) -> Result<CorefileTarget, Box<dyn std::error::Error>>
    {
        let registers = read_register_dump(&self.registers)?;
        let ram = fs::read(&self.ram).map_err(|e| format!("failed to read {}: {e}", self.ram.display()))?;
        info!(
            ram_base = format_args!("0x{:08x}", self.ram_base),
            ram_size = ram.len(),
            "Loaded core snapshot"
        );

        let mut target = CorefileTarget::new(registers).with_ram(self.ram_base, ram);
        for segment in image.rom_segments() {
            target = target.with_flash(segment.address, segment.data.clone());
        }
        Ok(target)
    }
}

/// r0-r15 from a dump of 16 little-endian words
fn read_register_dump(path: &Path) -> Result<RegisterFrame, Box<dyn std::error::Error>>
{
    let bytes = fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    if bytes.len() < REGISTER_COUNT * 4 {
        return Err(format!(
            "register dump {} holds {} bytes, expected {}",
            path.display(),
            bytes.len(),
            REGISTER_COUNT * 4
        )
        .into());
    }
    let mut registers = [0; REGISTER_COUNT];
    for (slot, word) in registers.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    }
    Ok(registers)
}

fn load(elf: &Path) -> Result<ElfImage, Box<dyn std::error::Error>>
{
    let image = ElfImage::load(elf)?;
    info!(path = %image.path().display(), "Loaded image");
    Ok(image)
}

fn coordinates(coordinates: Option<&SourceCoordinates>) -> String
{
    match coordinates {
        Some(at) if at.column > 0 => format!("{}:{}:{}", at.file, at.line, at.column),
        Some(at) => format!("{}:{}", at.file, at.line),
        None => "??".to_string(),
    }
}

fn location(value: &DwarfExpressionValue) -> String
{
    match value {
        DwarfExpressionValue::Invalid => "<optimized out>".to_string(),
        DwarfExpressionValue::Constant(_) => "<constant>".to_string(),
        DwarfExpressionValue::MemoryAddress(address) => format!("@0x{address:08x}"),
        DwarfExpressionValue::RegisterNumber(register) => format!("r{register}"),
        DwarfExpressionValue::Composite(pieces) => {
            let parts: Vec<String> = pieces
                .iter()
                .map(|piece| format!("{}[{}]", location(&piece.value), piece.byte_size))
                .collect();
            parts.join(" ")
        }
    }
}

pub fn units(elf: &Path) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    for unit in dwarf.units() {
        let kind = if unit.is_type_unit() { "type unit" } else { "unit" };
        println!(
            "0x{:08x} {kind} v{} {}",
            unit.cu_header_offset(),
            unit.header.version,
            unit.name.as_deref().unwrap_or("<unnamed>")
        );
        for range in &unit.ranges.ranges {
            println!("    [0x{:08x}, 0x{:08x})", range.start, range.end);
        }
        if let Some(producer) = &unit.producer {
            println!("    producer: {producer}");
        }
    }
    Ok(())
}

pub fn line(elf: &Path, address: u32) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    let at = dwarf.source_code_coordinates_for_address(address)?;
    let context = dwarf.execution_context_for_address(address)?;
    let function = match emdbg_core::dwarf::context::top_level_subprogram_of_context(&context) {
        Some(subprogram) => dwarf.name_of_die(subprogram.offset)?,
        None => None,
    };
    let exact = at
        .as_ref()
        .is_some_and(|at| at.is_address_on_exact_line_number_boundary);
    println!(
        "0x{address:08x} {} in {}{}",
        coordinates(at.as_ref()),
        function.as_deref().unwrap_or("??"),
        if exact { "" } else { " (mid-line)" }
    );
    Ok(())
}

pub fn breakpoints(elf: &Path, file: &str, line: u32) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    let addresses = dwarf.addresses_for_source_line(file, line)?;
    if addresses.is_empty() {
        println!("No code for {file}:{line}");
    }
    for address in addresses {
        println!("0x{address:08x}");
    }
    Ok(())
}

pub fn context(elf: &Path, address: u32) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    let context = dwarf.execution_context_for_address(address)?;
    if context.is_empty() {
        println!("No debug information for 0x{address:08x}");
        return Ok(());
    }

    for (depth, scope) in context.iter().enumerate() {
        let name = dwarf.name_of_die(scope.offset)?;
        println!(
            "{:indent$}<0x{:08x}> {} {}",
            "",
            scope.offset,
            scope.tag,
            name.as_deref().unwrap_or(""),
            indent = depth * 2
        );
    }

    println!("Variables:");
    for object in dwarf.local_data_objects_for_context(&context)? {
        let type_string = match object.type_offset {
            Some(offset) => {
                let nodes = dwarf.read_type_of_die(offset)?;
                dwarf.type_name(&nodes, Some(0))?
            }
            None => dwarf.type_name(&[], None)?,
        };
        let code = match dwarf.location_code_for_data_object(&object, address) {
            Ok(Some(program)) => program.to_string(),
            Ok(None) => "<optimized out>".to_string(),
            Err(error) => format!("<{error}>"),
        };
        println!(
            "  {type_string} {}: {code}",
            object.name.as_deref().unwrap_or("<anonymous>")
        );
    }
    Ok(())
}

fn print_layout(node: &DataNode, depth: usize)
{
    let bits = if node.bitsize > 0 {
        format!(" bits {}+{}", node.bitposition, node.bitsize)
    } else {
        String::new()
    };
    println!(
        "{:indent$}{} {}: offset {} size {}{bits}",
        "",
        node.type_string,
        if node.name.is_empty() { "<anonymous>" } else { node.name.as_str() },
        node.data_member_location,
        node.bytesize,
        indent = depth * 2
    );
    for child in &node.children {
        print_layout(child, depth + 1);
    }
}

pub fn type_info(elf: &Path, die_offset: u32) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    let nodes = dwarf.read_type_of_die(die_offset)?;
    debug!(nodes = nodes.len(), "Read type graph");
    println!("{}", dwarf.type_string(&nodes, 0)?);
    print_layout(&dwarf.data_for_type(&nodes, 0)?, 0);
    Ok(())
}

pub fn unwind_code(elf: &Path, address: u32) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    match dwarf.unwinder().unwind_code_for_address(address)? {
        Some((program, initial_location)) => {
            println!("FDE at 0x{initial_location:08x}");
            println!("{program}");
        }
        None => println!("No call frame information for 0x{address:08x}"),
    }
    Ok(())
}

pub fn backtrace(elf: &Path, core: &CoreSnapshot) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    let mut target = core.target(&image)?;
    let mut cache = RegisterCache::new();

    for frame in unwind::backtrace(&dwarf, &mut target, &mut cache, core.max_frames)? {
        for inlined in &frame.inlined {
            println!("    [inlined] {inlined}");
        }
        let status = match frame.status {
            FrameStatus::Current | FrameStatus::Complete => "",
            FrameStatus::Exception => " <exception frame>",
        };
        println!(
            "#{:<2} 0x{:08x} sp=0x{:08x} in {} at {}{status}",
            frame.index,
            frame.pc,
            frame.sp,
            frame.function.as_deref().unwrap_or("??"),
            coordinates(frame.coordinates.as_ref())
        );
    }
    Ok(())
}

pub fn locals(elf: &Path, core: &CoreSnapshot, frame: usize, hex: bool) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    let mut target = core.target(&image)?;
    let mut cache = RegisterCache::new();
    let frames = unwind::backtrace(&dwarf, &mut target, &mut cache, core.max_frames)?;
    if frame >= frames.len() {
        return Err(format!("frame {frame} out of range, the stack has {} frames", frames.len()).into());
    }

    let pc = cache.frame(frame)?[PC as usize];
    let lookup = if frame == 0 { pc } else { pc.wrapping_sub(1) };
    let context = dwarf.execution_context_for_address(lookup)?;
    let objects = dwarf.local_data_objects_for_context(&context)?;
    let base = if hex { NumericBase::Hexadecimal } else { NumericBase::Decimal };

    let mut evaluator = DwarfEvaluator::new(&dwarf, &mut target, &mut cache);
    for object in &objects {
        let name = object.name.clone().unwrap_or_default();
        let Some(type_offset) = object.type_offset else {
            println!("void {name}");
            continue;
        };
        let nodes = dwarf.read_type_of_die(type_offset)?;
        let mut node = dwarf.data_for_type(&nodes, 0)?;
        node.name = name;
        let (value, bytes) = evaluator.evaluate_data_object(frame, object, node.bytesize as usize)?;
        print!("{} {}", node.type_string, format_value(&node, &bytes, base));
        println!("    ({})", location(&value));
    }
    Ok(())
}

/// Unsupported opcodes over every location expression in the image
#[derive(Debug, Default, PartialEq, Eq)]
struct Coverage
{
    expressions: usize,
    failed: usize,
    unsupported: BTreeMap<u8, usize>,
}

fn collect_coverage(dwarf: &DwarfData<'_>) -> Result<Coverage, Box<dyn std::error::Error>>
{
    let mut coverage = Coverage::default();
    let mut compiler = ExpressionCompiler::new(dwarf, CompileMode::Diagnostic);
    for fingerprint in dwarf.fingerprints().iter().filter(|fingerprint| !fingerprint.is_null()) {
        for attribute in dwarf.attributes_of_die(fingerprint.offset)? {
            if !matches!(
                attribute.name,
                dw::DW_AT_location | dw::DW_AT_frame_base | dw::DW_AT_call_value | dw::DW_AT_GNU_call_site_value
            ) {
                continue;
            }
            let unit = dwarf.unit_for_die_offset(fingerprint.offset)?;
            for entry in dwarf.location_list(&attribute.value, unit)? {
                coverage.expressions += 1;
                if let Err(error) = compiler.compile(entry.expression, unit.cu_header_offset()) {
                    warn!(die = format_args!("0x{:08x}", fingerprint.offset), %error, "Cannot compile expression");
                    coverage.failed += 1;
                }
            }
        }
    }
    coverage.unsupported = compiler.unsupported_opcodes().clone();
    Ok(coverage)
}

pub fn coverage(elf: &Path) -> CommandResult
{
    let image = load(elf)?;
    let dwarf = DwarfData::new(image.debug_sections())?;
    let coverage = collect_coverage(&dwarf)?;
    println!(
        "{} location expressions, {} failed to decode",
        coverage.expressions, coverage.failed
    );
    if coverage.unsupported.is_empty() {
        println!("All opcodes supported");
    }
    for (opcode, count) in &coverage.unsupported {
        println!("{count:>6} {} (0x{opcode:02x})", opcode_name(*opcode));
    }
    Ok(())
}
