use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use emdbg_utils::{init_logging_with_config, LogFormat, LogLevel, LoggingConfig, LoggingError, LoggingGuard};

mod commands;
mod image;

/// Inspect the DWARF debug information of embedded ARM images.
#[derive(Parser, Debug)]
#[command(name = "emdbg")]
#[command(version)]
#[command(about = "Source-level inspection of embedded ARM images and their stopped state", long_about = None)]
struct Cli
{
    /// Log level (error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    /// Log format (pretty or json); overrides EMDBG_LOG_FORMAT
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Commands,
}

/// Register and memory snapshot of a stopped target
#[derive(clap::Args, Debug)]
struct CoreArgs
{
    /// Raw dump of r0-r15, 16 little-endian words
    #[arg(long)]
    registers: PathBuf,
    /// Raw RAM dump
    #[arg(long)]
    ram: PathBuf,
    /// Address of the first byte of the RAM dump
    #[arg(long, value_parser = parse_address, default_value = "0x20000000")]
    ram_base: u32,
    /// Stop unwinding after this many frames
    #[arg(long, default_value_t = 32)]
    max_frames: usize,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// List the compilation units
    Units
    {
        /// ELF image with debug information
        elf: PathBuf,
    },
    /// Map an address to file and line
    Line
    {
        elf: PathBuf,
        /// Code address (hex format: 0x1000 or decimal)
        #[arg(value_parser = parse_address)]
        address: u32,
    },
    /// Breakpoint addresses for a source line
    Breakpoints
    {
        elf: PathBuf,
        /// Source file name or path suffix
        file: String,
        line: u32,
    },
    /// Show the scopes and variables visible at an address
    Context
    {
        elf: PathBuf,
        #[arg(value_parser = parse_address)]
        address: u32,
    },
    /// Print a type and its data layout
    Type
    {
        elf: PathBuf,
        /// Offset of the type DIE in .debug_info
        #[arg(value_parser = parse_address)]
        die_offset: u32,
    },
    /// Show the compiled unwind program for an address
    UnwindCode
    {
        elf: PathBuf,
        #[arg(value_parser = parse_address)]
        address: u32,
    },
    /// Unwind the stack of a captured target
    Backtrace
    {
        elf: PathBuf,
        #[command(flatten)]
        core: CoreArgs,
    },
    /// Print the local variables of one frame
    Locals
    {
        elf: PathBuf,
        #[command(flatten)]
        core: CoreArgs,
        /// Frame number, 0 being the innermost
        #[arg(long, default_value_t = 0)]
        frame: usize,
        /// Print integers in hexadecimal
        #[arg(long, default_value_t = false)]
        hex: bool,
    },
    /// Report location expression opcodes the evaluator cannot run
    Coverage
    {
        elf: PathBuf,
    },
}

/// Parse `0x`-prefixed hexadecimal or decimal addresses
fn parse_address(text: &str) -> Result<u32, String>
{
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|error| format!("invalid address {text:?}: {error}"))
}

/// Environment settings, overridden by the command line
fn start_logging(cli: &Cli) -> Result<LoggingGuard, LoggingError>
{
    let mut config = LoggingConfig::from_env()?;
    config.level = cli.log_level;
    if let Some(format) = cli.log_format {
        config.format = format;
    }
    init_logging_with_config(&config)
}

fn main()
{
    let cli = Cli::parse();

    let _guard = match start_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> commands::CommandResult
{
    match cli.command {
        Commands::Units { elf } => commands::units(&elf),
        Commands::Line { elf, address } => commands::line(&elf, address),
        Commands::Breakpoints { elf, file, line } => commands::breakpoints(&elf, &file, line),
        Commands::Context { elf, address } => commands::context(&elf, address),
        Commands::Type { elf, die_offset } => commands::type_info(&elf, die_offset),
        Commands::UnwindCode { elf, address } => commands::unwind_code(&elf, address),
        Commands::Backtrace { elf, core } => commands::backtrace(&elf, &core.into()),
        Commands::Locals {
            elf,
            core,
            frame,
            hex,
        } => commands::locals(&elf, &core.into(), frame, hex),
        Commands::Coverage { elf } => commands::coverage(&elf),
    }
}

impl From<CoreArgs> for commands::CoreSnapshot
{
    fn from(args: CoreArgs) -> Self
    {
        Self {
            registers: args.registers,
            ram: args.ram,
            ram_base: args.ram_base,
            max_frames: args.max_frames,
        }
    }
}
