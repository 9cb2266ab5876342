use clap::{Parser, Subcommand};
use cpsjit::asm::{AbstractionPreference, Assembly, Disassembler};
use cpsjit::{CompileError, Compiler, CompilerConfig, Program, TargetMethod};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status for compiler bugs and exhausted resources.
const EXIT_FATAL: u8 = 70;
/// Exit status for malformed input.
const EXIT_INPUT: u8 = 1;

#[derive(Parser)]
#[command(name = "cpsjit")]
#[command(about = "Compile stack bytecode to AArch64 code bundles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log everything the compiler does
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a JSON program and install it in a fresh code cache
    Compile {
        /// JSON list of bytecode methods
        program: PathBuf,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the disassembly of every method
        #[arg(long)]
        disasm: bool,

        /// Print the reference maps of every stop
        #[arg(long)]
        ref_maps: bool,

        /// Defer call linking until every method is installed
        #[arg(long)]
        boot_image: bool,

        /// Do not inline callees
        #[arg(long)]
        no_inline: bool,

        /// Print a JSON summary instead of text
        #[arg(long)]
        json: bool,
    },
    /// Disassemble raw AArch64 code
    Disasm {
        /// File holding the code
        file: PathBuf,

        /// The file holds hex text rather than raw bytes
        #[arg(long)]
        hex: bool,

        /// Report raw instruction forms only, no aliases
        #[arg(long)]
        raw: bool,

        /// Fail on words no template accepts instead of printing them as bytes
        #[arg(long)]
        no_inline_bytes: bool,

        /// Address of the first byte
        #[arg(long, value_parser = parse_address, default_value = "0")]
        start: u64,
    },
    /// Print the default configuration as TOML
    Config,
}

#[derive(Serialize)]
struct MethodSummary {
    method: String,
    region: usize,
    start: u64,
    code_start: u64,
    code_size: usize,
    frame_size: u32,
    scalar_literal_bytes: usize,
    reference_literals: usize,
    direct_calls: usize,
    indirect_calls: usize,
    safepoints: usize,
    catch_ranges: usize,
}

impl MethodSummary {
    fn of(method: &TargetMethod) -> Self {
        Self {
            method: method.key().to_string(),
            region: method.region(),
            start: method.start(),
            code_start: method.code_start(),
            code_size: method.code().len(),
            frame_size: method.frame_size(),
            scalar_literal_bytes: method.scalar_literals().len(),
            reference_literals: method.reference_literals().len(),
            direct_calls: method.direct_calls(),
            indirect_calls: method.indirect_calls(),
            safepoints: method.safepoints(),
            catch_ranges: method.catch_table().range_positions.len(),
        }
    }
}

fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address {text:?}: {e}"))
}

fn parse_hex(text: &str) -> Result<Vec<u8>, CompileError> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(CompileError::Input("odd number of hex digits".into()));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|_| CompileError::Input(format!("invalid hex byte {byte:?}")))
        })
        .collect()
}

fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("cpsjit=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn read(path: &Path) -> Result<Vec<u8>, CompileError> {
    std::fs::read(path).map_err(|source| CompileError::Io { path: path.display().to_string(), source })
}

#[allow(clippy::too_many_arguments)]
fn compile(
    program: &Path,
    config: Option<&Path>,
    disasm: bool,
    ref_maps: bool,
    boot_image: bool,
    no_inline: bool,
    json: bool,
) -> Result<(), CompileError> {
    let mut config = match config {
        Some(path) => CompilerConfig::load(path)?,
        None => CompilerConfig::default(),
    };
    config.compiler.building_boot_image |= boot_image;
    if no_inline {
        config.compiler.inline = false;
    }
    let compiler = Compiler::new(config)?;

    let text = read(program)?;
    let text = String::from_utf8(text).map_err(|e| CompileError::Input(e.to_string()))?;
    let program = Program::from_json(&text)?;
    let methods = compiler.compile_all(&program)?;

    if json {
        let summaries: Vec<MethodSummary> = methods.iter().map(|m| MethodSummary::of(m)).collect();
        let out = serde_json::to_string_pretty(&summaries).map_err(|e| CompileError::Input(e.to_string()))?;
        println!("{out}");
        return Ok(());
    }

    let register_names: Vec<String> = compiler
        .target()
        .registers
        .allocatable
        .iter()
        .map(|r| format!("x{}", r.code()))
        .collect();
    let register_names: Vec<&str> = register_names.iter().map(String::as_str).collect();
    for method in &methods {
        println!(
            "{}: region {} at {:#x}, {} code bytes, frame {}",
            method.key(),
            method.region(),
            method.code_start(),
            method.code().len(),
            method.frame_size()
        );
        if disasm {
            print!("{}", compiler.disassemble(method)?);
        }
        if ref_maps {
            print!("{}", method.reference_map_dump(&register_names));
        }
    }
    println!(
        "{} methods, {} bytes in {} regions",
        methods.len(),
        compiler.code_manager().total_size(),
        compiler.code_manager().regions().len()
    );
    Ok(())
}

fn disasm(file: &Path, hex: bool, raw: bool, no_inline_bytes: bool, start: u64) -> Result<(), CompileError> {
    let bytes = read(file)?;
    let code = if hex {
        let text = String::from_utf8(bytes).map_err(|e| CompileError::Input(e.to_string()))?;
        parse_hex(&text)?
    } else {
        bytes
    };
    let preference = if raw { AbstractionPreference::Raw } else { AbstractionPreference::Synthetic };
    let text = Disassembler::new(Assembly::aarch64(), start)
        .with_preference(preference)
        .inline_invalid_as_bytes(!no_inline_bytes)
        .render(&code)?;
    print!("{text}");
    Ok(())
}

fn run(cli: Cli) -> Result<(), CompileError> {
    match cli.command {
        Commands::Compile { program, config, disasm, ref_maps, boot_image, no_inline, json } => {
            compile(&program, config.as_deref(), disasm, ref_maps, boot_image, no_inline, json)
        }
        Commands::Disasm { file, hex, raw, no_inline_bytes, start } => disasm(&file, hex, raw, no_inline_bytes, start),
        Commands::Config => {
            print!("{}", CompilerConfig::default().to_toml()?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.trace);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(if e.is_fatal() { EXIT_FATAL } else { EXIT_INPUT })
        }
    }
}
