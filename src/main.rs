//! otx - annotated disassembly of PPC and i386 Mach-O executables.

use std::io::stdout;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::Receiver;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use otx::disasm::Otool;
use otx::progress::{spawn_processing, ProgressEvent};
use otx::{Arch, LineChoicePolicy, ProcOptions, ProcessError, ProcessResult, Processor};

/// Annotated disassembly for 32-bit Mach-O executables.
///
/// Each single-letter flag flips the corresponding default.
#[derive(Parser, Debug)]
#[command(name = "otx")]
#[command(author, about, long_about = None)]
struct Cli {
    /// Executable or universal binary to process
    input: PathBuf,

    /// Where to write the listing (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Architecture to process in a universal binary: ppc or i386
    #[arg(long)]
    arch: Option<Arch>,

    /// Toggle function-relative offsets (default on)
    #[arg(short = 'l')]
    local_offsets: bool,

    /// Toggle tab-separated fields (default off)
    #[arg(short = 'e')]
    entab_output: bool,

    /// Toggle data section dumps (default off)
    #[arg(short = 'd')]
    data_sections: bool,

    /// Toggle the trailing md5 line (default on)
    #[arg(short = 'c')]
    checksum: bool,

    /// Toggle receiver names in unresolved message sends (default on)
    #[arg(short = 'm')]
    verbose_msg_sends: bool,

    /// Toggle blank lines between logical blocks (default off)
    #[arg(short = 'b')]
    separate_logical_blocks: bool,

    /// Toggle C++ name demangling (default on)
    #[arg(short = 'n')]
    demangle_cpp_names: bool,

    /// Toggle Objective-C method return types (default on)
    #[arg(short = 'r')]
    return_types: bool,

    /// Toggle instance variable types (default on)
    #[arg(short = 'v')]
    variable_types: bool,

    /// Which listing supplies each code line: branch-targets, prefer-verbose or prefer-plain
    #[arg(long, default_value = "branch-targets")]
    line_choice: LineChoicePolicy,

    /// Only report obfuscated instruction sequences
    #[arg(long)]
    verify: bool,

    /// Write a copy of the input with obfuscated sequences replaced by NOPs
    #[arg(long, value_name = "PATH")]
    fix_nops: Option<PathBuf>,

    /// Print progress to stderr
    #[arg(long)]
    progress: bool,

    /// Disassembler executable
    #[arg(long, default_value = "otool")]
    otool: PathBuf,

    /// Verbosity level (0=warnings, 1=info, 2=debug, 3=trace)
    #[arg(short = 'V', action = clap::ArgAction::Count)]
    verbosity: u8,
}

impl Cli {
    fn options(&self) -> ProcOptions {
        let defaults = ProcOptions::default();
        ProcOptions {
            local_offsets: defaults.local_offsets ^ self.local_offsets,
            entab_output: defaults.entab_output ^ self.entab_output,
            data_sections: defaults.data_sections ^ self.data_sections,
            checksum: defaults.checksum ^ self.checksum,
            verbose_msg_sends: defaults.verbose_msg_sends ^ self.verbose_msg_sends,
            separate_logical_blocks: defaults.separate_logical_blocks ^ self.separate_logical_blocks,
            demangle_cpp_names: defaults.demangle_cpp_names ^ self.demangle_cpp_names,
            return_types: defaults.return_types ^ self.return_types,
            variable_types: defaults.variable_types ^ self.variable_types,
            line_choice: self.line_choice,
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -V
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if !err.is_fatal() => {
            println!("{}", err);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            if let Some(suggestion) = err.suggestion() {
                eprintln!("{}", suggestion);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> ProcessResult<()> {
    let processor = Processor::open(&cli.input, cli.arch, cli.options())?;

    if cli.verify || cli.fix_nops.is_some() {
        let nops = processor.verify_nops()?;
        for addr in &nops.addresses {
            println!("0x{:08x}", addr);
        }
        println!("{} obfuscated sequences", nops.len());
        if let Some(dest) = &cli.fix_nops {
            processor.fix_nops(&nops, dest)?;
            info!("repaired binary written to {}", dest.display());
        }
        return Ok(());
    }

    let otool = Otool::new(&cli.otool);
    let output = cli.output.clone();
    let (worker, events) = spawn_processing(move |progress| match &output {
        Some(dest) => processor.process_to_file(&otool, progress, dest),
        None => processor.process(&otool, progress, &mut stdout().lock()),
    });

    if cli.progress {
        print_progress(events);
    } else {
        drop(events);
    }
    worker
        .join()
        .unwrap_or_else(|_| Err(ProcessError::Parsing("processing thread panicked".to_string())))
}

fn print_progress(rx: Receiver<ProgressEvent>) {
    for event in rx {
        match event {
            ProgressEvent::Indeterminate => {}
            ProgressEvent::Value(percent) => eprintln!("{:5.1}%", percent),
            ProgressEvent::Description(text) => eprintln!("{}", text),
            ProgressEvent::Error { message, suggestion } => {
                eprintln!("error: {}", message);
                if let Some(suggestion) = suggestion {
                    eprintln!("{}", suggestion);
                }
            }
            ProgressEvent::Complete { success } => {
                eprintln!("{}", if success { "done" } else { "failed" })
            }
        }
    }
}
