use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt};

use abcvm::abc::{self, AbcFile};
use abcvm::config::{JitMode, RuntimeConfig};
use abcvm::vm::{NullHost, VmError, VmHandle};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Parser)]
#[command(name = "abcvm")]
#[command(about = "Run and inspect ABC bytecode files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scripts of an ABC file
    Run {
        file: PathBuf,
        /// Code generation mode (overrides the config file)
        #[arg(long, value_enum)]
        jit: Option<JitModeArg>,
        /// Log every compiled method
        #[arg(long)]
        trace_jit: bool,
        /// Runtime configuration (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print the parsed contents of an ABC file
    Dump {
        file: PathBuf,
        /// Print JSON instead of a listing
        #[arg(long)]
        json: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,abcvm=info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load(path: &Path) -> Result<AbcFile, VmError> {
    let data = fs::read(path).map_err(|source| VmError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(abc::parse(&data)?)
}

fn run(file: &Path, jit: Option<JitModeArg>, trace_jit: bool, config: Option<&Path>) -> Result<(), VmError> {
    let mut config = match config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(jit) = jit {
        config.jit_mode = jit.into();
    }
    config.trace_jit |= trace_jit;

    let abc = load(file)?;
    let handle = VmHandle::spawn(abc, config, Box::new(io::stdout()), Box::new(NullHost))?;
    // The sync is answered once the entry script has finished.
    handle.sync()?;
    handle.shutdown()
}

fn dump(file: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let abc = load(file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&abc)?);
    } else {
        print!("{}", abc::dump::dump(&abc));
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Commands::Run {
            file,
            jit,
            trace_jit,
            config,
        } => run(&file, jit, trace_jit, config.as_deref()).map_err(Into::into),
        Commands::Dump { file, json } => dump(&file, json),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
