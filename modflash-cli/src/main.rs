//! modflash - flash firmware and root certificates onto NINA, WINC1500 and SARA modules.
//!
//! Failures exit with code 1, usage errors (bad arguments, ambiguous port,
//! missing programmer) with code 2 and a Ctrl-C with code 130.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::{debug, warn};
use modflash::{CancelToken, CertificateLayout, Module};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, select_serial_port};

/// Whether stderr is attached to a terminal.
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(false);

/// Progress bars and emoji only make sense on a terminal.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed)
}

/// Errors that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Wrong or missing input; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// Flash firmware and root certificates onto NINA, WINC1500 and SARA modules.
#[derive(Parser)]
#[command(name = "modflash")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Serial port (e.g., /dev/ttyACM0 or COM3).
    #[arg(short, long, global = true, env = "MODFLASH_PORT")]
    pub port: Option<String>,

    /// Verbose output (-v debug, -vv trace with timestamps).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (errors and results only).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Never prompt; fail when a choice is ambiguous.
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Path to a config file (replaces modflash.toml lookup).
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that talks to a board.
#[derive(Args, Debug, Clone)]
pub(crate) struct UploadArgs {
    /// Target module (NINA, WINC1500, SARA).
    #[arg(short, long, env = "MODFLASH_MODULE", value_parser = parse_module)]
    pub module: Module,

    /// Loader image flashed onto the board's MCU before talking to the module.
    #[arg(short, long, value_name = "FILE")]
    pub loader: Option<PathBuf>,

    /// Programmer command template used to flash the loader.
    #[arg(long, env = "MODFLASH_PROGRAMMER", value_name = "TEMPLATE")]
    pub programmer: Option<String>,

    /// Retries after a failed attempt (default: 9).
    #[arg(long, env = "MODFLASH_RETRIES")]
    pub retries: Option<u32>,

    /// Reset the board into its bootloader with a 1200bps touch first.
    #[arg(long)]
    pub touch: bool,

    /// Output the result as JSON to stdout.
    #[arg(long)]
    pub json: bool,
}

/// Where certificates come from.
#[derive(Args, Debug, Clone)]
pub(crate) struct CertSourceArgs {
    /// Certificate file (.pem or .cer), repeatable.
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// TLS server whose root certificate is captured (host[:port]), repeatable.
    #[arg(short = 'u', long = "url", value_name = "HOST[:PORT]")]
    pub urls: Vec<String>,

    /// Region layout (records, header-records, pem); defaults to the module's.
    #[arg(long, value_parser = parse_layout)]
    pub layout: Option<CertificateLayout>,

    /// TLS connect timeout in seconds.
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Flash a firmware image onto the module.
    Flash {
        #[command(flatten)]
        upload: UploadArgs,

        /// Firmware image.
        #[arg(short = 'i', long, value_name = "FILE")]
        firmware: PathBuf,

        /// Ask the module for its firmware version afterwards.
        #[arg(long)]
        read_version: bool,
    },

    /// Flash a root certificate bundle onto the module.
    Certificates {
        #[command(flatten)]
        upload: UploadArgs,

        #[command(flatten)]
        sources: CertSourceArgs,
    },

    /// Encode a certificate region to a file without a board.
    EncodeCertificates {
        /// Target module (NINA, WINC1500).
        #[arg(short, long, env = "MODFLASH_MODULE", value_parser = parse_module)]
        module: Module,

        #[command(flatten)]
        sources: CertSourceArgs,

        /// Output file.
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Print the firmware version installed on the module.
    GetVersion {
        #[command(flatten)]
        upload: UploadArgs,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if not given).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

fn parse_module(s: &str) -> Result<Module, String> {
    Module::from_name(s).map_err(|e| e.to_string())
}

fn parse_layout(s: &str) -> Result<CertificateLayout, String> {
    s.parse().map_err(|e: modflash::Error| e.to_string())
}

/// Resolve the serial port from flags, config, or the attached ports.
pub(crate) fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    select_serial_port(&options, config)
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<modflash::Error>() {
        Some(modflash::Error::UnknownModule(_) | modflash::Error::Config(_)) => 2,
        Some(modflash::Error::Cancelled) => 130,
        _ => 1,
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli, cancel: &CancelToken) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            upload,
            firmware,
            read_version,
        } => commands::flash::cmd_flash(cli, &config, upload, firmware, *read_version, cancel),
        Commands::Certificates { upload, sources } => {
            commands::certificates::cmd_certificates(cli, &config, upload, sources, cancel)
        },
        Commands::EncodeCertificates {
            module,
            sources,
            output,
        } => commands::certificates::cmd_encode_certificates(cli, *module, sources, output),
        Commands::GetVersion { upload } => {
            commands::flash::cmd_get_version(cli, &config, upload, cancel)
        },
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "modflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!("Could not install Ctrl-C handler: {e}");
    }

    if let Err(err) = run(&cli, &cancel) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}
