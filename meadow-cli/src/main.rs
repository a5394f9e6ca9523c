//! meadow CLI - Command-line tool for talking to Meadow devices.
//!
//! ## Features
//!
//! - List serial ports and DFU bootloader devices
//! - Query device information and file listings
//! - Upload files with progress and CRC verification
//! - Control tracing and the managed runtime
//! - Stream unsolicited device output

use {
    anyhow::{Context, Result, anyhow},
    clap::{Parser, Subcommand},
    console::style,
    env_logger::Env,
    log::{debug, warn},
    std::{env, path::PathBuf},
    tokio_util::sync::CancellationToken,
};

mod commands;
mod config;

use {
    commands::{Ctx, device::RuntimeAction, device::Toggle},
    config::Config,
};

/// Exit code reported when Ctrl-C interrupts an operation.
const EXIT_CANCELLED: i32 = 130;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// meadow - talk to Meadow boards over USB serial and DFU.
///
/// Environment variables:
///   MEADOW_PORT   - Default serial port
///   MEADOW_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "meadow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "MEADOW_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "MEADOW_BAUD")]
    baud: Option<u32>,

    /// Reply timeout for device commands, in milliseconds.
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Ask each port for device info to confirm a Meadow answers.
        #[arg(long)]
        probe: bool,
    },

    /// List USB devices in DFU bootloader mode.
    DfuList {
        /// Output device list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show device information.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List files on the device flash.
    Files {
        /// Include size and CRC32 of each file.
        #[arg(long)]
        crc: bool,

        /// Output the listing as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Upload a file to the device.
    Upload {
        /// Local file to send.
        file: PathBuf,

        /// Name on the device (defaults to the local file name).
        #[arg(long)]
        dest: Option<String>,

        /// Write to ESP32 coprocessor flash at this hex address instead.
        #[arg(long, value_name = "ADDR", value_parser = parse_hex_u32)]
        esp: Option<u32>,
    },

    /// Delete a file from the device flash.
    Delete {
        /// File name on the device.
        name: String,
    },

    /// Set the firmware trace level.
    Trace {
        /// Trace level (0 disables tracing).
        level: u32,
    },

    /// Turn trace forwarding to the host on or off.
    TraceHost {
        /// New state.
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Enable, disable or query the managed runtime.
    Runtime {
        /// Action to perform.
        #[arg(value_enum)]
        action: RuntimeAction,
    },

    /// Restart the device.
    Restart,

    /// Reboot the device into its DFU bootloader.
    EnterDfu,

    /// Print device output until Ctrl-C.
    Listen,
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn init_logging(verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(verbose >= 2)
        .format_timestamp(if verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    debug!(
        "meadow v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || trigger.cancel()) {
        warn!("Could not install Ctrl-C handler: {e}");
    }

    let ctx = Ctx {
        port: cli.port.clone(),
        baud: cli.baud,
        timeout: cli
            .timeout_ms
            .map(std::time::Duration::from_millis),
        quiet: cli.quiet,
        config,
        cancel: cancel.clone(),
    };

    // Commands that watch the token themselves finish first on Ctrl-C.
    let result = tokio::select! {
        biased;
        result = run(&cli.command, &ctx) => result,
        () = cancel.cancelled() => Err(anyhow!("Interrupted")),
    };
    if result.is_err() && cancel.is_cancelled() {
        eprintln!("{} Cancelled", style("✗").red());
        std::process::exit(EXIT_CANCELLED);
    }
    result
}

async fn run(command: &Commands, ctx: &Ctx) -> Result<()> {
    use commands::{device, listen, ports, upload};

    match command {
        Commands::ListPorts { json, probe } => ports::cmd_list_ports(ctx, *json, *probe).await,
        Commands::DfuList { json } => ports::cmd_dfu_list(*json),
        Commands::Info { json } => device::cmd_info(ctx, *json).await,
        Commands::Files { crc, json } => device::cmd_files(ctx, *crc, *json).await,
        Commands::Upload { file, dest, esp } => {
            upload::cmd_upload(ctx, file, dest.as_deref(), *esp)
                .await
                .with_context(|| format!("Upload of {} failed", file.display()))
        },
        Commands::Delete { name } => device::cmd_delete(ctx, name).await,
        Commands::Trace { level } => device::cmd_trace(ctx, *level).await,
        Commands::TraceHost { state } => device::cmd_trace_host(ctx, *state).await,
        Commands::Runtime { action } => device::cmd_runtime(ctx, *action).await,
        Commands::Restart => device::cmd_restart(ctx).await,
        Commands::EnterDfu => device::cmd_enter_dfu(ctx).await,
        Commands::Listen => listen::cmd_listen(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x10000"), Ok(0x10000));
        assert_eq!(parse_hex_u32("0X00_01_00_00"), Ok(0x10000));
        assert_eq!(parse_hex_u32("ff"), Ok(0xFF));
        assert!(parse_hex_u32("0xzz").is_err());
    }

    #[test]
    fn test_parse_upload_with_esp_address() {
        let cli = Cli::try_parse_from(["meadow", "upload", "fw.bin", "--esp", "0x10000"]).unwrap();
        match cli.command {
            Commands::Upload { file, dest, esp } => {
                assert_eq!(file, PathBuf::from("fw.bin"));
                assert!(dest.is_none());
                assert_eq!(esp, Some(0x10000));
            },
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "meadow",
            "info",
            "--port",
            "/dev/ttyACM0",
            "--timeout-ms",
            "250",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.timeout_ms, Some(250));
        assert_eq!(cli.verbose, 2);
    }
}
