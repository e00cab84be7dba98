//! replflash CLI - Command-line tool for MicroPython boards.
//!
//! ## Features
//!
//! - Run a local script on the board and stream its output
//! - Upload and download files through the raw REPL, with read-back verification
//! - Interactive friendly-REPL session
//! - Soft reset and interrupt
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use log::debug;
use replflash::{Board, BoardKind, ConnectError, ConnectOptions, ExecError, TransferError};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;

use commands::files::{cmd_get, cmd_put};
use commands::repl::cmd_repl;
use commands::reset::{cmd_reset, cmd_stop};
use commands::run::cmd_run;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed since the last [`clear_interrupted_flag`].
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Errors that carry their own exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation: missing port, unknown board, unreadable input.
    #[error("{0}")]
    Usage(String),
    /// The user pressed Ctrl-C.
    #[error("{0}")]
    Cancelled(String),
}

/// replflash - Run code on and move files to MicroPython boards.
///
/// Environment variables:
///   REPLFLASH_PORT   - Default serial port
///   REPLFLASH_BOARD  - Default board (esp8266, esp32, microbit)
#[derive(Parser)]
#[command(name = "replflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port the board is attached to.
    #[arg(short, long, global = true, env = "REPLFLASH_PORT")]
    port: Option<String>,

    /// Board family (esp8266, esp32, microbit).
    #[arg(short, long, global = true, env = "REPLFLASH_BOARD")]
    board: Option<String>,

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
    /// Run a local Python file on the board and print its output.
    Run {
        /// Script to execute.
        file: PathBuf,

        /// Give up after this many milliseconds.
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Upload a file to the board.
    Put {
        /// Local file.
        local: PathBuf,

        /// Name on the board (defaults to the local file name).
        remote: Option<String>,

        /// Skip reading the file back after upload.
        #[arg(long)]
        skip_verify: bool,
    },

    /// Download a file from the board.
    Get {
        /// Name on the board.
        remote: String,

        /// Local destination (stdout if omitted).
        local: Option<PathBuf>,
    },

    /// Open an interactive REPL session (Ctrl-] to quit).
    Repl {
        /// Save the final screen to a file on exit.
        #[arg(long, value_name = "PATH")]
        log: Option<PathBuf>,
    },

    /// Soft-reset the board and show its boot output.
    Reset {
        /// How long to collect boot output, in milliseconds.
        #[arg(long, value_name = "MS", default_value = "1000")]
        capture_ms: u64,
    },

    /// Interrupt the running program.
    Stop,
}

fn main() {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
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

    debug!(
        "replflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    replflash::set_interrupt_checker(was_interrupted);

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Run { file, timeout_ms } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .or_else(|| config.exec_timeout());
            cmd_run(cli, &config, file, timeout)
        },
        Commands::Put {
            local,
            remote,
            skip_verify,
        } => cmd_put(
            cli,
            &config,
            local,
            remote.as_deref(),
            *skip_verify || config.transfer.skip_verify,
        ),
        Commands::Get { remote, local } => cmd_get(cli, &config, remote, local.as_deref()),
        Commands::Repl { log } => cmd_repl(cli, &config, log.as_deref()),
        Commands::Reset { capture_ms } => {
            cmd_reset(cli, &config, Duration::from_millis(*capture_ms))
        },
        Commands::Stop => cmd_stop(cli, &config),
    }
}

/// Map an error to the process exit code.
///
/// 1 generic failure, 2 usage, 4 device unavailable, 130 cancelled.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    if err
        .downcast_ref::<ConnectError>()
        .is_some()
    {
        return 4;
    }
    let cancelled = matches!(err.downcast_ref::<ExecError>(), Some(ExecError::Cancelled))
        || matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::Cancelled)
        );
    if cancelled || was_interrupted() {
        return 130;
    }
    1
}

/// Serial port from the command line, environment or config.
pub(crate) fn resolve_port(cli: &Cli, config: &Config) -> Result<String> {
    cli.port
        .clone()
        .or_else(|| {
            config
                .connection
                .serial
                .clone()
        })
        .ok_or_else(|| {
            CliError::Usage(
                "No serial port given (use --port, REPLFLASH_PORT or [connection] serial)"
                    .to_string(),
            )
            .into()
        })
}

/// Board family from the command line, environment or config (esp8266 if unset).
pub(crate) fn resolve_board(cli: &Cli, config: &Config) -> Result<BoardKind> {
    let Some(name) = cli
        .board
        .as_deref()
        .or(config
            .connection
            .board
            .as_deref())
    else {
        return Ok(BoardKind::default());
    };
    name.parse::<BoardKind>()
        .map_err(|e| CliError::Usage(e.to_string()).into())
}

/// Open the board selected by `cli` and `config`.
pub(crate) fn open_board(cli: &Cli, config: &Config) -> Result<Board> {
    let kind = resolve_board(cli, config)?;
    let port = resolve_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Connecting to {} on {}",
            style("🔌").cyan(),
            style(kind).yellow(),
            style(&port).green()
        );
    }

    let mut board = Board::open(&ConnectOptions::new(&port), kind)?
        .with_transfer_config(config.transfer_config());
    if let Some(timeout) = config.exec_timeout() {
        board = board.with_exec_timeout(timeout);
    }
    board.on_health(move |healthy| {
        if !healthy {
            eprintln!("\r\n{} Board on {port} went away", style("⚠").yellow());
        }
    });
    Ok(board)
}

/// Read a local file, reporting a missing file as a usage error.
pub(crate) fn read_local(path: &std::path::Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(CliError::Usage(format!("File not found: {}", path.display())).into());
    }
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_run() {
        let cli = parse(&["replflash", "--port", "/dev/ttyUSB0", "run", "main.py"]);
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        match cli.command {
            Commands::Run { file, timeout_ms } => {
                assert_eq!(file, PathBuf::from("main.py"));
                assert!(timeout_ms.is_none());
            },
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parse_put_with_remote_name() {
        let cli = parse(&["replflash", "put", "local.py", "main.py", "--skip-verify"]);
        match cli.command {
            Commands::Put {
                local,
                remote,
                skip_verify,
            } => {
                assert_eq!(local, PathBuf::from("local.py"));
                assert_eq!(remote.as_deref(), Some("main.py"));
                assert!(skip_verify);
            },
            _ => panic!("expected put"),
        }
    }

    #[test]
    fn test_cli_parse_get_to_stdout() {
        let cli = parse(&["replflash", "get", "boot.py"]);
        assert!(matches!(
            cli.command,
            Commands::Get { ref remote, local: None } if remote == "boot.py"
        ));
    }

    #[test]
    fn test_cli_parse_reset_default_capture() {
        let cli = parse(&["replflash", "reset"]);
        assert!(matches!(cli.command, Commands::Reset { capture_ms: 1000 }));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = parse(&["replflash", "stop", "-b", "esp32", "-vv", "-q"]);
        assert_eq!(cli.board.as_deref(), Some("esp32"));
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["replflash"]).is_err());
    }

    #[test]
    fn test_resolve_port_prefers_cli() {
        let cli = parse(&["replflash", "-p", "COM3", "stop"]);
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyUSB0".to_string());
        assert_eq!(resolve_port(&cli, &config).unwrap(), "COM3");
    }

    #[test]
    fn test_resolve_port_falls_back_to_config() {
        let mut cli = parse(&["replflash", "stop"]);
        cli.port = None;
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyACM0".to_string());
        assert_eq!(resolve_port(&cli, &config).unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn test_resolve_port_missing_is_usage_error() {
        let mut cli = parse(&["replflash", "stop"]);
        cli.port = None;
        let err = resolve_port(&cli, &Config::default()).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_resolve_board() {
        let mut cli = parse(&["replflash", "stop"]);
        cli.board = None;
        let mut config = Config::default();
        assert_eq!(resolve_board(&cli, &config).unwrap(), BoardKind::Esp8266);

        config.connection.board = Some("micro:bit".to_string());
        assert_eq!(resolve_board(&cli, &config).unwrap(), BoardKind::MicroBit);

        cli.board = Some("ESP32".to_string());
        assert_eq!(resolve_board(&cli, &config).unwrap(), BoardKind::Esp32);

        cli.board = Some("pyboard".to_string());
        let err = resolve_board(&cli, &config).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_exit_codes() {
        let cancelled: anyhow::Error = CliError::Cancelled("stopped".to_string()).into();
        assert_eq!(exit_code_for(&cancelled), 130);

        let unavailable: anyhow::Error = ConnectError::PortUnavailable {
            path: "/dev/null".to_string(),
            reason: "busy".to_string(),
        }
        .into();
        assert_eq!(exit_code_for(&unavailable), 4);

        let transfer: anyhow::Error = TransferError::Cancelled.into();
        assert_eq!(exit_code_for(&transfer), 130);

        let rejected: anyhow::Error = ExecError::DeviceRejected(b"Traceback".to_vec()).into();
        assert_eq!(exit_code_for(&rejected), 1);
    }

    #[test]
    fn test_read_local_missing_file_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_local(&dir.path().join("missing.py")).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }
}
