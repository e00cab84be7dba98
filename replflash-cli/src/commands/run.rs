//! `run` command: execute a local script and stream what it prints.

use anyhow::Result;
use console::style;
use log::debug;
use replflash::ExecError;
use replflash::exec::DEFAULT_EXEC_TIMEOUT;
use std::io::{self, Write as _};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, clear_interrupted_flag, open_board, read_local};

/// Run `file` on the board. Stdout is streamed as it arrives; a traceback
/// goes to stderr and fails the command.
pub(crate) fn cmd_run(
    cli: &Cli,
    config: &Config,
    file: &Path,
    timeout: Option<Duration>,
) -> Result<()> {
    let code = read_local(file)?;
    let mut board = open_board(cli, config)?;
    let timeout = timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);
    debug!("Running {} ({} bytes, timeout {timeout:?})", file.display(), code.len());

    let mut stdout = io::stdout();
    let result = board.run_with_output(&code, timeout, |chunk| {
        let _ = stdout.write_all(chunk);
        let _ = stdout.flush();
    });

    let output = match result {
        Ok(output) => output,
        Err(ExecError::Cancelled) if crate::was_interrupted() => {
            clear_interrupted_flag();
            if let Err(e) = board.interrupt() {
                debug!("Interrupt after Ctrl-C failed: {e}");
            }
            board.disconnect();
            return Err(CliError::Cancelled("Interrupted by user".to_string()).into());
        },
        Err(e) => {
            board.disconnect();
            return Err(e.into());
        },
    };
    board.disconnect();

    if output.is_success() {
        if !cli.quiet {
            eprintln!("{} Finished {}", style("✓").green(), file.display());
        }
        return Ok(());
    }

    let mut stderr = io::stderr();
    let _ = stderr.write_all(&output.stderr);
    let _ = stderr.flush();
    anyhow::bail!("{} raised an exception on the board", file.display())
}
