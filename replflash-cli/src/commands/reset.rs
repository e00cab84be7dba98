//! `reset` and `stop` commands.

use anyhow::Result;
use console::style;
use replflash::Terminal;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::{Cli, open_board, was_interrupted};

/// Soft-reset the board and print whatever it says while booting.
pub(crate) fn cmd_reset(cli: &Cli, config: &Config, capture: Duration) -> Result<()> {
    let mut board = open_board(cli, config)?;
    let screen = Arc::new(Mutex::new(Terminal::new()));
    board.attach_terminal(screen.clone());

    board.reset()?;
    if !cli.quiet {
        eprintln!("{} Soft reset sent", style("🔄").cyan());
    }

    let deadline = Instant::now() + capture;
    while Instant::now() < deadline && !was_interrupted() && board.is_connected() {
        std::thread::sleep(Duration::from_millis(20));
    }
    board.disconnect();

    let text = screen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .text();
    let text = text.trim_end();
    if !text.is_empty() {
        println!("{text}");
    }
    Ok(())
}

/// Interrupt whatever the board is running.
pub(crate) fn cmd_stop(cli: &Cli, config: &Config) -> Result<()> {
    let board = open_board(cli, config)?;
    board.interrupt()?;
    board.disconnect();
    if !cli.quiet {
        eprintln!("{} Interrupt sent", style("✓").green());
    }
    Ok(())
}
