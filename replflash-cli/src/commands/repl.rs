//! Interactive REPL session.
//!
//! Device output goes straight to stdout and into a [`Terminal`] so the final
//! screen can be saved; keystrokes are forwarded to the friendly REPL.

use anyhow::{Context, Result};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use log::debug;
use replflash::Terminal;
use std::io::{self, Write as _};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, clear_interrupted_flag, open_board, was_interrupted};

/// What a key press turns into.
#[derive(Debug, PartialEq, Eq)]
enum KeyAction {
    Send(Vec<u8>),
    Quit,
    Ignore,
}

fn key_action(code: KeyCode, modifiers: KeyModifiers) -> KeyAction {
    if modifiers.contains(KeyModifiers::CONTROL) {
        return match code {
            // Ctrl-] (some terminals report it as Ctrl-5)
            KeyCode::Char(']' | '5') => KeyAction::Quit,
            KeyCode::Char(c) if c.is_ascii_alphabetic() => {
                KeyAction::Send(vec![(c.to_ascii_lowercase() as u8) - b'a' + 1])
            },
            _ => KeyAction::Ignore,
        };
    }

    match code {
        KeyCode::Enter => KeyAction::Send(b"\r".to_vec()),
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            KeyAction::Send(
                c.encode_utf8(&mut buf)
                    .as_bytes()
                    .to_vec(),
            )
        },
        KeyCode::Backspace => KeyAction::Send(vec![0x08]),
        KeyCode::Tab => KeyAction::Send(vec![0x09]),
        KeyCode::Esc => KeyAction::Send(vec![0x1B]),
        KeyCode::Up => KeyAction::Send(b"\x1b[A".to_vec()),
        KeyCode::Down => KeyAction::Send(b"\x1b[B".to_vec()),
        KeyCode::Right => KeyAction::Send(b"\x1b[C".to_vec()),
        KeyCode::Left => KeyAction::Send(b"\x1b[D".to_vec()),
        _ => KeyAction::Ignore,
    }
}

/// Run the interactive session until Ctrl-] or the board goes away.
pub(crate) fn cmd_repl(cli: &Cli, config: &Config, log_file: Option<&Path>) -> Result<()> {
    let mut board = open_board(cli, config)?;
    if !cli.quiet {
        eprintln!("{}", style("Press Ctrl-] to quit").dim());
    }

    let screen = Arc::new(Mutex::new(Terminal::new()));
    let sink = screen.clone();
    board.subscribe_terminal(Box::new(move |chunk| {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(chunk);
        let _ = stdout.flush();
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .feed(chunk);
    }));

    // Ask for a fresh prompt.
    board.send(b"\r")?;

    crossterm::terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
    let session = {
        let _raw_guard = RawModeGuard;
        key_loop(&board)
    };

    board.disconnect();
    eprintln!();

    if let Some(path) = log_file {
        let text = screen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .text();
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write log file: {}", path.display()))?;
        if !cli.quiet {
            eprintln!("{} Saved session to {}", style("📝").cyan(), path.display());
        }
    }

    session
}

fn key_loop(board: &replflash::Board) -> Result<()> {
    loop {
        if was_interrupted() {
            clear_interrupted_flag();
            return Ok(());
        }
        if !board.is_connected() {
            anyhow::bail!("Board disconnected");
        }

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event::read()?
        else {
            continue;
        };
        if kind == KeyEventKind::Release {
            continue;
        }

        match key_action(code, modifiers) {
            KeyAction::Send(bytes) => {
                if let Err(e) = board.send(&bytes) {
                    debug!("Send failed: {e}");
                    return Err(e.into());
                }
            },
            KeyAction::Quit => return Ok(()),
            KeyAction::Ignore => {},
        }
    }
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}
