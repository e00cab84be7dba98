//! `put` and `get` commands.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use replflash::TransferError;
use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, clear_interrupted_flag, open_board, read_local, use_fancy_output};

/// Name used on the board when none is given: the local file name.
fn default_remote_name(local: &Path) -> Result<String> {
    local
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            CliError::Usage(format!(
                "Cannot derive a board file name from {}",
                local.display()
            ))
            .into()
        })
}

fn cancelled_or(err: TransferError) -> anyhow::Error {
    if matches!(err, TransferError::Cancelled) && crate::was_interrupted() {
        clear_interrupted_flag();
        return CliError::Cancelled("Transfer interrupted by user".to_string()).into();
    }
    err.into()
}

/// Upload `local` to the board, then read it back unless `skip_verify`.
pub(crate) fn cmd_put(
    cli: &Cli,
    config: &Config,
    local: &Path,
    remote: Option<&str>,
    skip_verify: bool,
) -> Result<()> {
    let data = read_local(local)?;
    let remote = match remote {
        Some(name) => name.to_string(),
        None => default_remote_name(local)?,
    };
    let mut board = open_board(cli, config)?;

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(data.len() as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };
    pb.set_message(remote.clone());

    let result = board.push_file_with(&remote, &data, !skip_verify, |sent, _total| {
        pb.set_position(sent as u64);
    });
    board.disconnect();
    if let Err(err) = result {
        pb.abandon();
        return Err(cancelled_or(err));
    }
    pb.finish_with_message("complete");

    if !cli.quiet {
        let check = if skip_verify { "" } else { ", verified" };
        eprintln!(
            "{} Wrote {} bytes to {}{check}",
            style("✓").green(),
            data.len(),
            style(&remote).cyan()
        );
    }
    Ok(())
}

/// Download `remote` into `local`, or to stdout when no path is given.
pub(crate) fn cmd_get(
    cli: &Cli,
    config: &Config,
    remote: &str,
    local: Option<&Path>,
) -> Result<()> {
    let mut board = open_board(cli, config)?;
    let result = board.pull_file(remote);
    board.disconnect();
    let data = result.map_err(cancelled_or)?;

    match local {
        Some(path) => {
            fs::write(path, &data).with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!(
                    "{} Read {} bytes from {} into {}",
                    style("✓").green(),
                    data.len(),
                    style(remote).cyan(),
                    path.display()
                );
            }
        },
        None => {
            let mut stdout = io::stdout();
            stdout.write_all(&data)?;
            stdout.flush()?;
        },
    }
    Ok(())
}
