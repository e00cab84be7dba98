//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod files;
pub(crate) mod repl;
pub(crate) mod reset;
pub(crate) mod run;
