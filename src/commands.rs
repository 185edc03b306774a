//! The driver's subcommands.

pub mod run;
