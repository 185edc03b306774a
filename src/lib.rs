//! The wavm driver library: everything the `wavm` binary does, exposed so
//! integration tests can drive the same code paths.

#![deny(nonstandard_style, unused_mut, unreachable_patterns)]

pub mod commands;
pub mod utils;
