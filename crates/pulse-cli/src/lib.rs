//! Pulse CLI library.
//!
//! This crate provides the command-line interface for the heartbeat client.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, EventArgs};
pub use config::load_from as load_config;
