//! Companion CLI library
//!
//! Command-line front end for the companion BLE link: scanning, advertising,
//! pairing, pairing-record management and a loopback demo.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::{run_demo, CommandDispatcher, DemoReport};
pub use config::CliConfig;
pub use error::{CliError, Result};
