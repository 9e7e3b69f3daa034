//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory holding the pairing record
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan for nearby companion devices
    Scan {
        /// Scan duration in seconds (defaults to the configured scan timeout)
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Advertise the companion service and wait for peers
    Advertise {
        /// Name to advertise (defaults to the configured device name)
        #[arg(short, long)]
        name: Option<String>,
        /// Confirm incoming pairing requests without prompting
        #[arg(long)]
        accept: bool,
    },
    /// Pair with a device by address
    Pair {
        /// Peer address as reported by `scan`
        address: String,
    },
    /// Reconnect to the paired device if it is nearby
    Connect,
    /// Forget the paired device
    Forget,
    /// Show the paired device and link status
    Status,
    /// Pair two simulated devices and exchange a payload
    Demo,
}
