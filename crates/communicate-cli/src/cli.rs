//! Clap CLI definitions for Communicate.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  communicate demo                      Publish, discover, connect and send 10 texts
  communicate demo --count 50 --txt v=2 Advertise a TXT record and send 50 texts
  communicate demo --file photo.png     Send a file instead of text
  communicate demo --binary             Send MessagePack objects instead of text
  communicate config show               Print the effective configuration
  communicate config init               Write a default config file";

/// Communicate: LAN peer discovery and data exchange.
#[derive(Parser)]
#[command(name = "communicate", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a publisher and a searcher in one process and stream data between them.
    Demo {
        /// Number of text frames to send.
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Send this file instead of text frames.
        #[arg(long, conflicts_with = "binary")]
        file: Option<PathBuf>,
        /// Send each frame as a MessagePack object instead of text.
        #[arg(long)]
        binary: bool,
        /// TXT record to advertise, as key=value. Repeatable.
        #[arg(long = "txt", value_parser = parse_txt_entry)]
        txt: Vec<(String, String)>,
    },
    /// Inspect or create the config file.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the config file path.
    Path,
    /// Write the default configuration.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn parse_txt_entry(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, _)) if key.is_empty() => Err("TXT key must not be empty".into()),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Ok((s.to_string(), String::new())),
    }
}
