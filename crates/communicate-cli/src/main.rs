//! Communicate CLI: run the discovery and streaming demo and manage config.

mod cli;
mod cmd;
mod ui;

use crate::cli::*;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Demo {
            count,
            file,
            binary,
            txt,
        } => cmd::demo::cmd_demo(cli.config, count, file, binary, txt),
        Commands::Config(sub) => match sub {
            ConfigCommands::Show => cmd::config::cmd_config_show(cli.config),
            ConfigCommands::Path => cmd::config::cmd_config_path(cli.config),
            ConfigCommands::Init { force } => cmd::config::cmd_config_init(cli.config, force),
        },
    }
}
