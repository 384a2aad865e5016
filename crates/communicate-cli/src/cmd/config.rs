//! Config commands.

use crate::ui;
use communicate_types::CommunicatorConfig;
use communicate_wire::config::{default_config_path, load_config, save_config};
use std::path::PathBuf;

fn resolve_path(config: Option<PathBuf>) -> PathBuf {
    config.unwrap_or_else(default_config_path)
}

pub fn cmd_config_show(config: Option<PathBuf>) {
    let effective = load_config(config.as_deref());
    match toml::to_string_pretty(&effective) {
        Ok(text) => print!("{text}"),
        Err(e) => {
            ui::error(&format!("Could not render config: {e}"));
            std::process::exit(1);
        }
    }
}

pub fn cmd_config_path(config: Option<PathBuf>) {
    println!("{}", resolve_path(config).display());
}

pub fn cmd_config_init(config: Option<PathBuf>, force: bool) {
    let path = resolve_path(config);
    if path.exists() && !force {
        ui::error_with_fix(
            &format!("{} already exists", path.display()),
            "pass --force to overwrite it",
        );
        std::process::exit(1);
    }
    match save_config(&CommunicatorConfig::default(), &path) {
        Ok(()) => ui::success(&format!("Wrote {}", path.display())),
        Err(e) => {
            ui::error(&format!("Could not write {}: {e}", path.display()));
            std::process::exit(1);
        }
    }
}
