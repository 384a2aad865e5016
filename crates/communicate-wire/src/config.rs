//! Configuration loading from `~/.communicate/config.toml`.

use communicate_types::{CommunicateError, CommunicateResult, CommunicatorConfig};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load communicator configuration from a TOML file, with defaults.
///
/// A missing file, a parse failure or out-of-range values all fall back to
/// [`CommunicatorConfig::default`] with a warning.
pub fn load_config(path: Option<&Path>) -> CommunicatorConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return CommunicatorConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            CommunicatorConfig::default()
        }
    }
}

/// Read and validate a config file, reporting what is wrong with it.
pub fn read_config(path: &Path) -> CommunicateResult<CommunicatorConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: CommunicatorConfig =
        toml::from_str(&contents).map_err(|e| CommunicateError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Write `config` as TOML, creating parent directories.
pub fn save_config(config: &CommunicatorConfig, path: &Path) -> CommunicateResult<()> {
    let contents = toml::to_string_pretty(config).map_err(|e| CommunicateError::Config(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    communicate_home().join("config.toml")
}

/// Get the default Communicate home directory.
pub fn communicate_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".communicate")
}
