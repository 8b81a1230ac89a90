//! Configuration loading from `~/.relaymesh/config.toml` with defaults.

use relaymesh_types::config::MeshConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load mesh configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file never fails startup: the defaults
/// are used and the problem is logged.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return MeshConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<MeshConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                MeshConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            MeshConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    relaymesh_home().join("config.toml")
}

/// Get the default relaymesh home directory.
pub fn relaymesh_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".relaymesh")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(3));
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "rpc_timeout_ms = 500").unwrap();
        writeln!(f, "log_level = \"debug\"").unwrap();
        drop(f);

        let config = load_config(Some(&path));
        assert_eq!(config.rpc_timeout(), Duration::from_millis(500));
        assert_eq!(config.log_level, "debug");
        // Unset fields keep their defaults.
        assert_eq!(config.response_buffer_ms, 3000);
    }

    #[test]
    fn test_load_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "rpc_timeout_ms = \"soon\"\n[[[").unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.rpc_timeout_ms, 3000);
    }

    #[test]
    fn test_default_path() {
        let path = default_config_path();
        assert!(path.ends_with(".relaymesh/config.toml"));
    }
}
