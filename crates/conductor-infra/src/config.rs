//! Configuration loading.
//!
//! Reads `conductor.toml` from the data directory (or an explicit path),
//! then applies `CONDUCTOR_*` environment overrides. A missing file yields
//! the defaults.

use std::path::{Path, PathBuf};

use conductor_types::config::ConductorConfig;

/// Resolve the data directory: `CONDUCTOR_DATA_DIR`, else `~/.conductor`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CONDUCTOR_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conductor")
}

/// Load configuration from `<data_dir>/conductor.toml` (or `path` when
/// given), with env overrides applied.
pub fn load_config(data_dir: &Path, path: Option<&Path>) -> anyhow::Result<ConductorConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => data_dir.join("conductor.toml"),
    };

    let mut config = if config_path.exists() {
        let text = std::fs::read_to_string(&config_path)?;
        let config: ConductorConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("{}: {e}", config_path.display()))?;
        tracing::info!(path = %config_path.display(), "configuration loaded");
        config
    } else {
        tracing::info!(
            path = %config_path.display(),
            "no configuration file, using defaults"
        );
        ConductorConfig::default()
    };

    config.apply_env_overrides();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::config::BackendKind;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path(), None).unwrap();
        assert_eq!(config.runner.max_parallel, 8);
        assert_eq!(config.backend, BackendKind::Sqlite);
    }

    #[test]
    fn test_explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "backend = \"memory\"\n\n[runner]\nmax_parallel = 2\n").unwrap();

        let config = load_config(dir.path(), Some(&path)).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.runner.max_parallel, 2);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "runner = [not toml").unwrap();
        assert!(load_config(dir.path(), Some(&path)).is_err());
    }
}
