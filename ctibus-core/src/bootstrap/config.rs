//! Configuration loading

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `CTIBUS_CONFIG_PATH` environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
pub fn load_config() -> Result<Config> {
    load_config_from(std::env::var("CTIBUS_CONFIG_PATH").ok())
}

/// Same as [`load_config`] with an explicit first candidate (CLI `--config`)
pub fn load_config_from(explicit: Option<String>) -> Result<Config> {
    let config_path = explicit
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        match Config::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load {path}: {e}");
                eprintln!("Falling back to environment variables");
                Config::from_env().unwrap_or_default()
            }
        }
    } else {
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    // Fail fast on misconfigurations
    if let Err(errors) = config.validate() {
        for error in &errors {
            tracing::error!("Config validation error: {}", error);
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!(
        local_only = config.is_local_only(),
        lock_replicas = config.lock_urls().len(),
        stream = %config.stream.name,
        "Configuration loaded and validated"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_path_wins() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "redis:\n  url: \"\"\nsession:\n  timeout_seconds: 60").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = load_config_from(Some(path)).unwrap();
        assert!(config.is_local_only());
        assert_eq!(config.session.timeout_seconds, 60);
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "sync:\n  min_queue_size: 900\n  max_queue_size: 10").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let err = load_config_from(Some(path)).unwrap_err();
        assert!(err.to_string().contains("min_queue_size"));
    }
}
