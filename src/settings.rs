use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_index_file() -> String {
    "index.html".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_capacity() -> u64 {
    20 * 1024 * 1024 // 20 MiB
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_client_timeout() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_pacing_chunk_percent() -> u8 {
    10
}

fn default_pacing_attempt_cap() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    pub root_dir: PathBuf,
    #[serde(default = "default_index_file")]
    pub index_file: String,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_pacing_chunk_percent")]
    pub pacing_chunk_percent: u8,
    #[serde(default = "default_pacing_attempt_cap")]
    pub pacing_attempt_cap: u32,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("MEMSERVE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.root_dir = absolutize(&self.root_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.index_file.is_empty() && !self.index_file.contains('/'),
            "index_file must be a bare file name (got {:?})",
            self.index_file
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            (1..=100).contains(&self.pacing_chunk_percent),
            "pacing_chunk_percent must be between 1 and 100 (got {})",
            self.pacing_chunk_percent
        );
        ensure!(
            self.pacing_attempt_cap > 0,
            "pacing_attempt_cap must be greater than 0 (got {})",
            self.pacing_attempt_cap
        );
        if self.cache_enabled {
            ensure!(
                self.cache_capacity > 0,
                "cache_capacity must be greater than 0 (got {})",
                self.cache_capacity
            );
            ensure!(
                self.cache_max_entries > 0,
                "cache_max_entries must be greater than 0 (got {})",
                self.cache_max_entries
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/memserve/memserve.toml"),
        PathBuf::from("memserve.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            listen: "127.0.0.1:0".parse().unwrap(),
            root_dir: PathBuf::from("assets"),
            index_file: default_index_file(),
            log: LogFormat::Text,
            cache_enabled: true,
            cache_capacity: default_cache_capacity(),
            cache_max_entries: default_cache_max_entries(),
            client_timeout: 30,
            max_header_size: 1024,
            pacing_chunk_percent: 10,
            pacing_attempt_cap: 10,
            metrics_listen: None,
        }
    }

    #[test]
    fn valid_settings_pass() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn cache_sizes_checked_only_when_enabled() {
        let mut settings = base_settings();
        settings.cache_capacity = 0;
        assert!(settings.validate().is_err());

        settings.cache_enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn index_file_must_be_bare_name() {
        let mut settings = base_settings();
        settings.index_file = "sub/index.html".to_string();
        assert!(settings.validate().is_err());
        settings.index_file = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn pacing_bounds_enforced() {
        let mut settings = base_settings();
        settings.pacing_chunk_percent = 0;
        assert!(settings.validate().is_err());
        settings.pacing_chunk_percent = 101;
        assert!(settings.validate().is_err());
        settings.pacing_chunk_percent = 100;
        settings.pacing_attempt_cap = 0;
        assert!(settings.validate().is_err());
    }
}
