//! Repository configuration.
//!
//! Sources in increasing precedence:
//! 1. built-in defaults
//! 2. `<root>/config.toml`, if present
//! 3. `DSV_*` environment variables, `__` between nested keys
//!    (`DSV_FETCH__MAX_ATTEMPTS=5`)

use crate::chunking::ChunkerConfig;
use crate::dataset::{ME, validate_name};
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::p2p::FetchConfig;
use crate::store::DEFAULT_COMPRESSION_THRESHOLD;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// File name of the optional per-repo config file.
pub const CONFIG_FILE: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DsvConfig {
    #[serde(default)]
    pub profile: ProfileConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local peer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default = "default_peername")]
    pub peername: String,

    #[serde(default)]
    pub addresses: Vec<String>,
}

fn default_peername() -> String {
    "peer".to_string()
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            peername: default_peername(),
            addresses: Vec::new(),
        }
    }
}

/// Block store tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Blocks at least this large are zstd-compressed on disk.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    #[serde(default)]
    pub chunker: ChunkerConfig,
}

fn default_compression_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compression_threshold: default_compression_threshold(),
            chunker: ChunkerConfig::default(),
        }
    }
}

/// Registry endpoint used by the publishing layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub location: Option<String>,
}

impl DsvConfig {
    /// Load the layered configuration for the repo at `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        let file = root.join(CONFIG_FILE);
        if file.exists() {
            let source = fs::read_to_string(&file)?;
            builder = builder.add_source(File::from_str(&source, FileFormat::Toml));
            debug!(config_path = %file.display(), "loaded repo config file");
        }

        builder = builder.add_source(
            Environment::with_prefix("DSV")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: DsvConfig = builder.build()?.try_deserialize()?;
        config.validated()
    }

    /// Write this configuration to `<root>/config.toml`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("failed to render config: {}", e)))?;
        fs::create_dir_all(root)?;
        fs::write(root.join(CONFIG_FILE), rendered)?;
        Ok(())
    }

    /// Every problem with this configuration.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = validate_name(&self.profile.peername, "peername") {
            errors.push(e.to_string());
        }
        if self.profile.peername == ME {
            errors.push(format!("peername '{}' is reserved", ME));
        }

        if let Err(e) = self.store.chunker.validate() {
            errors.push(e);
        }

        if let Err(e) = self.fetch.validate() {
            errors.push(e);
        }
        if let Err(e) = self.logging.validate() {
            errors.push(e);
        }
        if self.registry.enabled && self.registry.location.is_none() {
            errors.push("registry is enabled but has no location".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|errors| Error::config(format!("invalid configuration: {}", errors.join("; "))))?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = DsvConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.compression_threshold, 4096);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = DsvConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config.profile.peername, "peer");
        assert_eq!(config.fetch, FetchConfig::default());
    }

    #[test]
    fn test_load_reads_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE),
            "[profile]\npeername = \"alice\"\n\n[fetch]\nmax_attempts = 7\n",
        )
        .unwrap();

        let config = DsvConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config.profile.peername, "alice");
        assert_eq!(config.fetch.max_attempts, 7);
        assert_eq!(
            config.fetch.max_manifest_blocks,
            FetchConfig::default().max_manifest_blocks
        );
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = DsvConfig::default();
        config.profile.peername = "bob".into();
        config.registry.enabled = true;
        config.registry.location = Some("https://registry.example".into());
        config.save(temp_dir.path()).unwrap();

        let loaded = DsvConfig::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.profile, config.profile);
        assert_eq!(loaded.registry, config.registry);
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let mut config = DsvConfig::default();
        config.profile.peername = ME.to_string();
        config.store.chunker.min_size = config.store.chunker.max_size + 1;
        config.registry.enabled = true;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_chunker_sizes_outside_fastcdc_range() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE),
            "[store.chunker]\nmin_size = 16\navg_size = 32\nmax_size = 64\n",
        )
        .unwrap();
        assert!(matches!(
            DsvConfig::load(temp_dir.path()),
            Err(Error::Config { .. })
        ));

        let mut config = DsvConfig::default();
        config.store.chunker.max_size = 2 * 1024 * 1024 * 1024;
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("max_size"), "{:?}", errors);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE),
            "[profile]\npeername = \"has space\"\n",
        )
        .unwrap();
        assert!(matches!(
            DsvConfig::load(temp_dir.path()),
            Err(Error::Config { .. })
        ));
    }
}
