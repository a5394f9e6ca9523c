//! Configuration file support for meadow.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MEADOW_PORT, MEADOW_BAUD)
//! 3. Local config file (./meadow.toml)
//! 4. Global config file (~/.config/meadow/config.toml)

use {
    directories::ProjectDirs,
    log::{debug, warn},
    meadow_hcom::TransferConfig,
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Local config file name.
const LOCAL_CONFIG: &str = "meadow.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port, used as the auto-detection hint.
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// File upload tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bytes per chunk.
    pub chunk_size: Option<usize>,
    /// Per-step reply timeout in milliseconds.
    pub step_timeout_ms: Option<u64>,
    /// Whole-upload timeout in milliseconds.
    pub overall_timeout_ms: Option<u64>,
    /// Attempts per step.
    pub max_attempts: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upload settings.
    #[serde(default)]
    pub transfer: TransferSettings,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "meadow").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        let transfer = other.transfer;
        if transfer.chunk_size.is_some() {
            self.transfer.chunk_size = transfer.chunk_size;
        }
        if transfer.step_timeout_ms.is_some() {
            self.transfer.step_timeout_ms = transfer.step_timeout_ms;
        }
        if transfer.overall_timeout_ms.is_some() {
            self.transfer.overall_timeout_ms = transfer.overall_timeout_ms;
        }
        if transfer.max_attempts.is_some() {
            self.transfer.max_attempts = transfer.max_attempts;
        }
    }

    /// Upload settings with defaults filled in.
    pub fn transfer_config(&self) -> TransferConfig {
        let mut config = TransferConfig::default();
        if let Some(chunk_size) = self.transfer.chunk_size {
            config = config.with_chunk_size(chunk_size);
        }
        if let Some(ms) = self.transfer.step_timeout_ms {
            config = config.with_step_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.transfer.overall_timeout_ms {
            config = config.with_overall_timeout(Duration::from_millis(ms));
        }
        if let Some(attempts) = self.transfer.max_attempts {
            config = config.with_max_attempts(attempts);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::tempdir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.transfer.chunk_size.is_none());
    }

    #[test]
    fn test_config_merge_keeps_unset_values() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyACM0".to_string());
        base.connection.baud = Some(115200);

        let mut other = Config::default();
        other.connection.baud = Some(921600);
        other.transfer.max_attempts = Some(5);
        base.merge(other);

        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.connection.baud, Some(921600));
        assert_eq!(base.transfer.max_attempts, Some(5));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
port = "/dev/ttyACM0"
baud = 115200

[transfer]
chunk_size = 1024
step_timeout_ms = 2000
max_attempts = 4
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(115200));

        let transfer = config.transfer_config();
        assert_eq!(transfer.chunk_size, 1024);
        assert_eq!(transfer.step_timeout, Duration::from_secs(2));
        assert_eq!(transfer.max_attempts, 4);
        assert_eq!(
            transfer.overall_timeout,
            TransferConfig::default().overall_timeout
        );
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.port.is_none());
        assert_eq!(
            config
                .transfer_config()
                .chunk_size,
            TransferConfig::default().chunk_size
        );
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir
            .path()
            .join("config.toml");
        fs::write(
            &path,
            r#"
[connection]
port = "COM7"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.port.as_deref(), Some("COM7"));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let path = dir
            .path()
            .join("config.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_global_config_path_names_app() {
        if let Some(p) = Config::global_config_path() {
            let p = p.to_string_lossy();
            assert!(p.contains("meadow"));
            assert!(p.ends_with("config.toml"));
        }
    }
}
