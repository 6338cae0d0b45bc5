//! Configuration management for the emulation shim.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`SW_EMU_PACKET_SIZE`, etc.)
//! 2. Project-local config file (`./swemu.toml`)
//! 3. User config file (`~/.config/swemu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # swemu.toml
//!
//! # Bulk-transfer chunk threshold in bytes (default 8 MiB)
//! packet_size = 8388608
//!
//! # Skip spawning the simulator process (an externally launched
//! # simulator is expected to connect instead)
//! dont_run = false
//!
//! # Keep per-device run directories after close
//! keep_run_dir = false
//!
//! # Debug-server port passed to a debuggable simulator child
//! launch_port = 0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default bulk-transfer chunk threshold: 8 MiB.
pub const DEFAULT_PACKET_SIZE: u64 = 0x80_0000;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Shim configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Bulk-transfer chunk threshold in bytes.
    pub packet_size: Option<u64>,

    /// Skip spawning the simulator child; the channel is still created.
    pub dont_run: Option<bool>,

    /// Retain per-device run directories after close.
    pub keep_run_dir: Option<bool>,

    /// Debug-server port handed to a debuggable simulator child.
    pub launch_port: Option<u16>,

    /// Force images to be treated as debuggable.
    pub enable_kernel_debug: Option<bool>,

    /// Tools installation the simulator executable is resolved under.
    /// Usually taken from XILINX_VITIS and friends instead.
    pub install_path: Option<String>,

    /// Base directory for per-device run directories.
    pub run_dir: Option<String>,

    /// Per-device call-log file path. Empty disables call logging.
    pub hal_log: Option<String>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `swemu.toml`
    /// 3. User config `~/.config/swemu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Effective chunk threshold for bulk transfers.
    pub fn packet_size(&self) -> u64 {
        self.packet_size.unwrap_or(DEFAULT_PACKET_SIZE).max(1)
    }

    pub fn dont_run(&self) -> bool {
        self.dont_run.unwrap_or(false)
    }

    pub fn keep_run_dir(&self) -> bool {
        self.keep_run_dir.unwrap_or(false)
    }

    /// Debug port, when one is configured and non-zero.
    pub fn launch_port(&self) -> Option<u16> {
        self.launch_port.filter(|&p| p != 0)
    }

    pub fn enable_kernel_debug(&self) -> bool {
        self.enable_kernel_debug.unwrap_or(false)
    }

    /// Base directory under which per-device run directories are created.
    pub fn run_dir(&self) -> PathBuf {
        self.run_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("swemu"))
    }

    /// Call-log file path, when call logging is enabled.
    pub fn hal_log(&self) -> Option<&str> {
        self.hal_log.as_deref().filter(|s| !s.is_empty())
    }

    /// Load user configuration from ~/.config/swemu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("swemu").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./swemu.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("swemu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("swemu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.packet_size.is_some() {
            self.packet_size = other.packet_size;
        }
        if other.dont_run.is_some() {
            self.dont_run = other.dont_run;
        }
        if other.keep_run_dir.is_some() {
            self.keep_run_dir = other.keep_run_dir;
        }
        if other.launch_port.is_some() {
            self.launch_port = other.launch_port;
        }
        if other.enable_kernel_debug.is_some() {
            self.enable_kernel_debug = other.enable_kernel_debug;
        }
        if other.install_path.is_some() {
            self.install_path = other.install_path;
        }
        if other.run_dir.is_some() {
            self.run_dir = other.run_dir;
        }
        if other.hal_log.is_some() {
            self.hal_log = other.hal_log;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("SW_EMU_PACKET_SIZE") {
            match parse_u64(&size) {
                Some(size) => {
                    log::info!("Using SW_EMU_PACKET_SIZE from environment: {}", size);
                    self.packet_size = Some(size);
                }
                None => log::warn!("Ignoring unparsable SW_EMU_PACKET_SIZE: {}", size),
            }
        }
        if let Ok(v) = std::env::var("SWEMU_DONT_RUN") {
            self.dont_run = Some(is_truthy(&v));
        }
        if let Ok(v) = std::env::var("SWEMU_KEEP_RUN_DIR") {
            self.keep_run_dir = Some(is_truthy(&v));
        }
        if let Ok(v) = std::env::var("ENABLE_KERNEL_DEBUG") {
            self.enable_kernel_debug = Some(is_truthy(&v));
        }
        if let Ok(path) = std::env::var("SWEMU_RUN_DIR") {
            self.run_dir = Some(path);
        }
        if let Ok(path) = std::env::var("SWEMU_HAL_LOG") {
            self.hal_log = Some(path);
        }
    }
}

/// Accept both decimal and `0x`-prefixed values.
fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn is_truthy(s: &str) -> bool {
    matches!(s.trim(), "1" | "true" | "TRUE" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.packet_size(), DEFAULT_PACKET_SIZE);
        assert!(!config.dont_run());
        assert!(!config.keep_run_dir());
        assert_eq!(config.launch_port(), None);
        assert!(config.hal_log().is_none());
    }

    #[test]
    fn test_zero_port_means_no_debug_server() {
        let config = Config {
            launch_port: Some(0),
            ..Config::default()
        };
        assert_eq!(config.launch_port(), None);

        let config = Config {
            launch_port: Some(1440),
            ..Config::default()
        };
        assert_eq!(config.launch_port(), Some(1440));
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            packet_size: Some(1024),
            dont_run: Some(false),
            ..Config::default()
        };

        let overlay = Config {
            packet_size: None,
            dont_run: Some(true),
            keep_run_dir: Some(true),
            ..Config::default()
        };

        base.merge(overlay);

        // packet_size unchanged (overlay was None)
        assert_eq!(base.packet_size, Some(1024));
        // dont_run overridden by overlay
        assert_eq!(base.dont_run, Some(true));
        // keep_run_dir set from overlay
        assert_eq!(base.keep_run_dir, Some(true));
    }

    #[test]
    fn test_numeric_parsing() {
        assert_eq!(parse_u64("8388608"), Some(0x80_0000));
        assert_eq!(parse_u64("0x800000"), Some(0x80_0000));
        assert_eq!(parse_u64(" 64 "), Some(64));
        assert_eq!(parse_u64("8MB"), None);
    }

    #[test]
    fn test_toml_round_trip() {
        let text = r#"
packet_size = 65536
dont_run = true
launch_port = 1440
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.packet_size(), 65536);
        assert!(config.dont_run());
        assert_eq!(config.launch_port(), Some(1440));
        assert!(!config.keep_run_dir());
    }
}
