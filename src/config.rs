//! Bus configuration.
//!
//! Settings are loaded from an INI file. Every value has a safe default, so a
//! missing file or a missing key never prevents a bus from starting.
//!
//! # Configuration File Format
//!
//! ```ini
//! [bus]
//! worker_name = event-bus
//! panic_on_payload_mismatch = true
//!
//! [enter]
//! fps = 60
//! ```

use configparser::ini::Ini;
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default safe values for startup
const DEFAULT_WORKER_NAME: &str = "event-bus";
const DEFAULT_PANIC_ON_PAYLOAD_MISMATCH: bool = true;
const DEFAULT_ENTER_FPS: u32 = 60;
const DEFAULT_CONFIG_PATH: &str = "./bus.ini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },
    #[error("failed to save config file {}: {source}", .path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Bus configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// Name given to the worker thread that applies queued mutations.
    pub worker_name: String,
    /// Panic after a trigger pass in which a typed callback got the wrong
    /// payload type. When `false` the mismatch is logged and skipped.
    pub panic_on_payload_mismatch: bool,
    /// Frame rate of [`Bus::enter_loop`](crate::event::bus::Bus::enter_loop)
    /// when started through [`BusConfig::frame_delay`].
    pub enter_fps: u32,
    /// Path to the configuration file.
    pub config_path: PathBuf,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConfig {
    /// Create a new configuration with safe default values.
    pub fn new() -> Self {
        Self {
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            panic_on_payload_mismatch: DEFAULT_PANIC_ON_PAYLOAD_MISMATCH,
            enter_fps: DEFAULT_ENTER_FPS,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Create a new configuration with a custom config file path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            ..Self::new()
        }
    }

    /// Load configuration from the INI file.
    ///
    /// Missing values retain their current (default) values.
    pub fn load_from_file(&mut self) -> Result<(), ConfigError> {
        let mut config = Ini::new();
        config
            .load(&self.config_path)
            .map_err(|reason| ConfigError::Load {
                path: self.config_path.clone(),
                reason,
            })?;
        self.apply(&config);

        info!(
            "Loaded bus config: worker='{}', panic_on_payload_mismatch={}, enter_fps={}",
            self.worker_name, self.panic_on_payload_mismatch, self.enter_fps
        );

        Ok(())
    }

    /// Apply values from INI text, as [`load_from_file`](Self::load_from_file)
    /// does for a file.
    pub fn load_from_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let mut config = Ini::new();
        config
            .read(text.to_string())
            .map_err(|reason| ConfigError::Load {
                path: self.config_path.clone(),
                reason,
            })?;
        self.apply(&config);
        Ok(())
    }

    fn apply(&mut self, config: &Ini) {
        // [bus] section
        if let Some(name) = config.get("bus", "worker_name")
            && !name.trim().is_empty()
        {
            self.worker_name = name.trim().to_string();
        }
        if let Some(panic) = config
            .getbool("bus", "panic_on_payload_mismatch")
            .ok()
            .flatten()
        {
            self.panic_on_payload_mismatch = panic;
        }

        // [enter] section
        if let Some(fps) = config.getuint("enter", "fps").ok().flatten()
            && fps > 0
        {
            self.enter_fps = fps.min(u32::MAX as u64) as u32;
        }
    }

    /// Save configuration to the INI file.
    ///
    /// Creates the file if it doesn't exist.
    pub fn save_to_file(&self) -> Result<(), ConfigError> {
        let mut config = Ini::new();

        config.set("bus", "worker_name", Some(self.worker_name.clone()));
        config.set(
            "bus",
            "panic_on_payload_mismatch",
            Some(self.panic_on_payload_mismatch.to_string()),
        );
        config.set("enter", "fps", Some(self.enter_fps.to_string()));

        config
            .write(&self.config_path)
            .map_err(|source| ConfigError::Save {
                path: self.config_path.clone(),
                source,
            })?;

        info!("Saved bus config to {:?}", self.config_path);

        Ok(())
    }

    /// Delay between two enter frames at the configured frame rate.
    pub fn frame_delay(&self) -> Duration {
        Duration::from_secs(1) / self.enter_fps.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.worker_name, "event-bus");
        assert!(config.panic_on_payload_mismatch);
        assert_eq!(config.enter_fps, 60);
        assert_eq!(config.config_path, PathBuf::from("./bus.ini"));
    }

    #[test]
    fn test_with_path_keeps_defaults() {
        let config = BusConfig::with_path("/tmp/other.ini");
        assert_eq!(config.config_path, PathBuf::from("/tmp/other.ini"));
        assert_eq!(config.enter_fps, 60);
    }

    #[test]
    fn test_load_from_str_overrides_present_keys() {
        let mut config = BusConfig::new();
        config
            .load_from_str("[bus]\nworker_name = physics-bus\npanic_on_payload_mismatch = false\n")
            .unwrap();
        assert_eq!(config.worker_name, "physics-bus");
        assert!(!config.panic_on_payload_mismatch);
        assert_eq!(config.enter_fps, 60);
    }

    #[test]
    fn test_load_from_str_ignores_zero_fps() {
        let mut config = BusConfig::new();
        config.load_from_str("[enter]\nfps = 0\n").unwrap();
        assert_eq!(config.enter_fps, 60);
        config.load_from_str("[enter]\nfps = 30\n").unwrap();
        assert_eq!(config.enter_fps, 30);
    }

    #[test]
    fn test_frame_delay() {
        let mut config = BusConfig::new();
        config.enter_fps = 50;
        assert_eq!(config.frame_delay(), Duration::from_millis(20));
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let mut config = BusConfig::with_path("/nonexistent/dir/bus.ini");
        let err = config.load_from_file().unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
        assert_eq!(config.worker_name, "event-bus");
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("aberredbus-{}.ini", fastrand::u64(..)));
        let mut saved = BusConfig::with_path(&path);
        saved.worker_name = "saved-bus".into();
        saved.enter_fps = 24;
        saved.panic_on_payload_mismatch = false;
        saved.save_to_file().unwrap();

        let mut loaded = BusConfig::with_path(&path);
        loaded.load_from_file().unwrap();
        assert_eq!(loaded, saved);
        let _ = std::fs::remove_file(path);
    }
}
