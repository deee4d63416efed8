//! Connection settings
//!
//! Loaded from `connection.toml` in the platform config directory. Every field
//! has a default, so a partial file (or no file at all) is valid.
//!
//! ```toml
//! controller_type = "left_joycon"
//! max_pending = 32
//! status_period_ms = 500
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::monitor::MonitorSettings;
use crate::protocol::ControllerType;
use crate::session::SessionSettings;

const APP_DIR: &str = "padlink";
const FILE_NAME: &str = "connection.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub controller_type: ControllerType,
    /// Unresolved requests before submitters are held back.
    pub max_pending: usize,
    /// Transmitted but unacknowledged requests the device accepts.
    pub max_in_flight: usize,
    pub status_period_ms: u64,
    pub watchdog_interval_ms: u64,
    pub receive_poll_ms: u64,
    /// Also log the chatty message kinds (status polls, state reports).
    pub log_everything: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            controller_type: ControllerType::default(),
            max_pending: 16,
            max_in_flight: 4,
            status_period_ms: 1000,
            watchdog_interval_ms: 250,
            receive_poll_ms: 5,
            log_everything: false,
        }
    }
}

impl ConnectionSettings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse connection config: {}", e))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
        let settings = Self::from_toml_str(&content)?;
        info!("Loaded connection settings from {}", path.display());
        Ok(settings)
    }

    /// `<config dir>/padlink/connection.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(FILE_NAME))
    }

    /// A missing file means defaults. A present but broken file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => {
                debug!("No config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize connection config: {}", e))?;
        fs::write(path, content).map_err(|e| eyre!("Failed to write connection config: {}", e))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_pending == 0 {
            return Err(eyre!("max_pending must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(eyre!("max_in_flight must be at least 1"));
        }
        if self.status_period_ms == 0 || self.watchdog_interval_ms == 0 {
            return Err(eyre!("monitor periods must be non-zero"));
        }
        if self.receive_poll_ms == 0 {
            return Err(eyre!("receive_poll_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_pending: self.max_pending,
            max_in_flight: self.max_in_flight,
            log_everything: self.log_everything,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            period: Duration::from_millis(self.status_period_ms),
            watchdog_interval: Duration::from_millis(self.watchdog_interval_ms),
        }
    }

    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }
}
