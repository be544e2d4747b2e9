/// Client configuration and signed-in user identity.
///
/// Reads an optional JSON file (e.g. ~/.config/taskboard/sync.json); every
/// field has a default so a missing file or a partial file is fine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// User identity of the signed-in account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email,
        }
    }
}

/// Timing knobs for presence, throttling and deadline alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,
    #[serde(default = "default_liveness_tick_ms")]
    pub liveness_tick_ms: u64,
    #[serde(default = "default_edit_throttle_ms")]
    pub edit_throttle_ms: u64,
    #[serde(default = "default_deadline_check_interval_ms")]
    pub deadline_check_interval_ms: u64,
    #[serde(default = "default_due_soon_window_hours")]
    pub due_soon_window_hours: u32,
    #[serde(default = "default_overdue_grace_hours")]
    pub overdue_grace_hours: u32,
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_liveness_window_ms() -> u64 {
    30_000
}

fn default_liveness_tick_ms() -> u64 {
    5_000
}

fn default_edit_throttle_ms() -> u64 {
    1_000
}

fn default_deadline_check_interval_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_due_soon_window_hours() -> u32 {
    24
}

fn default_overdue_grace_hours() -> u32 {
    1
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            liveness_window_ms: default_liveness_window_ms(),
            liveness_tick_ms: default_liveness_tick_ms(),
            edit_throttle_ms: default_edit_throttle_ms(),
            deadline_check_interval_ms: default_deadline_check_interval_ms(),
            due_soon_window_hours: default_due_soon_window_hours(),
            overdue_grace_hours: default_overdue_grace_hours(),
        }
    }
}

impl SyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn liveness_tick(&self) -> Duration {
        Duration::from_millis(self.liveness_tick_ms.max(1))
    }

    pub fn edit_throttle(&self) -> Duration {
        Duration::from_millis(self.edit_throttle_ms)
    }

    pub fn deadline_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadline_check_interval_ms.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parse config JSON text.
pub fn parse_config(text: &str) -> Result<SyncConfig, ConfigError> {
    Ok(serde_json::from_str(text)?)
}

/// Load config from path. Returns defaults if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<SyncConfig, ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!(
                target: "taskboard.config",
                "No config at {}, using defaults",
                path.display()
            );
            Ok(SyncConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}
