use std::path::PathBuf;
use std::fs;
use directories::ProjectDirs;
use crate::common::config::Config;
use crate::common::error::{GateError, Result};

/// Resolves where users, captures and verification events live.
///
/// Dev mode keeps everything under `./dev_data` so a bench setup never
/// touches the system data directory.
#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        let base_dir = if enabled {
            PathBuf::from("./dev_data")
        } else {
            ProjectDirs::from("com", "shuttlegate", "ShuttleGate")
                .ok_or_else(|| GateError::Storage("Failed to get project dirs".into()))?
                .data_dir()
                .to_path_buf()
        };
        Self::with_base_dir(enabled, base_dir)
    }

    /// Honours `[storage] data_dir` from the config before falling back to `new`.
    pub fn from_config(enabled: bool, config: &Config) -> Result<Self> {
        match (&config.storage.data_dir, enabled) {
            (Some(dir), false) => Self::with_base_dir(false, dir.clone()),
            _ => Self::new(enabled),
        }
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(base_dir.join("users"))?;
        fs::create_dir_all(base_dir.join("captures"))?;
        fs::create_dir_all(base_dir.join("events"))?;
        fs::create_dir_all(base_dir.join("debug"))?;

        if enabled {
            tracing::info!("Development mode enabled - data will be saved to: {}", base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("users")
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.base_dir.join("captures")
    }

    pub fn events_file(&self) -> PathBuf {
        self.base_dir.join("events").join("verifications.jsonl")
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.base_dir.join("debug")
    }

    pub fn get_capture_path(&self, prefix: &str) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
        self.captures_dir().join(format!("{}_{}.jpg", prefix, timestamp))
    }

    pub fn get_debug_path(&self, prefix: &str) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        self.debug_dir().join(format!("{}_{}.jpg", prefix, timestamp))
    }
}
