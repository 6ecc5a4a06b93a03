use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::analysis::WindowType;

pub const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_POINTS: usize = 100_000;
pub const DEFAULT_EVENT_WAIT_MS: u64 = 10;

// Tunables that are not worth a command line flag
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub instrument: InstrumentSettings,
    pub display: DisplaySettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct InstrumentSettings {
    pub io_timeout_ms: u64,
    pub max_points: usize,  // Upper bound on samples pulled per acquisition
    pub window: WindowType,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            max_points: DEFAULT_MAX_POINTS,
            window: WindowType::FlatTop,
        }
    }
}

impl InstrumentSettings {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DisplaySettings {
    pub y_min_db: f64,
    pub y_max_db: f64,
    pub width: f32,
    pub height: f32,
    pub event_wait_ms: u64,  // How long the loop yields to the window per cycle
    pub annotation_font_size: f32,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            y_min_db: -120.0,
            y_max_db: 40.0,
            width: 1024.0,
            height: 600.0,
            event_wait_ms: DEFAULT_EVENT_WAIT_MS,
            annotation_font_size: 14.0,
        }
    }
}

impl DisplaySettings {
    pub fn event_wait(&self) -> Duration {
        Duration::from_millis(self.event_wait_ms)
    }
}

impl Settings {
    pub fn load(file_path: &Path) -> Result<Self> {
        info!("Loading settings from {}", file_path.display());
        let yaml_str = fs::read_to_string(file_path)
            .map_err(|e| anyhow!("Failed to read {}: {}", file_path.display(), e))?;
        Self::from_yaml(&yaml_str)
            .map_err(|e| anyhow!("Failed to parse {}: {}", file_path.display(), e))
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml_str)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.display.y_min_db >= self.display.y_max_db {
            return Err(anyhow!(
                "display.y_min_db ({}) must be below display.y_max_db ({})",
                self.display.y_min_db,
                self.display.y_max_db
            ));
        }
        if self.instrument.max_points < crate::analysis::MIN_SAMPLES {
            return Err(anyhow!(
                "instrument.max_points must be at least {}",
                crate::analysis::MIN_SAMPLES
            ));
        }
        Ok(())
    }
}
