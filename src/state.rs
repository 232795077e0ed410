use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::PersistenceError;

pub const DEFAULT_FREQUENCY_MHZ: f64 = 100.0;

fn default_frequency() -> f64 {
    DEFAULT_FREQUENCY_MHZ
}

/// On-disk shape of the tuner state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_frequency")]
    pub last_frequency: f64,
    #[serde(default)]
    pub bookmarks: Vec<f64>,
    #[serde(default)]
    pub dark: bool,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            last_frequency: DEFAULT_FREQUENCY_MHZ,
            bookmarks: Vec::new(),
            dark: false,
        }
    }
}

/// Where tuner state is kept between runs
pub trait StateStore: Send {
    fn load(&self) -> Result<PersistedState, PersistenceError>;

    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError>;

    /// Load, falling back to defaults on any failure
    fn load_or_default(&self) -> PersistedState {
        match self.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("{}; using defaults", e);
                PersistedState::default()
            }
        }
    }
}

/// JSON file store. A missing file loads as defaults.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonStateFile {
    fn load(&self) -> Result<PersistedState, PersistenceError> {
        if !self.path.exists() {
            debug!("No state file at {}, using defaults", self.path.display());
            return Ok(PersistedState::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| PersistenceError::Io(self.path.clone(), e))?;
        serde_json::from_str(&content).map_err(|e| PersistenceError::Parse(self.path.clone(), e))
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::Io(self.path.clone(), e))?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| PersistenceError::Parse(self.path.clone(), e))?;
        // Write beside the target, then rename over it
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| PersistenceError::Io(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| PersistenceError::Io(self.path.clone(), e))
    }
}

/// Store that keeps nothing; used when persistence is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl StateStore for NoPersistence {
    fn load(&self) -> Result<PersistedState, PersistenceError> {
        Ok(PersistedState::default())
    }

    fn save(&self, _state: &PersistedState) -> Result<(), PersistenceError> {
        Ok(())
    }
}
