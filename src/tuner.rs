use std::fmt;
use tracing::{debug, info, warn};

use crate::error::TuneError;
use crate::input::SharedSource;
use crate::state::{PersistedState, StateStore, DEFAULT_FREQUENCY_MHZ};

pub const MIN_FREQUENCY_MHZ: f64 = 0.5;
pub const MAX_FREQUENCY_MHZ: f64 = 108.0;
pub const SCAN_STEP_MHZ: f64 = 0.5;
/// Increment for manual up/down stepping
pub const FINE_STEP_MHZ: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Am,
    Sw,
    Fm,
    Unknown,
}

impl Band {
    pub fn for_frequency(mhz: f64) -> Band {
        if (0.5..=1.6).contains(&mhz) {
            Band::Am
        } else if (3.0..=30.0).contains(&mhz) {
            Band::Sw
        } else if (88.0..=108.0).contains(&mhz) {
            Band::Fm
        } else {
            Band::Unknown
        }
    }

    /// Frequency the band buttons jump to
    pub fn preset_mhz(&self) -> Option<f64> {
        match self {
            Band::Am => Some(1.0),
            Band::Sw => Some(10.0),
            Band::Fm => Some(100.0),
            Band::Unknown => None,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Band::Am => "AM",
            Band::Sw => "SW",
            Band::Fm => "FM",
            Band::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Round to two decimal places (10 kHz resolution)
pub fn round_mhz(mhz: f64) -> f64 {
    (mhz * 100.0).round() / 100.0
}

fn clamp_mhz(mhz: f64) -> f64 {
    if mhz.is_nan() {
        return DEFAULT_FREQUENCY_MHZ;
    }
    mhz.clamp(MIN_FREQUENCY_MHZ, MAX_FREQUENCY_MHZ)
}

pub fn mhz_to_hz(mhz: f64) -> u64 {
    (mhz * 1_000_000.0).round() as u64
}

/// Snapshot of everything the tuner knows
#[derive(Debug, Clone, PartialEq)]
pub struct TunerState {
    pub frequency_mhz: f64,
    pub band: Band,
    /// Sorted, unique to two decimals
    pub bookmarks: Vec<f64>,
    pub scanning: bool,
    pub dark: bool,
}

impl TunerState {
    /// Clamp, round and normalize loaded state
    pub fn from_persisted(persisted: PersistedState) -> Self {
        let frequency_mhz = round_mhz(clamp_mhz(persisted.last_frequency));
        let mut state = Self {
            frequency_mhz,
            band: Band::for_frequency(frequency_mhz),
            bookmarks: Vec::new(),
            scanning: false,
            dark: persisted.dark,
        };
        for mhz in persisted.bookmarks.into_iter().filter(|f| f.is_finite()) {
            state.insert_bookmark(mhz);
        }
        state
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            last_frequency: self.frequency_mhz,
            bookmarks: self.bookmarks.clone(),
            dark: self.dark,
        }
    }

    /// Returns false when an equal bookmark (to two decimals) already exists
    fn insert_bookmark(&mut self, mhz: f64) -> bool {
        let mhz = round_mhz(mhz);
        match self.bookmarks.binary_search_by(|b| b.total_cmp(&mhz)) {
            Ok(_) => false,
            Err(pos) => {
                self.bookmarks.insert(pos, mhz);
                true
            }
        }
    }
}

impl fmt::Display for TunerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frequency: {:.2} MHz | Band: {}", self.frequency_mhz, self.band)?;
        if self.scanning {
            write!(f, " | scanning")?;
        }
        Ok(())
    }
}

/// Result of one scan tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanOutcome {
    /// Tuned to the next step, still scanning
    Stepped(f64),
    /// Reached the top of the range, scan stopped
    Complete(f64),
    /// No scan was running; nothing happened
    Inactive,
}

/// Owns the tuner state and is the only thing that changes it.
///
/// Every change that reaches the persisted fields is saved right away.
/// Save failures are logged and queued as notices for the display; they never
/// fail the operation that triggered them.
pub struct FrequencyController {
    state: TunerState,
    source: SharedSource,
    store: Box<dyn StateStore>,
    notices: Vec<String>,
}

impl FrequencyController {
    /// Restore state from `store` (defaults on failure) and tune the source to it
    #[cfg(test)]
    pub fn new(source: SharedSource, store: Box<dyn StateStore>) -> Self {
        let state = TunerState::from_persisted(store.load_or_default());
        Self::restore(source, store, state)
    }

    /// Take over already loaded state and tune the source to it.
    ///
    /// If the source refuses that frequency the controller adopts the one the
    /// source is actually on and queues a notice.
    pub fn restore(source: SharedSource, store: Box<dyn StateStore>, state: TunerState) -> Self {
        info!("Restored {}, {} bookmark(s)", state, state.bookmarks.len());

        let mut controller = Self {
            state,
            source,
            store,
            notices: Vec::new(),
        };
        let mhz = controller.state.frequency_mhz;
        if let Err(e) = controller.retune_source(mhz) {
            warn!("Initial {}", e);
            controller.notices.push(e.to_string());
            controller.adopt_source_frequency();
        }
        controller
    }

    pub fn state(&self) -> &TunerState {
        &self.state
    }

    pub fn frequency_mhz(&self) -> f64 {
        self.state.frequency_mhz
    }

    pub fn is_scanning(&self) -> bool {
        self.state.scanning
    }

    /// Messages for the display accumulated since the last call
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    fn retune_source(&self, mhz: f64) -> Result<(), TuneError> {
        let mut source = self.source.lock().unwrap_or_else(|e| e.into_inner());
        source
            .retune(mhz_to_hz(mhz))
            .map_err(|source| TuneError::Source { mhz, source })
    }

    fn adopt_source_frequency(&mut self) {
        let hz = self.source.lock().unwrap_or_else(|e| e.into_inner()).center_freq_hz();
        let mhz = round_mhz(clamp_mhz(hz as f64 / 1_000_000.0));
        self.state.frequency_mhz = mhz;
        self.state.band = Band::for_frequency(mhz);
        info!("Staying at {:.2} MHz ({})", mhz, self.state.band);
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.state.to_persisted()) {
            warn!("State not saved: {}", e);
            self.notices.push(format!("State not saved: {}", e));
        }
    }

    /// Clamp, round and retune. On failure nothing changes.
    pub fn tune(&mut self, target_mhz: f64) -> Result<f64, TuneError> {
        let mhz = round_mhz(clamp_mhz(target_mhz));
        self.retune_source(mhz)?;

        self.state.frequency_mhz = mhz;
        self.state.band = Band::for_frequency(mhz);
        debug!("Tuned to {:.2} MHz ({})", mhz, self.state.band);
        self.persist();
        Ok(mhz)
    }

    /// Move by `delta_mhz` from the current frequency
    pub fn step(&mut self, delta_mhz: f64) -> Result<f64, TuneError> {
        self.tune(self.state.frequency_mhz + delta_mhz)
    }

    /// Jump to the band's preset frequency; `Unknown` has none and is ignored
    pub fn select_band(&mut self, band: Band) -> Result<f64, TuneError> {
        match band.preset_mhz() {
            Some(mhz) => self.tune(mhz),
            None => Ok(self.state.frequency_mhz),
        }
    }

    /// Bookmark the current frequency. Returns false if it was already saved.
    pub fn bookmark(&mut self) -> bool {
        let mhz = self.state.frequency_mhz;
        let added = self.state.insert_bookmark(mhz);
        if added {
            info!("Bookmarked {:.2} MHz", mhz);
        }
        self.persist();
        added
    }

    pub fn remove_bookmark(&mut self, mhz: f64) -> bool {
        let mhz = round_mhz(mhz);
        let before = self.state.bookmarks.len();
        self.state.bookmarks.retain(|b| *b != mhz);
        let removed = self.state.bookmarks.len() != before;
        if removed {
            self.persist();
        }
        removed
    }

    pub fn set_dark(&mut self, dark: bool) {
        self.state.dark = dark;
        self.persist();
    }

    /// Idle -> Scanning. Returns false if a scan was already running.
    pub fn start_scan(&mut self) -> bool {
        if self.state.scanning {
            return false;
        }
        self.state.scanning = true;
        info!("Scan started at {:.2} MHz", self.state.frequency_mhz);
        true
    }

    /// Scanning -> Idle. Returns false if no scan was running.
    pub fn stop_scan(&mut self) -> bool {
        if !self.state.scanning {
            return false;
        }
        self.state.scanning = false;
        info!("Scan stopped at {:.2} MHz", self.state.frequency_mhz);
        true
    }

    /// Advance a running scan by one step.
    ///
    /// Reaching the top of the range tunes there and ends the scan. A retune
    /// failure also ends the scan and is returned.
    pub fn scan_step(&mut self) -> Result<ScanOutcome, TuneError> {
        if !self.state.scanning {
            return Ok(ScanOutcome::Inactive);
        }

        let next = round_mhz(self.state.frequency_mhz + SCAN_STEP_MHZ);
        let result = self.tune(next);
        match result {
            Ok(mhz) if next >= MAX_FREQUENCY_MHZ => {
                self.state.scanning = false;
                info!("Scan complete at {:.2} MHz", mhz);
                Ok(ScanOutcome::Complete(mhz))
            }
            Ok(mhz) => Ok(ScanOutcome::Stepped(mhz)),
            Err(e) => {
                self.state.scanning = false;
                warn!("Scan aborted: {}", e);
                Err(e)
            }
        }
    }

    /// Stop any scan and write the final state
    pub fn shutdown(&mut self) {
        self.stop_scan();
        self.persist();
    }
}

/// One-shot requests applied once at startup, in order
#[derive(Debug, Clone, Default)]
pub struct StartupActions {
    pub band: Option<Band>,
    pub tune_mhz: Option<f64>,
    /// Number of `FINE_STEP_MHZ` steps, negative moves down
    pub nudge: Option<i32>,
    pub bookmark: bool,
    pub unbookmark_mhz: Option<f64>,
    pub dark: Option<bool>,
}

impl StartupActions {
    /// Run every requested action. A failed retune does not skip the rest;
    /// each failure is returned.
    pub fn apply(&self, ctl: &mut FrequencyController) -> Vec<TuneError> {
        let mut failures = Vec::new();
        if let Some(band) = self.band {
            if let Err(e) = ctl.select_band(band) {
                failures.push(e);
            }
        }
        if let Some(mhz) = self.tune_mhz {
            if let Err(e) = ctl.tune(mhz) {
                failures.push(e);
            }
        }
        if let Some(steps) = self.nudge {
            if let Err(e) = ctl.step(steps as f64 * FINE_STEP_MHZ) {
                failures.push(e);
            }
        }
        if self.bookmark {
            ctl.bookmark();
        }
        if let Some(mhz) = self.unbookmark_mhz {
            if !ctl.remove_bookmark(mhz) {
                warn!("No bookmark at {:.2} MHz", mhz);
            }
        }
        if let Some(dark) = self.dark {
            ctl.set_dark(dark);
        }
        failures
    }
}
