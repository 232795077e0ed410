use chrono::{DateTime, Local};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::spectrum::SpectralFrame;
use crate::tuner::TunerState;

/// Characters per rendered spectrum strip, as in the classic one-line waveform
pub const SPARKLINE_WIDTH: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub text: String,
    pub at: DateTime<Local>,
}

/// One change pushed towards the front end
#[derive(Debug, Clone)]
pub enum DisplayUpdate {
    Spectrum(SpectralFrame),
    Envelope(SpectralFrame),
    /// Transient message (errors, scan progress)
    Status(String),
    Tuned(TunerState),
}

/// Latest value of everything a front end shows.
///
/// Each update overwrites its slot, so a slow consumer skips stale frames
/// and always reads the newest complete one.
#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    pub spectrum: Option<SpectralFrame>,
    pub envelope: Option<SpectralFrame>,
    pub status: Option<StatusMessage>,
    pub tuner: Option<TunerState>,
    /// Bumped on every spectrum frame
    pub frame_seq: u64,
    /// Bumped on every status message
    pub status_seq: u64,
}

impl DisplayState {
    fn apply(&mut self, update: DisplayUpdate) {
        match update {
            DisplayUpdate::Spectrum(frame) => {
                self.spectrum = Some(frame);
                self.frame_seq += 1;
            }
            DisplayUpdate::Envelope(frame) => self.envelope = Some(frame),
            DisplayUpdate::Status(text) => {
                self.status = Some(StatusMessage {
                    text,
                    at: Local::now(),
                });
                self.status_seq += 1;
            }
            DisplayUpdate::Tuned(state) => self.tuner = Some(state),
        }
    }
}

/// Producer side of the single-slot display handoff
#[derive(Clone)]
pub struct DisplayPublisher {
    tx: Arc<watch::Sender<DisplayState>>,
}

impl DisplayPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DisplayState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, update: DisplayUpdate) {
        self.tx.send_modify(|state| state.apply(update));
    }

    pub fn status<S: Into<String>>(&self, text: S) {
        self.publish(DisplayUpdate::Status(text.into()));
    }

    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> DisplayState {
        self.tx.borrow().clone()
    }
}

impl Default for DisplayPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Front end consuming display snapshots
pub trait DisplaySink: Send {
    fn render(&mut self, state: &DisplayState);
}

/// Consume snapshots until every publisher is gone
pub async fn run_display<S: DisplaySink>(mut rx: watch::Receiver<DisplayState>, mut sink: S) {
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        sink.render(&state);
    }
    debug!("Display publisher closed");
}

/// Text front end writing through the log
#[derive(Debug, Default)]
pub struct LogDisplay {
    last_frame: u64,
    last_status: u64,
    last_tuner: Option<String>,
}

impl DisplaySink for LogDisplay {
    fn render(&mut self, state: &DisplayState) {
        if let Some(tuner) = &state.tuner {
            let line = tuner.to_string();
            if self.last_tuner.as_ref() != Some(&line) {
                info!("📻 {}", line);
                self.last_tuner = Some(line);
            }
        }

        if state.status_seq != self.last_status {
            self.last_status = state.status_seq;
            if let Some(status) = &state.status {
                info!("🔔 {}", status.text);
            }
        }

        if state.frame_seq != self.last_frame {
            self.last_frame = state.frame_seq;
            if let Some(frame) = &state.spectrum {
                let peak = frame
                    .peak()
                    .map(|(idx, _)| frame.bin_hz(idx) / 1_000.0)
                    .unwrap_or(0.0);
                info!("🎵 {} peak +{:.1} kHz", frame.sparkline(SPARKLINE_WIDTH), peak);
            }
            if let Some(envelope) = &state.envelope {
                debug!("〰 {}", envelope.sparkline(SPARKLINE_WIDTH));
            }
        }
    }
}
