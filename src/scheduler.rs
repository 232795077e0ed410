use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::audio::AudioSink;
use crate::demod::Demodulator;
use crate::display::{DisplayPublisher, DisplayUpdate};
use crate::error::{SourceError, TuneError};
use crate::input::{IqBatch, SharedSource};
use crate::spectrum::{SpectralAnalyzer, SpectralFrame};
use crate::tuner::{FrequencyController, ScanOutcome};

pub type SharedController = Arc<Mutex<FrequencyController>>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub refresh_interval: Duration,
    pub scan_interval: Duration,
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(800),
            scan_interval: Duration::from_millis(1000),
            batch_size: 16 * 1024,
        }
    }
}

/// The pure stages run after every read
pub struct Pipeline {
    pub demodulator: Demodulator,
    pub analyzer: SpectralAnalyzer,
    pub audio: Box<dyn AudioSink>,
}

impl Pipeline {
    /// Demodulate into the audio sink, return (spectrum, envelope) for display
    pub fn process(&mut self, batch: &IqBatch) -> (SpectralFrame, SpectralFrame) {
        let audio = self.demodulator.demodulate(batch);
        trace!("{} audio samples ({:.1} ms)", audio.len(), audio.duration_ms());
        if !audio.is_empty() {
            self.audio.submit(audio);
        }
        (self.analyzer.analyze(batch), self.analyzer.envelope(batch))
    }
}

/// Read one batch on the blocking pool, holding the source lock for the read
async fn acquire(source: &SharedSource, batch_size: usize) -> Result<IqBatch, SourceError> {
    let source = source.clone();
    tokio::task::spawn_blocking(move || {
        let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
        source.read(batch_size)
    })
    .await
    .map_err(|e| SourceError::device(format!("acquisition task failed: {}", e)))?
}

/// Run `f` against the controller on the blocking pool (it may retune, which
/// waits on an in-flight read), then publish the resulting tuner state and
/// any queued notices.
pub async fn with_controller<F, T>(controller: &SharedController, display: &DisplayPublisher, f: F) -> T
where
    F: FnOnce(&mut FrequencyController) -> T + Send + 'static,
    T: Send + 'static,
{
    let controller = controller.clone();
    let (result, state, notices) = tokio::task::spawn_blocking(move || {
        let mut ctl = controller.lock().unwrap_or_else(|e| e.into_inner());
        let result = f(&mut ctl);
        (result, ctl.state().clone(), ctl.take_notices())
    })
    .await
    .unwrap_or_else(|e| std::panic::resume_unwind(e.into_panic()));

    display.publish(DisplayUpdate::Tuned(state));
    for notice in notices {
        display.status(notice);
    }
    result
}

async fn refresh_loop(
    source: SharedSource,
    mut pipeline: Pipeline,
    display: DisplayPublisher,
    period: Duration,
    batch_size: usize,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match acquire(&source, batch_size).await {
            Ok(batch) => {
                let (spectrum, envelope) = pipeline.process(&batch);
                display.publish(DisplayUpdate::Envelope(envelope));
                display.publish(DisplayUpdate::Spectrum(spectrum));
            }
            Err(e) => {
                if e.is_transient() {
                    debug!("Refresh skipped: {}", e);
                } else {
                    warn!("Refresh failed: {}", e);
                }
                display.status(format!("⚠ {}", e));
            }
        }
    }
}

async fn scan_loop(controller: SharedController, display: DisplayPublisher, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let outcome: Result<ScanOutcome, TuneError> =
            with_controller(&controller, &display, |ctl| ctl.scan_step()).await;
        match outcome {
            Ok(ScanOutcome::Stepped(mhz)) => debug!("Scan step to {:.2} MHz", mhz),
            Ok(ScanOutcome::Complete(mhz)) => {
                display.status(format!("✅ Scan complete at {:.2} MHz.", mhz));
                break;
            }
            Ok(ScanOutcome::Inactive) => break,
            Err(e) => {
                display.status(format!("🛑 Scan stopped: {}", e));
                break;
            }
        }
    }
}

/// Drives acquisition and scanning.
///
/// The refresh task runs for the scheduler's lifetime. The scan task exists
/// only while a scan is running and is aborted on `stop_scan`, so no step can
/// fire after cancellation.
pub struct UpdateScheduler {
    config: SchedulerConfig,
    source: SharedSource,
    controller: SharedController,
    display: DisplayPublisher,
    refresh: Option<JoinHandle<()>>,
    scan: Option<JoinHandle<()>>,
}

impl UpdateScheduler {
    /// Spawn the refresh cadence. Must be called inside a tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        source: SharedSource,
        controller: SharedController,
        pipeline: Pipeline,
        display: DisplayPublisher,
    ) -> Self {
        info!(
            "Refresh every {:?}, scan step every {:?}, {} samples per batch",
            config.refresh_interval, config.scan_interval, config.batch_size
        );
        let refresh = tokio::spawn(refresh_loop(
            source.clone(),
            pipeline,
            display.clone(),
            config.refresh_interval,
            config.batch_size,
        ));
        Self {
            config,
            source,
            controller,
            display,
            refresh: Some(refresh),
            scan: None,
        }
    }

    pub fn is_scan_running(&self) -> bool {
        self.scan.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Idle -> Scanning and start stepping every `scan_interval`
    pub async fn start_scan(&mut self) {
        let started = with_controller(&self.controller, &self.display, |ctl| ctl.start_scan()).await;
        if started || !self.is_scan_running() {
            if let Some(old) = self.scan.take() {
                old.abort();
            }
            self.display.status("🔍 Starting scan...");
            self.scan = Some(tokio::spawn(scan_loop(
                self.controller.clone(),
                self.display.clone(),
                self.config.scan_interval,
            )));
        }
    }

    /// Cancel stepping first, then move the controller to Idle
    pub async fn stop_scan(&mut self) {
        if let Some(handle) = self.scan.take() {
            handle.abort();
            let _ = handle.await;
        }
        let stopped = with_controller(&self.controller, &self.display, |ctl| ctl.stop_scan()).await;
        if stopped {
            self.display.status("🛑 Scan stopped.");
        }
    }

    /// Stop both cadences. No tick fires after this returns.
    pub async fn stop(&mut self) {
        for handle in [self.scan.take(), self.refresh.take()].into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Stop ticking, save final state and release the device
    pub async fn close(&mut self) {
        self.stop().await;
        with_controller(&self.controller, &self.display, |ctl| ctl.shutdown()).await;
        let source = self.source.clone();
        let _ = tokio::task::spawn_blocking(move || {
            source.lock().unwrap_or_else(|e| e.into_inner()).close();
        })
        .await;
        info!("Scheduler closed");
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        for handle in [self.scan.take(), self.refresh.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demod::{AudioBuffer, AUDIO_RATE};
    use crate::input::synthetic::SyntheticConfig;
    use crate::input::{shared, IqSample, SampleSource, SyntheticSource};
    use crate::spectrum::{SpectrumMode, Window};
    use crate::state::NoPersistence;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(Arc<AtomicUsize>);

    impl AudioSink for CountingSink {
        fn submit(&mut self, buffer: AudioBuffer) {
            assert!(!buffer.is_empty());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Source whose reads always time out
    struct StalledSource {
        reads: Arc<AtomicUsize>,
    }

    impl SampleSource for StalledSource {
        fn name(&self) -> String {
            "stalled".into()
        }
        fn sample_rate(&self) -> u32 {
            48_000
        }
        fn center_freq_hz(&self) -> u64 {
            0
        }
        fn retune(&mut self, _freq_hz: u64) -> Result<(), SourceError> {
            Ok(())
        }
        fn read(&mut self, _batch_size: usize) -> Result<IqBatch, SourceError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::AcquisitionTimeout(5))
        }
        fn close(&mut self) {}
    }

    fn pipeline(audio: Box<dyn AudioSink>) -> Pipeline {
        Pipeline {
            demodulator: Demodulator::new(AUDIO_RATE),
            analyzer: SpectralAnalyzer::new(256, 100.0, SpectrumMode::Complex, Window::Blackman).unwrap(),
            audio,
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            refresh_interval: Duration::from_millis(20),
            scan_interval: Duration::from_millis(20),
            batch_size: 4096,
        }
    }

    fn synthetic() -> SharedSource {
        let config = SyntheticConfig {
            sample_rate: 240_000,
            ..SyntheticConfig::default()
        };
        shared(Box::new(SyntheticSource::new(config).unwrap()))
    }

    fn controller_for(source: &SharedSource) -> SharedController {
        Arc::new(Mutex::new(FrequencyController::new(
            source.clone(),
            Box::new(NoPersistence),
        )))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_pipeline_process_fans_out() {
        let submitted = Arc::new(AtomicUsize::new(0));
        let mut stages = pipeline(Box::new(CountingSink(submitted.clone())));
        let samples = (0..1024).map(|n| IqSample::new((n as f32 * 0.1).cos(), (n as f32 * 0.1).sin())).collect();
        let (spectrum, envelope) = stages.process(&IqBatch::new(samples, 240_000, 100_000_000));
        assert_eq!(spectrum.values.len(), 128);
        assert_eq!(envelope.values.len(), 256);
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_publishes_frames_and_audio() {
        let source = synthetic();
        let submitted = Arc::new(AtomicUsize::new(0));
        let display = DisplayPublisher::new();
        let mut scheduler = UpdateScheduler::start(
            fast_config(),
            source.clone(),
            controller_for(&source),
            pipeline(Box::new(CountingSink(submitted.clone()))),
            display.clone(),
        );

        assert!(wait_for(|| display.latest().frame_seq >= 3).await);
        let latest = display.latest();
        let spectrum = latest.spectrum.unwrap();
        assert!(spectrum.values.iter().all(|v| (0.0..=100.0).contains(v)));
        assert!(latest.envelope.is_some());
        assert!(submitted.load(Ordering::SeqCst) >= 3);

        scheduler.stop().await;
        let frozen = display.latest().frame_seq;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(display.latest().frame_seq, frozen);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_failures_become_status_and_ticks_continue() {
        let reads = Arc::new(AtomicUsize::new(0));
        let source = shared(Box::new(StalledSource { reads: reads.clone() }));
        let display = DisplayPublisher::new();
        let mut scheduler = UpdateScheduler::start(
            fast_config(),
            source.clone(),
            controller_for(&source),
            pipeline(Box::new(CountingSink(Arc::new(AtomicUsize::new(0))))),
            display.clone(),
        );

        assert!(wait_for(|| reads.load(Ordering::SeqCst) >= 4).await);
        let latest = display.latest();
        assert!(latest.status.unwrap().text.contains("timed out"));
        assert!(latest.spectrum.is_none());
        scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_runs_to_top_and_reports_completion() {
        let source = synthetic();
        let controller = controller_for(&source);
        controller.lock().unwrap().tune(106.0).unwrap();
        let display = DisplayPublisher::new();
        let mut scheduler = UpdateScheduler::start(
            fast_config(),
            source.clone(),
            controller.clone(),
            pipeline(Box::new(CountingSink(Arc::new(AtomicUsize::new(0))))),
            display.clone(),
        );

        scheduler.start_scan().await;
        assert!(wait_for(|| !controller.lock().unwrap().is_scanning()).await);
        assert_eq!(controller.lock().unwrap().frequency_mhz(), 108.0);
        assert!(wait_for(|| !scheduler.is_scan_running()).await);
        assert!(display.latest().status.unwrap().text.contains("Scan complete"));
        assert_eq!(display.latest().tuner.unwrap().frequency_mhz, 108.0);
        assert_eq!(source.lock().unwrap().center_freq_hz(), 108_000_000);
        scheduler.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_scan_takes_effect_before_next_tick() {
        let source = synthetic();
        let controller = controller_for(&source);
        controller.lock().unwrap().tune(50.0).unwrap();
        let display = DisplayPublisher::new();
        let mut scheduler = UpdateScheduler::start(
            fast_config(),
            source.clone(),
            controller.clone(),
            pipeline(Box::new(CountingSink(Arc::new(AtomicUsize::new(0))))),
            display.clone(),
        );

        scheduler.start_scan().await;
        assert!(wait_for(|| controller.lock().unwrap().frequency_mhz() > 50.0).await);
        scheduler.stop_scan().await;
        let stopped_at = controller.lock().unwrap().frequency_mhz();
        assert!(!controller.lock().unwrap().is_scanning());
        assert!(!scheduler.is_scan_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.lock().unwrap().frequency_mhz(), stopped_at);
        scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_releases_source() {
        let source = synthetic();
        let display = DisplayPublisher::new();
        let mut scheduler = UpdateScheduler::start(
            fast_config(),
            source.clone(),
            controller_for(&source),
            pipeline(Box::new(CountingSink(Arc::new(AtomicUsize::new(0))))),
            display,
        );
        scheduler.close().await;
        let err = source.lock().unwrap().read(16).unwrap_err();
        assert!(matches!(err, SourceError::DeviceDisconnected));
    }
}
