//! The per-stream recording worker.
//!
//! One native thread per stream. The worker owns its input session, its
//! continuity state, its retry counter, and at most one open catalog row;
//! nothing recording-related is shared between streams. It sequences
//! segments through the segment writer, rotates output files on wall-clock
//! boundaries, and keeps the catalog consistent with what's on disk.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use recording_catalog::{Catalog, StreamConfig};
use shutdown_coordinator::{ComponentId, ComponentKind, ComponentState, ShutdownCoordinator};
use tracing::{debug, error, info, warn};

use crate::input::{InputOpener, RtspOpener};
use crate::segment::{record_segment, ContinuityState, SegmentOptions};

/// Teardown priority recorders register with.
pub const RECORDER_PRIORITY: u8 = 10;

/// Ceiling on the failure backoff.
const MAX_BACKOFF_SECS: u64 = 30;

/// Exponent cap: backoff grows 1, 2, 4, 8, 16 and then stays at 16.
const BACKOFF_EXPONENT_CAP: u32 = 4;

/// After this many consecutive failures the input session is dropped so
/// the next attempt reopens the RTSP connection from scratch.
const FORCE_RECONNECT_AFTER: u32 = 5;

/// Poll interval while idling on a URL with no usable video.
const IDLE_CONFIG_POLL: Duration = Duration::from_secs(5);

/// Default deadline for joining a stopping worker.
pub const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Stop signal observed by a worker and its segment writer: raised either
/// for this recorder alone or by the process-wide shutdown latch.
#[derive(Clone)]
pub struct StopSignal {
    local: Arc<AtomicBool>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl StopSignal {
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self {
            local: Arc::new(AtomicBool::new(false)),
            coordinator,
        }
    }

    pub fn raise(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.local.load(Ordering::SeqCst) || self.coordinator.is_shutdown_initiated()
    }
}

/// Handle to a running recorder thread.
pub struct RecorderHandle {
    name: String,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl RecorderHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latch the stop flag without waiting.
    pub fn request_stop(&self) {
        self.stop.raise();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the worker and wait up to `deadline` for it to exit. Returns
    /// false if the worker missed the deadline and was detached; a
    /// detached worker still releases its own resources when it exits.
    pub fn stop(mut self, deadline: Duration) -> bool {
        self.stop.raise();
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let start = Instant::now();
        while start.elapsed() < deadline {
            if thread.is_finished() {
                let _ = thread.join();
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        warn!(
            stream = %self.name,
            "recorder did not stop within deadline, detaching thread"
        );
        false
    }
}

/// Spawn a recorder for `config`, reading RTSP over the given runtime.
pub fn spawn_recorder(
    config: StreamConfig,
    catalog: Arc<Catalog>,
    coordinator: Arc<ShutdownCoordinator>,
    runtime: tokio::runtime::Handle,
) -> std::io::Result<RecorderHandle> {
    spawn_with_opener(config, catalog, coordinator, RtspOpener::new(runtime))
}

pub(crate) fn spawn_with_opener<O>(
    config: StreamConfig,
    catalog: Arc<Catalog>,
    coordinator: Arc<ShutdownCoordinator>,
    opener: O,
) -> std::io::Result<RecorderHandle>
where
    O: InputOpener + Send + 'static,
    O::Session: Send,
{
    let stop = StopSignal::new(Arc::clone(&coordinator));
    let component = coordinator.register(&config.name, ComponentKind::StreamRecorder, RECORDER_PRIORITY);
    let name = config.name.clone();
    let worker_stop = stop.clone();
    let thread = thread::Builder::new()
        .name(format!("record-{}", config.name))
        .spawn(move || {
            let mut recorder = StreamRecorder {
                config,
                catalog,
                coordinator,
                component,
                opener,
                stop: worker_stop,
                session: None,
                continuity: ContinuityState::default(),
                current_path: PathBuf::new(),
                current_id: None,
                retries: 0,
                last_rotation: 0,
            };
            recorder.run();
        })?;
    Ok(RecorderHandle {
        name,
        stop,
        thread: Some(thread),
    })
}

struct StreamRecorder<O: InputOpener> {
    config: StreamConfig,
    catalog: Arc<Catalog>,
    coordinator: Arc<ShutdownCoordinator>,
    component: ComponentId,
    opener: O,
    stop: StopSignal,
    session: Option<O::Session>,
    continuity: ContinuityState,
    current_path: PathBuf,
    current_id: Option<i64>,
    /// Consecutive failure count, owned by this recorder alone.
    retries: u32,
    last_rotation: i64,
}

impl<O: InputOpener> StreamRecorder<O> {
    fn run(&mut self) {
        let stream = self.config.name.clone();
        info!(stream = %stream, url = %self.config.url, "recorder starting");
        self.coordinator
            .update_state(self.component, ComponentState::Running);

        if let Err(e) = std::fs::create_dir_all(&self.config.output_dir) {
            error!(
                stream = %stream,
                dir = %self.config.output_dir.display(),
                error = %e,
                "cannot create output directory, recorder exiting"
            );
            self.coordinator
                .update_state(self.component, ComponentState::Stopped);
            return;
        }

        let now = Local::now();
        self.current_path = self.segment_path(&now);
        self.current_id = self.begin_row(now.timestamp());
        self.last_rotation = now.timestamp();

        while !self.stop.is_raised() {
            if !self.refresh_config() {
                break;
            }

            let now = Local::now();
            if now.timestamp() - self.last_rotation >= i64::from(self.config.segment_duration) {
                self.rotate(&now);
            }

            let options = SegmentOptions::new(
                Duration::from_secs(u64::from(self.config.segment_duration)),
                self.config.record_audio,
            );
            let result = record_segment(
                &self.opener,
                &self.config.url,
                &self.current_path,
                &mut self.session,
                &mut self.continuity,
                &options,
                &self.stop,
            );

            match result {
                Ok(outcome) => {
                    self.update_open_size();
                    if outcome.discard_input {
                        // Continuity dies with the connection.
                        self.session = None;
                        self.continuity = ContinuityState::default();
                    }
                    if outcome.failed() {
                        self.backoff();
                    } else if self.retries > 0 {
                        info!(stream = %stream, retries = self.retries, "recording recovered");
                        self.retries = 0;
                    }
                    if outcome.shutdown {
                        break;
                    }
                }
                Err(e) if e.is_fatal_for_url() => {
                    error!(
                        stream = %stream,
                        error = %e,
                        "unrecoverable for this URL, idling until configuration changes"
                    );
                    self.idle_until_config_change();
                }
                Err(e) => {
                    warn!(stream = %stream, error = %e, "segment recording failed");
                    self.backoff();
                }
            }
        }

        self.seal_current(Local::now().timestamp());
        info!(stream = %stream, "recorder stopped");
        self.coordinator
            .update_state(self.component, ComponentState::Stopped);
    }

    /// Re-read the effective configuration; changes apply only here, at a
    /// segment boundary. Returns false when the recorder should stop.
    fn refresh_config(&mut self) -> bool {
        let cfg = match self.catalog.get_stream_config(&self.config.name) {
            Ok(Some(cfg)) => cfg,
            Ok(None) => {
                warn!(stream = %self.config.name, "stream removed from catalog, stopping");
                return false;
            }
            Err(e) => {
                warn!(stream = %self.config.name, error = %e, "failed to read stream config");
                return true;
            }
        };
        if !cfg.enabled {
            info!(stream = %self.config.name, "stream disabled, stopping at segment boundary");
            return false;
        }
        if cfg.segment_duration != self.config.segment_duration {
            info!(
                stream = %self.config.name,
                old = self.config.segment_duration,
                new = cfg.segment_duration,
                "segment duration updated"
            );
            self.config.segment_duration = cfg.segment_duration;
        }
        if cfg.record_audio != self.config.record_audio {
            info!(
                stream = %self.config.name,
                record_audio = cfg.record_audio,
                "audio recording setting updated"
            );
            self.config.record_audio = cfg.record_audio;
        }
        // URL and output directory changes need a restart; the supervisor
        // stops this recorder and spawns a fresh one.
        true
    }

    fn segment_path(&self, now: &chrono::DateTime<Local>) -> PathBuf {
        self.config
            .output_dir
            .join(format!("recording_{}.mp4", now.format("%Y%m%d_%H%M%S")))
    }

    /// Rotate to a new output file. The new catalog row opens before the
    /// old one seals so the stream never has zero open rows.
    fn rotate(&mut self, now: &chrono::DateTime<Local>) {
        let ts = now.timestamp();
        let new_path = self.segment_path(now);
        debug!(
            stream = %self.config.name,
            path = %new_path.display(),
            "rotating to new segment file"
        );
        let new_id = match self.catalog.begin_recording(&self.config.name, &new_path, ts) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(
                    stream = %self.config.name,
                    error = %e,
                    "failed to open catalog row, file will be untracked until next startup"
                );
                None
            }
        };
        self.seal_current(ts);
        self.current_path = new_path;
        self.current_id = new_id;
        self.last_rotation = ts;
    }

    fn begin_row(&self, ts: i64) -> Option<i64> {
        match self
            .catalog
            .begin_recording(&self.config.name, &self.current_path, ts)
        {
            Ok(id) => {
                debug!(stream = %self.config.name, id, "opened recording row");
                Some(id)
            }
            Err(e) => {
                error!(
                    stream = %self.config.name,
                    error = %e,
                    "failed to open catalog row, file will be untracked until next startup"
                );
                None
            }
        }
    }

    /// Seal the open row with the on-disk size, or 0 if the file can't be
    /// read.
    fn seal_current(&mut self, ts: i64) {
        let Some(id) = self.current_id.take() else {
            return;
        };
        let size = match std::fs::metadata(&self.current_path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(
                    stream = %self.config.name,
                    path = %self.current_path.display(),
                    error = %e,
                    "failed to stat recording, sealing with size 0"
                );
                0
            }
        };
        match self.catalog.update_recording(id, ts, size, true) {
            Ok(()) => info!(
                stream = %self.config.name,
                id,
                size,
                path = %self.current_path.display(),
                "sealed recording"
            ),
            Err(e) => error!(stream = %self.config.name, id, error = %e, "failed to seal recording row"),
        }
    }

    fn update_open_size(&self) {
        let Some(id) = self.current_id else { return };
        if let Ok(meta) = std::fs::metadata(&self.current_path) {
            if let Err(e) = self.catalog.update_size(id, meta.len()) {
                warn!(stream = %self.config.name, id, error = %e, "failed to update recording size");
            }
        }
    }

    fn backoff(&mut self) {
        let delay = (1u64 << self.retries.min(BACKOFF_EXPONENT_CAP)).min(MAX_BACKOFF_SECS);
        self.retries += 1;
        if self.retries > FORCE_RECONNECT_AFTER && self.session.is_some() {
            warn!(
                stream = %self.config.name,
                retries = self.retries,
                "repeated failures, forcing a fresh RTSP connection"
            );
            self.session = None;
            self.continuity = ContinuityState::default();
        }
        info!(
            stream = %self.config.name,
            delay_secs = delay,
            retry = self.retries,
            "backing off before retry"
        );
        self.sleep_interruptible(Duration::from_secs(delay));
    }

    /// A URL with no usable video stays broken no matter how often we
    /// retry; sit still until the configuration row changes.
    fn idle_until_config_change(&mut self) {
        let baseline = self.config.clone();
        loop {
            self.sleep_interruptible(IDLE_CONFIG_POLL);
            if self.stop.is_raised() {
                return;
            }
            match self.catalog.get_stream_config(&baseline.name) {
                Ok(Some(cfg)) if cfg != baseline => {
                    info!(stream = %baseline.name, "configuration changed, leaving idle");
                    return;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return,
            }
        }
    }

    fn sleep_interruptible(&self, total: Duration) {
        let start = Instant::now();
        while start.elapsed() < total {
            if self.stop.is_raised() {
                return;
            }
            thread::sleep(Duration::from_millis(100).min(total.saturating_sub(start.elapsed())));
        }
    }
}
