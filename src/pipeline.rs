use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::connection::{ConnectionMonitor, ConnectionStatus, LIVENESS_CHECK_MS, STALE_AFTER_MS};
use crate::decoder::decode;
use crate::error::{PResult, PipelineError};
use crate::export::{ExportJob, ExportWriter};
use crate::ingress::{IngressQueue, MAX_PENDING};
use crate::live_status::LiveStatus;
use crate::normalizer::normalize;
use crate::recorder::{Recorder, RecorderStatus};
use crate::scheduler::{ChannelSelection, FlushBatch, FlushOutput, Orientation, Scheduler, MAX_PER_TICK};
use crate::transport::TransportEvent;
use crate::window::WindowConfig;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Tunables for the pipeline task.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub flush_interval: Duration,
    pub max_pending: usize,
    pub max_per_tick: usize,
    pub stale_after_ms: i64,
    pub liveness_period: Duration,
    /// How often the live-status snapshot is refreshed.
    pub status_interval: Duration,
    /// Optional file the snapshot is also written to.
    pub status_path: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            flush_interval: Duration::from_millis(50),
            max_pending: MAX_PENDING,
            max_per_tick: MAX_PER_TICK,
            stale_after_ms: STALE_AFTER_MS,
            liveness_period: Duration::from_millis(LIVENESS_CHECK_MS),
            status_interval: Duration::from_secs(2),
            status_path: None,
        }
    }
}

/// What the display side receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    Flush(FlushBatch),
    Orientation(Orientation),
    Status(ConnectionStatus),
    Recorder(RecorderStatus),
    Exported { path: String, rows: usize },
    NothingToExport,
    Rejected { reason: String },
}

/// Consumer of display events. Implementations must not block.
pub trait DisplaySink: Send + Sync {
    fn deliver(&self, event: DisplayEvent);
}

/// `"all"` or an explicit list of sensor ids.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ChannelList {
    Keyword(String),
    Ids(Vec<String>),
}

/// Runtime control, as sent by display clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    SetWindow { seconds: i64 },
    SetRate { hz: i64 },
    Select { channels: ChannelList },
    Pause,
    Resume,
    RecordStart,
    RecordStop,
    Export,
}

impl Command {
    pub fn parse(text: &str) -> PResult<Self> {
        serde_json::from_str(text).map_err(|e| PipelineError::InvalidParameters(e.to_string()))
    }
}

/// Counters reported in the live status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub payloads: u64,
    pub payload_errors: u64,
    pub envelopes_skipped: u64,
    pub readings_rejected: u64,
    pub samples_accepted: u64,
}

/// All mutable pipeline state. Owned by exactly one task.
pub struct Pipeline {
    device_id: String,
    config: WindowConfig,
    queue: IngressQueue,
    scheduler: Scheduler,
    recorder: Recorder,
    connection: ConnectionMonitor,
    exporter: Option<Arc<dyn ExportWriter>>,
    pending_export: Option<ExportJob>,
    counters: PipelineCounters,
    started_at_ms: i64,
}

impl Pipeline {
    pub fn new(
        device_id: &str,
        config: WindowConfig,
        settings: &PipelineSettings,
        connection: ConnectionMonitor,
    ) -> Self {
        Pipeline {
            device_id: device_id.to_string(),
            config,
            queue: IngressQueue::with_limit(settings.max_pending),
            scheduler: Scheduler::new(&config).with_max_per_tick(settings.max_per_tick),
            recorder: Recorder::new(),
            connection,
            exporter: None,
            pending_export: None,
            counters: PipelineCounters::default(),
            started_at_ms: now_ms(),
        }
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn ExportWriter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_selection(mut self, selection: ChannelSelection) -> Self {
        self.scheduler.set_selection(selection);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn queue(&self) -> &IngressQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn connection(&self) -> &ConnectionMonitor {
        &self.connection
    }

    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    /// Decode one payload, normalize every reading it carries, capture it if
    /// recording and enqueue it for the next flush.
    ///
    /// Returns the number of samples accepted. A malformed payload is an error
    /// and leaves every buffer untouched.
    pub fn ingest_payload(&mut self, payload: &str, now_ms: i64) -> PResult<usize> {
        self.counters.payloads += 1;
        let decoded = match decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.counters.payload_errors += 1;
                return Err(e);
            }
        };
        self.counters.envelopes_skipped += decoded.skipped as u64;

        let mut accepted = 0;
        for raw in &decoded.readings {
            match normalize(raw) {
                Some(sample) => {
                    self.recorder.record(&sample);
                    self.queue.enqueue(sample);
                    accepted += 1;
                }
                None => {
                    self.counters.readings_rejected += 1;
                    log::trace!("[PIPELINE] Rejected {} reading with ts {}", raw.id(), raw.ts());
                }
            }
        }

        if accepted > 0 {
            self.counters.samples_accepted += accepted as u64;
            self.connection.on_sample(now_ms);
        }
        Ok(accepted)
    }

    /// Apply a transport notification. Returns a status event when the
    /// connection state moved.
    pub fn handle_transport(&mut self, event: TransportEvent, now_ms: i64) -> Option<DisplayEvent> {
        let before = self.connection.state();
        match event {
            TransportEvent::Opened => self.connection.on_open(now_ms),
            TransportEvent::Reconnecting => self.connection.on_reconnect_attempt(),
            TransportEvent::Error(reason) => {
                log::debug!("[PIPELINE] Transport error: {reason}");
                self.connection.on_error();
            }
            TransportEvent::Message(payload) => {
                if let Err(e) = self.ingest_payload(&payload, now_ms) {
                    log::debug!("[PIPELINE] Dropping payload: {e}");
                }
            }
        }
        (self.connection.state() != before).then(|| DisplayEvent::Status(self.connection.status()))
    }

    /// Run one flush tick and hand the results to `sink`.
    pub fn flush(&mut self, sink: &dyn DisplaySink) -> FlushOutput {
        let output = self.scheduler.tick(&self.config, &mut self.queue);
        for batch in &output.batches {
            sink.deliver(DisplayEvent::Flush(batch.clone()));
        }
        // Orientation dials stay live while the plots are paused.
        if let Some(orientation) = output.orientation {
            sink.deliver(DisplayEvent::Orientation(orientation));
        }
        output
    }

    /// Apply a control command, returning the events it produced.
    ///
    /// `Export` only prepares the write; collect it with [`Pipeline::take_export`].
    pub fn apply(&mut self, command: Command, now_ms: i64) -> PResult<Vec<DisplayEvent>> {
        log::debug!("[PIPELINE] Command {command:?}");
        let mut events = Vec::new();
        match command {
            Command::SetWindow { seconds } => self.config.set_window_seconds(seconds),
            Command::SetRate { hz } => self.config.set_rate_hz(hz),
            Command::Select { channels } => {
                let selection = match &channels {
                    ChannelList::Keyword(spec) => ChannelSelection::parse(spec)?,
                    ChannelList::Ids(ids) => ChannelSelection::from_ids(ids.iter().map(String::as_str))?,
                };
                self.scheduler.set_selection(selection);
            }
            Command::Pause => self.scheduler.set_paused(true),
            Command::Resume => self.scheduler.set_paused(false),
            Command::RecordStart => {
                self.recorder.start(now_ms);
                log::info!("[PIPELINE] Recording started");
                events.push(DisplayEvent::Recorder(self.recorder.status()));
            }
            Command::RecordStop => {
                if self.recorder.stop() {
                    log::info!("[PIPELINE] Recording stopped with {} rows", self.recorder.len());
                }
                events.push(DisplayEvent::Recorder(self.recorder.status()));
            }
            Command::Export => match self.export_job()? {
                Some(job) => {
                    log::info!("[EXPORT] Exporting {} rows", job.rows());
                    self.pending_export = Some(job);
                }
                None => events.push(DisplayEvent::NothingToExport),
            },
        }
        Ok(events)
    }

    /// Snapshot the current recording for writing. `None` when there is
    /// nothing to export.
    pub fn export_job(&self) -> PResult<Option<ExportJob>> {
        let Some(export) = self.recorder.export() else {
            log::info!("[EXPORT] Nothing to export");
            return Ok(None);
        };
        let writer = self
            .exporter
            .clone()
            .ok_or_else(|| PipelineError::Export("no export writer configured".to_string()))?;
        Ok(Some(ExportJob::new(writer, export, &self.device_id)))
    }

    /// The export requested by the last `Export` command, if any.
    pub fn take_export(&mut self) -> Option<ExportJob> {
        self.pending_export.take()
    }

    pub fn snapshot(&self, now_ms: i64) -> LiveStatus {
        LiveStatus {
            timestamp: now_ms as f64 / 1e3,
            uptime_seconds: ((now_ms - self.started_at_ms).max(0) / 1000) as u64,
            device_id: self.device_id.clone(),
            connection: self.connection.status(),
            window_seconds: self.config.window_seconds(),
            rate_hz: self.config.rate_hz(),
            capacity: self.config.capacity(),
            paused: self.scheduler.is_paused(),
            selection: self.scheduler.selection().clone(),
            queue_len: self.queue.len(),
            queue_limit: self.queue.max_pending(),
            queue_dropped: self.queue.dropped(),
            counters: self.counters,
            recorder: self.recorder.status(),
            channels: self.scheduler.window().all_stats(),
        }
    }

    /// Drive the pipeline until the transport side closes.
    ///
    /// Exports run on the blocking pool and report back through `sink` when
    /// done. An active recording is stopped and exported before returning.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
        sink: Arc<dyn DisplaySink>,
        settings: PipelineSettings,
        status: Arc<RwLock<LiveStatus>>,
    ) -> Self {
        let mut flush = interval(settings.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status_tick = interval(settings.status_interval);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut exports = JoinSet::new();

        log::info!(
            "[PIPELINE] Running: window {}s at {} Hz, flush every {:?}",
            self.config.window_seconds(),
            self.config.rate_hz(),
            settings.flush_interval
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(update) = self.handle_transport(event, now_ms()) {
                            sink.deliver(update);
                        }
                    }
                    None => {
                        log::info!("[PIPELINE] Transport closed, shutting down");
                        break;
                    }
                },
                Some(command) = commands.recv() => {
                    match self.apply(command, now_ms()) {
                        Ok(updates) => updates.into_iter().for_each(|e| sink.deliver(e)),
                        Err(e) => {
                            if e.is_recoverable() {
                                log::warn!("[PIPELINE] Command rejected: {e}");
                            } else {
                                log::error!("[PIPELINE] Command failed: {e}");
                            }
                            sink.deliver(DisplayEvent::Rejected { reason: e.to_string() });
                        }
                    }
                    if let Some(job) = self.take_export() {
                        let sink = sink.clone();
                        exports.spawn(async move { sink.deliver(export_event(job.run().await)) });
                    }
                }
                Some(joined) = exports.join_next(), if !exports.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("[EXPORT] Export task panicked: {e}");
                    }
                }
                _ = flush.tick() => {
                    self.flush(sink.as_ref());
                }
                _ = status_tick.tick() => {
                    self.publish_status(&status, settings.status_path.as_ref()).await;
                }
            }
        }

        while let Some(joined) = exports.join_next().await {
            if let Err(e) = joined {
                log::error!("[EXPORT] Export task panicked: {e}");
            }
        }
        self.shutdown().await;
        self.publish_status(&status, settings.status_path.as_ref()).await;
        self
    }

    async fn publish_status(&self, status: &RwLock<LiveStatus>, path: Option<&PathBuf>) {
        let snapshot = self.snapshot(now_ms());
        if let Some(path) = path {
            if let Err(e) = snapshot.save(path).await {
                log::warn!("[PIPELINE] Failed to write status to {}: {e}", path.display());
            }
        }
        *status.write().await = snapshot;
    }

    /// Stop and export an active recording.
    pub async fn shutdown(&mut self) {
        if !self.recorder.stop() {
            return;
        }
        log::info!("[PIPELINE] Saving active recording ({} rows)", self.recorder.len());
        let result = match self.export_job() {
            Ok(Some(job)) => job.run().await,
            Ok(None) => return,
            Err(e) => Err(e),
        };
        match result {
            Ok((path, rows)) => log::info!("[EXPORT] Saved {rows} rows to {}", path.display()),
            Err(e) => log::error!("[EXPORT] Final export failed: {e}"),
        }
    }
}

fn export_event(result: PResult<(PathBuf, usize)>) -> DisplayEvent {
    match result {
        Ok((path, rows)) => DisplayEvent::Exported {
            path: path.display().to_string(),
            rows,
        },
        Err(e) => {
            log::error!("[EXPORT] {e}");
            DisplayEvent::Rejected { reason: e.to_string() }
        }
    }
}

/// Translate a Ctrl-C into a cleared `running` flag.
pub async fn shutdown_signal(running: Arc<AtomicBool>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("[PIPELINE] Ctrl-C received, stopping"),
        Err(e) => log::error!("[PIPELINE] Failed to listen for Ctrl-C: {e}"),
    }
    running.store(false, Ordering::Relaxed);
}
