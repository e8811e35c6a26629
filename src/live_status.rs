use serde::Serialize;
use std::path::Path;

use crate::connection::{ConnectionMonitor, ConnectionStatus};
use crate::ingress::MAX_PENDING;
use crate::pipeline::PipelineCounters;
use crate::recorder::RecorderStatus;
use crate::scheduler::ChannelSelection;
use crate::window::{ChannelStats, WindowConfig};

/// Point-in-time view of the pipeline, served at `/status` and optionally
/// written to disk.
#[derive(Serialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub device_id: String,
    pub connection: ConnectionStatus,
    // Window
    pub window_seconds: u32,
    pub rate_hz: u32,
    pub capacity: usize,
    pub paused: bool,
    pub selection: ChannelSelection,
    // Ingress
    pub queue_len: usize,
    pub queue_limit: usize,
    pub queue_dropped: u64,
    pub counters: PipelineCounters,
    pub recorder: RecorderStatus,
    pub channels: Vec<ChannelStats>,
}

impl LiveStatus {
    pub fn new() -> Self {
        let config = WindowConfig::default();
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            device_id: String::new(),
            connection: ConnectionMonitor::new().status(),
            window_seconds: config.window_seconds(),
            rate_hz: config.rate_hz(),
            capacity: config.capacity(),
            paused: false,
            selection: ChannelSelection::All,
            queue_len: 0,
            queue_limit: MAX_PENDING,
            queue_dropped: 0,
            counters: PipelineCounters::default(),
            recorder: RecorderStatus {
                active: false,
                rows: 0,
                started_at_ms: None,
            },
            channels: Vec::new(),
        }
    }

    /// Written off the calling task so a slow disk never delays the flush tick.
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock seconds since the Unix epoch.
pub fn current_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1e3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;

    #[test]
    fn test_default_status() {
        let status = LiveStatus::default();
        assert_eq!(status.connection.state, ConnectionState::Connecting);
        assert_eq!(status.capacity, 120);
        assert!(status.timestamp > 0.0);
    }

    #[test]
    fn test_timestamp_is_wall_clock_seconds() {
        let now = chrono::Utc::now().timestamp() as f64;
        assert!((current_timestamp() - now).abs() < 5.0);
    }

    #[tokio::test]
    async fn test_save_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_status.json");
        LiveStatus::new().save(&path).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["connection"]["state"], "connecting");
        assert_eq!(json["selection"], "all");
        assert_eq!(json["recorder"]["active"], false);
        assert_eq!(json["queue_limit"], 10_000);
    }
}
