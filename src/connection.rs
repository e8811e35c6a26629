use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// No accepted sample for longer than this marks a connected stream stale.
pub const STALE_AFTER_MS: i64 = 2_000;
/// How often the liveness task re-evaluates staleness.
pub const LIVENESS_CHECK_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Stale,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warn,
    Bad,
}

/// User-facing connection status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub severity: Severity,
    pub text: String,
    pub reconnects: u32,
    pub last_sample_ms: Option<i64>,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    reconnects: u32,
    last_sample_ms: Option<i64>,
    connected_at_ms: Option<i64>,
}

/// Liveness tracker for the upstream stream.
///
/// Cloning shares the same state, so the pipeline task and the liveness task
/// can each hold a handle.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    inner: Arc<Mutex<Inner>>,
    stale_after_ms: i64,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::with_threshold(STALE_AFTER_MS)
    }

    pub fn with_threshold(stale_after_ms: i64) -> Self {
        ConnectionMonitor {
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Connecting,
                reconnects: 0,
                last_sample_ms: None,
                connected_at_ms: None,
            })),
            stale_after_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // the guarded data is plain counters, a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn reconnects(&self) -> u32 {
        self.lock().reconnects
    }

    pub fn last_sample_ms(&self) -> Option<i64> {
        self.lock().last_sample_ms
    }

    /// Transport is retrying on its own.
    pub fn on_reconnect_attempt(&self) {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connecting {
            log::info!("[CONN] {:?} -> Connecting", inner.state);
        }
        inner.state = ConnectionState::Connecting;
    }

    pub fn on_open(&self, now_ms: i64) {
        let mut inner = self.lock();
        log::info!("[CONN] {:?} -> Connected", inner.state);
        inner.state = ConnectionState::Connected;
        inner.connected_at_ms = Some(now_ms);
    }

    pub fn on_error(&self) {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Connected | ConnectionState::Stale => {
                inner.reconnects += 1;
                inner.state = ConnectionState::Disconnected;
                log::warn!(
                    "[CONN] Transport error, disconnected (reconnects: {})",
                    inner.reconnects
                );
            }
            ConnectionState::Connecting => {
                // failed attempt, still counts toward the retry tally
                inner.reconnects += 1;
                inner.state = ConnectionState::Disconnected;
                log::warn!("[CONN] Transport error while connecting");
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// A sample was accepted into the pipeline.
    pub fn on_sample(&self, now_ms: i64) {
        let mut inner = self.lock();
        inner.last_sample_ms = Some(now_ms);
        if inner.state == ConnectionState::Stale {
            log::info!("[CONN] Data resumed, Stale -> Connected");
            inner.state = ConnectionState::Connected;
        }
    }

    /// Periodic liveness check. Returns the state after the check.
    pub fn check_liveness(&self, now_ms: i64) -> ConnectionState {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Connected {
            let reference = match (inner.last_sample_ms, inner.connected_at_ms) {
                (Some(sample), Some(open)) => Some(sample.max(open)),
                (sample, open) => sample.or(open),
            };
            if let Some(reference) = reference {
                let silence = now_ms - reference;
                if silence > self.stale_after_ms {
                    log::warn!("[CONN] No data for {:.1}s, marking stale", silence as f64 / 1e3);
                    inner.state = ConnectionState::Stale;
                }
            }
        }
        inner.state
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.lock();
        let (severity, text) = match inner.state {
            ConnectionState::Connecting => (Severity::Warn, "connecting…"),
            ConnectionState::Connected => (Severity::Ok, "connected"),
            ConnectionState::Stale => (Severity::Warn, "connected (stale…)"),
            ConnectionState::Disconnected => (Severity::Bad, "disconnected (auto-retrying…)"),
        };
        ConnectionStatus {
            state: inner.state,
            severity,
            text: text.to_string(),
            reconnects: inner.reconnects,
            last_sample_ms: inner.last_sample_ms,
        }
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// One liveness check. Returns the new status only when this check moved the
/// state; transitions made elsewhere (a sample reviving a stale stream) are
/// reported by whoever made them.
pub fn poll_liveness(monitor: &ConnectionMonitor, now_ms: i64) -> Option<ConnectionStatus> {
    let before = monitor.state();
    let after = monitor.check_liveness(now_ms);
    (after != before).then(|| monitor.status())
}

/// Liveness task. Runs on its own period, independent of the flush tick,
/// and calls `on_change` whenever a check moves the state.
pub async fn liveness_task<F>(monitor: ConnectionMonitor, period: Duration, mut on_change: F)
where
    F: FnMut(ConnectionStatus),
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Some(status) = poll_liveness(&monitor, chrono::Utc::now().timestamp_millis()) {
            on_change(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_connecting() {
        let monitor = ConnectionMonitor::new();
        assert_eq!(monitor.state(), ConnectionState::Connecting);
        assert_eq!(monitor.status().severity, Severity::Warn);
        assert_eq!(monitor.check_liveness(1_000_000), ConnectionState::Connecting);
    }

    #[test]
    fn test_stale_and_recover_without_transport_event() {
        let monitor = ConnectionMonitor::new();
        monitor.on_open(0);
        monitor.on_sample(1_000);
        assert_eq!(monitor.check_liveness(3_000), ConnectionState::Connected);
        assert_eq!(monitor.check_liveness(3_001), ConnectionState::Stale);
        assert_eq!(monitor.status().text, "connected (stale…)");

        monitor.on_sample(3_500);
        assert_eq!(monitor.state(), ConnectionState::Connected);
        assert_eq!(monitor.reconnects(), 0);
    }

    #[test]
    fn test_stale_without_any_sample() {
        let monitor = ConnectionMonitor::new();
        monitor.on_open(10_000);
        assert_eq!(monitor.check_liveness(11_000), ConnectionState::Connected);
        assert_eq!(monitor.check_liveness(12_001), ConnectionState::Stale);
    }

    #[test]
    fn test_error_counts_reconnects() {
        let monitor = ConnectionMonitor::new();
        monitor.on_open(0);
        monitor.on_error();
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert_eq!(monitor.status().severity, Severity::Bad);
        assert_eq!(monitor.reconnects(), 1);

        // repeated errors while already down do not double count
        monitor.on_error();
        assert_eq!(monitor.reconnects(), 1);

        // samples do not revive a disconnected stream
        monitor.on_sample(100);
        assert_eq!(monitor.state(), ConnectionState::Disconnected);

        monitor.on_reconnect_attempt();
        assert_eq!(monitor.state(), ConnectionState::Connecting);
        monitor.on_open(200);
        assert_eq!(monitor.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = ConnectionMonitor::new();
        let other = monitor.clone();
        other.on_open(0);
        assert_eq!(monitor.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_poll_reports_only_own_transitions() {
        let monitor = ConnectionMonitor::new();
        monitor.on_open(0);
        assert!(poll_liveness(&monitor, 1_000).is_none());

        let status = poll_liveness(&monitor, 2_500).unwrap();
        assert_eq!(status.state, ConnectionState::Stale);
        assert!(poll_liveness(&monitor, 3_000).is_none());

        // the pipeline revives the stream, the next check has nothing to add
        monitor.on_sample(3_100);
        assert!(poll_liveness(&monitor, 3_600).is_none());
        assert_eq!(monitor.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_liveness_task_reports_stale() {
        let monitor = ConnectionMonitor::with_threshold(-1);
        monitor.on_open(chrono::Utc::now().timestamp_millis());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(liveness_task(
            monitor.clone(),
            Duration::from_millis(LIVENESS_CHECK_MS),
            move |status| {
                let _ = tx.send(status);
            },
        ));

        let status = rx.recv().await.unwrap();
        assert_eq!(status.state, ConnectionState::Stale);
        task.abort();
    }
}
