use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::Sender;
use tokio::time::{sleep, Duration, Instant};

use crate::error::{PResult, PipelineError};
use crate::frame::{frames_to_payload, looks_binary};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const POLL_RUNNING: Duration = Duration::from_millis(100);

/// Notifications the transport pushes to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Error(String),
    Reconnecting,
}

/// Resolve `addr:port` to the first IPv4 socket address.
pub fn resolve_bind(addr: &str, port: u16) -> PResult<SocketAddr> {
    (addr, port)
        .to_socket_addrs()
        .map_err(|e| PipelineError::Transport(format!("failed to resolve {addr}:{port}: {e}")))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| PipelineError::Transport(format!("no IPv4 address for {addr}:{port}")))
}

/// Text for the decoder: binary frames become envelopes, anything else must
/// be UTF-8. `None` when nothing in the datagram is usable.
pub fn datagram_payload(bytes: &[u8]) -> Option<String> {
    if looks_binary(bytes) {
        return frames_to_payload(bytes);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(text.to_owned()),
        Err(e) => {
            log::warn!("[UDP] Dropping non-UTF-8 datagram: {e}");
            None
        }
    }
}

/// Receive one payload per datagram and forward it as `TransportEvent`s.
///
/// Socket failures are reported as `Error`, followed by a retry after one
/// second announced with `Reconnecting`. Returns when `running` is cleared or
/// the receiving side of `tx` is gone.
pub async fn udp_transport(bind: SocketAddr, tx: Sender<TransportEvent>, running: Arc<AtomicBool>) {
    let mut rate = DataRateCounter::default();
    let mut first_attempt = true;

    while running.load(Ordering::Relaxed) {
        if !first_attempt && tx.send(TransportEvent::Reconnecting).await.is_err() {
            return;
        }
        first_attempt = false;

        log::trace!("[UDP] Binding {bind}");
        let socket = match UdpSocket::bind(bind).await {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("[UDP] Failed to bind {bind}: {e}");
                if tx.send(TransportEvent::Error(e.to_string())).await.is_err() {
                    return;
                }
                sleep(RETRY_DELAY).await;
                continue;
            }
        };

        log::info!("[UDP] Listening on {bind}");
        if tx.send(TransportEvent::Opened).await.is_err() {
            return;
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        while running.load(Ordering::Relaxed) {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((size, _src)) => {
                        if let Some((value, unit)) = rate.update(size) {
                            log::info!("[UDP] Receiving data rate: {value:.3} {unit}");
                        }
                        if let Some(payload) = datagram_payload(&buf[..size]) {
                            if tx.send(TransportEvent::Message(payload)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("[UDP] Receive failed: {e}");
                        if tx.send(TransportEvent::Error(e.to_string())).await.is_err() {
                            return;
                        }
                        sleep(RETRY_DELAY).await;
                        break;
                    }
                },
                _ = sleep(POLL_RUNNING) => {}
            }
        }
    }
    log::trace!("[UDP] Stopping listener");
}

/// Rolling byte-rate estimate, reported once per period.
#[derive(Debug)]
pub struct DataRateCounter {
    bytes: usize,
    since: Instant,
    period: Duration,
}

impl Default for DataRateCounter {
    fn default() -> Self {
        DataRateCounter {
            bytes: 0,
            since: Instant::now(),
            period: Duration::from_secs(1),
        }
    }
}

impl DataRateCounter {
    /// Count `bytes`. Once per period returns the bit rate and its unit.
    pub fn update(&mut self, bytes: usize) -> Option<(f64, &'static str)> {
        self.bytes += bytes;
        let elapsed = self.since.elapsed();
        if elapsed < self.period {
            return None;
        }
        let bits = (std::mem::take(&mut self.bytes) * 8) as f64;
        self.since = Instant::now();
        Some(scale_rate(bits / elapsed.as_secs_f64()))
    }
}

fn scale_rate(bps: f64) -> (f64, &'static str) {
    match bps {
        b if b >= 1024.0 * 1024.0 => (b / 1024.0 / 1024.0, "mbps"),
        b if b >= 1024.0 => (b / 1024.0, "kbps"),
        b => (b, "bps"),
    }
}
