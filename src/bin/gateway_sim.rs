use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use telemetry_stream_rs::frame::{Frame, FrameKind};
use telemetry_stream_rs::pipeline::shutdown_signal;

/// Synthetic device gateway: streams accel, gyro, mag and baro readings over UDP,
/// as JSON envelopes or binary frames.
#[derive(Parser, Debug)]
#[command(name = "gateway_sim")]
struct Args {
    /// Address to send to
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Port to send to
    #[arg(short, long, default_value_t = 8099)]
    port: u16,

    /// Milliseconds between sample sets
    #[arg(long, default_value_t = 20)]
    interval_ms: u64,

    /// Pack each sample set into one datagram as a JSON list
    #[arg(long)]
    batch: bool,

    /// Send 24-byte binary frames instead of JSON text
    #[arg(long, conflicts_with = "batch")]
    binary: bool,

    /// Stop after this many seconds (0 = until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    duration: u64,
}

#[derive(Serialize, Debug, Clone, Copy)]
enum Measurement {
    Accel([f64; 3]),
    Gyro([f64; 3]),
    Mag([f64; 3]),
    Baro([f64; 3]),
}

impl Measurement {
    fn frame(self, timestamp: i64) -> Frame {
        let (kind, values) = match self {
            Measurement::Accel(v) => (FrameKind::Accel, v),
            Measurement::Gyro(v) => (FrameKind::Gyro, v),
            Measurement::Mag(v) => (FrameKind::Mag, v),
            Measurement::Baro(v) => (FrameKind::Baro, v),
        };
        Frame {
            kind,
            values: values.map(|v| v as f32),
            timestamp: timestamp.max(0) as u64,
        }
    }
}

#[derive(Serialize, Debug)]
struct Envelope {
    /// Microseconds since the Unix epoch.
    timestamp: i64,
    measurement: Measurement,
}

/// Point on a sphere of radius `g` whose polar and azimuth angles sweep with
/// the given periods.
fn sweep(elapsed: f64, theta_period: f64, phi_period: f64, g: f64) -> [f64; 3] {
    let theta = elapsed * 2.0 * PI / theta_period;
    let phi = elapsed * 2.0 * PI / phi_period;
    [
        theta.sin() * phi.cos() * g,
        theta.sin() * phi.sin() * g,
        theta.cos() * g,
    ]
}

fn sample_set(elapsed: f64) -> [Measurement; 4] {
    let g = (elapsed * 2.0 * PI / 30.0).sin() * 0.1 + 0.9;
    let field = (elapsed * 2.0 * PI / 30.0).sin() * 10.0 + 600.0;
    let omega = 2.0 * PI / 5.0;

    [
        Measurement::Accel(sweep(elapsed, 10.0, 2.0, g)),
        Measurement::Gyro([0.25 * (elapsed * omega).cos(), 0.25 * (elapsed * omega).sin(), 0.0]),
        Measurement::Mag(sweep(elapsed, 10.0, 3.0, field)),
        Measurement::Baro([
            (elapsed * 2.0 * PI / 15.0).sin() * 2.0 + 25.0,
            (elapsed * 2.0 * PI / 20.0).cos() * 20.0 + 1013.25,
            (elapsed * 2.0 * PI / 25.0).cos() * 50.0 + 120.0,
        ]),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let endpoint = format!("{}:{}", args.address, args.port);
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true).context("enabling broadcast")?;
    log::info!("[SIM] Sending to {endpoint} every {} ms", args.interval_ms);

    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(shutdown_signal(running.clone()));

    let start = Instant::now();
    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_report = Instant::now();
    let mut sent = 0u64;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let elapsed = start.elapsed().as_secs_f64();
        if args.duration > 0 && elapsed >= args.duration as f64 {
            break;
        }

        let timestamp = chrono::Utc::now().timestamp_micros();
        let envelopes: Vec<Envelope> = sample_set(elapsed)
            .into_iter()
            .map(|measurement| Envelope { timestamp, measurement })
            .collect();

        let payloads: Vec<Vec<u8>> = if args.binary {
            envelopes
                .iter()
                .map(|e| e.measurement.frame(e.timestamp).encode().to_vec())
                .collect()
        } else if args.batch {
            vec![serde_json::to_vec(&envelopes)?]
        } else {
            envelopes
                .iter()
                .map(serde_json::to_vec)
                .collect::<Result<Vec<_>, _>>()?
        };
        for payload in payloads {
            match socket.send_to(&payload, &endpoint).await {
                Ok(_) => sent += 1,
                Err(e) => log::warn!("[SIM] Send failed: {e}"),
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            log::info!(
                "[SIM] Packet rate: {:.2} packets/sec, elapsed: {:.2} s",
                sent as f64 / last_report.elapsed().as_secs_f64(),
                elapsed
            );
            last_report = Instant::now();
            sent = 0;
        }
    }

    log::info!("[SIM] Stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_stream_rs::decoder::decode;

    #[test]
    fn test_envelopes_decode() {
        let envelopes: Vec<Envelope> = sample_set(1.5)
            .into_iter()
            .map(|measurement| Envelope {
                timestamp: 1_700_000_000_000_000,
                measurement,
            })
            .collect();
        let decoded = decode(&serde_json::to_string(&envelopes).unwrap()).unwrap();
        // baro fans out into three readings
        assert_eq!(decoded.readings.len(), 6);
        assert_eq!(decoded.skipped, 0);
    }

    #[test]
    fn test_binary_frames_decode() {
        let timestamp = 1_700_000_000_000_000;
        let datagrams: Vec<[u8; 24]> = sample_set(1.5)
            .into_iter()
            .map(|m| m.frame(timestamp).encode())
            .collect();
        let readings: usize = datagrams
            .iter()
            .map(|d| {
                let payload = telemetry_stream_rs::transport::datagram_payload(d).unwrap();
                decode(&payload).unwrap().readings.len()
            })
            .sum();
        assert_eq!(readings, 6);
        assert_eq!(Frame::parse(&datagrams[3]).unwrap().kind, FrameKind::Baro);
    }

    #[test]
    fn test_sweep_radius() {
        let [x, y, z] = sweep(3.7, 10.0, 2.0, 0.95);
        approx::assert_relative_eq!((x * x + y * y + z * z).sqrt(), 0.95, epsilon = 1e-12);
    }
}
