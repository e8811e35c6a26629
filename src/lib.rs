//! Sensor telemetry stream pipeline.
//!
//! Text payloads (or binary frames) from a device gateway are decoded into readings, normalized
//! into timestamped samples, queued, and flushed on a fixed tick into
//! per-channel sliding windows for live display. A recorder captures every
//! accepted sample for export.

pub mod connection;
pub mod dashboard;
pub mod decoder;
pub mod error;
pub mod export;
pub mod frame;
pub mod ingress;
pub mod live_status;
pub mod normalizer;
pub mod pipeline;
pub mod recorder;
pub mod scheduler;
pub mod transport;
pub mod types;
pub mod window;

pub use connection::{ConnectionMonitor, ConnectionState, ConnectionStatus};
pub use decoder::{decode, Decoded};
pub use error::{PResult, PipelineError};
pub use pipeline::{Command, DisplayEvent, DisplaySink, Pipeline, PipelineSettings};
pub use types::{NormalizedSample, RawReading, Reading, SensorId, VectorFields};
pub use window::WindowConfig;
