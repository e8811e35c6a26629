use std::sync::{Arc, Mutex};

use telemetry_stream_rs::connection::{ConnectionMonitor, ConnectionState};
use telemetry_stream_rs::export::{CsvExportWriter, JsonExportWriter};
use telemetry_stream_rs::pipeline::{Command, DisplayEvent, DisplaySink, Pipeline, PipelineSettings};
use telemetry_stream_rs::transport::TransportEvent;
use telemetry_stream_rs::{SensorId, WindowConfig};

#[derive(Default)]
struct Collect(Mutex<Vec<DisplayEvent>>);

impl DisplaySink for Collect {
    fn deliver(&self, event: DisplayEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn envelope(ts_us: i64, variant: &str, values: [f64; 3]) -> String {
    format!(
        r#"{{"timestamp":{ts_us},"measurement":{{"{variant}":[{},{},{}]}}}}"#,
        values[0], values[1], values[2]
    )
}

#[test]
fn test_gateway_stream_end_to_end() {
    let monitor = ConnectionMonitor::new();
    let mut pipeline = Pipeline::new(
        "kiwi",
        WindowConfig::new(1, 10),
        &PipelineSettings::default(),
        monitor.clone(),
    );
    let dir = tempfile::tempdir().unwrap();
    pipeline = pipeline.with_exporter(Arc::new(CsvExportWriter::new(dir.path())));

    pipeline.handle_transport(TransportEvent::Opened, 0);
    pipeline.apply(Command::RecordStart, 1_700_000_000_000).unwrap();

    // 30 sample sets of 20 ms, microsecond device clock, one flush per set
    let sink = Collect::default();
    let base_us = 1_700_000_000_000_000i64;
    for i in 0..30 {
        let ts = base_us + i * 20_000;
        let batch = format!(
            "[{},{},{}]",
            envelope(ts, "Accel", [0.0, 0.0, 1.0]),
            envelope(ts, "Gyro", [0.1, 0.2, 0.0]),
            envelope(ts, "Baro", [25.0, 1013.25, 120.0]),
        );
        pipeline.handle_transport(TransportEvent::Message(batch), 10 + i);
        pipeline.flush(&sink);
    }
    assert_eq!(pipeline.counters().samples_accepted, 150);
    assert_eq!(monitor.last_sample_ms(), Some(39));
    assert!(pipeline.queue().is_empty());
    for sensor in [SensorId::Accel, SensorId::Gyro, SensorId::Temp] {
        assert_eq!(pipeline.scheduler().window().len(sensor), 10);
    }

    let newest: Vec<i64> = pipeline
        .scheduler()
        .window()
        .points(SensorId::Accel)
        .map(|p| p.ts_ms)
        .collect();
    assert_eq!(newest.first(), Some(&(1_700_000_000_000 + 20 * 20)));
    assert_eq!(newest.last(), Some(&(1_700_000_000_000 + 29 * 20)));

    let events = sink.0.lock().unwrap().clone();
    let orientation = events
        .iter()
        .rev()
        .find_map(|e| match e {
            DisplayEvent::Orientation(o) => Some(*o),
            _ => None,
        })
        .unwrap();
    // gyro is the last vector reading in each set
    assert_eq!(orientation.sensor, SensorId::Gyro);
    approx::assert_relative_eq!(orientation.fields.mag, 0.05f64.sqrt(), epsilon = 1e-12);
    let flushes = events
        .iter()
        .filter(|e| matches!(e, DisplayEvent::Flush(b) if b.sensor == SensorId::Accel))
        .count();
    assert_eq!(flushes, 30);

    pipeline.apply(Command::RecordStop, 0).unwrap();
    assert!(pipeline.apply(Command::Export, 0).unwrap().is_empty());
    let job = pipeline.take_export().unwrap();
    assert_eq!(job.rows(), 150);
    let out = job.write().unwrap();

    assert_eq!(out, dir.path().join("kiwi_20231114_221320"));
    let environment = std::fs::read_to_string(out.join("environment.csv")).unwrap();
    // header plus one joined row per baro envelope
    assert_eq!(environment.lines().count(), 31);
    assert_eq!(
        environment.lines().nth(1).unwrap(),
        "1700000000000,25,1013.25,120"
    );
    assert!(out.join("accel.csv").exists());
    assert!(out.join("gyro.csv").exists());
}

#[test]
fn test_stale_stream_recovers_on_data() {
    let monitor = ConnectionMonitor::new();
    let mut pipeline = Pipeline::new(
        "kiwi",
        WindowConfig::default(),
        &PipelineSettings::default(),
        monitor.clone(),
    );
    pipeline.handle_transport(TransportEvent::Opened, 1_000);
    assert_eq!(monitor.check_liveness(3_100), ConnectionState::Stale);

    let update = pipeline.handle_transport(
        TransportEvent::Message(envelope(1_700_000_000, "Mag", [1.0, 0.0, 0.0])),
        3_200,
    );
    assert!(matches!(update, Some(DisplayEvent::Status(s)) if s.state == ConnectionState::Connected));
    assert_eq!(monitor.reconnects(), 0);
}

#[test]
fn test_bad_payloads_do_not_disturb_buffers() {
    let mut pipeline = Pipeline::new(
        "kiwi",
        WindowConfig::default(),
        &PipelineSettings::default(),
        ConnectionMonitor::new(),
    )
    .with_exporter(Arc::new(JsonExportWriter::new(std::path::Path::new("unused"), false)));

    for payload in ["", "not json", "[1,2,3]", r#"{"timestamp":"soon"}"#] {
        pipeline.handle_transport(TransportEvent::Message(payload.to_string()), 0);
    }
    assert!(pipeline.queue().is_empty());
    assert_eq!(
        pipeline.apply(Command::Export, 0).unwrap(),
        vec![DisplayEvent::NothingToExport]
    );
}
