use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;

use telemetry_stream_rs::connection::{liveness_task, ConnectionMonitor};
use telemetry_stream_rs::dashboard::{start_dashboard, BroadcastSink, DashboardState, CLIENT_BACKLOG};
use telemetry_stream_rs::export::{writer_for, ExportFormat};
use telemetry_stream_rs::live_status::LiveStatus;
use telemetry_stream_rs::pipeline::{
    now_ms, shutdown_signal, Command, DisplayEvent, DisplaySink, Pipeline, PipelineSettings,
};
use telemetry_stream_rs::scheduler::ChannelSelection;
use telemetry_stream_rs::transport::{resolve_bind, udp_transport};
use telemetry_stream_rs::window::WindowConfig;

#[derive(Parser, Debug)]
#[command(name = "telemetry_stream")]
#[command(about = "Live sensor telemetry pipeline with sliding-window display and recording", long_about = None)]
struct Args {
    /// Address to receive gateway datagrams on
    #[arg(long, default_value = "0.0.0.0")]
    udp_addr: String,

    /// UDP port to receive gateway datagrams on
    #[arg(long, default_value_t = 8099)]
    udp_port: u16,

    /// Address for the dashboard server
    #[arg(long, default_value = "0.0.0.0")]
    http_addr: String,

    /// Dashboard server port
    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    /// Display window length in seconds (1-10)
    #[arg(long, default_value_t = 2)]
    window_secs: i64,

    /// Expected sample rate per channel in Hz (1-240)
    #[arg(long, default_value_t = 60)]
    rate_hz: i64,

    /// Channels to display: `all` or a comma separated list (accel,gyro,...)
    #[arg(long, default_value = "all")]
    channels: String,

    /// Flush tick in milliseconds
    #[arg(long, default_value_t = 50)]
    flush_ms: u64,

    /// Device identifier used in export file names
    #[arg(long, default_value = "gateway")]
    device_id: String,

    /// Directory exports and the status file are written to
    #[arg(long, default_value = "telemetry_sessions")]
    output_dir: PathBuf,

    /// Export artifact format
    #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
    export_format: ExportFormat,

    /// Gzip JSON exports
    #[arg(long)]
    gzip: bool,

    /// Start recording immediately
    #[arg(long)]
    record: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let udp_bind = resolve_bind(&args.udp_addr, args.udp_port)?;
    let http_bind = resolve_bind(&args.http_addr, args.http_port)?;
    let selection = ChannelSelection::parse(&args.channels)?;
    let config = WindowConfig::new(args.window_secs, args.rate_hz);
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    let settings = PipelineSettings {
        flush_interval: Duration::from_millis(args.flush_ms.max(1)),
        status_path: Some(args.output_dir.join("live_status.json")),
        ..PipelineSettings::default()
    };

    log::info!("Telemetry stream starting");
    log::info!("  UDP:       {udp_bind}");
    log::info!("  Dashboard: http://{http_bind}");
    log::info!(
        "  Window:    {}s at {} Hz ({} points/channel)",
        config.window_seconds(),
        config.rate_hz(),
        config.capacity()
    );
    log::info!("  Output:    {}", args.output_dir.display());

    let running = Arc::new(AtomicBool::new(true));
    let monitor = ConnectionMonitor::with_threshold(settings.stale_after_ms);
    let sink = BroadcastSink::new(CLIENT_BACKLOG);
    let status = Arc::new(RwLock::new(LiveStatus::new()));

    let (event_tx, event_rx) = mpsc::channel(1024);
    let (command_tx, command_rx) = mpsc::channel(64);

    let mut pipeline = Pipeline::new(&args.device_id, config, &settings, monitor.clone())
        .with_exporter(writer_for(args.export_format, &args.output_dir, args.gzip))
        .with_selection(selection);
    if args.record {
        pipeline.apply(Command::RecordStart, now_ms())?;
    }

    tokio::spawn(shutdown_signal(running.clone()));
    let transport = tokio::spawn(udp_transport(udp_bind, event_tx, running.clone()));

    let liveness_sink = sink.clone();
    let liveness = tokio::spawn(liveness_task(monitor, settings.liveness_period, move |status| {
        liveness_sink.deliver(DisplayEvent::Status(status));
    }));

    let dashboard_state = DashboardState {
        sink: sink.clone(),
        commands: command_tx,
        status: status.clone(),
    };
    let dashboard = tokio::spawn(async move {
        if let Err(e) = start_dashboard(dashboard_state, http_bind).await {
            log::error!("[DASHBOARD] Server stopped: {e}");
        }
    });

    let pipeline = pipeline
        .run(event_rx, command_rx, Arc::new(sink), settings, status)
        .await;

    running.store(false, Ordering::Relaxed);
    transport.await.ok();
    liveness.abort();
    dashboard.abort();

    let counters = pipeline.counters();
    log::info!(
        "Stopped: {} payloads, {} samples accepted, {} dropped from queue",
        counters.payloads,
        counters.samples_accepted,
        pipeline.queue().dropped()
    );
    Ok(())
}
