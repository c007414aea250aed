// SPDX-License-Identifier: MIT
//
// RDS Capture: Delay-Line Sensor Calibration and Trace Acquisition
// Copyright (c) 2025 RDS Capture Contributors

//! RDS Capture - host tool for the delay-line sensor rig
//!
//! Opens the board, calibrates the delay line and records the requested number
//! of traces into the dump directory.
//!
//! # Flow
//!
//! ```text
//! ┌──────────┐   connect   ┌─────────────┐   tap    ┌─────────────┐   dump   ┌──────────┐
//! │  Config  │ ──────────> │    Board    │ ───────> │   Session   │ ───────> │  Files   │
//! │ YAML/env │             │ (uart/sim)  │  search  │ (resilient) │          │ traces/  │
//! └──────────┘             └─────────────┘          └─────────────┘          └──────────┘
//! ```
//!
//! SIGINT/SIGTERM end a running calibration search, or finish the current
//! trace and flush the dumps; the session summary is written either way.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rds_core::{
    board::{Board, StreamBoard},
    calibration::{CalibrationMode, Calibrator},
    config::{CaptureConfig, Transport},
    crypto::Aes128Reference,
    link::SerialLink,
    metrics::Metrics,
    session::{AcquisitionSession, SessionSummary},
    sim::SimulatedDevice,
    sinks::{self, FileSinks},
};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rds-capture")]
#[command(about = "RDS Capture - calibrates the delay-line sensor and records power traces", long_about = None)]
struct Args {
    /// YAML configuration file (RDS_* environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,

    /// Override the number of traces to record
    #[arg(short = 'n', long)]
    traces: Option<u64>,
}

fn init_tracing(args: &Args) {
    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let builder = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true);

    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_board(config: &CaptureConfig) -> Result<Box<dyn Board>> {
    let board_config = config.stream_board_config();
    let board: Box<dyn Board> = match config.transport {
        Transport::Uart => {
            let link = SerialLink::open(&config.device_path)
                .with_context(|| format!("Failed to open {}", config.device_path.display()))?;
            Box::new(StreamBoard::new(link, board_config))
        }
        Transport::Sim => {
            warn!("Using the simulated board, no hardware involved");
            let device = SimulatedDevice::new(
                config.sim_config(),
                Box::new(Aes128Reference),
                SimulatedDevice::default_model(config.sensor_width),
            );
            Box::new(StreamBoard::new(device, board_config))
        }
    };
    Ok(board)
}

fn report(summary: &SessionSummary, metrics: &Metrics) {
    info!(
        "Session finished: {}/{} traces, {} fails, {} mismatches, {:.1}s",
        summary.traces, summary.requested, summary.fails, summary.mismatches, summary.elapsed_secs
    );
    info!(
        "Trace latency p50={:?}us p99={:?}us, {:.1} traces/s",
        metrics.latency_p50(),
        metrics.latency_p99(),
        metrics.traces_per_second()
    );
    if summary.stopped_early {
        warn!("Session was stopped before all traces were recorded");
    }
}

fn write_outputs(config: &CaptureConfig, summary: &SessionSummary, metrics: &Metrics) -> Result<()> {
    sinks::write_json(&config.dump_path.join("session.json"), summary)
        .context("Failed to write session summary")?;
    std::fs::write(config.dump_path.join("metrics.prom"), metrics.prometheus_format())
        .context("Failed to write metrics")?;
    Ok(())
}

fn run(config: CaptureConfig) -> Result<()> {
    let metrics = Metrics::new();
    let policy = config.retry_policy();
    let started_at = Utc::now();

    std::fs::create_dir_all(&config.dump_path)
        .with_context(|| format!("Failed to create {}", config.dump_path.display()))?;

    // Covers the calibration search as well as acquisition
    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop)).context("Failed to install signal handler")?;
    }

    let mut board = open_board(&config)?;
    policy
        .execute(|| board.connect())
        .context("Failed to initialise the board")?;

    // Calibration
    let mode = config.calibration_mode()?;
    let persist = config.calibration_output();
    let calibration = match Calibrator::new(&mut *board, config.search_params()?, policy.clone())
        .with_metrics(metrics.clone())
        .with_stop_flag(Arc::clone(&stop))
        .run(&mode, Some(persist.as_path()))
    {
        Ok(report) => report,
        Err(rds_core::Error::Interrupted) => {
            warn!("Stopped during calibration, no traces recorded");
            let summary = SessionSummary::stopped_before_start(config.num_traces, started_at);
            return write_outputs(&config, &summary, &metrics);
        }
        Err(e) => return Err(e).context("Calibration failed"),
    };
    if let Some(tap) = calibration.tap {
        info!("Calibration search settled on {} ({} link failures)", tap, calibration.failures);
    } else if mode != CalibrationMode::Skip {
        info!("Calibration applied to {} sensor(s)", calibration.words.len());
    }

    // Acquisition
    let sink = FileSinks::create(&config.sink_options()).context("Failed to create dump files")?;
    let mut session = AcquisitionSession::new(
        board,
        sink,
        Aes128Reference,
        StdRng::from_entropy(),
        config.session_config()?,
    )
    .with_retry_policy(policy)
    .with_metrics(metrics.clone())
    .with_stop_flag(stop);

    let summary = session.run().context("Acquisition failed")?;
    report(&summary, &metrics);
    write_outputs(&config, &summary, &metrics)?;

    info!("Dumps written to {}", config.dump_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("RDS Capture v{}", rds_core::VERSION);

    let mut config = CaptureConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(traces) = args.traces {
        config.num_traces = traces;
        config.validate().context("Invalid configuration")?;
    }
    info!(
        "Transport {:?}, {} traces, calibration {:?}, dumping to {}",
        config.transport,
        config.num_traces,
        config.calibration_mode,
        config.dump_path.display()
    );

    if let Err(e) = run(config) {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
