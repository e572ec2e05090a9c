// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! openDAQ Streaming Server
//!
//! Serves a simulated device over the WebSocket streaming protocol, with
//! the HTTP control port and the native config channel alongside.
//!
//! # Usage
//!
//! ```bash
//! # Default ports (7414 data, 7438 control, 7420 config)
//! opendaq-streaming-server
//!
//! # Faster simulation, echo linear domain interruptions
//! opendaq-streaming-server --rate 10000 --linear-writer echo
//!
//! # Write the effective configuration and exit
//! opendaq-streaming-server --dump-config server.json
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use opendaq_streaming::{LinearWriterMode, ServerConfig, StreamingServer};

mod device;

use device::SimulatedDevice;

/// openDAQ Streaming Server - simulated device over WebSocket streaming
#[derive(Parser, Debug)]
#[command(name = "opendaq-streaming-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// WebSocket streaming port
    #[arg(short = 'p', long, default_value = "7414")]
    streaming_port: u16,

    /// HTTP control port
    #[arg(long, default_value = "7438")]
    control_port: u16,

    /// Native config-protocol port
    #[arg(long, default_value = "7420")]
    config_port: u16,

    /// Do not serve the native config protocol
    #[arg(long)]
    no_config_channel: bool,

    /// Linear writer mode (noop, echo)
    #[arg(long, default_value = "noop")]
    linear_writer: String,

    /// Simulated sample rate in Hz
    #[arg(short, long, default_value = "1000")]
    rate: u32,

    /// Block period in milliseconds
    #[arg(long, default_value = "100")]
    block_ms: u64,

    /// Statistics log interval in seconds (0 = off)
    #[arg(long, default_value = "10")]
    stats_interval: u64,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    dump_config: Option<PathBuf>,

    /// Log filter: a level (trace, debug, info, warn, error) or directives
    /// such as `opendaq_streaming=debug,info`
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_linear_writer(value: &str) -> Result<LinearWriterMode, String> {
    match value {
        "noop" => Ok(LinearWriterMode::Noop),
        "echo" => Ok(LinearWriterMode::Echo),
        other => Err(format!("unknown linear writer mode '{}'", other)),
    }
}

/// Filter from `--log-level`; invalid directives fall back to `info`.
fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(&args.log_level))
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if args.rate == 0 {
        return Err("sample rate must be > 0".into());
    }

    // Load or create config
    let config = if let Some(config_path) = &args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::from_file(config_path)?
    } else {
        ServerConfig {
            bind_address: args.bind.parse()?,
            streaming_port: args.streaming_port,
            control_port: args.control_port,
            config_port: args.config_port,
            config_channel_enabled: !args.no_config_channel,
            linear_writer: parse_linear_writer(&args.linear_writer)?,
            ..Default::default()
        }
    };

    if let Some(path) = &args.dump_config {
        config.to_file(path)?;
        info!("Configuration written to {:?}", path);
        return Ok(());
    }

    let sim = SimulatedDevice::new(args.rate);
    let mut server = StreamingServer::new(sim.device(), config)?;
    let addrs = server.start()?;

    info!("+----------------------------------------------------+");
    info!(
        "|       openDAQ Streaming Server v{}              |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Streaming: {:37} |", addrs.streaming);
    info!("|  Control:   {:37} |", addrs.control);
    info!(
        "|  Config:    {:37} |",
        addrs
            .config
            .map(|a| a.to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
    info!("|  Rate:      {:37} |", format!("{} Hz", args.rate));
    info!(
        "|  Linear:    {:37} |",
        format!("{:?}", server.config().linear_writer).to_lowercase()
    );
    info!("+----------------------------------------------------+");
    for id in server.available_signals() {
        info!("  signal {}", id);
    }

    // Handle shutdown signals
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let generator = sim.spawn_generator(
        args.rate,
        Duration::from_millis(args.block_ms.max(1)),
        running.clone(),
    )?;

    let stats_interval = Duration::from_secs(args.stats_interval);
    let mut last_stats = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));

        if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
            last_stats = Instant::now();
            let s = server.stats().snapshot();
            info!(
                "sessions={} accepted={} refused={} control={}/{} data={} msgs ({:.1} KiB/s) dropped={}",
                s.active_sessions,
                s.connections_accepted,
                s.connections_refused,
                s.control_requests - s.control_failures,
                s.control_requests,
                s.data_messages_sent,
                s.data_byte_rate() / 1024.0,
                s.clients_dropped,
            );
        }
    }

    info!("Shutdown signal received, stopping server...");
    if generator.join().is_err() {
        warn!("Generator thread panicked");
    }
    server.stop();
    info!("Server stopped");

    Ok(())
}
