// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! opendaq-stream-echo - Echo openDAQ streaming signals in real-time
//!
//! Connects to a streaming server, subscribes to the requested signals
//! (all available ones by default) and prints every data message.

use chrono::Local;
use clap::Parser;
use colored::*;
use opendaq_streaming::protocol::SignalMetadata;
use opendaq_streaming::signal::{DataRule, SampleType};
use opendaq_streaming::{ClientConfig, ConnectionStatus, ConstantValue, StreamSink, StreamingClient};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Echo openDAQ streaming signals in real-time
#[derive(Parser, Debug)]
#[command(name = "opendaq-stream-echo")]
#[command(version = "0.1.0")]
#[command(about = "Echo openDAQ streaming signals")]
struct Args {
    /// Signal ids to subscribe to (default: all available)
    signals: Vec<String>,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// WebSocket streaming port
    #[arg(short, long, default_value = "7414")]
    port: u16,

    /// Output format: pretty, compact, raw
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Maximum number of data messages to receive (0 = unlimited)
    #[arg(short = 'n', long, default_value = "0")]
    count: u64,

    /// Values printed per message in pretty mode
    #[arg(long, default_value = "8")]
    max_values: usize,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Quiet mode - only output data, no headers
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Library log filter: a level, `off`, or directives such as
    /// `opendaq_streaming::client=debug`
    #[arg(long, default_value = "off")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum OutputFormat {
    Pretty,
    Compact,
    Raw,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "compact" | "c" => Ok(OutputFormat::Compact),
            "raw" | "r" | "hex" => Ok(OutputFormat::Raw),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

fn main() {
    let args = Args::parse();

    // Handle color preference
    if args.no_color || !is_tty() {
        colored::control::set_override(false);
    }

    if let Some(filter) = log_filter(&args.log_level) {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    if let Err(e) = run_echo(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// `None` when logging is off or the directives do not parse.
fn log_filter(directives: &str) -> Option<EnvFilter> {
    if directives == "off" {
        return None;
    }
    EnvFilter::try_new(directives).ok()
}

fn run_echo(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let sink = Arc::new(EchoSink::new(args.format, args.max_values, args.quiet));
    let config = ClientConfig {
        host: args.host.clone(),
        streaming_port: args.port,
        client_id: format!("opendaq-stream-echo-{}", std::process::id()),
        ..Default::default()
    };

    let mut client = StreamingClient::new(config, sink.clone())?;
    client.connect()?;

    let wanted = if args.signals.is_empty() {
        client.available_signals()
    } else {
        args.signals.clone()
    };
    if wanted.is_empty() {
        return Err("server offers no signals".into());
    }

    if !args.quiet {
        print_header(args, &client, &wanted);
    }

    let ids: Vec<&str> = wanted.iter().map(String::as_str).collect();
    if let Err(e) = client.subscribe(&ids) {
        if !args.quiet {
            eprintln!("{}: {}", "Warning".yellow(), e);
        }
    }

    while running.load(Ordering::SeqCst) {
        if args.count > 0 && sink.received() >= args.count {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    client.stop();

    if !args.quiet {
        eprintln!(
            "\n{} Received {} message(s)",
            "---".dimmed(),
            sink.received()
        );
    }

    Ok(())
}

fn print_header(args: &Args, client: &StreamingClient, signals: &[String]) {
    eprintln!(
        "{} {} {}:{} (stream={}, api={})",
        ">>>".green().bold(),
        "Connected to".bold(),
        args.host.cyan(),
        args.port,
        client.stream_id().unwrap_or_default(),
        client.api_version().unwrap_or_default(),
    );
    for id in signals {
        eprintln!("    {}", id.cyan());
    }
    eprintln!("{}", "Press Ctrl+C to stop".dimmed());
    eprintln!();
}

/// Prints everything the client delivers.
struct EchoSink {
    format: OutputFormat,
    max_values: usize,
    quiet: bool,
    metadata: Mutex<HashMap<String, SignalMetadata>>,
    received: AtomicU64,
}

impl EchoSink {
    fn new(format: OutputFormat, max_values: usize, quiet: bool) -> Self {
        Self {
            format,
            max_values,
            quiet,
            metadata: Mutex::new(HashMap::new()),
            received: AtomicU64::new(0),
        }
    }

    fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }
}

impl StreamSink for EchoSink {
    fn on_status(&self, status: ConnectionStatus) {
        if !self.quiet {
            eprintln!("{} {}", "status".dimmed(), status.to_string().yellow());
        }
    }

    fn on_signal_metadata(&self, signal_id: &str, metadata: &SignalMetadata) {
        if !self.quiet {
            let d = &metadata.descriptor;
            eprintln!(
                "{} {} type={:?} rule={} table={}",
                "signal".dimmed(),
                signal_id.cyan(),
                d.sample_type,
                d.rule,
                metadata.table_id,
            );
        }
        if let Ok(mut map) = self.metadata.lock() {
            map.insert(signal_id.to_string(), metadata.clone());
        }
    }

    fn on_unsubscribed(&self, signal_id: &str) {
        if let Ok(mut map) = self.metadata.lock() {
            map.remove(signal_id);
        }
        if !self.quiet {
            eprintln!("{} {}", "unsubscribed".dimmed(), signal_id.cyan());
        }
    }

    fn on_data(&self, signal_id: &str, payload: &[u8]) {
        let seq = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        let descriptor = self
            .metadata
            .lock()
            .ok()
            .and_then(|map| map.get(signal_id).map(|m| m.descriptor.clone()));

        match self.format {
            OutputFormat::Pretty => {
                let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                println!(
                    "{} {} {} ({} bytes)",
                    format!("[{}]", timestamp).dimmed(),
                    format!("#{}", seq).yellow(),
                    signal_id.cyan(),
                    payload.len()
                );
                match descriptor {
                    Some(d) => println!(
                        "  {}",
                        decode_values(&d.rule, d.sample_type, payload, self.max_values)
                    ),
                    None => print_hex_dump(payload),
                }
            }
            OutputFormat::Compact => {
                let values = descriptor
                    .map(|d| decode_values(&d.rule, d.sample_type, payload, self.max_values))
                    .unwrap_or_else(|| format!("{} bytes", payload.len()));
                println!("#{} {}: {}", seq, signal_id, values);
            }
            OutputFormat::Raw => {
                println!("#{} {} ({} bytes)", seq, signal_id, payload.len());
                print_hex_dump(payload);
            }
        }
        let _ = io::stdout().flush();
    }
}

/// Render up to `max` values of a data payload.
fn decode_values(rule: &DataRule, sample_type: SampleType, payload: &[u8], max: usize) -> String {
    match rule {
        // Constant and linear signals carry {index, value} pairs.
        DataRule::Constant | DataRule::Linear { .. } => {
            let pairs: Vec<String> = payload
                .chunks_exact(16)
                .filter_map(ConstantValue::from_bytes)
                .take(max)
                .map(|cv| format!("[{}]={}", cv.index, cv.value))
                .collect();
            pairs.join(" ")
        }
        _ => {
            let size = sample_type.size();
            if size == 0 {
                return format!("{} bytes", payload.len());
            }
            let total = payload.len() / size;
            let mut out: Vec<String> = payload
                .chunks_exact(size)
                .take(max)
                .map(|chunk| format_sample(sample_type, chunk))
                .collect();
            if total > max {
                out.push(format!("... ({} samples)", total));
            }
            out.join(" ")
        }
    }
}

fn format_sample(sample_type: SampleType, b: &[u8]) -> String {
    fn arr<const N: usize>(b: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&b[..N]);
        out
    }

    match sample_type {
        SampleType::Float32 => format!("{:.4}", f32::from_le_bytes(arr(b))),
        SampleType::Float64 => format!("{:.6}", f64::from_le_bytes(arr(b))),
        SampleType::Int8 => i8::from_le_bytes(arr(b)).to_string(),
        SampleType::Int16 => i16::from_le_bytes(arr(b)).to_string(),
        SampleType::Int32 => i32::from_le_bytes(arr(b)).to_string(),
        SampleType::Int64 => i64::from_le_bytes(arr(b)).to_string(),
        SampleType::UInt8 => b[0].to_string(),
        SampleType::UInt16 => u16::from_le_bytes(arr(b)).to_string(),
        SampleType::UInt32 => u32::from_le_bytes(arr(b)).to_string(),
        SampleType::UInt64 => u64::from_le_bytes(arr(b)).to_string(),
        _ => b.iter().map(|x| format!("{:02x}", x)).collect(),
    }
}

fn print_hex_dump(data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        print!("  {:04x}  ", i * 16);

        for (j, byte) in chunk.iter().enumerate() {
            if j == 8 {
                print!(" ");
            }
            print!("{:02x} ", byte);
        }

        for j in chunk.len()..16 {
            if j == 8 {
                print!(" ");
            }
            print!("   ");
        }

        print!(" |");
        for byte in chunk {
            print!(
                "{}",
                if *byte >= 0x20 && *byte < 0x7f {
                    *byte as char
                } else {
                    '.'
                }
            );
        }
        println!("|");
    }
}

fn is_tty() -> bool {
    use std::io::IsTerminal;
    io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter() {
        assert!(log_filter("off").is_none());
        assert!(log_filter("opendaq_streaming::client=debug").is_some());
        assert!(log_filter("opendaq_streaming=loud").is_none());
    }

    #[test]
    fn test_decode_explicit_values() {
        let mut payload = Vec::new();
        for v in [1.5f64, -2.0, 3.25] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            decode_values(&DataRule::Explicit, SampleType::Float64, &payload, 8),
            "1.500000 -2.000000 3.250000"
        );
        assert_eq!(
            decode_values(&DataRule::Explicit, SampleType::Float64, &payload, 1),
            "1.500000 ... (3 samples)"
        );
    }

    #[test]
    fn test_decode_constant_values() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&ConstantValue::new(0, 7).to_bytes());
        payload.extend_from_slice(&ConstantValue::new(12, -1).to_bytes());
        assert_eq!(
            decode_values(&DataRule::Constant, SampleType::Int64, &payload, 8),
            "[0]=7 [12]=-1"
        );
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("hex".parse::<OutputFormat>(), Ok(OutputFormat::Raw));
        assert!("json".parse::<OutputFormat>().is_err());
    }
}
