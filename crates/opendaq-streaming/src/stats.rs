// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Streaming server statistics.
//!
//! Counters are updated from the I/O thread and from whatever thread
//! delivers signal packets, so everything is atomic.
//!
//! ```
//! use opendaq_streaming::ServerStats;
//!
//! let stats = ServerStats::new();
//! stats.record_connection_accepted();
//! stats.record_data_sent(64);
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.connections_accepted, 1);
//! assert_eq!(snapshot.data_bytes_sent, 64);
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Server-wide counters.
#[derive(Debug)]
pub struct ServerStats {
    /// TCP connections accepted on any port
    connections_accepted: AtomicU64,

    /// Connections refused because of the connection limit
    connections_refused: AtomicU64,

    /// Successful WebSocket upgrades
    upgrades: AtomicU64,

    /// Currently established streaming connections
    active_sessions: AtomicUsize,

    /// Control requests answered (200 or 400)
    control_requests: AtomicU64,

    /// Control requests answered with 400
    control_failures: AtomicU64,

    /// Subscribed clients removed after a write/metadata failure
    clients_dropped: AtomicU64,

    data_messages_sent: AtomicU64,
    data_bytes_sent: AtomicU64,
    metadata_messages_sent: AtomicU64,
    metadata_bytes_sent: AtomicU64,

    /// Frames larger than the read buffer
    oversized_frames: AtomicU64,

    /// Native config-protocol packets handled
    config_packets: AtomicU64,

    start_time: Instant,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            upgrades: AtomicU64::new(0),
            active_sessions: AtomicUsize::new(0),
            control_requests: AtomicU64::new(0),
            control_failures: AtomicU64::new(0),
            clients_dropped: AtomicU64::new(0),
            data_messages_sent: AtomicU64::new(0),
            data_bytes_sent: AtomicU64::new(0),
            metadata_messages_sent: AtomicU64::new(0),
            metadata_bytes_sent: AtomicU64::new(0),
            oversized_frames: AtomicU64::new(0),
            config_packets: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upgrade(&self) {
        self.upgrades.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        // Saturate at 0 in case stop() races a close.
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_control_request(&self, ok: bool) {
        self.control_requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.control_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_client_dropped(&self) {
        self.clients_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_data_sent(&self, bytes: usize) {
        self.data_messages_sent.fetch_add(1, Ordering::Relaxed);
        self.data_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_metadata_sent(&self, bytes: usize) {
        self.metadata_messages_sent.fetch_add(1, Ordering::Relaxed);
        self.metadata_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_oversized_frame(&self) {
        self.oversized_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_packet(&self) {
        self.config_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            control_requests: self.control_requests.load(Ordering::Relaxed),
            control_failures: self.control_failures.load(Ordering::Relaxed),
            clients_dropped: self.clients_dropped.load(Ordering::Relaxed),
            data_messages_sent: self.data_messages_sent.load(Ordering::Relaxed),
            data_bytes_sent: self.data_bytes_sent.load(Ordering::Relaxed),
            metadata_messages_sent: self.metadata_messages_sent.load(Ordering::Relaxed),
            metadata_bytes_sent: self.metadata_bytes_sent.load(Ordering::Relaxed),
            oversized_frames: self.oversized_frames.load(Ordering::Relaxed),
            config_packets: self.config_packets.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Clone, Debug, Default)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub upgrades: u64,
    pub active_sessions: usize,
    pub control_requests: u64,
    pub control_failures: u64,
    pub clients_dropped: u64,
    pub data_messages_sent: u64,
    pub data_bytes_sent: u64,
    pub metadata_messages_sent: u64,
    pub metadata_bytes_sent: u64,
    pub oversized_frames: u64,
    pub config_packets: u64,
    pub uptime_secs: f64,
}

impl ServerStatsSnapshot {
    /// Data throughput in bytes/second since start.
    pub fn data_byte_rate(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            self.data_bytes_sent as f64 / self.uptime_secs
        } else {
            0.0
        }
    }
}
