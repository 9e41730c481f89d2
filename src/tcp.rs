use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::node::NodeMetadata;
use crate::request::RequestInfo;

/// Lifecycle of a tracked TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpConnectionState {
    /// Connection established, no payload bytes seen yet.
    Open,
    /// At least one byte observed in either direction.
    Connected,
    /// Close notification received; terminal.
    Closed,
}

impl TcpConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

/// Per-connection record tracked between periodic reports.
#[derive(Debug, Clone)]
pub struct TcpRecord {
    pub request: RequestInfo,
    /// Peer identity from metadata exchange; absent until resolved.
    pub peer: Option<NodeMetadata>,
    pub state: TcpConnectionState,
    /// Whether the connection-open event has been reported.
    pub open_logged: bool,
    pub last_activity: SystemTime,
}

impl TcpRecord {
    /// Whether a periodic sweep should report this record now.
    ///
    /// Without peer metadata the sweep waits for metadata exchange, unless
    /// a non-zero response flag signals an error state, in which case the
    /// record is reported immediately with a best-effort identity.
    pub fn should_report(&self) -> bool {
        self.peer.is_some() || self.request.response_flag_bits != 0
    }

    /// Whether the record has been idle past the given timeout.
    pub fn is_idle(&self, now: SystemTime, timeout: Duration) -> bool {
        now.duration_since(self.last_activity)
            .map(|idle| idle > timeout)
            .unwrap_or(false)
    }
}

/// Tracks request-info lifecycles of open TCP connections, keyed by
/// connection id.
///
/// The tracker owns only state transitions and bookkeeping; the worker
/// drives the periodic sweep and performs the actual reporting so the
/// record data flows through the same dimensioning path as HTTP.
#[derive(Debug, Default)]
pub struct TcpRecordTracker {
    records: HashMap<u64, TcpRecord>,
}

impl TcpRecordTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection in the `Open` state. The opened counter
    /// is seeded so the first report accounts for the connection.
    pub fn open(&mut self, id: u64, now: SystemTime) {
        self.records.insert(
            id,
            TcpRecord {
                request: RequestInfo {
                    tcp_connections_opened: 1,
                    ..Default::default()
                },
                peer: None,
                state: TcpConnectionState::Open,
                open_logged: false,
                last_activity: now,
            },
        );
    }

    /// Accounts bytes received from downstream and marks the connection
    /// `Connected`.
    pub fn downstream_data(&mut self, id: u64, bytes: u64, now: SystemTime) {
        if let Some(record) = self.records.get_mut(&id) {
            record.request.tcp_received_bytes += bytes;
            record.state = TcpConnectionState::Connected;
            record.last_activity = now;
        }
    }

    /// Accounts bytes sent upstream and marks the connection `Connected`.
    pub fn upstream_data(&mut self, id: u64, bytes: u64, now: SystemTime) {
        if let Some(record) = self.records.get_mut(&id) {
            record.request.tcp_sent_bytes += bytes;
            record.state = TcpConnectionState::Connected;
            record.last_activity = now;
        }
    }

    /// Stores the peer identity resolved through metadata exchange.
    pub fn set_peer(&mut self, id: u64, peer: NodeMetadata, now: SystemTime) {
        if let Some(record) = self.records.get_mut(&id) {
            record.peer = Some(peer);
            record.last_activity = now;
        }
    }

    /// Merges request attributes observed by the host (service fields,
    /// principals, response flags) into the tracked record.
    pub fn update_request(&mut self, id: u64, update: impl FnOnce(&mut RequestInfo)) {
        if let Some(record) = self.records.get_mut(&id) {
            update(&mut record.request);
        }
    }

    /// Removes the record for a closing connection, accounting the close.
    /// Returns the final record for the terminal report.
    pub fn close(&mut self, id: u64) -> Option<TcpRecord> {
        let mut record = self.records.remove(&id)?;
        record.state = TcpConnectionState::Closed;
        record.request.tcp_connections_closed += 1;
        Some(record)
    }

    /// Removes a record without reporting (sweep eviction).
    pub fn evict(&mut self, id: u64) -> Option<TcpRecord> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&TcpRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut TcpRecord> {
        self.records.get_mut(&id)
    }

    /// Connection ids currently tracked.
    pub fn ids(&self) -> Vec<u64> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops all records. Used on shutdown and reconfigure.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
