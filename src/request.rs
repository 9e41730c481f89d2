use std::time::Duration;

/// Connection security policy negotiated for a request, as reported by the
/// host proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPolicy {
    #[default]
    Unknown,
    None,
    MutualTls,
}

impl SecurityPolicy {
    /// Returns the lower-case dimension value for this policy.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::None => "none",
            Self::MutualTls => "mutual_tls",
        }
    }
}

/// Per-request (or per-connection) attributes handed over by the host proxy.
///
/// This is a plain owned snapshot: the engine never reaches back into the
/// host's stream objects. HTTP requests populate the request/response fields;
/// TCP connections accumulate into the `tcp_*` counters between reports.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub source_principal: String,
    pub destination_principal: String,
    pub destination_service_host: String,
    pub destination_service_name: String,

    /// Protocol as observed by the host ("http", "grpc", ...). Matched
    /// case-insensitively wherever it is classified.
    pub request_protocol: String,

    pub response_code: u32,
    /// Response class injected by the host via filter state (e.g. "2xx").
    /// Preferred over `response_code` for dimensioning when non-empty.
    pub response_class: String,
    /// Short response flags string (e.g. "UF", "-").
    pub response_flags: String,
    /// Raw response flag bits. Non-zero signals an error state on the
    /// connection and unblocks deferred TCP reporting.
    pub response_flag_bits: u64,

    /// gRPC status code, present only for gRPC traffic.
    pub grpc_status: Option<u32>,

    /// Operation id injected by the host via filter state, may be empty.
    pub operation_id: String,

    pub security_policy: SecurityPolicy,

    pub duration: Duration,
    pub request_size: u64,
    pub response_size: u64,

    pub tcp_sent_bytes: u64,
    pub tcp_received_bytes: u64,
    pub tcp_connections_opened: u64,
    pub tcp_connections_closed: u64,
}

impl RequestInfo {
    /// Dimension value for the response code: the host-provided response
    /// class when present, otherwise the numeric code.
    pub fn response_code_value(&self) -> String {
        if self.response_class.is_empty() {
            self.response_code.to_string()
        } else {
            self.response_class.clone()
        }
    }

    /// Resets the interval-scoped TCP counters after a periodic report so
    /// the next interval does not double count.
    pub fn clear_tcp_counters(&mut self) {
        self.tcp_connections_opened = 0;
        self.tcp_sent_bytes = 0;
        self.tcp_received_bytes = 0;
    }
}
