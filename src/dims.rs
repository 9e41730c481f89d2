use std::ops::{Index, IndexMut};

use crate::node::NodeMetadata;
use crate::request::RequestInfo;

/// Placeholder value for standard dimensions with no observed value.
pub const UNKNOWN_VALUE: &str = "unknown";

/// Standard dimensions, in export order.
///
/// The discriminant is the slot index in a [`DimensionVector`]; custom
/// expression-derived dimensions are appended after
/// [`STANDARD_TAG_COUNT`]. Slot assignments are fixed for the lifetime of
/// a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StdTag {
    Reporter,
    SourceWorkload,
    SourceWorkloadNamespace,
    SourcePrincipal,
    SourceApp,
    SourceVersion,
    SourceCanonicalService,
    SourceCanonicalRevision,
    DestinationWorkload,
    DestinationWorkloadNamespace,
    DestinationPrincipal,
    DestinationApp,
    DestinationVersion,
    DestinationService,
    DestinationServiceName,
    DestinationServiceNamespace,
    DestinationCanonicalService,
    DestinationCanonicalRevision,
    RequestProtocol,
    ResponseCode,
    GrpcResponseStatus,
    ResponseFlags,
    ConnectionSecurityPolicy,
}

/// All standard dimensions in slot order.
pub const STANDARD_TAGS: [StdTag; 23] = [
    StdTag::Reporter,
    StdTag::SourceWorkload,
    StdTag::SourceWorkloadNamespace,
    StdTag::SourcePrincipal,
    StdTag::SourceApp,
    StdTag::SourceVersion,
    StdTag::SourceCanonicalService,
    StdTag::SourceCanonicalRevision,
    StdTag::DestinationWorkload,
    StdTag::DestinationWorkloadNamespace,
    StdTag::DestinationPrincipal,
    StdTag::DestinationApp,
    StdTag::DestinationVersion,
    StdTag::DestinationService,
    StdTag::DestinationServiceName,
    StdTag::DestinationServiceNamespace,
    StdTag::DestinationCanonicalService,
    StdTag::DestinationCanonicalRevision,
    StdTag::RequestProtocol,
    StdTag::ResponseCode,
    StdTag::GrpcResponseStatus,
    StdTag::ResponseFlags,
    StdTag::ConnectionSecurityPolicy,
];

/// Number of standard dimension slots.
pub const STANDARD_TAG_COUNT: usize = STANDARD_TAGS.len();

impl StdTag {
    /// Returns the exported tag name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reporter => "reporter",
            Self::SourceWorkload => "source_workload",
            Self::SourceWorkloadNamespace => "source_workload_namespace",
            Self::SourcePrincipal => "source_principal",
            Self::SourceApp => "source_app",
            Self::SourceVersion => "source_version",
            Self::SourceCanonicalService => "source_canonical_service",
            Self::SourceCanonicalRevision => "source_canonical_revision",
            Self::DestinationWorkload => "destination_workload",
            Self::DestinationWorkloadNamespace => "destination_workload_namespace",
            Self::DestinationPrincipal => "destination_principal",
            Self::DestinationApp => "destination_app",
            Self::DestinationVersion => "destination_version",
            Self::DestinationService => "destination_service",
            Self::DestinationServiceName => "destination_service_name",
            Self::DestinationServiceNamespace => "destination_service_namespace",
            Self::DestinationCanonicalService => "destination_canonical_service",
            Self::DestinationCanonicalRevision => "destination_canonical_revision",
            Self::RequestProtocol => "request_protocol",
            Self::ResponseCode => "response_code",
            Self::GrpcResponseStatus => "grpc_response_status",
            Self::ResponseFlags => "response_flags",
            Self::ConnectionSecurityPolicy => "connection_security_policy",
        }
    }
}

/// Reporter direction relative to the proxied workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    Outbound,
    #[default]
    Inbound,
}

impl TrafficDirection {
    pub const fn is_outbound(self) -> bool {
        matches!(self, Self::Outbound)
    }

    /// Value of the `reporter` dimension for this direction.
    pub const fn reporter_value(self) -> &'static str {
        match self {
            Self::Outbound => "source",
            Self::Inbound => "destination",
        }
    }
}

/// The per-request composite cache key: one string value per declared
/// dimension.
///
/// A worker owns exactly one live vector, mutates it in place for each
/// request and hands the stat cache an owned clone on a miss. Slot count
/// and tag identity are fixed once a configuration is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DimensionVector {
    values: Vec<String>,
}

impl DimensionVector {
    /// Creates a vector with `len` empty slots.
    pub fn with_len(len: usize) -> Self {
        Self {
            values: vec![String::new(); len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sets an arbitrary slot by index. Out-of-range writes are ignored so
    /// a stale schema reference cannot panic the hot path.
    pub fn set(&mut self, slot: usize, value: impl Into<String>) {
        if let Some(v) = self.values.get_mut(slot) {
            *v = value.into();
        }
    }

    /// Returns the value at `slot`, or an empty string when out of range.
    pub fn get(&self, slot: usize) -> &str {
        self.values.get(slot).map(String::as_str).unwrap_or("")
    }
}

impl Index<StdTag> for DimensionVector {
    type Output = String;

    fn index(&self, tag: StdTag) -> &String {
        &self.values[tag as usize]
    }
}

impl IndexMut<StdTag> for DimensionVector {
    fn index_mut(&mut self, tag: StdTag) -> &mut String {
        &mut self.values[tag as usize]
    }
}

/// Request-derived dimensions as an ordered `{tag, accessor}` table.
const REQUEST_TAGS: [(StdTag, fn(&RequestInfo) -> String); 8] = [
    (StdTag::SourcePrincipal, |r| r.source_principal.clone()),
    (StdTag::DestinationPrincipal, |r| {
        r.destination_principal.clone()
    }),
    (StdTag::DestinationService, |r| {
        r.destination_service_host.clone()
    }),
    (StdTag::DestinationServiceName, |r| {
        r.destination_service_name.clone()
    }),
    (StdTag::RequestProtocol, |r| r.request_protocol.clone()),
    (StdTag::ResponseCode, |r| r.response_code_value()),
    (StdTag::ResponseFlags, |r| r.response_flags.clone()),
    (StdTag::ConnectionSecurityPolicy, |r| {
        r.security_policy.as_str().to_string()
    }),
];

/// Fills the source- or destination-side identity dimensions from node
/// metadata. All affected slots are written, clearing stale values.
pub fn fill_node(vector: &mut DimensionVector, is_source: bool, node: &NodeMetadata) {
    if is_source {
        vector[StdTag::SourceWorkload] = node.workload_name.clone();
        vector[StdTag::SourceWorkloadNamespace] = node.namespace.clone();
        vector[StdTag::SourceApp] = node.label("app").unwrap_or("").to_string();
        vector[StdTag::SourceVersion] = node.label("version").unwrap_or("").to_string();
        vector[StdTag::SourceCanonicalService] = node.canonical_service().to_string();
        vector[StdTag::SourceCanonicalRevision] = node.canonical_revision().to_string();
    } else {
        vector[StdTag::DestinationWorkload] = node.workload_name.clone();
        vector[StdTag::DestinationWorkloadNamespace] = node.namespace.clone();
        vector[StdTag::DestinationApp] = node.label("app").unwrap_or("").to_string();
        vector[StdTag::DestinationVersion] = node.label("version").unwrap_or("").to_string();
        vector[StdTag::DestinationCanonicalService] = node.canonical_service().to_string();
        vector[StdTag::DestinationCanonicalRevision] = node.canonical_revision().to_string();
        vector[StdTag::DestinationServiceNamespace] = node.namespace.clone();
    }
}

/// Fills the peer side of the vector. An outbound reporter's peer is the
/// destination; an inbound reporter's peer is the source.
pub fn fill_peer(vector: &mut DimensionVector, outbound: bool, peer: &NodeMetadata) {
    fill_node(vector, !outbound, peer);
}

/// Fills request-derived dimensions, including the gRPC status slot which
/// is blanked for non-gRPC traffic.
pub fn fill_request(vector: &mut DimensionVector, request: &RequestInfo) {
    for (tag, accessor) in REQUEST_TAGS {
        vector[tag] = accessor(request);
    }

    if request.request_protocol == "grpc" {
        vector[StdTag::GrpcResponseStatus] =
            request.grpc_status.unwrap_or_default().to_string();
    } else {
        vector[StdTag::GrpcResponseStatus] = String::new();
    }
}

/// Replaces empty standard slots with the `unknown` placeholder. The gRPC
/// status slot stays empty for non-gRPC traffic.
pub fn fill_unknown_if_empty(vector: &mut DimensionVector) {
    for tag in STANDARD_TAGS {
        if tag == StdTag::GrpcResponseStatus {
            continue;
        }
        if vector[tag].is_empty() {
            vector[tag] = UNKNOWN_VALUE.to_string();
        }
    }
}
