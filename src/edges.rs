use std::collections::VecDeque;
use std::time::SystemTime;

use crate::node::{MeshIdentity, NodeMetadata, WorkloadInstance};
use crate::request::RequestInfo;

/// Protocol classification of an observed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeProtocol {
    Http,
    Https,
    Grpc,
    /// Fallback for anything not recognized as an L7 protocol.
    Tcp,
}

impl EdgeProtocol {
    /// Classifies a protocol string case-insensitively.
    pub fn classify(protocol: &str) -> Self {
        if protocol.eq_ignore_ascii_case("http") {
            Self::Http
        } else if protocol.eq_ignore_ascii_case("https") {
            Self::Https
        } else if protocol.eq_ignore_ascii_case("grpc") {
            Self::Grpc
        } else {
            Self::Tcp
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Grpc => "GRPC",
            Self::Tcp => "TCP",
        }
    }
}

/// One observed directed communication relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficAssertion {
    pub source: WorkloadInstance,
    pub destination: WorkloadInstance,
    pub destination_service_name: String,
    pub destination_service_namespace: String,
    pub protocol: EdgeProtocol,
}

/// A bounded group of assertions accumulated between flushes.
///
/// Append-only until flushed; the flush stamps the batch with the flush
/// wall-clock time and retires it to the queue.
#[derive(Debug, Clone)]
pub struct ReportBatch {
    pub parent: String,
    pub mesh_uid: String,
    /// Set when the batch is flushed, absent while accumulating.
    pub timestamp: Option<SystemTime>,
    pub assertions: Vec<TrafficAssertion>,
}

impl ReportBatch {
    fn empty_like(parent: &str, mesh_uid: &str) -> Self {
        Self {
            parent: parent.to_string(),
            mesh_uid: mesh_uid.to_string(),
            timestamp: None,
            assertions: Vec::new(),
        }
    }
}

/// Accumulates traffic assertions into size- and time-bounded batches.
///
/// Every added assertion lands in the current batch; exceeding the size
/// threshold flushes immediately after the append, so no assertion is
/// ever dropped or duplicated by the batching layer itself. Draining the
/// queue is the only operation that leaves this type (see
/// [`EdgeBatcher::drain`]); actual export lives with the collaborator.
pub struct EdgeBatcher {
    local_instance: WorkloadInstance,
    current: ReportBatch,
    queue: VecDeque<ReportBatch>,
    max_assertions_per_request: usize,
}

impl EdgeBatcher {
    /// Creates a batcher for the given local node.
    pub fn new(local_node: &NodeMetadata, max_assertions_per_request: usize) -> Self {
        let mesh = MeshIdentity::from_metadata(local_node);
        Self {
            local_instance: WorkloadInstance::from_metadata(local_node),
            current: ReportBatch::empty_like(&mesh.parent, &mesh.mesh_uid),
            queue: VecDeque::new(),
            max_assertions_per_request,
        }
    }

    /// Appends one assertion built from the request and the resolved peer,
    /// flushing afterwards if the current batch exceeded the size
    /// threshold.
    pub fn add_edge(&mut self, request: &RequestInfo, peer: &NodeMetadata, now: SystemTime) {
        let assertion = TrafficAssertion {
            source: WorkloadInstance::from_metadata(peer),
            destination: self.local_instance.clone(),
            destination_service_name: request.destination_service_host.clone(),
            destination_service_namespace: self.local_instance.workload_namespace.clone(),
            protocol: EdgeProtocol::classify(&request.request_protocol),
        };
        self.current.assertions.push(assertion);

        if self.current.assertions.len() > self.max_assertions_per_request {
            self.flush(now);
        }
    }

    /// Retires the current batch to the queue, stamped with the flush
    /// time. A batch with zero assertions is left in place.
    pub fn flush(&mut self, now: SystemTime) {
        if self.current.assertions.is_empty() {
            return;
        }

        let mut flushed = ReportBatch::empty_like(&self.current.parent, &self.current.mesh_uid);
        std::mem::swap(&mut self.current, &mut flushed);
        flushed.timestamp = Some(now);
        self.queue.push_back(flushed);
    }

    /// Flushes any partial batch and drains the whole queue in FIFO
    /// order. The caller hands each batch to the export collaborator;
    /// batches are not re-queued on export failure.
    pub fn drain(&mut self, now: SystemTime) -> Vec<ReportBatch> {
        self.flush(now);
        self.queue.drain(..).collect()
    }

    /// Assertions accumulated in the current (unflushed) batch.
    pub fn pending_assertions(&self) -> usize {
        self.current.assertions.len()
    }

    /// Batches awaiting drain.
    pub fn queued_batches(&self) -> usize {
        self.queue.len()
    }

    /// Local workload instance used as the assertion destination.
    pub fn local_instance(&self) -> &WorkloadInstance {
        &self.local_instance
    }
}
