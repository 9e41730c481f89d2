use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, TelemetryConfig};
use crate::dims::{self, DimensionVector, StdTag, TrafficDirection, STANDARD_TAG_COUNT};
use crate::edges::EdgeBatcher;
use crate::export::{EdgeSink, EngineMetrics};
use crate::expr::{EvalContext, ExpressionTable};
use crate::node::NodeMetadata;
use crate::request::RequestInfo;
use crate::stats::{full_stat_prefix, MetricSet, StatCache, StatHost};
use crate::tcp::TcpRecordTracker;

/// Stream lifecycle events delivered by the host glue to a worker.
#[derive(Debug)]
pub enum StreamEvent {
    /// A completed HTTP/gRPC request with its resolved peer, if any.
    HttpComplete {
        request: Box<RequestInfo>,
        peer: Option<NodeMetadata>,
    },
    /// New TCP connection accepted.
    TcpOpen { id: u64 },
    /// Bytes observed from the downstream side.
    TcpDownstreamData { id: u64, bytes: u64 },
    /// Bytes observed towards the upstream side.
    TcpUpstreamData { id: u64, bytes: u64 },
    /// Peer identity resolved through metadata exchange.
    TcpPeerResolved { id: u64, peer: NodeMetadata },
    /// Request attributes observed by the host for a tracked connection.
    TcpContext { id: u64, request: Box<RequestInfo> },
    /// Connection closed; triggers the final report.
    TcpClose { id: u64 },
}

/// Value handle identifying a stream and the worker that owns it. The
/// host glue routes all events for one connection through the same
/// worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    pub worker: usize,
    pub connection_id: u64,
}

/// Per-worker telemetry state: schema, expressions, stat cache, edge
/// batcher and TCP tracker.
///
/// One instance per worker execution context; nothing here is shared
/// across workers, so the request path needs no locks. All methods are
/// synchronous and bounded; the async run loop lives in [`Worker`].
pub struct WorkerContext {
    index: usize,
    cfg: TelemetryConfig,
    node: NodeMetadata,
    direction: TrafficDirection,
    health: Arc<EngineMetrics>,

    exprs: ExpressionTable,
    metrics: MetricSet,
    vector: DimensionVector,
    cache: StatCache,
    host: StatHost,
    edges: EdgeBatcher,
    tcp: TcpRecordTracker,

    last_new_report: Instant,
    last_epoch_report: Instant,
}

impl WorkerContext {
    /// Creates a worker context and applies the initial configuration.
    pub fn new(
        index: usize,
        cfg: &TelemetryConfig,
        node: NodeMetadata,
        direction: TrafficDirection,
        health: Arc<EngineMetrics>,
    ) -> Result<Self, ConfigError> {
        let mut ctx = Self {
            index,
            cfg: TelemetryConfig::default(),
            edges: EdgeBatcher::new(&node, TelemetryConfig::default().max_assertions_per_request),
            node,
            direction,
            cache: StatCache::new(
                TelemetryConfig::default().cache_hit_flush_threshold,
                health.cache_hits.clone(),
                health.cache_misses.clone(),
            ),
            health,
            exprs: ExpressionTable::new(),
            metrics: MetricSet::default(),
            vector: DimensionVector::with_len(STANDARD_TAG_COUNT),
            host: StatHost::new(),
            tcp: TcpRecordTracker::new(),
            last_new_report: Instant::now(),
            last_epoch_report: Instant::now(),
        };
        ctx.configure(cfg)?;
        Ok(ctx)
    }

    /// Applies a configuration, rebuilding the tag schema, expression
    /// table, stat cache and edge batcher from scratch.
    ///
    /// On failure everything already applied stays in place: validation
    /// runs before any state is touched. Tracked TCP connections survive
    /// a reconfigure; their next report resolves against the new schema.
    pub fn configure(&mut self, cfg: &TelemetryConfig) -> Result<(), ConfigError> {
        cfg.validate()?;

        self.metrics = MetricSet::configure(cfg, &mut self.exprs);

        // Local node identity does not change per request, so its slots
        // are filled once here.
        self.vector = DimensionVector::with_len(self.metrics.vector_len());
        self.vector[StdTag::Reporter] = self.direction.reporter_value().to_string();
        dims::fill_node(&mut self.vector, self.direction.is_outbound(), &self.node);

        self.cache = StatCache::new(
            cfg.cache_hit_flush_threshold,
            self.health.cache_hits.clone(),
            self.health.cache_misses.clone(),
        );
        self.host.clear();
        self.edges = EdgeBatcher::new(&self.node, cfg.max_assertions_per_request);

        // Build info gauge, recorded once per configuration.
        let prefix = full_stat_prefix(&cfg.stat_prefix);
        let build_name = format!(
            "{prefix}build{fs}component{vs}proxy{fs}tag{vs}{version}",
            fs = cfg.field_separator,
            vs = cfg.value_separator,
            version = self.node.mesh_version,
        );
        self.host.gauge(Arc::from(build_name)).set(1);

        self.cfg = cfg.clone();
        self.health.reconfigures.inc();
        self.health.stats_created.set(self.host.len() as i64);
        self.health.cached_combinations.set(0);

        info!(
            worker = self.index,
            families = self.metrics.generators().len(),
            dimensions = self.metrics.vector_len(),
            "worker configured"
        );
        Ok(())
    }

    /// Dimensions the request, resolves its stats through the cache and
    /// records them.
    fn report(&mut self, request: &RequestInfo, peer: Option<&NodeMetadata>, is_tcp: bool) {
        let empty_node = NodeMetadata::default();
        let outbound = self.direction.is_outbound();
        // Peer slots are overwritten every request; a missing peer writes
        // empty values that the unknown pass fills in.
        dims::fill_peer(&mut self.vector, outbound, peer.unwrap_or(&empty_node));
        dims::fill_request(&mut self.vector, request);
        dims::fill_unknown_if_empty(&mut self.vector);

        let ctx = EvalContext {
            request,
            node: &self.node,
            peer,
        };
        for i in 0..self.exprs.string_count() {
            let slot = STANDARD_TAG_COUNT + i;
            match self.exprs.eval_slot(i, &ctx) {
                Ok(value) => self.vector.set(slot, value),
                Err(e) => {
                    trace!(slot = i, error = %e, "dimension expression failed");
                    self.vector.set(slot, "");
                }
            }
        }

        let stats = self
            .cache
            .resolve(&self.vector, is_tcp, self.metrics.generators(), &mut self.host);
        for stat in stats.iter() {
            stat.record(&self.exprs, &ctx);
        }

        self.health
            .cached_combinations
            .set(self.cache.len() as i64);
        self.health.stats_created.set(self.host.len() as i64);
    }

    /// Appends an edge for an inbound request with a resolved peer.
    fn observe_edge(&mut self, request: &RequestInfo, peer: &NodeMetadata, now: SystemTime) {
        let queued_before = self.edges.queued_batches();
        self.edges.add_edge(request, peer, now);
        self.health.edge_assertions.inc();
        if self.edges.queued_batches() > queued_before {
            self.health.edge_batches_flushed.inc();
        }
    }

    /// Records a completed HTTP/gRPC request.
    pub fn record_http(
        &mut self,
        request: &RequestInfo,
        peer: Option<&NodeMetadata>,
        now: SystemTime,
    ) {
        self.report(request, peer, false);
        if !self.direction.is_outbound() {
            if let Some(peer) = peer {
                self.observe_edge(request, peer, now);
            }
        }
    }

    /// Handles one stream event from the host glue.
    pub fn handle_event(&mut self, event: StreamEvent, now: SystemTime) {
        match event {
            StreamEvent::HttpComplete { request, peer } => {
                self.record_http(&request, peer.as_ref(), now);
            }
            StreamEvent::TcpOpen { id } => {
                self.tcp.open(id, now);
                self.health.tcp_records_tracked.set(self.tcp.len() as i64);
            }
            StreamEvent::TcpDownstreamData { id, bytes } => {
                self.tcp.downstream_data(id, bytes, now);
            }
            StreamEvent::TcpUpstreamData { id, bytes } => {
                self.tcp.upstream_data(id, bytes, now);
            }
            StreamEvent::TcpPeerResolved { id, peer } => {
                self.tcp.set_peer(id, peer, now);
            }
            StreamEvent::TcpContext { id, request } => {
                self.tcp
                    .update_request(id, |current| merge_tcp_context(current, &request));
            }
            StreamEvent::TcpClose { id } => {
                if let Some(record) = self.tcp.close(id) {
                    let peer = record.peer.clone();
                    self.report(&record.request, peer.as_ref(), true);
                    self.health.tcp_reports.inc();
                    if !self.direction.is_outbound() {
                        if let Some(peer) = &peer {
                            self.observe_edge(&record.request, peer, now);
                        }
                    }
                }
                self.health.tcp_records_tracked.set(self.tcp.len() as i64);
            }
        }
    }

    /// Periodic sweep of tracked TCP connections.
    ///
    /// Records still waiting for peer metadata are skipped unless an
    /// error response flag is set or the record exceeded the idle
    /// timeout; idle records are reported best-effort and evicted. After
    /// a successful periodic report the interval counters are cleared so
    /// the next interval does not double count.
    pub fn sweep_tcp(&mut self, now: SystemTime) {
        let idle_timeout = self.cfg.tcp_idle_timeout;
        for id in self.tcp.ids() {
            let Some(record) = self.tcp.get(id) else {
                continue;
            };
            let idle = record.is_idle(now, idle_timeout);
            if !record.should_report() && !idle {
                // Metadata exchange still pending and nothing suggests an
                // error; keep waiting.
                continue;
            }

            let request = record.request.clone();
            let peer = record.peer.clone();
            self.report(&request, peer.as_ref(), true);
            self.health.tcp_reports.inc();
            if !self.direction.is_outbound() {
                if let Some(peer) = &peer {
                    self.observe_edge(&request, peer, now);
                }
            }

            if idle {
                self.tcp.evict(id);
                self.health.tcp_records_evicted.inc();
                debug!(worker = self.index, id, "evicted idle tcp record");
            } else if let Some(record) = self.tcp.get_mut(id) {
                record.request.clear_tcp_counters();
            }
        }
        self.health.tcp_records_tracked.set(self.tcp.len() as i64);
    }

    /// Flushes any partial batch and drains the report queue FIFO to the
    /// sink. Export failures are logged and counted; batches are not
    /// retried.
    pub fn report_edges(&mut self, now: SystemTime, sink: &mut EdgeSink) {
        let had_partial = self.edges.pending_assertions() > 0;
        let batches = self.edges.drain(now);
        if had_partial {
            self.health.edge_batches_flushed.inc();
        }
        for batch in batches {
            self.health.edge_reports.inc();
            if let Err(e) = sink.report(batch) {
                warn!(worker = self.index, sink = sink.name(), error = %e, "edge export failed");
                self.health
                    .edge_export_errors
                    .with_label_values(&[sink.name()])
                    .inc();
            }
        }
    }

    /// Periodic tick: TCP sweep plus the dual-cadence edge report. The
    /// short interval makes new edges visible quickly; the epoch interval
    /// re-asserts still-active edges even absent new traffic.
    pub fn on_tick(&mut self, now: SystemTime, sink: &mut EdgeSink) {
        self.sweep_tcp(now);

        if self.last_epoch_report.elapsed() >= self.cfg.edge_epoch_report_interval {
            self.report_edges(now, sink);
            self.last_epoch_report = Instant::now();
            self.last_new_report = Instant::now();
        } else if self.last_new_report.elapsed() >= self.cfg.edge_new_report_interval {
            self.report_edges(now, sink);
            self.last_new_report = Instant::now();
        }
    }

    /// Drops in-flight state on shutdown: the partial batch, the queue,
    /// cached stats and tracked connections are discarded without a final
    /// flush in exchange for a bounded, synchronous teardown.
    pub fn discard(&mut self) {
        info!(
            worker = self.index,
            pending_assertions = self.edges.pending_assertions(),
            queued_batches = self.edges.queued_batches(),
            cached_combinations = self.cache.len(),
            tcp_records = self.tcp.len(),
            "discarding in-flight telemetry state"
        );
        self.cache.clear();
        self.host.clear();
        self.tcp.clear();
        self.edges = EdgeBatcher::new(&self.node, self.cfg.max_assertions_per_request);
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.cfg
    }

    /// Stat host registry, for export snapshots and inspection.
    pub fn stat_host(&self) -> &StatHost {
        &self.host
    }

    /// Distinct dimension combinations currently cached.
    pub fn cached_combinations(&self) -> usize {
        self.cache.len()
    }

    /// Tracked TCP connection count.
    pub fn tracked_tcp_records(&self) -> usize {
        self.tcp.len()
    }

    /// Assertions pending in the current batch plus queued batches.
    pub fn edge_backlog(&self) -> (usize, usize) {
        (self.edges.pending_assertions(), self.edges.queued_batches())
    }

    #[cfg(test)]
    pub(crate) fn tcp_tracker_mut(&mut self) -> &mut TcpRecordTracker {
        &mut self.tcp
    }
}

/// Merges host-observed request attributes into a tracked TCP record,
/// preserving the interval byte/connection counters.
fn merge_tcp_context(current: &mut RequestInfo, update: &RequestInfo) {
    current.source_principal = update.source_principal.clone();
    current.destination_principal = update.destination_principal.clone();
    current.destination_service_host = update.destination_service_host.clone();
    current.destination_service_name = update.destination_service_name.clone();
    current.request_protocol = update.request_protocol.clone();
    current.response_flags = update.response_flags.clone();
    current.response_flag_bits = update.response_flag_bits;
    current.security_policy = update.security_policy;
}

/// Number of events drained per wakeup before yielding back to the
/// select loop.
const EVENT_BATCH_SIZE: usize = 256;

/// Owns a [`WorkerContext`] and drives it from an event channel and a
/// periodic ticker until cancelled.
pub struct Worker {
    ctx: WorkerContext,
    events: mpsc::Receiver<StreamEvent>,
    sink: EdgeSink,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        ctx: WorkerContext,
        events: mpsc::Receiver<StreamEvent>,
        sink: EdgeSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            events,
            sink,
            cancel,
        }
    }

    /// Runs until cancellation. Stream events and the periodic tick are
    /// serviced by this single task, so context state needs no locking.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.ctx.cfg.tcp_report_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.ctx.discard();
                    return;
                }

                Some(event) = self.events.recv() => {
                    let now = SystemTime::now();
                    self.ctx.handle_event(event, now);

                    // Drain a bounded burst without re-entering select.
                    for _ in 0..EVENT_BATCH_SIZE - 1 {
                        match self.events.try_recv() {
                            Ok(event) => self.ctx.handle_event(event, now),
                            Err(_) => break,
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.ctx.on_tick(SystemTime::now(), &mut self.sink);
                }
            }
        }
    }
}
