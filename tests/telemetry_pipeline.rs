use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use meshoor::config::{MetricOverride, TelemetryConfig};
use meshoor::dims::TrafficDirection;
use meshoor::edges::EdgeProtocol;
use meshoor::export::{BufferEdgeSink, EdgeSink, EngineMetrics};
use meshoor::node::NodeMetadata;
use meshoor::request::RequestInfo;
use meshoor::stats::StatHandle;
use meshoor::worker::{StreamEvent, WorkerContext};

fn health() -> Arc<EngineMetrics> {
    Arc::new(EngineMetrics::new("127.0.0.1:0").expect("metrics build"))
}

fn local_node() -> NodeMetadata {
    NodeMetadata {
        name: "server-7f9b".to_string(),
        namespace: "backend".to_string(),
        owner: "kubernetes://apis/apps/v1/namespaces/backend/deployments/server".to_string(),
        workload_name: "server".to_string(),
        mesh_version: "1.4.2".to_string(),
        labels: HashMap::from([
            ("app".to_string(), "server".to_string()),
            ("version".to_string(), "v1".to_string()),
            ("region".to_string(), "us-east".to_string()),
        ]),
        platform_metadata: HashMap::from([
            ("project".to_string(), "acme".to_string()),
            ("cluster_location".to_string(), "us-east1".to_string()),
            ("cluster_name".to_string(), "prod".to_string()),
        ]),
    }
}

fn peer_node() -> NodeMetadata {
    NodeMetadata {
        name: "client-1a2b".to_string(),
        namespace: "frontend".to_string(),
        workload_name: "client".to_string(),
        labels: HashMap::from([("app".to_string(), "client".to_string())]),
        ..Default::default()
    }
}

fn http_request(protocol: &str, response_code: u32) -> RequestInfo {
    RequestInfo {
        source_principal: "spiffe://mesh/frontend/client".to_string(),
        destination_principal: "spiffe://mesh/backend/server".to_string(),
        destination_service_host: "server.backend.svc.cluster.local".to_string(),
        destination_service_name: "server".to_string(),
        request_protocol: protocol.to_string(),
        response_code,
        duration: Duration::from_millis(37),
        request_size: 256,
        response_size: 1024,
        ..Default::default()
    }
}

fn now() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn inbound_context(cfg: &TelemetryConfig) -> WorkerContext {
    WorkerContext::new(0, cfg, local_node(), TrafficDirection::Inbound, health())
        .expect("context builds")
}

fn counter_value(ctx: &WorkerContext, name_prefix: &str) -> Option<u64> {
    ctx.stat_host().iter().find_map(|s| {
        if !s.name.starts_with(name_prefix) {
            return None;
        }
        match &s.handle {
            StatHandle::Counter(c) => Some(c.value()),
            _ => None,
        }
    })
}

fn histogram_count(ctx: &WorkerContext, name_prefix: &str) -> Option<u64> {
    ctx.stat_host().iter().find_map(|s| {
        if !s.name.starts_with(name_prefix) {
            return None;
        }
        match &s.handle {
            StatHandle::Histogram(h) => Some(h.snapshot().count),
            _ => None,
        }
    })
}

#[test]
fn scenario_default_http_request_touches_only_http_metrics() {
    let mut ctx = inbound_context(&TelemetryConfig::default());

    ctx.record_http(&http_request("HTTP", 200), Some(&peer_node()), now());

    assert_eq!(counter_value(&ctx, "_mesh_requests_total"), Some(1));
    assert_eq!(
        histogram_count(&ctx, "_mesh_request_duration_milliseconds"),
        Some(1)
    );
    assert_eq!(histogram_count(&ctx, "_mesh_request_bytes"), Some(1));

    // No TCP families may be instantiated for HTTP traffic.
    assert!(ctx
        .stat_host()
        .iter()
        .all(|s| !s.name.starts_with("_mesh_tcp_")));

    // A second identical request records on the same instances.
    ctx.record_http(&http_request("HTTP", 200), Some(&peer_node()), now());
    assert_eq!(counter_value(&ctx, "_mesh_requests_total"), Some(2));
    assert_eq!(ctx.cached_combinations(), 1);
}

#[test]
fn scenario_dimension_override_appends_custom_tag_last() {
    let cfg = TelemetryConfig {
        metrics: vec![MetricOverride {
            name: "requests_total".to_string(),
            tags_to_remove: vec![],
            dimensions: HashMap::from([("region".to_string(), "node.region".to_string())]),
        }],
        ..Default::default()
    };
    let mut ctx = inbound_context(&cfg);

    ctx.record_http(&http_request("http", 200), Some(&peer_node()), now());

    let stat = ctx
        .stat_host()
        .iter()
        .find(|s| s.name.starts_with("_mesh_requests_total"))
        .expect("requests_total resolved");
    assert!(
        stat.name.ends_with(";.;region=.us-east"),
        "custom tag must be the final segment, got {}",
        stat.name
    );

    // Families without the override are unaffected.
    let duration = ctx
        .stat_host()
        .iter()
        .find(|s| s.name.starts_with("_mesh_request_duration_milliseconds"))
        .expect("duration resolved");
    assert!(!duration.name.contains("region=."));
}

#[test]
fn scenario_edge_protocol_classification() {
    let mut ctx = inbound_context(&TelemetryConfig::default());

    for protocol in ["http", "GRPC", "unknown"] {
        ctx.record_http(&http_request(protocol, 200), Some(&peer_node()), now());
    }

    let mut sink = EdgeSink::Buffer(BufferEdgeSink::default());
    ctx.report_edges(now(), &mut sink);

    let EdgeSink::Buffer(buffer) = sink else {
        unreachable!()
    };
    assert_eq!(buffer.batches.len(), 1);
    let protocols: Vec<EdgeProtocol> = buffer.batches[0]
        .assertions
        .iter()
        .map(|a| a.protocol)
        .collect();
    assert_eq!(
        protocols,
        vec![EdgeProtocol::Http, EdgeProtocol::Grpc, EdgeProtocol::Tcp]
    );

    let assertion = &buffer.batches[0].assertions[0];
    assert_eq!(assertion.source.uid, "kubernetes://client-1a2b.frontend");
    assert_eq!(assertion.destination.uid, "kubernetes://server-7f9b.backend");
    assert_eq!(buffer.batches[0].parent, "projects/acme");
}

#[test]
fn tag_order_is_stable_across_equivalent_configs() {
    // The same dimensions declared in different map insertion orders.
    let mut forward = HashMap::new();
    forward.insert("zone".to_string(), "node.cluster_location".to_string());
    forward.insert("region".to_string(), "node.region".to_string());
    forward.insert("app_version".to_string(), "node.version".to_string());

    let mut reverse = HashMap::new();
    reverse.insert("app_version".to_string(), "node.version".to_string());
    reverse.insert("region".to_string(), "node.region".to_string());
    reverse.insert("zone".to_string(), "node.cluster_location".to_string());

    let resolved_names = |dimensions: HashMap<String, String>| -> Vec<String> {
        let cfg = TelemetryConfig {
            metrics: vec![MetricOverride {
                name: String::new(),
                tags_to_remove: vec![],
                dimensions,
            }],
            ..Default::default()
        };
        let mut ctx = inbound_context(&cfg);
        ctx.record_http(&http_request("http", 200), Some(&peer_node()), now());
        let mut names: Vec<String> = ctx
            .stat_host()
            .iter()
            .map(|s| s.name.to_string())
            .collect();
        names.sort();
        names
    };

    assert_eq!(resolved_names(forward), resolved_names(reverse));
}

#[test]
fn reconfiguration_discards_resolved_stats() {
    let mut ctx = inbound_context(&TelemetryConfig::default());
    ctx.record_http(&http_request("http", 200), Some(&peer_node()), now());
    assert_eq!(counter_value(&ctx, "_mesh_requests_total"), Some(1));

    ctx.configure(&TelemetryConfig::default())
        .expect("reconfigure succeeds");
    assert_eq!(ctx.cached_combinations(), 0);
    assert_eq!(counter_value(&ctx, "_mesh_requests_total"), None);

    // The same traffic after reconfigure starts from fresh instances.
    ctx.record_http(&http_request("http", 200), Some(&peer_node()), now());
    assert_eq!(counter_value(&ctx, "_mesh_requests_total"), Some(1));
}

#[test]
fn tcp_connection_reports_deferred_until_error_flag() {
    let mut ctx = inbound_context(&TelemetryConfig::default());

    ctx.handle_event(StreamEvent::TcpOpen { id: 4 }, now());
    ctx.handle_event(StreamEvent::TcpDownstreamData { id: 4, bytes: 2048 }, now());
    ctx.handle_event(StreamEvent::TcpUpstreamData { id: 4, bytes: 512 }, now());

    // No peer metadata, response flags zero: the sweep must not report.
    ctx.sweep_tcp(now());
    assert!(ctx
        .stat_host()
        .iter()
        .all(|s| !s.name.starts_with("_mesh_tcp_")));

    // An error response flag unblocks reporting without metadata.
    ctx.handle_event(
        StreamEvent::TcpContext {
            id: 4,
            request: Box::new(RequestInfo {
                request_protocol: "tcp".to_string(),
                response_flags: "UF".to_string(),
                response_flag_bits: 0x2,
                ..Default::default()
            }),
        },
        now(),
    );
    ctx.sweep_tcp(now());

    assert_eq!(counter_value(&ctx, "_mesh_tcp_received_bytes_total"), Some(2048));
    assert_eq!(counter_value(&ctx, "_mesh_tcp_sent_bytes_total"), Some(512));
    assert_eq!(
        counter_value(&ctx, "_mesh_tcp_connections_opened_total"),
        Some(1)
    );

    // Unknown placeholder identity for the missing peer.
    let stat = ctx
        .stat_host()
        .iter()
        .find(|s| s.name.starts_with("_mesh_tcp_received_bytes_total"))
        .expect("tcp stat resolved");
    assert!(stat.name.contains("source_workload=.unknown"));

    // Interval counters were reset: the next sweep adds zero.
    ctx.sweep_tcp(now());
    assert_eq!(counter_value(&ctx, "_mesh_tcp_received_bytes_total"), Some(2048));
}

#[test]
fn tcp_connection_with_peer_reports_and_closes() {
    let mut ctx = inbound_context(&TelemetryConfig::default());

    ctx.handle_event(StreamEvent::TcpOpen { id: 11 }, now());
    ctx.handle_event(
        StreamEvent::TcpPeerResolved {
            id: 11,
            peer: peer_node(),
        },
        now(),
    );
    ctx.handle_event(StreamEvent::TcpDownstreamData { id: 11, bytes: 100 }, now());

    ctx.sweep_tcp(now());
    assert_eq!(counter_value(&ctx, "_mesh_tcp_received_bytes_total"), Some(100));

    // More traffic, then close: the final report accounts the remainder
    // and the close counter exactly once.
    ctx.handle_event(StreamEvent::TcpDownstreamData { id: 11, bytes: 50 }, now());
    ctx.handle_event(StreamEvent::TcpClose { id: 11 }, now());

    assert_eq!(ctx.tracked_tcp_records(), 0);
    assert_eq!(counter_value(&ctx, "_mesh_tcp_received_bytes_total"), Some(150));
    assert_eq!(
        counter_value(&ctx, "_mesh_tcp_connections_closed_total"),
        Some(1)
    );
    assert_eq!(
        counter_value(&ctx, "_mesh_tcp_connections_opened_total"),
        Some(1)
    );
}

#[test]
fn edge_batches_flush_on_threshold_and_drain_fifo() {
    let cfg = TelemetryConfig {
        max_assertions_per_request: 2,
        ..Default::default()
    };
    let mut ctx = inbound_context(&cfg);

    for i in 0..7 {
        ctx.record_http(&http_request("http", 200 + i), Some(&peer_node()), now());
    }
    // Every third append crosses the threshold: two full batches queued,
    // one assertion pending.
    assert_eq!(ctx.edge_backlog(), (1, 2));

    let mut sink = EdgeSink::Buffer(BufferEdgeSink::default());
    ctx.report_edges(now(), &mut sink);

    let EdgeSink::Buffer(buffer) = sink else {
        unreachable!()
    };
    assert_eq!(buffer.batches.len(), 3);
    assert_eq!(buffer.batches[0].assertions.len(), 3);
    assert_eq!(buffer.batches[1].assertions.len(), 3);
    assert_eq!(buffer.batches[2].assertions.len(), 1);
    let total: usize = buffer.batches.iter().map(|b| b.assertions.len()).sum();
    assert_eq!(total, 7, "no assertion lost or duplicated");
    assert!(buffer.batches.iter().all(|b| b.timestamp.is_some()));
}

#[test]
fn grpc_requests_carry_grpc_status_dimension() {
    let mut ctx = inbound_context(&TelemetryConfig::default());

    let mut request = http_request("grpc", 200);
    request.grpc_status = Some(7);
    ctx.record_http(&request, Some(&peer_node()), now());

    let stat = ctx
        .stat_host()
        .iter()
        .find(|s| s.name.starts_with("_mesh_requests_total"))
        .expect("requests_total resolved");
    assert!(stat.name.contains("grpc_response_status=.7"));
    assert!(stat.name.contains("request_protocol=.grpc"));
}

#[test]
fn response_class_preferred_over_numeric_code() {
    let mut ctx = inbound_context(&TelemetryConfig::default());

    let mut request = http_request("http", 204);
    request.response_class = "2xx".to_string();
    ctx.record_http(&request, Some(&peer_node()), now());

    let stat = ctx
        .stat_host()
        .iter()
        .find(|s| s.name.starts_with("_mesh_requests_total"))
        .expect("requests_total resolved");
    assert!(stat.name.contains("response_code=.2xx"));
}
