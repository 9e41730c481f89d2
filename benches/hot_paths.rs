use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use meshoor::config::{MetricOverride, TelemetryConfig};
use meshoor::dims::TrafficDirection;
use meshoor::export::EngineMetrics;
use meshoor::node::NodeMetadata;
use meshoor::request::RequestInfo;
use meshoor::worker::WorkerContext;

fn local_node() -> NodeMetadata {
    NodeMetadata {
        name: "server-7f9b".to_string(),
        namespace: "backend".to_string(),
        workload_name: "server".to_string(),
        mesh_version: "1.4.2".to_string(),
        labels: HashMap::from([
            ("app".to_string(), "server".to_string()),
            ("region".to_string(), "us-east".to_string()),
        ]),
        ..Default::default()
    }
}

fn peer_node() -> NodeMetadata {
    NodeMetadata {
        name: "client-1a2b".to_string(),
        namespace: "frontend".to_string(),
        workload_name: "client".to_string(),
        ..Default::default()
    }
}

fn request(response_code: u32) -> RequestInfo {
    RequestInfo {
        source_principal: "spiffe://mesh/frontend/client".to_string(),
        destination_service_host: "server.backend.svc.cluster.local".to_string(),
        destination_service_name: "server".to_string(),
        request_protocol: "http".to_string(),
        response_code,
        duration: Duration::from_millis(3),
        request_size: 256,
        response_size: 512,
        ..Default::default()
    }
}

fn context(cfg: &TelemetryConfig) -> WorkerContext {
    let health = Arc::new(EngineMetrics::new("127.0.0.1:0").expect("metrics build"));
    WorkerContext::new(0, cfg, local_node(), TrafficDirection::Inbound, health)
        .expect("context builds")
}

fn bench_record_cached(c: &mut Criterion) {
    let mut ctx = context(&TelemetryConfig::default());
    let peer = peer_node();
    let req = request(200);
    let now = SystemTime::now();

    // Warm the cache so the loop measures the hit path.
    ctx.record_http(&req, Some(&peer), now);

    c.bench_function("record_http/cache_hit", |b| {
        b.iter(|| ctx.record_http(black_box(&req), black_box(Some(&peer)), now))
    });
}

fn bench_record_with_expressions(c: &mut Criterion) {
    let cfg = TelemetryConfig {
        metrics: vec![MetricOverride {
            name: String::new(),
            tags_to_remove: vec![],
            dimensions: HashMap::from([("region".to_string(), "node.region".to_string())]),
        }],
        ..Default::default()
    };
    let mut ctx = context(&cfg);
    let peer = peer_node();
    let req = request(200);
    let now = SystemTime::now();
    ctx.record_http(&req, Some(&peer), now);

    c.bench_function("record_http/cache_hit_with_expression", |b| {
        b.iter(|| ctx.record_http(black_box(&req), black_box(Some(&peer)), now))
    });
}

fn bench_resolve_miss(c: &mut Criterion) {
    let mut ctx = context(&TelemetryConfig::default());
    let peer = peer_node();
    let now = SystemTime::now();
    let mut code = 0u32;

    c.bench_function("record_http/cache_miss", |b| {
        b.iter(|| {
            // A fresh response code per iteration forces a resolution.
            code = code.wrapping_add(1);
            ctx.record_http(black_box(&request(code)), black_box(Some(&peer)), now)
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_record_cached(c);
    bench_record_with_expressions(c);
    bench_resolve_miss(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
