pub mod handle;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use prometheus::IntCounter;
use tracing::{trace, warn};

use crate::config::TelemetryConfig;
use crate::dims::{DimensionVector, STANDARD_TAGS, STANDARD_TAG_COUNT};
use crate::expr::{EvalContext, ExpressionTable};
use crate::request::RequestInfo;

pub use self::handle::{ExportedStat, Histogram, MetricKind, StatHandle, StatHost};

/// Extracts the value to record for one metric from the current request.
///
/// Config-declared metrics evaluate a compiled integer expression through
/// the worker's expression table; built-in metrics read request fields
/// directly and ignore the table.
pub type ValueFn = Arc<dyn Fn(&ExpressionTable, &EvalContext<'_>) -> u64 + Send + Sync>;

/// Definition of one metric family: name, kind, value extractor and
/// whether it applies to TCP or HTTP traffic.
#[derive(Clone)]
pub struct MetricSpec {
    pub name: String,
    pub kind: MetricKind,
    pub value: ValueFn,
    pub tcp_only: bool,
}

impl std::fmt::Debug for MetricSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("tcp_only", &self.tcp_only)
            .finish()
    }
}

fn from_request(extract: fn(&RequestInfo) -> u64) -> ValueFn {
    Arc::new(move |_, ctx| extract(ctx.request))
}

/// Built-in metric families.
///
/// HTTP, HTTP/2 and gRPC share the request metrics; the TCP families
/// record the interval-scoped connection counters.
pub fn default_metrics() -> Vec<MetricSpec> {
    vec![
        MetricSpec {
            name: "requests_total".to_string(),
            kind: MetricKind::Counter,
            value: from_request(|_| 1),
            tcp_only: false,
        },
        MetricSpec {
            name: "request_duration_milliseconds".to_string(),
            kind: MetricKind::Histogram,
            value: from_request(|r| r.duration.as_millis() as u64),
            tcp_only: false,
        },
        MetricSpec {
            name: "request_bytes".to_string(),
            kind: MetricKind::Histogram,
            value: from_request(|r| r.request_size),
            tcp_only: false,
        },
        MetricSpec {
            name: "response_bytes".to_string(),
            kind: MetricKind::Histogram,
            value: from_request(|r| r.response_size),
            tcp_only: false,
        },
        MetricSpec {
            name: "tcp_sent_bytes_total".to_string(),
            kind: MetricKind::Counter,
            value: from_request(|r| r.tcp_sent_bytes),
            tcp_only: true,
        },
        MetricSpec {
            name: "tcp_received_bytes_total".to_string(),
            kind: MetricKind::Counter,
            value: from_request(|r| r.tcp_received_bytes),
            tcp_only: true,
        },
        MetricSpec {
            name: "tcp_connections_opened_total".to_string(),
            kind: MetricKind::Counter,
            value: from_request(|r| r.tcp_connections_opened),
            tcp_only: true,
        },
        MetricSpec {
            name: "tcp_connections_closed_total".to_string(),
            kind: MetricKind::Counter,
            value: from_request(|r| r.tcp_connections_closed),
            tcp_only: true,
        },
    ]
}

/// Produces resolved stats for one metric family under the current tag
/// schema. Holds the family's present tags and their vector slots.
pub struct StatGenerator {
    spec: MetricSpec,
    prefix: Arc<str>,
    /// Present tags as (name, vector slot), in export order.
    tags: Vec<(String, usize)>,
    field_separator: String,
    value_separator: String,
}

impl StatGenerator {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn kind(&self) -> MetricKind {
        self.spec.kind
    }

    pub fn is_tcp_metric(&self) -> bool {
        self.spec.tcp_only
    }

    /// Tag names present for this family, in export order.
    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|(name, _)| name.as_str())
    }

    /// Builds the fully-qualified stat name for the given dimension values.
    pub fn qualified_name(&self, vector: &DimensionVector) -> String {
        let mut out = String::with_capacity(64 + self.tags.len() * 16);
        out.push_str(&self.prefix);
        out.push_str(&self.spec.name);
        for (tag, slot) in &self.tags {
            out.push_str(&self.field_separator);
            out.push_str(tag);
            out.push_str(&self.value_separator);
            out.push_str(vector.get(*slot));
        }
        out
    }

    /// Instantiates the stat for one dimension combination, creating the
    /// underlying counter/gauge/histogram in the host registry.
    pub fn resolve(&self, vector: &DimensionVector, host: &mut StatHost) -> ResolvedStat {
        let name: Arc<str> = Arc::from(self.qualified_name(vector));
        let handle = match self.spec.kind {
            MetricKind::Counter => StatHandle::Counter(host.counter(Arc::clone(&name))),
            MetricKind::Gauge => StatHandle::Gauge(host.gauge(Arc::clone(&name))),
            MetricKind::Histogram => StatHandle::Histogram(host.histogram(Arc::clone(&name))),
        };
        ResolvedStat {
            name,
            value: Arc::clone(&self.spec.value),
            handle,
        }
    }
}

impl std::fmt::Debug for StatGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatGenerator")
            .field("name", &self.spec.name)
            .field("kind", &self.spec.kind)
            .field("tcp_only", &self.spec.tcp_only)
            .field("tags", &self.tags)
            .finish()
    }
}

/// A concrete exported stat bound to one dimension combination, with a
/// direct handle for O(1) recording.
#[derive(Clone)]
pub struct ResolvedStat {
    pub name: Arc<str>,
    value: ValueFn,
    handle: StatHandle,
}

impl ResolvedStat {
    /// Records the extracted request value: counters add, gauges set,
    /// histograms sample.
    pub fn record(&self, exprs: &ExpressionTable, ctx: &EvalContext<'_>) {
        let value = (self.value)(exprs, ctx);
        match &self.handle {
            StatHandle::Counter(c) => c.add(value),
            StatHandle::Gauge(g) => g.set(value),
            StatHandle::Histogram(h) => h.record(value),
        }
    }

    pub fn handle(&self) -> &StatHandle {
        &self.handle
    }
}

impl std::fmt::Debug for ResolvedStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedStat")
            .field("name", &self.name)
            .finish()
    }
}

/// The configured metric families and the resulting dimension schema.
pub struct MetricSet {
    generators: Vec<StatGenerator>,
    vector_len: usize,
}

impl Default for MetricSet {
    /// An empty set with only the standard dimension block. Placeholder
    /// until the first configuration is applied.
    fn default() -> Self {
        Self {
            generators: Vec::new(),
            vector_len: STANDARD_TAG_COUNT,
        }
    }
}

impl MetricSet {
    /// Rebuilds metric families and the tag schema from configuration.
    ///
    /// Starts from the built-in families, applies config-declared
    /// definitions (new metrics or kind/extractor overrides by name), then
    /// dimension overrides in two deterministic passes: removals mark a
    /// tag's slot absent without shifting others, additions compile a
    /// string expression per tag in lexicographic name order and append
    /// custom slots after the standard block. The expression table is
    /// cleared first so no compiled handles survive a reconfigure.
    pub fn configure(cfg: &TelemetryConfig, exprs: &mut ExpressionTable) -> Self {
        exprs.clear();

        let mut factories: BTreeMap<String, MetricSpec> = BTreeMap::new();
        let mut metric_tags: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut metric_indexes: BTreeMap<String, BTreeMap<String, Option<usize>>> =
            BTreeMap::new();

        // Seed the built-in families with the standard tag block.
        for spec in default_metrics() {
            let indexes = metric_indexes.entry(spec.name.clone()).or_default();
            for (i, tag) in STANDARD_TAGS.iter().enumerate() {
                indexes.insert(tag.name().to_string(), Some(i));
            }
            metric_tags.insert(
                spec.name.clone(),
                STANDARD_TAGS.iter().map(|t| t.name().to_string()).collect(),
            );
            factories.insert(spec.name.clone(), spec);
        }

        // Config-declared definitions override kind/extractor or add new
        // families (which start without tags until overrides attach some).
        for def in &cfg.definitions {
            if def.name.is_empty() || def.value.is_empty() {
                continue;
            }
            let token = match exprs.compile_value(&def.value) {
                Ok(token) => token,
                Err(e) => {
                    warn!(metric = %def.name, expression = %def.value, error = %e,
                        "cannot compile metric value expression, skipping definition");
                    continue;
                }
            };
            let value: ValueFn = Arc::new(move |table, ctx| {
                table.eval_value(token, ctx).unwrap_or_else(|e| {
                    trace!(error = %e, "metric value expression failed");
                    0
                })
            });

            metric_tags.entry(def.name.clone()).or_default();
            metric_indexes.entry(def.name.clone()).or_default();
            let factory = factories.entry(def.name.clone()).or_insert_with(|| MetricSpec {
                name: def.name.clone(),
                kind: MetricKind::Counter,
                value: Arc::clone(&value),
                tcp_only: false,
            });
            factory.value = value;
            if let Some(kind) = def.kind {
                factory.kind = kind;
            }
        }

        // Dimension overrides, per family (empty name matches all).
        let factory_names: Vec<String> = factories.keys().cloned().collect();
        for metric in &cfg.metrics {
            // Sorted tag names keep slot assignment deterministic across
            // equivalent configurations.
            let mut tags: Vec<&String> = metric.dimensions.keys().collect();
            tags.sort();

            for factory_name in &factory_names {
                if !metric.name.is_empty() && metric.name != *factory_name {
                    continue;
                }
                let indexes = metric_indexes.entry(factory_name.clone()).or_default();

                for tag in &metric.tags_to_remove {
                    if let Some(index) = indexes.get_mut(tag) {
                        *index = None;
                    }
                }

                for tag in &tags {
                    let source = &metric.dimensions[*tag];
                    let value = match exprs.compile_string(source) {
                        Ok(slot) => Some(STANDARD_TAG_COUNT + slot),
                        Err(e) => {
                            warn!(tag = %tag, expression = %source, error = %e,
                                "cannot compile dimension expression, dropping tag");
                            None
                        }
                    };
                    if let Some(index) = indexes.get_mut(*tag) {
                        *index = value;
                    } else {
                        metric_tags
                            .entry(factory_name.clone())
                            .or_default()
                            .push((*tag).clone());
                        indexes.insert((*tag).clone(), value);
                    }
                }
            }
        }

        // Instantiate generators with only the present tags.
        let prefix: Arc<str> = Arc::from(full_stat_prefix(&cfg.stat_prefix));
        let mut generators = Vec::with_capacity(factories.len());
        for (name, spec) in factories {
            let tag_names = metric_tags.remove(&name).unwrap_or_default();
            let indexes = metric_indexes.remove(&name).unwrap_or_default();
            let mut tags = Vec::with_capacity(tag_names.len());
            for tag in tag_names {
                if let Some(Some(slot)) = indexes.get(&tag) {
                    tags.push((tag, *slot));
                }
            }
            generators.push(StatGenerator {
                spec,
                prefix: Arc::clone(&prefix),
                tags,
                field_separator: cfg.field_separator.clone(),
                value_separator: cfg.value_separator.clone(),
            });
        }

        Self {
            generators,
            vector_len: STANDARD_TAG_COUNT + exprs.string_count(),
        }
    }

    /// Total dimension slots (standard block plus custom expressions).
    pub fn vector_len(&self) -> usize {
        self.vector_len
    }

    pub fn generators(&self) -> &[StatGenerator] {
        &self.generators
    }
}

/// Full stat name prefix. The leading underscore opts the stats out of
/// the scraper's automatic namespacing.
pub fn full_stat_prefix(stat_prefix: &str) -> String {
    format!("_{stat_prefix}_")
}

/// Maps a dimension combination to its resolved stats.
///
/// One instance per worker; repeated requests with identical dimensions
/// resolve to the same stat sequence without re-allocation. Cache hits
/// are counted through a local accumulator flushed to the exported
/// counter in batches to keep per-request overhead down.
pub struct StatCache {
    entries: HashMap<DimensionVector, Arc<Vec<ResolvedStat>>>,
    hits_accumulator: u64,
    hit_flush_threshold: u64,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
}

impl StatCache {
    pub fn new(hit_flush_threshold: u64, cache_hits: IntCounter, cache_misses: IntCounter) -> Self {
        Self {
            entries: HashMap::new(),
            hits_accumulator: 0,
            hit_flush_threshold: hit_flush_threshold.max(1),
            cache_hits,
            cache_misses,
        }
    }

    /// Resolves the dimension vector to its stat sequence.
    ///
    /// On a miss, every family applicable to the traffic kind is
    /// instantiated and the mapping is stored under an owned copy of the
    /// key, so the caller's live vector may keep mutating.
    pub fn resolve(
        &mut self,
        vector: &DimensionVector,
        is_tcp: bool,
        generators: &[StatGenerator],
        host: &mut StatHost,
    ) -> Arc<Vec<ResolvedStat>> {
        if let Some(stats) = self.entries.get(vector) {
            self.hits_accumulator += 1;
            if self.hits_accumulator >= self.hit_flush_threshold {
                self.cache_hits.inc_by(self.hits_accumulator);
                self.hits_accumulator = 0;
            }
            return Arc::clone(stats);
        }

        let mut stats = Vec::new();
        for generator in generators {
            if generator.is_tcp_metric() != is_tcp {
                continue;
            }
            trace!(metric = generator.name(), "stat cache miss");
            stats.push(generator.resolve(vector, host));
        }

        let stats = Arc::new(stats);
        self.cache_misses.inc();
        self.entries.insert(vector.clone(), Arc::clone(&stats));
        stats
    }

    /// Number of distinct dimension combinations resolved so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards every cached entry. Pending coalesced hits are dropped
    /// with them; only flushed counts were exported.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits_accumulator = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricDefinition, MetricOverride, TelemetryConfig};
    use crate::dims::StdTag;
    use crate::node::NodeMetadata;

    fn counters() -> (IntCounter, IntCounter) {
        (
            IntCounter::new("hits", "hits").expect("valid counter"),
            IntCounter::new("misses", "misses").expect("valid counter"),
        )
    }

    fn eval_fixture() -> (RequestInfo, NodeMetadata) {
        (RequestInfo::default(), NodeMetadata::default())
    }

    #[test]
    fn test_default_metrics_cover_both_kinds_of_traffic() {
        let metrics = default_metrics();
        assert_eq!(metrics.len(), 8);
        assert_eq!(metrics.iter().filter(|m| m.tcp_only).count(), 4);
        assert_eq!(metrics.iter().filter(|m| !m.tcp_only).count(), 4);
    }

    #[test]
    fn test_configure_seeds_standard_tags_for_defaults() {
        let cfg = TelemetryConfig::default();
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);

        assert_eq!(set.vector_len(), STANDARD_TAG_COUNT);
        let requests = set
            .generators()
            .iter()
            .find(|g| g.name() == "requests_total")
            .expect("requests_total exists");
        let names: Vec<&str> = requests.tag_names().collect();
        assert_eq!(names.len(), STANDARD_TAG_COUNT);
        assert_eq!(names[0], "reporter");
        assert_eq!(names[STANDARD_TAG_COUNT - 1], "connection_security_policy");
    }

    #[test]
    fn test_configure_tag_removal_keeps_other_slots() {
        let cfg = TelemetryConfig {
            metrics: vec![MetricOverride {
                name: "requests_total".to_string(),
                tags_to_remove: vec!["response_flags".to_string()],
                dimensions: Default::default(),
            }],
            ..Default::default()
        };
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);

        let requests = set
            .generators()
            .iter()
            .find(|g| g.name() == "requests_total")
            .expect("requests_total exists");
        let names: Vec<&str> = requests.tag_names().collect();
        assert_eq!(names.len(), STANDARD_TAG_COUNT - 1);
        assert!(!names.contains(&"response_flags"));

        // Untouched family keeps the full tag set.
        let duration = set
            .generators()
            .iter()
            .find(|g| g.name() == "request_duration_milliseconds")
            .expect("duration metric exists");
        assert_eq!(duration.tag_names().count(), STANDARD_TAG_COUNT);
    }

    #[test]
    fn test_configure_custom_tags_sorted_and_appended() {
        let mut dimensions = std::collections::HashMap::new();
        dimensions.insert("zone".to_string(), "node.zone".to_string());
        dimensions.insert("region".to_string(), "node.region".to_string());

        let cfg = TelemetryConfig {
            metrics: vec![MetricOverride {
                name: "requests_total".to_string(),
                tags_to_remove: vec![],
                dimensions,
            }],
            ..Default::default()
        };
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);

        assert_eq!(set.vector_len(), STANDARD_TAG_COUNT + 2);
        let requests = set
            .generators()
            .iter()
            .find(|g| g.name() == "requests_total")
            .expect("requests_total exists");
        let names: Vec<&str> = requests.tag_names().collect();
        // "region" sorts before "zone", so it owns the first custom slot.
        assert_eq!(names[STANDARD_TAG_COUNT], "region");
        assert_eq!(names[STANDARD_TAG_COUNT + 1], "zone");
        assert_eq!(
            requests.tags[STANDARD_TAG_COUNT],
            ("region".to_string(), STANDARD_TAG_COUNT)
        );
    }

    #[test]
    fn test_configure_definition_overrides_kind() {
        let cfg = TelemetryConfig {
            definitions: vec![MetricDefinition {
                name: "requests_total".to_string(),
                value: "request.request_size".to_string(),
                kind: Some(MetricKind::Gauge),
            }],
            ..Default::default()
        };
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);

        let requests = set
            .generators()
            .iter()
            .find(|g| g.name() == "requests_total")
            .expect("requests_total exists");
        assert_eq!(requests.kind(), MetricKind::Gauge);
        // The override keeps the default family's tags.
        assert_eq!(requests.tag_names().count(), STANDARD_TAG_COUNT);
    }

    #[test]
    fn test_configure_skips_uncompilable_definitions() {
        let cfg = TelemetryConfig {
            definitions: vec![MetricDefinition {
                name: "broken_total".to_string(),
                value: "bogus.path".to_string(),
                kind: None,
            }],
            ..Default::default()
        };
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);
        assert!(set.generators().iter().all(|g| g.name() != "broken_total"));
    }

    #[test]
    fn test_qualified_name_layout() {
        let cfg = TelemetryConfig::default();
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);

        let mut vector = DimensionVector::with_len(set.vector_len());
        vector[StdTag::Reporter] = "destination".to_string();

        let requests = set
            .generators()
            .iter()
            .find(|g| g.name() == "requests_total")
            .expect("requests_total exists");
        let name = requests.qualified_name(&vector);
        assert!(name.starts_with("_mesh_requests_total"));
        assert!(name.contains(";.;reporter=.destination"));
    }

    #[test]
    fn test_resolve_hit_returns_same_sequence() {
        let cfg = TelemetryConfig::default();
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);
        let (hits, misses) = counters();
        let mut cache = StatCache::new(100, hits.clone(), misses.clone());
        let mut host = StatHost::new();

        let vector = DimensionVector::with_len(set.vector_len());
        let first = cache.resolve(&vector, false, set.generators(), &mut host);
        let created = host.len();
        let second = cache.resolve(&vector, false, set.generators(), &mut host);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(host.len(), created, "no new stats on a cache hit");
        assert_eq!(misses.get(), 1);
    }

    #[test]
    fn test_resolve_filters_by_traffic_kind() {
        let cfg = TelemetryConfig::default();
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);
        let (hits, misses) = counters();
        let mut cache = StatCache::new(100, hits, misses);
        let mut host = StatHost::new();

        let vector = DimensionVector::with_len(set.vector_len());
        let http = cache.resolve(&vector, false, set.generators(), &mut host);
        assert_eq!(http.len(), 4);
        assert!(http.iter().all(|s| !s.name.contains("tcp_")));
    }

    #[test]
    fn test_hit_counter_coalesced_to_threshold() {
        let cfg = TelemetryConfig::default();
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);
        let (hits, misses) = counters();
        let mut cache = StatCache::new(3, hits.clone(), misses);
        let mut host = StatHost::new();

        let vector = DimensionVector::with_len(set.vector_len());
        cache.resolve(&vector, false, set.generators(), &mut host);
        for _ in 0..2 {
            cache.resolve(&vector, false, set.generators(), &mut host);
        }
        assert_eq!(hits.get(), 0, "below threshold, nothing flushed");

        cache.resolve(&vector, false, set.generators(), &mut host);
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn test_record_dispatches_by_kind() {
        let cfg = TelemetryConfig::default();
        let mut exprs = ExpressionTable::new();
        let set = MetricSet::configure(&cfg, &mut exprs);
        let (hits, misses) = counters();
        let mut cache = StatCache::new(100, hits, misses);
        let mut host = StatHost::new();

        let vector = DimensionVector::with_len(set.vector_len());
        let stats = cache.resolve(&vector, false, set.generators(), &mut host);

        let (mut request, node) = eval_fixture();
        request.duration = std::time::Duration::from_millis(25);
        let ctx = EvalContext {
            request: &request,
            node: &node,
            peer: None,
        };
        for stat in stats.iter() {
            stat.record(&exprs, &ctx);
        }

        let requests = host
            .iter()
            .find(|s| s.name.starts_with("_mesh_requests_total"))
            .expect("counter exported");
        match &requests.handle {
            StatHandle::Counter(c) => assert_eq!(c.value(), 1),
            other => panic!("unexpected handle: {other:?}"),
        }

        let duration = host
            .iter()
            .find(|s| s.name.starts_with("_mesh_request_duration_milliseconds"))
            .expect("histogram exported");
        match &duration.handle {
            StatHandle::Histogram(h) => {
                let snap = h.snapshot();
                assert_eq!(snap.count, 1);
                assert_eq!(snap.sum, 25);
            }
            other => panic!("unexpected handle: {other:?}"),
        }
    }
}
