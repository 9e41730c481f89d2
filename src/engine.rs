use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::export::{EdgeSink, EngineMetrics, LogEdgeSink};
use crate::worker::{StreamEvent, StreamHandle, Worker, WorkerContext};

/// Capacity of each worker's stream-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 65536;

struct WorkerSlot {
    events: mpsc::Sender<StreamEvent>,
    join: JoinHandle<()>,
}

/// Wires one worker context per execution context and routes stream
/// events to them.
///
/// Workers never share state; a connection's events all flow through the
/// worker its handle names, so per-worker processing stays single
/// threaded. The engine is the explicit construction point the host glue
/// calls into; there is no ambient registry.
pub struct TelemetryEngine {
    workers: Vec<WorkerSlot>,
    health: Arc<EngineMetrics>,
    cancel: CancellationToken,
}

impl TelemetryEngine {
    /// Builds and spawns the configured number of workers with the
    /// default log sink.
    pub fn start(cfg: &Config, health: Arc<EngineMetrics>) -> Result<Self> {
        Self::start_with_sinks(cfg, health, |_| EdgeSink::Log(LogEdgeSink))
    }

    /// Builds and spawns workers, one edge sink per worker.
    pub fn start_with_sinks(
        cfg: &Config,
        health: Arc<EngineMetrics>,
        mut make_sink: impl FnMut(usize) -> EdgeSink,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let mut workers = Vec::with_capacity(cfg.workers);

        for index in 0..cfg.workers {
            let ctx = WorkerContext::new(
                index,
                &cfg.telemetry,
                cfg.node.clone(),
                cfg.direction,
                Arc::clone(&health),
            )
            .with_context(|| format!("configuring worker {index}"))?;

            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let worker = Worker::new(ctx, rx, make_sink(index), cancel.clone());
            let join = tokio::spawn(worker.run());
            workers.push(WorkerSlot { events: tx, join });
        }

        info!(workers = workers.len(), "telemetry engine started");

        Ok(Self {
            workers,
            health,
            cancel,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Returns the handle routing a connection's events to its worker.
    pub fn stream_handle(&self, connection_id: u64) -> StreamHandle {
        StreamHandle {
            worker: (connection_id % self.workers.len() as u64) as usize,
            connection_id,
        }
    }

    /// Delivers a stream event to the worker owning the handle. Events
    /// are dropped with a counter bump when the worker's channel is
    /// full; telemetry must never backpressure the data path.
    pub fn dispatch(&self, handle: StreamHandle, event: StreamEvent) {
        let Some(slot) = self.workers.get(handle.worker) else {
            warn!(worker = handle.worker, "dispatch to unknown worker");
            self.health.events_dropped.inc();
            return;
        };
        if slot.events.try_send(event).is_err() {
            warn!(worker = handle.worker, "worker event channel full, dropping event");
            self.health.events_dropped.inc();
        }
    }

    /// Cancels all workers and waits for them to finish their teardown.
    /// In-flight unflushed state is discarded by each worker.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (index, slot) in self.workers.into_iter().enumerate() {
            if let Err(e) = slot.join.await {
                warn!(worker = index, error = %e, "worker task join failed");
            }
        }
        info!("telemetry engine stopped");
    }
}
