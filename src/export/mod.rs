pub mod health;

use anyhow::Result;
use tracing::info;

use crate::edges::ReportBatch;

pub use self::health::EngineMetrics;

/// EdgeSink dispatches flushed report batches to an export backend.
///
/// Uses enum dispatch rather than trait objects so the per-tick drain
/// stays monomorphic. The wire transport lives behind this boundary;
/// batches handed over here are not re-queued on failure.
pub enum EdgeSink {
    Log(LogEdgeSink),
    Buffer(BufferEdgeSink),
}

impl EdgeSink {
    /// Returns the sink name for logging and error labeling.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Buffer(_) => "buffer",
        }
    }

    /// Delivers one flushed batch.
    pub fn report(&mut self, batch: ReportBatch) -> Result<()> {
        match self {
            Self::Log(sink) => sink.report(batch),
            Self::Buffer(sink) => sink.report(batch),
        }
    }
}

/// Sink that summarizes batches into the log stream. Default when no
/// export backend is wired up.
#[derive(Debug, Default)]
pub struct LogEdgeSink;

impl LogEdgeSink {
    fn report(&mut self, batch: ReportBatch) -> Result<()> {
        info!(
            parent = %batch.parent,
            mesh_uid = %batch.mesh_uid,
            assertions = batch.assertions.len(),
            "edge report batch"
        );
        Ok(())
    }
}

/// Sink that retains delivered batches in memory, for harness wiring and
/// tests.
#[derive(Debug, Default)]
pub struct BufferEdgeSink {
    pub batches: Vec<ReportBatch>,
}

impl BufferEdgeSink {
    fn report(&mut self, batch: ReportBatch) -> Result<()> {
        self.batches.push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edges::{EdgeBatcher, EdgeProtocol};
    use crate::node::NodeMetadata;
    use crate::request::RequestInfo;
    use std::time::SystemTime;

    #[test]
    fn test_buffer_sink_retains_batches() {
        let node = NodeMetadata {
            name: "n".to_string(),
            namespace: "ns".to_string(),
            ..Default::default()
        };
        let mut batcher = EdgeBatcher::new(&node, 10);
        let request = RequestInfo {
            request_protocol: "https".to_string(),
            ..Default::default()
        };
        batcher.add_edge(&request, &node, SystemTime::now());

        let mut sink = EdgeSink::Buffer(BufferEdgeSink::default());
        for batch in batcher.drain(SystemTime::now()) {
            sink.report(batch).expect("buffer sink accepts");
        }

        match sink {
            EdgeSink::Buffer(buffer) => {
                assert_eq!(buffer.batches.len(), 1);
                assert_eq!(
                    buffer.batches[0].assertions[0].protocol,
                    EdgeProtocol::Https
                );
            }
            EdgeSink::Log(_) => unreachable!(),
        }
    }

    #[test]
    fn test_sink_names() {
        assert_eq!(EdgeSink::Log(LogEdgeSink).name(), "log");
        assert_eq!(EdgeSink::Buffer(BufferEdgeSink::default()).name(), "buffer");
    }
}
