//! Debug logging layer

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{GraphEngineLayer, LayerContext};
use crate::error::LayerError;
use crate::events::GraphEngineEvent;

/// Counters shared between a [`DebugLoggingLayer`] and its creator
#[derive(Debug, Default)]
pub struct DebugCounters {
    pub node_count: AtomicUsize,
    pub success_count: AtomicUsize,
    pub failure_count: AtomicUsize,
    pub chunk_count: AtomicUsize,
}

impl DebugCounters {
    pub fn nodes(&self) -> usize {
        self.node_count.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> usize {
        self.success_count.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn chunks(&self) -> usize {
        self.chunk_count.load(Ordering::SeqCst)
    }
}

/// Logs every event through `tracing` and counts node outcomes
#[derive(Debug, Clone)]
pub struct DebugLoggingLayer {
    counters: Arc<DebugCounters>,
    include_chunks: bool,
}

impl Default for DebugLoggingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugLoggingLayer {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(DebugCounters::default()),
            include_chunks: false,
        }
    }

    /// Also log every stream chunk
    pub fn with_chunks(mut self, include: bool) -> Self {
        self.include_chunks = include;
        self
    }

    pub fn counters(&self) -> Arc<DebugCounters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl GraphEngineLayer for DebugLoggingLayer {
    fn name(&self) -> &str {
        "debug_logging"
    }

    async fn initialize(&self, ctx: &LayerContext) -> Result<(), LayerError> {
        debug!(run_id = %ctx.run_id, "Debug logging attached");
        Ok(())
    }

    async fn on_event(&self, event: &GraphEngineEvent) -> Result<(), LayerError> {
        match event {
            GraphEngineEvent::NodeRunStarted { base } => {
                self.counters.node_count.fetch_add(1, Ordering::SeqCst);
                info!(node_id = %base.node_id, kind = %base.node_kind, "Node started");
            }
            GraphEngineEvent::NodeRunSucceeded { base, outputs, .. } => {
                self.counters.success_count.fetch_add(1, Ordering::SeqCst);
                info!(node_id = %base.node_id, outputs = outputs.len(), "Node succeeded");
            }
            GraphEngineEvent::NodeRunFailed { base, error, .. } => {
                self.counters.failure_count.fetch_add(1, Ordering::SeqCst);
                warn!(node_id = %base.node_id, error = %error, "Node failed");
            }
            GraphEngineEvent::NodeRunException { base, error, strategy, .. } => {
                self.counters.failure_count.fetch_add(1, Ordering::SeqCst);
                warn!(node_id = %base.node_id, strategy = %strategy, error = %error, "Node exception");
            }
            GraphEngineEvent::NodeRunStreamChunk {
                base,
                chunk,
                from_variable_selector,
                ..
            } => {
                self.counters.chunk_count.fetch_add(1, Ordering::SeqCst);
                if self.include_chunks {
                    debug!(node_id = %base.node_id, from = ?from_variable_selector, chunk = %chunk, "Stream chunk");
                }
            }
            other => {
                info!(event = other.name(), node_id = ?other.node_id(), "Engine event");
            }
        }
        Ok(())
    }

    async fn on_graph_end(&self, error: Option<&str>) -> Result<(), LayerError> {
        info!(
            nodes = self.counters.nodes(),
            succeeded = self.counters.successes(),
            failed = self.counters.failures(),
            error = ?error,
            "Run finished"
        );
        Ok(())
    }
}
