//! Engine layers
//!
//! Layers observe a run: they are initialized before the first event, see
//! every event before the caller does, and are told when the run ends. A
//! layer can steer the run only through the command channel it receives in
//! its [`LayerContext`].
//!
//! Layer failures never fail the run. Every call is bounded by the engine's
//! `layer_timeout`; errors and timeouts are logged and dropped.

pub mod debug;
pub mod limits;
pub mod persistence;

pub use debug::{DebugLoggingLayer, DebugCounters};
pub use limits::{ExecutionLimits, ExecutionLimitsLayer};
pub use persistence::{
    ExecutionRepository, InMemoryExecutionRepository, NodeExecutionRecord, PersistenceLayer,
    WorkflowExecutionRecord, WorkflowExecutionStatus,
};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::command::CommandChannel;
use crate::error::LayerError;
use crate::events::GraphEngineEvent;

/// What a layer gets to know about the run it observes
#[derive(Clone)]
pub struct LayerContext {
    pub run_id: String,
    pub command_channel: Arc<dyn CommandChannel>,
}

impl std::fmt::Debug for LayerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerContext").field("run_id", &self.run_id).finish()
    }
}

/// Observer attached to a run
///
/// All hooks default to no-ops.
#[async_trait]
pub trait GraphEngineLayer: Send + Sync {
    /// Layer name for logs
    fn name(&self) -> &str;

    async fn initialize(&self, _ctx: &LayerContext) -> Result<(), LayerError> {
        Ok(())
    }

    async fn on_graph_start(&self) -> Result<(), LayerError> {
        Ok(())
    }

    async fn on_event(&self, _event: &GraphEngineEvent) -> Result<(), LayerError> {
        Ok(())
    }

    /// `error` is set when the run failed or was aborted
    async fn on_graph_end(&self, _error: Option<&str>) -> Result<(), LayerError> {
        Ok(())
    }
}

/// Ordered set of layers with bounded hook calls
#[derive(Clone)]
pub struct LayerStack {
    layers: Vec<Arc<dyn GraphEngineLayer>>,
    timeout: Duration,
}

impl LayerStack {
    pub fn new(timeout: Duration) -> Self {
        Self {
            layers: Vec::new(),
            timeout,
        }
    }

    pub fn with_layer(mut self, layer: Arc<dyn GraphEngineLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn push(&mut self, layer: Arc<dyn GraphEngineLayer>) {
        self.layers.push(layer);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub async fn initialize(&self, ctx: &LayerContext) {
        for layer in &self.layers {
            self.guard(layer.as_ref(), "initialize", layer.initialize(ctx)).await;
        }
    }

    pub async fn on_graph_start(&self) {
        for layer in &self.layers {
            self.guard(layer.as_ref(), "on_graph_start", layer.on_graph_start()).await;
        }
    }

    pub async fn on_event(&self, event: &GraphEngineEvent) {
        for layer in &self.layers {
            self.guard(layer.as_ref(), "on_event", layer.on_event(event)).await;
        }
    }

    /// Runs in reverse registration order
    pub async fn on_graph_end(&self, error: Option<&str>) {
        for layer in self.layers.iter().rev() {
            self.guard(layer.as_ref(), "on_graph_end", layer.on_graph_end(error)).await;
        }
    }

    async fn guard<F>(&self, layer: &dyn GraphEngineLayer, hook: &str, call: F)
    where
        F: std::future::Future<Output = Result<(), LayerError>>,
    {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LayerError::Timeout {
                layer: layer.name().to_string(),
            }),
        };
        if let Err(e) = result {
            warn!(layer = layer.name(), hook, error = %e, "Layer hook failed");
        }
    }
}

impl std::fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStack")
            .field("layers", &self.layers.iter().map(|l| l.name().to_string()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::InMemoryChannel;
    use parking_lot::Mutex;

    struct Recording {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl GraphEngineLayer for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_graph_start(&self) -> Result<(), LayerError> {
            self.calls.lock().push(format!("{}:start", self.name));
            Ok(())
        }

        async fn on_graph_end(&self, _error: Option<&str>) -> Result<(), LayerError> {
            self.calls.lock().push(format!("{}:end", self.name));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl GraphEngineLayer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_event(&self, _event: &GraphEngineEvent) -> Result<(), LayerError> {
            Err(LayerError::failed("failing", "boom"))
        }
    }

    struct Hanging;

    #[async_trait]
    impl GraphEngineLayer for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn initialize(&self, _ctx: &LayerContext) -> Result<(), LayerError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_end_runs_in_reverse_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stack = LayerStack::new(Duration::from_secs(1))
            .with_layer(Arc::new(Recording { name: "a".into(), calls: calls.clone() }))
            .with_layer(Arc::new(Recording { name: "b".into(), calls: calls.clone() }));

        stack.on_graph_start().await;
        stack.on_graph_end(None).await;
        assert_eq!(*calls.lock(), vec!["a:start", "b:start", "b:end", "a:end"]);
    }

    #[tokio::test]
    async fn test_failing_layer_is_swallowed() {
        let stack = LayerStack::new(Duration::from_secs(1)).with_layer(Arc::new(Failing));
        stack
            .on_event(&GraphEngineEvent::GraphRunStarted {
                run_id: "r".into(),
                resumed: false,
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_layer_times_out() {
        let stack = LayerStack::new(Duration::from_millis(50)).with_layer(Arc::new(Hanging));
        let ctx = LayerContext {
            run_id: "r".into(),
            command_channel: Arc::new(InMemoryChannel::new()),
        };
        stack.initialize(&ctx).await;
    }
}
