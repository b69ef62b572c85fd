//! Execution limits layer
//!
//! Aborts a run that dispatches too many nodes or runs too long. The layer
//! only observes; enforcement goes through an `Abort` command, so the engine
//! stops at its next command poll.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{GraphEngineLayer, LayerContext};
use crate::command::{CommandChannel, GraphEngineCommand};
use crate::error::LayerError;
use crate::events::GraphEngineEvent;

/// Limits for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Maximum node dispatches
    pub max_steps: usize,
    /// Maximum wall time since graph start
    #[serde(with = "humantime_serde")]
    pub max_time: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: 500,
            max_time: Duration::from_secs(1200),
        }
    }
}

/// Sends `Abort` when a limit is exceeded
pub struct ExecutionLimitsLayer {
    limits: ExecutionLimits,
    steps: AtomicUsize,
    started: Mutex<Option<Instant>>,
    aborted: AtomicBool,
    channel: Mutex<Option<Arc<dyn CommandChannel>>>,
}

impl std::fmt::Debug for ExecutionLimitsLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLimitsLayer")
            .field("limits", &self.limits)
            .field("steps", &self.steps.load(Ordering::SeqCst))
            .finish()
    }
}

impl ExecutionLimitsLayer {
    pub fn new(max_steps: usize, max_time: Duration) -> Self {
        Self::from_limits(ExecutionLimits { max_steps, max_time })
    }

    pub fn from_limits(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            steps: AtomicUsize::new(0),
            started: Mutex::new(None),
            aborted: AtomicBool::new(false),
            channel: Mutex::new(None),
        }
    }

    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }

    fn breach(&self) -> Option<String> {
        let steps = self.steps();
        if steps > self.limits.max_steps {
            return Some(format!(
                "Max steps {} exceeded: {} nodes dispatched",
                self.limits.max_steps, steps
            ));
        }
        let started = *self.started.lock();
        if let Some(started) = started {
            let elapsed = started.elapsed();
            if elapsed > self.limits.max_time {
                return Some(format!(
                    "Max execution time {:?} exceeded: ran for {:?}",
                    self.limits.max_time, elapsed
                ));
            }
        }
        None
    }

    async fn abort(&self, reason: String) -> Result<(), LayerError> {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channel = self.channel.lock().clone();
        let Some(channel) = channel else {
            return Err(LayerError::failed(self.name(), "layer used before initialize"));
        };
        warn!(reason = %reason, "Execution limit exceeded, aborting run");
        channel
            .send_command(GraphEngineCommand::abort(reason))
            .await
            .map_err(|e| LayerError::failed(self.name(), format!("Failed to send abort: {}", e)))
    }
}

#[async_trait]
impl GraphEngineLayer for ExecutionLimitsLayer {
    fn name(&self) -> &str {
        "execution_limits"
    }

    async fn initialize(&self, ctx: &LayerContext) -> Result<(), LayerError> {
        *self.channel.lock() = Some(Arc::clone(&ctx.command_channel));
        Ok(())
    }

    async fn on_graph_start(&self) -> Result<(), LayerError> {
        *self.started.lock() = Some(Instant::now());
        self.steps.store(0, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);
        info!(
            max_steps = self.limits.max_steps,
            max_time = ?self.limits.max_time,
            "Execution limits armed"
        );
        Ok(())
    }

    async fn on_event(&self, event: &GraphEngineEvent) -> Result<(), LayerError> {
        if event.is_terminal() {
            return Ok(());
        }
        if matches!(event, GraphEngineEvent::NodeRunStarted { .. }) {
            self.steps.fetch_add(1, Ordering::SeqCst);
        }
        match self.breach() {
            Some(reason) => self.abort(reason).await,
            None => Ok(()),
        }
    }
}
