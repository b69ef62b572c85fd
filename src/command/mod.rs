//! Command channel for out-of-band run control
//!
//! External actors stop or pause a running workflow by sending a
//! [`GraphEngineCommand`]; the engine loop drains the channel once per
//! iteration with [`CommandChannel::fetch_commands`].
//!
//! # Backends
//!
//! - **InMemory**: process-local queue, reachable through the engine handle
//! - **Redis**: cross-process list per run (requires `command-channel-redis`)
//!
//! # Usage
//!
//! ```ignore
//! use graph_engine::command::{send_command, CommandChannelConfig, GraphEngineCommand};
//!
//! let config = CommandChannelConfig::Redis {
//!     url: "redis://localhost:6379".into(),
//!     ttl_seconds: 3600,
//! };
//! send_command(&config, "run-123", GraphEngineCommand::abort("user cancelled")).await?;
//! ```

mod memory;
#[cfg(feature = "command-channel-redis")]
mod redis;

pub use memory::InMemoryChannel;
#[cfg(feature = "command-channel-redis")]
pub use self::redis::{command_key, RedisChannel};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::CommandChannelError;

/// Default reason reported when an abort carries none
pub const DEFAULT_ABORT_REASON: &str = "Workflow execution aborted by user command";

/// Default message reported when a pause command carries none
pub const DEFAULT_PAUSE_REASON: &str = "Workflow execution paused by user command";

/// A control command for a running workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command_type", rename_all = "snake_case")]
pub enum GraphEngineCommand {
    /// Stop the run; in-flight nodes are cancelled
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Stop dispatching, drain, and persist the run for later resume
    Pause {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl GraphEngineCommand {
    /// Abort with a reason
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: Some(reason.into()),
        }
    }

    /// Pause with a reason
    pub fn pause(reason: impl Into<String>) -> Self {
        Self::Pause {
            reason: Some(reason.into()),
        }
    }

    /// The reason, falling back to the default for the command type
    pub fn reason_or_default(&self) -> String {
        match self {
            Self::Abort { reason } => reason.clone().unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string()),
            Self::Pause { reason } => reason.clone().unwrap_or_else(|| DEFAULT_PAUSE_REASON.to_string()),
        }
    }
}

/// Transport for engine commands
///
/// `fetch_commands` must return every command sent since the previous fetch
/// exactly once, in send order.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Atomically take all pending commands
    async fn fetch_commands(&self) -> Result<Vec<GraphEngineCommand>, CommandChannelError>;

    /// Enqueue a command
    async fn send_command(&self, command: GraphEngineCommand) -> Result<(), CommandChannelError>;
}

/// Command channel backend selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandChannelConfig {
    /// Process-local channel
    #[default]
    InMemory,

    /// Redis list per run (requires `command-channel-redis` feature)
    #[cfg(feature = "command-channel-redis")]
    Redis {
        /// Redis connection URL
        url: String,
        /// Expiry of the command key, refreshed on every send
        #[serde(default = "default_command_ttl")]
        ttl_seconds: u64,
    },
}

#[cfg(feature = "command-channel-redis")]
fn default_command_ttl() -> u64 {
    3600
}

/// Create the channel for a run from configuration
#[cfg_attr(not(feature = "command-channel-redis"), allow(unused_variables))]
pub async fn create_command_channel(
    config: &CommandChannelConfig,
    run_id: &str,
) -> Result<Arc<dyn CommandChannel>, CommandChannelError> {
    match config {
        CommandChannelConfig::InMemory => Ok(Arc::new(InMemoryChannel::new())),

        #[cfg(feature = "command-channel-redis")]
        CommandChannelConfig::Redis { url, ttl_seconds } => {
            let channel = RedisChannel::connect(url, run_id, *ttl_seconds).await?;
            Ok(Arc::new(channel))
        }
    }
}

/// Send a command to a run from any process sharing the backend
///
/// In-memory channels are private to the engine that owns them; use
/// `GraphEngine::command_channel()` for those.
#[cfg_attr(not(feature = "command-channel-redis"), allow(unused_variables))]
pub async fn send_command(
    config: &CommandChannelConfig,
    run_id: &str,
    command: GraphEngineCommand,
) -> Result<(), CommandChannelError> {
    match config {
        CommandChannelConfig::InMemory => {
            Err(CommandChannelError::Backend(
                "in-memory command channels are only reachable through the engine handle"
                    .to_string(),
            ))
        }

        #[cfg(feature = "command-channel-redis")]
        CommandChannelConfig::Redis { .. } => {
            create_command_channel(config, run_id)
                .await?
                .send_command(command)
                .await
        }
    }
}

/// Decode a stored command, skipping malformed or unknown entries
pub fn decode_command(raw: &str) -> Option<GraphEngineCommand> {
    match serde_json::from_str::<GraphEngineCommand>(raw) {
        Ok(command) => Some(command),
        Err(e) => {
            warn!(error = %e, raw = %raw, "Skipping undecodable command");
            None
        }
    }
}
