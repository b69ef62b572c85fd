//! Redis command channel
//!
//! Commands for a run are JSON entries in one Redis list.
//!
//! # Key Format
//!
//! ```text
//! workflow:{run_id}:commands
//! ```
//!
//! Sends `RPUSH` and refresh the key's TTL in one pipeline; fetches read and
//! delete the list in one `MULTI`/`EXEC` pipeline so every command is observed
//! exactly once.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{decode_command, CommandChannel, GraphEngineCommand};
use crate::error::CommandChannelError;

/// Redis key holding a run's pending commands
pub fn command_key(run_id: &str) -> String {
    format!("workflow:{}:commands", run_id)
}

/// Redis-backed command channel for one run
#[derive(Clone)]
pub struct RedisChannel {
    conn: ConnectionManager,
    key: String,
    ttl_seconds: u64,
}

impl RedisChannel {
    /// Connect to Redis for the given run
    ///
    /// ```ignore
    /// let channel = RedisChannel::connect("redis://localhost:6379", "run-1", 3600).await?;
    /// ```
    pub async fn connect(
        url: &str,
        run_id: &str,
        ttl_seconds: u64,
    ) -> Result<Self, CommandChannelError> {
        let client = redis::Client::open(url).map_err(|e| {
            CommandChannelError::Connection(format!("Failed to create Redis client: {}", e))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            CommandChannelError::Connection(format!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self {
            conn,
            key: command_key(run_id),
            ttl_seconds,
        })
    }
}

#[async_trait]
impl CommandChannel for RedisChannel {
    async fn fetch_commands(&self) -> Result<Vec<GraphEngineCommand>, CommandChannelError> {
        let mut conn = self.conn.clone();
        let (entries,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(&self.key, 0, -1)
            .del(&self.key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| CommandChannelError::Backend(format!("Failed to fetch commands: {}", e)))?;

        Ok(entries.iter().filter_map(|raw| decode_command(raw)).collect())
    }

    async fn send_command(&self, command: GraphEngineCommand) -> Result<(), CommandChannelError> {
        let payload = serde_json::to_string(&command)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .rpush(&self.key, payload)
            .ignore()
            .expire(&self.key, self.ttl_seconds as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CommandChannelError::Backend(format!("Failed to send command: {}", e)))
    }
}
