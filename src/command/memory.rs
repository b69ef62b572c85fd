//! Process-local command channel

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{CommandChannel, GraphEngineCommand};
use crate::error::CommandChannelError;

/// In-memory command queue; clones share the same queue
#[derive(Debug, Clone, Default)]
pub struct InMemoryChannel {
    queue: Arc<Mutex<Vec<GraphEngineCommand>>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands waiting to be fetched
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl CommandChannel for InMemoryChannel {
    async fn fetch_commands(&self) -> Result<Vec<GraphEngineCommand>, CommandChannelError> {
        Ok(std::mem::take(&mut *self.queue.lock()))
    }

    async fn send_command(&self, command: GraphEngineCommand) -> Result<(), CommandChannelError> {
        self.queue.lock().push(command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_drains_in_order() {
        let channel = InMemoryChannel::new();
        channel.send_command(GraphEngineCommand::pause("one")).await.unwrap();
        channel.send_command(GraphEngineCommand::abort("two")).await.unwrap();
        assert_eq!(channel.pending(), 2);

        let commands = channel.fetch_commands().await.unwrap();
        assert_eq!(
            commands,
            vec![GraphEngineCommand::pause("one"), GraphEngineCommand::abort("two")]
        );
        assert!(channel.fetch_commands().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_senders_deliver_exactly_once() {
        let channel = InMemoryChannel::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let sender = channel.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..25 {
                    sender
                        .send_command(GraphEngineCommand::pause(format!("{}-{}", i, j)))
                        .await
                        .unwrap();
                }
            }));
        }

        let mut received = Vec::new();
        while received.len() < 200 {
            received.extend(channel.fetch_commands().await.unwrap());
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        received.extend(channel.fetch_commands().await.unwrap());

        assert_eq!(received.len(), 200);
        let unique: std::collections::HashSet<String> =
            received.iter().map(|c| c.reason_or_default()).collect();
        assert_eq!(unique.len(), 200);
    }
}
