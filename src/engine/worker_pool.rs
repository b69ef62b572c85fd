//! Worker pool sizing
//!
//! [`WorkerPoolManager`] decides how many workers a run starts with and when
//! to add or retire one. It keeps the only mutable state shared between the
//! engine loop and the workers: each worker's last activity, behind one lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::WorkerPoolConfig;
use crate::graph::Graph;

#[derive(Debug, Clone, Copy)]
struct Activity {
    active: bool,
    since: Instant,
}

/// Scaling policy and worker activity tracking
#[derive(Debug)]
pub struct WorkerPoolManager {
    config: WorkerPoolConfig,
    activity: Mutex<HashMap<usize, Activity>>,
}

impl WorkerPoolManager {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            activity: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    fn clamp(&self, workers: usize) -> usize {
        workers.clamp(self.config.min_workers, self.config.max_workers.max(self.config.min_workers))
    }

    /// Starting worker count, tiered by the graph's parallelism score
    pub fn calculate_initial_workers(&self, graph: &Graph) -> usize {
        let score = graph.parallelism_score();
        let tier = match score {
            0 => 1,
            1..=2 => 2,
            3..=5 => 3,
            _ => 5,
        };
        let workers = self.clamp(tier);
        debug!(score, workers, "Initial worker count");
        workers
    }

    /// Add a worker when the queue backs up or every worker is busy
    pub fn should_scale_up(&self, current: usize, queue_depth: usize, executing: usize) -> bool {
        if current >= self.config.max_workers {
            return false;
        }
        queue_depth > self.config.scale_up_threshold || (executing >= current && queue_depth > 0)
    }

    /// Retire a worker idle since `last_task_time` for longer than the idle limit
    pub fn should_scale_down(&self, current: usize, worker_id: usize, last_task_time: Instant) -> bool {
        if current <= self.config.min_workers {
            return false;
        }
        let active = self
            .activity
            .lock()
            .get(&worker_id)
            .map(|a| a.active)
            .unwrap_or(false);
        !active && last_task_time.elapsed() > self.config.scale_down_idle_time
    }

    /// Record a worker starting or finishing a task
    pub fn track_worker_activity(&self, worker_id: usize, active: bool) {
        self.activity.lock().insert(
            worker_id,
            Activity {
                active,
                since: Instant::now(),
            },
        );
    }

    /// Forget a retired worker
    pub fn remove_worker(&self, worker_id: usize) {
        self.activity.lock().remove(&worker_id);
    }

    /// When the worker last changed activity
    pub fn last_activity(&self, worker_id: usize) -> Option<Instant> {
        self.activity.lock().get(&worker_id).map(|a| a.since)
    }

    /// Workers idle for at least the idle limit as of `now`
    pub fn get_idle_workers(&self, now: Instant) -> Vec<usize> {
        let snapshot: Vec<(usize, Activity)> =
            self.activity.lock().iter().map(|(id, a)| (*id, *a)).collect();
        let mut idle: Vec<usize> = snapshot
            .into_iter()
            .filter(|(_, a)| !a.active && now.saturating_duration_since(a.since) >= self.config.scale_down_idle_time)
            .map(|(id, _)| id)
            .collect();
        idle.sort_unstable();
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Node, NodeKind};
    use std::time::Duration;

    fn config(min: usize, max: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: min,
            max_workers: max,
            scale_up_threshold: 3,
            scale_down_idle_time: Duration::from_secs(5),
        }
    }

    fn fan_out(width: usize) -> Graph {
        let mut builder = GraphBuilder::new().node(Node::new("start", NodeKind::Start));
        for i in 0..width {
            let id = format!("n{}", i);
            builder = builder.node(Node::new(id.as_str(), NodeKind::Llm)).edge("start", id.as_str());
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_initial_workers_tiers() {
        let manager = WorkerPoolManager::new(config(1, 10));
        assert_eq!(manager.calculate_initial_workers(&fan_out(1)), 1);
        assert_eq!(manager.calculate_initial_workers(&fan_out(2)), 2);

        let diamond = GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("a", NodeKind::Llm))
            .node(Node::new("b", NodeKind::Llm))
            .node(Node::new("loop", NodeKind::Loop))
            .edge("start", "a")
            .edge("start", "b")
            .edge("a", "loop")
            .edge("b", "loop")
            .build()
            .unwrap();
        // 1 branch + 1 join + 2 for the container
        assert_eq!(manager.calculate_initial_workers(&diamond), 3);
    }

    #[test]
    fn test_initial_workers_clamped() {
        let wide = {
            let mut builder = GraphBuilder::new().node(Node::new("start", NodeKind::Start));
            for i in 0..4 {
                let id = format!("loop{}", i);
                builder = builder
                    .node(Node::new(id.as_str(), NodeKind::Iteration))
                    .edge("start", id.as_str());
            }
            builder.build().unwrap()
        };
        assert_eq!(WorkerPoolManager::new(config(1, 10)).calculate_initial_workers(&wide), 5);
        assert_eq!(WorkerPoolManager::new(config(1, 4)).calculate_initial_workers(&wide), 4);
        assert_eq!(WorkerPoolManager::new(config(3, 10)).calculate_initial_workers(&fan_out(1)), 3);
    }

    #[test]
    fn test_scale_up() {
        let manager = WorkerPoolManager::new(config(1, 4));
        assert!(manager.should_scale_up(2, 4, 0));
        assert!(!manager.should_scale_up(2, 3, 0));
        assert!(manager.should_scale_up(2, 1, 2));
        assert!(!manager.should_scale_up(2, 0, 2));
        assert!(!manager.should_scale_up(4, 10, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_respects_min_and_idle_time() {
        let manager = WorkerPoolManager::new(config(1, 4));
        manager.track_worker_activity(0, false);
        manager.track_worker_activity(1, false);
        let last = manager.last_activity(1).unwrap();

        assert!(!manager.should_scale_down(2, 1, last));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.should_scale_down(2, 1, last));
        assert!(!manager.should_scale_down(1, 1, last));

        manager.track_worker_activity(1, true);
        assert!(!manager.should_scale_down(2, 1, last));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_workers_snapshot() {
        let manager = WorkerPoolManager::new(config(1, 4));
        manager.track_worker_activity(0, false);
        manager.track_worker_activity(1, true);
        tokio::time::advance(Duration::from_secs(5)).await;
        manager.track_worker_activity(2, false);

        assert_eq!(manager.get_idle_workers(Instant::now()), vec![0]);
        manager.remove_worker(0);
        assert!(manager.get_idle_workers(Instant::now()).is_empty());
    }
}
