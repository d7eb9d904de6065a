use crate::monitor::WorkerState;
use crate::progress::Progress;
use crate::task_queue::RetiredSubtask;
use crate::types::{ControlCommand, Subtask, SubtaskId, SubtaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use workforge_core::Role;
use workforge_provider::ChainHealth;

/// Lightweight view of a live subtask for monitoring clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskView {
    pub id: SubtaskId,
    pub role: Role,
    pub file_path: String,
    pub status: SubtaskStatus,
    pub rework_count: u32,
    pub parent: Option<SubtaskId>,
    pub failure: Option<String>,
    pub confidence: Option<f64>,
}

impl From<&Subtask> for SubtaskView {
    fn from(task: &Subtask) -> Self {
        Self {
            id: task.id.clone(),
            role: task.role,
            file_path: task.file_path.clone(),
            status: task.status,
            rework_count: task.rework_count,
            parent: task.parent.clone(),
            failure: task.failure.clone(),
            confidence: task.best.as_ref().map(|b| b.confidence()),
        }
    }
}

/// Full system state, sent to each subscriber when it connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub taken_at: DateTime<Utc>,
    pub goal: Option<String>,
    pub queues: BTreeMap<Role, Vec<SubtaskId>>,
    pub subtasks: Vec<SubtaskView>,
    pub retired: Vec<RetiredSubtask>,
    pub workers: Vec<WorkerState>,
    pub providers: Vec<ChainHealth>,
    pub concurrency_ceiling: usize,
    pub progress: Progress,
}

/// Incremental state change published on the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Full state; published after a reset.
    Snapshot { snapshot: Box<SystemSnapshot> },
    SubtaskStatus {
        id: SubtaskId,
        role: Role,
        file_path: String,
        from: Option<SubtaskStatus>,
        to: SubtaskStatus,
        rework_count: u32,
    },
    QueueDepth { role: Role, depth: usize },
    Progress { progress: Progress },
    Worker { state: WorkerState },
    Escalation {
        subtask_id: Option<SubtaskId>,
        role: Option<Role>,
        error: String,
    },
    Control { command: ControlCommand },
    Log {
        level: String,
        target: String,
        message: String,
        at: DateTime<Utc>,
    },
    /// This subscriber fell behind and `skipped` events were dropped for it.
    Lagged { skipped: u64 },
}

/// Non-blocking fan-out of [`StatusEvent`]s.
///
/// Each subscriber has a bounded buffer; when it fills, the oldest events are
/// overwritten for that subscriber only. Publishing never waits on a reader.
pub struct StatusHub {
    tx: broadcast::Sender<StatusEvent>,
    published: AtomicU64,
}

impl StatusHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: StatusEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// A live feed of hub events.
pub struct Subscriber {
    rx: broadcast::Receiver<StatusEvent>,
}

impl Subscriber {
    /// Next event, or `None` once the hub is gone. Overruns surface as
    /// [`StatusEvent::Lagged`].
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => Some(StatusEvent::Lagged { skipped }),
            Err(RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        use broadcast::error::TryRecvError;
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(skipped)) => Some(StatusEvent::Lagged { skipped }),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }
}

/// What a client receives on connect: the full state, then live events.
pub struct Subscription {
    pub snapshot: SystemSnapshot,
    pub events: Subscriber,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn depth(role: Role, depth: usize) -> StatusEvent {
        StatusEvent::QueueDepth { role, depth }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = StatusHub::new(4);
        hub.publish(depth(Role::Executor, 1));
        assert_eq!(hub.published_count(), 1);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let hub = StatusHub::new(8);
        let mut sub = hub.subscribe();
        hub.publish(depth(Role::Executor, 1));
        hub.publish(depth(Role::Executor, 2));
        assert!(matches!(sub.recv().await, Some(StatusEvent::QueueDepth { depth: 1, .. })));
        assert!(matches!(sub.recv().await, Some(StatusEvent::QueueDepth { depth: 2, .. })));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let hub = StatusHub::new(2);
        let mut slow = hub.subscribe();
        for i in 0..5 {
            hub.publish(depth(Role::Tester, i));
        }
        match slow.recv().await {
            Some(StatusEvent::Lagged { skipped }) => assert_eq!(skipped, 3),
            other => panic!("Expected Lagged, got {other:?}"),
        }
        assert!(matches!(slow.recv().await, Some(StatusEvent::QueueDepth { depth: 3, .. })));
        assert!(matches!(slow.recv().await, Some(StatusEvent::QueueDepth { depth: 4, .. })));
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(depth(Role::Documenter, 7)).unwrap();
        assert_eq!(json["type"], "queue_depth");
        assert_eq!(json["role"], "documenter");
        assert_eq!(json["depth"], 7);
    }
}
