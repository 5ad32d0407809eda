//! Per-subscriber event queues for task status streams.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: when a
//! queue is full its oldest event is dropped and counted. The terminal
//! event is always enqueued last and is never the one dropped, so a
//! subscriber always ends its stream on it.

use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use switchboard_core::{SwitchboardError, TaskEvent, TaskId};
use tokio::sync::Notify;
use tracing::warn;

struct QueueState {
    buffer: VecDeque<TaskEvent>,
    dropped: u64,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    detached: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity.min(64)),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            detached: AtomicBool::new(false),
        }
    }

    fn push(&self, event: TaskEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.buffer.len() >= self.capacity {
                state.buffer.pop_front();
                state.dropped += 1;
                let overflow = SwitchboardError::SubscriberOverflow {
                    task_id: event.task_id.to_string(),
                    dropped: state.dropped,
                };
                warn!(task_id = %event.task_id, error = %overflow, "Dropped oldest event for slow subscriber");
            }
            if event.is_terminal() {
                state.closed = true;
            }
            state.buffer.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Fan-out point for one task's events. Lives inside the task's slot and is
/// only touched while the task's lock is held, which keeps delivery order
/// identical to emission order.
pub(crate) struct FanOut {
    capacity: usize,
    subscribers: Vec<Arc<SubscriberQueue>>,
}

impl FanOut {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: Vec::new(),
        }
    }

    /// Attaches a subscriber. `backlog` is enqueued before any live event.
    pub(crate) fn subscribe(
        &mut self,
        task_id: TaskId,
        backlog: impl IntoIterator<Item = TaskEvent>,
    ) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new(self.capacity));
        for event in backlog {
            queue.push(event);
        }
        let closed = queue.state.lock().closed;
        if !closed {
            self.subscribers.push(queue.clone());
        }
        Subscription {
            task_id,
            queue,
            finished: false,
        }
    }

    /// Delivers `event` to every live subscriber, pruning dropped ones.
    /// Subscribers are released after the terminal event.
    pub(crate) fn publish(&mut self, event: &TaskEvent) {
        self.subscribers
            .retain(|q| !q.detached.load(Ordering::Acquire));
        for queue in &self.subscribers {
            queue.push(event.clone());
        }
        if event.is_terminal() {
            self.subscribers.clear();
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|q| !q.detached.load(Ordering::Acquire))
            .count()
    }
}

/// A task's status events from the moment of subscription onward.
///
/// Finite: after the terminal event has been yielded, [`next`](Self::next)
/// returns `None`.
pub struct Subscription {
    task_id: TaskId,
    queue: Arc<SubscriberQueue>,
    finished: bool,
}

impl Subscription {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Waits for the next event.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        loop {
            if self.finished {
                return None;
            }
            {
                let mut state = self.queue.state.lock();
                if let Some(event) = state.buffer.pop_front() {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                if state.closed {
                    self.finished = true;
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Returns an event if one is already buffered.
    pub fn try_next(&mut self) -> Option<TaskEvent> {
        if self.finished {
            return None;
        }
        let event = self.queue.state.lock().buffer.pop_front()?;
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Events dropped from this subscriber's buffer so far.
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    /// A `SubscriberOverflow` error describing drops, if any happened.
    pub fn overflow(&self) -> Option<SwitchboardError> {
        let dropped = self.dropped();
        (dropped > 0).then(|| SwitchboardError::SubscriberOverflow {
            task_id: self.task_id.to_string(),
            dropped,
        })
    }

    /// Adapts the subscription into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> + Send {
        stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.detached.store(true, Ordering::Release);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;
    use switchboard_core::{TaskError, TaskEventKind};

    fn event(task_id: TaskId, seq: u64, kind: TaskEventKind) -> TaskEvent {
        TaskEvent {
            seq,
            task_id,
            kind,
            at: Utc::now(),
        }
    }

    fn progress(task_id: TaskId, seq: u64) -> TaskEvent {
        event(task_id, seq, TaskEventKind::progress(format!("step {seq}")))
    }

    #[tokio::test]
    async fn test_live_events_in_order_then_end() {
        let id = TaskId::new();
        let mut fan = FanOut::new(8);
        let mut sub = fan.subscribe(id, Vec::new());

        fan.publish(&progress(id, 0));
        fan.publish(&progress(id, 1));
        fan.publish(&event(id, 2, TaskEventKind::Canceled));

        assert_eq!(sub.next().await.unwrap().seq, 0);
        assert_eq!(sub.next().await.unwrap().seq, 1);
        assert!(sub.next().await.unwrap().is_terminal());
        assert!(sub.next().await.is_none());
        assert_eq!(fan.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_but_keeps_terminal() {
        let id = TaskId::new();
        let mut fan = FanOut::new(2);
        let mut sub = fan.subscribe(id, Vec::new());

        for seq in 0..5 {
            fan.publish(&progress(id, seq));
        }
        fan.publish(&event(
            id,
            5,
            TaskEventKind::Failed {
                error: TaskError::agent("boom"),
            },
        ));

        let mut seen = Vec::new();
        while let Some(ev) = sub.next().await {
            seen.push(ev.seq);
        }
        assert_eq!(seen, vec![4, 5]);
        assert_eq!(sub.dropped(), 4);
        assert!(matches!(
            sub.overflow(),
            Some(SwitchboardError::SubscriberOverflow { dropped: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_backlog_with_terminal_ends_immediately() {
        let id = TaskId::new();
        let mut fan = FanOut::new(4);
        let sub = fan.subscribe(id, vec![event(id, 3, TaskEventKind::Canceled)]);
        assert_eq!(fan.subscriber_count(), 0);

        let events: Vec<TaskEvent> = sub.into_stream().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 3);
    }

    #[tokio::test]
    async fn test_waiting_subscriber_is_woken() {
        let id = TaskId::new();
        let mut fan = FanOut::new(4);
        let mut sub = fan.subscribe(id, Vec::new());

        let reader = tokio::spawn(async move { sub.next().await.map(|e| e.seq) });
        tokio::task::yield_now().await;
        fan.publish(&progress(id, 0));
        assert_eq!(reader.await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let id = TaskId::new();
        let mut fan = FanOut::new(4);
        let sub = fan.subscribe(id, Vec::new());
        let _kept = fan.subscribe(id, Vec::new());
        assert_eq!(fan.subscriber_count(), 2);
        drop(sub);
        fan.publish(&progress(id, 0));
        assert_eq!(fan.subscriber_count(), 1);
    }
}
