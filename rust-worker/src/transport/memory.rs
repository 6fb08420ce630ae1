//! In-process queue and topic.
//!
//! [`MemoryQueue`] behaves like a hosted queue with a redrive policy: received
//! messages are hidden for the visibility timeout, every receive is counted and
//! a message received more than `max_receive_count` times is moved to the
//! dead-letter list instead of being delivered again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueBackend, RawMessage, ReceiptHandle, ReceiveParams, TopicBackend};
use crate::error::TransportError;

/// Default number of receives before a message is dead-lettered.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;

#[derive(Debug)]
struct Entry {
    id: u64,
    subject: Option<String>,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    messages: VecDeque<Entry>,
    dead_letters: Vec<String>,
}

/// In-memory queue with visibility timeouts and a dead-letter list.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    arrived: Notify,
    max_receive_count: u32,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECEIVE_COUNT)
    }
}

impl MemoryQueue {
    pub fn new(max_receive_count: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrived: Notify::new(),
            max_receive_count,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the queue usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a message.
    pub fn send(&self, body: impl Into<String>, subject: Option<&str>) {
        {
            let mut state = self.state();
            let id = state.next_id;
            state.next_id += 1;
            state.messages.push_back(Entry {
                id,
                subject: subject.map(str::to_string),
                body: body.into(),
                receive_count: 0,
                visible_at: Instant::now(),
                receipt: None,
            });
        }
        self.arrived.notify_waiters();
    }

    /// Messages still on the queue, visible or not.
    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently received and not yet visible again.
    pub fn inflight(&self) -> usize {
        let now = Instant::now();
        self.state()
            .messages
            .iter()
            .filter(|e| e.receipt.is_some() && e.visible_at > now)
            .count()
    }

    /// Bodies moved to the dead-letter list.
    pub fn dead_letters(&self) -> Vec<String> {
        self.state().dead_letters.clone()
    }

    /// Take what is visible now, or report when something next becomes visible.
    fn take_visible(&self, params: &ReceiveParams) -> Result<Vec<RawMessage>, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state();
        let State {
            messages,
            dead_letters,
            ..
        } = &mut *state;

        let mut taken = Vec::new();
        let mut next_visible: Option<Instant> = None;

        messages.retain_mut(|entry| {
            if entry.visible_at > now {
                next_visible = Some(next_visible.map_or(entry.visible_at, |n| n.min(entry.visible_at)));
                return true;
            }
            if taken.len() >= params.max_messages {
                return true;
            }

            entry.receive_count += 1;
            if entry.receive_count > self.max_receive_count {
                dead_letters.push(entry.body.clone());
                return false;
            }

            let receipt = format!("{}-{}", entry.id, entry.receive_count);
            entry.visible_at = now + params.visibility_timeout;
            entry.receipt = Some(receipt.clone());
            taken.push(RawMessage {
                subject: entry.subject.clone(),
                body: entry.body.clone(),
                receipt: ReceiptHandle::new(receipt),
            });
            true
        });

        if taken.is_empty() {
            Err(next_visible)
        } else {
            Ok(taken)
        }
    }

    fn with_entry<T>(
        &self,
        receipt: &ReceiptHandle,
        f: impl FnOnce(&mut State, usize) -> T,
    ) -> Result<T, TransportError> {
        let mut state = self.state();
        let position = state
            .messages
            .iter()
            .position(|e| e.receipt.as_deref() == Some(receipt.as_str()))
            .ok_or_else(|| TransportError::UnknownReceipt(receipt.to_string()))?;
        Ok(f(&mut *state, position))
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn receive(&self, params: &ReceiveParams) -> Result<Vec<RawMessage>, TransportError> {
        let deadline = Instant::now() + params.wait_time;

        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let wake = match self.take_visible(params) {
                Ok(messages) => return Ok(messages),
                Err(next_visible) => next_visible.map_or(deadline, |n| n.min(deadline)),
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = &mut arrived => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), TransportError> {
        self.with_entry(receipt, |state, position| {
            state.messages.remove(position);
        })
    }

    /// Makes the message visible immediately.
    async fn release(&self, receipt: &ReceiptHandle) -> Result<(), TransportError> {
        self.with_entry(receipt, |state, position| {
            let entry = &mut state.messages[position];
            entry.visible_at = Instant::now();
            entry.receipt = None;
        })?;
        self.arrived.notify_waiters();
        Ok(())
    }

    async fn reject(&self, receipt: &ReceiptHandle) -> Result<(), TransportError> {
        self.with_entry(receipt, |state, position| {
            if let Some(entry) = state.messages.remove(position) {
                state.dead_letters.push(entry.body);
            }
        })
    }
}

/// In-memory topic that fans out to subscribed [`MemoryQueue`]s.
#[derive(Debug, Default)]
pub struct MemoryTopic {
    subscribers: Mutex<Vec<Arc<MemoryQueue>>>,
}

impl MemoryTopic {
    pub fn subscribe(&self, queue: Arc<MemoryQueue>) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(queue);
    }
}

#[async_trait]
impl TopicBackend for MemoryTopic {
    async fn publish(&self, body: &str, subject: Option<&str>) -> Result<String, TransportError> {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for queue in subscribers {
            queue.send(body, subject);
        }

        Ok(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params(visibility_secs: u64) -> ReceiveParams {
        ReceiveParams {
            max_messages: 1,
            visibility_timeout: Duration::from_secs(visibility_secs),
            wait_time: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_message_is_invisible_until_timeout() {
        let queue = MemoryQueue::default();
        queue.send("a", Some("quake"));

        let first = queue.receive(&params(600)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].subject.as_deref(), Some("quake"));
        assert_eq!(queue.inflight(), 1);

        // Long poll returns empty while the only message is inflight.
        assert!(queue.receive(&params(600)).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(601)).await;
        let again = queue.receive(&params(600)).await.unwrap();
        assert_eq!(again[0].body, "a");
        assert_ne!(again[0].receipt, first[0].receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_message() {
        let queue = MemoryQueue::default();
        queue.send("a", None);

        let m = queue.receive(&params(600)).await.unwrap().remove(0);
        queue.delete(&m.receipt).await.unwrap();
        assert!(queue.is_empty());

        assert!(matches!(
            queue.delete(&m.receipt).await,
            Err(TransportError::UnknownReceipt(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_makes_message_visible() {
        let queue = MemoryQueue::default();
        queue.send("a", None);

        let m = queue.receive(&params(600)).await.unwrap().remove(0);
        queue.release(&m.receipt).await.unwrap();

        assert_eq!(queue.receive(&params(600)).await.unwrap()[0].body, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_redrive_after_max_receive_count() {
        let queue = MemoryQueue::new(2);
        queue.send("poison", None);

        for _ in 0..2 {
            assert_eq!(queue.receive(&params(10)).await.unwrap().len(), 1);
            tokio::time::advance(Duration::from_secs(11)).await;
        }

        assert!(queue.receive(&params(10)).await.unwrap().is_empty());
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters(), vec!["poison".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_dead_letters_immediately() {
        let queue = MemoryQueue::default();
        queue.send("bad", None);

        let m = queue.receive(&params(600)).await.unwrap().remove(0);
        queue.reject(&m.receipt).await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters(), vec!["bad".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = Arc::new(MemoryQueue::default());
        let receiver = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let p = ReceiveParams {
                    wait_time: Duration::from_secs(20),
                    ..params(600)
                };
                queue.receive(&p).await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.send("late", None);

        let got = receiver.await.unwrap().unwrap();
        assert_eq!(got[0].body, "late");
    }

    #[tokio::test]
    async fn test_topic_fans_out() {
        let topic = MemoryTopic::default();
        let a = Arc::new(MemoryQueue::default());
        let b = Arc::new(MemoryQueue::default());
        topic.subscribe(Arc::clone(&a));
        topic.subscribe(Arc::clone(&b));

        let id = topic.publish("{}", None).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
