//! In-process event broker.
//!
//! Publishers push onto a bounded ingress channel; a single dispatcher task
//! serializes each event once and fans it out to every subscriber with a
//! non-blocking send. A subscriber whose buffer is full is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::Event;

/// Capacity of the ingress channel and of each subscriber's buffer.
pub const EVENT_BUFFER: usize = 256;

type Subscribers = Arc<RwLock<HashMap<u64, mpsc::Sender<Arc<str>>>>>;

enum Control {
    Register(u64, mpsc::Sender<Arc<str>>),
    Unregister(u64),
}

/// Handle used to publish events and register subscribers.
#[derive(Clone)]
pub struct EventHub {
    ingress: Option<mpsc::Sender<Event>>,
    control: Option<mpsc::UnboundedSender<Control>>,
    subscribers: Subscribers,
    next_id: Arc<AtomicU64>,
}

/// A registered subscriber. Dropping it unregisters.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    control: Option<mpsc::UnboundedSender<Control>>,
}

impl Subscription {
    /// Wait for the next serialized event; `None` once the hub dropped us.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(Control::Unregister(self.id));
        }
    }
}

impl EventHub {
    /// Start the dispatcher on `tracker`; it stops when `cancel` fires.
    pub fn spawn(tracker: &TaskTracker, cancel: CancellationToken) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(EVENT_BUFFER);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));

        tracker.spawn(dispatch(ingress_rx, control_rx, subscribers.clone(), cancel));

        Self {
            ingress: Some(ingress_tx),
            control: Some(control_tx),
            subscribers,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A hub that discards everything, for offline commands and tests.
    pub fn noop() -> Self {
        Self {
            ingress: None,
            control: None,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish without blocking. A full ingress drops the event.
    pub fn publish(&self, event: Event) {
        let Some(ingress) = &self.ingress else {
            return;
        };
        match ingress.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event_type = event.type_name(), "event hub ingress full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(event_type = event.type_name(), "event hub stopped, dropping event");
            }
        }
    }

    /// Register a new subscriber with a buffer of [`EVENT_BUFFER`] messages.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        if let Some(control) = &self.control {
            let _ = control.send(Control::Register(id, tx));
        }
        Subscription {
            id,
            rx,
            control: self.control.clone(),
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn dispatch(
    mut ingress: mpsc::Receiver<Event>,
    mut control: mpsc::UnboundedReceiver<Control>,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(msg) = control.recv() => handle_control(&subscribers, msg),
            Some(event) = ingress.recv() => broadcast(&subscribers, &event),
            else => break,
        }
    }

    subscribers
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
    tracing::debug!("event hub stopped");
}

fn handle_control(subscribers: &Subscribers, msg: Control) {
    let mut subs = subscribers.write().unwrap_or_else(PoisonError::into_inner);
    match msg {
        Control::Register(id, tx) => {
            subs.insert(id, tx);
            tracing::info!(subscriber = id, subscribers = subs.len(), "event subscriber registered");
        }
        Control::Unregister(id) => {
            if subs.remove(&id).is_some() {
                tracing::debug!(subscriber = id, subscribers = subs.len(), "event subscriber unregistered");
            }
        }
    }
}

fn broadcast(subscribers: &Subscribers, event: &Event) {
    let payload: Arc<str> = match serde_json::to_string(event) {
        Ok(json) => json.into(),
        Err(e) => {
            tracing::warn!(event_type = event.type_name(), error = %e, "failed to serialize event");
            return;
        }
    };

    let mut evicted = Vec::new();
    {
        let subs = subscribers.read().unwrap_or_else(PoisonError::into_inner);
        for (id, tx) in subs.iter() {
            if tx.try_send(payload.clone()).is_err() {
                evicted.push(*id);
            }
        }
    }

    if !evicted.is_empty() {
        let mut subs = subscribers.write().unwrap_or_else(PoisonError::into_inner);
        for id in evicted {
            if subs.remove(&id).is_some() {
                tracing::warn!(subscriber = id, event_type = event.type_name(), "dropping slow event subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IssueStatus;
    use std::time::Duration;

    fn event(n: usize) -> Event {
        Event::status_changed(&format!("issue-{}", n), IssueStatus::Open, IssueStatus::Active)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let hub = EventHub::spawn(&tracker, cancel.clone());
        let mut sub = hub.subscribe();

        for n in 0..3 {
            hub.publish(event(n));
        }
        for n in 0..3 {
            let msg = sub.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
            assert_eq!(value["data"]["issue_id"], format!("issue-{}", n));
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let hub = EventHub::spawn(&tracker, cancel.clone());
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();
        settle().await;
        assert_eq!(hub.subscriber_count(), 2);

        let fast_reader = tokio::spawn(async move {
            let mut seen = 0;
            while seen < EVENT_BUFFER + 1 {
                if fast.recv().await.is_none() {
                    break;
                }
                seen += 1;
            }
            seen
        });

        for n in 0..=EVENT_BUFFER {
            hub.publish(event(n));
            if n % 64 == 0 {
                settle().await;
            }
        }
        settle().await;

        assert_eq!(hub.subscriber_count(), 1);
        let mut drained = 0;
        while slow.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, EVENT_BUFFER);
        assert_eq!(fast_reader.await.unwrap(), EVENT_BUFFER + 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let hub = EventHub::spawn(&tracker, cancel.clone());
        let sub = hub.subscribe();
        settle().await;
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        settle().await;
        assert_eq!(hub.subscriber_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_noop_hub_discards() {
        let hub = EventHub::noop();
        let mut sub = hub.subscribe();
        hub.publish(event(1));
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
