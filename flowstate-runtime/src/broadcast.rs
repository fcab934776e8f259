//! State event fan-out for watchers.

use dashmap::DashMap;
use flowstate_core::{StateEvent, StateEventSink, StateKind};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Filter for global subscriptions.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for runs with these names (empty = all).
    pub run_names: Vec<String>,
    /// Only events FROM these kinds (empty = all).
    pub from_kinds: Vec<StateKind>,
    /// Only events TO these kinds (empty = all).
    pub to_kinds: Vec<StateKind>,
}

impl EventFilter {
    /// Only events entering one of `kinds`.
    pub fn entering(kinds: &[StateKind]) -> Self {
        Self {
            to_kinds: kinds.to_vec(),
            ..Default::default()
        }
    }

    /// Returns true if the event matches this filter.
    pub fn matches(&self, event: &StateEvent) -> bool {
        (self.run_names.is_empty() || self.run_names.contains(&event.run_name))
            && (self.from_kinds.is_empty()
                || event
                    .from_kind
                    .is_some_and(|from| self.from_kinds.contains(&from)))
            && (self.to_kinds.is_empty() || self.to_kinds.contains(&event.to_kind))
    }
}

/// Subscription type.
#[derive(Debug, Clone)]
pub enum SubscriptionType {
    /// Watch a specific run.
    Run { run_id: Uuid },
    /// Watch all runs (optionally filtered).
    All { filter: EventFilter },
}

/// Subscription info.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscription_id: String,
    pub subscription_type: SubscriptionType,
}

/// Receiving end of a subscription; skips events its filter rejects.
pub struct EventStream {
    receiver: broadcast::Receiver<StateEvent>,
    filter: EventFilter,
}

impl EventStream {
    /// Waits for the next matching event.
    ///
    /// Lagging receivers skip the dropped events and keep going.
    pub async fn recv(&mut self) -> Option<StateEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event already buffered, if any.
    pub fn try_recv(&mut self) -> Option<StateEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

/// Fans committed state events out to per-run and global channels.
pub struct EventBroadcaster {
    /// Per-run broadcast channels.
    channels: DashMap<Uuid, broadcast::Sender<StateEvent>>,

    global_sender: broadcast::Sender<StateEvent>,

    subscriptions: DashMap<String, Subscription>,

    channel_capacity: usize,
}

impl EventBroadcaster {
    /// Creates a new EventBroadcaster with the specified channel capacity.
    pub fn new(channel_capacity: usize) -> Self {
        let (global_sender, _) = broadcast::channel(channel_capacity);
        Self {
            channels: DashMap::new(),
            global_sender,
            subscriptions: DashMap::new(),
            channel_capacity,
        }
    }

    /// Subscribes to one run's events.
    ///
    /// Returns (subscription_id, stream).
    pub fn subscribe_run(&self, run_id: Uuid) -> (String, EventStream) {
        let subscription_id = format!("sub-{}", Uuid::new_v4());

        let receiver = self
            .channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe();

        self.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                subscription_id: subscription_id.clone(),
                subscription_type: SubscriptionType::Run { run_id },
            },
        );

        let stream = EventStream {
            receiver,
            filter: EventFilter::default(),
        };
        (subscription_id, stream)
    }

    /// Subscribes to all runs' events that pass `filter`.
    ///
    /// Returns (subscription_id, stream).
    pub fn subscribe_all(&self, filter: EventFilter) -> (String, EventStream) {
        let subscription_id = format!("sub-{}", Uuid::new_v4());
        let receiver = self.global_sender.subscribe();

        self.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                subscription_id: subscription_id.clone(),
                subscription_type: SubscriptionType::All {
                    filter: filter.clone(),
                },
            },
        );

        (subscription_id, EventStream { receiver, filter })
    }

    /// Unsubscribes from events.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    /// Sends an event to its run's channel and the global channel.
    pub fn notify(&self, event: StateEvent) {
        if let Some(sender) = self.channels.get(&event.run_id) {
            // No receivers is fine.
            let _ = sender.send(event.clone());
        }
        let _ = self.global_sender.send(event);
    }

    /// Drops per-run channels nobody listens to. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }

    pub fn get_subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions.get(subscription_id).map(|r| r.clone())
    }

    /// Returns the number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl StateEventSink for EventBroadcaster {
    fn publish(&self, event: StateEvent) {
        self.notify(event);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Creates a shared EventBroadcaster.
pub fn create_broadcaster(channel_capacity: usize) -> Arc<EventBroadcaster> {
    Arc::new(EventBroadcaster::new(channel_capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(run_id: Uuid, from: Option<StateKind>, to: StateKind) -> StateEvent {
        StateEvent {
            run_id,
            run_name: "nightly-report".to_string(),
            state_id: Uuid::new_v4(),
            from_kind: from,
            to_kind: to,
            message: None,
            timestamp: Utc::now(),
            sequence: 1,
        }
    }

    #[test]
    fn test_subscribe_run() {
        let broadcaster = EventBroadcaster::new(16);
        let run_id = Uuid::new_v4();
        let (sub_id, _stream) = broadcaster.subscribe_run(run_id);

        assert!(sub_id.starts_with("sub-"));
        let sub = broadcaster.get_subscription(&sub_id).unwrap();
        assert!(matches!(
            sub.subscription_type,
            SubscriptionType::Run { run_id: id } if id == run_id
        ));
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = EventBroadcaster::new(16);
        let (sub_id, _stream) = broadcaster.subscribe_run(Uuid::new_v4());

        assert!(broadcaster.unsubscribe(&sub_id));
        assert!(!broadcaster.unsubscribe(&sub_id));
        assert!(broadcaster.get_subscription(&sub_id).is_none());
        assert_eq!(broadcaster.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_notify_run() {
        let broadcaster = EventBroadcaster::new(16);
        let run_id = Uuid::new_v4();
        let (_, mut stream) = broadcaster.subscribe_run(run_id);

        broadcaster.notify(event(Uuid::new_v4(), None, StateKind::Scheduled));
        broadcaster.notify(event(run_id, Some(StateKind::Scheduled), StateKind::Running));

        let received = stream.recv().await.unwrap();
        assert_eq!(received.run_id, run_id);
        assert_eq!(received.to_kind, StateKind::Running);
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_global_filter() {
        let broadcaster = EventBroadcaster::new(16);
        let (_, mut stream) = broadcaster.subscribe_all(EventFilter::entering(&StateKind::TERMINAL));

        let run_id = Uuid::new_v4();
        broadcaster.publish(event(run_id, None, StateKind::Scheduled));
        broadcaster.publish(event(run_id, Some(StateKind::Scheduled), StateKind::Running));
        broadcaster.publish(event(run_id, Some(StateKind::Running), StateKind::Completed));

        let received = stream.recv().await.unwrap();
        assert_eq!(received.to_kind, StateKind::Completed);
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_event_filter_matches() {
        let run_id = Uuid::new_v4();
        let e = event(run_id, Some(StateKind::Running), StateKind::Failed);

        assert!(EventFilter::default().matches(&e));

        let filter = EventFilter {
            run_names: vec!["nightly-report".to_string()],
            ..Default::default()
        };
        assert!(filter.matches(&e));

        let filter = EventFilter {
            run_names: vec!["other".to_string()],
            ..Default::default()
        };
        assert!(!filter.matches(&e));

        let filter = EventFilter {
            from_kinds: vec![StateKind::Running],
            to_kinds: vec![StateKind::Failed, StateKind::Crashed],
            ..Default::default()
        };
        assert!(filter.matches(&e));

        let first = event(run_id, None, StateKind::Scheduled);
        let filter = EventFilter {
            from_kinds: vec![StateKind::Running],
            ..Default::default()
        };
        assert!(!filter.matches(&first));
    }

    #[test]
    fn test_prune_drops_idle_channels() {
        let broadcaster = EventBroadcaster::new(16);
        let (_, kept) = broadcaster.subscribe_run(Uuid::new_v4());
        let (_, dropped) = broadcaster.subscribe_run(Uuid::new_v4());
        drop(dropped);

        assert_eq!(broadcaster.channel_count(), 2);
        assert_eq!(broadcaster.prune(), 1);
        assert_eq!(broadcaster.channel_count(), 1);
        drop(kept);
    }
}
