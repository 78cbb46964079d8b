//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. The bus is the only way the core talks to its external
//! collaborators (alerting, persistence, fleet telemetry).
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Decisions`] | One `CycleRecord` per vehicle per cycle |
//! | [`Topic::Alerts`] | Degraded mode, human takeover, hard faults, operator stop |
//! | [`Topic::Telemetry`] | Per-cycle sensor health reports |
//! | [`Topic::History`] | Avoidance records whose outcome is known |

use drivecore_types::{DriveError, Event};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Decisions,
    Alerts,
    Telemetry,
    History,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Decisions, Topic::Alerts, Topic::Telemetry, Topic::History];
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    decisions: broadcast::Sender<Event>,
    alerts: broadcast::Sender<Event>,
    telemetry: broadcast::Sender<Event>,
    history: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (decisions, _) = broadcast::channel(capacity);
        let (alerts, _) = broadcast::channel(capacity);
        let (telemetry, _) = broadcast::channel(capacity);
        let (history, _) = broadcast::channel(capacity);
        Self {
            decisions,
            alerts,
            telemetry,
            history,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`DriveError::Channel`] when nobody is listening on the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, DriveError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| DriveError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to `topic`, keeping only events whose `source` starts with
    /// `prefix` (e.g. one vehicle's id).
    pub fn subscribe_source(&self, topic: Topic, prefix: impl Into<String>) -> SourceSubscriber {
        SourceSubscriber {
            prefix: prefix.into(),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Decisions => &self.decisions,
            Topic::Alerts => &self.alerts,
            Topic::Telemetry => &self.telemetry,
            Topic::History => &self.history,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, for synchronous consumers such as replay.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

// ---------------------------------------------------------------------------
// Source-prefix subscriber
// ---------------------------------------------------------------------------

/// Delivers only events whose `source` starts with the given prefix.
pub struct SourceSubscriber {
    prefix: String,
    receiver: broadcast::Receiver<Event>,
}

impl SourceSubscriber {
    /// Wait for the next matching event.
    ///
    /// Returns `None` when the bus is closed and no further events will arrive.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.source.starts_with(&self.prefix) => {
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(prefix = %self.prefix, lagged_by = n, "SourceSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecore_types::{Alert, AlertKind, EventPayload, VehicleId};

    fn make_event(source: &str) -> Event {
        let vehicle = source.split("::").next().unwrap_or_default();
        Event::new(
            source,
            EventPayload::Alert(Alert {
                vehicle_id: VehicleId::new(vehicle),
                kind: AlertKind::HumanTakeover,
                message: "test".into(),
            }),
        )
    }

    #[test]
    fn publish_without_subscribers_is_a_channel_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::Decisions, make_event("av-1::pipeline"));
        assert!(matches!(result, Err(DriveError::Channel(_))));
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::Alerts);
        let mut subscriber2 = bus.subscribe_to(Topic::Alerts);
        assert_eq!(bus.subscriber_count(Topic::Alerts), 2);

        let event = make_event("av-1::pipeline");
        assert_eq!(bus.publish_to(Topic::Alerts, event.clone())?, 2);

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    /// Topics are separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts_sub = bus.subscribe_to(Topic::Alerts);
        let _decisions_sub = bus.subscribe_to(Topic::Decisions);

        bus.publish_to(Topic::Decisions, make_event("av-1::pipeline"))?;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), alerts_sub.recv()).await;
        assert!(result.is_err(), "Alerts subscriber must not receive a Decisions event");
        assert!(matches!(
            alerts_sub.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn source_subscriber_filters_by_vehicle() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_source(Topic::Alerts, "av-2::");

        bus.publish_to(Topic::Alerts, make_event("av-1::pipeline"))?;
        let good = make_event("av-2::pipeline");
        bus.publish_to(Topic::Alerts, good.clone())?;

        let received = sub.recv().await.ok_or("No event received")?;
        assert_eq!(received.id, good.id);
        Ok(())
    }

    /// Flooding a low-capacity channel while a subscriber sleeps must produce
    /// a `Lagged` error rather than panicking or blocking.
    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        const CAPACITY: usize = 64;
        let bus = EventBus::new(CAPACITY);
        let mut slow_sub = bus.subscribe_to(Topic::Decisions);

        for _ in 0..1_000 {
            let _ = bus.publish_to(Topic::Decisions, make_event("flood::pipeline"));
        }

        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
