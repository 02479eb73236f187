//! Update bus: the channel that carries committed edits between processes.
//!
//! Every server process opens exactly one subscription at startup, before it
//! accepts clients. The consumer loop records the highest sequence it has
//! received in a [`SequenceTracker`]; sessions use that value as their
//! snapshot watermark.

use crate::error::BusError;
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::{Pixel, UpdateEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Ordered, at-least-once publish/subscribe channel.
#[async_trait]
pub trait UpdateBus: Send + Sync {
    /// Publishes one event and returns the sequence the bus assigned to it.
    async fn publish(&self, pixels: &[Pixel]) -> Result<u64, BusError>;

    /// Opens a subscription receiving every event published from now on, in
    /// publish order.
    async fn subscribe(&self) -> Result<Subscription, BusError>;
}

/// Receiving end of a bus subscription.
///
/// Payloads arrive encoded; redeliveries (sequence not above the last one
/// seen) are dropped and gaps are logged.
pub struct Subscription {
    channel: String,
    payloads: mpsc::UnboundedReceiver<Vec<u8>>,
    last_sequence: u64,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, payloads: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payloads,
            last_sequence: 0,
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Next new event. `Err(BusError::Disconnected)` once the bus goes away;
    /// that condition is terminal.
    pub async fn next(&mut self) -> Result<UpdateEvent, BusError> {
        loop {
            let payload = self.payloads.recv().await.ok_or(BusError::Disconnected)?;
            let event = match UpdateEvent::decode(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Dropping malformed payload on '{}': {}", self.channel, e);
                    continue;
                }
            };

            if event.sequence <= self.last_sequence {
                debug!(
                    "Dropping redelivered event {} on '{}'",
                    event.sequence, self.channel
                );
                continue;
            }
            if self.last_sequence != 0 && event.sequence != self.last_sequence + 1 {
                warn!(
                    "Gap on '{}': expected event {}, got {}",
                    self.channel,
                    self.last_sequence + 1,
                    event.sequence
                );
            }

            self.last_sequence = event.sequence;
            return Ok(event);
        }
    }
}

/// In-process bus. Publishing is totally ordered by one lock, and every
/// subscriber owns an unbounded FIFO, so nothing is dropped for slow readers.
pub struct MemoryBus {
    channel: String,
    state: Mutex<MemoryBusState>,
}

struct MemoryBusState {
    next_sequence: u64,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    closed: bool,
}

impl MemoryBus {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            state: Mutex::new(MemoryBusState {
                next_sequence: 1,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Simulates losing the bus: every open subscription terminates and
    /// later calls fail.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.subscribers.clear();
        info!("Bus channel '{}' closed", self.channel);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }
}

#[async_trait]
impl UpdateBus for MemoryBus {
    async fn publish(&self, pixels: &[Pixel]) -> Result<u64, BusError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Unavailable(format!(
                "channel '{}' is closed",
                self.channel
            )));
        }

        let event = UpdateEvent {
            sequence: state.next_sequence,
            pixels: pixels.to_vec(),
        };
        let payload = event.encode().map_err(|e| BusError::Codec(e.to_string()))?;
        state.next_sequence += 1;

        // Subscribers whose receiving end is gone are pruned here.
        state
            .subscribers
            .retain(|subscriber| subscriber.send(payload.clone()).is_ok());
        Ok(event.sequence)
    }

    async fn subscribe(&self) -> Result<Subscription, BusError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Unavailable(format!(
                "channel '{}' is closed",
                self.channel
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        Ok(Subscription::new(self.channel.clone(), rx))
    }
}

/// Highest bus sequence this process has received so far.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_received: AtomicU64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sequence: u64) {
        self.last_received.fetch_max(sequence, Ordering::SeqCst);
    }

    pub fn last_received(&self) -> u64 {
        self.last_received.load(Ordering::SeqCst)
    }
}

/// Drains the process subscription into the batcher.
///
/// The sequence is recorded before the event is forwarded, so any event
/// that can show up in a flushed batch is already covered by the tracker.
/// Returns `Ok` when the batcher side hangs up and
/// `Err(BusError::Disconnected)` when the bus does.
pub async fn run_consumer(
    mut subscription: Subscription,
    tracker: Arc<SequenceTracker>,
    events: mpsc::Sender<UpdateEvent>,
) -> Result<(), BusError> {
    loop {
        let event = subscription.next().await?;
        tracker.record(event.sequence);
        if events.send(event).await.is_err() {
            info!("Batcher stopped, ending bus consumer");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequences() {
        let bus = MemoryBus::new("test");
        let first = assert_ok!(bus.publish(&[Pixel::new(0, 0, 1)]).await);
        let second = assert_ok!(bus.publish(&[Pixel::new(1, 0, 1)]).await);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_publish_order() {
        let bus = MemoryBus::new("test");
        let mut first = bus.subscribe().await.unwrap();
        let mut second = bus.subscribe().await.unwrap();

        for x in 0..5 {
            bus.publish(&[Pixel::new(x, 0, 2)]).await.unwrap();
        }

        for subscription in [&mut first, &mut second] {
            for x in 0..5 {
                let event = subscription.next().await.unwrap();
                assert_eq!(event.sequence, x as u64 + 1);
                assert_eq!(event.pixels, vec![Pixel::new(x, 0, 2)]);
            }
        }
    }

    #[tokio::test]
    async fn test_subscription_starts_at_subscribe_time() {
        let bus = MemoryBus::new("test");
        bus.publish(&[Pixel::new(0, 0, 1)]).await.unwrap();

        let mut subscription = bus.subscribe().await.unwrap();
        bus.publish(&[Pixel::new(1, 1, 1)]).await.unwrap();

        let event = subscription.next().await.unwrap();
        assert_eq!(event.sequence, 2);
    }

    #[tokio::test]
    async fn test_redelivered_events_are_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscription = Subscription::new("test", rx);
        let event = |sequence| {
            UpdateEvent {
                sequence,
                pixels: vec![Pixel::new(0, 0, 1)],
            }
            .encode()
            .unwrap()
        };

        tx.send(event(1)).unwrap();
        tx.send(event(1)).unwrap();
        tx.send(b"garbage".to_vec()).unwrap();
        tx.send(event(2)).unwrap();
        tx.send(event(5)).unwrap();

        assert_eq!(subscription.next().await.unwrap().sequence, 1);
        assert_eq!(subscription.next().await.unwrap().sequence, 2);
        // A gap is reported but the event is still delivered.
        assert_eq!(subscription.next().await.unwrap().sequence, 5);
        assert_eq!(subscription.last_sequence(), 5);
    }

    #[tokio::test]
    async fn test_closing_bus_terminates_subscriptions() {
        let bus = MemoryBus::new("test");
        let mut subscription = bus.subscribe().await.unwrap();
        bus.close().await;

        assert_eq!(subscription.next().await, Err(BusError::Disconnected));
        assert!(matches!(
            bus.publish(&[Pixel::new(0, 0, 0)]).await,
            Err(BusError::Unavailable(_))
        ));
        assert!(bus.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriptions_are_pruned() {
        let bus = MemoryBus::new("test");
        let kept = bus.subscribe().await.unwrap();
        drop(bus.subscribe().await.unwrap());
        assert_eq!(bus.subscriber_count().await, 2);

        bus.publish(&[Pixel::new(0, 0, 0)]).await.unwrap();
        assert_eq!(bus.subscriber_count().await, 1);
        drop(kept);
    }

    #[test]
    fn test_tracker_never_moves_backwards() {
        let tracker = SequenceTracker::new();
        tracker.record(4);
        tracker.record(2);
        assert_eq!(tracker.last_received(), 4);
    }

    #[tokio::test]
    async fn test_consumer_records_then_forwards() {
        let bus = MemoryBus::new("test");
        let subscription = bus.subscribe().await.unwrap();
        let tracker = Arc::new(SequenceTracker::new());
        let (tx, mut rx) = mpsc::channel(8);
        let consumer = tokio::spawn(run_consumer(subscription, tracker.clone(), tx));

        bus.publish(&[Pixel::new(2, 3, 4)]).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.pixels, vec![Pixel::new(2, 3, 4)]);
        assert!(tracker.last_received() >= event.sequence);

        bus.close().await;
        assert_eq!(consumer.await.unwrap(), Err(BusError::Disconnected));
    }

    #[tokio::test]
    async fn test_consumer_stops_when_batcher_is_gone() {
        let bus = MemoryBus::new("test");
        let subscription = bus.subscribe().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let consumer = tokio::spawn(run_consumer(
            subscription,
            Arc::new(SequenceTracker::new()),
            tx,
        ));

        bus.publish(&[Pixel::new(0, 0, 0)]).await.unwrap();
        assert_eq!(consumer.await.unwrap(), Ok(()));
    }
}
