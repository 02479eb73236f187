//! Time-windowed coalescing of bus events into `LIVE_UPDATE` packets.
//!
//! Windows are fixed: the first event of an idle batcher sets the deadline
//! and later events join the batch without moving it. A zero window flushes
//! every event as soon as it arrives.

use async_trait::async_trait;
use log::{debug, error, info};
use shared::{Pixel, ServerPacket, UpdateEvent};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

/// A committed pixel together with the bus sequence of the event carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencedPixel {
    pub sequence: u64,
    pub pixel: Pixel,
}

/// One flushed window, shared by every session it is sent to.
///
/// The packet is encoded once; sessions whose watermark falls inside the
/// batch get a filtered re-encoding instead.
#[derive(Debug)]
pub struct LiveBatch {
    pixels: Vec<SequencedPixel>,
    encoded: String,
}

impl LiveBatch {
    pub fn new(pixels: Vec<SequencedPixel>) -> Result<Self, serde_json::Error> {
        let encoded = encode_live_update(pixels.iter())?;
        Ok(Self { pixels, encoded })
    }

    pub fn pixels(&self) -> &[SequencedPixel] {
        &self.pixels
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.pixels.first().map(|p| p.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.pixels.last().map(|p| p.sequence)
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// The packet a session with the given watermark should receive, or
    /// `None` when every pixel is already covered by its snapshot.
    pub fn render_after(&self, watermark: u64) -> Result<Option<Cow<'_, str>>, serde_json::Error> {
        match self.first_sequence() {
            None => Ok(None),
            Some(first) if first > watermark => Ok(Some(Cow::Borrowed(&self.encoded))),
            Some(_) => {
                let mut remaining = self
                    .pixels
                    .iter()
                    .filter(|p| p.sequence > watermark)
                    .peekable();
                if remaining.peek().is_none() {
                    return Ok(None);
                }
                Ok(Some(Cow::Owned(encode_live_update(remaining)?)))
            }
        }
    }
}

fn encode_live_update<'a>(
    pixels: impl Iterator<Item = &'a SequencedPixel>,
) -> Result<String, serde_json::Error> {
    ServerPacket::LiveUpdate(pixels.map(|p| p.pixel).collect()).to_json()
}

/// Receives flushed batches. Implemented by the hub.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn deliver(&self, batch: Arc<LiveBatch>);
}

/// Accumulation state of one window.
#[derive(Debug)]
pub struct Batcher {
    window: Duration,
    pending: Vec<SequencedPixel>,
    deadline: Option<Instant>,
}

impl Batcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            deadline: None,
        }
    }

    /// Adds an event's pixels. Opens a window if none is open.
    pub fn push(&mut self, event: UpdateEvent, now: Instant) {
        if event.pixels.is_empty() {
            return;
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
        let sequence = event.sequence;
        self.pending.extend(
            event
                .pixels
                .into_iter()
                .map(|pixel| SequencedPixel { sequence, pixel }),
        );
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Closes the current window. `None` if nothing accumulated.
    pub fn flush(&mut self) -> Option<Vec<SequencedPixel>> {
        self.deadline = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Owns the flush timer. Runs until `events` closes, then flushes what it
/// holds and returns.
pub async fn run_batcher(
    mut events: mpsc::Receiver<UpdateEvent>,
    window: Duration,
    sink: Arc<dyn BatchSink>,
) {
    let mut batcher = Batcher::new(window);
    info!("Batcher started with a {:?} window", window);

    loop {
        let next = match batcher.deadline() {
            Some(deadline) => {
                tokio::select! {
                    event = events.recv() => event,
                    _ = sleep_until(deadline) => {
                        flush(&mut batcher, sink.as_ref()).await;
                        continue;
                    }
                }
            }
            None => events.recv().await,
        };

        match next {
            Some(event) => {
                batcher.push(event, Instant::now());
                if batcher.is_due(Instant::now()) {
                    flush(&mut batcher, sink.as_ref()).await;
                }
            }
            None => {
                flush(&mut batcher, sink.as_ref()).await;
                info!("Event stream closed, batcher stopping");
                return;
            }
        }
    }
}

async fn flush(batcher: &mut Batcher, sink: &dyn BatchSink) {
    let Some(pixels) = batcher.flush() else {
        return;
    };
    match LiveBatch::new(pixels) {
        Ok(batch) => {
            debug!("Flushing batch of {} pixels", batch.len());
            sink.deliver(Arc::new(batch)).await;
        }
        Err(e) => error!("Failed to encode live update: {}", e),
    }
}
