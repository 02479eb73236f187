//! Live session registry and fan-out of flushed batches
//!
//! This module owns the set of sessions connected to this process:
//! - Session registration with id allocation and capacity limits
//! - Per-session outboxes that buffer live updates during the snapshot handoff
//! - Concurrent, deadline-bounded broadcast of every flushed batch
//! - Eviction of sessions whose sends fail or stall
//!
//! The registry lock is only ever held to copy or mutate the session map,
//! never across a network send.

use crate::batcher::{BatchSink, LiveBatch};
use crate::config::ServerConfig;
use crate::error::{HubError, TransportError};
use crate::transport::Connection;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard, Notify, RwLock};
use tokio::time::timeout;

pub type SessionId = u64;

/// Outcome of handing one batch to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The session is still receiving its snapshot; the batch is queued.
    Buffered,
    /// Every pixel in the batch is already part of the session's snapshot.
    Skipped,
}

/// Per-session send state, guarded by the outbox lock.
#[derive(Debug)]
struct Outbox {
    /// Highest bus sequence already reflected in the session's snapshot.
    watermark: u64,
    /// `Some` until the snapshot has been sent.
    buffered: Option<Vec<Arc<LiveBatch>>>,
}

/// Exclusive send access to a live session, see [`SessionHandle::hold_batches`].
pub struct ReplyGuard<'a> {
    handle: &'a SessionHandle,
    _outbox: MutexGuard<'a, Outbox>,
}

impl ReplyGuard<'_> {
    pub async fn send(&self, text: String, send_timeout: Duration) -> Result<(), TransportError> {
        self.handle.send_with_deadline(text, send_timeout).await
    }
}

/// A registered session as the hub sees it
///
/// Each handle holds:
/// - Identity and join time
/// - The outbound connection
/// - An outbox lock that serializes every write to that connection
/// - A termination signal raised when the hub evicts the session
pub struct SessionHandle {
    id: SessionId,
    joined_at: Instant,
    connection: Arc<dyn Connection>,
    outbox: Mutex<Outbox>,
    terminated: AtomicBool,
    terminate_signal: Notify,
}

impl SessionHandle {
    /// Creates a handle in buffering mode
    ///
    /// Broadcasts reaching the session before `complete_handoff` are queued
    /// so that nothing can overtake the snapshot.
    pub fn new(id: SessionId, connection: Arc<dyn Connection>) -> Self {
        Self {
            id,
            joined_at: Instant::now(),
            connection,
            outbox: Mutex::new(Outbox {
                watermark: 0,
                buffered: Some(Vec::new()),
            }),
            terminated: AtomicBool::new(false),
            terminate_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Records the sequence watermark of the snapshot about to be read
    ///
    /// Must be called after registration and before the snapshot read.
    /// Live pixels at or below the watermark are never sent to this session.
    pub async fn begin_handoff(&self, watermark: u64) {
        self.outbox.lock().await.watermark = watermark;
    }

    /// Sends the snapshot, drains buffered batches and switches to live mode
    ///
    /// Holds the outbox lock throughout, so concurrent broadcasts wait and
    /// land after the drained batches. Returns the number of drained packets
    /// actually sent.
    pub async fn complete_handoff(
        &self,
        snapshot: String,
        send_timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut outbox = self.outbox.lock().await;
        self.send_with_deadline(snapshot, send_timeout).await?;

        let buffered = outbox.buffered.take().unwrap_or_default();
        let mut drained = 0;
        for batch in buffered {
            if let Some(text) = render(&batch, outbox.watermark)? {
                self.send_with_deadline(text, send_timeout).await?;
                drained += 1;
            }
        }
        debug!(
            "Session {} live after snapshot (watermark {}, {} drained)",
            self.id, outbox.watermark, drained
        );
        Ok(drained)
    }

    /// Holds back batches for this session until the guard is dropped
    ///
    /// Used for replies built from store state: a batch older than that
    /// state cannot land after the reply and overwrite it.
    pub async fn hold_batches(&self) -> ReplyGuard<'_> {
        ReplyGuard {
            handle: self,
            _outbox: self.outbox.lock().await,
        }
    }

    /// Hands one batch to this session
    ///
    /// Queues it while the snapshot handoff is in progress, otherwise sends
    /// the portion newer than the watermark under `send_timeout`.
    pub async fn deliver(
        &self,
        batch: &Arc<LiveBatch>,
        send_timeout: Duration,
    ) -> Result<Delivery, TransportError> {
        let mut outbox = self.outbox.lock().await;
        if let Some(buffered) = outbox.buffered.as_mut() {
            buffered.push(batch.clone());
            return Ok(Delivery::Buffered);
        }

        match render(batch, outbox.watermark)? {
            Some(text) => {
                self.send_with_deadline(text, send_timeout).await?;
                Ok(Delivery::Sent)
            }
            None => Ok(Delivery::Skipped),
        }
    }

    async fn send_with_deadline(
        &self,
        text: String,
        send_timeout: Duration,
    ) -> Result<(), TransportError> {
        match timeout(send_timeout, self.connection.send(text)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(send_timeout)),
        }
    }

    /// Signals the session's tasks to stop. Idempotent.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.terminate_signal.notify_one();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Resolves once `terminate` has been called.
    pub async fn terminated(&self) {
        if self.is_terminated() {
            return;
        }
        self.terminate_signal.notified().await;
    }
}

fn render(batch: &LiveBatch, watermark: u64) -> Result<Option<String>, TransportError> {
    batch
        .render_after(watermark)
        .map(|text| text.map(|t| t.into_owned()))
        .map_err(encode_error)
}

fn encode_error(e: serde_json::Error) -> TransportError {
    TransportError::Io(format!("failed to encode live update: {}", e))
}

/// Registry of sessions connected to this process
///
/// Allocates session ids (starting at 1) and enforces an optional capacity.
/// Holds no other state; the hub wraps it in a reader-writer lock.
pub struct SessionRegistry {
    /// Registered sessions indexed by id
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    /// Next id handed out by `add_session`
    next_session_id: SessionId,
    /// Maximum number of concurrent sessions, if limited
    max_sessions: Option<usize>,
}

impl SessionRegistry {
    /// Creates an empty registry with an optional capacity limit
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            max_sessions,
        }
    }

    /// Registers a new session for `connection`
    ///
    /// Fails with `HubError::Full` when the registry is at capacity. The
    /// returned handle starts in buffering mode.
    pub fn add_session(
        &mut self,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<SessionHandle>, HubError> {
        if let Some(max) = self.max_sessions {
            if self.sessions.len() >= max {
                return Err(HubError::Full(max));
            }
        }

        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let handle = Arc::new(SessionHandle::new(session_id, connection));
        self.sessions.insert(session_id, handle.clone());
        info!("Session {} registered", session_id);
        Ok(handle)
    }

    /// Removes a session, returning its handle if it was still registered
    ///
    /// Only the caller that receives `Some` may close the connection, which
    /// makes every cleanup path close it at most once.
    pub fn remove_session(&mut self, session_id: &SessionId) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.remove(session_id);
        if removed.is_some() {
            info!("Session {} unregistered", session_id);
        }
        removed
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).cloned()
    }

    /// Copies out every handle so callers can release the lock before I/O
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.values().cloned().collect()
    }

    /// Removes every session at once
    pub fn drain(&mut self) -> Vec<Arc<SessionHandle>> {
        self.sessions.drain().map(|(_, handle)| handle).collect()
    }

    /// Returns the number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Counts from one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions that were sent the batch or queued it during their handoff.
    pub delivered: usize,
    /// Sessions for which the whole batch predates their snapshot.
    pub skipped: usize,
    /// Sessions removed because their send failed or timed out.
    pub evicted: usize,
}

/// The process-wide connection hub
#[derive(Clone)]
pub struct Hub {
    registry: Arc<RwLock<SessionRegistry>>,
    send_timeout: Duration,
    concurrency: usize,
}

impl Hub {
    pub fn new(max_sessions: Option<usize>, send_timeout: Duration, concurrency: usize) -> Self {
        Self {
            registry: Arc::new(RwLock::new(SessionRegistry::new(max_sessions))),
            send_timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.max_sessions,
            config.send_timeout,
            config.broadcast_concurrency,
        )
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Adds a session in buffering mode; later broadcasts reach it
    pub async fn register(
        &self,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<SessionHandle>, HubError> {
        self.registry.write().await.add_session(connection)
    }

    /// Removes a session. Returns false if it was already gone.
    pub async fn unregister(&self, session_id: SessionId) -> bool {
        self.registry
            .write()
            .await
            .remove_session(&session_id)
            .is_some()
    }

    pub async fn session_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn contains(&self, session_id: SessionId) -> bool {
        self.registry.read().await.get(&session_id).is_some()
    }

    /// Sends `batch` to every registered session and waits for all sends
    ///
    /// Sends run concurrently, at most `concurrency` at a time, each under
    /// its own deadline. A session whose send fails is evicted; the others
    /// are unaffected.
    pub async fn broadcast(&self, batch: Arc<LiveBatch>) -> BroadcastReport {
        let handles = self.registry.read().await.handles();
        let send_timeout = self.send_timeout;

        let outcomes: Vec<_> = stream::iter(handles)
            .map(|handle| {
                let batch = batch.clone();
                async move {
                    let outcome = handle.deliver(&batch, send_timeout).await;
                    (handle, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = BroadcastReport::default();
        for (handle, outcome) in outcomes {
            match outcome {
                Ok(Delivery::Sent) | Ok(Delivery::Buffered) => report.delivered += 1,
                Ok(Delivery::Skipped) => report.skipped += 1,
                Err(e) => {
                    if self.evict(&handle, &e).await {
                        report.evicted += 1;
                    }
                }
            }
        }
        report
    }

    /// Unregisters a failed session, then terminates and closes it
    ///
    /// Does nothing if another path already removed the session.
    async fn evict(&self, handle: &SessionHandle, cause: &TransportError) -> bool {
        let removed = self.registry.write().await.remove_session(&handle.id());
        match removed {
            Some(handle) => {
                warn!("Evicting session {}: {}", handle.id(), cause);
                handle.terminate();
                handle.connection().close().await;
                true
            }
            None => false,
        }
    }

    /// Terminates and closes every registered session
    pub async fn shutdown(&self) {
        let handles = self.registry.write().await.drain();
        info!("Shutting down {} sessions", handles.len());
        for handle in handles {
            handle.terminate();
            handle.connection().close().await;
        }
    }
}

#[async_trait]
impl BatchSink for Hub {
    async fn deliver(&self, batch: Arc<LiveBatch>) {
        let report = self.broadcast(batch).await;
        debug!(
            "Broadcast: {} delivered, {} skipped, {} evicted",
            report.delivered, report.skipped, report.evicted
        );
    }
}
