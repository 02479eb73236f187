//! One client's lifecycle: registration, snapshot handoff, then the read and
//! liveness loops until something closes it.

use crate::context::AppContext;
use crate::error::{EditError, HubError, StoreError, TransportError};
use crate::hub::SessionHandle;
use crate::transport::{Connection, Inbound};
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use shared::{BatchUpdate, Cell, ClientPacket, Pixel, Region, ServerPacket};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    IdleTimeout,
    MalformedPacket,
    Transport(TransportError),
    /// The hub removed the session after a failed broadcast send.
    Evicted,
    Rejected(HubError),
    SnapshotFailed(StoreError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "closed by client"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::MalformedPacket => write!(f, "malformed packet"),
            CloseReason::Transport(e) => write!(f, "{}", e),
            CloseReason::Evicted => write!(f, "evicted"),
            CloseReason::Rejected(e) => write!(f, "rejected: {}", e),
            CloseReason::SnapshotFailed(e) => write!(f, "snapshot failed: {}", e),
        }
    }
}

/// Validates, stores and publishes one edit.
///
/// A publish failure leaves the written cell in place.
pub async fn apply_edit(ctx: &AppContext, pixel: &Pixel) -> Result<Cell, EditError> {
    let cell = ctx.store.dimensions().validate(pixel)?;
    ctx.store.write_cell(cell).await?;
    ctx.bus
        .publish(&[cell.to_pixel()])
        .await
        .map_err(EditError::Publish)?;
    Ok(cell)
}

/// Drives one session from registration to close.
pub async fn run_session<S>(
    ctx: Arc<AppContext>,
    connection: Arc<dyn Connection>,
    mut inbound: S,
) -> CloseReason
where
    S: Stream<Item = Result<Inbound, TransportError>> + Unpin + Send,
{
    let mut state = SessionState::Connecting;
    debug!("Session state: {:?}", state);

    let handle = match ctx.hub.register(connection.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Refusing connection: {}", e);
            connection.close().await;
            return CloseReason::Rejected(e);
        }
    };

    let reason = match handoff(&ctx, &handle).await {
        Err(reason) => reason,
        Ok(()) => {
            state = SessionState::Active;
            debug!("Session {} state: {:?}", handle.id(), state);

            let liveness = tokio::spawn(keep_alive(
                connection.clone(),
                ctx.config.ping_interval,
                ctx.config.send_timeout,
            ));
            let mut liveness = AbortOnDrop(liveness);

            let reason = tokio::select! {
                reason = read_loop(&ctx, &handle, &mut inbound) => reason,
                result = &mut liveness.0 => match result {
                    Ok(e) => CloseReason::Transport(e),
                    Err(e) => CloseReason::Transport(TransportError::Io(e.to_string())),
                },
                _ = handle.terminated() => CloseReason::Evicted,
            };
            drop(liveness);
            reason
        }
    };

    state = SessionState::Closing;
    debug!("Session {} state: {:?}", handle.id(), state);
    if ctx.hub.unregister(handle.id()).await {
        connection.close().await;
    }

    state = SessionState::Closed;
    info!(
        "Session {} {:?} after {:.1}s: {}",
        handle.id(),
        state,
        handle.joined_at().elapsed().as_secs_f32(),
        reason
    );
    reason
}

/// Watermark, snapshot, drain. Any failure ends the session.
async fn handoff(ctx: &AppContext, handle: &SessionHandle) -> Result<(), CloseReason> {
    handle.begin_handoff(ctx.tracker.last_received()).await;

    let grid = ctx.store.read_grid().await.map_err(|e| {
        warn!("Snapshot read for session {} failed: {}", handle.id(), e);
        CloseReason::SnapshotFailed(e)
    })?;
    let snapshot = ServerPacket::BatchUpdate(BatchUpdate {
        start_x: 0,
        start_y: 0,
        grid,
    })
    .to_json()
    .map_err(|e| CloseReason::Transport(TransportError::Io(e.to_string())))?;

    handle
        .complete_handoff(snapshot, ctx.config.send_timeout)
        .await
        .map_err(CloseReason::Transport)?;
    Ok(())
}

async fn read_loop<S>(ctx: &AppContext, handle: &SessionHandle, inbound: &mut S) -> CloseReason
where
    S: Stream<Item = Result<Inbound, TransportError>> + Unpin,
{
    let session_id = handle.id();
    let cooldown = ctx.config.pixel_cooldown;
    let mut last_edit: Option<Instant> = None;

    loop {
        let frame = match timeout(ctx.config.idle_timeout, inbound.next()).await {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::ClientClosed,
            Ok(Some(Err(e))) => return CloseReason::Transport(e),
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            Inbound::Text(text) => text,
            Inbound::Activity => continue,
            Inbound::Close => return CloseReason::ClientClosed,
        };

        let packet = match ClientPacket::from_json(&text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Malformed packet from session {}: {}", session_id, e);
                return CloseReason::MalformedPacket;
            }
        };
        let pixel = match packet {
            ClientPacket::Update(pixel) => pixel,
            ClientPacket::Fetch(region) => {
                if let Err(e) = reply_region(ctx, handle, region).await {
                    return CloseReason::Transport(e);
                }
                continue;
            }
            ClientPacket::Config => {
                if let Err(e) = reply_config(ctx, handle).await {
                    return CloseReason::Transport(e);
                }
                continue;
            }
        };

        if !cooldown.is_zero() {
            if let Some(last) = last_edit {
                if last.elapsed() < cooldown {
                    debug!("Session {} edit dropped by cooldown", session_id);
                    continue;
                }
            }
        }

        match apply_edit(ctx, &pixel).await {
            Ok(cell) => {
                debug!(
                    "Session {} set ({}, {}) to {}",
                    session_id, cell.x, cell.y, cell.color
                );
                last_edit = Some(Instant::now());
            }
            Err(EditError::Validation(e)) => debug!("Session {}: {}", session_id, e),
            Err(e @ EditError::Publish(_)) => {
                warn!("Session {}: {}", session_id, e);
                last_edit = Some(Instant::now());
            }
            Err(e) => warn!("Session {}: {}", session_id, e),
        }
    }
}

/// Answers a region request. Regions entirely outside the grid are dropped.
async fn reply_region(
    ctx: &AppContext,
    handle: &SessionHandle,
    region: Region,
) -> Result<(), TransportError> {
    let guard = handle.hold_batches().await;
    let batch = match ctx
        .store
        .read_region(region.x1, region.y1, region.x2, region.y2)
        .await
    {
        Ok(batch) => batch,
        Err(e @ StoreError::OutOfBounds { .. }) => {
            debug!("Session {}: region request dropped: {}", handle.id(), e);
            return Ok(());
        }
        Err(e) => {
            warn!("Session {}: region read failed: {}", handle.id(), e);
            return Ok(());
        }
    };

    let text = ServerPacket::BatchUpdate(batch)
        .to_json()
        .map_err(|e| TransportError::Io(e.to_string()))?;
    guard.send(text, ctx.config.send_timeout).await
}

async fn reply_config(ctx: &AppContext, handle: &SessionHandle) -> Result<(), TransportError> {
    let text = ServerPacket::Config(ctx.config.client_config())
        .to_json()
        .map_err(|e| TransportError::Io(e.to_string()))?;
    handle
        .hold_batches()
        .await
        .send(text, ctx.config.send_timeout)
        .await
}

/// Pings until a ping fails, then returns why.
async fn keep_alive(
    connection: Arc<dyn Connection>,
    period: Duration,
    send_timeout: Duration,
) -> TransportError {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match timeout(send_timeout, connection.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return e,
            Err(_) => return TransportError::Timeout(send_timeout),
        }
    }
}

struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
