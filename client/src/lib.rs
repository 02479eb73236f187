//! # Pixel Canvas Client Library
//!
//! This library provides a minimal client for the shared pixel canvas. It
//! connects over WebSocket, keeps a local replica of the grid, and places
//! pixels on behalf of its caller.
//!
//! ## Protocol Overview
//!
//! ### Initial State
//! Right after connecting, the server sends exactly one `BATCH_UPDATE` with
//! the full grid. The replica is considered synced once it is applied.
//!
//! ### Live Updates
//! Every committed edit, from this or any other client, arrives in a
//! `LIVE_UPDATE` packet that may carry several pixels. Updates are applied in
//! the order received.
//!
//! ### Edits
//! Pixels are placed with `UPDATE {x, y, color}`. The server silently drops
//! edits outside the grid or the palette, so a rejected edit simply never
//! shows up as a live update.
//!
//! ### Requests
//! `FETCH {x1, y1, x2, y2}` is answered with a `BATCH_UPDATE` for that
//! rectangle, clamped to the grid. `CONFIG` is answered with a `CONFIG`
//! packet carrying the grid size, edit cooldown and palette.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! WebSocket connection, packet encoding and receive timeouts.
//!
//! ### Replica Module (`replica`)
//! Local grid state fed by server packets.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::network::GridClient;
//! use client::replica::ReplicaGrid;
//! use shared::GridDimensions;
//!
//! # async fn run() -> Result<(), client::network::ClientError> {
//! let mut client = GridClient::connect("127.0.0.1:8080").await?;
//! let mut replica = ReplicaGrid::new(GridDimensions::default());
//!
//! replica.apply(&client.next_packet().await?);
//! client.place_pixel(10, 20, 3).await?;
//! # Ok(())
//! # }
//! ```

pub mod network;
pub mod replica;
