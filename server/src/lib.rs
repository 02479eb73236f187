//! # Pixel Canvas Server Library
//!
//! This library implements the real-time synchronization core of a shared,
//! persistent pixel canvas. Clients connect over WebSocket, receive the
//! current grid once, and then receive every committed edit, from any
//! process sharing the same store and bus, as batched live updates.
//!
//! ## Core Responsibilities
//!
//! ### Grid Storage
//! The grid lives in an external key-value store as one flat buffer of
//! one-byte cell tokens. Single-cell writes are constant-size range
//! overwrites, and out-of-range writes never reach the backend.
//!
//! ### Update Propagation
//! Every accepted edit is written to the store and then published on the
//! update bus. Each process consumes the bus once, coalesces events into
//! fixed time windows and fans each window out to its local sessions.
//!
//! ### Snapshot Handoff
//! A joining session is registered in buffering mode before its snapshot is
//! read. It records the highest bus sequence the process has seen as its
//! watermark, sends the snapshot, then drains buffered batches, skipping
//! every pixel at or below the watermark. No committed edit is lost or
//! replayed across the join.
//!
//! ## Architecture Design
//!
//! ### Explicit Context
//! All process-wide resources (configuration, store, bus, hub, sequence
//! tracker) live in one [`context::AppContext`] built at startup and passed
//! to every task.
//!
//! ### Storage Seams
//! The store and the bus sit behind async traits. The Redis backends in
//! [`redis_store`] let several processes share one canvas; the in-memory
//! backends give a single process, or several processes simulated in one
//! test, the same ordering guarantees.
//!
//! ### Failure Isolation
//! A failing or stalled client is evicted from the hub without delaying the
//! others. Losing the bus subscription is fatal to the process.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! Backend seam, in-memory backend and the grid adapter.
//!
//! ### Bus Module (`bus`)
//! Publish/subscribe seam, in-memory bus, sequence tracking and the
//! consumer loop.
//!
//! ### Redis Module (`redis_store`)
//! Redis implementations of both seams for multi-process deployments.
//!
//! ### Batcher Module (`batcher`)
//! Fixed-window coalescing and pre-encoded live batches.
//!
//! ### Hub Module (`hub`)
//! Session registry, per-session outboxes and concurrent broadcast.
//!
//! ### Session Module (`session`)
//! Handoff, read loop, liveness loop and cleanup for one client.
//!
//! ### Network Module (`network`)
//! TCP accept loop and WebSocket framing.

pub mod batcher;
pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod network;
pub mod redis_store;
pub mod session;
pub mod store;
pub mod transport;
