//! The seam between sessions and whatever carries their frames.

use crate::error::TransportError;
use async_trait::async_trait;

/// Outbound half of one client connection.
///
/// Implementations must tolerate `close` being called on an already closed
/// connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, text: String) -> Result<(), TransportError>;

    async fn ping(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Inbound frames as the session sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Any frame that proves the peer is alive but carries no packet
    /// (pings, pongs, fragments).
    Activity,
    Close,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records everything sent to it. Can be switched to fail or to stall.
    #[derive(Default)]
    pub(crate) struct RecordingConnection {
        sent: Mutex<Vec<String>>,
        pings: AtomicUsize,
        closes: AtomicUsize,
        failing: AtomicBool,
        stalled: AtomicBool,
    }

    impl RecordingConnection {
        pub(crate) fn failing() -> Self {
            let connection = Self::default();
            connection.failing.store(true, Ordering::SeqCst);
            connection
        }

        pub(crate) fn stalled() -> Self {
            let connection = Self::default();
            connection.stalled.store(true, Ordering::SeqCst);
            connection
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn pings(&self) -> usize {
            self.pings.load(Ordering::SeqCst)
        }

        pub(crate) fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        /// Polls until at least `count` frames were sent.
        pub(crate) async fn wait_for_sent(&self, count: usize) -> Vec<String> {
            for _ in 0..200 {
                let sent = self.sent();
                if sent.len() >= count {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("expected {} frames, got {:?}", count, self.sent());
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn send(&self, text: String) -> Result<(), TransportError> {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.failing.load(Ordering::SeqCst) || self.closes() > 0 {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn ping(&self) -> Result<(), TransportError> {
            if self.failing.load(Ordering::SeqCst) || self.closes() > 0 {
                return Err(TransportError::Closed);
            }
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
