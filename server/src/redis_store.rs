//! Redis-backed grid store and update bus, shared by every server process
//! pointed at the same instance.
//!
//! The grid is one string key written with `SETRANGE` and read with `GET`
//! and `GETRANGE`. Edits travel over pub/sub as `<sequence>:<json pixels>`.
//! The sequence comes from a counter key incremented by the same script that
//! publishes, so sequence order and publish order agree across processes.

use crate::bus::{Subscription, UpdateBus};
use crate::error::{BusError, StoreError};
use crate::store::GridBackend;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script, Value};
use shared::{Pixel, UpdateEvent};
use tokio::sync::mpsc;

const PUBLISH_SCRIPT: &str = r#"
local sequence = redis.call('INCR', KEYS[1])
redis.call('PUBLISH', ARGV[1], sequence .. ':' .. ARGV[2])
return sequence
"#;

fn store_error(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn bus_error(e: RedisError) -> BusError {
    BusError::Unavailable(e.to_string())
}

pub struct RedisBackend {
    connection: MultiplexedConnection,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(store_error)?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(store_error)?;
        info!("Grid store connected to Redis");
        Ok(Self { connection })
    }
}

#[async_trait]
impl GridBackend for RedisBackend {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(store_error)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let reply: Value = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn set_range(&self, key: &str, offset: usize, value: &[u8]) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("SETRANGE")
            .arg(key)
            .arg(offset)
            .arg(value)
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(store_error)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(store_error)
    }

    async fn get_range(
        &self,
        key: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<u8>, StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("GETRANGE")
            .arg(key)
            .arg(start)
            .arg(end)
            .query_async(&mut connection)
            .await
            .map_err(store_error)
    }
}

pub struct RedisBus {
    client: Client,
    connection: MultiplexedConnection,
    channel: String,
    sequence_key: String,
    publish: Script,
}

impl RedisBus {
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(bus_error)?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(bus_error)?;
        let channel = channel.into();
        info!("Update bus connected to Redis channel '{}'", channel);

        Ok(Self {
            sequence_key: format!("{}:sequence", channel),
            client,
            connection,
            channel,
            publish: Script::new(PUBLISH_SCRIPT),
        })
    }
}

#[async_trait]
impl UpdateBus for RedisBus {
    async fn publish(&self, pixels: &[Pixel]) -> Result<u64, BusError> {
        let payload = serde_json::to_string(pixels).map_err(|e| BusError::Codec(e.to_string()))?;
        let mut connection = self.connection.clone();
        self.publish
            .key(&self.sequence_key)
            .arg(&self.channel)
            .arg(payload)
            .invoke_async(&mut connection)
            .await
            .map_err(bus_error)
    }

    /// Returns once Redis has confirmed the subscription.
    async fn subscribe(&self) -> Result<Subscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(bus_error)?;
        pubsub
            .subscribe(self.channel.as_str())
            .await
            .map_err(bus_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(message) = messages.next().await {
                let payload = match decode_frame(message.get_payload_bytes()) {
                    Ok(event) => event.encode().map_err(|e| BusError::Codec(e.to_string())),
                    Err(e) => Err(e),
                };
                match payload {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            debug!("Subscription to '{}' dropped", channel);
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping unreadable message on '{}': {}", channel, e),
                }
            }
            warn!("Redis subscription to '{}' ended", channel);
        });

        Ok(Subscription::new(self.channel.clone(), rx))
    }
}

/// Parses one `<sequence>:<json pixels>` pub/sub message.
fn decode_frame(frame: &[u8]) -> Result<UpdateEvent, BusError> {
    let text = std::str::from_utf8(frame).map_err(|e| BusError::Codec(e.to_string()))?;
    let (sequence, pixels) = text
        .split_once(':')
        .ok_or_else(|| BusError::Codec("missing sequence prefix".to_string()))?;
    let sequence = sequence
        .parse::<u64>()
        .map_err(|e| BusError::Codec(format!("bad sequence '{}': {}", sequence, e)))?;
    let pixels = serde_json::from_str(pixels).map_err(|e| BusError::Codec(e.to_string()))?;
    Ok(UpdateEvent { sequence, pixels })
}

/// Tests against a live server run only when `REDIS_URL` is set.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GridStore;
    use rand::Rng;
    use shared::GridDimensions;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn redis_url() -> Option<String> {
        let url = std::env::var("REDIS_URL").ok();
        if url.is_none() {
            println!("REDIS_URL not set, skipping");
        }
        url
    }

    fn unique(prefix: &str) -> String {
        format!("{}:{}", prefix, rand::thread_rng().gen::<u64>())
    }

    #[test]
    fn test_decode_frame() {
        let event = decode_frame(br#"12:[{"x":1,"y":2,"color":3}]"#).unwrap();
        assert_eq!(event.sequence, 12);
        assert_eq!(event.pixels, vec![Pixel::new(1, 2, 3)]);
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        assert!(decode_frame(b"no prefix").is_err());
        assert!(decode_frame(b"x:[]").is_err());
        assert!(decode_frame(b"3:{").is_err());
        assert!(decode_frame(&[0xff, b':']).is_err());
    }

    #[tokio::test]
    async fn test_grid_on_redis() {
        let Some(url) = redis_url() else { return };
        let backend = Arc::new(assert_ok!(RedisBackend::connect(&url).await));
        let store = GridStore::with_key(backend, unique("test_grid"), GridDimensions::new(4, 3));

        assert!(assert_ok!(store.initialize(2).await));
        assert!(!assert_ok!(store.initialize(0).await));
        assert_ok!(store.write_pixel(3, 1, 9).await);

        let grid = assert_ok!(store.read_grid().await);
        assert_eq!(grid, vec![vec![2, 2, 2, 2], vec![2, 2, 2, 9], vec![2, 2, 2, 2]]);
        let region = assert_ok!(store.read_region(2, 1, 3, 2).await);
        assert_eq!(region.grid, vec![vec![2, 9], vec![2, 2]]);
    }

    #[tokio::test]
    async fn test_bus_on_redis_orders_publishers() {
        let Some(url) = redis_url() else { return };
        let channel = unique("test_updates");
        let first = assert_ok!(RedisBus::connect(&url, channel.clone()).await);
        let second = assert_ok!(RedisBus::connect(&url, channel).await);
        let mut subscription = assert_ok!(first.subscribe().await);

        let a = assert_ok!(first.publish(&[Pixel::new(0, 0, 1)]).await);
        let b = assert_ok!(second.publish(&[Pixel::new(1, 0, 1)]).await);
        assert_eq!(b, a + 1);

        for (sequence, x) in [(a, 0), (b, 1)] {
            let event = assert_ok!(
                tokio::time::timeout(Duration::from_secs(5), subscription.next())
                    .await
                    .unwrap()
            );
            assert_eq!(event.sequence, sequence);
            assert_eq!(event.pixels, vec![Pixel::new(x, 0, 1)]);
        }
    }
}
