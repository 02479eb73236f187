//! Process-wide resources, built once at startup and shared by every task.

use crate::batcher::{run_batcher, BatchSink};
use crate::bus::{run_consumer, MemoryBus, SequenceTracker, UpdateBus};
use crate::config::ServerConfig;
use crate::error::{BusError, ServerError};
use crate::hub::Hub;
use crate::redis_store::{RedisBackend, RedisBus};
use crate::store::{GridBackend, GridStore, MemoryBackend};
use log::{error, info};
use shared::UPDATE_CHANNEL;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bus events waiting for the batcher.
const EVENT_QUEUE_CAPACITY: usize = 1024;

pub struct AppContext {
    pub config: ServerConfig,
    pub store: GridStore,
    pub bus: Arc<dyn UpdateBus>,
    pub hub: Hub,
    pub tracker: Arc<SequenceTracker>,
}

impl AppContext {
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn GridBackend>,
        bus: Arc<dyn UpdateBus>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            store: GridStore::new(backend, config.dimensions),
            hub: Hub::from_config(&config),
            tracker: Arc::new(SequenceTracker::new()),
            bus,
            config,
        })
    }

    /// A standalone process with its own in-memory store and bus.
    pub fn in_memory(config: ServerConfig) -> Result<Self, ServerError> {
        Self::new(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBus::new(UPDATE_CHANNEL)),
        )
    }

    /// A process sharing its grid and update channel with every other
    /// process connected to the same Redis.
    pub async fn with_redis(config: ServerConfig, url: &str) -> Result<Self, ServerError> {
        let backend = RedisBackend::connect(url).await?;
        let bus = RedisBus::connect(url, UPDATE_CHANNEL).await?;
        Self::new(config, Arc::new(backend), Arc::new(bus))
    }

    /// Initializes the grid and opens the propagation path.
    ///
    /// Must complete before the first client is accepted: the bus
    /// subscription opened here is what every session's watermark refers to.
    pub async fn start(&self) -> Result<Propagation, ServerError> {
        self.store.initialize(self.config.fill_color).await?;

        let subscription = self.bus.subscribe().await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let sink: Arc<dyn BatchSink> = Arc::new(self.hub.clone());

        let consumer = tokio::spawn(run_consumer(subscription, self.tracker.clone(), events_tx));
        let batcher = tokio::spawn(run_batcher(events_rx, self.config.batch_window, sink));
        info!("Subscribed to the update bus, propagation running");

        Ok(Propagation { consumer, batcher })
    }
}

/// Handles of the bus consumer and batcher tasks.
pub struct Propagation {
    consumer: JoinHandle<Result<(), BusError>>,
    batcher: JoinHandle<()>,
}

impl Propagation {
    /// Waits until propagation stops. Losing the bus is an error; the
    /// batcher still flushes what it holds before this returns.
    pub async fn wait(self) -> Result<(), ServerError> {
        let consumed = self.consumer.await;
        let batched = self.batcher.await;

        match consumed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Bus consumer stopped: {}", e);
                return Err(e.into());
            }
            Err(e) => return Err(ServerError::Task(format!("bus consumer: {}", e))),
        }
        batched.map_err(|e| ServerError::Task(format!("batcher: {}", e)))
    }

    pub fn abort(&self) {
        self.consumer.abort();
        self.batcher.abort();
    }
}
