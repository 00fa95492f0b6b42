//! Router facade.
//!
//! Ties the subscription registry, the connection multiplexer and the
//! dispatch pipeline together and sequences their interactions: a
//! subscription change drives the multiplexer's connect/disconnect
//! decisions, incoming events flow the other way through the pipeline.

use std::sync::Arc;

use tracing::{error, info};

use danmu::{DanmuEvent, SourceRegistry};

use crate::dedup::{DedupCache, DedupConfig};
use crate::error::{RelayError, Result};
use crate::limiter::RateLimiter;
use crate::multiplexer::{ConnectionMultiplexer, MultiplexerConfig};
use crate::pipeline::{DeliverySink, DispatchPipeline};
use crate::stats::StatsSink;
use crate::subscription::{
    BindOutcome, DestinationId, FilterRule, RoomKey, Subscription, SubscriptionRegistry,
};

/// Router tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub multiplexer: MultiplexerConfig,
    pub dedup: DedupConfig,
}

/// The routing engine: one instance owns all subscriptions and upstream
/// connections for the process.
pub struct Router {
    registry: Arc<SubscriptionRegistry>,
    multiplexer: ConnectionMultiplexer,
    pipeline: Arc<DispatchPipeline>,
}

impl Router {
    pub fn new(
        sources: Arc<SourceRegistry>,
        delivery: Arc<dyn DeliverySink>,
        limiter: Arc<RateLimiter>,
        stats: Option<Arc<dyn StatsSink>>,
        config: RouterConfig,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let pipeline = Arc::new(DispatchPipeline::new(
            registry.clone(),
            DedupCache::new(config.dedup),
            limiter,
            delivery,
            stats,
        ));
        let multiplexer =
            ConnectionMultiplexer::new(sources, pipeline.clone(), config.multiplexer);
        Self {
            registry,
            multiplexer,
            pipeline,
        }
    }

    /// Register (or update) a destination's subscription.
    ///
    /// The rule is validated and compiled before anything is mutated: an
    /// invalid pattern or unknown source fails synchronously and leaves the
    /// registry untouched. A rebind to a different room releases the old
    /// connection reference before acquiring the new one. A failed upstream
    /// connect is logged, not returned: the subscription stays registered
    /// and starts receiving events after a later successful reconnect.
    pub async fn subscribe(
        &self,
        destination: DestinationId,
        source_id: &str,
        room_id: u64,
        rule: FilterRule,
    ) -> Result<()> {
        if !self.multiplexer.has_source(source_id) {
            return Err(RelayError::config(format!("Unknown source: {source_id}")));
        }
        let key = RoomKey::new(source_id, room_id);
        let subscription = Subscription::compile(destination, key.clone(), rule)?;

        match self.registry.bind(subscription) {
            BindOutcome::Updated => {
                info!("Destination {destination} updated its rule for {key}");
                Ok(())
            }
            BindOutcome::New => {
                info!("Destination {destination} subscribed to {key}");
                self.acquire_logged(&key).await;
                Ok(())
            }
            BindOutcome::Rebound { released } => {
                info!("Destination {destination} moved from {released} to {key}");
                self.multiplexer.release(&released).await;
                self.acquire_logged(&key).await;
                Ok(())
            }
        }
    }

    /// Remove a destination's subscription and release its connection
    /// reference. Safe to call for destinations that are not subscribed,
    /// and while an event for the destination is mid-flight.
    pub async fn unsubscribe(&self, destination: DestinationId) {
        if let Some(key) = self.registry.unbind(destination) {
            info!("Destination {destination} unsubscribed from {key}");
            self.multiplexer.release(&key).await;
        }
    }

    /// Administrative reconnect for one key. Reference counts and
    /// subscriptions are preserved. If the key lost its connection entry to
    /// an earlier failed connect, it is re-opened with a reference count
    /// matching the currently subscribed destinations.
    pub async fn reconnect(&self, source_id: &str, room_id: u64) -> Result<()> {
        let key = RoomKey::new(source_id, room_id);
        if self.multiplexer.contains(&key) {
            return self.multiplexer.force_reconnect(&key).await;
        }

        let subscribers = self.registry.destination_count(&key) as u32;
        if subscribers == 0 {
            return Err(RelayError::config(format!(
                "No destinations subscribed to {key}"
            )));
        }
        self.multiplexer.resume(&key, subscribers).await
    }

    /// Reconnect every live key, serialized to avoid a reconnection storm.
    pub async fn batch_reconnect(&self) {
        self.multiplexer.batch_reconnect().await;
    }

    /// Entry point for adapters that push events instead of being pumped.
    pub async fn on_event(&self, event: DanmuEvent) {
        self.pipeline.dispatch(event).await;
    }

    /// The key a destination is bound to, if any.
    pub fn key_for(&self, destination: DestinationId) -> Option<RoomKey> {
        self.registry.key_for(destination)
    }

    /// Number of destinations bound to a key.
    pub fn destination_count(&self, key: &RoomKey) -> usize {
        self.registry.destination_count(key)
    }

    /// Current connection reference count for a key.
    pub async fn refcount(&self, key: &RoomKey) -> Option<u32> {
        self.multiplexer.refcount(key).await
    }

    /// Whether a key has a live upstream connection.
    pub async fn is_live(&self, key: &RoomKey) -> bool {
        self.multiplexer.is_live(key).await
    }

    /// Close every connection and stop every pump.
    pub async fn shutdown(&self) {
        self.multiplexer.shutdown().await;
    }

    async fn acquire_logged(&self, key: &RoomKey) {
        if let Err(e) = self.multiplexer.acquire(key).await {
            error!("Acquire of {key} failed, subscription retained: {e}");
        }
    }
}
