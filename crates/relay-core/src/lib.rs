//! Relay core: the danmaku event routing and connection-multiplexing engine.
//!
//! Routes canonical danmaku events from upstream sources into downstream
//! chat destinations, maintaining exactly one upstream connection per
//! `(source, room)` pair via reference counting and applying a
//! filter/dedup/rate-limit pipeline per destination.
//!
//! ## Core Types
//!
//! - [`Router`] - Facade over the registry, multiplexer and pipeline
//! - [`SubscriptionRegistry`] - Destination bindings and room index
//! - [`ConnectionMultiplexer`] - Reference-counted upstream connections
//! - [`DispatchPipeline`] - Per-event fan-out with filtering and gating
//! - [`RateLimiter`] - Sliding-window admission control over a shared store
//! - [`DedupCache`] - Time-bounded duplicate suppression
//!
//! ## Boundaries
//!
//! - [`DeliverySink`] - The outbound delivery boundary
//! - [`StatsSink`] - Optional per-delivery statistics
//! - [`CounterStore`] - Shared counter state for the rate limiter

pub mod dedup;
pub mod error;
pub mod limiter;
pub mod multiplexer;
pub mod pipeline;
pub mod router;
pub mod stats;
pub mod subscription;

pub use dedup::{DedupCache, DedupConfig};
pub use error::{RelayError, Result};
pub use limiter::{
    CounterStore, MemoryCounterStore, RateLimiter, RateLimiterConfig, RedisCounterStore,
};
pub use multiplexer::{ConnectionMultiplexer, EventSink, MultiplexerConfig};
pub use pipeline::{DeliveryOptions, DeliverySink, DispatchPipeline, format_message, pseudo_uid};
pub use router::{Router, RouterConfig};
pub use stats::{MemoryStats, RedisStats, StatsSink};
pub use subscription::{
    BindOutcome, DestinationId, FilterRule, RoomKey, Subscription, SubscriptionRegistry,
};
