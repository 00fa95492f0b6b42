//! Danmu: canonical live chat/danmaku event model and upstream source clients.
//!
//! This crate defines the canonical event produced by upstream platform
//! adapters and the trait the relay core uses to drive them.
//!
//! ## Core Types
//!
//! - [`DanmuEvent`] - A single canonical event with sender info and metadata
//! - [`DanmuEventType`] - Event classification (chat, gift, super chat, etc.)
//! - [`DanmuSource`] - Trait for platform-specific source adapters
//! - [`SourceConnection`] - Connection state for an active danmaku stream
//!
//! ## Sources
//!
//! - [`WsSource`] - Client for the local danmaku-source WebSocket servers
//! - [`SourceRegistry`] - Registry of configured sources

pub mod error;
pub mod event;
pub mod registry;
pub mod source;
pub mod ws;

pub use error::{DanmuError, Result};
pub use event::{DanmuEvent, DanmuEventType, DanmuSender};
pub use registry::SourceRegistry;
pub use source::{DanmuSource, SourceConnection};
pub use ws::{WsSource, WsSourceConfig};
