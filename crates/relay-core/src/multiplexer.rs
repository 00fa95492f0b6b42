//! Connection multiplexer.
//!
//! Owns at most one live upstream connection per `(source, room)` key, no
//! matter how many destinations are interested in it. Connections are
//! reference counted: the first acquire opens the upstream connection and
//! spawns its event pump, the last release tears both down.
//!
//! Every refcount/state mutation for a key happens under that key's own
//! lock, so concurrent acquires and releases from different destinations
//! cannot lose updates. Each live key owns exactly one pump task, which
//! preserves upstream arrival order within the key while keys proceed
//! independently of each other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use danmu::{DanmuEvent, DanmuSource, SourceConnection, SourceRegistry};

use crate::error::{RelayError, Result};
use crate::subscription::RoomKey;

/// Consumer of the events pumped off live connections.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: DanmuEvent);
}

/// Connection lifecycle state for one key. Absence from the entry map is the
/// implicit `Absent` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Live,
    Closing,
}

/// Multiplexer tuning knobs.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Timeout for one upstream connect attempt
    pub connect_timeout: Duration,
    /// Delay between keys during a batch reconnect, to avoid hammering the
    /// upstream platform with a reconnection storm
    pub batch_reconnect_delay: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            batch_reconnect_delay: Duration::from_secs(10),
        }
    }
}

struct RoomEntry {
    state: ConnectionState,
    refcount: u32,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    /// Set when the entry has been torn down; a caller holding a stale Arc
    /// must retry against the map instead of mutating this entry.
    closed: bool,
}

impl RoomEntry {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            refcount: 0,
            cancel: CancellationToken::new(),
            worker: None,
            closed: false,
        }
    }
}

/// Reference-counted owner of upstream connections, one per key.
pub struct ConnectionMultiplexer {
    sources: Arc<SourceRegistry>,
    sink: Arc<dyn EventSink>,
    entries: DashMap<RoomKey, Arc<Mutex<RoomEntry>>>,
    config: MultiplexerConfig,
    shutdown: CancellationToken,
}

impl ConnectionMultiplexer {
    pub fn new(
        sources: Arc<SourceRegistry>,
        sink: Arc<dyn EventSink>,
        config: MultiplexerConfig,
    ) -> Self {
        Self {
            sources,
            sink,
            entries: DashMap::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether a source with the given id is configured.
    pub fn has_source(&self, source_id: &str) -> bool {
        self.sources.contains(source_id)
    }

    /// Register interest in a key. Opens the upstream connection on the
    /// 0→1 transition; otherwise just increments the reference count.
    ///
    /// A failed connect removes the entry again and is not retried here;
    /// recovery is an explicit or scheduled reconnect.
    pub async fn acquire(&self, key: &RoomKey) -> Result<()> {
        loop {
            let entry = self.entry_for(key);
            let mut guard = entry.lock().await;
            if guard.closed {
                // Torn down between lookup and lock; retry with a fresh entry.
                continue;
            }

            if guard.refcount > 0 {
                guard.refcount += 1;
                debug!("Acquired {key}, refcount now {}", guard.refcount);
                return Ok(());
            }

            guard.state = ConnectionState::Connecting;
            match self.open_worker(key, &mut guard).await {
                Ok(()) => {
                    guard.refcount = 1;
                    guard.state = ConnectionState::Live;
                    info!("Connected to {key}");
                    return Ok(());
                }
                Err(e) => {
                    guard.closed = true;
                    drop(guard);
                    self.entries.remove_if(key, |_, v| Arc::ptr_eq(v, &entry));
                    return Err(e);
                }
            }
        }
    }

    /// Drop one reference to a key. On the transition to zero the pump is
    /// cancelled, the upstream connection closed and the entry removed.
    /// Releasing a key with no entry is a no-op.
    pub async fn release(&self, key: &RoomKey) {
        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            debug!("Release of {key} with no connection entry");
            return;
        };
        let mut guard = entry.lock().await;
        if guard.closed || guard.refcount == 0 {
            return;
        }

        guard.refcount -= 1;
        if guard.refcount > 0 {
            debug!("Released {key}, refcount now {}", guard.refcount);
            return;
        }

        guard.state = ConnectionState::Closing;
        self.stop_worker(&mut guard).await;
        guard.closed = true;
        drop(guard);
        self.entries.remove_if(key, |_, v| Arc::ptr_eq(v, &entry));
        debug!("Room {key} is no longer used, connection closed");
    }

    /// Tear down and recreate the connection for a key, preserving its
    /// reference count. Used for on-demand admin reconnects and for the
    /// periodic schedule that defends against silent connection rot.
    pub async fn force_reconnect(&self, key: &RoomKey) -> Result<()> {
        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            return Err(RelayError::connect(format!("No connection entry for {key}")));
        };
        let mut guard = entry.lock().await;
        if guard.closed {
            return Err(RelayError::connect(format!("No connection entry for {key}")));
        }

        info!("Reconnecting {key} (refcount {})", guard.refcount);
        self.stop_worker(&mut guard).await;
        guard.state = ConnectionState::Connecting;
        match self.open_worker(key, &mut guard).await {
            Ok(()) => {
                guard.state = ConnectionState::Live;
                Ok(())
            }
            // The entry (and its refcount) stays so a later reconnect can
            // recover the key.
            Err(e) => Err(e),
        }
    }

    /// Re-open a key whose entry was lost to a failed connect, restoring the
    /// reference count to the number of currently subscribed destinations.
    /// No-op if the key already has an entry.
    pub async fn resume(&self, key: &RoomKey, subscribers: u32) -> Result<()> {
        if subscribers == 0 {
            return Ok(());
        }
        loop {
            let entry = self.entry_for(key);
            let mut guard = entry.lock().await;
            if guard.closed {
                continue;
            }
            if guard.refcount > 0 {
                return Ok(());
            }

            guard.state = ConnectionState::Connecting;
            match self.open_worker(key, &mut guard).await {
                Ok(()) => {
                    guard.refcount = subscribers;
                    guard.state = ConnectionState::Live;
                    info!("Resumed {key} for {subscribers} destinations");
                    return Ok(());
                }
                Err(e) => {
                    guard.closed = true;
                    drop(guard);
                    self.entries.remove_if(key, |_, v| Arc::ptr_eq(v, &entry));
                    return Err(e);
                }
            }
        }
    }

    /// Reconnect every live key, serialized with a fixed inter-key delay.
    pub async fn batch_reconnect(&self) {
        let keys = self.live_keys().await;
        if keys.is_empty() {
            return;
        }
        info!("Starting batch reconnect for {} rooms", keys.len());
        for (index, key) in keys.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_reconnect_delay).await;
            }
            if let Err(e) = self.force_reconnect(key).await {
                error!("Batch reconnect of {key} failed: {e}");
            }
        }
    }

    /// Whether the key currently has a connection entry.
    pub fn contains(&self, key: &RoomKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether the key has a live connection.
    pub async fn is_live(&self, key: &RoomKey) -> bool {
        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            return false;
        };
        let guard = entry.lock().await;
        !guard.closed && guard.state == ConnectionState::Live
    }

    /// Current reference count for a key, if an entry exists.
    pub async fn refcount(&self, key: &RoomKey) -> Option<u32> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        let guard = entry.lock().await;
        if guard.closed { None } else { Some(guard.refcount) }
    }

    /// All keys with a live connection.
    pub async fn live_keys(&self) -> Vec<RoomKey> {
        let snapshot: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut keys = Vec::new();
        for (key, entry) in snapshot {
            let guard = entry.lock().await;
            if !guard.closed && guard.state == ConnectionState::Live {
                keys.push(key);
            }
        }
        keys
    }

    /// Cancel every pump and close every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let snapshot: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in snapshot {
            let mut guard = entry.lock().await;
            guard.state = ConnectionState::Closing;
            self.stop_worker(&mut guard).await;
            guard.closed = true;
        }
        self.entries.clear();
    }

    fn entry_for(&self, key: &RoomKey) -> Arc<Mutex<RoomEntry>> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RoomEntry::new())))
            .clone()
    }

    /// Connect upstream (with timeout) and spawn the event pump for a key.
    /// The caller holds the key lock and applies the state transition.
    async fn open_worker(&self, key: &RoomKey, guard: &mut RoomEntry) -> Result<()> {
        let source = self.sources.get(&key.source_id).ok_or_else(|| {
            RelayError::config(format!("Unknown source: {}", key.source_id))
        })?;

        let connection =
            tokio::time::timeout(self.config.connect_timeout, source.connect(key.room_id))
                .await
                .map_err(|_| RelayError::connect(format!("Connect to {key} timed out")))?
                .map_err(|e| RelayError::connect(format!("Connect to {key} failed: {e}")))?;

        let cancel = self.shutdown.child_token();
        let worker = tokio::spawn(run_pump(
            key.clone(),
            source,
            connection,
            self.sink.clone(),
            cancel.clone(),
        ));
        guard.cancel = cancel;
        guard.worker = Some(worker);
        Ok(())
    }

    /// Cancel the pump and wait for it to close the upstream connection, so
    /// no handle dangles past the entry that owned it.
    async fn stop_worker(&self, guard: &mut RoomEntry) {
        guard.cancel.cancel();
        if let Some(worker) = guard.worker.take() {
            let _ = worker.await;
        }
    }
}

/// Event pump for one live connection. Pulls events off the adapter and
/// feeds them to the sink one at a time, preserving arrival order within
/// the key. Owns the connection handle and closes it on the way out.
async fn run_pump(
    key: RoomKey,
    source: Arc<dyn DanmuSource>,
    mut connection: SourceConnection,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
) {
    debug!("Event pump for {key} started");
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = source.receive(&connection) => match result {
                Ok(Some(event)) => sink.on_event(event).await,
                Ok(None) => {}
                Err(e) => {
                    // Not retried here: recovery is an explicit or
                    // scheduled reconnect.
                    error!("Receive failed for {key}: {e}");
                    break;
                }
            }
        }
    }
    if let Err(e) = source.disconnect(&mut connection).await {
        warn!("Disconnect of {key} failed: {e}");
    }
    debug!("Event pump for {key} stopped");
}
