//! Connection Manager
//!
//! Single source of truth for broker connectivity:
//! - one physical connection, opened lazily and shared;
//! - concurrent callers of [`ConnectionManager::connect`] await the same
//!   in-flight attempt instead of opening a second connection;
//! - one cached channel per [`ChannelPurpose`], evicted when it fails; a
//!   channel failure is announced on [`ConnectionManager::channel_losses`]
//!   and leaves the connection and the other purpose's channel alone;
//! - background reconnection with a fixed delay after a failure.
//!
//! Every installed connection gets a new generation number, published on a
//! watch channel so that long-lived users (the consumer) can re-establish
//! their state after a reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ErrorCallback};
use crate::config::ConnectionConfig;
use crate::error::MessagingResult;

/// Logical owner of a cached channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    Publisher,
    Consumer,
}

/// Observable connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    /// Incremented every time a new connection is installed
    pub generation: u64,
    pub connected: bool,
}

type PendingConnect = Shared<BoxFuture<'static, BrokerResult<Arc<dyn BrokerConnection>>>>;

/// Owns the broker connection and its channels. Cloning shares the manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    channels: Mutex<HashMap<ChannelPurpose, CachedChannel>>,
    next_channel_id: AtomicU64,
    link: watch::Sender<LinkState>,
    channel_lost: broadcast::Sender<ChannelPurpose>,
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<Arc<dyn BrokerConnection>>,
    pending: Option<PendingConnect>,
    generation: u64,
    reconnect_task: Option<JoinHandle<()>>,
    closed: bool,
    /// Bumped by every close; attempts started before it are discarded
    epoch: u64,
}

struct CachedChannel {
    id: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, config: ConnectionConfig) -> Self {
        let (link, _) = watch::channel(LinkState::default());
        let (channel_lost, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                broker,
                config,
                state: Mutex::new(ConnectionState::default()),
                channels: Mutex::new(HashMap::new()),
                next_channel_id: AtomicU64::new(1),
                link,
                channel_lost,
            }),
        }
    }

    /// Return the live connection, joining an in-flight attempt or opening a
    /// new one. A failed attempt is returned to the caller and retried in the
    /// background when reconnection is enabled.
    pub async fn connect(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        Ok(self.inner.connect().await?)
    }

    /// Cached channel for `purpose`, opened on demand
    pub async fn create_channel(&self, purpose: ChannelPurpose) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let mut channels = self.inner.channels.lock().await;
        if let Some(cached) = channels.get(&purpose) {
            if cached.channel.is_open() {
                return Ok(cached.channel.clone());
            }
        }

        let connection = self.inner.connect().await?;
        let channel = connection.create_channel().await?;
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        channel.on_error(Inner::channel_error_callback(&self.inner, purpose, id));

        channels.insert(
            purpose,
            CachedChannel {
                id,
                channel: channel.clone(),
            },
        );
        tracing::debug!(?purpose, channel_id = id, "Opened broker channel");
        Ok(channel)
    }

    /// Cancel reconnection, close cached channels (best effort) and then the
    /// connection
    pub async fn close(&self) -> MessagingResult<()> {
        let (task, connection) = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            state.epoch += 1;
            state.pending = None;
            (state.reconnect_task.take(), state.connection.take())
        };

        if let Some(task) = task {
            task.abort();
        }

        let channels: Vec<(ChannelPurpose, CachedChannel)> =
            self.inner.channels.lock().await.drain().collect();
        for (purpose, cached) in channels {
            if let Err(e) = cached.channel.close().await {
                tracing::warn!(?purpose, error = %e, "Failed to close broker channel");
            }
        }

        self.inner.link.send_modify(|link| link.connected = false);

        if let Some(connection) = connection {
            connection.close().await?;
            tracing::info!("Broker connection closed");
        }
        Ok(())
    }

    /// True while a connection is held
    pub fn is_connected(&self) -> bool {
        self.inner.link.borrow().connected
    }

    /// Watch connection generations and status
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.inner.link.subscribe()
    }

    /// Purposes whose cached channel failed while the connection stayed up
    pub fn channel_losses(&self) -> broadcast::Receiver<ChannelPurpose> {
        self.inner.channel_lost.subscribe()
    }
}

impl Inner {
    /// Explicit connect: reopens a closed manager
    async fn connect(self: &Arc<Self>) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.connect_with(true).await
    }

    async fn connect_with(self: &Arc<Self>, reopen: bool) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let pending = {
            let mut state = self.state.lock().await;
            if state.closed {
                if !reopen {
                    return Err(BrokerError::Connection("connection manager is closed".to_string()));
                }
                state.closed = false;
            }

            if let Some(connection) = state.connection.as_ref().filter(|c| c.is_open()) {
                return Ok(connection.clone());
            }

            match &state.pending {
                Some(pending) => pending.clone(),
                None => {
                    let pending = Self::open(self.clone(), state.epoch).boxed().shared();
                    state.pending = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    async fn open(inner: Arc<Self>, epoch: u64) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let result = inner
            .broker
            .connect(&inner.config.url, inner.config.heartbeat_secs)
            .await;

        let mut state = inner.state.lock().await;
        if state.epoch != epoch {
            drop(state);
            if let Ok(connection) = result {
                if let Err(e) = connection.close().await {
                    tracing::warn!(error = %e, "Failed to close connection opened during shutdown");
                }
            }
            tracing::debug!("Discarded connection attempt that finished after close");
            return Err(BrokerError::Connection("connection manager was closed".to_string()));
        }
        state.pending = None;

        match result {
            Ok(connection) => {
                state.generation += 1;
                let generation = state.generation;
                connection.on_error(Self::connection_error_callback(&inner, generation));
                state.connection = Some(connection.clone());
                drop(state);

                inner.link.send_replace(LinkState {
                    generation,
                    connected: true,
                });
                tracing::info!(
                    url = %redact_url(&inner.config.url),
                    generation,
                    "Connected to message broker"
                );
                Ok(connection)
            }
            Err(e) => {
                tracing::error!(
                    url = %redact_url(&inner.config.url),
                    error = %e,
                    "Failed to connect to message broker"
                );
                inner.schedule_reconnect(&mut state);
                Err(e)
            }
        }
    }

    fn connection_error_callback(inner: &Arc<Self>, generation: u64) -> ErrorCallback {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let runtime = Handle::current();
        Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                runtime.spawn(async move { inner.connection_lost(generation, err).await });
            }
        })
    }

    fn channel_error_callback(inner: &Arc<Self>, purpose: ChannelPurpose, id: u64) -> ErrorCallback {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let runtime = Handle::current();
        Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                runtime.spawn(async move {
                    let mut channels = inner.channels.lock().await;
                    if channels.get(&purpose).is_some_and(|c| c.id == id) {
                        channels.remove(&purpose);
                        drop(channels);
                        tracing::warn!(?purpose, channel_id = id, error = %err, "Broker channel lost");
                        // No receivers is fine
                        let _ = inner.channel_lost.send(purpose);
                    }
                });
            }
        })
    }

    async fn connection_lost(self: &Arc<Self>, generation: u64, err: BrokerError) {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation || state.connection.is_none() {
                return;
            }
            state.connection = None;
        }

        tracing::warn!(generation, error = %err, "Broker connection lost");
        self.channels.lock().await.clear();
        self.link.send_modify(|link| link.connected = false);

        let mut state = self.state.lock().await;
        self.schedule_reconnect(&mut state);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ConnectionState) {
        if state.closed || !self.config.reconnect_enabled() {
            return;
        }
        if state.reconnect_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let inner = self.clone();
        state.reconnect_task = Some(tokio::spawn(async move { inner.reconnect_loop().await }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let attempts = self.config.reconnect_attempts;

        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.reconnect_delay).await;

            {
                let state = self.state.lock().await;
                if state.closed {
                    return;
                }
                if state.connection.as_ref().is_some_and(|c| c.is_open()) {
                    return;
                }
            }

            match self.connect_with(false).await {
                Ok(_) => {
                    tracing::info!(attempt, "Reconnected to message broker");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts = attempts, error = %e, "Reconnect attempt failed");
                }
            }
        }

        tracing::error!(attempts, "Giving up reconnecting to message broker");
    }
}

/// Hide credentials in a broker URL before logging it
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
