//! The channel handle: one named remote record, many operations.
//!
//! A [`Channel`] owns the transport connection for one channel name and
//! hands out the pieces built on top of it: cached [`Operation`] instances
//! keyed by `(OpKind, ProjectionSpec)`, [`Subscription`]s, and the one-line
//! convenience helpers (`get`, `put`, `trigger`, ...) most callers want.
//!
//! # Architecture
//!
//! ```text
//! Channel ──connect──> ChannelProvider ──> ChannelRef
//!    │                                        ▲
//!    ├── operation(kind, projection) ── Operation (cached, reused)
//!    ├── subscribe(projection) ──────── Subscription
//!    └── get()/put()/trigger() ──────── sugar over operation()
//! ```
//!
//! Connection state is driven by transport events through a weak listener
//! adapter, so dropping the last `Arc<Channel>` tears everything down even
//! though the transport still holds the listener.
//!
//! # Example
//!
//! ```no_run
//! use chanlink::transport::mock::MockProvider;
//! use chanlink::value::{Scalar, ScalarKind, Shape};
//! use chanlink::{Channel, ChannelConfig};
//!
//! # async fn demo() -> chanlink::Result<()> {
//! let provider = MockProvider::new();
//! provider.add_channel("dev:temp", Shape::scalar("value", ScalarKind::Float));
//!
//! let channel = Channel::new(provider, "dev:temp", ChannelConfig::default());
//! channel.put(Scalar::Float(21.5)).await?;
//! let reading = channel.get_f64().await?;
//! # let _ = reading;
//! # Ok(())
//! # }
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::ChannelConfig;
use crate::error::{ChanlinkError, Result};
use crate::operation::Operation;
use crate::subscribe::Subscription;
use crate::transport::{
    ChannelProvider, ChannelRef, ConnectionEvent, ConnectionListener, OpKind, ProjectionSpec,
};
use crate::value::{ChangeTrackedValue, Scalar};

/// Connection lifecycle of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    NeverConnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The channel is connected and usable.
    Connected,
    /// The connection dropped; the transport may bring it back.
    Disconnected,
    /// The channel was destroyed and will never reconnect.
    Destroyed,
}

struct ChannelInner {
    state: ConnectionState,
    channel_ref: Option<Arc<dyn ChannelRef>>,
    /// First writer wins; entries are never evicted.
    ops: HashMap<(OpKind, ProjectionSpec), Arc<Operation>>,
}

/// A handle to one named channel.
pub struct Channel {
    name: String,
    provider: Arc<dyn ChannelProvider>,
    config: ChannelConfig,
    inner: Mutex<ChannelInner>,
    state_notify: Notify,
}

/// Transport-owned event adapter; weak back-reference only.
struct ConnectionAdapter {
    channel: Weak<Channel>,
}

impl ConnectionListener for ConnectionAdapter {
    fn on_connection_event(&self, event: ConnectionEvent) {
        if let Some(channel) = self.channel.upgrade() {
            channel.handle_connection_event(event);
        }
    }
}

impl Channel {
    /// Create an unconnected handle for `name` on `provider`.
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        name: &str,
        config: ChannelConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            provider,
            config,
            inner: Mutex::new(ChannelInner {
                state: ConnectionState::NeverConnected,
                channel_ref: None,
                ops: HashMap::new(),
            }),
            state_notify: Notify::new(),
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Config this handle and everything created from it use.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether the channel is currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to the remote channel, waiting up to `timeout`.
    ///
    /// Idempotent: concurrent and repeat callers share the single underlying
    /// connection attempt. A disconnected channel waits here for the
    /// transport to restore the connection.
    pub async fn connect(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let issue = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Destroyed => return Err(ChanlinkError::Destroyed),
                ConnectionState::Connecting | ConnectionState::Disconnected => false,
                ConnectionState::NeverConnected => {
                    inner.state = ConnectionState::Connecting;
                    true
                }
            }
        };

        if issue {
            let listener: Arc<dyn ConnectionListener> = Arc::new(ConnectionAdapter {
                channel: Arc::downgrade(self),
            });
            // Connection events may fire inside this call; no lock held.
            match self.provider.create_connection(&self.name, listener) {
                Ok(channel_ref) => {
                    self.inner.lock().channel_ref = Some(channel_ref);
                }
                Err(e) => {
                    self.inner.lock().state = ConnectionState::NeverConnected;
                    return Err(ChanlinkError::ConnectFailed(e.to_string()));
                }
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                ConnectionState::Connected => {
                    // Pass the wakeup along to the next waiter in line.
                    self.state_notify.notify_one();
                    return Ok(());
                }
                ConnectionState::Destroyed => {
                    self.state_notify.notify_one();
                    return Err(ChanlinkError::Destroyed);
                }
                _ => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChanlinkError::Timeout);
            }
            let _ = tokio::time::timeout(remaining, self.state_notify.notified()).await;
        }
    }

    fn handle_connection_event(&self, event: ConnectionEvent) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Destroyed {
                return;
            }
            tracing::debug!(channel = %self.name, ?event, "connection event");
            inner.state = match event {
                ConnectionEvent::Connected => ConnectionState::Connected,
                ConnectionEvent::Disconnected => ConnectionState::Disconnected,
                ConnectionEvent::Destroyed => ConnectionState::Destroyed,
            };
        }
        self.state_notify.notify_one();
    }

    /// The connected [`Operation`] for `(kind, projection)`.
    ///
    /// Operations are cached per handle and reused: issuing `get()` in a
    /// loop creates one read operation, not one per call. Connects the
    /// channel first if necessary.
    pub async fn operation(
        self: &Arc<Self>,
        kind: OpKind,
        projection: ProjectionSpec,
    ) -> Result<Arc<Operation>> {
        self.connect(self.config.connect_timeout).await?;
        let op = {
            let mut inner = self.inner.lock();
            let channel_ref = inner
                .channel_ref
                .clone()
                .ok_or(ChanlinkError::NotConnected)?;
            match inner.ops.entry((kind, projection.clone())) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    entry.insert(Operation::new(channel_ref, kind, projection)).clone()
                }
            }
        };
        // Idempotent; a cache hit returns immediately.
        op.connect(self.config.connect_timeout).await?;
        Ok(op)
    }

    /// Create a subscription against `projection` (not yet started).
    ///
    /// Connects the channel first if necessary.
    pub async fn subscribe(
        self: &Arc<Self>,
        projection: ProjectionSpec,
    ) -> Result<Arc<Subscription>> {
        self.connect(self.config.connect_timeout).await?;
        let channel_ref = self
            .inner
            .lock()
            .channel_ref
            .clone()
            .ok_or(ChanlinkError::NotConnected)?;
        Ok(Subscription::new(channel_ref, projection, self.config.clone()))
    }

    /// Tear the channel down. All cached operations are dropped; subsequent
    /// calls fail with `Destroyed`.
    pub fn destroy(&self) {
        let channel_ref = {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Destroyed;
            inner.ops.clear();
            inner.channel_ref.take()
        };
        if let Some(channel_ref) = channel_ref {
            channel_ref.destroy();
        }
        self.state_notify.notify_one();
    }

    // ---- convenience helpers over operation() ----

    /// Read the channel's value.
    pub async fn get(self: &Arc<Self>) -> Result<ChangeTrackedValue> {
        let op = self
            .operation(OpKind::Read, ProjectionSpec::default())
            .await?;
        op.operate(self.config.operate_timeout).await?;
        op.snapshot()
    }

    /// Write a scalar to the channel's sole value field.
    pub async fn put(self: &Arc<Self>, value: Scalar) -> Result<()> {
        let op = self
            .operation(OpKind::Write, ProjectionSpec::default())
            .await?;
        op.stage_value(value)?;
        op.operate(self.config.operate_timeout).await
    }

    /// Write a scalar and read the resulting value in one round trip.
    pub async fn put_get(self: &Arc<Self>, value: Scalar) -> Result<ChangeTrackedValue> {
        let op = self
            .operation(OpKind::WriteRead, ProjectionSpec::default())
            .await?;
        op.stage_value(value)?;
        op.operate(self.config.operate_timeout).await?;
        op.snapshot()
    }

    /// Process the record without moving data.
    pub async fn trigger(self: &Arc<Self>) -> Result<()> {
        let op = self
            .operation(OpKind::Trigger, ProjectionSpec::default())
            .await?;
        op.operate(self.config.operate_timeout).await
    }

    /// The connected remote-call operation: stage arguments on it, then
    /// `operate()`; the result tree replaces the staged arguments.
    pub async fn call(self: &Arc<Self>) -> Result<Arc<Operation>> {
        self.operation(OpKind::RemoteCall, ProjectionSpec::default())
            .await
    }

    /// Read the channel's sole value field as an `f64`.
    pub async fn get_f64(self: &Arc<Self>) -> Result<f64> {
        self.get().await?.as_f64()
    }

    /// Write an `f64` to the channel's sole value field.
    pub async fn put_f64(self: &Arc<Self>, value: f64) -> Result<()> {
        self.put(Scalar::Float(value)).await
    }

    /// Read the channel's sole value field as a string.
    pub async fn get_string(self: &Arc<Self>) -> Result<String> {
        self.get().await?.as_string()
    }
}
