//! Client-visible subscription handle.
//!
//! A [`Subscription`] is the connect half of an operation with no operate
//! half: once connected, the transport pushes continuously into the owned
//! [`SubscriptionQueue`](super::SubscriptionQueue) and the application
//! drains it through `poll` / `wait_for_update` / `release`. Each delivered
//! update is copied into the handle's externally visible
//! [`ChangeTrackedValue`] before success is reported.
//!
//! `restart` swaps the projection without changing handle identity: the old
//! queue and remote subscription are discarded and rebuilt. A generation
//! counter on the transport sink keeps a straggling producer from the old
//! incarnation out of the new queue.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::queue::{DeliverySlot, SubscriptionQueue};
use crate::config::ChannelConfig;
use crate::error::{ChanlinkError, Result};
use crate::transport::{
    ChannelRef, OpStatus, ProjectionSpec, SubscriptionRef, SubscriptionSink,
};
use crate::value::{ChangeSet, ChangeTrackedValue, Shape, ValueTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubPhase {
    Idle,
    ConnectIssued,
    Connected,
    Failed,
}

struct SubInner {
    projection: ProjectionSpec,
    phase: SubPhase,
    /// Bumped by `restart`; sinks from older incarnations are ignored.
    generation: u64,
    queue: Option<Arc<SubscriptionQueue>>,
    sub_ref: Option<Arc<dyn SubscriptionRef>>,
    tracked: Option<ChangeTrackedValue>,
    /// Overrun set of the most recently delivered update.
    overrun: Option<ChangeSet>,
    /// Slot checked out on the last successful poll, released on the next.
    held: Option<DeliverySlot>,
    source_lost: bool,
    connect_error: Option<String>,
}

/// One continuous subscription to a channel.
pub struct Subscription {
    channel: Arc<dyn ChannelRef>,
    config: ChannelConfig,
    inner: Mutex<SubInner>,
    connect_notify: Notify,
}

/// Transport-owned update adapter; weak back-reference only.
struct SubscriptionAdapter {
    sub: Weak<Subscription>,
    generation: u64,
}

impl SubscriptionSink for SubscriptionAdapter {
    fn on_connect(&self, status: OpStatus, shape: Option<Arc<Shape>>) {
        if let Some(sub) = self.sub.upgrade() {
            sub.handle_connect(self.generation, status, shape);
        }
    }

    fn produce(&self, delta: &ValueTree, changed: &ChangeSet) {
        if let Some(sub) = self.sub.upgrade() {
            sub.handle_produce(self.generation, delta, changed);
        }
    }

    fn unlisten(&self) {
        if let Some(sub) = self.sub.upgrade() {
            sub.handle_unlisten(self.generation);
        }
    }
}

impl Subscription {
    /// Create an unconnected subscription handle.
    pub fn new(
        channel: Arc<dyn ChannelRef>,
        projection: ProjectionSpec,
        config: ChannelConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            config,
            inner: Mutex::new(SubInner {
                projection,
                phase: SubPhase::Idle,
                generation: 0,
                queue: None,
                sub_ref: None,
                tracked: None,
                overrun: None,
                held: None,
                source_lost: false,
                connect_error: None,
            }),
            connect_notify: Notify::new(),
        })
    }

    /// Projection currently subscribed to.
    pub fn projection(&self) -> ProjectionSpec {
        self.inner.lock().projection.clone()
    }

    /// Whether the remote subscription is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().phase == SubPhase::Connected
    }

    /// Create the remote subscription and wait for the negotiated shape.
    ///
    /// Idempotent once connected.
    pub async fn connect(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let issue = {
            let mut inner = self.inner.lock();
            match inner.phase {
                SubPhase::Connected => return Ok(()),
                SubPhase::ConnectIssued => None,
                SubPhase::Idle | SubPhase::Failed => {
                    inner.phase = SubPhase::ConnectIssued;
                    inner.connect_error = None;
                    Some((inner.projection.clone(), inner.generation))
                }
            }
        };

        if let Some((projection, generation)) = issue {
            let sink: Arc<dyn SubscriptionSink> = Arc::new(SubscriptionAdapter {
                sub: Arc::downgrade(self),
                generation,
            });
            // The connect callback may fire inside this call; no lock held.
            match self.channel.create_subscription(&projection, sink) {
                Ok(sub_ref) => {
                    self.inner.lock().sub_ref = Some(sub_ref);
                }
                Err(e) => {
                    let mut inner = self.inner.lock();
                    inner.phase = SubPhase::Failed;
                    inner.connect_error = Some(e.to_string());
                    return Err(ChanlinkError::ConnectFailed(e.to_string()));
                }
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            {
                let inner = self.inner.lock();
                match inner.phase {
                    SubPhase::Connected => return Ok(()),
                    SubPhase::Failed => {
                        return Err(ChanlinkError::ConnectFailed(
                            inner.connect_error.clone().unwrap_or_default(),
                        ))
                    }
                    SubPhase::Idle | SubPhase::ConnectIssued => {}
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChanlinkError::Timeout);
            }
            let _ = tokio::time::timeout(remaining, self.connect_notify.notified()).await;
        }
    }

    fn handle_connect(&self, generation: u64, status: OpStatus, shape: Option<Arc<Shape>>) {
        {
            let mut inner = self.inner.lock();
            if generation != inner.generation {
                tracing::debug!("ignoring connect callback from a superseded subscription");
                return;
            }
            match (status, shape) {
                (OpStatus::Ok, Some(shape)) => {
                    inner.queue = Some(Arc::new(SubscriptionQueue::new(
                        shape.clone(),
                        self.config.queue_capacity,
                    )));
                    inner.tracked = Some(ChangeTrackedValue::new(shape));
                    inner.source_lost = false;
                    inner.phase = SubPhase::Connected;
                }
                (OpStatus::Ok, None) => {
                    inner.connect_error = Some("connect reported no shape".to_string());
                    inner.phase = SubPhase::Failed;
                }
                (OpStatus::Failed(reason), _) => {
                    inner.connect_error = Some(reason);
                    inner.phase = SubPhase::Failed;
                }
            }
        }
        self.connect_notify.notify_one();
    }

    fn handle_produce(&self, generation: u64, delta: &ValueTree, changed: &ChangeSet) {
        // Grab the queue under the lock, push outside it; produce must not
        // run application-visible work while holding the handle's lock.
        let queue = {
            let inner = self.inner.lock();
            if generation != inner.generation {
                return;
            }
            inner.queue.clone()
        };
        if let Some(queue) = queue {
            queue.produce(delta, changed);
        }
    }

    fn handle_unlisten(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            return;
        }
        tracing::debug!(channel = self.channel.name(), "subscription source lost");
        inner.source_lost = true;
    }

    /// Enable deliveries, connecting first if necessary. The first delivery
    /// is a full snapshot of the source's current value.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.connect(self.config.connect_timeout).await?;
        let (queue, sub_ref) = {
            let inner = self.inner.lock();
            (
                inner.queue.clone().ok_or(ChanlinkError::NotConnected)?,
                inner.sub_ref.clone().ok_or(ChanlinkError::NotConnected)?,
            )
        };
        // The source's initial full-value update lands in the queue's master
        // copy first, so the start() snapshot reflects it.
        sub_ref.start()?;
        queue.start();
        Ok(())
    }

    /// Stop future deliveries. Already-queued updates remain pollable.
    pub fn stop(&self) -> Result<()> {
        let (queue, sub_ref) = {
            let inner = self.inner.lock();
            (inner.queue.clone(), inner.sub_ref.clone())
        };
        if let Some(queue) = queue {
            queue.stop();
        }
        if let Some(sub_ref) = sub_ref {
            sub_ref.stop()?;
        }
        Ok(())
    }

    /// Non-blocking: take the next update if one is queued.
    ///
    /// On success the handle's tracked value reflects the update and the
    /// update's overrun set is retained; any previously delivered slot is
    /// released back to the queue first.
    pub fn poll(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        let queue = inner.queue.clone().ok_or(ChanlinkError::NotConnected)?;
        if let Some(held) = inner.held.take() {
            queue.release(held);
        }
        match queue.poll() {
            Some(slot) => {
                self.apply_slot(&mut inner, slot)?;
                Ok(true)
            }
            None if inner.source_lost => Err(ChanlinkError::SourceLost),
            None => Ok(false),
        }
    }

    /// Suspend until an update is available or `timeout` elapses.
    pub async fn wait_for_update(&self, timeout: Duration) -> Result<()> {
        let queue = {
            let mut inner = self.inner.lock();
            let queue = inner.queue.clone().ok_or(ChanlinkError::NotConnected)?;
            if let Some(held) = inner.held.take() {
                queue.release(held);
            }
            if inner.source_lost && queue.ready_len() == 0 {
                return Err(ChanlinkError::SourceLost);
            }
            queue
        };
        let slot = queue.wait_for_update(timeout).await?;
        let mut inner = self.inner.lock();
        self.apply_slot(&mut inner, slot)?;
        Ok(())
    }

    fn apply_slot(&self, inner: &mut SubInner, slot: DeliverySlot) -> Result<()> {
        let tracked = inner.tracked.as_mut().ok_or(ChanlinkError::NotConnected)?;
        tracked.apply_update(slot.value(), slot.changed())?;
        match inner.overrun.as_mut() {
            Some(overrun) => overrun.copy_from(slot.overrun()),
            None => inner.overrun = Some(slot.overrun().clone()),
        }
        inner.held = Some(slot);
        Ok(())
    }

    /// Return the held delivery slot to circulation, letting a pending
    /// overflow accumulation through. No-op when nothing is held.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if let (Some(held), Some(queue)) = (inner.held.take(), inner.queue.clone()) {
            queue.release(held);
        }
    }

    /// Clone of the tracked value as of the last delivered update.
    pub fn snapshot(&self) -> Result<ChangeTrackedValue> {
        self.inner
            .lock()
            .tracked
            .clone()
            .ok_or(ChanlinkError::NotConnected)
    }

    /// Fields that changed more than once within the last delivered update
    /// (non-empty only when deliveries were coalesced).
    pub fn overrun(&self) -> Result<ChangeSet> {
        let inner = self.inner.lock();
        match &inner.overrun {
            Some(overrun) => Ok(overrun.clone()),
            None => {
                let tracked = inner.tracked.as_ref().ok_or(ChanlinkError::NotConnected)?;
                Ok(ChangeSet::new(tracked.shape().field_count()))
            }
        }
    }

    /// Tear down the current queue and remote subscription and reconnect
    /// against a new projection, keeping the handle identity.
    pub async fn restart(self: &Arc<Self>, projection: ProjectionSpec) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            if let Some(queue) = &inner.queue {
                queue.stop();
            }
            if let Some(sub_ref) = inner.sub_ref.take() {
                if let Err(e) = sub_ref.stop() {
                    tracing::debug!("stop during restart: {e}");
                }
                sub_ref.destroy();
            }
            // The held slot belongs to the discarded queue; drop both.
            inner.held = None;
            inner.queue = None;
            inner.tracked = None;
            inner.overrun = None;
            inner.source_lost = false;
            inner.phase = SubPhase::Idle;
            inner.connect_error = None;
            inner.projection = projection;
        }
        self.connect(self.config.connect_timeout).await
    }

    /// Stop and discard the remote subscription entirely.
    pub fn unsubscribe(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        if let Some(queue) = &inner.queue {
            queue.stop();
        }
        if let Some(sub_ref) = inner.sub_ref.take() {
            let _ = sub_ref.stop();
            sub_ref.destroy();
        }
        inner.held = None;
        inner.queue = None;
        inner.tracked = None;
        inner.overrun = None;
        inner.phase = SubPhase::Idle;
    }
}
