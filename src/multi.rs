//! Aggregation over a set of channels.
//!
//! A [`MultiChannel`] treats N single-scalar channels as one loosely
//! coupled group: connect them all concurrently, read and write them as a
//! vector, and follow their updates through one merged poll surface. The
//! group degrades instead of failing: a channel that never connects, or
//! drops out later, shows up as a gap in the aggregate rather than an error,
//! as long as no more than the configured number of channels are missing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};

use crate::channel::Channel;
use crate::error::{ChanlinkError, Result};
use crate::subscribe::Subscription;
use crate::transport::ProjectionSpec;
use crate::value::Scalar;

/// Interval between aggregate poll sweeps while waiting for an update.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One merged view over the member channels' values.
///
/// Indices line up with the channel order given to [`MultiChannel::new`].
/// A `None` value means that channel has not delivered anything yet (or is
/// not connected).
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    values: Vec<Option<Scalar>>,
    changed: Vec<bool>,
    connected: Vec<bool>,
}

impl AggregateSnapshot {
    fn new(size: usize) -> Self {
        Self {
            values: vec![None; size],
            changed: vec![false; size],
            connected: vec![false; size],
        }
    }

    /// Number of member channels.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the aggregate has no members.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of channel `index`, if it has delivered one.
    pub fn value(&self, index: usize) -> Option<&Scalar> {
        self.values.get(index).and_then(|v| v.as_ref())
    }

    /// All member values in channel order.
    pub fn values(&self) -> &[Option<Scalar>] {
        &self.values
    }

    /// Whether channel `index` delivered a fresh value in the last poll.
    pub fn changed(&self, index: usize) -> bool {
        self.changed.get(index).copied().unwrap_or(false)
    }

    /// Whether channel `index` was connected at the last poll.
    pub fn connected(&self, index: usize) -> bool {
        self.connected.get(index).copied().unwrap_or(false)
    }
}

/// A group of channels driven as one.
pub struct MultiChannel {
    channels: Vec<Arc<Channel>>,
    /// How many members may fail to connect before `connect()` errors.
    max_not_connected: usize,
}

impl MultiChannel {
    /// Group `channels`, tolerating up to `max_not_connected` members that
    /// never connect.
    pub fn new(channels: Vec<Arc<Channel>>, max_not_connected: usize) -> Arc<Self> {
        Arc::new(Self {
            channels,
            max_not_connected,
        })
    }

    /// Number of member channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// The member channels, in aggregate order.
    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    /// Per-channel connection flags, in aggregate order.
    pub fn is_connected(&self) -> Vec<bool> {
        self.channels.iter().map(|c| c.is_connected()).collect()
    }

    /// Connect every member concurrently, waiting up to `timeout` overall.
    ///
    /// Succeeds when the number of members that failed to connect is within
    /// the configured tolerance; otherwise returns the first failure.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        let mut tasks = JoinSet::new();
        for (index, channel) in self.channels.iter().enumerate() {
            let channel = channel.clone();
            tasks.spawn(async move { (index, channel.connect(timeout).await) });
        }

        let mut first_failure = None;
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| ChanlinkError::Transport(e.to_string()))?;
            if let Err(e) = result {
                tracing::debug!(
                    channel = self.channels[index].name(),
                    error = %e,
                    "member failed to connect"
                );
                failed += 1;
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }

        match first_failure {
            Some(e) if failed > self.max_not_connected => Err(e),
            _ => Ok(()),
        }
    }

    /// Read every connected member's scalar, in aggregate order.
    ///
    /// Members that are not connected (within tolerance) yield `None`.
    pub async fn get(&self, timeout: Duration) -> Result<Vec<Option<Scalar>>> {
        self.connect(timeout).await?;
        let mut tasks = JoinSet::new();
        for (index, channel) in self.channels.iter().enumerate() {
            let channel = channel.clone();
            tasks.spawn(async move {
                let value = if channel.is_connected() {
                    channel
                        .get()
                        .await
                        .and_then(|v| v.as_scalar().map(Scalar::clone))
                        .ok()
                } else {
                    None
                };
                (index, value)
            });
        }

        let mut values = vec![None; self.channels.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, value) = joined.map_err(|e| ChanlinkError::Transport(e.to_string()))?;
            values[index] = value;
        }
        Ok(values)
    }

    /// Write one scalar per member, in aggregate order. `None` entries and
    /// unconnected members are skipped.
    pub async fn put(&self, values: Vec<Option<Scalar>>, timeout: Duration) -> Result<()> {
        if values.len() != self.channels.len() {
            return Err(ChanlinkError::ShapeMismatch(format!(
                "{} values for {} channels",
                values.len(),
                self.channels.len()
            )));
        }
        self.connect(timeout).await?;

        let mut tasks = JoinSet::new();
        for (channel, value) in self.channels.iter().zip(values) {
            let Some(value) = value else { continue };
            if !channel.is_connected() {
                continue;
            }
            let channel = channel.clone();
            tasks.spawn(async move { channel.put(value).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| ChanlinkError::Transport(e.to_string()))??;
        }
        Ok(())
    }

    /// Build and start one subscription per connected member.
    pub async fn subscribe(&self, timeout: Duration) -> Result<MultiSubscription> {
        self.connect(timeout).await?;

        let mut subs = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            if channel.is_connected() {
                let sub = channel.subscribe(ProjectionSpec::default()).await?;
                sub.start().await?;
                subs.push(Some(sub));
            } else {
                subs.push(None);
            }
        }
        Ok(MultiSubscription {
            channels: self.channels.clone(),
            subs,
            snapshot: AggregateSnapshot::new(self.channels.len()),
        })
    }
}

/// The subscription side of a [`MultiChannel`].
pub struct MultiSubscription {
    channels: Vec<Arc<Channel>>,
    subs: Vec<Option<Arc<Subscription>>>,
    snapshot: AggregateSnapshot,
}

impl MultiSubscription {
    /// Current aggregate view.
    pub fn snapshot(&self) -> &AggregateSnapshot {
        &self.snapshot
    }

    /// Poll every member once; true if any delivered an update.
    ///
    /// Each member's change flag reflects this sweep only. A member whose
    /// source is lost or disconnected keeps its last value with its
    /// connected flag lowered; it never blocks the others.
    pub fn poll(&mut self) -> bool {
        let mut any = false;
        for (index, sub) in self.subs.iter().enumerate() {
            self.snapshot.changed[index] = false;
            self.snapshot.connected[index] = self.channels[index].is_connected();
            let Some(sub) = sub else { continue };
            match sub.poll() {
                Ok(true) => {
                    if let Ok(value) = sub.snapshot() {
                        self.snapshot.values[index] = value.as_scalar().ok().cloned();
                        self.snapshot.changed[index] = true;
                        any = true;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(
                        channel = self.channels[index].name(),
                        error = %e,
                        "member poll failed"
                    );
                    self.snapshot.connected[index] = false;
                }
            }
        }
        any
    }

    /// Suspend until any member delivers an update, or until `timeout`.
    pub async fn wait_for_update(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ChanlinkError::Timeout);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop every member's deliveries.
    pub fn stop(&self) -> Result<()> {
        for sub in self.subs.iter().flatten() {
            sub.stop()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::transport::mock::{MockChannelControl, MockProvider};
    use crate::value::{ScalarKind, Shape};

    const TICK: Duration = Duration::from_millis(200);

    fn group(n: usize, max_not_connected: usize) -> (Vec<MockChannelControl>, Arc<MultiChannel>) {
        let provider = MockProvider::new();
        let config = ChannelConfig::new()
            .connect_timeout(Duration::from_millis(50))
            .operate_timeout(TICK);
        let mut controls = Vec::new();
        let mut channels = Vec::new();
        for i in 0..n {
            let name = format!("dev:m{i}");
            controls.push(
                provider.add_channel(&name, Shape::scalar("value", ScalarKind::Float)),
            );
            channels.push(Channel::new(provider.clone(), &name, config.clone()));
        }
        (controls, MultiChannel::new(channels, max_not_connected))
    }

    #[tokio::test]
    async fn test_connect_all() {
        let (_controls, multi) = group(3, 0);
        multi.connect(TICK).await.unwrap();
        assert_eq!(multi.is_connected(), vec![true, true, true]);
    }

    #[tokio::test]
    async fn test_partial_failure_within_tolerance() {
        let (controls, multi) = group(3, 1);
        controls[1].refuse_connections(true);

        multi.connect(TICK).await.unwrap();
        assert_eq!(multi.is_connected(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_partial_failure_beyond_tolerance() {
        let (controls, multi) = group(3, 0);
        controls[2].refuse_connections(true);

        assert!(multi.connect(TICK).await.is_err());
    }

    #[tokio::test]
    async fn test_get_put_vector() {
        let (controls, multi) = group(2, 0);

        multi
            .put(
                vec![Some(Scalar::Float(1.0)), Some(Scalar::Float(2.0))],
                TICK,
            )
            .await
            .unwrap();
        assert_eq!(
            controls[1].value().scalar("value").unwrap(),
            &Scalar::Float(2.0)
        );

        let values = multi.get(TICK).await.unwrap();
        assert_eq!(
            values,
            vec![Some(Scalar::Float(1.0)), Some(Scalar::Float(2.0))]
        );
    }

    #[tokio::test]
    async fn test_put_length_mismatch_rejected() {
        let (_controls, multi) = group(2, 0);
        let result = multi.put(vec![Some(Scalar::Float(1.0))], TICK).await;
        assert!(matches!(result, Err(ChanlinkError::ShapeMismatch(_))));
    }

    #[tokio::test]
    async fn test_get_skips_unconnected_member() {
        let (controls, multi) = group(3, 1);
        controls[0].refuse_connections(true);
        controls[1]
            .set_scalar_silently("value", Scalar::Float(5.0))
            .unwrap();

        let values = multi.get(TICK).await.unwrap();
        assert_eq!(values[0], None);
        assert_eq!(values[1], Some(Scalar::Float(5.0)));
    }

    #[tokio::test]
    async fn test_aggregate_poll() {
        let (controls, multi) = group(2, 0);
        let mut agg = multi.subscribe(TICK).await.unwrap();

        // initial snapshots
        assert!(agg.poll());
        assert!(agg.snapshot().changed(0));
        assert!(agg.snapshot().changed(1));

        controls[0].set_scalar("value", Scalar::Float(9.0)).unwrap();
        assert!(agg.poll());
        assert!(agg.snapshot().changed(0));
        assert!(!agg.snapshot().changed(1));
        assert_eq!(agg.snapshot().value(0), Some(&Scalar::Float(9.0)));

        assert!(!agg.poll());
    }

    #[tokio::test]
    async fn test_aggregate_wait_for_update() {
        let (controls, multi) = group(2, 0);
        let mut agg = multi.subscribe(TICK).await.unwrap();
        agg.wait_for_update(TICK).await.unwrap(); // initial snapshots

        let handle = tokio::spawn(async move {
            agg.wait_for_update(Duration::from_secs(5)).await.map(|_| agg)
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controls[1].set_scalar("value", Scalar::Float(3.5)).unwrap();

        let agg = handle.await.unwrap().unwrap();
        assert_eq!(agg.snapshot().value(1), Some(&Scalar::Float(3.5)));
    }

    #[tokio::test]
    async fn test_lost_member_does_not_block_group() {
        let (controls, multi) = group(2, 0);
        let mut agg = multi.subscribe(TICK).await.unwrap();
        assert!(agg.poll()); // initial snapshots

        controls[0].unlisten_all();
        controls[1].set_scalar("value", Scalar::Float(7.0)).unwrap();

        assert!(agg.poll());
        assert!(!agg.snapshot().connected(0));
        assert_eq!(agg.snapshot().value(1), Some(&Scalar::Float(7.0)));
    }
}
