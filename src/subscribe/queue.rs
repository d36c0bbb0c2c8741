//! Bounded, producer-never-blocks subscription delivery queue.
//!
//! A [`SubscriptionQueue`] sits between a transport that pushes updates on
//! its own threads and a consumer that drains them at its own pace. It
//! guarantees, for any pool size `N >= 1` and any consumption pattern:
//!
//! - `produce()` never waits on the consumer
//! - at most `N` updates are buffered individually (FIFO)
//! - once the pool is exhausted, further updates coalesce into a single
//!   always-present overflow slot whose change set is a superset of
//!   everything that happened, and whose overrun set flags exactly the
//!   fields that changed more than once in the coalescing window
//! - the overflow accumulation is delivered after everything already queued,
//!   the next time the consumer releases a slot
//!
//! Overflow is not an error; it is the designed-for degradation mode.
//!
//! # Slot ownership
//!
//! Every [`DeliverySlot`] lives in exactly one place: the free pool, the
//! ready queue, or checked out to the consumer (ownership moves out through
//! [`poll`] and back through [`release`]). The overflow slot is a singleton
//! outside the pool. This transfer discipline is the queue's entire
//! synchronization story.
//!
//! [`poll`]: SubscriptionQueue::poll
//! [`release`]: SubscriptionQueue::release

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{ChanlinkError, Result};
use crate::value::{ChangeSet, Shape, ValueTree};

/// One reusable delivery buffer: a value copy, the fields it changed, and
/// the fields that changed more than once since the previous delivery.
#[derive(Debug)]
pub struct DeliverySlot {
    value: ValueTree,
    changed: ChangeSet,
    overrun: ChangeSet,
}

impl DeliverySlot {
    fn new(shape: &Arc<Shape>) -> Self {
        let fields = shape.field_count();
        Self {
            value: ValueTree::new(shape.clone()),
            changed: ChangeSet::new(fields),
            overrun: ChangeSet::new(fields),
        }
    }

    /// The delivered value. Fields outside [`changed`](Self::changed) may be
    /// stale; consumers should read the changed fields.
    pub fn value(&self) -> &ValueTree {
        &self.value
    }

    /// Fields written since the consumer's previous delivery.
    pub fn changed(&self) -> &ChangeSet {
        &self.changed
    }

    /// Fields written more than once since the previous delivery (only
    /// non-empty for coalesced overflow deliveries).
    pub fn overrun(&self) -> &ChangeSet {
        &self.overrun
    }
}

struct QueueInner {
    free: Vec<DeliverySlot>,
    ready: VecDeque<DeliverySlot>,
    /// Singleton accumulator, never part of the pool.
    overflow: DeliverySlot,
    in_overflow: bool,
    running: bool,
    checked_out: usize,
    /// Master copy of the source's current value; feeds the start() snapshot.
    latest: ValueTree,
}

impl QueueInner {
    /// Move the overflow accumulation into `slot` and queue it.
    /// Returns true if the push made `ready` non-empty.
    fn drain_overflow_into(&mut self, mut slot: DeliverySlot) -> bool {
        if let Err(e) = slot
            .value
            .copy_fields_from(&self.overflow.value, &self.overflow.changed)
        {
            tracing::error!("overflow drain failed: {e}");
        }
        slot.changed.copy_from(&self.overflow.changed);
        slot.overrun.copy_from(&self.overflow.overrun);
        self.overflow.changed.clear_all();
        self.overflow.overrun.clear_all();
        self.in_overflow = false;

        let was_empty = self.ready.is_empty();
        self.ready.push_back(slot);
        was_empty
    }
}

/// The bounded delivery engine behind one subscription.
pub struct SubscriptionQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl SubscriptionQueue {
    /// Create a queue for the negotiated shape with `capacity` pool slots
    /// (clamped to at least 1). Created stopped.
    pub fn new(shape: Arc<Shape>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let free = (0..capacity).map(|_| DeliverySlot::new(&shape)).collect();
        Self {
            inner: Mutex::new(QueueInner {
                free,
                ready: VecDeque::with_capacity(capacity),
                overflow: DeliverySlot::new(&shape),
                in_overflow: false,
                running: false,
                checked_out: 0,
                latest: ValueTree::new(shape),
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Pool size `N`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether deliveries are currently enabled.
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Whether the overflow slot currently holds a coalesced accumulation.
    pub fn in_overflow(&self) -> bool {
        self.inner.lock().in_overflow
    }

    /// Number of slots waiting for the consumer.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Number of slots checked out to the consumer.
    pub fn checked_out(&self) -> usize {
        self.inner.lock().checked_out
    }

    /// Accept one remote update. Never blocks; called by the transport on
    /// arbitrary threads.
    ///
    /// While stopped the update only refreshes the master copy and nothing
    /// is delivered. Otherwise the update is either queued in its own slot
    /// or folded into the overflow accumulation.
    pub fn produce(&self, delta: &ValueTree, changed: &ChangeSet) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.latest.copy_fields_from(delta, changed) {
            tracing::warn!("dropping update with incompatible delta: {e}");
            return;
        }
        if !inner.running {
            return;
        }

        if inner.in_overflow || inner.free.is_empty() {
            inner.in_overflow = true;
            // A field is overrun when it was already pending and changes again.
            let repeat = inner.overflow.changed.intersection(changed);
            inner.overflow.overrun.union_with(&repeat);
            inner.overflow.changed.union_with(changed);
            let QueueInner { overflow, latest, .. } = &mut *inner;
            if let Err(e) = overflow.value.copy_fields_from(latest, changed) {
                tracing::error!("overflow copy failed: {e}");
            }
            return;
        }

        let Some(mut slot) = inner.free.pop() else {
            return;
        };
        if let Err(e) = slot.value.copy_fields_from(delta, changed) {
            tracing::error!("slot copy failed: {e}");
            inner.free.push(slot);
            return;
        }
        slot.changed.copy_from(changed);
        slot.overrun.clear_all();

        let was_empty = inner.ready.is_empty();
        inner.ready.push_back(slot);
        drop(inner);

        // Edge-triggered: only the empty-to-non-empty transition signals.
        if was_empty {
            self.notify.notify_one();
        }
    }

    /// Enable deliveries and queue one full snapshot, so the first delivery
    /// never makes a late-starting consumer wait for the next delta.
    ///
    /// Idempotent: a running queue ignores the call.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.running {
            return;
        }
        inner.running = true;

        // Full snapshot staged through the overflow slot, then placed the
        // same way produce() places an update.
        inner.overflow.changed.set_all();
        {
            let QueueInner { overflow, latest, .. } = &mut *inner;
            let all = ChangeSet::all(latest.shape().field_count());
            if let Err(e) = overflow.value.copy_fields_from(latest, &all) {
                tracing::error!("snapshot copy failed: {e}");
            }
        }

        if inner.free.is_empty() {
            inner.in_overflow = true;
            return;
        }
        let Some(slot) = inner.free.pop() else {
            inner.in_overflow = true;
            return;
        };
        let was_empty = inner.drain_overflow_into(slot);
        drop(inner);
        if was_empty {
            self.notify.notify_one();
        }
    }

    /// Disable deliveries. Already-queued slots survive and remain pollable.
    pub fn stop(&self) {
        self.inner.lock().running = false;
    }

    /// Non-blocking: pop the oldest ready slot, transferring ownership to
    /// the caller, or return `None`.
    pub fn poll(&self) -> Option<DeliverySlot> {
        let mut inner = self.inner.lock();
        let slot = inner.ready.pop_front()?;
        inner.checked_out += 1;
        Some(slot)
    }

    /// Return a checked-out slot to circulation.
    ///
    /// If an overflow accumulation is pending, the freed slot carries it to
    /// the ready queue; otherwise the slot rejoins the free pool.
    pub fn release(&self, slot: DeliverySlot) {
        let was_empty = {
            let mut inner = self.inner.lock();
            inner.checked_out = inner.checked_out.saturating_sub(1);
            if inner.in_overflow {
                inner.drain_overflow_into(slot)
            } else {
                inner.free.push(slot);
                false
            }
        };
        if was_empty {
            self.notify.notify_one();
        }
    }

    /// Suspend until [`poll`](Self::poll) would succeed, or until `timeout`.
    pub async fn wait_for_update(&self, timeout: Duration) -> Result<DeliverySlot> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(slot) = self.poll() {
                return Ok(slot);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChanlinkError::Timeout);
            }
            // A permit stored by a notify that raced ahead of us is consumed
            // immediately; the loop re-polls either way.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Scalar, ScalarKind};

    fn abc_shape() -> Arc<Shape> {
        Shape::builder("abc")
            .scalar("a", ScalarKind::Int)
            .scalar("b", ScalarKind::Int)
            .scalar("c", ScalarKind::Int)
            .build()
    }

    fn delta(shape: &Arc<Shape>, writes: &[(&str, i64)]) -> (ValueTree, ChangeSet) {
        let mut tree = ValueTree::new(shape.clone());
        let mut changes = ChangeSet::new(shape.field_count());
        for (path, v) in writes {
            tree.set_scalar(path, Scalar::Int(*v)).unwrap();
            changes.set(shape.index_of(path).unwrap());
        }
        (tree, changes)
    }

    fn started_queue(shape: &Arc<Shape>, capacity: usize) -> SubscriptionQueue {
        let queue = SubscriptionQueue::new(shape.clone(), capacity);
        queue.start();
        // Drain the start() snapshot so tests see only their own produces.
        let snapshot = queue.poll().expect("start() queues a snapshot");
        queue.release(snapshot);
        queue
    }

    #[test]
    fn test_produce_before_start_is_not_delivered() {
        let shape = abc_shape();
        let queue = SubscriptionQueue::new(shape.clone(), 2);

        let (tree, changes) = delta(&shape, &[("a", 1)]);
        queue.produce(&tree, &changes);

        assert!(queue.poll().is_none());
        assert!(!queue.in_overflow());

        // The update is folded into the master copy, so the start() snapshot
        // still carries it.
        queue.start();
        let snapshot = queue.poll().expect("start() queues a snapshot");
        assert_eq!(snapshot.value().scalar("a").unwrap(), &Scalar::Int(1));
        queue.release(snapshot);
    }

    #[test]
    fn test_first_start_delivers_full_snapshot() {
        let shape = abc_shape();
        let queue = SubscriptionQueue::new(shape.clone(), 2);
        queue.start();

        let slot = queue.poll().expect("snapshot queued");
        assert_eq!(slot.changed().len(), shape.field_count());
        assert!(slot.overrun().is_empty());
        queue.release(slot);
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_start_is_idempotent() {
        let shape = abc_shape();
        let queue = SubscriptionQueue::new(shape.clone(), 2);
        queue.start();
        queue.start();

        let slot = queue.poll().expect("one snapshot");
        queue.release(slot);
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_pool_two_scenario() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 2);

        let (t1, c1) = delta(&shape, &[("a", 1)]);
        let (t2, c2) = delta(&shape, &[("b", 2)]);
        let (t3, c3) = delta(&shape, &[("a", 3), ("c", 3)]);
        queue.produce(&t1, &c1);
        queue.produce(&t2, &c2);
        // Both slots are queued and unpolled, so the pool is exhausted.
        queue.produce(&t3, &c3);

        assert!(queue.in_overflow());

        let s1 = queue.poll().unwrap();
        assert_eq!(s1.changed().iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(s1.value().scalar("a").unwrap(), &Scalar::Int(1));

        let s2 = queue.poll().unwrap();
        assert_eq!(s2.changed().iter().collect::<Vec<_>>(), vec![1]);

        // Third produce went to overflow: changed {a, c}, no overrun yet.
        queue.release(s1);
        let s3 = queue.poll().unwrap();
        assert_eq!(s3.changed().iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(s3.overrun().is_empty());
        assert_eq!(s3.value().scalar("a").unwrap(), &Scalar::Int(3));

        queue.release(s2);
        queue.release(s3);
    }

    #[test]
    fn test_overrun_flags_repeat_fields_only() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 1);

        let (t1, c1) = delta(&shape, &[("a", 1)]);
        queue.produce(&t1, &c1); // occupies the only slot

        let (t2, c2) = delta(&shape, &[("a", 2), ("c", 2)]);
        queue.produce(&t2, &c2); // overflow: changed {a, c}
        let (t3, c3) = delta(&shape, &[("a", 3)]);
        queue.produce(&t3, &c3); // a changes again while coalescing

        let first = queue.poll().unwrap();
        queue.release(first);

        let coalesced = queue.poll().unwrap();
        assert_eq!(coalesced.changed().iter().collect::<Vec<_>>(), vec![0, 2]);
        // a appeared twice in the window, c once
        assert_eq!(coalesced.overrun().iter().collect::<Vec<_>>(), vec![0]);
        // latest value of a wins
        assert_eq!(coalesced.value().scalar("a").unwrap(), &Scalar::Int(3));
        queue.release(coalesced);
    }

    #[test]
    fn test_no_update_loss() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 2);

        let sequences: Vec<Vec<&str>> = vec![
            vec!["a"],
            vec!["b"],
            vec!["a", "c"],
            vec!["b"],
            vec!["c"],
        ];
        let mut expected = ChangeSet::new(shape.field_count());
        for paths in &sequences {
            let writes: Vec<(&str, i64)> = paths.iter().map(|p| (*p, 1)).collect();
            let (tree, changes) = delta(&shape, &writes);
            expected.union_with(&changes);
            queue.produce(&tree, &changes);
        }

        // Releasing each slot drains any pending overflow into circulation,
        // so by the time poll() runs dry nothing is left anywhere.
        let mut observed = ChangeSet::new(shape.field_count());
        while let Some(slot) = queue.poll() {
            observed.union_with(slot.changed());
            queue.release(slot);
        }
        assert!(!queue.in_overflow());
        assert_eq!(observed, expected);
    }

    #[test]
    fn test_at_most_capacity_outstanding() {
        let shape = abc_shape();
        let capacity = 3;
        let queue = started_queue(&shape, capacity);

        let mut held = Vec::new();
        for i in 0..10 {
            let (tree, changes) = delta(&shape, &[("a", i)]);
            queue.produce(&tree, &changes);
            if i % 2 == 0 {
                if let Some(slot) = queue.poll() {
                    held.push(slot);
                }
            }
            assert!(queue.ready_len() + queue.checked_out() <= capacity);
        }
        for slot in held {
            queue.release(slot);
        }
    }

    #[test]
    fn test_producer_never_blocked_by_idle_consumer() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 1);

        // Consumer never polls; every produce must return.
        for i in 0..10_000 {
            let (tree, changes) = delta(&shape, &[("b", i)]);
            queue.produce(&tree, &changes);
        }
        assert!(queue.in_overflow());
        assert_eq!(queue.ready_len(), 1);
    }

    #[test]
    fn test_stop_keeps_queued_slots() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 2);

        let (tree, changes) = delta(&shape, &[("a", 1)]);
        queue.produce(&tree, &changes);
        queue.stop();

        // New updates are dropped, the queued one survives.
        let (t2, c2) = delta(&shape, &[("b", 2)]);
        queue.produce(&t2, &c2);

        let slot = queue.poll().expect("queued before stop");
        assert_eq!(slot.changed().iter().collect::<Vec<_>>(), vec![0]);
        queue.release(slot);
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_overflow_delivered_after_queued_slots() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 2);

        for i in 0..4 {
            let (tree, changes) = delta(&shape, &[("a", i)]);
            queue.produce(&tree, &changes);
        }

        // FIFO: the two individually queued updates first.
        let s1 = queue.poll().unwrap();
        assert_eq!(s1.value().scalar("a").unwrap(), &Scalar::Int(0));
        let s2 = queue.poll().unwrap();
        assert_eq!(s2.value().scalar("a").unwrap(), &Scalar::Int(1));

        queue.release(s1);
        let s3 = queue.poll().unwrap();
        // Coalesced overflow holds the most recent state.
        assert_eq!(s3.value().scalar("a").unwrap(), &Scalar::Int(3));
        assert!(s3.overrun().contains(0));
        queue.release(s2);
        queue.release(s3);
    }

    #[test]
    fn test_restart_snapshot_reflects_latest() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 2);

        let (tree, changes) = delta(&shape, &[("a", 42)]);
        queue.produce(&tree, &changes);
        let slot = queue.poll().unwrap();
        queue.release(slot);

        queue.stop();
        queue.start();

        let snapshot = queue.poll().expect("restart queues a snapshot");
        assert_eq!(snapshot.changed().len(), shape.field_count());
        assert_eq!(snapshot.value().scalar("a").unwrap(), &Scalar::Int(42));
        queue.release(snapshot);
    }

    #[tokio::test]
    async fn test_wait_for_update_times_out() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 2);

        let result = queue.wait_for_update(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ChanlinkError::Timeout)));
    }

    #[tokio::test]
    async fn test_wait_for_update_wakes_on_produce() {
        let shape = abc_shape();
        let queue = Arc::new(SubscriptionQueue::new(shape.clone(), 2));
        queue.start();
        let snapshot = queue.poll().unwrap();
        queue.release(snapshot);

        let waiter = queue.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_update(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let (tree, changes) = delta(&shape, &[("c", 9)]);
        queue.produce(&tree, &changes);

        let slot = handle.await.unwrap().unwrap();
        assert_eq!(slot.value().scalar("c").unwrap(), &Scalar::Int(9));
        queue.release(slot);
    }

    #[tokio::test]
    async fn test_wait_sees_update_produced_before_wait() {
        let shape = abc_shape();
        let queue = started_queue(&shape, 2);

        let (tree, changes) = delta(&shape, &[("a", 5)]);
        queue.produce(&tree, &changes);

        // Update arrived before the waiter; no signal may be lost.
        let slot = queue.wait_for_update(Duration::from_secs(1)).await.unwrap();
        assert_eq!(slot.value().scalar("a").unwrap(), &Scalar::Int(5));
        queue.release(slot);
    }
}
