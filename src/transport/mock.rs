//! In-memory mock transport.
//!
//! Implements the transport seam against process-local state so the rest of
//! the crate can be exercised without a real wire. Tests (and downstream
//! consumers writing their own tests) drive the remote side through a
//! [`MockChannelControl`]: set values, push subscription updates, defer or
//! fail completions, drop connections.
//!
//! Completion callbacks fire synchronously on the calling thread, after all
//! mock-internal locks are released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    ChannelProvider, ChannelRef, ConnectionEvent, ConnectionListener, OpKind, OpRef, OpStatus,
    OperateSink, ProjectionSpec, SubscriptionRef, SubscriptionSink,
};
use crate::error::{ChanlinkError, Result};
use crate::value::{ChangeSet, Scalar, Shape, ValueTree};

/// An in-memory channel provider.
pub struct MockProvider {
    channels: Mutex<HashMap<String, Arc<MockChannelState>>>,
}

impl MockProvider {
    /// Create an empty provider.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Register a channel with the given negotiated shape and a
    /// default-valued tree; returns the test-side control handle.
    pub fn add_channel(&self, name: &str, shape: Arc<Shape>) -> MockChannelControl {
        let state = Arc::new(MockChannelState {
            name: name.to_string(),
            shape: Mutex::new(shape.clone()),
            value: Mutex::new(ValueTree::new(shape)),
            refuse_connections: AtomicBool::new(false),
            fail_op_connects: Mutex::new(None),
            fail_operations: Mutex::new(None),
            defer_completions: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        });
        self.channels
            .lock()
            .insert(name.to_string(), state.clone());
        MockChannelControl { state }
    }

    /// Control handle for an already-registered channel.
    pub fn control(&self, name: &str) -> Option<MockChannelControl> {
        self.channels
            .lock()
            .get(name)
            .map(|state| MockChannelControl {
                state: state.clone(),
            })
    }
}

impl ChannelProvider for MockProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn create_connection(
        &self,
        channel_name: &str,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<Arc<dyn ChannelRef>> {
        let state = self
            .channels
            .lock()
            .get(channel_name)
            .cloned()
            .ok_or_else(|| {
                ChanlinkError::Transport(format!("unknown channel '{channel_name}'"))
            })?;

        if state.refuse_connections.load(Ordering::Acquire) {
            // Keep the listener; it will never hear Connected.
            state.listeners.lock().push(listener);
        } else {
            state.listeners.lock().push(listener.clone());
            listener.on_connection_event(ConnectionEvent::Connected);
        }
        Ok(Arc::new(MockChannelRef { state }))
    }
}

/// One deferred completion waiting for [`MockChannelControl::complete_pending`].
struct PendingOp {
    kind: OpKind,
    sink: Arc<dyn OperateSink>,
    staged: Option<(ValueTree, ChangeSet)>,
}

struct MockChannelState {
    name: String,
    shape: Mutex<Arc<Shape>>,
    value: Mutex<ValueTree>,
    refuse_connections: AtomicBool,
    fail_op_connects: Mutex<Option<String>>,
    fail_operations: Mutex<Option<String>>,
    defer_completions: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    subscriptions: Mutex<Vec<Arc<dyn SubscriptionSink>>>,
    pending: Mutex<Vec<PendingOp>>,
}

impl MockChannelState {
    /// Run one completion. Snapshots are taken under the value lock; the
    /// sink is called after it is released.
    fn complete(&self, kind: OpKind, sink: &Arc<dyn OperateSink>, staged: Option<(ValueTree, ChangeSet)>) {
        if let Some(reason) = self.fail_operations.lock().clone() {
            sink.on_operate_done(OpStatus::Failed(reason), None, None);
            return;
        }

        let result = {
            let mut value = self.value.lock();
            if let Some((tree, changes)) = &staged {
                if let Err(e) = value.copy_fields_from(tree, changes) {
                    drop(value);
                    sink.on_operate_done(OpStatus::Failed(e.to_string()), None, None);
                    return;
                }
            }
            match kind {
                OpKind::Read | OpKind::WriteRead => Some(value.clone()),
                // Calls echo the argument tree back as the result.
                OpKind::RemoteCall => Some(
                    staged
                        .as_ref()
                        .map(|(tree, _)| tree.clone())
                        .unwrap_or_else(|| value.clone()),
                ),
                OpKind::Write | OpKind::Trigger => None,
            }
        };

        match result {
            Some(tree) => {
                let all = ChangeSet::all(tree.shape().field_count());
                sink.on_operate_done(OpStatus::Ok, Some(&tree), Some(&all));
            }
            None => sink.on_operate_done(OpStatus::Ok, None, None),
        }
    }

    fn produce_to_subscribers(&self, changes: &ChangeSet) {
        let snapshot = self.value.lock().clone();
        let sinks = self.subscriptions.lock().clone();
        for sink in sinks {
            sink.produce(&snapshot, changes);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_connection_event(event);
        }
    }
}

struct MockChannelRef {
    state: Arc<MockChannelState>,
}

impl MockChannelRef {
    fn create_op(
        &self,
        kind: OpKind,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>> {
        if let Some(reason) = self.state.fail_op_connects.lock().clone() {
            sink.on_connect(OpStatus::Failed(reason), None);
        } else {
            let shape = self.state.shape.lock().clone();
            sink.on_connect(OpStatus::Ok, Some(shape));
        }
        Ok(Arc::new(MockOpRef {
            state: self.state.clone(),
            kind,
            sink,
        }))
    }
}

impl ChannelRef for MockChannelRef {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn create_read_op(
        &self,
        _projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>> {
        self.create_op(OpKind::Read, sink)
    }

    fn create_write_op(
        &self,
        _projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>> {
        self.create_op(OpKind::Write, sink)
    }

    fn create_write_read_op(
        &self,
        _projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>> {
        self.create_op(OpKind::WriteRead, sink)
    }

    fn create_trigger_op(
        &self,
        _projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>> {
        self.create_op(OpKind::Trigger, sink)
    }

    fn create_call_op(
        &self,
        _projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>> {
        self.create_op(OpKind::RemoteCall, sink)
    }

    fn create_subscription(
        &self,
        _projection: &ProjectionSpec,
        sink: Arc<dyn SubscriptionSink>,
    ) -> Result<Arc<dyn SubscriptionRef>> {
        if let Some(reason) = self.state.fail_op_connects.lock().clone() {
            sink.on_connect(OpStatus::Failed(reason), None);
        } else {
            let shape = self.state.shape.lock().clone();
            self.state.subscriptions.lock().push(sink.clone());
            sink.on_connect(OpStatus::Ok, Some(shape));
        }
        Ok(Arc::new(MockSubscriptionRef {
            state: self.state.clone(),
            sink,
            started: AtomicBool::new(false),
        }))
    }

    fn destroy(&self) {
        self.state.emit(ConnectionEvent::Destroyed);
    }
}

struct MockOpRef {
    state: Arc<MockChannelState>,
    kind: OpKind,
    sink: Arc<dyn OperateSink>,
}

impl OpRef for MockOpRef {
    fn operate(&self, staged: Option<(&ValueTree, &ChangeSet)>) -> Result<()> {
        let staged = staged.map(|(tree, changes)| (tree.clone(), changes.clone()));
        if self.state.defer_completions.load(Ordering::Acquire) {
            self.state.pending.lock().push(PendingOp {
                kind: self.kind,
                sink: self.sink.clone(),
                staged,
            });
        } else {
            self.state.complete(self.kind, &self.sink, staged);
        }
        Ok(())
    }
}

struct MockSubscriptionRef {
    state: Arc<MockChannelState>,
    sink: Arc<dyn SubscriptionSink>,
    started: AtomicBool,
}

impl SubscriptionRef for MockSubscriptionRef {
    fn start(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::AcqRel) {
            // A freshly started source sends its current value as the first
            // update, with every field marked changed.
            let snapshot = self.state.value.lock().clone();
            let all = ChangeSet::all(snapshot.shape().field_count());
            self.sink.produce(&snapshot, &all);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    fn destroy(&self) {
        self.state
            .subscriptions
            .lock()
            .retain(|s| !Arc::ptr_eq(s, &self.sink));
    }
}

/// Test-side handle to one mock channel's remote state.
#[derive(Clone)]
pub struct MockChannelControl {
    state: Arc<MockChannelState>,
}

impl MockChannelControl {
    /// The channel's negotiated shape.
    pub fn shape(&self) -> Arc<Shape> {
        self.state.shape.lock().clone()
    }

    /// Snapshot of the remote value.
    pub fn value(&self) -> ValueTree {
        self.state.value.lock().clone()
    }

    /// Write one scalar on the remote side and push the update to every
    /// subscription sink.
    pub fn set_scalar(&self, path: &str, value: Scalar) -> Result<()> {
        let changes = {
            let mut tree = self.state.value.lock();
            tree.set_scalar(path, value)?;
            let index = tree
                .shape()
                .index_of(path)
                .ok_or_else(|| ChanlinkError::NoSuchField(path.to_string()))?;
            let mut changes = ChangeSet::new(tree.shape().field_count());
            changes.set(index);
            changes
        };
        self.state.produce_to_subscribers(&changes);
        Ok(())
    }

    /// Write a scalar without notifying subscribers (an update the source
    /// made before anyone subscribed, or between deliveries).
    pub fn set_scalar_silently(&self, path: &str, value: Scalar) -> Result<()> {
        self.state.value.lock().set_scalar(path, value)
    }

    /// Push the current value to subscribers with an explicit change set.
    pub fn produce_fields(&self, paths: &[&str]) -> Result<()> {
        let changes = {
            let tree = self.state.value.lock();
            let mut changes = ChangeSet::new(tree.shape().field_count());
            for path in paths {
                let index = tree
                    .shape()
                    .index_of(path)
                    .ok_or_else(|| ChanlinkError::NoSuchField(path.to_string()))?;
                changes.set(index);
            }
            changes
        };
        self.state.produce_to_subscribers(&changes);
        Ok(())
    }

    /// Defer operation completions until [`complete_pending`] is called.
    ///
    /// [`complete_pending`]: MockChannelControl::complete_pending
    pub fn defer_completions(&self, defer: bool) {
        self.state.defer_completions.store(defer, Ordering::Release);
    }

    /// Number of deferred completions waiting.
    pub fn pending_count(&self) -> usize {
        self.state.pending.lock().len()
    }

    /// Fire every deferred completion, in issue order.
    pub fn complete_pending(&self) {
        let pending: Vec<PendingOp> = self.state.pending.lock().drain(..).collect();
        for op in pending {
            self.state.complete(op.kind, &op.sink, op.staged);
        }
    }

    /// Refuse future connection attempts (they hang until the caller's
    /// timeout fires).
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::Release);
    }

    /// Make future `create_*` op connects fail with the given reason, or
    /// succeed again when `None`.
    pub fn fail_op_connects(&self, reason: Option<&str>) {
        *self.state.fail_op_connects.lock() = reason.map(str::to_string);
    }

    /// Make future operation completions fail with the given reason, or
    /// succeed again when `None`.
    pub fn fail_operations(&self, reason: Option<&str>) {
        *self.state.fail_operations.lock() = reason.map(str::to_string);
    }

    /// Emit a `Disconnected` event to every connection listener.
    pub fn disconnect(&self) {
        self.state.emit(ConnectionEvent::Disconnected);
    }

    /// Emit a `Connected` event to every connection listener.
    pub fn reconnect(&self) {
        self.state.emit(ConnectionEvent::Connected);
    }

    /// Tell every subscription sink the source is permanently gone.
    pub fn unlisten_all(&self) {
        let sinks = self.state.subscriptions.lock().clone();
        for sink in sinks {
            sink.unlisten();
        }
    }

    /// Number of live subscription sinks.
    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.lock().len()
    }
}
