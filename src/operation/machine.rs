//! The issue/await machine behind every one-shot operation.
//!
//! One [`Operation`] instance exists per `(channel, kind, projection)`; the
//! channel handle caches and reuses them across repeated calls. The machine
//! exposes synchronous `issue_*` halves and awaitable `wait_*` halves; the
//! transport's completion callbacks land between them, possibly before the
//! waiter arrives (completions are latched, and `Notify` stores the wakeup
//! permit, so the order never matters).
//!
//! Only one operation may be in flight per instance; callers needing
//! concurrent operations on the same channel use distinct instances, which
//! is exactly why the channel handle caches one per projection.
//!
//! # Sink lifetime
//!
//! The transport owns the completion sink; the sink holds only a
//! `Weak<Operation>` back-reference, so transport-side retention never keeps
//! a dropped operation alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::state::{next_state, OpEvent, OpState};
use crate::error::{ChanlinkError, Result};
use crate::transport::{
    create_op, ChannelRef, OpKind, OpRef, OpStatus, OperateSink, ProjectionSpec,
};
use crate::value::{ChangeSet, ChangeTrackedValue, Scalar, Shape, ValueTree};

struct OpInner {
    state: OpState,
    op_ref: Option<Arc<dyn OpRef>>,
    tracked: Option<ChangeTrackedValue>,
    /// Reason recorded by a failed connect, surfaced by the next wait.
    connect_error: Option<String>,
    /// Latched completion result, consumed by the next `wait_operate`.
    operate_result: Option<std::result::Result<(), String>>,
}

/// One cached, reusable one-shot operation on a channel.
pub struct Operation {
    kind: OpKind,
    projection: ProjectionSpec,
    channel: Arc<dyn ChannelRef>,
    inner: Mutex<OpInner>,
    connect_notify: Notify,
    operate_notify: Notify,
}

/// Transport-owned completion adapter; weak back-reference only.
struct OperationSink {
    op: Weak<Operation>,
}

impl OperateSink for OperationSink {
    fn on_connect(&self, status: OpStatus, shape: Option<Arc<Shape>>) {
        if let Some(op) = self.op.upgrade() {
            op.handle_connect(status, shape);
        }
    }

    fn on_operate_done(
        &self,
        status: OpStatus,
        value: Option<&ValueTree>,
        changed: Option<&ChangeSet>,
    ) {
        if let Some(op) = self.op.upgrade() {
            op.handle_operate_done(status, value, changed);
        }
    }
}

impl Operation {
    /// Create an idle machine for `kind` against `channel`.
    pub fn new(
        channel: Arc<dyn ChannelRef>,
        kind: OpKind,
        projection: ProjectionSpec,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            projection,
            channel,
            inner: Mutex::new(OpInner {
                state: OpState::Idle,
                op_ref: None,
                tracked: None,
                connect_error: None,
                operate_result: None,
            }),
            connect_notify: Notify::new(),
            operate_notify: Notify::new(),
        })
    }

    /// Operation verb of this instance.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Projection this instance was created for.
    pub fn projection(&self) -> &ProjectionSpec {
        &self.projection
    }

    /// Current state; primarily for tests and diagnostics.
    pub fn state(&self) -> OpState {
        self.inner.lock().state
    }

    /// Ask the transport to create the remote counterpart.
    ///
    /// Fails with `AlreadyConnecting` unless the machine is `Idle` (or
    /// `Failed`, which permits a retry).
    pub fn issue_connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match next_state(inner.state, OpEvent::IssueConnect) {
                Some(next) => inner.state = next,
                None => return Err(ChanlinkError::AlreadyConnecting),
            }
            inner.connect_error = None;
        }

        let sink: Arc<dyn OperateSink> = Arc::new(OperationSink {
            op: Arc::downgrade(self),
        });
        // The connect callback may fire inside this call; no lock is held.
        match create_op(self.channel.as_ref(), self.kind, &self.projection, sink) {
            Ok(op_ref) => {
                self.inner.lock().op_ref = Some(op_ref);
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.state = OpState::Failed;
                inner.connect_error = Some(e.to_string());
                Err(ChanlinkError::ConnectFailed(e.to_string()))
            }
        }
    }

    /// Suspend until the connect callback lands or `timeout` elapses.
    pub async fn wait_connect(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let inner = self.inner.lock();
                match inner.state {
                    OpState::Connected | OpState::OpIssued | OpState::OpComplete => {
                        return Ok(())
                    }
                    OpState::Failed => {
                        return Err(ChanlinkError::ConnectFailed(
                            inner.connect_error.clone().unwrap_or_default(),
                        ))
                    }
                    OpState::Idle => return Err(ChanlinkError::NotConnected),
                    OpState::ConnectIssued => {}
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChanlinkError::Timeout);
            }
            let _ = tokio::time::timeout(remaining, self.connect_notify.notified()).await;
        }
    }

    /// Issue the connect if needed and wait for the outcome.
    ///
    /// Idempotent: an already-connected machine returns success without
    /// re-issuing the remote create.
    pub async fn connect(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let issue = {
            let inner = self.inner.lock();
            match inner.state {
                OpState::Connected | OpState::OpIssued | OpState::OpComplete => return Ok(()),
                OpState::ConnectIssued => false,
                OpState::Idle | OpState::Failed => true,
            }
        };
        if issue {
            self.issue_connect()?;
        }
        self.wait_connect(timeout).await
    }

    fn handle_connect(&self, status: OpStatus, shape: Option<Arc<Shape>>) {
        {
            let mut inner = self.inner.lock();
            let event = if status.is_ok() {
                OpEvent::ConnectOk
            } else {
                OpEvent::ConnectFailed
            };
            match next_state(inner.state, event) {
                Some(next) => inner.state = next,
                None => {
                    tracing::warn!(
                        kind = %self.kind,
                        state = ?inner.state,
                        "ignoring unexpected connect callback"
                    );
                    return;
                }
            }
            match (&status, shape) {
                (OpStatus::Ok, Some(shape)) => {
                    inner.tracked = Some(ChangeTrackedValue::new(shape));
                }
                (OpStatus::Ok, None) => {
                    tracing::warn!(kind = %self.kind, "connect succeeded without a shape");
                }
                (OpStatus::Failed(reason), _) => {
                    inner.connect_error = Some(reason.clone());
                }
            }
        }
        // Wake exactly one blocked wait_connect.
        self.connect_notify.notify_one();
    }

    /// Invoke the remote verb with the currently staged value.
    ///
    /// Fails with `NotConnected` before a successful connect and with
    /// `OperationAlreadyActive` while a previous operate is in flight.
    pub fn issue_operate(&self) -> Result<()> {
        let (op_ref, staged) = {
            let mut inner = self.inner.lock();
            match inner.state {
                OpState::Connected => {}
                OpState::OpComplete => {
                    // A timed-out wait left an uncollected result; a fresh
                    // issue supersedes it.
                    tracing::debug!(kind = %self.kind, "discarding uncollected result");
                    inner.operate_result = None;
                    inner.state = OpState::Connected;
                }
                OpState::OpIssued => return Err(ChanlinkError::OperationAlreadyActive),
                _ => return Err(ChanlinkError::NotConnected),
            }
            match next_state(inner.state, OpEvent::IssueOperate) {
                Some(next) => inner.state = next,
                None => return Err(ChanlinkError::NotConnected),
            }
            let op_ref = inner.op_ref.clone().ok_or(ChanlinkError::NotConnected)?;
            let staged = match self.kind {
                OpKind::Write | OpKind::WriteRead | OpKind::RemoteCall => inner
                    .tracked
                    .as_ref()
                    .map(|t| (t.tree().clone(), t.changes().clone())),
                OpKind::Read | OpKind::Trigger => None,
            };
            (op_ref, staged)
        };

        // The completion callback may fire inside this call; no lock held.
        let result = op_ref.operate(staged.as_ref().map(|(tree, changes)| (tree, changes)));
        if let Err(e) = result {
            let mut inner = self.inner.lock();
            // Nothing was issued, so no callback can be outstanding.
            if inner.state == OpState::OpIssued {
                inner.state = OpState::Connected;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Suspend until the in-flight operation completes or `timeout` elapses.
    ///
    /// A timed-out wait leaves the machine untouched; the late completion is
    /// latched and satisfies the next wait.
    pub async fn wait_operate(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.state == OpState::OpComplete {
                    let result = inner.operate_result.take();
                    if let Some(next) = next_state(inner.state, OpEvent::Collect) {
                        inner.state = next;
                    }
                    return match result {
                        Some(Err(reason)) => Err(ChanlinkError::OperateFailed(reason)),
                        _ => Ok(()),
                    };
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChanlinkError::Timeout);
            }
            let _ = tokio::time::timeout(remaining, self.operate_notify.notified()).await;
        }
    }

    /// `issue_operate` + `wait_operate`.
    pub async fn operate(&self, timeout: Duration) -> Result<()> {
        self.issue_operate()?;
        self.wait_operate(timeout).await
    }

    fn handle_operate_done(
        &self,
        status: OpStatus,
        value: Option<&ValueTree>,
        changed: Option<&ChangeSet>,
    ) {
        {
            let mut inner = self.inner.lock();
            match next_state(inner.state, OpEvent::OperateDone) {
                Some(next) => inner.state = next,
                None => {
                    tracing::warn!(
                        kind = %self.kind,
                        state = ?inner.state,
                        "ignoring unexpected completion callback"
                    );
                    return;
                }
            }
            match status {
                OpStatus::Ok => {
                    if let Some(tracked) = inner.tracked.as_mut() {
                        match (value, changed) {
                            (Some(value), Some(changed)) => {
                                if let Err(e) = tracked.apply_update(value, changed) {
                                    tracing::warn!(kind = %self.kind, "result dropped: {e}");
                                }
                            }
                            // Write/trigger completion: staged bits consumed.
                            _ => tracked.clear_changes(),
                        }
                    }
                    inner.operate_result = Some(Ok(()));
                }
                OpStatus::Failed(reason) => {
                    inner.operate_result = Some(Err(reason));
                }
            }
        }
        // Wake exactly one blocked wait_operate.
        self.operate_notify.notify_one();
    }

    /// Clone of the tracked value (result of the last read, or the staging
    /// area for the next write).
    pub fn snapshot(&self) -> Result<ChangeTrackedValue> {
        self.inner
            .lock()
            .tracked
            .clone()
            .ok_or(ChanlinkError::NotConnected)
    }

    /// Stage a scalar for the next write-like operate.
    pub fn stage_scalar(&self, path: &str, value: Scalar) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .tracked
            .as_mut()
            .ok_or(ChanlinkError::NotConnected)?
            .stage_scalar(path, value)
    }

    /// Stage an array for the next write-like operate.
    pub fn stage_array(&self, path: &str, values: Vec<Scalar>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .tracked
            .as_mut()
            .ok_or(ChanlinkError::NotConnected)?
            .stage_array(path, values)
    }

    /// Stage a scalar into the sole top-level field for the next write-like
    /// operate.
    pub fn stage_value(&self, value: Scalar) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .tracked
            .as_mut()
            .ok_or(ChanlinkError::NotConnected)?
            .stage_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockChannelControl, MockProvider};
    use crate::transport::{ChannelProvider, ConnectionEvent, ConnectionListener};
    use crate::value::ScalarKind;

    struct NullListener;
    impl ConnectionListener for NullListener {
        fn on_connection_event(&self, _event: ConnectionEvent) {}
    }

    const TICK: Duration = Duration::from_millis(200);

    fn channel() -> (MockChannelControl, Arc<dyn ChannelRef>) {
        let provider = MockProvider::new();
        let control = provider.add_channel("dev:temp", Shape::scalar("t", ScalarKind::Float));
        let channel = provider
            .create_connection("dev:temp", Arc::new(NullListener))
            .unwrap();
        (control, channel)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (control, channel) = channel();
        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());

        op.connect(TICK).await.unwrap();
        assert_eq!(op.state(), OpState::Connected);
        op.connect(TICK).await.unwrap();
        assert_eq!(op.state(), OpState::Connected);
        drop(control);
    }

    #[tokio::test]
    async fn test_issue_connect_after_connected_rejected() {
        let (_control, channel) = channel();
        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());
        op.issue_connect().unwrap();
        op.wait_connect(TICK).await.unwrap();
        assert!(matches!(
            op.issue_connect(),
            Err(ChanlinkError::AlreadyConnecting)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_and_allows_retry() {
        let (control, channel) = channel();
        control.fail_op_connects(Some("no permission"));

        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());
        let err = op.connect(TICK).await.unwrap_err();
        assert!(matches!(err, ChanlinkError::ConnectFailed(ref r) if r == "no permission"));
        assert_eq!(op.state(), OpState::Failed);

        control.fail_op_connects(None);
        op.connect(TICK).await.unwrap();
        assert_eq!(op.state(), OpState::Connected);
    }

    #[tokio::test]
    async fn test_read_applies_result() {
        let (control, channel) = channel();
        control
            .set_scalar_silently("value", Scalar::Float(19.25))
            .unwrap();

        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());
        op.connect(TICK).await.unwrap();
        op.operate(TICK).await.unwrap();

        let snapshot = op.snapshot().unwrap();
        assert_eq!(snapshot.as_f64().unwrap(), 19.25);
        assert!(!snapshot.changes().is_empty());
    }

    #[tokio::test]
    async fn test_write_sends_staged_value() {
        let (control, channel) = channel();
        let op = Operation::new(channel, OpKind::Write, ProjectionSpec::default());
        op.connect(TICK).await.unwrap();

        op.stage_scalar("value", Scalar::Float(5.5)).unwrap();
        op.operate(TICK).await.unwrap();

        assert_eq!(
            control.value().scalar("value").unwrap(),
            &Scalar::Float(5.5)
        );
        // staged change bits were consumed
        assert!(op.snapshot().unwrap().changes().is_empty());
    }

    #[tokio::test]
    async fn test_operate_before_connect_rejected() {
        let (_control, channel) = channel();
        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());
        assert!(matches!(op.issue_operate(), Err(ChanlinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_double_operate_rejected() {
        let (control, channel) = channel();
        control.defer_completions(true);

        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());
        op.connect(TICK).await.unwrap();
        op.issue_operate().unwrap();
        assert!(matches!(
            op.issue_operate(),
            Err(ChanlinkError::OperationAlreadyActive)
        ));
        control.complete_pending();
        op.wait_operate(TICK).await.unwrap();
    }

    #[tokio::test]
    async fn test_operate_failure_leaves_connected() {
        let (control, channel) = channel();
        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());
        op.connect(TICK).await.unwrap();

        control.fail_operations(Some("record locked"));
        let err = op.operate(TICK).await.unwrap_err();
        assert!(matches!(err, ChanlinkError::OperateFailed(ref r) if r == "record locked"));
        assert_eq!(op.state(), OpState::Connected);

        control.fail_operations(None);
        op.operate(TICK).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_then_late_completion_satisfies_next_wait() {
        let (control, channel) = channel();
        control
            .set_scalar_silently("value", Scalar::Float(3.0))
            .unwrap();
        control.defer_completions(true);

        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());
        op.connect(TICK).await.unwrap();
        op.issue_operate().unwrap();

        // First wait times out while the completion is still pending.
        let err = op.wait_operate(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ChanlinkError::Timeout));
        assert_eq!(op.state(), OpState::OpIssued);

        // The callback eventually fires; the next wait (with no new issue)
        // returns the real result.
        control.complete_pending();
        op.wait_operate(TICK).await.unwrap();
        assert_eq!(op.snapshot().unwrap().as_f64().unwrap(), 3.0);
        assert_eq!(op.state(), OpState::Connected);
    }

    #[tokio::test]
    async fn test_callback_before_wait_is_latched() {
        let (_control, channel) = channel();
        let op = Operation::new(channel, OpKind::Read, ProjectionSpec::default());
        // Mock completes connect synchronously inside issue_connect; the
        // wait starts only afterwards and must still succeed.
        op.issue_connect().unwrap();
        op.wait_connect(TICK).await.unwrap();

        op.issue_operate().unwrap();
        op.wait_operate(TICK).await.unwrap();
    }
}
