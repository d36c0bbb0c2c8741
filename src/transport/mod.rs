//! Transport module - the seam to the external channel transport.
//!
//! Everything below this seam is out of scope for the crate: wire encoding,
//! connection management and the server-side record database live behind
//! these traits. The crate drives the transport through the `create_*`
//! constructors and the per-operation verbs; the transport drives the crate
//! back through the sink traits, on whatever thread it likes.
//!
//! Sink implementations must never block and must never be called while the
//! transport holds locks that its other entry points also take.
//!
//! [`mock`] provides an in-memory transport for tests and examples.

pub mod mock;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::value::{ChangeSet, Shape, ValueTree};

/// Completion status reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    /// The request completed successfully.
    Ok,
    /// The request failed; the reason is surfaced verbatim to the caller.
    Failed(String),
}

impl OpStatus {
    /// Whether this status is a success.
    pub fn is_ok(&self) -> bool {
        matches!(self, OpStatus::Ok)
    }

    /// The failure reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            OpStatus::Ok => None,
            OpStatus::Failed(reason) => Some(reason),
        }
    }
}

/// The operation verbs a channel supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// One-shot read.
    Read,
    /// One-shot write.
    Write,
    /// Combined write-then-read.
    WriteRead,
    /// Process the record without moving data.
    Trigger,
    /// Remote procedure call: send arguments, receive a result tree.
    RemoteCall,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::WriteRead => "write-read",
            OpKind::Trigger => "trigger",
            OpKind::RemoteCall => "call",
        };
        write!(f, "{name}")
    }
}

/// An opaque projection spec compiled from a request string.
///
/// Consumed as-is; this crate only uses it as a cache key and passes it
/// through to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectionSpec(Arc<str>);

impl ProjectionSpec {
    /// Wrap a request string.
    pub fn parse(request: &str) -> Self {
        Self(Arc::from(request))
    }

    /// The original request string.
    pub fn request(&self) -> &str {
        &self.0
    }
}

impl Default for ProjectionSpec {
    /// The conventional "just the value field" projection.
    fn default() -> Self {
        Self::parse("value")
    }
}

impl fmt::Display for ProjectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle events pushed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The channel is connected and usable.
    Connected,
    /// The channel lost its connection; it may come back.
    Disconnected,
    /// The channel is gone for good.
    Destroyed,
}

/// Receiver for connection lifecycle events.
pub trait ConnectionListener: Send + Sync {
    /// Called on every connection state change, possibly from a transport
    /// thread. Must not block.
    fn on_connection_event(&self, event: ConnectionEvent);
}

/// Completion sink for one-shot operations.
///
/// The transport owns the sink; implementations hold at most a weak
/// reference back to client objects so no ownership cycle forms.
pub trait OperateSink: Send + Sync {
    /// Remote counterpart created (or not). On success carries the
    /// negotiated shape.
    fn on_connect(&self, status: OpStatus, shape: Option<Arc<Shape>>);

    /// The issued operation completed. Reads and write-reads carry the
    /// result tree and the set of fields it changed.
    fn on_operate_done(
        &self,
        status: OpStatus,
        value: Option<&ValueTree>,
        changed: Option<&ChangeSet>,
    );
}

/// Update sink for continuous subscriptions.
pub trait SubscriptionSink: Send + Sync {
    /// Remote subscription created (or not).
    fn on_connect(&self, status: OpStatus, shape: Option<Arc<Shape>>);

    /// One remote update: the delta tree and which fields it wrote.
    /// Called on every update, on arbitrary threads. Must never block.
    fn produce(&self, delta: &ValueTree, changed: &ChangeSet);

    /// The source is permanently gone; no further updates will arrive.
    fn unlisten(&self);
}

/// The remote counterpart of one one-shot operation.
pub trait OpRef: Send + Sync {
    /// Issue the operation's verb (fixed when the op was created).
    ///
    /// Writes, write-reads and calls carry the staged value and its change
    /// set; reads and triggers pass `None`. Completion arrives at the
    /// [`OperateSink`] given at creation.
    fn operate(&self, staged: Option<(&ValueTree, &ChangeSet)>) -> Result<()>;
}

/// The remote counterpart of one subscription.
pub trait SubscriptionRef: Send + Sync {
    /// Ask the source to start pushing updates.
    fn start(&self) -> Result<()>;

    /// Ask the source to stop pushing updates.
    fn stop(&self) -> Result<()>;

    /// Tear the remote subscription down.
    fn destroy(&self);
}

/// One named channel's connection, as seen by the transport.
pub trait ChannelRef: Send + Sync {
    /// Channel name.
    fn name(&self) -> &str;

    /// Create a read operation bound to `sink`.
    fn create_read_op(
        &self,
        projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>>;

    /// Create a write operation bound to `sink`.
    fn create_write_op(
        &self,
        projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>>;

    /// Create a write-then-read operation bound to `sink`.
    fn create_write_read_op(
        &self,
        projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>>;

    /// Create a trigger (process) operation bound to `sink`.
    fn create_trigger_op(
        &self,
        projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>>;

    /// Create a remote-call operation bound to `sink`.
    fn create_call_op(
        &self,
        projection: &ProjectionSpec,
        sink: Arc<dyn OperateSink>,
    ) -> Result<Arc<dyn OpRef>>;

    /// Create a continuous subscription bound to `sink`.
    fn create_subscription(
        &self,
        projection: &ProjectionSpec,
        sink: Arc<dyn SubscriptionSink>,
    ) -> Result<Arc<dyn SubscriptionRef>>;

    /// Tear the connection down; listeners receive `Destroyed`.
    fn destroy(&self);
}

/// Dispatch one of the five `create_*_op` constructors by [`OpKind`].
pub fn create_op(
    channel: &dyn ChannelRef,
    kind: OpKind,
    projection: &ProjectionSpec,
    sink: Arc<dyn OperateSink>,
) -> Result<Arc<dyn OpRef>> {
    match kind {
        OpKind::Read => channel.create_read_op(projection, sink),
        OpKind::Write => channel.create_write_op(projection, sink),
        OpKind::WriteRead => channel.create_write_read_op(projection, sink),
        OpKind::Trigger => channel.create_trigger_op(projection, sink),
        OpKind::RemoteCall => channel.create_call_op(projection, sink),
    }
}

/// Factory for channel connections; the entry point to a transport.
pub trait ChannelProvider: Send + Sync {
    /// Provider name, used for registry lookup.
    fn provider_name(&self) -> &str;

    /// Open a connection to a named channel. `listener` receives lifecycle
    /// events, possibly before this call returns.
    fn create_connection(
        &self,
        channel_name: &str,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<Arc<dyn ChannelRef>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_status() {
        assert!(OpStatus::Ok.is_ok());
        assert_eq!(OpStatus::Ok.reason(), None);

        let failed = OpStatus::Failed("no route".into());
        assert!(!failed.is_ok());
        assert_eq!(failed.reason(), Some("no route"));
    }

    #[test]
    fn test_projection_spec_as_cache_key() {
        let a = ProjectionSpec::parse("value,alarm");
        let b = ProjectionSpec::parse("value,alarm");
        let c = ProjectionSpec::parse("value");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ProjectionSpec::default().request(), "value");
    }

    #[test]
    fn test_op_kind_display() {
        assert_eq!(OpKind::WriteRead.to_string(), "write-read");
        assert_eq!(OpKind::RemoteCall.to_string(), "call");
    }
}
