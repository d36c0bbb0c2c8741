//! Error types for chanlink.

use thiserror::Error;

/// Main error type for all chanlink operations.
#[derive(Debug, Error)]
pub enum ChanlinkError {
    /// Transport reported a connect failure.
    ///
    /// The handle remains usable; a later connect attempt may succeed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Transport reported an operation failure after a successful connect.
    ///
    /// The channel remains connected.
    #[error("Operation failed: {0}")]
    OperateFailed(String),

    /// An operation was issued before the instance was connected.
    #[error("Not connected")]
    NotConnected,

    /// An operation was issued while a previous one was still in flight.
    #[error("Operation already active")]
    OperationAlreadyActive,

    /// A connect was issued while a previous connect was still in flight.
    #[error("Connect already issued")]
    AlreadyConnecting,

    /// A blocking wait exceeded its deadline.
    ///
    /// The in-flight request is left to complete asynchronously; its
    /// eventual result is consumed by the next wait.
    #[error("Timed out")]
    Timeout,

    /// Two value trees had incompatible shapes.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A field path did not exist in the value tree's shape.
    #[error("No such field: {0}")]
    NoSuchField(String),

    /// A field existed but was of the wrong kind for the accessor used.
    #[error("Type mismatch at '{path}': expected {expected}, found {actual}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A single-value convenience accessor was used on a tree with more
    /// than one top-level data-bearing field.
    #[error("Ambiguous shape: more than one top-level field")]
    AmbiguousShape,

    /// The remote source permanently stopped delivering updates.
    #[error("Subscription source lost")]
    SourceLost,

    /// The channel handle has been destroyed.
    #[error("Channel destroyed")]
    Destroyed,

    /// Any other transport-level error.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias using ChanlinkError.
pub type Result<T> = std::result::Result<T, ChanlinkError>;
