//! Pure state transitions for one-shot operations.
//!
//! The lifecycle is `Idle → ConnectIssued → {Connected | Failed}`, then
//! `Connected → OpIssued → OpComplete → Connected` for every issued
//! operation. Transitions are a pure function so they can be unit tested
//! deterministically, independent of threads and timing; the machine in
//! [`machine`](super::machine) only ever applies them inside its critical
//! section.

/// State of one operation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// No remote counterpart yet.
    Idle,
    /// Remote create issued; waiting for the connect callback.
    ConnectIssued,
    /// Ready to issue an operation.
    Connected,
    /// An operation is in flight.
    OpIssued,
    /// The operation completed; its result awaits collection.
    OpComplete,
    /// The connect failed; a fresh connect attempt is allowed.
    Failed,
}

/// Events that drive [`OpState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEvent {
    /// The client issued a remote create.
    IssueConnect,
    /// The transport reported connect success.
    ConnectOk,
    /// The transport reported connect failure.
    ConnectFailed,
    /// The client issued the operation verb.
    IssueOperate,
    /// The transport reported operation completion (success or failure —
    /// either way the channel stays connected).
    OperateDone,
    /// A waiter collected the completion result.
    Collect,
}

/// Apply `event` to `current`; `None` means the event is invalid in that
/// state (a programming-sequence fault, surfaced synchronously by the
/// machine).
pub fn next_state(current: OpState, event: OpEvent) -> Option<OpState> {
    use OpEvent::*;
    use OpState::*;
    match (current, event) {
        (Idle, IssueConnect) => Some(ConnectIssued),
        // A failed connect leaves the instance reusable.
        (Failed, IssueConnect) => Some(ConnectIssued),
        (ConnectIssued, ConnectOk) => Some(Connected),
        (ConnectIssued, ConnectFailed) => Some(Failed),
        (Connected, IssueOperate) => Some(OpIssued),
        (OpIssued, OperateDone) => Some(OpComplete),
        (OpComplete, Collect) => Some(Connected),
        _ => None,
    }
}
