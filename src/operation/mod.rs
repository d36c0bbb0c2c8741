//! Operation module - sync-over-async machinery for one-shot verbs.
//!
//! - [`OpState`] / [`OpEvent`] / [`next_state`] - the pure transition table
//! - [`Operation`] - the cached, reusable issue/await machine

mod machine;
mod state;

pub use machine::Operation;
pub use state::{next_state, OpEvent, OpState};
