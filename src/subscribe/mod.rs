//! Continuous subscriptions: the bounded delivery queue and the
//! client-visible handle built on top of it.

mod handle;
mod queue;

pub use handle::Subscription;
pub use queue::{DeliverySlot, SubscriptionQueue};
