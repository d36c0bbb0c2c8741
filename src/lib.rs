//! # chanlink
//!
//! Synchronous-feeling client library over an asynchronous channel
//! transport.
//!
//! The transport underneath is callback driven: every request is answered
//! later, on some transport thread. This crate adapts that into the API
//! application code actually wants — issue a request, await its completion —
//! plus a bounded subscription queue that follows a channel's updates
//! without ever blocking the producer.
//!
//! ## Architecture
//!
//! - **Operations** ([`Operation`]): one state machine per
//!   `(channel, verb, projection)`, reused across calls. Read, write,
//!   write-read, trigger and remote call all follow the same
//!   connect-issue-complete cycle.
//! - **Subscriptions** ([`Subscription`]): a fixed pool of delivery slots
//!   between the transport and the consumer. When the consumer falls
//!   behind, updates coalesce into an overflow accumulation that reports
//!   exactly which fields changed more than once.
//! - **Channels and context** ([`Channel`], [`Context`]): a handle per
//!   channel name, created through a provider registry; [`MultiChannel`]
//!   drives a group of channels as one.
//! - **Transport seam** ([`transport`]): trait objects on both sides, with
//!   an in-memory [`transport::mock`] for tests.
//!
//! ## Example
//!
//! ```no_run
//! use chanlink::transport::mock::MockProvider;
//! use chanlink::value::{Scalar, ScalarKind, Shape};
//! use chanlink::{ChannelConfig, Context};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> chanlink::Result<()> {
//!     let provider = MockProvider::new();
//!     provider.add_channel("dev:temp", Shape::scalar("value", ScalarKind::Float));
//!
//!     let context = Context::new();
//!     context.register(provider);
//!
//!     let channel = context.channel("dev:temp")?;
//!     channel.put(Scalar::Float(21.5)).await?;
//!     println!("temp = {}", channel.get_f64().await?);
//!
//!     let sub = channel.subscribe(Default::default()).await?;
//!     sub.start().await?;
//!     sub.wait_for_update(ChannelConfig::default().operate_timeout)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod operation;
pub mod subscribe;
pub mod transport;
pub mod value;

mod channel;
mod context;
mod multi;

pub use channel::{Channel, ConnectionState};
pub use config::ChannelConfig;
pub use context::{default_context, reset_default_context, set_default_context, Context};
pub use error::{ChanlinkError, Result};
pub use multi::{AggregateSnapshot, MultiChannel, MultiSubscription};
pub use operation::Operation;
pub use subscribe::Subscription;
