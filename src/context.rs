//! Provider registry.
//!
//! A [`Context`] owns the set of [`ChannelProvider`]s channels can be
//! created through. Nothing in the crate requires a process-wide context;
//! every constructor takes the context (or a provider) explicitly. For
//! applications that want ambient access anyway there is one swappable
//! process-wide default, which tests can replace with a mock-backed context
//! and restore afterwards.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::error::{ChanlinkError, Result};
use crate::transport::ChannelProvider;

struct Registry {
    by_name: HashMap<String, Arc<dyn ChannelProvider>>,
    /// Name of the first provider registered.
    default: Option<String>,
}

/// A registry of channel providers.
pub struct Context {
    providers: RwLock<Registry>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            providers: RwLock::new(Registry {
                by_name: HashMap::new(),
                default: None,
            }),
        })
    }

    /// Register a provider under its own
    /// [`provider_name`](ChannelProvider::provider_name).
    ///
    /// The first provider registered becomes the context's default. A later
    /// registration under the same name replaces the earlier one.
    pub fn register(&self, provider: Arc<dyn ChannelProvider>) {
        let name = provider.provider_name().to_string();
        let mut registry = self.providers.write();
        if registry.default.is_none() {
            registry.default = Some(name.clone());
        }
        tracing::debug!(provider = %name, "provider registered");
        registry.by_name.insert(name, provider);
    }

    /// Look a provider up by name.
    pub fn provider(&self, name: &str) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.read().by_name.get(name).cloned()
    }

    /// The default provider (the first one registered).
    pub fn default_provider(&self) -> Option<Arc<dyn ChannelProvider>> {
        let registry = self.providers.read();
        let name = registry.default.as_ref()?;
        registry.by_name.get(name).cloned()
    }

    /// Names of every registered provider.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.read().by_name.keys().cloned().collect()
    }

    /// Create a channel handle on the default provider with default config.
    pub fn channel(&self, channel_name: &str) -> Result<Arc<Channel>> {
        self.channel_with_config(channel_name, ChannelConfig::default())
    }

    /// Create a channel handle on the default provider.
    pub fn channel_with_config(
        &self,
        channel_name: &str,
        config: ChannelConfig,
    ) -> Result<Arc<Channel>> {
        let provider = self
            .default_provider()
            .ok_or_else(|| ChanlinkError::Transport("no provider registered".to_string()))?;
        Ok(Channel::new(provider, channel_name, config))
    }

    /// Create a channel handle on a named provider.
    pub fn channel_via(
        &self,
        provider_name: &str,
        channel_name: &str,
        config: ChannelConfig,
    ) -> Result<Arc<Channel>> {
        let provider = self.provider(provider_name).ok_or_else(|| {
            ChanlinkError::Transport(format!("no provider '{provider_name}'"))
        })?;
        Ok(Channel::new(provider, channel_name, config))
    }
}

static DEFAULT_CONTEXT: OnceLock<RwLock<Option<Arc<Context>>>> = OnceLock::new();

fn default_cell() -> &'static RwLock<Option<Arc<Context>>> {
    DEFAULT_CONTEXT.get_or_init(|| RwLock::new(None))
}

/// Install `context` as the process-wide default.
pub fn set_default_context(context: Arc<Context>) {
    *default_cell().write() = Some(context);
}

/// The process-wide default context, if one was installed.
pub fn default_context() -> Option<Arc<Context>> {
    default_cell().read().clone()
}

/// Remove the process-wide default context.
pub fn reset_default_context() {
    *default_cell().write() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockProvider;
    use crate::value::{Scalar, ScalarKind, Shape};

    #[test]
    fn test_first_registered_is_default() {
        let context = Context::new();
        assert!(context.default_provider().is_none());

        let provider = MockProvider::new();
        context.register(provider.clone());
        assert_eq!(
            context.default_provider().unwrap().provider_name(),
            "mock"
        );
        assert!(context.provider("mock").is_some());
        assert!(context.provider("pva").is_none());
    }

    #[test]
    fn test_channel_without_provider_rejected() {
        let context = Context::new();
        assert!(matches!(
            context.channel("dev:temp"),
            Err(ChanlinkError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_through_context() {
        let context = Context::new();
        let provider = MockProvider::new();
        provider.add_channel("dev:temp", Shape::scalar("value", ScalarKind::Float));
        context.register(provider);

        let channel = context.channel("dev:temp").unwrap();
        channel.put(Scalar::Float(1.5)).await.unwrap();
        assert_eq!(channel.get_f64().await.unwrap(), 1.5);
    }

    #[test]
    fn test_default_context_swap() {
        reset_default_context();
        assert!(default_context().is_none());

        let context = Context::new();
        set_default_context(context.clone());
        let ambient = default_context().unwrap();
        assert!(Arc::ptr_eq(&context, &ambient));

        reset_default_context();
        assert!(default_context().is_none());
    }
}
