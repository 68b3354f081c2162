//! Provider lifecycle: initialize once at engine start, tear down at shutdown.

use tracing::{debug, error, info};

use caseflow_core::EngineContext;

use crate::provider::{DecisionProvider, ProviderError};

/// The ordered, initialized set of providers for one decision kind.
///
/// Instances are owned by the engine that consults them; there is no global
/// registry. Registration order is preserved and is the order in which
/// providers are consulted.
pub struct ProviderRegistry<I, D> {
    providers: Vec<Box<dyn DecisionProvider<I, D>>>,
    torn_down: bool,
}

impl<I, D> ProviderRegistry<I, D> {
    /// A registry with no providers (every decision is "nobody decided").
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
            torn_down: false,
        }
    }

    /// Initialize each provider exactly once, in order.
    ///
    /// If a provider fails, the providers initialized before it are torn down
    /// again and the error is returned.
    pub fn initialize(
        mut providers: Vec<Box<dyn DecisionProvider<I, D>>>,
        ctx: &EngineContext,
    ) -> Result<Self, ProviderError> {
        for idx in 0..providers.len() {
            if let Err(err) = providers[idx].initialize(ctx) {
                error!(
                    provider = providers[idx].name(),
                    engine = ctx.name(),
                    error = %err,
                    "provider initialization failed"
                );
                for done in providers[..idx].iter_mut().rev() {
                    done.teardown();
                }
                return Err(err);
            }
            debug!(provider = providers[idx].name(), engine = ctx.name(), "provider initialized");
        }

        info!(engine = ctx.name(), count = providers.len(), "providers initialized");
        Ok(Self {
            providers,
            torn_down: false,
        })
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &dyn DecisionProvider<I, D>> {
        self.providers.iter().map(|p| p.as_ref())
    }

    /// Tear down all providers in reverse registration order.
    pub fn shutdown(mut self) {
        self.teardown_all();
    }

    fn teardown_all(&mut self) {
        if self.torn_down {
            return;
        }
        for provider in self.providers.iter_mut().rev() {
            provider.teardown();
            debug!(provider = provider.name(), "provider torn down");
        }
        self.torn_down = true;
    }
}

impl<I, D> Drop for ProviderRegistry<I, D> {
    fn drop(&mut self) {
        self.teardown_all();
    }
}

impl<I, D> std::fmt::Debug for ProviderRegistry<I, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Lifecycle {
        name: &'static str,
        log: Log,
        fail_init: bool,
    }

    impl DecisionProvider<(), u8> for Lifecycle {
        fn name(&self) -> &str {
            self.name
        }

        fn initialize(&mut self, _ctx: &EngineContext) -> Result<(), ProviderError> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            if self.fail_init {
                return Err(ProviderError::initialization(self.name, "bad config"));
            }
            Ok(())
        }

        fn teardown(&mut self) {
            self.log.lock().unwrap().push(format!("down:{}", self.name));
        }

        fn decide(&self, _input: &()) -> Result<Option<u8>, ProviderError> {
            Ok(None)
        }
    }

    fn provider(name: &'static str, log: &Log, fail_init: bool) -> Box<dyn DecisionProvider<(), u8>> {
        Box::new(Lifecycle {
            name,
            log: log.clone(),
            fail_init,
        })
    }

    #[test]
    fn initializes_in_order_and_tears_down_in_reverse_once() {
        let log: Log = Arc::default();
        let registry = ProviderRegistry::initialize(
            vec![provider("a", &log, false), provider("b", &log, false)],
            &EngineContext::new("test"),
        )
        .unwrap();

        assert_eq!(registry.names(), vec!["a", "b"]);
        registry.shutdown();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["init:a", "init:b", "down:b", "down:a"]
        );
    }

    #[test]
    fn failed_initialization_rolls_back_earlier_providers() {
        let log: Log = Arc::default();
        let err = ProviderRegistry::initialize(
            vec![
                provider("a", &log, false),
                provider("b", &log, true),
                provider("c", &log, false),
            ],
            &EngineContext::new("test"),
        )
        .unwrap_err();

        assert!(matches!(err, ProviderError::Initialization { ref provider, .. } if provider == "b"));
        assert_eq!(*log.lock().unwrap(), vec!["init:a", "init:b", "down:a"]);
    }
}
