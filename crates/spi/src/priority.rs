//! Priority: the number a task is sorted by in its workbasket.

use std::collections::HashMap;

use caseflow_core::{EngineContext, FailurePolicy};

use crate::consensus::{DecisionEngine, DecisionError, DecisionKind};
use crate::provider::{DecisionProvider, ProviderError};
use crate::registry::ProviderRegistry;
use crate::task::TaskSnapshot;

/// A provider contributing to priority decisions.
pub type PriorityProvider = dyn DecisionProvider<TaskSnapshot, i32>;

#[derive(Debug)]
pub struct PriorityManager {
    engine: DecisionEngine<TaskSnapshot, i32>,
}

impl PriorityManager {
    pub fn new(providers: ProviderRegistry<TaskSnapshot, i32>) -> Self {
        Self {
            engine: DecisionEngine::new(DecisionKind::Priority, providers),
        }
    }

    pub fn initialize(
        providers: Vec<Box<PriorityProvider>>,
        ctx: &EngineContext,
        policy: FailurePolicy,
    ) -> Result<Self, ProviderError> {
        let registry = ProviderRegistry::initialize(providers, ctx)?;
        Ok(Self {
            engine: DecisionEngine::new(DecisionKind::Priority, registry).with_policy(policy),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_enabled()
    }

    /// The manual priority if one is set, otherwise the providers' unanimous value.
    pub fn calculate_priority(&self, task: &TaskSnapshot) -> Result<Option<i32>, DecisionError> {
        self.engine.decide_unless(task.manual_priority, task)
    }
}

/// Assigns a fixed priority per classification key.
///
/// Configured from `priority.classification.<KEY> = <i32>` properties.
#[derive(Debug, Default)]
pub struct ClassificationPriority {
    table: HashMap<String, i32>,
}

impl ClassificationPriority {
    pub const PROPERTY_PREFIX: &'static str = "priority.classification.";

    pub fn new() -> Self {
        Self::default()
    }
}

impl DecisionProvider<TaskSnapshot, i32> for ClassificationPriority {
    fn name(&self) -> &str {
        "classification-priority"
    }

    fn initialize(&mut self, ctx: &EngineContext) -> Result<(), ProviderError> {
        for (key, value) in ctx.properties_with_prefix(Self::PROPERTY_PREFIX) {
            let priority: i32 = value.trim().parse().map_err(|e| {
                ProviderError::initialization(self.name(), format!("{key}: {e}"))
            })?;
            self.table.insert(key.to_string(), priority);
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.table.clear();
    }

    fn decide(&self, task: &TaskSnapshot) -> Result<Option<i32>, ProviderError> {
        Ok(task
            .classification_key
            .as_deref()
            .and_then(|key| self.table.get(key))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseflow_core::TaskId;

    fn manager(ctx: &EngineContext) -> PriorityManager {
        PriorityManager::initialize(
            vec![Box::new(ClassificationPriority::new())],
            ctx,
            FailurePolicy::Isolate,
        )
        .unwrap()
    }

    #[test]
    fn classification_priority_applies_to_mapped_keys() {
        let ctx = EngineContext::new("test").with_property("priority.classification.L10000", "7");
        let manager = manager(&ctx);

        let task = TaskSnapshot::new(TaskId::new()).with_classification("L10000");
        assert_eq!(manager.calculate_priority(&task).unwrap(), Some(7));
    }

    #[test]
    fn manual_priority_is_authoritative() {
        let ctx = EngineContext::new("test").with_property("priority.classification.L10000", "7");
        let manager = manager(&ctx);

        let task = TaskSnapshot::new(TaskId::new())
            .with_classification("L10000")
            .with_manual_priority(99);
        assert_eq!(manager.calculate_priority(&task).unwrap(), Some(99));
    }

    #[test]
    fn non_numeric_priority_fails_initialization() {
        let ctx = EngineContext::new("test").with_property("priority.classification.L10000", "high");
        let err = PriorityManager::initialize(
            vec![Box::new(ClassificationPriority::new())],
            &ctx,
            FailurePolicy::Isolate,
        )
        .unwrap_err();

        assert!(matches!(err, ProviderError::Initialization { .. }));
    }

    #[test]
    fn manager_without_providers_is_disabled() {
        let manager = PriorityManager::new(ProviderRegistry::empty());
        assert!(!manager.is_enabled());
        let task = TaskSnapshot::new(TaskId::new());
        assert_eq!(manager.calculate_priority(&task).unwrap(), None);
    }
}
