//! Routing: which workbasket a new task belongs to.

use std::collections::HashMap;
use std::str::FromStr;

use caseflow_core::{EngineContext, FailurePolicy, WorkbasketId};

use crate::consensus::{DecisionEngine, DecisionError, DecisionKind};
use crate::provider::{DecisionProvider, ProviderError};
use crate::registry::ProviderRegistry;
use crate::task::TaskSnapshot;

/// A provider contributing to routing decisions.
pub type RoutingProvider = dyn DecisionProvider<TaskSnapshot, WorkbasketId>;

/// Entry point used by task creation to route a task.
#[derive(Debug)]
pub struct RoutingManager {
    engine: DecisionEngine<TaskSnapshot, WorkbasketId>,
}

impl RoutingManager {
    pub fn new(providers: ProviderRegistry<TaskSnapshot, WorkbasketId>) -> Self {
        Self {
            engine: DecisionEngine::new(DecisionKind::Routing, providers),
        }
    }

    /// Initialize `providers` against `ctx` and wrap them.
    pub fn initialize(
        providers: Vec<Box<RoutingProvider>>,
        ctx: &EngineContext,
        policy: FailurePolicy,
    ) -> Result<Self, ProviderError> {
        let registry = ProviderRegistry::initialize(providers, ctx)?;
        Ok(Self {
            engine: DecisionEngine::new(DecisionKind::Routing, registry).with_policy(policy),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_enabled()
    }

    /// The task's pre-assigned workbasket, or the providers' unanimous choice.
    pub fn determine_workbasket(
        &self,
        task: &TaskSnapshot,
    ) -> Result<Option<WorkbasketId>, DecisionError> {
        self.engine.decide_unless(task.workbasket, task)
    }
}

/// Routes by classification key using a table read from the engine context.
///
/// Properties of the form `routing.classification.<KEY> = <workbasket uuid>`
/// populate the table. Tasks without a classification, or with an unmapped
/// one, get no opinion.
#[derive(Debug, Default)]
pub struct ClassificationRouting {
    table: HashMap<String, WorkbasketId>,
}

impl ClassificationRouting {
    pub const PROPERTY_PREFIX: &'static str = "routing.classification.";

    pub fn new() -> Self {
        Self::default()
    }
}

impl DecisionProvider<TaskSnapshot, WorkbasketId> for ClassificationRouting {
    fn name(&self) -> &str {
        "classification-routing"
    }

    fn initialize(&mut self, ctx: &EngineContext) -> Result<(), ProviderError> {
        for (key, value) in ctx.properties_with_prefix(Self::PROPERTY_PREFIX) {
            let workbasket = WorkbasketId::from_str(value)
                .map_err(|e| ProviderError::initialization(self.name(), format!("{key}: {e}")))?;
            self.table.insert(key.to_string(), workbasket);
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.table.clear();
    }

    fn decide(&self, task: &TaskSnapshot) -> Result<Option<WorkbasketId>, ProviderError> {
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

    struct Always(WorkbasketId);

    impl DecisionProvider<TaskSnapshot, WorkbasketId> for Always {
        fn name(&self) -> &str {
            "always"
        }

        fn decide(&self, _task: &TaskSnapshot) -> Result<Option<WorkbasketId>, ProviderError> {
            Ok(Some(self.0))
        }
    }

    #[test]
    fn classification_table_routes_known_keys() {
        let wb = WorkbasketId::new();
        let ctx = EngineContext::new("test")
            .with_property(format!("{}L10000", ClassificationRouting::PROPERTY_PREFIX), wb.to_string());
        let manager = RoutingManager::initialize(
            vec![Box::new(ClassificationRouting::new())],
            &ctx,
            FailurePolicy::Isolate,
        )
        .unwrap();

        let known = TaskSnapshot::new(TaskId::new()).with_classification("L10000");
        let unknown = TaskSnapshot::new(TaskId::new()).with_classification("L99999");

        assert_eq!(manager.determine_workbasket(&known).unwrap(), Some(wb));
        assert_eq!(manager.determine_workbasket(&unknown).unwrap(), None);
    }

    #[test]
    fn invalid_workbasket_in_table_fails_initialization() {
        let ctx = EngineContext::new("test")
            .with_property(format!("{}L10000", ClassificationRouting::PROPERTY_PREFIX), "nope");

        let err = RoutingManager::initialize(
            vec![Box::new(ClassificationRouting::new())],
            &ctx,
            FailurePolicy::Isolate,
        )
        .unwrap_err();

        assert!(matches!(err, ProviderError::Initialization { .. }));
    }

    #[test]
    fn preassigned_workbasket_wins_without_consulting_providers() {
        let preassigned = WorkbasketId::new();
        let manager = RoutingManager::initialize(
            vec![Box::new(Always(WorkbasketId::new()))],
            &EngineContext::new("test"),
            FailurePolicy::Isolate,
        )
        .unwrap();

        let task = TaskSnapshot::new(TaskId::new()).in_workbasket(preassigned);
        assert_eq!(manager.determine_workbasket(&task).unwrap(), Some(preassigned));
    }

    #[test]
    fn conflicting_routers_leave_task_unrouted() {
        let manager = RoutingManager::initialize(
            vec![
                Box::new(Always(WorkbasketId::new())),
                Box::new(Always(WorkbasketId::new())),
            ],
            &EngineContext::new("test"),
            FailurePolicy::Isolate,
        )
        .unwrap();

        let task = TaskSnapshot::new(TaskId::new());
        assert_eq!(manager.determine_workbasket(&task).unwrap(), None);
    }
}
