//! Step registries keyed by operation and stage.

use crate::trigger::PluginTrigger;
use plugsim_types::{Operation, Stage};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationScope {
    /// Survives `reset`. Can be switched off as a whole.
    Permanent,
    /// Cleared by `reset`.
    Temporary,
    /// Platform-internal steps, dispatched separately.
    System,
}

/// Triggers bucketed by `(operation, stage)`, each bucket in execution order.
#[derive(Debug, Default)]
pub struct StepRegistry {
    buckets: HashMap<Operation, HashMap<Stage, Vec<Arc<PluginTrigger>>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends without sorting. Call [`sort_all`](Self::sort_all) after a batch.
    pub fn insert(&mut self, trigger: Arc<PluginTrigger>) {
        self.bucket_mut(trigger.operation().clone(), trigger.stage())
            .push(trigger);
    }

    /// Appends and re-sorts the affected bucket.
    pub fn add(&mut self, trigger: Arc<PluginTrigger>) {
        let bucket = self.bucket_mut(trigger.operation().clone(), trigger.stage());
        bucket.push(trigger);
        sort_bucket(bucket);
    }

    pub fn sort_all(&mut self) {
        for stages in self.buckets.values_mut() {
            for bucket in stages.values_mut() {
                sort_bucket(bucket);
            }
        }
    }

    /// Triggers for `(operation, stage)` in execution order. Empty if none.
    pub fn lookup(&self, operation: &Operation, stage: Stage) -> &[Arc<PluginTrigger>] {
        self.buckets
            .get(operation)
            .and_then(|stages| stages.get(&stage))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.buckets
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    fn bucket_mut(&mut self, operation: Operation, stage: Stage) -> &mut Vec<Arc<PluginTrigger>> {
        self.buckets
            .entry(operation)
            .or_default()
            .entry(stage)
            .or_default()
    }
}

/// Stable: equal orders keep registration order.
fn sort_bucket(bucket: &mut [Arc<PluginTrigger>]) {
    bucket.sort_by_key(|t| t.execution_order());
}

/// The three registries plus the switch on the permanent one.
#[derive(Debug)]
pub struct PluginRegistries {
    permanent: StepRegistry,
    temporary: StepRegistry,
    system: StepRegistry,
    permanent_enabled: bool,
}

impl Default for PluginRegistries {
    fn default() -> Self {
        Self {
            permanent: StepRegistry::new(),
            temporary: StepRegistry::new(),
            system: StepRegistry::new(),
            permanent_enabled: true,
        }
    }
}

impl PluginRegistries {
    pub fn get(&self, scope: RegistrationScope) -> &StepRegistry {
        match scope {
            RegistrationScope::Permanent => &self.permanent,
            RegistrationScope::Temporary => &self.temporary,
            RegistrationScope::System => &self.system,
        }
    }

    pub fn get_mut(&mut self, scope: RegistrationScope) -> &mut StepRegistry {
        match scope {
            RegistrationScope::Permanent => &mut self.permanent,
            RegistrationScope::Temporary => &mut self.temporary,
            RegistrationScope::System => &mut self.system,
        }
    }

    pub fn is_permanent_enabled(&self) -> bool {
        self.permanent_enabled
    }

    pub fn set_permanent_enabled(&mut self, enabled: bool) {
        self.permanent_enabled = enabled;
    }

    /// Drops every temporary step and switches the permanent registry back on.
    pub fn reset(&mut self) {
        self.temporary.clear();
        self.permanent_enabled = true;
    }

    /// Buckets a user-facing dispatch walks: permanent (when enabled), then temporary.
    pub fn dispatch_passes(
        &self,
        operation: &Operation,
        stage: Stage,
    ) -> impl Iterator<Item = &[Arc<PluginTrigger>]> {
        let permanent = self
            .permanent_enabled
            .then(|| self.permanent.lookup(operation, stage));
        permanent
            .into_iter()
            .chain(std::iter::once(self.temporary.lookup(operation, stage)))
    }
}
