//! Execution context handed to plugin handlers.
//!
//! A context is plain data: it crosses the isolation boundary by value and
//! comes back the same way. The parent link is an id, never a reference.

use plugsim_types::{ExecutionMode, Record, RecordId, Stage, StepConfig, Target};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Deepest pipeline nesting allowed before dispatch is refused.
pub const MAX_DEPTH: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub id: Uuid,
    /// The context this one was derived from.
    pub parent_id: Option<Uuid>,
    pub correlation_id: Uuid,
    /// 1 for a top-level request, incremented for each nested request.
    pub depth: u32,
    /// Unset on a context that has not been handed to a step yet.
    pub stage: Option<Stage>,
    pub mode: ExecutionMode,
    pub message_name: String,
    pub primary_entity_id: RecordId,
    pub primary_entity_name: String,
    pub user_id: RecordId,
    pub initiating_user_id: RecordId,
    pub target: Option<Target>,
    pub pre_images: BTreeMap<String, Record>,
    pub post_images: BTreeMap<String, Record>,
    /// Kept in the order keys were first set.
    pub shared_variables: Map<String, Value>,
    pub trace_log: Vec<String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(RecordId::EMPTY)
    }
}

impl ExecutionContext {
    /// A fresh top-level context for a request made by `user`.
    pub fn new(user: RecordId) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            correlation_id: Uuid::new_v4(),
            depth: 1,
            stage: None,
            mode: ExecutionMode::Synchronous,
            message_name: String::new(),
            primary_entity_id: RecordId::EMPTY,
            primary_entity_name: String::new(),
            user_id: user,
            initiating_user_id: user,
            target: None,
            pre_images: BTreeMap::new(),
            post_images: BTreeMap::new(),
            shared_variables: Map::new(),
            trace_log: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn exceeds_max_depth(&self) -> bool {
        self.depth > MAX_DEPTH
    }

    pub fn shared_variable(&self, key: &str) -> Option<&Value> {
        self.shared_variables.get(key)
    }

    pub fn set_shared_variable(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.shared_variables.insert(key.into(), value.into());
    }

    pub fn pre_image(&self, alias: &str) -> Option<&Record> {
        self.pre_images.get(alias)
    }

    pub fn post_image(&self, alias: &str) -> Option<&Record> {
        self.post_images.get(alias)
    }

    /// Context for one matched step.
    ///
    /// Stage, mode and message come from the step. The primary entity id is
    /// only filled in if the parent has none. A non-empty user context on
    /// the step impersonates that user. Images start empty.
    pub fn child_for_step(&self, config: &StepConfig, target: Target) -> Self {
        let mut child = self.clone();
        child.id = Uuid::new_v4();
        child.parent_id = Some(self.id);
        child.stage = Some(config.subscription.stage);
        child.mode = config.deployment.execution_mode;
        child.message_name = config.subscription.operation.to_string();
        if child.primary_entity_id.is_empty() {
            child.primary_entity_id = target.id();
        }
        child.primary_entity_name = target.logical_name().to_string();
        if !config.deployment.user_context.is_empty() {
            child.user_id = config.deployment.user_context;
        }
        child.pre_images.clear();
        child.post_images.clear();
        child.trace_log.clear();
        child.target = Some(target);
        child
    }

    /// Context for a request issued from inside a handler.
    ///
    /// Shares correlation, users and shared variables with `self`, one level
    /// deeper. Everything describing the current step is reset.
    pub fn nested(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            correlation_id: self.correlation_id,
            depth: self.depth + 1,
            stage: None,
            mode: self.mode,
            message_name: String::new(),
            primary_entity_id: RecordId::EMPTY,
            primary_entity_name: String::new(),
            user_id: self.user_id,
            initiating_user_id: self.initiating_user_id,
            target: None,
            pre_images: BTreeMap::new(),
            post_images: BTreeMap::new(),
            shared_variables: self.shared_variables.clone(),
            trace_log: Vec::new(),
        }
    }

    /// Folds a finished child back in. Child shared variables win on
    /// conflicting keys; trace lines are appended.
    pub fn merge_from_child(&mut self, child: &ExecutionContext) {
        for (key, value) in &child.shared_variables {
            self.shared_variables.insert(key.clone(), value.clone());
        }
        self.trace_log.extend(child.trace_log.iter().cloned());
    }
}
