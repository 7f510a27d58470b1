//! Plugin types and the explicit registration table.
//!
//! A plugin either declares its steps in code (`step_configs`) or leaves
//! them to the platform's step metadata, which is matched by type name at
//! registration time.

use crate::service::LocalPluginContext;
use anyhow::anyhow;
use plugsim_types::{
    ColumnSet, Deployment, ExecutionMode, ImageType, IsolationMode, Operation, RecordId, Stage,
    StepConfig, StepDeployment, StepImage, StepSubscription,
};
use std::collections::HashSet;
use std::sync::Arc;

/// A bound step entry point.
pub type StepHandler = Arc<dyn Fn(&mut LocalPluginContext<'_>) -> anyhow::Result<()> + Send + Sync>;

pub trait Plugin: Send + Sync {
    /// Fully qualified type name. Also the key into platform step metadata.
    fn type_name(&self) -> &str;

    /// Component the plugin ships in. Trust is granted per component.
    fn component(&self) -> &str {
        self.type_name()
    }

    /// Explicit step configuration. `None` defers to platform metadata.
    fn step_configs(&self) -> Option<Vec<StepConfig>> {
        None
    }

    fn execute(&self, local: &mut LocalPluginContext<'_>) -> anyhow::Result<()>;
}

type PluginFactory = Box<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// A named table of plugin types to register together.
pub struct PluginModule {
    name: String,
    factories: Vec<PluginFactory>,
}

impl PluginModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factories: Vec::new(),
        }
    }

    /// Adds a plugin type constructed with `Default`.
    #[must_use]
    pub fn register<P: Plugin + Default + 'static>(mut self) -> Self {
        self.factories.push(Box::new(|| Arc::new(P::default())));
        self
    }

    #[must_use]
    pub fn register_with<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Fresh instances of every plugin type in the table.
    pub fn instantiate(&self) -> Vec<Arc<dyn Plugin>> {
        self.factories.iter().map(|f| f()).collect()
    }
}

impl std::fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModule")
            .field("name", &self.name)
            .field("plugins", &self.factories.len())
            .finish()
    }
}

/// Plugin whose steps are closures declared through [`PluginBuilder`].
pub struct FnPlugin {
    type_name: String,
    component: String,
    steps: Vec<(StepConfig, StepHandler)>,
}

impl Plugin for FnPlugin {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn component(&self) -> &str {
        &self.component
    }

    fn step_configs(&self) -> Option<Vec<StepConfig>> {
        Some(self.steps.iter().map(|(config, _)| config.clone()).collect())
    }

    fn execute(&self, local: &mut LocalPluginContext<'_>) -> anyhow::Result<()> {
        let name = local.step_name();
        let (_, handler) = self
            .steps
            .iter()
            .find(|(config, _)| config.deployment.name == name)
            .ok_or_else(|| anyhow!("{} has no step named '{}'", self.type_name, name))?;
        handler.as_ref()(local)
    }
}

/// Fluent declaration of a plugin's steps.
///
/// Each `step` call starts a new step; the modifiers that follow apply to
/// the most recent one.
///
/// ```ignore
/// let plugin = PluginBuilder::new("Contoso.Plugins.AccountPlugin")
///     .step(Operation::Update, Stage::PostOperation, "account", on_update)
///     .filtered_attributes(["name"])
///     .image("pre", ImageType::PreImage, ColumnSet::All)
///     .build();
/// ```
pub struct PluginBuilder {
    type_name: String,
    component: Option<String>,
    steps: Vec<(StepConfig, StepHandler)>,
    names: HashSet<String>,
}

impl PluginBuilder {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            component: None,
            steps: Vec::new(),
            names: HashSet::new(),
        }
    }

    #[must_use]
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Registers a step. An empty `entity` subscribes to any entity.
    #[must_use]
    pub fn step<H>(mut self, operation: Operation, stage: Stage, entity: &str, handler: H) -> Self
    where
        H: Fn(&mut LocalPluginContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let target = if entity.is_empty() { "any entity" } else { entity };
        let base = format!("{}: {:?} {} of {}", self.type_name, stage, operation, target);
        let mut name = base.clone();
        let mut n = 1;
        while self.names.contains(&name) {
            n += 1;
            name = format!("{base} #{n}");
        }
        self.names.insert(name.clone());

        let config = StepConfig::new(
            StepSubscription::new(self.type_name.clone(), stage, operation, entity),
            StepDeployment::new(name),
        );
        let handler: StepHandler = Arc::new(handler);
        self.steps.push((config, handler));
        self
    }

    fn last_deployment(&mut self) -> Option<&mut StepDeployment> {
        self.steps.last_mut().map(|(config, _)| &mut config.deployment)
    }

    #[must_use]
    pub fn filtered_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(deployment) = self.last_deployment() {
            deployment.filtered_attributes = attributes.into_iter().map(Into::into).collect();
        }
        self
    }

    #[must_use]
    pub fn execution_order(mut self, order: i32) -> Self {
        if let Some(deployment) = self.last_deployment() {
            deployment.execution_order = order;
        }
        self
    }

    #[must_use]
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        if let Some(deployment) = self.last_deployment() {
            deployment.execution_mode = mode;
        }
        self
    }

    #[must_use]
    pub fn deployment(mut self, deployment: Deployment) -> Self {
        if let Some(d) = self.last_deployment() {
            d.deployment = deployment;
        }
        self
    }

    /// Runs the step as `user` instead of the caller.
    #[must_use]
    pub fn user_context(mut self, user: RecordId) -> Self {
        if let Some(deployment) = self.last_deployment() {
            deployment.user_context = user;
        }
        self
    }

    #[must_use]
    pub fn isolation(mut self, isolation: IsolationMode) -> Self {
        if let Some(deployment) = self.last_deployment() {
            deployment.isolation = isolation;
        }
        self
    }

    #[must_use]
    pub fn image(mut self, alias: &str, image_type: ImageType, columns: ColumnSet) -> Self {
        if let Some((config, _)) = self.steps.last_mut() {
            config.images.push(StepImage::new(alias, image_type, columns));
        }
        self
    }

    pub fn build(self) -> FnPlugin {
        FnPlugin {
            component: self.component.unwrap_or_else(|| self.type_name.clone()),
            type_name: self.type_name,
            steps: self.steps,
        }
    }
}
