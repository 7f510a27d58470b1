//! Central plugin dispatch manager.
//!
//! Owns the step registries and the two isolation boundaries, resolves step
//! configuration at registration time, and pushes events through matching
//! steps in order.

use crate::config::HostConfig;
use crate::context::ExecutionContext;
use crate::error::PluginError;
use crate::event::PluginEvent;
use crate::plugin::{Plugin, PluginModule, StepHandler};
use crate::registry::{PluginRegistries, RegistrationScope};
use crate::service::{LocalPluginContext, OrganizationService};
use crate::trigger::{Boundaries, PluginTrigger};
use plugsim_sandbox::{ComponentIdentity, IsolationBoundary, PermissionSet, SandboxPolicy};
use plugsim_types::{
    MetaPlugin, MetadataCatalog, MetadataLookup, Operation, Stage, StepConfig,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

const HOST_BOUNDARY: &str = "PluginHost";
const SANDBOX_BOUNDARY: &str = "PluginSandBox";

pub struct PluginManager {
    registries: PluginRegistries,
    host: IsolationBoundary,
    sandbox: IsolationBoundary,
    policy: SandboxPolicy,
    trusted: Vec<ComponentIdentity>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("registries", &self.registries)
            .field("host", &self.host)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

impl PluginManager {
    /// Creates a manager with empty registries.
    ///
    /// `trusted` components get full trust in both boundaries; each must
    /// pass the configured signature policy.
    pub fn new(config: &HostConfig, trusted: Vec<ComponentIdentity>) -> Result<Self, PluginError> {
        let policy = config.sandbox.clone();
        let (host, sandbox) = create_boundaries(&policy, &trusted)?;
        let mut registries = PluginRegistries::default();
        registries.set_permanent_enabled(config.plugins.permanent_enabled);
        Ok(Self {
            registries,
            host,
            sandbox,
            policy,
            trusted,
        })
    }

    // ================================================================
    // Registration
    // ================================================================

    /// Registers every plugin type of every module into the permanent registry.
    ///
    /// One result per plugin type, in table order. A failing type is logged
    /// and skipped; the rest still register. Buckets are sorted once at the end.
    pub fn register_steps(
        &mut self,
        modules: &[PluginModule],
        metadata: Arc<dyn MetadataLookup>,
        external: &[MetaPlugin],
    ) -> Vec<Result<String, PluginError>> {
        let mut results = Vec::new();
        for module in modules {
            for plugin in module.instantiate() {
                let type_name = plugin.type_name().to_string();
                match resolve_triggers(&plugin, &metadata, external) {
                    Ok(triggers) => {
                        let registry = self.registries.get_mut(RegistrationScope::Permanent);
                        let count = triggers.len();
                        for trigger in triggers {
                            registry.insert(Arc::new(trigger));
                        }
                        debug!(module = %module.name(), plugin = %type_name, steps = count, "Plugin registered");
                        results.push(Ok(type_name));
                    }
                    Err(e) => {
                        warn!(module = %module.name(), plugin = %type_name, "Plugin registration failed: {}", e);
                        results.push(Err(e));
                    }
                }
            }
        }
        self.registries
            .get_mut(RegistrationScope::Permanent)
            .sort_all();
        info!(
            modules = modules.len(),
            steps = self.registries.get(RegistrationScope::Permanent).len(),
            "Permanent plugin steps registered"
        );
        results
    }

    /// Registers one plugin into `scope`. Returns the number of steps added.
    pub fn register_additional(
        &mut self,
        plugin: Arc<dyn Plugin>,
        metadata: Arc<dyn MetadataLookup>,
        external: &[MetaPlugin],
        scope: RegistrationScope,
    ) -> Result<usize, PluginError> {
        let triggers = resolve_triggers(&plugin, &metadata, external)?;
        let count = triggers.len();
        let registry = self.registries.get_mut(scope);
        for trigger in triggers {
            registry.add(Arc::new(trigger));
        }
        info!(plugin = %plugin.type_name(), ?scope, steps = count, "Plugin registered");
        Ok(count)
    }

    /// Registers a platform-internal plugin. It must carry explicit step
    /// configs, and no metadata is consulted when its steps fire.
    pub fn register_system(&mut self, plugin: Arc<dyn Plugin>) -> Result<usize, PluginError> {
        if plugin.step_configs().is_none() {
            return Err(PluginError::UnknownHandler {
                type_name: plugin.type_name().to_string(),
            });
        }
        self.register_additional(
            plugin,
            Arc::new(MetadataCatalog::empty()),
            &[],
            RegistrationScope::System,
        )
    }

    /// Drops all temporary steps and re-enables the permanent registry.
    pub fn reset(&mut self) {
        let dropped = self.registries.get(RegistrationScope::Temporary).len();
        self.registries.reset();
        info!(dropped, "Plugin registrations reset");
    }

    pub fn set_permanent_enabled(&mut self, enabled: bool) {
        self.registries.set_permanent_enabled(enabled);
    }

    pub fn is_permanent_enabled(&self) -> bool {
        self.registries.is_permanent_enabled()
    }

    pub fn step_count(&self, scope: RegistrationScope) -> usize {
        self.registries.get(scope).len()
    }

    pub fn lookup(&self, scope: RegistrationScope, operation: &Operation, stage: Stage) -> &[Arc<PluginTrigger>] {
        self.registries.get(scope).lookup(operation, stage)
    }

    // ================================================================
    // Dispatch
    // ================================================================

    /// Runs every matching permanent step (when enabled), then every
    /// matching temporary step, each pass in execution order.
    ///
    /// Stops at the first failing step. Returns how many steps ran.
    pub fn dispatch(
        &self,
        event: &PluginEvent,
        context: &mut ExecutionContext,
        service: &dyn OrganizationService,
    ) -> Result<usize, PluginError> {
        check_depth(context)?;
        let mut executed = 0;
        for pass in self.registries.dispatch_passes(&event.operation, event.stage) {
            executed += self.run_pass(pass, event, context, service)?;
        }
        Ok(executed)
    }

    /// Like [`dispatch`](Self::dispatch), over system steps only.
    pub fn dispatch_system(
        &self,
        event: &PluginEvent,
        context: &mut ExecutionContext,
        service: &dyn OrganizationService,
    ) -> Result<usize, PluginError> {
        check_depth(context)?;
        let steps = self
            .registries
            .get(RegistrationScope::System)
            .lookup(&event.operation, event.stage);
        self.run_pass(steps, event, context, service)
    }

    /// Dispatches a request issued from inside a handler: one level deeper
    /// than `parent`, with its shared variables folded back into `parent`.
    pub fn dispatch_nested(
        &self,
        parent: &mut ExecutionContext,
        event: &PluginEvent,
        service: &dyn OrganizationService,
    ) -> Result<usize, PluginError> {
        let mut nested = parent.nested();
        let executed = self.dispatch(event, &mut nested, service)?;
        parent.merge_from_child(&nested);
        Ok(executed)
    }

    fn run_pass(
        &self,
        steps: &[Arc<PluginTrigger>],
        event: &PluginEvent,
        context: &mut ExecutionContext,
        service: &dyn OrganizationService,
    ) -> Result<usize, PluginError> {
        let boundaries = Boundaries {
            host: &self.host,
            sandbox: &self.sandbox,
        };
        let mut executed = 0;
        for step in steps {
            if step.execute_if_match(event, context, service, boundaries)? {
                executed += 1;
            }
        }
        Ok(executed)
    }

    // ================================================================
    // Boundaries
    // ================================================================

    pub fn sandbox(&self) -> &IsolationBoundary {
        &self.sandbox
    }

    pub fn host_boundary(&self) -> &IsolationBoundary {
        &self.host
    }

    /// Tears down the sandbox and everything it holds, and starts a fresh one.
    pub fn recycle_sandbox(&mut self) -> Result<(), PluginError> {
        let fresh = IsolationBoundary::from_policy(SANDBOX_BOUNDARY, &self.trusted, &self.policy)?;
        let old = std::mem::replace(&mut self.sandbox, fresh);
        old.dispose();
        Ok(())
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.sandbox.dispose();
        self.host.dispose();
    }
}

fn create_boundaries(
    policy: &SandboxPolicy,
    trusted: &[ComponentIdentity],
) -> Result<(IsolationBoundary, IsolationBoundary), PluginError> {
    let host = IsolationBoundary::in_process(
        HOST_BOUNDARY,
        trusted,
        Some(PermissionSet::full_trust()),
        &policy.verifier(),
    )?;
    let sandbox = IsolationBoundary::from_policy(SANDBOX_BOUNDARY, trusted, policy)?;
    Ok((host, sandbox))
}

fn check_depth(context: &ExecutionContext) -> Result<(), PluginError> {
    if context.exceeds_max_depth() {
        warn!(depth = context.depth, "Dispatch refused: pipeline nested too deep");
        return Err(PluginError::InfiniteLoop {
            depth: context.depth,
        });
    }
    Ok(())
}

/// Resolves a plugin's steps and binds each to the plugin's entry point.
///
/// Explicit configs win. Otherwise the first platform metadata row whose
/// assembly name is the plugin's type name becomes its single step; no row
/// is an `UnknownHandler`. Entity-scoped association steps are refused here.
fn resolve_triggers(
    plugin: &Arc<dyn Plugin>,
    metadata: &Arc<dyn MetadataLookup>,
    external: &[MetaPlugin],
) -> Result<Vec<PluginTrigger>, PluginError> {
    let type_name = plugin.type_name();
    let configs = match plugin.step_configs() {
        Some(configs) => configs,
        None => {
            let row = external
                .iter()
                .find(|m| m.assembly_name == type_name)
                .ok_or_else(|| PluginError::UnknownHandler {
                    type_name: type_name.to_string(),
                })?;
            let config = row.to_step_config().map_err(|e| PluginError::InvalidStepConfig {
                step: row.name.clone(),
                reason: e.to_string(),
            })?;
            vec![config]
        }
    };

    configs
        .into_iter()
        .map(|config| {
            validate_scope(&config)?;
            Ok(PluginTrigger::new(
                plugin.component(),
                config,
                bind(plugin),
                Arc::clone(metadata),
            ))
        })
        .collect()
}

fn validate_scope(config: &StepConfig) -> Result<(), PluginError> {
    let subscription = &config.subscription;
    if subscription.operation.is_association() && !subscription.is_any_entity() {
        return Err(PluginError::ScopeViolation {
            operation: subscription.operation.clone(),
            entity: subscription.entity_logical_name.clone(),
        });
    }
    Ok(())
}

fn bind(plugin: &Arc<dyn Plugin>) -> StepHandler {
    let plugin = Arc::clone(plugin);
    Arc::new(move |local: &mut LocalPluginContext<'_>| plugin.execute(local))
}
