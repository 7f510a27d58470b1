//! A registered step and the rules deciding whether it fires for an event.

use crate::context::ExecutionContext;
use crate::error::PluginError;
use crate::event::PluginEvent;
use crate::plugin::StepHandler;
use crate::service::{BoundaryService, LocalPluginContext, OrganizationService, serve};
use plugsim_sandbox::IsolationBoundary;
use plugsim_types::{
    IsolationMode, MetadataLookup, Operation, Record, Stage, StepConfig, Target,
};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, trace};

/// The two domains a step may run in.
#[derive(Clone, Copy)]
pub(crate) struct Boundaries<'a> {
    pub host: &'a IsolationBoundary,
    pub sandbox: &'a IsolationBoundary,
}

pub struct PluginTrigger {
    config: StepConfig,
    component: String,
    handler: StepHandler,
    metadata: Arc<dyn MetadataLookup>,
}

impl std::fmt::Debug for PluginTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginTrigger")
            .field("name", &self.config.deployment.name)
            .field("operation", &self.config.subscription.operation)
            .field("stage", &self.config.subscription.stage)
            .field("entity", &self.config.subscription.entity_logical_name)
            .field("order", &self.config.deployment.execution_order)
            .finish()
    }
}

impl PluginTrigger {
    pub fn new(
        component: impl Into<String>,
        config: StepConfig,
        handler: StepHandler,
        metadata: Arc<dyn MetadataLookup>,
    ) -> Self {
        Self {
            config,
            component: component.into(),
            handler,
            metadata,
        }
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.deployment.name
    }

    pub fn operation(&self) -> &Operation {
        &self.config.subscription.operation
    }

    pub fn stage(&self) -> Stage {
        self.config.subscription.stage
    }

    /// Empty for any-entity steps.
    pub fn entity(&self) -> &str {
        &self.config.subscription.entity_logical_name
    }

    pub fn execution_order(&self) -> i32 {
        self.config.deployment.execution_order
    }

    pub fn isolation(&self) -> IsolationMode {
        self.config.deployment.isolation
    }

    /// Runs the step if it matches `event`. Returns whether it ran.
    ///
    /// On success the handler's shared variables are merged into `parent`.
    pub(crate) fn execute_if_match(
        &self,
        event: &PluginEvent,
        parent: &mut ExecutionContext,
        service: &dyn OrganizationService,
        boundaries: Boundaries<'_>,
    ) -> Result<bool, PluginError> {
        let logical_name = event.target.logical_name();
        let id = event.target.id();
        let entity = self.entity();

        if !entity.is_empty() && entity != logical_name {
            return Ok(false);
        }

        let mut target = Cow::Borrowed(&event.target);
        if let Target::Record(record) = &event.target {
            let primary = self
                .metadata
                .get_metadata(logical_name)
                .and_then(|m| m.primary_id_attribute.as_deref());
            if let Some(attribute) = primary
                && record.get(attribute).is_none_or(Value::is_null)
            {
                let mut stamped = record.clone();
                stamped.set(attribute, id.to_string());
                target = Cow::Owned(Target::Record(stamped));
            }
        }

        if parent.exceeds_max_depth() {
            return Err(PluginError::InfiniteLoop {
                depth: parent.depth,
            });
        }

        let operation = self.operation();
        let stage = self.stage();

        // Attributes the engine set during the operation count as changed.
        if *operation == Operation::Update && stage == Stage::PostOperation {
            if let (Some(record), Some(post)) = (target.as_record(), &event.post_image) {
                let shadow = shadow_attributes(record, event.pre_image.as_ref(), post);
                if !shadow.is_empty() {
                    let mut reconciled = record.clone();
                    for (name, value) in shadow {
                        reconciled.set(name, value);
                    }
                    target = Cow::Owned(Target::Record(reconciled));
                }
            }
        }

        let filter = &self.config.deployment.filtered_attributes;
        if *operation == Operation::Update && !filter.is_empty() {
            let touched = target
                .as_record()
                .is_some_and(|r| r.attribute_names().any(|a| filter.contains(a)));
            if !touched {
                trace!(step = %self.name(), "Skipped: no filtered attribute changed");
                return Ok(false);
            }
        }

        if operation.is_association() && !entity.is_empty() {
            return Err(PluginError::ScopeViolation {
                operation: operation.clone(),
                entity: entity.to_string(),
            });
        }

        let mut child = parent.child_for_step(&self.config, target.into_owned());
        self.attach_images(event, &mut child);

        let boundary = match self.isolation() {
            IsolationMode::None => boundaries.host,
            IsolationMode::Sandbox => boundaries.sandbox,
        };
        debug!(
            step = %self.name(),
            depth = child.depth,
            boundary = %boundary.name(),
            "Executing plugin step"
        );

        let step_name = self.name();
        let returned: ExecutionContext = boundary
            .run_with_host(
                &self.component,
                &child,
                |scope, context: ExecutionContext| {
                    let proxy = BoundaryService::new(scope);
                    let mut local = LocalPluginContext::new(context, &proxy, scope, step_name);
                    self.handler.as_ref()(&mut local)?;
                    Ok(local.into_context())
                },
                |request| serve(service, request),
            )
            .map_err(PluginError::from_invocation)?;

        parent.merge_from_child(&returned);
        Ok(true)
    }

    fn attach_images(&self, event: &PluginEvent, child: &mut ExecutionContext) {
        let stage = self.stage();
        for image in &self.config.images {
            if image.image_type.includes_pre()
                && let Some(pre) = &event.pre_image
            {
                let metadata = self.metadata.get_metadata(&pre.logical_name);
                child
                    .pre_images
                    .insert(image.alias.clone(), pre.snapshot(&image.attributes, metadata));
            }
            if stage == Stage::PostOperation
                && image.image_type.includes_post()
                && let Some(post) = &event.post_image
            {
                let metadata = self.metadata.get_metadata(&post.logical_name);
                child
                    .post_images
                    .insert(image.alias.clone(), post.snapshot(&image.attributes, metadata));
            }
        }
    }
}

/// Attributes present after the operation that neither the request nor the
/// prior state carried.
fn shadow_attributes(target: &Record, pre: Option<&Record>, post: &Record) -> Vec<(String, Value)> {
    post.attributes
        .iter()
        .filter(|(name, _)| !target.contains(name) && !pre.is_some_and(|p| p.contains(name)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::NoService;
    use plugsim_sandbox::{Ed25519Verifier, PermissionSet};
    use plugsim_types::{
        ColumnSet, EntityMetadata, ImageType, MetadataCatalog, RecordId, StepDeployment,
        StepImage, StepSubscription,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    fn boundary(name: &str) -> IsolationBoundary {
        IsolationBoundary::in_process(name, &[], Some(PermissionSet::full_trust()), &Ed25519Verifier::new())
            .unwrap()
    }

    fn catalog() -> Arc<dyn MetadataLookup> {
        Arc::new(MetadataCatalog::new().with(
            EntityMetadata::new("account")
                .primary_id("accountid")
                .attributes(["accountid", "name", "revenue", "modifiedon"]),
        ))
    }

    fn config(operation: Operation, stage: Stage, entity: &str) -> StepConfig {
        StepConfig::new(
            StepSubscription::new("Contoso.Recorder", stage, operation, entity),
            StepDeployment::new("recorder"),
        )
    }

    /// Trigger whose handler stores the context it saw.
    fn recording_trigger(config: StepConfig) -> (PluginTrigger, Arc<Mutex<Vec<ExecutionContext>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: StepHandler = Arc::new(move |local: &mut LocalPluginContext<'_>| {
            sink.lock().unwrap().push(local.context.clone());
            Ok(())
        });
        (PluginTrigger::new("Contoso.Recorder", config, handler, catalog()), seen)
    }

    fn fire(trigger: &PluginTrigger, event: &PluginEvent, ctx: &mut ExecutionContext) -> Result<bool, PluginError> {
        let host = boundary("host");
        let sandbox = boundary("sandbox");
        trigger.execute_if_match(
            event,
            ctx,
            &NoService,
            Boundaries {
                host: &host,
                sandbox: &sandbox,
            },
        )
    }

    #[test]
    fn other_entity_is_skipped() {
        let (trigger, seen) = recording_trigger(config(Operation::Create, Stage::PreOperation, "contact"));
        let event = PluginEvent::new(Operation::Create, Stage::PreOperation, Record::new("account"));
        assert!(!fire(&trigger, &event, &mut ExecutionContext::default()).unwrap());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn primary_id_is_stamped_on_a_copy() {
        let (trigger, seen) = recording_trigger(config(Operation::Create, Stage::PostOperation, "account"));
        let id = RecordId::new();
        let event = PluginEvent::new(
            Operation::Create,
            Stage::PostOperation,
            Record::with_id("account", id).with("name", "Contoso"),
        );
        assert!(fire(&trigger, &event, &mut ExecutionContext::default()).unwrap());

        let seen = seen.lock().unwrap();
        let record = seen[0].target.as_ref().and_then(Target::as_record).unwrap();
        assert_eq!(record.get("accountid"), Some(&json!(id.to_string())));
        assert!(!event.target.as_record().unwrap().contains("accountid"));
    }

    #[test]
    fn depth_over_limit_fails_before_running() {
        let (trigger, seen) = recording_trigger(config(Operation::Create, Stage::PreOperation, "account"));
        let event = PluginEvent::new(Operation::Create, Stage::PreOperation, Record::new("account"));
        let mut ctx = ExecutionContext::default().with_depth(9);
        assert!(matches!(
            fire(&trigger, &event, &mut ctx),
            Err(PluginError::InfiniteLoop { depth: 9 })
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn filter_requires_a_touched_attribute() {
        let mut cfg = config(Operation::Update, Stage::PreOperation, "account");
        cfg.deployment.filtered_attributes = ["revenue".to_string()].into();
        let (trigger, seen) = recording_trigger(cfg);

        let only_name = PluginEvent::new(
            Operation::Update,
            Stage::PreOperation,
            Record::with_id("account", RecordId::new()).with("name", "x"),
        );
        assert!(!fire(&trigger, &only_name, &mut ExecutionContext::default()).unwrap());

        let reference = PluginEvent::new(
            Operation::Update,
            Stage::PreOperation,
            Record::with_id("account", RecordId::new()).to_reference(),
        );
        assert!(!fire(&trigger, &reference, &mut ExecutionContext::default()).unwrap());

        let revenue = PluginEvent::new(
            Operation::Update,
            Stage::PreOperation,
            Record::with_id("account", RecordId::new()).with("revenue", 10),
        );
        assert!(fire(&trigger, &revenue, &mut ExecutionContext::default()).unwrap());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn shadow_attributes_satisfy_post_operation_filter() {
        let mut cfg = config(Operation::Update, Stage::PostOperation, "account");
        cfg.deployment.filtered_attributes = ["modifiedon".to_string()].into();
        let (trigger, seen) = recording_trigger(cfg);

        let id = RecordId::new();
        let target = Record::with_id("account", id).with("name", "new");
        let event = PluginEvent::new(Operation::Update, Stage::PostOperation, target.clone())
            .with_pre_image(Record::with_id("account", id).with("name", "old"))
            .with_post_image(
                Record::with_id("account", id)
                    .with("name", "new")
                    .with("modifiedon", "2026-10-16"),
            );

        assert!(fire(&trigger, &event, &mut ExecutionContext::default()).unwrap());
        let seen = seen.lock().unwrap();
        let record = seen[0].target.as_ref().and_then(Target::as_record).unwrap();
        assert_eq!(record.get("modifiedon"), Some(&json!("2026-10-16")));
        assert_eq!(event.target.as_record(), Some(&target));
    }

    #[test]
    fn entity_scoped_association_is_refused() {
        let (trigger, seen) = recording_trigger(config(Operation::Associate, Stage::PostOperation, "account"));
        let event = PluginEvent::new(
            Operation::Associate,
            Stage::PostOperation,
            Record::with_id("account", RecordId::new()).to_reference(),
        );
        let err = fire(&trigger, &event, &mut ExecutionContext::default()).unwrap_err();
        assert!(matches!(err, PluginError::ScopeViolation { ref entity, .. } if entity == "account"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn images_follow_type_and_stage() {
        let cfg = config(Operation::Update, Stage::PreOperation, "account")
            .with_image(StepImage::new("both", ImageType::Both, ColumnSet::All));
        let (pre_trigger, pre_seen) = recording_trigger(cfg);

        let id = RecordId::new();
        let pre = Record::with_id("account", id).with("name", "old").with("junk", 1);
        let post = Record::with_id("account", id).with("name", "new");
        let event = PluginEvent::new(Operation::Update, Stage::PreOperation, Record::with_id("account", id))
            .with_pre_image(pre.clone())
            .with_post_image(post.clone());
        assert!(fire(&pre_trigger, &event, &mut ExecutionContext::default()).unwrap());
        {
            let seen = pre_seen.lock().unwrap();
            let image = seen[0].pre_image("both").unwrap();
            assert_eq!(image.get("name"), Some(&json!("old")));
            // Not declared on the entity.
            assert!(!image.contains("junk"));
            assert!(seen[0].post_images.is_empty());
        }

        let cfg = config(Operation::Update, Stage::PostOperation, "account")
            .with_image(StepImage::new("both", ImageType::Both, ColumnSet::columns(["name"])));
        let (post_trigger, post_seen) = recording_trigger(cfg);
        let event = PluginEvent {
            stage: Stage::PostOperation,
            ..event
        };
        assert!(fire(&post_trigger, &event, &mut ExecutionContext::default()).unwrap());
        let seen = post_seen.lock().unwrap();
        assert_eq!(seen[0].post_image("both").unwrap().get("name"), Some(&json!("new")));
        assert!(seen[0].pre_image("both").is_some());
    }

    #[test]
    fn later_image_with_same_alias_wins() {
        let cfg = config(Operation::Update, Stage::PreOperation, "account")
            .with_image(StepImage::new("img", ImageType::PreImage, ColumnSet::columns(["name"])))
            .with_image(StepImage::new("img", ImageType::PreImage, ColumnSet::columns(["revenue"])));
        let (trigger, seen) = recording_trigger(cfg);

        let id = RecordId::new();
        let event = PluginEvent::new(Operation::Update, Stage::PreOperation, Record::with_id("account", id))
            .with_pre_image(Record::with_id("account", id).with("name", "n").with("revenue", 5));
        fire(&trigger, &event, &mut ExecutionContext::default()).unwrap();

        let seen = seen.lock().unwrap();
        let image = seen[0].pre_image("img").unwrap();
        assert!(image.contains("revenue"));
        assert!(!image.contains("name"));
    }

    #[test]
    fn post_image_is_not_attached_before_the_operation() {
        let cfg = config(Operation::Update, Stage::PreOperation, "account")
            .with_image(StepImage::new("after", ImageType::PostImage, ColumnSet::All));
        let (trigger, seen) = recording_trigger(cfg);

        let id = RecordId::new();
        let event = PluginEvent::new(Operation::Update, Stage::PreOperation, Record::with_id("account", id))
            .with_pre_image(Record::with_id("account", id).with("name", "old"))
            .with_post_image(Record::with_id("account", id).with("name", "new"));
        assert!(fire(&trigger, &event, &mut ExecutionContext::default()).unwrap());

        let seen = seen.lock().unwrap();
        assert!(seen[0].post_images.is_empty());
        assert!(seen[0].pre_images.is_empty());
    }

    #[test]
    fn post_image_is_attached_after_the_operation() {
        let cfg = config(Operation::Update, Stage::PostOperation, "account")
            .with_image(StepImage::new("after", ImageType::PostImage, ColumnSet::columns(["name"])));
        let (trigger, seen) = recording_trigger(cfg);

        let id = RecordId::new();
        let event = PluginEvent::new(Operation::Update, Stage::PostOperation, Record::with_id("account", id))
            .with_pre_image(Record::with_id("account", id).with("name", "old"))
            .with_post_image(Record::with_id("account", id).with("name", "new").with("revenue", 7));
        assert!(fire(&trigger, &event, &mut ExecutionContext::default()).unwrap());

        let seen = seen.lock().unwrap();
        let image = seen[0].post_image("after").unwrap();
        assert_eq!(image.get("name"), Some(&json!("new")));
        assert!(!image.contains("revenue"));
        // A post-image declaration never yields a pre-image.
        assert!(seen[0].pre_images.is_empty());
    }

    #[test]
    fn missing_post_image_attaches_nothing() {
        let cfg = config(Operation::Update, Stage::PostOperation, "account")
            .with_image(StepImage::new("after", ImageType::PostImage, ColumnSet::All));
        let (trigger, seen) = recording_trigger(cfg);

        let id = RecordId::new();
        let event = PluginEvent::new(Operation::Update, Stage::PostOperation, Record::with_id("account", id))
            .with_pre_image(Record::with_id("account", id).with("name", "old"));
        assert!(fire(&trigger, &event, &mut ExecutionContext::default()).unwrap());

        let seen = seen.lock().unwrap();
        assert!(seen[0].post_images.is_empty());
        assert!(seen[0].pre_images.is_empty());
    }

    #[test]
    fn pre_image_without_prior_state_attaches_nothing() {
        let cfg = config(Operation::Create, Stage::PostOperation, "account")
            .with_image(StepImage::new("before", ImageType::PreImage, ColumnSet::All));
        let (trigger, seen) = recording_trigger(cfg);

        let record = Record::with_id("account", RecordId::new()).with("name", "new");
        let event = PluginEvent::new(Operation::Create, Stage::PostOperation, record.clone())
            .with_post_image(record);
        assert!(fire(&trigger, &event, &mut ExecutionContext::default()).unwrap());

        let seen = seen.lock().unwrap();
        assert!(seen[0].pre_images.is_empty());
        assert!(seen[0].post_images.is_empty());
    }

    #[test]
    fn shared_variables_come_back_to_parent() {
        let handler: StepHandler = Arc::new(|local: &mut LocalPluginContext<'_>| {
            local.context.set_shared_variable("touched", true);
            local.trace("recorder ran");
            Ok(())
        });
        let trigger = PluginTrigger::new(
            "Contoso.Recorder",
            config(Operation::Create, Stage::PreOperation, ""),
            handler,
            catalog(),
        );
        let mut ctx = ExecutionContext::default();
        let event = PluginEvent::new(Operation::Create, Stage::PreOperation, Record::new("lead"));
        assert!(fire(&trigger, &event, &mut ctx).unwrap());
        assert_eq!(ctx.shared_variable("touched"), Some(&json!(true)));
        assert_eq!(ctx.trace_log, vec!["recorder ran".to_string()]);
    }
}
