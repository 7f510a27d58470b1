//! In-memory record engine for driving the dispatcher the way a real
//! pipeline would: one dispatch per stage, nested requests one level deeper.

#![allow(dead_code)]

use anyhow::anyhow;
use plugsim_host::{ExecutionContext, OrganizationService, PluginError, PluginEvent, PluginManager};
use plugsim_types::{
    ColumnSet, EntityMetadata, MetadataCatalog, MetadataLookup, Operation, Record, RecordId,
    RecordReference, Stage, Target,
};
use serde_json::{Value, json};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn catalog() -> Arc<dyn MetadataLookup> {
    Arc::new(
        MetadataCatalog::new()
            .with(
                EntityMetadata::new("account")
                    .primary_id("accountid")
                    .attributes(["accountid", "name", "revenue", "modifiedon", "parentaccountid"]),
            )
            .with(
                EntityMetadata::new("contact")
                    .primary_id("contactid")
                    .attributes(["contactid", "fullname", "parentcustomerid", "modifiedon"]),
            ),
    )
}

/// Shared, ordered log that handlers append to.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub struct RecordEngine<'m> {
    manager: &'m PluginManager,
    user: RecordId,
    records: RefCell<HashMap<RecordReference, Record>>,
    clock: Cell<u64>,
}

impl<'m> RecordEngine<'m> {
    pub fn new(manager: &'m PluginManager) -> Self {
        Self {
            manager,
            user: RecordId::new(),
            records: RefCell::new(HashMap::new()),
            clock: Cell::new(0),
        }
    }

    pub fn user(&self) -> RecordId {
        self.user
    }

    pub fn seed(&self, record: Record) -> RecordReference {
        let reference = record.to_reference();
        self.records.borrow_mut().insert(reference.clone(), record);
        reference
    }

    pub fn get(&self, reference: &RecordReference) -> Option<Record> {
        self.records.borrow().get(reference).cloned()
    }

    // Top-level requests, as a caller outside any pipeline would make them.

    pub fn create_top(&self, record: Record) -> Result<(RecordId, ExecutionContext), PluginError> {
        let mut ctx = ExecutionContext::new(self.user);
        let id = self.run_create(&mut ctx, record)?;
        Ok((id, ctx))
    }

    pub fn update_top(&self, record: Record) -> Result<ExecutionContext, PluginError> {
        let mut ctx = ExecutionContext::new(self.user);
        self.run_update(&mut ctx, record)?;
        Ok(ctx)
    }

    pub fn associate_top(
        &self,
        target: &RecordReference,
        related: &[RecordReference],
    ) -> Result<ExecutionContext, PluginError> {
        let mut ctx = ExecutionContext::new(self.user);
        self.run_association(&mut ctx, Operation::Associate, target, related)?;
        Ok(ctx)
    }

    fn stages(
        &self,
        ctx: &mut ExecutionContext,
        operation: &Operation,
        target: &Target,
        pre: Option<&Record>,
    ) -> Result<(), PluginError> {
        for stage in [Stage::PreValidation, Stage::PreOperation] {
            let mut event = PluginEvent::new(operation.clone(), stage, target.clone());
            event.pre_image = pre.cloned();
            self.manager.dispatch(&event, ctx, self)?;
        }
        Ok(())
    }

    fn post_stage(
        &self,
        ctx: &mut ExecutionContext,
        operation: &Operation,
        target: &Target,
        pre: Option<Record>,
        post: Option<Record>,
    ) -> Result<(), PluginError> {
        let event = PluginEvent {
            operation: operation.clone(),
            stage: Stage::PostOperation,
            target: target.clone(),
            pre_image: pre,
            post_image: post,
        };
        self.manager.dispatch(&event, ctx, self)?;
        Ok(())
    }

    fn tick(&self) -> Value {
        let next = self.clock.get() + 1;
        self.clock.set(next);
        json!(next)
    }

    pub fn run_create(&self, ctx: &mut ExecutionContext, mut record: Record) -> Result<RecordId, PluginError> {
        if record.id.is_empty() {
            record.id = RecordId::new();
        }
        let target = Target::Record(record.clone());
        self.stages(ctx, &Operation::Create, &target, None)?;

        self.seed(record.clone());
        self.post_stage(ctx, &Operation::Create, &target, None, Some(record.clone()))?;
        Ok(record.id)
    }

    pub fn run_update(&self, ctx: &mut ExecutionContext, record: Record) -> Result<(), PluginError> {
        let reference = record.to_reference();
        let pre = self
            .get(&reference)
            .ok_or_else(|| PluginError::Handler(anyhow!("{} {} does not exist", reference.logical_name, reference.id)))?;
        let target = Target::Record(record.clone());
        self.stages(ctx, &Operation::Update, &target, Some(&pre))?;

        let mut post = pre.clone();
        for (name, value) in &record.attributes {
            post.set(name.clone(), value.clone());
        }
        // Engine-maintained; never part of the request.
        post.set("modifiedon", self.tick());
        self.seed(post.clone());

        self.post_stage(ctx, &Operation::Update, &target, Some(pre), Some(post))
    }

    pub fn run_association(
        &self,
        ctx: &mut ExecutionContext,
        operation: Operation,
        target: &RecordReference,
        _related: &[RecordReference],
    ) -> Result<(), PluginError> {
        let target = Target::Reference(target.clone());
        self.stages(ctx, &operation, &target, None)?;
        self.post_stage(ctx, &operation, &target, None, None)
    }
}

impl OrganizationService for RecordEngine<'_> {
    fn create(&self, context: &mut ExecutionContext, record: Record) -> anyhow::Result<RecordId> {
        let mut nested = context.nested();
        let id = self.run_create(&mut nested, record)?;
        context.merge_from_child(&nested);
        Ok(id)
    }

    fn retrieve(
        &self,
        _context: &mut ExecutionContext,
        reference: &RecordReference,
        columns: &ColumnSet,
    ) -> anyhow::Result<Record> {
        let record = self
            .get(reference)
            .ok_or_else(|| anyhow!("{} {} does not exist", reference.logical_name, reference.id))?;
        let metadata = catalog();
        Ok(record.snapshot(columns, metadata.get_metadata(&reference.logical_name)))
    }

    fn update(&self, context: &mut ExecutionContext, record: Record) -> anyhow::Result<()> {
        let mut nested = context.nested();
        self.run_update(&mut nested, record)?;
        context.merge_from_child(&nested);
        Ok(())
    }

    fn delete(&self, _context: &mut ExecutionContext, reference: &RecordReference) -> anyhow::Result<()> {
        self.records
            .borrow_mut()
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| anyhow!("{} {} does not exist", reference.logical_name, reference.id))
    }

    fn associate(
        &self,
        context: &mut ExecutionContext,
        target: &RecordReference,
        _relationship: &str,
        related: &[RecordReference],
    ) -> anyhow::Result<()> {
        let mut nested = context.nested();
        self.run_association(&mut nested, Operation::Associate, target, related)?;
        context.merge_from_child(&nested);
        Ok(())
    }
}
