//! What a handler sees while it runs: its context, the organization
//! service it may call back into, and the domain it is running in.
//!
//! Handlers never hold the real service. They get a [`BoundaryService`]
//! that sends each call across the isolation boundary, where [`serve`]
//! runs it against the real service with the handler's context and sends
//! the updated context back.

use crate::context::ExecutionContext;
use anyhow::anyhow;
use plugsim_sandbox::{BoundaryError, DomainScope, Permission};
use plugsim_types::{ColumnSet, Record, RecordId, RecordReference, Target};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Data operations a handler can issue against the record engine.
///
/// Every call takes the calling handler's context so the engine can run
/// the nested pipeline one level deeper and fold its shared variables back.
pub trait OrganizationService {
    fn create(&self, context: &mut ExecutionContext, record: Record) -> anyhow::Result<RecordId>;

    fn retrieve(
        &self,
        context: &mut ExecutionContext,
        reference: &RecordReference,
        columns: &ColumnSet,
    ) -> anyhow::Result<Record>;

    fn update(&self, context: &mut ExecutionContext, record: Record) -> anyhow::Result<()>;

    fn delete(&self, context: &mut ExecutionContext, reference: &RecordReference) -> anyhow::Result<()>;

    fn associate(
        &self,
        _context: &mut ExecutionContext,
        _target: &RecordReference,
        relationship: &str,
        _related: &[RecordReference],
    ) -> anyhow::Result<()> {
        Err(anyhow!("associate '{relationship}' is not supported by this service"))
    }

    /// Executes a named request. Unsupported by default.
    fn execute(
        &self,
        _context: &mut ExecutionContext,
        request: &str,
        _parameters: Value,
    ) -> anyhow::Result<Value> {
        Err(anyhow!("request '{request}' is not supported by this service"))
    }
}

/// A service that refuses every call. For dispatching events whose
/// handlers never touch data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoService;

impl OrganizationService for NoService {
    fn create(&self, _: &mut ExecutionContext, record: Record) -> anyhow::Result<RecordId> {
        Err(anyhow!("no organization service: cannot create {}", record.logical_name))
    }

    fn retrieve(
        &self,
        _: &mut ExecutionContext,
        reference: &RecordReference,
        _: &ColumnSet,
    ) -> anyhow::Result<Record> {
        Err(anyhow!("no organization service: cannot retrieve {}", reference.logical_name))
    }

    fn update(&self, _: &mut ExecutionContext, record: Record) -> anyhow::Result<()> {
        Err(anyhow!("no organization service: cannot update {}", record.logical_name))
    }

    fn delete(&self, _: &mut ExecutionContext, reference: &RecordReference) -> anyhow::Result<()> {
        Err(anyhow!("no organization service: cannot delete {}", reference.logical_name))
    }
}

// ================================================================
// Calls across the boundary
// ================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
enum ServiceCall {
    Create {
        record: Record,
    },
    Retrieve {
        reference: RecordReference,
        columns: ColumnSet,
    },
    Update {
        record: Record,
    },
    Delete {
        reference: RecordReference,
    },
    Associate {
        target: RecordReference,
        relationship: String,
        related: Vec<RecordReference>,
    },
    Execute {
        request: String,
        parameters: Value,
    },
}

#[derive(Serialize, Deserialize)]
struct ServiceRequest {
    context: ExecutionContext,
    call: ServiceCall,
}

#[derive(Serialize, Deserialize)]
struct ServiceReply {
    context: ExecutionContext,
    output: Value,
}

/// The organization service as seen from inside a boundary.
pub(crate) struct BoundaryService<'a> {
    scope: &'a DomainScope<'a>,
}

impl<'a> BoundaryService<'a> {
    pub(crate) fn new(scope: &'a DomainScope<'a>) -> Self {
        Self { scope }
    }

    fn send<T: DeserializeOwned>(&self, context: &mut ExecutionContext, call: ServiceCall) -> anyhow::Result<T> {
        let request = serde_json::to_value(ServiceRequest {
            context: context.clone(),
            call,
        })?;
        let reply: ServiceReply = serde_json::from_value(self.scope.call_host(request)?)?;
        *context = reply.context;
        Ok(serde_json::from_value(reply.output)?)
    }
}

impl OrganizationService for BoundaryService<'_> {
    fn create(&self, context: &mut ExecutionContext, record: Record) -> anyhow::Result<RecordId> {
        self.send(context, ServiceCall::Create { record })
    }

    fn retrieve(
        &self,
        context: &mut ExecutionContext,
        reference: &RecordReference,
        columns: &ColumnSet,
    ) -> anyhow::Result<Record> {
        self.send(
            context,
            ServiceCall::Retrieve {
                reference: reference.clone(),
                columns: columns.clone(),
            },
        )
    }

    fn update(&self, context: &mut ExecutionContext, record: Record) -> anyhow::Result<()> {
        self.send(context, ServiceCall::Update { record })
    }

    fn delete(&self, context: &mut ExecutionContext, reference: &RecordReference) -> anyhow::Result<()> {
        self.send(
            context,
            ServiceCall::Delete {
                reference: reference.clone(),
            },
        )
    }

    fn associate(
        &self,
        context: &mut ExecutionContext,
        target: &RecordReference,
        relationship: &str,
        related: &[RecordReference],
    ) -> anyhow::Result<()> {
        self.send(
            context,
            ServiceCall::Associate {
                target: target.clone(),
                relationship: relationship.to_string(),
                related: related.to_vec(),
            },
        )
    }

    fn execute(&self, context: &mut ExecutionContext, request: &str, parameters: Value) -> anyhow::Result<Value> {
        self.send(
            context,
            ServiceCall::Execute {
                request: request.to_string(),
                parameters,
            },
        )
    }
}

/// Runs one call sent by a [`BoundaryService`] against the real service.
///
/// Errors from `service` are returned as they are, so the handler's caller
/// sees the service's own error type.
pub(crate) fn serve(service: &dyn OrganizationService, request: Value) -> anyhow::Result<Value> {
    let ServiceRequest { mut context, call } = serde_json::from_value(request)?;
    let output = match call {
        ServiceCall::Create { record } => serde_json::to_value(service.create(&mut context, record)?)?,
        ServiceCall::Retrieve { reference, columns } => {
            serde_json::to_value(service.retrieve(&mut context, &reference, &columns)?)?
        }
        ServiceCall::Update { record } => {
            service.update(&mut context, record)?;
            Value::Null
        }
        ServiceCall::Delete { reference } => {
            service.delete(&mut context, &reference)?;
            Value::Null
        }
        ServiceCall::Associate {
            target,
            relationship,
            related,
        } => {
            service.associate(&mut context, &target, &relationship, &related)?;
            Value::Null
        }
        ServiceCall::Execute { request, parameters } => service.execute(&mut context, &request, parameters)?,
    };
    Ok(serde_json::to_value(ServiceReply { context, output })?)
}

// ================================================================
// Handler view
// ================================================================

/// Per-invocation view passed to a handler.
pub struct LocalPluginContext<'a> {
    pub context: ExecutionContext,
    service: &'a dyn OrganizationService,
    scope: &'a DomainScope<'a>,
    step_name: &'a str,
}

impl<'a> LocalPluginContext<'a> {
    pub(crate) fn new(
        context: ExecutionContext,
        service: &'a dyn OrganizationService,
        scope: &'a DomainScope<'a>,
        step_name: &'a str,
    ) -> Self {
        Self {
            context,
            service,
            scope,
            step_name,
        }
    }

    pub fn service(&self) -> &'a dyn OrganizationService {
        self.service
    }

    pub fn scope(&self) -> &'a DomainScope<'a> {
        self.scope
    }

    /// Name of the step that matched. Unique per plugin type.
    pub fn step_name(&self) -> &'a str {
        self.step_name
    }

    pub fn target(&self) -> Option<&Target> {
        self.context.target.as_ref()
    }

    pub fn target_record(&self) -> Option<&Record> {
        self.target().and_then(Target::as_record)
    }

    pub fn pre_image(&self, alias: &str) -> Option<&Record> {
        self.context.pre_image(alias)
    }

    pub fn post_image(&self, alias: &str) -> Option<&Record> {
        self.context.post_image(alias)
    }

    pub fn demand(&self, permission: Permission) -> Result<(), BoundaryError> {
        self.scope.demand(permission)
    }

    /// Writes a line to the context's trace log.
    pub fn trace(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(step = %self.step_name, "{}", message);
        self.context.trace_log.push(message);
    }

    // Convenience wrappers that pass this handler's own context along.

    pub fn create(&mut self, record: Record) -> anyhow::Result<RecordId> {
        self.service.create(&mut self.context, record)
    }

    pub fn retrieve(&mut self, reference: &RecordReference, columns: &ColumnSet) -> anyhow::Result<Record> {
        self.service.retrieve(&mut self.context, reference, columns)
    }

    pub fn update(&mut self, record: Record) -> anyhow::Result<()> {
        self.service.update(&mut self.context, record)
    }

    pub fn delete(&mut self, reference: &RecordReference) -> anyhow::Result<()> {
        self.service.delete(&mut self.context, reference)
    }

    pub fn associate(
        &mut self,
        target: &RecordReference,
        relationship: &str,
        related: &[RecordReference],
    ) -> anyhow::Result<()> {
        self.service.associate(&mut self.context, target, relationship, related)
    }

    pub fn execute(&mut self, request: &str, parameters: Value) -> anyhow::Result<Value> {
        self.service.execute(&mut self.context, request, parameters)
    }

    pub fn into_context(self) -> ExecutionContext {
        self.context
    }
}
