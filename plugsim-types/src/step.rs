//! Step descriptors: what a plugin subscribes to, how it is deployed, and
//! which images it wants.
//!
//! Numeric platform codes (stage 10/20/40, mode 0/1, ...) are accepted via
//! `from_code` so that metadata fetched from the platform maps onto the
//! same enums as explicitly configured steps.

use crate::record::ColumnSet;
use crate::{Error, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The kind of change event a step subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Retrieve,
    RetrieveMultiple,
    Associate,
    Disassociate,
    Assign,
    SetState,
    SetStateDynamicEntity,
    Merge,
    GrantAccess,
    ModifyAccess,
    RevokeAccess,
    Win,
    Lose,
    /// Registered against every message. Only reached by events dispatched with this operation.
    Any,
    /// Custom request (action) name.
    Custom(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Retrieve => "Retrieve",
            Self::RetrieveMultiple => "RetrieveMultiple",
            Self::Associate => "Associate",
            Self::Disassociate => "Disassociate",
            Self::Assign => "Assign",
            Self::SetState => "SetState",
            Self::SetStateDynamicEntity => "SetStateDynamicEntity",
            Self::Merge => "Merge",
            Self::GrantAccess => "GrantAccess",
            Self::ModifyAccess => "ModifyAccess",
            Self::RevokeAccess => "RevokeAccess",
            Self::Win => "Win",
            Self::Lose => "Lose",
            Self::Any => "Any",
            Self::Custom(name) => name,
        }
    }

    /// Associate and Disassociate can only be subscribed on any entity.
    pub fn is_association(&self) -> bool {
        matches!(self, Self::Associate | Self::Disassociate)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.to_ascii_lowercase().as_str() {
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "retrieve" => Self::Retrieve,
            "retrievemultiple" => Self::RetrieveMultiple,
            "associate" => Self::Associate,
            "disassociate" => Self::Disassociate,
            "assign" => Self::Assign,
            "setstate" => Self::SetState,
            "setstatedynamicentity" => Self::SetStateDynamicEntity,
            "merge" => Self::Merge,
            "grantaccess" => Self::GrantAccess,
            "modifyaccess" => Self::ModifyAccess,
            "revokeaccess" => Self::RevokeAccess,
            "win" => Self::Win,
            "lose" => Self::Lose,
            "any" | "anyoperation" => Self::Any,
            _ => Self::Custom(s.to_string()),
        };
        Ok(op)
    }
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(op) => op,
            Err(never) => match never {},
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

/// Point in the pipeline relative to the core data operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    PreValidation,
    PreOperation,
    PostOperation,
}

impl Stage {
    /// Maps platform stage codes (10, 20, 40).
    pub fn from_code(code: i32) -> crate::Result<Self> {
        match code {
            10 => Ok(Self::PreValidation),
            20 => Ok(Self::PreOperation),
            40 => Ok(Self::PostOperation),
            other => Err(Error::UnknownStage(other)),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::PreValidation => 10,
            Self::PreOperation => 20,
            Self::PostOperation => 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[default]
    Synchronous,
    /// Classification only; the engine does not queue asynchronous steps.
    Asynchronous,
}

impl ExecutionMode {
    pub fn from_code(code: i32) -> crate::Result<Self> {
        match code {
            0 => Ok(Self::Synchronous),
            1 => Ok(Self::Asynchronous),
            code => Err(Error::UnknownCode {
                kind: "execution mode",
                code,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Deployment {
    #[default]
    ServerOnly,
    OfflineOnly,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    PreImage,
    PostImage,
    Both,
}

impl ImageType {
    pub fn includes_pre(self) -> bool {
        matches!(self, Self::PreImage | Self::Both)
    }

    pub fn includes_post(self) -> bool {
        matches!(self, Self::PostImage | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationMode {
    #[default]
    None,
    Sandbox,
}

impl IsolationMode {
    /// Platform assembly isolation codes: 0/1 none, 2 sandbox.
    pub fn from_code(code: i32) -> crate::Result<Self> {
        match code {
            0 | 1 => Ok(Self::None),
            2 => Ok(Self::Sandbox),
            code => Err(Error::UnknownCode {
                kind: "isolation mode",
                code,
            }),
        }
    }
}

/// Which handler is bound to which (operation, stage, entity) trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSubscription {
    pub handler_id: String,
    pub stage: Stage,
    pub operation: Operation,
    /// Empty means any entity.
    #[serde(default)]
    pub entity_logical_name: String,
}

impl StepSubscription {
    pub fn new(
        handler_id: impl Into<String>,
        stage: Stage,
        operation: Operation,
        entity_logical_name: impl Into<String>,
    ) -> Self {
        Self {
            handler_id: handler_id.into(),
            stage,
            operation,
            entity_logical_name: entity_logical_name.into(),
        }
    }

    pub fn is_any_entity(&self) -> bool {
        self.entity_logical_name.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDeployment {
    #[serde(default)]
    pub deployment: Deployment,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    pub name: String,
    pub execution_order: i32,
    /// Empty means no filter.
    #[serde(default)]
    pub filtered_attributes: BTreeSet<String>,
    /// Empty id means "run as the calling user".
    #[serde(default)]
    pub user_context: RecordId,
    #[serde(default)]
    pub isolation: IsolationMode,
}

impl StepDeployment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            deployment: Deployment::ServerOnly,
            execution_mode: ExecutionMode::Synchronous,
            name: name.into(),
            execution_order: 1,
            filtered_attributes: BTreeSet::new(),
            user_context: RecordId::EMPTY,
            isolation: IsolationMode::None,
        }
    }

    /// Parses the platform's comma separated filtered-attribute list.
    pub fn parse_filter(attributes: Option<&str>) -> BTreeSet<String> {
        attributes
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepImage {
    pub name: String,
    pub alias: String,
    pub image_type: ImageType,
    #[serde(default)]
    pub attributes: ColumnSet,
}

impl StepImage {
    pub fn new(alias: impl Into<String>, image_type: ImageType, attributes: ColumnSet) -> Self {
        let alias = alias.into();
        Self {
            name: alias.clone(),
            alias,
            image_type,
            attributes,
        }
    }
}

/// Subscription, deployment and images of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    pub subscription: StepSubscription,
    pub deployment: StepDeployment,
    #[serde(default)]
    pub images: Vec<StepImage>,
}

impl StepConfig {
    pub fn new(subscription: StepSubscription, deployment: StepDeployment) -> Self {
        Self {
            subscription,
            deployment,
            images: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: StepImage) -> Self {
        self.images.push(image);
        self
    }
}
