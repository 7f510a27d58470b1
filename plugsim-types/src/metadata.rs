//! Entity metadata and step metadata supplied by the platform.

use crate::{
    Deployment, ExecutionMode, IsolationMode, Operation, RecordId, Stage, StepConfig,
    StepDeployment, StepSubscription,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// The slice of an entity's metadata the dispatcher needs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub logical_name: String,
    pub primary_id_attribute: Option<String>,
    /// Declared attributes. Empty means "unknown", which admits every attribute.
    #[serde(default)]
    pub attributes: BTreeSet<String>,
}

impl EntityMetadata {
    pub fn new(logical_name: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            primary_id_attribute: None,
            attributes: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn primary_id(mut self, attribute: impl Into<String>) -> Self {
        self.primary_id_attribute = Some(attribute.into());
        self
    }

    #[must_use]
    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes.extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn declares(&self, attribute: &str) -> bool {
        self.attributes.is_empty() || self.attributes.contains(attribute)
    }
}

/// Read access to the platform's metadata catalog.
pub trait MetadataLookup: Send + Sync {
    fn get_metadata(&self, logical_name: &str) -> Option<&EntityMetadata>;
}

impl MetadataLookup for HashMap<String, EntityMetadata> {
    fn get_metadata(&self, logical_name: &str) -> Option<&EntityMetadata> {
        self.get(logical_name)
    }
}

/// In-memory metadata catalog keyed by logical name.
#[derive(Debug, Clone, Default)]
pub struct MetadataCatalog {
    entities: HashMap<String, EntityMetadata>,
}

impl MetadataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty catalog. System steps are matched against this, so no id stamping happens.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metadata: EntityMetadata) {
        self.entities.insert(metadata.logical_name.clone(), metadata);
    }

    #[must_use]
    pub fn with(mut self, metadata: EntityMetadata) -> Self {
        self.insert(metadata);
        self
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl MetadataLookup for MetadataCatalog {
    fn get_metadata(&self, logical_name: &str) -> Option<&EntityMetadata> {
        self.entities.get(logical_name)
    }
}

impl FromIterator<EntityMetadata> for MetadataCatalog {
    fn from_iter<T: IntoIterator<Item = EntityMetadata>>(iter: T) -> Self {
        let mut catalog = Self::new();
        for metadata in iter {
            catalog.insert(metadata);
        }
        catalog
    }
}

/// Step registration as fetched from the platform, for plugins that carry
/// no explicit step configuration. Codes are the platform's raw values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaPlugin {
    /// Fully-qualified type name of the plugin the step belongs to.
    pub assembly_name: String,
    pub name: String,
    pub message_name: String,
    #[serde(default)]
    pub primary_entity: String,
    pub stage: i32,
    #[serde(default)]
    pub mode: i32,
    #[serde(default = "default_rank")]
    pub rank: i32,
    #[serde(default)]
    pub filtered_attributes: Option<String>,
    #[serde(default)]
    pub isolation_mode: i32,
}

fn default_rank() -> i32 {
    1
}

impl MetaPlugin {
    /// Builds the single step config this metadata describes: server-only
    /// deployment, calling-user context, no images.
    pub fn to_step_config(&self) -> crate::Result<StepConfig> {
        let operation: Operation = self.message_name.clone().into();
        let subscription = StepSubscription::new(
            self.assembly_name.clone(),
            Stage::from_code(self.stage)?,
            operation,
            self.primary_entity.clone(),
        );
        let deployment = StepDeployment {
            deployment: Deployment::ServerOnly,
            execution_mode: ExecutionMode::from_code(self.mode)?,
            name: self.name.clone(),
            execution_order: self.rank,
            filtered_attributes: StepDeployment::parse_filter(self.filtered_attributes.as_deref()),
            user_context: RecordId::EMPTY,
            isolation: IsolationMode::from_code(self.isolation_mode)?,
        };
        Ok(StepConfig::new(subscription, deployment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MetaPlugin {
        MetaPlugin {
            assembly_name: "Contoso.Plugins.AccountPostUpdate".into(),
            name: "AccountPostUpdate: Update of account".into(),
            message_name: "Update".into(),
            primary_entity: "account".into(),
            stage: 40,
            mode: 0,
            rank: 3,
            filtered_attributes: Some("name,emailaddress1".into()),
            isolation_mode: 2,
        }
    }

    #[test]
    fn meta_plugin_to_step_config() {
        let config = meta().to_step_config().unwrap();
        assert_eq!(config.subscription.operation, Operation::Update);
        assert_eq!(config.subscription.stage, Stage::PostOperation);
        assert_eq!(config.deployment.execution_order, 3);
        assert_eq!(config.deployment.deployment, Deployment::ServerOnly);
        assert_eq!(config.deployment.isolation, IsolationMode::Sandbox);
        assert_eq!(config.deployment.filtered_attributes.len(), 2);
        assert!(config.images.is_empty());
    }

    #[test]
    fn meta_plugin_rejects_unknown_stage() {
        let mut m = meta();
        m.stage = 30;
        assert!(m.to_step_config().is_err());
    }

    #[test]
    fn catalog_lookup() {
        let catalog: MetadataCatalog =
            [EntityMetadata::new("account").primary_id("accountid")].into_iter().collect();
        assert_eq!(
            catalog
                .get_metadata("account")
                .and_then(|m| m.primary_id_attribute.as_deref()),
            Some("accountid")
        );
        assert!(catalog.get_metadata("contact").is_none());
        assert!(MetadataCatalog::empty().is_empty());
    }

    #[test]
    fn declares_with_empty_attribute_list_admits_all() {
        let m = EntityMetadata::new("account");
        assert!(m.declares("anything"));
        let m = m.attributes(["name"]);
        assert!(m.declares("name"));
        assert!(!m.declares("other"));
    }
}
