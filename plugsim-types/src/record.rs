//! Records, references and the targets a change event can carry.
//!
//! Attribute values are plain `serde_json::Value`s. Records cross the
//! isolation boundary by serialization, so everything here is `Serialize`.

use crate::RecordId;
use crate::metadata::EntityMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A record: logical name, id and an attribute map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    pub logical_name: String,
    pub id: RecordId,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record without an id.
    pub fn new(logical_name: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            id: RecordId::EMPTY,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_id(logical_name: impl Into<String>, id: RecordId) -> Self {
        Self {
            id,
            ..Self::new(logical_name)
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(attribute, value);
        self
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(attribute.into(), value.into());
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    pub fn remove(&mut self, attribute: &str) -> Option<Value> {
        self.attributes.remove(attribute)
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn to_reference(&self) -> RecordReference {
        RecordReference::new(self.logical_name.clone(), self.id)
    }

    /// Takes an immutable copy of this record limited to `columns`.
    ///
    /// With entity metadata at hand the primary-id attribute is always kept,
    /// and an "all columns" snapshot drops attributes the entity does not
    /// declare (when it declares any).
    pub fn snapshot(&self, columns: &ColumnSet, metadata: Option<&EntityMetadata>) -> Record {
        let primary_id = metadata.and_then(|m| m.primary_id_attribute.as_deref());
        let attributes = self
            .attributes
            .iter()
            .filter(|(name, _)| {
                if primary_id == Some(name.as_str()) {
                    return true;
                }
                if !columns.includes(name) {
                    return false;
                }
                match columns {
                    ColumnSet::All => metadata.is_none_or(|m| m.declares(name)),
                    ColumnSet::Columns(_) => true,
                }
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Record {
            logical_name: self.logical_name.clone(),
            id: self.id,
            attributes,
        }
    }
}

/// A pointer to a record by logical name and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordReference {
    pub logical_name: String,
    pub id: RecordId,
}

impl RecordReference {
    pub fn new(logical_name: impl Into<String>, id: RecordId) -> Self {
        Self {
            logical_name: logical_name.into(),
            id,
        }
    }
}

/// What a change event is about: a full record, a reference, or a bare request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    Record(Record),
    Reference(RecordReference),
    /// A request without a record target; the request name stands in for the logical name.
    Request(String),
}

impl Target {
    /// Logical name of the record, or the request name.
    pub fn logical_name(&self) -> &str {
        match self {
            Target::Record(r) => &r.logical_name,
            Target::Reference(r) => &r.logical_name,
            Target::Request(name) => name,
        }
    }

    /// Record id, or the empty id for requests.
    pub fn id(&self) -> RecordId {
        match self {
            Target::Record(r) => r.id,
            Target::Reference(r) => r.id,
            Target::Request(_) => RecordId::EMPTY,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Target::Record(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Record> for Target {
    fn from(record: Record) -> Self {
        Target::Record(record)
    }
}

impl From<RecordReference> for Target {
    fn from(reference: RecordReference) -> Self {
        Target::Reference(reference)
    }
}

/// Set of attributes to copy into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSet {
    #[default]
    All,
    Columns(BTreeSet<String>),
}

impl ColumnSet {
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Columns(columns.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, attribute: &str) -> bool {
        match self {
            Self::All => true,
            Self::Columns(cols) => cols.contains(attribute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account() -> Record {
        Record::with_id("account", RecordId::new())
            .with("name", "Contoso")
            .with("emailaddress1", "info@contoso.example")
            .with("accountid", json!("a"))
    }

    #[test]
    fn column_set_includes() {
        assert!(ColumnSet::All.includes("anything"));
        let cols = ColumnSet::columns(["name"]);
        assert!(cols.includes("name"));
        assert!(!cols.includes("emailaddress1"));
    }

    #[test]
    fn snapshot_scopes_columns() {
        let snap = account().snapshot(&ColumnSet::columns(["name"]), None);
        assert_eq!(snap.attribute_names().collect::<Vec<_>>(), vec!["name"]);
    }

    #[test]
    fn snapshot_keeps_primary_id_with_metadata() {
        let meta = EntityMetadata::new("account").primary_id("accountid");
        let snap = account().snapshot(&ColumnSet::columns(["name"]), Some(&meta));
        assert!(snap.contains("accountid"));
        assert!(snap.contains("name"));
        assert!(!snap.contains("emailaddress1"));
    }

    #[test]
    fn snapshot_all_drops_undeclared_attributes() {
        let meta = EntityMetadata::new("account")
            .primary_id("accountid")
            .attributes(["name"]);
        let snap = account().snapshot(&ColumnSet::All, Some(&meta));
        assert!(snap.contains("name"));
        assert!(snap.contains("accountid"));
        assert!(!snap.contains("emailaddress1"));
    }

    #[test]
    fn target_name_and_id() {
        let rec = account();
        let id = rec.id;
        assert_eq!(Target::from(rec.clone()).id(), id);
        assert_eq!(Target::from(rec.to_reference()).logical_name(), "account");
        let req = Target::Request("WhoAmI".into());
        assert_eq!(req.logical_name(), "WhoAmI");
        assert!(req.id().is_empty());
        assert!(req.as_record().is_none());
    }
}
