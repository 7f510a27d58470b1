use plugsim_types::{ColumnSet, EntityMetadata, Record, RecordId, Target};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

// ── Target ────────────────────────────────────────────────────────

#[test]
fn target_survives_serialization() {
    let target = Target::Record(
        Record::with_id("contact", RecordId::new())
            .with("firstname", "Ada")
            .with("numberofchildren", 2),
    );
    let json = serde_json::to_string(&target).unwrap();
    let back: Target = serde_json::from_str(&json).unwrap();
    assert_eq!(back, target);
}

#[test]
fn target_kind_tag_is_snake_case() {
    let value = serde_json::to_value(Target::Request("WhoAmI".into())).unwrap();
    assert_eq!(value, json!({"kind": "request", "value": "WhoAmI"}));
}

// ── Snapshots ─────────────────────────────────────────────────────

#[test]
fn snapshot_is_detached_from_source() {
    let mut record = Record::with_id("account", RecordId::new()).with("name", "Before");
    let snap = record.snapshot(&ColumnSet::All, None);
    record.set("name", "After");
    assert_eq!(snap.get("name"), Some(&json!("Before")));
}

#[test]
fn snapshot_of_missing_columns_is_empty() {
    let record = Record::new("account").with("name", "x");
    let snap = record.snapshot(&ColumnSet::columns(["telephone1"]), None);
    assert!(snap.attributes.is_empty());
    assert_eq!(snap.logical_name, "account");
}

#[test]
fn snapshot_primary_id_survives_narrow_column_set() {
    let id = RecordId::new();
    let record = Record::with_id("account", id)
        .with("accountid", json!(id))
        .with("name", "x");
    let meta = EntityMetadata::new("account").primary_id("accountid");
    let snap = record.snapshot(&ColumnSet::columns(["telephone1"]), Some(&meta));
    assert_eq!(snap.attribute_names().collect::<Vec<_>>(), vec!["accountid"]);
}

proptest! {
    /// Every attribute of a scoped snapshot was requested and present on the source.
    #[test]
    fn snapshot_only_contains_requested_present_columns(
        present in proptest::collection::btree_set("[a-e]", 0..5),
        requested in proptest::collection::btree_set("[a-e]", 0..5),
    ) {
        let mut record = Record::new("account");
        for name in &present {
            record.set(name.clone(), 1);
        }
        let columns = ColumnSet::columns(requested.iter().cloned());
        let snap = record.snapshot(&columns, None);
        for name in snap.attribute_names() {
            prop_assert!(present.contains(name));
            prop_assert!(requested.contains(name));
        }
        let expected = present.intersection(&requested).count();
        prop_assert_eq!(snap.attributes.len(), expected);
    }
}
