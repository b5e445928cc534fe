//! Delta Detector (spec.md §4.7): identity-key diff between two snapshots,
//! restricted to a configurable attribute whitelist for per-field changes.

use crate::model::ResourceRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedEntry {
    pub identity_key: String,
    pub changes: Vec<FieldChange>,
}

/// spec.md §3/§6: a delta references the two snapshots it was computed
/// between, and its part counts must satisfy
/// `|added| + |removed| + |modified| + unchanged_count == |union(keys1, keys2)|`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub snapshot_id_before: String,
    pub snapshot_id_after: String,
    pub added: Vec<ResourceRecord>,
    pub removed: Vec<ResourceRecord>,
    pub modified: Vec<ModifiedEntry>,
    pub unchanged_count: usize,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

fn field_value(record: &ResourceRecord, field: &str) -> serde_json::Value {
    match field {
        "tags" => serde_json::to_value(&record.tags).unwrap_or(serde_json::Value::Null),
        "status" | "state" => record
            .status
            .clone()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
        "security_groups" => {
            let set: BTreeSet<&String> = record.security_groups.iter().collect();
            serde_json::to_value(set).unwrap_or(serde_json::Value::Null)
        }
        "public_access" => record
            .public_access
            .map(serde_json::Value::Bool)
            .unwrap_or(serde_json::Value::Null),
        "encrypted" => record
            .encrypted
            .map(serde_json::Value::Bool)
            .unwrap_or(serde_json::Value::Null),
        "parent_resource" => record
            .parent_resource
            .clone()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
        "child_resources" => {
            let set: BTreeSet<&String> = record.child_resources.iter().collect();
            serde_json::to_value(set).unwrap_or(serde_json::Value::Null)
        }
        "dependencies" => {
            let set: BTreeSet<&String> = record.dependencies.iter().collect();
            serde_json::to_value(set).unwrap_or(serde_json::Value::Null)
        }
        _ => serde_json::Value::Null,
    }
}

/// Whole-record checksum used to decide whether a matched identity key is
/// "unchanged" (spec.md §3 invariant), independent of which fields happen
/// to be on `attribute_whitelist`.
fn record_checksum(record: &ResourceRecord) -> String {
    let canonical = serde_json::to_string(record).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compares two sets of records identity-key by identity-key, restricting
/// per-field diffs to `attribute_whitelist` (spec.md §4.7). Map-valued
/// fields (tags) and list-valued fields (security groups, etc.) are
/// compared structurally rather than by raw equality so reordering alone
/// never produces a spurious change. A matched key is "unchanged" based on
/// a full-record checksum, not merely on the whitelisted fields, so
/// `added + removed + modified + unchanged_count` always equals the size
/// of the union of both key sets.
pub fn compare(
    snapshot_id_before: &str,
    snapshot_id_after: &str,
    before: &[ResourceRecord],
    after: &[ResourceRecord],
    attribute_whitelist: &[String],
) -> Delta {
    let before_map: HashMap<String, &ResourceRecord> =
        before.iter().map(|r| (r.identity_key(), r)).collect();
    let after_map: HashMap<String, &ResourceRecord> =
        after.iter().map(|r| (r.identity_key(), r)).collect();

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut modified = Vec::new();
    let mut unchanged_count = 0usize;

    for (key, record) in &after_map {
        if !before_map.contains_key(key) {
            added.push((*record).clone());
        }
    }
    for (key, record) in &before_map {
        if !after_map.contains_key(key) {
            removed.push((*record).clone());
        }
    }

    let mut keys: Vec<&String> = before_map.keys().filter(|k| after_map.contains_key(*k)).collect();
    keys.sort();
    for key in keys {
        let before_record = before_map[key];
        let after_record = after_map[key];

        if record_checksum(before_record) == record_checksum(after_record) {
            unchanged_count += 1;
            continue;
        }

        let mut changes = Vec::new();
        for field in attribute_whitelist {
            let old_value = field_value(before_record, field);
            let new_value = field_value(after_record, field);
            if old_value != new_value {
                changes.push(FieldChange {
                    field: field.clone(),
                    old: old_value,
                    new: new_value,
                });
            }
        }
        modified.push(ModifiedEntry {
            identity_key: key.clone(),
            changes,
        });
    }

    added.sort_by(|a, b| a.identity_key().cmp(&b.identity_key()));
    removed.sort_by(|a, b| a.identity_key().cmp(&b.identity_key()));
    modified.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));

    Delta {
        snapshot_id_before: snapshot_id_before.to_string(),
        snapshot_id_after: snapshot_id_after.to_string(),
        added,
        removed,
        modified,
        unchanged_count,
    }
}

/// Map-diff helper giving tag-level add/remove/change granularity, used by
/// the changelog renderer to phrase tag field changes precisely instead of
/// dumping the whole before/after tag maps.
pub fn diff_tags(before: &BTreeMap<String, String>, after: &BTreeMap<String, String>) -> TagDiff {
    let mut added = BTreeMap::new();
    let mut removed = BTreeMap::new();
    let mut changed = BTreeMap::new();

    for (k, v) in after {
        match before.get(k) {
            None => {
                added.insert(k.clone(), v.clone());
            }
            Some(old) if old != v => {
                changed.insert(k.clone(), (old.clone(), v.clone()));
            }
            _ => {}
        }
    }
    for (k, v) in before {
        if !after.contains_key(k) {
            removed.insert(k.clone(), v.clone());
        }
    }

    TagDiff { added, removed, changed }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagDiff {
    pub added: BTreeMap<String, String>,
    pub removed: BTreeMap<String, String>,
    pub changed: BTreeMap<String, (String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiscoveryMethod;

    fn record(id: &str, tags: &[(&str, &str)]) -> ResourceRecord {
        ResourceRecord {
            account_id: "1".into(),
            service: "EC2".into(),
            region: "us-east-1".into(),
            resource_type: "Instance".into(),
            resource_id: id.into(),
            arn: None,
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            raw_data: serde_json::json!({}),
            name: None,
            status: None,
            created_at: None,
            modified_at: None,
            vpc_id: None,
            subnet_ids: vec![],
            security_groups: vec![],
            encrypted: None,
            public_access: None,
            parent_resource: None,
            child_resources: vec![],
            dependencies: vec![],
            confidence_score: 1.0,
            discovery_method: Some(DiscoveryMethod::Listing),
            source_account_name: None,
            compliance_status: None,
        }
    }

    const WHITELIST: &[&str] = &["tags", "status"];

    fn whitelist_vec() -> Vec<String> {
        WHITELIST.iter().map(|s| s.to_string()).collect()
    }

    // Scenario E (spec.md §8)
    #[test]
    fn detects_added_removed_and_modified() {
        let before = vec![record("i-1", &[("Environment", "prod")]), record("i-2", &[])];
        let after = vec![
            record("i-1", &[("Environment", "staging")]),
            record("i-3", &[]),
        ];
        let delta = compare("s1", "s2", &before, &after, &whitelist_vec());
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].resource_id, "i-3");
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].resource_id, "i-2");
        assert_eq!(delta.modified.len(), 1);
        assert_eq!(delta.modified[0].changes[0].field, "tags");
        assert_eq!(delta.snapshot_id_before, "s1");
        assert_eq!(delta.snapshot_id_after, "s2");
    }

    #[test]
    fn identical_snapshots_produce_empty_delta() {
        let records = vec![record("i-1", &[("Environment", "prod")])];
        let delta = compare("s1", "s1", &records, &records, &whitelist_vec());
        assert!(delta.is_empty());
    }

    #[test]
    fn tag_reordering_alone_is_not_a_change() {
        let r1 = record("i-1", &[("A", "1"), ("B", "2")]);
        let r2 = record("i-1", &[("B", "2"), ("A", "1")]);
        let delta = compare("s1", "s2", &[r1], &[r2], &whitelist_vec());
        assert!(delta.is_empty());
    }

    // §8 property 5: comparing a snapshot against itself yields
    // unchanged_count == |s| and no added/removed/modified entries.
    #[test]
    fn comparing_snapshot_to_itself_marks_everything_unchanged() {
        let records = vec![
            record("i-1", &[("Environment", "prod")]),
            record("i-2", &[]),
            record("i-3", &[("Owner", "team-a")]),
        ];
        let delta = compare("s1", "s1", &records, &records, &whitelist_vec());
        assert_eq!(delta.unchanged_count, records.len());
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
        assert!(delta.modified.is_empty());
    }

    // §8 property 4: delta completeness invariant.
    #[test]
    fn delta_parts_cover_the_full_key_union() {
        let before = vec![record("i-1", &[("Environment", "prod")]), record("i-2", &[])];
        let after = vec![
            record("i-1", &[("Environment", "staging")]),
            record("i-2", &[]),
            record("i-3", &[]),
        ];
        let delta = compare("s1", "s2", &before, &after, &whitelist_vec());

        let mut union = std::collections::HashSet::new();
        union.extend(before.iter().map(|r| r.identity_key()));
        union.extend(after.iter().map(|r| r.identity_key()));

        let total = delta.added.len() + delta.removed.len() + delta.modified.len() + delta.unchanged_count;
        assert_eq!(total, union.len());
    }

    #[test]
    fn field_change_serializes_as_old_new() {
        let change = FieldChange {
            field: "status".into(),
            old: serde_json::json!("running"),
            new: serde_json::json!("stopped"),
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value.get("old"), Some(&serde_json::json!("running")));
        assert_eq!(value.get("new"), Some(&serde_json::json!("stopped")));
        assert!(value.get("before").is_none());
    }

    #[test]
    fn diff_tags_classifies_added_removed_changed() {
        let before: BTreeMap<String, String> =
            [("A", "1"), ("B", "2")].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let after: BTreeMap<String, String> =
            [("A", "1"), ("B", "3"), ("C", "4")].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let diff = diff_tags(&before, &after);
        assert_eq!(diff.added.get("C"), Some(&"4".to_string()));
        assert_eq!(diff.changed.get("B"), Some(&("2".to_string(), "3".to_string())));
        assert!(diff.removed.is_empty());
    }
}
