//! State Store (spec.md §4.6): content-addressed snapshot persistence with
//! retention enforcement and integrity validation.
//!
//! Grounded on `StateManager` as used in `state_manager_demo.py`:
//! `save_state`, `list_states`, `get_state_comparison_data`, `export_state`,
//! `validate_state_integrity`, `get_storage_stats` are all modeled on that
//! script's calls and return shapes.

pub mod changelog;
pub mod delta;

use crate::compliance::ComplianceSummary;
use crate::error::{InventoryError, Result};
use crate::model::ResourceRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub state_id: String,
    pub created_at: DateTime<Utc>,
    pub account_ids: Vec<String>,
    pub regions: Vec<String>,
    pub discovery_method: String,
    pub resource_count: usize,
    pub compliance_status: Option<ComplianceSummary>,
    pub tags: BTreeMap<String, String>,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub records: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_states: usize,
    pub total_size_bytes: u64,
    pub retention_days: u32,
    pub max_snapshots: usize,
    pub state_directory: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid_states: Vec<String>,
    pub invalid_states: Vec<String>,
    pub missing_files: Vec<String>,
    pub checksum_mismatches: Vec<String>,
}

/// Checksum is computed over the sorted record list only — not tags,
/// account ids, or run metadata (spec.md §4.6 checksum contract) — so two
/// snapshots with the same resources but different capture metadata are
/// recognized as identical.
fn canonical_checksum(records: &[ResourceRecord]) -> Result<String> {
    let mut sorted: Vec<&ResourceRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.identity_key().cmp(&b.identity_key()));
    let canonical = serde_json::to_string(&sorted).map_err(|e| {
        InventoryError::unexpected("state::canonical_checksum", e.to_string())
    })?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub struct StateStore {
    state_dir: PathBuf,
    retention_days: u32,
    max_snapshots: usize,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>, retention_days: u32, max_snapshots: usize) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir).map_err(|e| {
            InventoryError::unexpected("state::StateStore::new", e.to_string())
        })?;
        Ok(StateStore {
            state_dir,
            retention_days,
            max_snapshots,
        })
    }

    fn path_for(&self, state_id: &str) -> PathBuf {
        self.state_dir.join(format!("{state_id}.json"))
    }

    /// Persists a new snapshot. Idempotent: if an existing snapshot has the
    /// same content checksum, its id is returned without writing a
    /// duplicate file (spec.md §4.6).
    pub fn save(
        &self,
        records: Vec<ResourceRecord>,
        account_ids: Vec<String>,
        regions: Vec<String>,
        discovery_method: String,
        compliance_status: Option<ComplianceSummary>,
        tags: BTreeMap<String, String>,
    ) -> Result<String> {
        let checksum = canonical_checksum(&records)?;

        for existing in self.list_states()? {
            if existing.checksum == checksum {
                return Ok(existing.state_id);
            }
        }

        let state_id = uuid::Uuid::new_v4().to_string();
        let metadata = SnapshotMetadata {
            state_id: state_id.clone(),
            created_at: Utc::now(),
            account_ids,
            regions,
            discovery_method,
            resource_count: records.len(),
            compliance_status,
            tags,
            checksum,
        };
        let snapshot = Snapshot { metadata, records };

        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| {
            InventoryError::unexpected("state::StateStore::save", e.to_string())
        })?;
        std::fs::write(self.path_for(&state_id), bytes).map_err(|e| {
            InventoryError::unexpected("state::StateStore::save", e.to_string())
        })?;

        self.enforce_retention()?;
        Ok(state_id)
    }

    pub fn load(&self, state_id: &str) -> Result<Snapshot> {
        let path = self.path_for(state_id);
        let bytes = std::fs::read(&path).map_err(|_| InventoryError::CorruptSnapshot {
            snapshot_id: state_id.to_string(),
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|_| {
            InventoryError::CorruptSnapshot {
                snapshot_id: state_id.to_string(),
            }
        })?;
        let recomputed = canonical_checksum(&snapshot.records)?;
        if recomputed != snapshot.metadata.checksum {
            return Err(InventoryError::CorruptSnapshot {
                snapshot_id: state_id.to_string(),
            });
        }
        Ok(snapshot)
    }

    pub fn list_states(&self) -> Result<Vec<SnapshotMetadata>> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.state_dir).map_err(|e| {
            InventoryError::unexpected("state::StateStore::list_states", e.to_string())
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                InventoryError::unexpected("state::StateStore::list_states", e.to_string())
            })?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = std::fs::read(entry.path()) {
                if let Ok(snapshot) = serde_json::from_slice::<Snapshot>(&bytes) {
                    out.push(snapshot.metadata);
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Returns both full snapshots for a caller that wants to build a
    /// custom diff (SPEC_FULL.md §11, `get_state_comparison_data`).
    pub fn comparison_data(&self, state_id1: &str, state_id2: &str) -> Result<(Snapshot, Snapshot)> {
        Ok((self.load(state_id1)?, self.load(state_id2)?))
    }

    /// Exports a snapshot, always including the metadata envelope
    /// (SPEC_FULL.md §11).
    pub fn export(&self, state_id: &str, output_path: impl AsRef<Path>, format: ExportFormat) -> Result<()> {
        let snapshot = self.load(state_id)?;
        let bytes = match format {
            ExportFormat::Json => serde_json::to_vec_pretty(&snapshot).map_err(|e| {
                InventoryError::unexpected("state::StateStore::export", e.to_string())
            })?,
            ExportFormat::Yaml => serde_yaml::to_string(&snapshot)
                .map_err(|e| InventoryError::unexpected("state::StateStore::export", e.to_string()))?
                .into_bytes(),
        };
        std::fs::write(output_path, bytes).map_err(|e| {
            InventoryError::unexpected("state::StateStore::export", e.to_string())
        })
    }

    /// Verifies every on-disk snapshot's file is readable, parseable, and
    /// checksum-consistent (SPEC_FULL.md §11, `validate_state_integrity`).
    pub fn validate_integrity(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let entries = std::fs::read_dir(&self.state_dir).map_err(|e| {
            InventoryError::unexpected("state::StateStore::validate_integrity", e.to_string())
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                InventoryError::unexpected("state::StateStore::validate_integrity", e.to_string())
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let state_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();

            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(_) => {
                    report.missing_files.push(state_id);
                    continue;
                }
            };
            let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
                Ok(s) => s,
                Err(_) => {
                    report.invalid_states.push(state_id);
                    continue;
                }
            };
            let recomputed = canonical_checksum(&snapshot.records)?;
            if recomputed == snapshot.metadata.checksum {
                report.valid_states.push(state_id);
            } else {
                report.checksum_mismatches.push(state_id);
            }
        }
        Ok(report)
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let mut total_size = 0u64;
        let mut total_states = 0usize;
        let entries = std::fs::read_dir(&self.state_dir).map_err(|e| {
            InventoryError::unexpected("state::StateStore::storage_stats", e.to_string())
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                InventoryError::unexpected("state::StateStore::storage_stats", e.to_string())
            })?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            total_states += 1;
            if let Ok(meta) = entry.metadata() {
                total_size += meta.len();
            }
        }
        Ok(StorageStats {
            total_states,
            total_size_bytes: total_size,
            retention_days: self.retention_days,
            max_snapshots: self.max_snapshots,
            state_directory: self.state_dir.clone(),
        })
    }

    /// Prunes snapshots past `retention_days` or beyond `max_snapshots`,
    /// always keeping the most recent snapshot regardless of age or count
    /// (SPEC_FULL.md §13 open-question decision).
    fn enforce_retention(&self) -> Result<()> {
        let mut states = self.list_states()?;
        if states.len() <= 1 {
            return Ok(());
        }
        states.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let most_recent_id = states[0].state_id.clone();

        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days as i64);
        let mut to_delete = Vec::new();

        for (idx, state) in states.iter().enumerate() {
            if state.state_id == most_recent_id {
                continue;
            }
            let past_age_limit = state.created_at < cutoff;
            let past_count_limit = idx >= self.max_snapshots;
            if past_age_limit || past_count_limit {
                to_delete.push(state.state_id.clone());
            }
        }

        for state_id in to_delete {
            let _ = std::fs::remove_file(self.path_for(&state_id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ExportFormat {
    Json,
    Yaml,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiscoveryMethod;

    fn sample_record(id: &str) -> ResourceRecord {
        ResourceRecord {
            account_id: "1".into(),
            service: "EC2".into(),
            region: "us-east-1".into(),
            resource_type: "Instance".into(),
            resource_id: id.into(),
            arn: None,
            tags: BTreeMap::new(),
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

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("inventory-state-test-{name}-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = temp_dir("roundtrip");
        let store = StateStore::new(&dir, 90, 30).unwrap();
        let records = vec![sample_record("i-1"), sample_record("i-2")];
        let id = store
            .save(records.clone(), vec!["1".into()], vec!["us-east-1".into()], "listing".into(), None, BTreeMap::new())
            .unwrap();
        let loaded = store.load(&id).unwrap();
        assert_eq!(loaded.records.len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn save_is_idempotent_for_identical_content() {
        let dir = temp_dir("idempotent");
        let store = StateStore::new(&dir, 90, 30).unwrap();
        let records = vec![sample_record("i-1")];
        let id1 = store
            .save(records.clone(), vec![], vec![], "listing".into(), None, BTreeMap::new())
            .unwrap();
        let id2 = store
            .save(records, vec![], vec![], "listing".into(), None, BTreeMap::new())
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.list_states().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn validate_integrity_reports_valid_states() {
        let dir = temp_dir("integrity");
        let store = StateStore::new(&dir, 90, 30).unwrap();
        let id = store
            .save(vec![sample_record("i-1")], vec![], vec![], "listing".into(), None, BTreeMap::new())
            .unwrap();
        let report = store.validate_integrity().unwrap();
        assert_eq!(report.valid_states, vec![id]);
        assert!(report.checksum_mismatches.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn storage_stats_reflect_snapshot_count() {
        let dir = temp_dir("stats");
        let store = StateStore::new(&dir, 90, 30).unwrap();
        store
            .save(vec![sample_record("i-1")], vec![], vec![], "listing".into(), None, BTreeMap::new())
            .unwrap();
        let stats = store.storage_stats().unwrap();
        assert_eq!(stats.total_states, 1);
        assert_eq!(stats.retention_days, 90);
        std::fs::remove_dir_all(&dir).ok();
    }
}
