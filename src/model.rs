//! Canonical resource record and related value types (SPEC_FULL.md / spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a record came to be in the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMethod {
    Listing,
    Prediction,
    EnumerateByTag,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Listing => "listing",
            DiscoveryMethod::Prediction => "prediction",
            DiscoveryMethod::EnumerateByTag => "enumerate-by-tag",
        }
    }
}

/// Outcome of classifying a record against a tag policy (§4.1, §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant { violations: Vec<String> },
    Untagged,
}

impl ComplianceStatus {
    pub fn is_compliant(&self) -> bool {
        matches!(self, ComplianceStatus::Compliant)
    }

    pub fn violations(&self) -> &[String] {
        match self {
            ComplianceStatus::NonCompliant { violations } => violations,
            _ => &[],
        }
    }
}

/// The canonical in-memory entity: a single cloud resource, normalized from a
/// vendor-specific listing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    // Required
    pub account_id: String,
    pub service: String,
    pub region: String,
    pub resource_type: String,
    pub resource_id: String,
    pub arn: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub raw_data: serde_json::Value,

    // Optional
    pub name: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub vpc_id: Option<String>,
    pub subnet_ids: Vec<String>,
    pub security_groups: Vec<String>,
    pub encrypted: Option<bool>,
    pub public_access: Option<bool>,
    pub parent_resource: Option<String>,
    pub child_resources: Vec<String>,
    pub dependencies: Vec<String>,
    pub confidence_score: f64,
    pub discovery_method: Option<DiscoveryMethod>,
    pub source_account_name: Option<String>,

    // Attached by the Compliance Evaluator (§4.5); absent until evaluated.
    pub compliance_status: Option<ComplianceStatus>,
}

impl ResourceRecord {
    /// `(account_id, service, region, resource_type, resource_id)` — unique
    /// within a single run's consolidated output after deduplication.
    pub fn dedup_key(&self) -> (String, String, String, String, String) {
        (
            self.account_id.clone(),
            self.service.clone(),
            self.region.clone(),
            self.resource_type.clone(),
            self.resource_id.clone(),
        )
    }

    /// Stable cross-run identity: ARN when present, else the composite key
    /// (§4.7 algorithm step 1; ties prefer ARN per step 5).
    pub fn identity_key(&self) -> String {
        match &self.arn {
            Some(arn) if !arn.is_empty() => arn.clone(),
            _ => format!(
                "{}:{}:{}:{}:{}",
                self.account_id, self.service, self.region, self.resource_type, self.resource_id
            ),
        }
    }

    /// Validates the invariants in spec.md §3. Called at the boundary between
    /// normalization and everything downstream; violating these is a bug in
    /// the Field Mapper, not a runtime condition callers should handle.
    pub fn validate_invariants(&self) -> Result<(), String> {
        if self.resource_id.is_empty() {
            return Err("resource_id must not be blank".into());
        }
        if self.region.is_empty() {
            return Err("region must not be empty".into());
        }
        if self.confidence_score < 1.0
            && self
                .discovery_method
                .map(|m| m.as_str().is_empty())
                .unwrap_or(true)
        {
            return Err("confidence_score < 1.0 requires a non-empty discovery_method".into());
        }
        Ok(())
    }
}
