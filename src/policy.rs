//! Policy Loader (spec.md §4.1, §6): parses a declarative tag policy and
//! classifies resource records against it.

use crate::error::{InventoryError, Result};
use crate::model::{ComplianceStatus, ResourceRecord};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A regex compiled with a bounded automaton size so a malformed or
/// adversarial pattern can't blow up compilation cost or memory (spec.md
/// §4.1: "Pattern regex evaluation must be bounded").
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

fn compile_bounded(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .map_err(|e| InventoryError::InvalidPolicy {
            message: format!("pattern '{pattern}' rejected: {e}"),
        })
}

/// A single required/optional tag rule, optionally constrained to an allowed
/// value set or a regex pattern.
#[derive(Debug, Clone)]
pub struct TagRule {
    pub key: String,
    pub allowed_values: Option<BTreeSet<String>>,
    pub pattern: Option<Regex>,
}

impl TagRule {
    fn matches_value(&self, value: &str) -> bool {
        if let Some(allowed) = &self.allowed_values {
            if !allowed.contains(value) {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(value) {
                return false;
            }
        }
        true
    }
}

/// Exemption: removes the listed tag keys from the required set when
/// `service`/`type` match and the record id matches `pattern`.
#[derive(Debug, Clone)]
pub struct Exemption {
    pub service: String,
    pub resource_type: String,
    pub id_pattern: Regex,
    pub exempt_tags: BTreeSet<String>,
}

impl Exemption {
    fn applies_to(&self, record: &ResourceRecord) -> bool {
        self.service.eq_ignore_ascii_case(&record.service)
            && self.resource_type.eq_ignore_ascii_case(&record.resource_type)
            && self.id_pattern.is_match(&record.resource_id)
    }
}

/// Per-service override that replaces the global required/optional sets.
#[derive(Debug, Clone, Default)]
pub struct ServiceOverride {
    pub required: Vec<TagRule>,
    pub optional: Vec<String>,
}

/// The in-memory, validated rule set produced by [`RuleSet::load`].
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub required: Vec<TagRule>,
    pub optional: Vec<String>,
    pub service_overrides: BTreeMap<String, ServiceOverride>,
    pub exemptions: Vec<Exemption>,
}

/// Raw wire representation of the policy document (spec.md §6 table).
/// Accepted as JSON or YAML; both deserialize through this same shape.
#[derive(Debug, Deserialize, Serialize)]
struct RawPolicy {
    #[serde(default)]
    required_tags: Vec<RawTagEntry>,
    #[serde(default)]
    optional_tags: Vec<String>,
    #[serde(default)]
    exemptions: Vec<RawExemption>,
    #[serde(default)]
    tag_patterns: BTreeMap<String, String>,
    #[serde(default)]
    service_specific_rules: BTreeMap<String, RawServiceRule>,
}

/// A `required_tags` entry: either a bare key, or `{key, values?, pattern?}`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum RawTagEntry {
    Bare(String),
    Detailed {
        key: String,
        #[serde(default)]
        values: Option<Vec<String>>,
        #[serde(default)]
        pattern: Option<String>,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct RawExemption {
    service: String,
    #[serde(rename = "type")]
    resource_type: String,
    pattern: String,
    exempt_tags: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct RawServiceRule {
    #[serde(default)]
    required_tags: Vec<RawTagEntry>,
    #[serde(default)]
    optional_tags: Vec<String>,
}

impl RuleSet {
    /// Parses a policy document (JSON or YAML, auto-detected) into a
    /// validated rule set, or fails with `InvalidPolicy`.
    pub fn load(bytes: &[u8]) -> Result<RuleSet> {
        let raw: RawPolicy = serde_json::from_slice(bytes)
            .or_else(|_| serde_yaml::from_slice(bytes))
            .map_err(|e| InventoryError::InvalidPolicy {
                message: format!("policy document is neither valid JSON nor YAML: {e}"),
            })?;

        // `tag_patterns` applies to required keys' values when present, on
        // top of whatever pattern a detailed entry already carries.
        let resolve_entry = |entry: &RawTagEntry,
                              tag_patterns: &BTreeMap<String, String>|
         -> Result<TagRule> {
            match entry {
                RawTagEntry::Bare(key) => {
                    let pattern = tag_patterns
                        .get(key)
                        .map(|p| compile_bounded(p))
                        .transpose()?;
                    Ok(TagRule {
                        key: key.clone(),
                        allowed_values: None,
                        pattern,
                    })
                }
                RawTagEntry::Detailed {
                    key,
                    values,
                    pattern,
                } => {
                    let allowed_values = values
                        .as_ref()
                        .map(|v| v.iter().cloned().collect::<BTreeSet<_>>());
                    let pattern = pattern
                        .as_deref()
                        .or_else(|| tag_patterns.get(key).map(|s| s.as_str()))
                        .map(compile_bounded)
                        .transpose()?;
                    Ok(TagRule {
                        key: key.clone(),
                        allowed_values,
                        pattern,
                    })
                }
            }
        };

        let required = raw
            .required_tags
            .iter()
            .map(|e| resolve_entry(e, &raw.tag_patterns))
            .collect::<Result<Vec<_>>>()?;

        if required.iter().any(|r| r.key.is_empty()) {
            return Err(InventoryError::InvalidPolicy {
                message: "required_tags entries must have a non-empty key".into(),
            });
        }

        let mut service_overrides = BTreeMap::new();
        for (service, rule) in &raw.service_specific_rules {
            let required = rule
                .required_tags
                .iter()
                .map(|e| resolve_entry(e, &raw.tag_patterns))
                .collect::<Result<Vec<_>>>()?;
            service_overrides.insert(
                service.clone(),
                ServiceOverride {
                    required,
                    optional: rule.optional_tags.clone(),
                },
            );
        }

        let mut exemptions = Vec::with_capacity(raw.exemptions.len());
        for e in &raw.exemptions {
            exemptions.push(Exemption {
                service: e.service.clone(),
                resource_type: e.resource_type.clone(),
                id_pattern: compile_bounded(&e.pattern)?,
                exempt_tags: e.exempt_tags.iter().cloned().collect(),
            });
        }

        Ok(RuleSet {
            required,
            optional: raw.optional_tags,
            service_overrides,
            exemptions,
        })
    }

    /// Tag keys exempted from the required set for this specific record.
    fn exempt_keys_for(&self, record: &ResourceRecord) -> BTreeSet<String> {
        self.exemptions
            .iter()
            .filter(|e| e.applies_to(record))
            .flat_map(|e| e.exempt_tags.iter().cloned())
            .collect()
    }

    /// Effective required rule set for this record: service override (if
    /// any) replaces the global set, then exemptions subtract keys.
    fn effective_required(&self, record: &ResourceRecord) -> Vec<TagRule> {
        let base = self
            .service_overrides
            .get(&record.service)
            .map(|o| o.required.clone())
            .unwrap_or_else(|| self.required.clone());

        let exempt = self.exempt_keys_for(record);
        base.into_iter().filter(|r| !exempt.contains(&r.key)).collect()
    }

    /// Pure classification function — no I/O (spec.md §4.1 algorithm).
    pub fn classify(&self, record: &ResourceRecord) -> ComplianceStatus {
        if record.tags.is_empty() {
            // Check coverage against the un-filtered required set: a key
            // only counts as "covered by an exemption" if it's actually
            // required and actually exempted, not merely absent from the
            // already-exemption-filtered effective set.
            let base_required = self
                .service_overrides
                .get(&record.service)
                .map(|o| o.required.clone())
                .unwrap_or_else(|| self.required.clone());
            let exempt = self.exempt_keys_for(record);
            let all_covered = base_required.iter().all(|r| exempt.contains(&r.key));
            return if all_covered {
                ComplianceStatus::Compliant
            } else {
                ComplianceStatus::Untagged
            };
        }

        let effective_required = self.effective_required(record);

        let mut violations = Vec::new();
        for rule in &effective_required {
            match record.tags.get(&rule.key) {
                None => violations.push(format!("missing:{}", rule.key)),
                Some(value) => {
                    if !rule.matches_value(value) {
                        violations.push(format!("pattern:{}", rule.key));
                    }
                }
            }
        }

        if violations.is_empty() {
            ComplianceStatus::Compliant
        } else {
            ComplianceStatus::NonCompliant { violations }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(service: &str, rtype: &str, id: &str, tags: &[(&str, &str)]) -> ResourceRecord {
        ResourceRecord {
            account_id: "1".into(),
            service: service.into(),
            region: "us-east-1".into(),
            resource_type: rtype.into(),
            resource_id: id.into(),
            arn: None,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
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
            discovery_method: None,
            source_account_name: None,
            compliance_status: None,
        }
    }

    // Scenario A (spec.md §8)
    #[test]
    fn scenario_a_single_account_happy_path() {
        let policy = br#"{"required_tags": ["Environment", "Owner"]}"#;
        let rules = RuleSet::load(policy).unwrap();

        let i1 = record("EC2", "Instance", "i-1", &[("Environment", "production"), ("Owner", "team-a")]);
        let b1 = record("S3", "Bucket", "bucket-1", &[("Environment", "production")]);
        let db1 = record("RDS", "DBInstance", "db-1", &[]);

        assert_eq!(rules.classify(&i1), ComplianceStatus::Compliant);
        assert_eq!(
            rules.classify(&b1),
            ComplianceStatus::NonCompliant {
                violations: vec!["missing:Owner".into()]
            }
        );
        assert_eq!(rules.classify(&db1), ComplianceStatus::Untagged);
    }

    // Scenario B
    #[test]
    fn scenario_b_exemption() {
        let policy = br#"{
            "required_tags": ["Environment", "Owner", "Role"],
            "exemptions": [
                {"service": "S3", "type": "Bucket", "pattern": ".*-logs$", "exempt_tags": ["Role"]}
            ]
        }"#;
        let rules = RuleSet::load(policy).unwrap();
        let r = record("S3", "Bucket", "access-logs", &[("Environment", "prod"), ("Owner", "ops")]);
        assert_eq!(rules.classify(&r), ComplianceStatus::Compliant);
    }

    #[test]
    fn fully_exempted_untagged_record_is_compliant() {
        let policy = br#"{
            "required_tags": ["Environment"],
            "exemptions": [
                {"service": "S3", "type": "Bucket", "pattern": ".*", "exempt_tags": ["Environment"]}
            ]
        }"#;
        let rules = RuleSet::load(policy).unwrap();
        let r = record("S3", "Bucket", "scratch-bucket", &[]);
        assert_eq!(rules.classify(&r), ComplianceStatus::Compliant);
    }

    #[test]
    fn partially_exempted_untagged_record_is_untagged() {
        let policy = br#"{
            "required_tags": ["Environment", "Owner"],
            "exemptions": [
                {"service": "S3", "type": "Bucket", "pattern": ".*", "exempt_tags": ["Environment"]}
            ]
        }"#;
        let rules = RuleSet::load(policy).unwrap();
        let r = record("S3", "Bucket", "scratch-bucket", &[]);
        assert_eq!(rules.classify(&r), ComplianceStatus::Untagged);
    }

    // Scenario C
    #[test]
    fn scenario_c_pattern_rejection() {
        let policy = br#"{
            "required_tags": [{"key": "Environment", "pattern": "^(production|staging|dev)$"}]
        }"#;
        let rules = RuleSet::load(policy).unwrap();
        let r = record("EC2", "Instance", "i-2", &[("Environment", "PRODUCTION")]);
        assert_eq!(
            rules.classify(&r),
            ComplianceStatus::NonCompliant {
                violations: vec!["pattern:Environment".into()]
            }
        );
    }

    #[test]
    fn service_override_replaces_global_required_set() {
        let policy = br#"{
            "required_tags": ["Environment"],
            "service_specific_rules": {
                "S3": {"required_tags": ["DataClassification"]}
            }
        }"#;
        let rules = RuleSet::load(policy).unwrap();
        let r = record("S3", "Bucket", "b-1", &[("Environment", "prod")]);
        assert_eq!(
            rules.classify(&r),
            ComplianceStatus::NonCompliant {
                violations: vec!["missing:DataClassification".into()]
            }
        );
    }

    #[test]
    fn determinism_across_repeated_runs() {
        let policy = br#"{"required_tags": ["Environment", "Owner"]}"#;
        let rules = RuleSet::load(policy).unwrap();
        let r = record("EC2", "Instance", "i-1", &[("Environment", "production")]);
        let first = rules.classify(&r);
        for _ in 0..50 {
            assert_eq!(rules.classify(&r), first);
        }
    }

    #[test]
    fn invalid_policy_document_rejected() {
        let err = RuleSet::load(b"not json and not : yaml: [").unwrap_err();
        assert!(matches!(err, InventoryError::InvalidPolicy { .. }));
    }
}
