//! Compliance Evaluator (spec.md §4.5): attaches a [`ComplianceStatus`] to
//! every consolidated record and produces a deterministic summary.

use crate::model::{ComplianceStatus, ResourceRecord};
use crate::policy::RuleSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub total_resources: usize,
    pub compliant_resources: usize,
    pub non_compliant_resources: usize,
    pub untagged_resources: usize,
    pub compliance_percentage: f64,
}

/// Classifies every record against `rules`, attaching `compliance_status`
/// in place, and returns the run-wide summary. Pure: identical inputs
/// always produce identical output (spec.md §8 determinism property).
pub fn evaluate(records: &mut [ResourceRecord], rules: &RuleSet) -> ComplianceSummary {
    let mut compliant = 0usize;
    let mut non_compliant = 0usize;
    let mut untagged = 0usize;

    for record in records.iter_mut() {
        let status = rules.classify(record);
        match &status {
            ComplianceStatus::Compliant => compliant += 1,
            ComplianceStatus::NonCompliant { .. } => non_compliant += 1,
            ComplianceStatus::Untagged => untagged += 1,
        }
        record.compliance_status = Some(status);
    }

    let total = records.len();
    let compliance_percentage = if total == 0 {
        0.0
    } else {
        (compliant as f64 / total as f64) * 100.0
    };

    ComplianceSummary {
        total_resources: total,
        compliant_resources: compliant,
        non_compliant_resources: non_compliant,
        untagged_resources: untagged,
        compliance_percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiscoveryMethod;
    use std::collections::BTreeMap;

    fn record(tags: &[(&str, &str)]) -> ResourceRecord {
        ResourceRecord {
            account_id: "1".into(),
            service: "EC2".into(),
            region: "us-east-1".into(),
            resource_type: "Instance".into(),
            resource_id: "i-x".into(),
            arn: None,
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
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

    // Scenario A's three-resource mix: 1 compliant, 1 non-compliant, 1
    // untagged out of 3 resources => 33.33%.
    #[test]
    fn three_resource_mix_yields_expected_percentage() {
        let rules = RuleSet::load(br#"{"required_tags": ["Environment", "Owner"]}"#).unwrap();
        let mut records = vec![
            record(&[("Environment", "production"), ("Owner", "team-a")]),
            record(&[("Environment", "production")]),
            record(&[]),
        ];
        let summary = evaluate(&mut records, &rules);
        assert_eq!(summary.total_resources, 3);
        assert_eq!(summary.compliant_resources, 1);
        assert_eq!(summary.non_compliant_resources, 1);
        assert_eq!(summary.untagged_resources, 1);
        assert!((summary.compliance_percentage - 33.333_333_333_333_33).abs() < 1e-9);
        assert!(records.iter().all(|r| r.compliance_status.is_some()));
    }

    #[test]
    fn empty_input_yields_zero_percentage_not_nan() {
        let rules = RuleSet::load(br#"{"required_tags": []}"#).unwrap();
        let mut records: Vec<ResourceRecord> = vec![];
        let summary = evaluate(&mut records, &rules);
        assert_eq!(summary.total_resources, 0);
        assert_eq!(summary.compliance_percentage, 0.0);
    }

    #[test]
    fn repeated_evaluation_is_deterministic() {
        let rules = RuleSet::load(br#"{"required_tags": ["Environment"]}"#).unwrap();
        let mut a = vec![record(&[("Environment", "prod")]), record(&[])];
        let mut b = a.clone();
        let summary_a = evaluate(&mut a, &rules);
        let summary_b = evaluate(&mut b, &rules);
        assert_eq!(summary_a, summary_b);
    }
}
