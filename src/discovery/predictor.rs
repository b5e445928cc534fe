//! Predictor (spec.md §4.3, §9): a single declarative rule table mapping a
//! discovered resource to resources it implies but that a listing call may
//! not have surfaced directly (e.g. an EC2 instance implies the security
//! groups it references). Predicted records carry `confidence_score < 1.0`
//! and are discarded wherever a real discovered record occupies the same
//! identity (spec.md §4.7 dedup step).

use crate::model::{ComplianceStatus, DiscoveryMethod, ResourceRecord};
use std::collections::BTreeMap;

/// One dependency rule: from a source (service, resource_type), predict a
/// target resource of (service, resource_type) named via `name_template`,
/// where `{id}` and `{name}` are substituted from the source record.
struct PredictionRule {
    source_service: &'static str,
    source_type: &'static str,
    target_service: &'static str,
    target_type: &'static str,
    name_template: &'static str,
    confidence: f64,
}

/// The consolidated rule table (spec.md §9 open question: "consolidated
/// into one table in discovery::predictor").
const RULES: &[PredictionRule] = &[
    PredictionRule {
        source_service: "EC2",
        source_type: "Instance",
        target_service: "EC2",
        target_type: "SecurityGroup",
        name_template: "{id}-security-group",
        confidence: 0.4,
    },
    PredictionRule {
        source_service: "Lambda",
        source_type: "Function",
        target_service: "IAM",
        target_type: "Role",
        name_template: "{name}-execution-role",
        confidence: 0.3,
    },
    PredictionRule {
        source_service: "RDS",
        source_type: "DBInstance",
        target_service: "EC2",
        target_type: "SecurityGroup",
        name_template: "{id}-db-security-group",
        confidence: 0.3,
    },
];

fn render_template(template: &str, id: &str, name: &str) -> String {
    template.replace("{id}", id).replace("{name}", name)
}

/// Generates predicted records for every source record that matches a rule.
/// Callers are responsible for discarding predictions whose identity key
/// collides with a real discovered record.
pub fn predict(source_records: &[ResourceRecord]) -> Vec<ResourceRecord> {
    let mut predicted = Vec::new();

    for record in source_records {
        for rule in RULES {
            if rule.source_service != record.service || rule.source_type != record.resource_type {
                continue;
            }

            let name = record.name.clone().unwrap_or_default();
            let target_id = render_template(rule.name_template, &record.resource_id, &name);
            let synthesized_arn = format!(
                "arn:predicted:{}:{}:{}:{}/{}",
                rule.target_service.to_lowercase(),
                record.region,
                record.account_id,
                rule.target_type.to_lowercase(),
                target_id
            );

            predicted.push(ResourceRecord {
                account_id: record.account_id.clone(),
                service: rule.target_service.to_string(),
                region: record.region.clone(),
                resource_type: rule.target_type.to_string(),
                resource_id: target_id.clone(),
                arn: Some(synthesized_arn),
                tags: BTreeMap::new(),
                raw_data: serde_json::json!({}),
                name: Some(target_id),
                status: None,
                created_at: None,
                modified_at: None,
                vpc_id: None,
                subnet_ids: vec![],
                security_groups: vec![],
                encrypted: None,
                public_access: None,
                parent_resource: Some(record.identity_key()),
                child_resources: vec![],
                dependencies: vec![],
                confidence_score: rule.confidence,
                discovery_method: Some(DiscoveryMethod::Prediction),
                source_account_name: record.source_account_name.clone(),
                compliance_status: Option::<ComplianceStatus>::None,
            });
        }
    }

    predicted
}

/// Removes predicted records whose identity key matches a real record's —
/// the real, listed record always wins (spec.md §4.7).
pub fn reconcile(real: &[ResourceRecord], predicted: Vec<ResourceRecord>) -> Vec<ResourceRecord> {
    let real_keys: std::collections::HashSet<String> =
        real.iter().map(|r| r.identity_key()).collect();
    predicted
        .into_iter()
        .filter(|p| !real_keys.contains(&p.identity_key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ec2_instance(id: &str) -> ResourceRecord {
        ResourceRecord {
            account_id: "1".into(),
            service: "EC2".into(),
            region: "us-east-1".into(),
            resource_type: "Instance".into(),
            resource_id: id.into(),
            arn: None,
            tags: BTreeMap::new(),
            raw_data: serde_json::json!({}),
            name: Some("web".into()),
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

    #[test]
    fn predicts_security_group_from_instance() {
        let instance = ec2_instance("i-1");
        let predicted = predict(&[instance]);
        assert_eq!(predicted.len(), 1);
        assert_eq!(predicted[0].service, "EC2");
        assert_eq!(predicted[0].resource_type, "SecurityGroup");
        assert!(predicted[0].confidence_score < 1.0);
        assert_eq!(predicted[0].discovery_method, Some(DiscoveryMethod::Prediction));
    }

    #[test]
    fn real_record_wins_over_predicted_collision() {
        let instance = ec2_instance("i-1");
        let predicted = predict(&[instance.clone()]);
        let mut real = vec![instance];
        real.push(predicted[0].clone());
        let reconciled = reconcile(&real, predicted);
        assert!(reconciled.is_empty());
    }
}
