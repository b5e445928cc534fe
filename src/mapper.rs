//! Field Mapper (spec.md §4.2): normalizes a vendor-specific listing payload
//! into a [`ResourceRecord`], and carries per-service discovery capability
//! metadata used by the Discovery Engine.
//!
//! Grounded on `OptimizedFieldMapper.optimized_service_patterns` in the
//! original Python (`inventag/discovery/optimized_discovery.py`), redesigned
//! per spec.md §9 as a typed registry (`ServiceMapper` structs in a
//! `HashMap`) instead of a runtime dict of dicts.

use crate::model::{DiscoveryMethod, ResourceRecord};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// How a service's raw payload represents tags. Redesigned per spec.md §9 as
/// a closed sum type rather than sniffing shapes ad hoc at call sites.
#[derive(Debug, Clone)]
pub enum TagLayout {
    /// `[{"Key": "...", "Value": "..."}, ...]` (EC2, RDS, Lambda style).
    KvList { key_field: String, value_field: String },
    /// A flat JSON object, `{"Environment": "prod", ...}` (S3 bucket
    /// tagging responses unwrapped by the caller, IAM).
    FlatMap,
    /// No tags surfaced by this service's listing call at all.
    None,
}

impl TagLayout {
    fn extract(&self, tags_value: Option<&Value>) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let Some(value) = tags_value else {
            return out;
        };
        match self {
            TagLayout::KvList { key_field, value_field } => {
                if let Some(items) = value.as_array() {
                    for item in items {
                        let k = item.get(key_field).and_then(Value::as_str);
                        let v = item.get(value_field).and_then(Value::as_str);
                        if let (Some(k), Some(v)) = (k, v) {
                            out.insert(k.to_string(), v.to_string());
                        }
                    }
                }
            }
            TagLayout::FlatMap => {
                if let Some(obj) = value.as_object() {
                    for (k, v) in obj {
                        if let Some(v) = v.as_str() {
                            out.insert(k.clone(), v.to_string());
                        }
                    }
                }
            }
            TagLayout::None => {}
        }
        out
    }
}

/// Per-service discovery capability record (spec.md §9 redesign flag: typed,
/// registered once, instead of scattered string checks at call sites).
#[derive(Debug, Clone)]
pub struct ServiceMapper {
    pub service: String,
    pub resource_types: Vec<String>,
    pub operations: Vec<String>,
    pub name_fields: Vec<String>,
    pub id_fields: Vec<String>,
    pub tag_field: String,
    pub tag_layout: TagLayout,
    pub region_dependent: bool,
    pub requires_region_detection: bool,
    pub exclude_aws_managed: bool,
    pub managed_patterns: Vec<Regex>,
}

impl ServiceMapper {
    fn is_managed(&self, name_or_id: &str) -> bool {
        if !self.exclude_aws_managed {
            return false;
        }
        const GLOBAL_PREFIXES: &[&str] = &["aws-", "AWS", "amazon-", "Amazon", "default", "Default"];
        if GLOBAL_PREFIXES.iter().any(|p| name_or_id.starts_with(p)) {
            return true;
        }
        self.managed_patterns.iter().any(|p| p.is_match(name_or_id))
    }
}

/// Registry of all known service mappers, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct MapperRegistry {
    services: HashMap<String, ServiceMapper>,
}

impl MapperRegistry {
    pub fn get(&self, service: &str) -> Option<&ServiceMapper> {
        self.services.get(service)
    }

    pub fn register(&mut self, mapper: ServiceMapper) {
        self.services.insert(mapper.service.clone(), mapper);
    }

    /// The fixed set of service mappers this engine ships with, grounded on
    /// `optimized_service_patterns`'s entries for ec2, s3, lambda, iam, rds.
    pub fn builtin() -> MapperRegistry {
        let mut reg = MapperRegistry::default();

        reg.register(ServiceMapper {
            service: "EC2".into(),
            resource_types: vec!["Instance".into(), "Volume".into(), "SecurityGroup".into()],
            operations: vec!["describe_instances".into(), "describe_volumes".into()],
            name_fields: vec!["Name".into()],
            id_fields: vec!["InstanceId".into(), "VolumeId".into(), "GroupId".into()],
            tag_field: "Tags".into(),
            tag_layout: TagLayout::KvList {
                key_field: "Key".into(),
                value_field: "Value".into(),
            },
            region_dependent: true,
            requires_region_detection: false,
            exclude_aws_managed: false,
            managed_patterns: vec![],
        });

        reg.register(ServiceMapper {
            service: "S3".into(),
            resource_types: vec!["Bucket".into()],
            operations: vec!["list_buckets".into(), "get_bucket_tagging".into()],
            name_fields: vec!["Name".into()],
            id_fields: vec!["Name".into()],
            tag_field: "TagSet".into(),
            tag_layout: TagLayout::KvList {
                key_field: "Key".into(),
                value_field: "Value".into(),
            },
            region_dependent: false,
            requires_region_detection: true,
            exclude_aws_managed: false,
            managed_patterns: vec![],
        });

        reg.register(ServiceMapper {
            service: "Lambda".into(),
            resource_types: vec!["Function".into()],
            operations: vec!["list_functions".into(), "list_tags".into()],
            name_fields: vec!["FunctionName".into()],
            id_fields: vec!["FunctionArn".into()],
            tag_field: "Tags".into(),
            tag_layout: TagLayout::FlatMap,
            region_dependent: true,
            requires_region_detection: false,
            exclude_aws_managed: false,
            managed_patterns: vec![],
        });

        reg.register(ServiceMapper {
            service: "IAM".into(),
            resource_types: vec!["Role".into(), "Policy".into(), "User".into()],
            operations: vec!["list_roles".into(), "list_policies".into(), "list_users".into()],
            name_fields: vec!["RoleName".into(), "PolicyName".into(), "UserName".into()],
            id_fields: vec!["RoleId".into(), "PolicyId".into(), "UserId".into()],
            tag_field: "Tags".into(),
            tag_layout: TagLayout::KvList {
                key_field: "Key".into(),
                value_field: "Value".into(),
            },
            region_dependent: false,
            requires_region_detection: false,
            exclude_aws_managed: true,
            managed_patterns: vec![
                Regex::new(r"^service-role/").expect("static pattern"),
                Regex::new(r"^AWSServiceRoleFor").expect("static pattern"),
            ],
        });

        reg.register(ServiceMapper {
            service: "RDS".into(),
            resource_types: vec!["DBInstance".into(), "DBCluster".into()],
            operations: vec!["describe_db_instances".into(), "describe_db_clusters".into()],
            name_fields: vec!["DBInstanceIdentifier".into(), "DBClusterIdentifier".into()],
            id_fields: vec!["DBInstanceIdentifier".into(), "DBClusterIdentifier".into()],
            tag_field: "TagList".into(),
            tag_layout: TagLayout::KvList {
                key_field: "Key".into(),
                value_field: "Value".into(),
            },
            region_dependent: true,
            requires_region_detection: false,
            exclude_aws_managed: false,
            managed_patterns: vec![],
        });

        reg
    }
}

/// Fixed confidence weights (spec.md §4.2), normalized by their sum (10.0).
const WEIGHT_ID: f64 = 2.5;
const WEIGHT_NAME: f64 = 2.0;
const WEIGHT_ARN: f64 = 1.5;
const WEIGHT_TYPE: f64 = 1.5;
const WEIGHT_TAGS: f64 = 1.0;
const WEIGHT_STATUS: f64 = 0.5;
const WEIGHT_CREATED: f64 = 0.5;
const WEIGHT_VPC: f64 = 0.5;
const WEIGHT_SG: f64 = 0.5;
const WEIGHT_ACCOUNT: f64 = 0.5;
const WEIGHT_TOTAL: f64 = WEIGHT_ID
    + WEIGHT_NAME
    + WEIGHT_ARN
    + WEIGHT_TYPE
    + WEIGHT_TAGS
    + WEIGHT_STATUS
    + WEIGHT_CREATED
    + WEIGHT_VPC
    + WEIGHT_SG
    + WEIGHT_ACCOUNT;

fn first_string_field(payload: &Value, fields: &[String]) -> Option<String> {
    fields
        .iter()
        .find_map(|f| payload.get(f).and_then(Value::as_str))
        .map(str::to_string)
}

/// Normalizes one raw listing entry into a [`ResourceRecord`] (spec.md §4.2).
pub fn normalize(
    mapper: &ServiceMapper,
    account_id: &str,
    region: &str,
    resource_type: &str,
    payload: &Value,
) -> Option<ResourceRecord> {
    let resource_id = first_string_field(payload, &mapper.id_fields)?;
    if mapper.is_managed(&resource_id) {
        return None;
    }

    let name = first_string_field(payload, &mapper.name_fields);
    if let Some(n) = &name {
        if mapper.is_managed(n) {
            return None;
        }
    }

    let arn = payload.get("Arn").and_then(Value::as_str).map(str::to_string);
    let tags = mapper.tag_layout.extract(payload.get(&mapper.tag_field));
    let status = payload
        .get("State")
        .and_then(Value::as_str)
        .or_else(|| payload.get("Status").and_then(Value::as_str))
        .map(str::to_string);
    let vpc_id = payload.get("VpcId").and_then(Value::as_str).map(str::to_string);
    let security_groups = payload
        .get("SecurityGroups")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|g| g.get("GroupId").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let created_at = payload
        .get("CreatedAt")
        .or_else(|| payload.get("LaunchTime"))
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));

    let mut present = 0.0;
    present += WEIGHT_ID;
    if name.is_some() {
        present += WEIGHT_NAME;
    }
    if arn.is_some() {
        present += WEIGHT_ARN;
    }
    present += WEIGHT_TYPE;
    if !tags.is_empty() {
        present += WEIGHT_TAGS;
    }
    if status.is_some() {
        present += WEIGHT_STATUS;
    }
    if created_at.is_some() {
        present += WEIGHT_CREATED;
    }
    if vpc_id.is_some() {
        present += WEIGHT_VPC;
    }
    if !security_groups.is_empty() {
        present += WEIGHT_SG;
    }
    present += WEIGHT_ACCOUNT;
    let confidence_score = present / WEIGHT_TOTAL;

    Some(ResourceRecord {
        account_id: account_id.to_string(),
        service: mapper.service.clone(),
        region: region.to_string(),
        resource_type: resource_type.to_string(),
        resource_id,
        arn,
        tags,
        raw_data: payload.clone(),
        name,
        status,
        created_at,
        modified_at: None,
        vpc_id,
        subnet_ids: vec![],
        security_groups,
        encrypted: payload.get("Encrypted").and_then(Value::as_bool),
        public_access: None,
        parent_resource: None,
        child_resources: vec![],
        dependencies: vec![],
        confidence_score,
        discovery_method: Some(DiscoveryMethod::Listing),
        source_account_name: None,
        compliance_status: None,
    })
}
