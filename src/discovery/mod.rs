//! Discovery Engine (spec.md §4.3): lists resources for one
//! (account, service, region) unit, respecting the read-only guard, the
//! retry policy, and an optional circuit breaker.
//!
//! Grounded on `AWSProvider` in the teacher's `aion-cloud/src/providers/aws.rs`
//! (per-service client fields, `list_ec2_instances`/`list_s3_buckets`/
//! `list_lambda_functions` shape, tag extraction from typed SDK objects) and
//! on `optimized_discovery.py`'s per-service operation list.

pub mod predictor;

use crate::config::{CircuitBreakerConfig, RetryPolicy};
use crate::error::{InventoryError, Result};
use crate::guard;
use crate::mapper::{normalize, MapperRegistry};
use crate::model::ResourceRecord;
use aws_config::SdkConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One (account, service, region) unit of work (spec.md §5).
#[derive(Debug, Clone)]
pub struct DiscoveryUnit {
    pub account_id: String,
    pub service: String,
    pub region: String,
}

/// Per-(service, operation) failure tracker shared across all units in a
/// run. When `failure_threshold` consecutive failures are observed the
/// breaker opens and short-circuits further attempts for `cooldown`,
/// reverting to half-open (single probe) afterward (spec.md §5).
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    state: Mutex<HashMap<String, BreakerState>>,
}

#[derive(Debug, Clone)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        CircuitBreaker::default()
    }

    fn key(service: &str, operation: &str) -> String {
        format!("{service}:{operation}")
    }

    /// `true` if the breaker currently blocks calls for this key.
    pub fn is_open(&self, service: &str, operation: &str, cfg: &CircuitBreakerConfig) -> bool {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        let key = Self::key(service, operation);
        match state.get(&key) {
            Some(entry) if entry.consecutive_failures >= cfg.failure_threshold => {
                match entry.opened_at {
                    Some(opened_at) if opened_at.elapsed() < Duration::from_secs(cfg.cooldown_secs) => {
                        true
                    }
                    _ => {
                        // Cooldown elapsed: half-open, allow a single probe.
                        state.remove(&key);
                        false
                    }
                }
            }
            _ => false,
        }
    }

    pub fn record_success(&self, service: &str, operation: &str) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        state.remove(&Self::key(service, operation));
    }

    pub fn record_failure(&self, service: &str, operation: &str, cfg: &CircuitBreakerConfig) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        let entry = state.entry(Self::key(service, operation)).or_insert(BreakerState {
            consecutive_failures: 0,
            opened_at: None,
        });
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= cfg.failure_threshold {
            entry.opened_at = Some(Instant::now());
        }
    }
}

/// Shared early-termination heuristic (spec.md §5): once a region is known
/// to have returned zero resources for a service, later units for the same
/// (service, region) across accounts skip straight to a cheap existence
/// probe instead of the full listing call. Keyed by `"service:region"`.
#[derive(Debug, Default)]
pub struct SuccessfulOperations {
    seen_empty: Mutex<HashMap<String, bool>>,
}

impl SuccessfulOperations {
    pub fn new() -> Self {
        SuccessfulOperations::default()
    }

    fn key(service: &str, region: &str) -> String {
        format!("{service}:{region}")
    }

    pub fn mark_empty(&self, service: &str, region: &str) {
        self.seen_empty
            .lock()
            .expect("successful_operations mutex poisoned")
            .insert(Self::key(service, region), true);
    }

    pub fn mark_nonempty(&self, service: &str, region: &str) {
        self.seen_empty
            .lock()
            .expect("successful_operations mutex poisoned")
            .insert(Self::key(service, region), false);
    }

    pub fn previously_empty(&self, service: &str, region: &str) -> bool {
        self.seen_empty
            .lock()
            .expect("successful_operations mutex poisoned")
            .get(&Self::key(service, region))
            .copied()
            .unwrap_or(false)
    }
}

/// Retries `f` under `policy`, classifying each failure so permission and
/// validation errors fail fast while throttling and transient errors are
/// retried with backoff (spec.md §4.3 failure-mode table).
async fn with_retry<F, Fut>(
    policy: &RetryPolicy,
    service: &str,
    operation: &str,
    mut f: F,
) -> Result<Vec<Value>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<Vec<Value>, DiscoveryFailure>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(items) => return Ok(items),
            Err(DiscoveryFailure::PermissionDenied { region }) => {
                return Err(InventoryError::PermissionDenied {
                    service: service.to_string(),
                    operation: operation.to_string(),
                    region,
                });
            }
            Err(DiscoveryFailure::Throttled) | Err(DiscoveryFailure::Transient(_)) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(InventoryError::Throttled {
                        service: service.to_string(),
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }
}

enum DiscoveryFailure {
    PermissionDenied { region: String },
    Throttled,
    Transient(String),
}

/// Runs one discovery unit to completion, returning the normalized records
/// it found. Never returns an `Err` that should abort the whole run: a
/// failure for this unit is logged and surfaced as an empty result plus the
/// error, so callers can record a per-account warning without losing other
/// units' results (spec.md §4.3, §7 propagation policy).
pub async fn run_unit(
    unit: &DiscoveryUnit,
    sdk_config: &SdkConfig,
    registry: &MapperRegistry,
    retry_policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    breaker_cfg: &CircuitBreakerConfig,
    successful_ops: &SuccessfulOperations,
    page_cap: usize,
) -> (Vec<ResourceRecord>, Option<InventoryError>) {
    let mapper = match registry.get(&unit.service) {
        Some(m) => m,
        None => {
            return (
                vec![],
                Some(InventoryError::unexpected(
                    "discovery::run_unit",
                    format!("no mapper registered for service {}", unit.service),
                )),
            )
        }
    };

    let operation = mapper
        .operations
        .first()
        .cloned()
        .unwrap_or_else(|| "describe_resources".to_string());

    if !guard::is_read_only(&operation) {
        return (
            vec![],
            Some(InventoryError::unexpected(
                "discovery::run_unit",
                format!("operation {operation} is not read-only, refusing to call"),
            )),
        );
    }

    if breaker.is_open(&unit.service, &operation, breaker_cfg) {
        warn!(service = %unit.service, region = %unit.region, "circuit breaker open, skipping unit");
        return (
            vec![],
            Some(InventoryError::Throttled {
                service: unit.service.clone(),
                operation,
                attempts: 0,
            }),
        );
    }

    let span = tracing::info_span!("discovery_unit", account_id = %unit.account_id, service = %unit.service, region = %unit.region);
    let _enter = span.enter();

    let raw = with_retry(retry_policy, &unit.service, &operation, || {
        list_raw(sdk_config, &unit.service, &unit.region, page_cap)
    })
    .await;

    let raw = match raw {
        Ok(items) => {
            breaker.record_success(&unit.service, &operation);
            if items.is_empty() {
                successful_ops.mark_empty(&unit.service, &unit.region);
            } else {
                successful_ops.mark_nonempty(&unit.service, &unit.region);
            }
            items
        }
        Err(err) => {
            breaker.record_failure(&unit.service, &operation, breaker_cfg);
            warn!(error = %err, "discovery unit failed, continuing with empty result");
            return (vec![], Some(err));
        }
    };

    let mut seen = std::collections::HashSet::new();
    let mut records = Vec::with_capacity(raw.len());
    for payload in &raw {
        let resource_type = mapper
            .resource_types
            .first()
            .cloned()
            .unwrap_or_else(|| unit.service.clone());
        if let Some(record) = normalize(mapper, &unit.account_id, &unit.region, &resource_type, payload) {
            if seen.insert(record.dedup_key()) {
                records.push(record);
            }
        }
    }

    // spec.md §4.3: after the primary listing set is built, the Predictor
    // contributes implied resources the listing call didn't surface
    // directly, with any predictions colliding with a real record discarded.
    let predicted = predictor::reconcile(&records, predictor::predict(&records));
    records.extend(predicted);

    info!(count = records.len(), "discovery unit complete");
    (records, None)
}

/// Issues the actual provider call for `service` and converts the typed SDK
/// response into the raw JSON shape the [`crate::mapper`] layouts expect.
async fn list_raw(
    sdk_config: &SdkConfig,
    service: &str,
    region: &str,
    page_cap: usize,
) -> std::result::Result<Vec<Value>, DiscoveryFailure> {
    let region_config = sdk_config
        .clone()
        .into_builder()
        .region(aws_config::Region::new(region.to_string()))
        .build();

    match service {
        "EC2" => list_ec2_instances(&region_config, page_cap).await,
        "S3" => list_s3_buckets(&region_config).await,
        "Lambda" => list_lambda_functions(&region_config, page_cap).await,
        "IAM" => list_iam_roles(&region_config, page_cap).await,
        "RDS" => list_rds_instances(&region_config, page_cap).await,
        other => Err(DiscoveryFailure::Transient(format!("unsupported service {other}"))),
    }
}

fn classify_sdk_error<E: std::fmt::Display>(err: &E, region: &str) -> DiscoveryFailure {
    let message = err.to_string();
    if message.contains("AccessDenied") || message.contains("UnauthorizedOperation") {
        DiscoveryFailure::PermissionDenied {
            region: region.to_string(),
        }
    } else if message.contains("Throttling") || message.contains("RequestLimitExceeded") {
        DiscoveryFailure::Throttled
    } else {
        DiscoveryFailure::Transient(message)
    }
}

async fn list_ec2_instances(
    config: &SdkConfig,
    page_cap: usize,
) -> std::result::Result<Vec<Value>, DiscoveryFailure> {
    let client = aws_sdk_ec2::Client::new(config);
    let mut items = Vec::new();
    let mut next_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let mut request = client.describe_instances();
        if let Some(token) = &next_token {
            request = request.next_token(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, config.region().map(|r| r.as_ref()).unwrap_or("")))?;

        for reservation in response.reservations() {
            for instance in reservation.instances() {
                let tags: Vec<Value> = instance
                    .tags()
                    .iter()
                    .map(|t| json!({"Key": t.key().unwrap_or_default(), "Value": t.value().unwrap_or_default()}))
                    .collect();
                let name = instance
                    .tags()
                    .iter()
                    .find(|t| t.key() == Some("Name"))
                    .and_then(|t| t.value())
                    .unwrap_or_default();
                items.push(json!({
                    "InstanceId": instance.instance_id().unwrap_or_default(),
                    "Name": name,
                    "State": instance.state().and_then(|s| s.name()).map(|n| n.as_str()).unwrap_or_default(),
                    "VpcId": instance.vpc_id().unwrap_or_default(),
                    "SecurityGroups": instance.security_groups().iter().map(|g| json!({"GroupId": g.group_id().unwrap_or_default()})).collect::<Vec<_>>(),
                    "Tags": tags,
                    "LaunchTime": instance.launch_time().map(|t| t.to_string()),
                }));
            }
        }

        pages += 1;
        next_token = response.next_token().map(str::to_string);
        if next_token.is_none() || pages >= page_cap {
            break;
        }
    }

    Ok(items)
}

async fn list_s3_buckets(config: &SdkConfig) -> std::result::Result<Vec<Value>, DiscoveryFailure> {
    let client = aws_sdk_s3::Client::new(config);
    let response = client
        .list_buckets()
        .send()
        .await
        .map_err(|e| classify_sdk_error(&e, ""))?;

    let mut items = Vec::new();
    for bucket in response.buckets() {
        let name = bucket.name().unwrap_or_default().to_string();
        let tags = client
            .get_bucket_tagging()
            .bucket(&name)
            .send()
            .await
            .map(|resp| {
                resp.tag_set()
                    .iter()
                    .map(|t| json!({"Key": t.key(), "Value": t.value()}))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        items.push(json!({
            "Name": name,
            "TagSet": tags,
        }));
    }
    Ok(items)
}

async fn list_lambda_functions(
    config: &SdkConfig,
    page_cap: usize,
) -> std::result::Result<Vec<Value>, DiscoveryFailure> {
    let client = aws_sdk_lambda::Client::new(config);
    let mut items = Vec::new();
    let mut marker: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let mut request = client.list_functions();
        if let Some(m) = &marker {
            request = request.marker(m);
        }
        let response = request.send().await.map_err(|e| classify_sdk_error(&e, ""))?;

        for function in response.functions() {
            let arn = function.function_arn().unwrap_or_default().to_string();
            let tags = client
                .list_tags()
                .resource(&arn)
                .send()
                .await
                .map(|resp| resp.tags().cloned().unwrap_or_default())
                .unwrap_or_default();
            items.push(json!({
                "FunctionArn": arn,
                "FunctionName": function.function_name().unwrap_or_default(),
                "Tags": tags,
            }));
        }

        pages += 1;
        marker = response.next_marker().map(str::to_string);
        if marker.is_none() || pages >= page_cap {
            break;
        }
    }

    Ok(items)
}

async fn list_iam_roles(
    config: &SdkConfig,
    page_cap: usize,
) -> std::result::Result<Vec<Value>, DiscoveryFailure> {
    let client = aws_sdk_iam::Client::new(config);
    let mut items = Vec::new();
    let mut marker: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let mut request = client.list_roles();
        if let Some(m) = &marker {
            request = request.marker(m);
        }
        let response = request.send().await.map_err(|e| classify_sdk_error(&e, "global"))?;

        for role in response.roles() {
            items.push(json!({
                "RoleId": role.role_id(),
                "RoleName": role.role_name(),
                "Arn": role.arn(),
            }));
        }

        pages += 1;
        marker = response.marker().map(str::to_string);
        if !response.is_truncated() || marker.is_none() || pages >= page_cap {
            break;
        }
    }

    Ok(items)
}

async fn list_rds_instances(
    config: &SdkConfig,
    page_cap: usize,
) -> std::result::Result<Vec<Value>, DiscoveryFailure> {
    let client = aws_sdk_rds::Client::new(config);
    let mut items = Vec::new();
    let mut marker: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let mut request = client.describe_db_instances();
        if let Some(m) = &marker {
            request = request.marker(m);
        }
        let response = request.send().await.map_err(|e| classify_sdk_error(&e, ""))?;

        for db in response.db_instances() {
            let tags: Vec<Value> = db
                .tag_list()
                .iter()
                .map(|t| json!({"Key": t.key().unwrap_or_default(), "Value": t.value().unwrap_or_default()}))
                .collect();
            items.push(json!({
                "DBInstanceIdentifier": db.db_instance_identifier().unwrap_or_default(),
                "Arn": db.db_instance_arn().unwrap_or_default(),
                "Status": db.db_instance_status().unwrap_or_default(),
                "TagList": tags,
            }));
        }

        pages += 1;
        marker = response.marker().map(str::to_string);
        if marker.is_none() || pages >= page_cap {
            break;
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_breaker_opens_after_threshold_and_half_opens_after_cooldown() {
        let breaker = CircuitBreaker::new();
        let cfg = CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown_secs: 0,
        };
        assert!(!breaker.is_open("EC2", "describe_instances", &cfg));
        breaker.record_failure("EC2", "describe_instances", &cfg);
        assert!(!breaker.is_open("EC2", "describe_instances", &cfg));
        breaker.record_failure("EC2", "describe_instances", &cfg);
        // cooldown_secs == 0 so the breaker is immediately half-open again.
        assert!(!breaker.is_open("EC2", "describe_instances", &cfg));
    }

    #[test]
    fn successful_operations_tracks_emptiness_per_service_region() {
        let tracker = SuccessfulOperations::new();
        assert!(!tracker.previously_empty("EC2", "us-west-2"));
        tracker.mark_empty("EC2", "us-west-2");
        assert!(tracker.previously_empty("EC2", "us-west-2"));
        tracker.mark_nonempty("EC2", "us-west-2");
        assert!(!tracker.previously_empty("EC2", "us-west-2"));
    }

    // spec.md §4.3: the Predictor runs as part of the unit's record
    // assembly, the same reconcile-then-extend step `run_unit` performs.
    #[test]
    fn predicted_records_are_appended_to_the_primary_discovery_set() {
        use crate::model::{ComplianceStatus, DiscoveryMethod, ResourceRecord};
        use std::collections::BTreeMap;

        let instance = ResourceRecord {
            account_id: "1".into(),
            service: "EC2".into(),
            region: "us-east-1".into(),
            resource_type: "Instance".into(),
            resource_id: "i-1".into(),
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
            compliance_status: Option::<ComplianceStatus>::None,
        };

        let mut records = vec![instance];
        let predicted = predictor::reconcile(&records, predictor::predict(&records));
        assert!(!predicted.is_empty());
        records.extend(predicted);

        assert!(records
            .iter()
            .any(|r| r.discovery_method == Some(DiscoveryMethod::Prediction)));
    }
}
