//! Thin wiring binary. The CLI surface itself (argument parsing, output
//! formatting, subcommands) is out of scope (SPEC_FULL.md §1); this binary
//! only demonstrates how the engine's pieces compose: load configuration
//! and a tag policy, run discovery across the configured accounts, evaluate
//! compliance, persist a snapshot, and diff against the previous one.

use cloud_bom_inventory::compliance;
use cloud_bom_inventory::config::RunConfig;
use cloud_bom_inventory::logging::{self, LoggingConfig};
use cloud_bom_inventory::orchestrator::{self, AccountSpec};
use cloud_bom_inventory::policy::RuleSet;
use cloud_bom_inventory::state::{delta, changelog, StateStore};
use std::collections::BTreeMap;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(&LoggingConfig::default())?;

    let config_path = std::env::var("INVENTORY_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let policy_path = std::env::var("INVENTORY_POLICY").unwrap_or_else(|_| "policy.yaml".to_string());
    let accounts_path = std::env::var("INVENTORY_ACCOUNTS").unwrap_or_else(|_| "accounts.json".to_string());

    let config = RunConfig::load(&config_path).unwrap_or_else(|_| RunConfig::default());

    let policy_bytes = std::fs::read(&policy_path)?;
    let rules = RuleSet::load(&policy_bytes)?;

    let accounts_bytes = std::fs::read(&accounts_path)?;
    let accounts: Vec<AccountSpec> = serde_json::from_slice(&accounts_bytes)?;

    let run = orchestrator::run(accounts, config.clone()).await;

    let mut records = run.consolidated_records;
    let summary = compliance::evaluate(&mut records, &rules);
    tracing::info!(?summary, partial_success = run.partial_success, "compliance evaluation complete");

    let store = StateStore::new(&config.state_dir, config.retention_days, config.max_snapshots)?;
    let account_ids: Vec<String> = run.accounts.iter().map(|a| a.account_id.clone()).collect();
    let new_state_id = store.save(
        records,
        account_ids,
        vec![],
        "listing".to_string(),
        Some(summary),
        BTreeMap::new(),
    )?;
    println!("saved snapshot {new_state_id}");

    let previous = store
        .list_states()?
        .into_iter()
        .filter(|m| m.state_id != new_state_id)
        .last();

    if let Some(previous) = previous {
        let (before, after) = store.comparison_data(&previous.state_id, &new_state_id)?;
        let computed = delta::compare(
            &previous.state_id,
            &new_state_id,
            &before.records,
            &after.records,
            &config.delta_attribute_whitelist,
        );
        println!("{}", changelog::render(&computed));
    } else {
        println!("no previous snapshot to diff against");
    }

    Ok(())
}
