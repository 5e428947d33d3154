// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Node configuration: loaded once at startup from a TOML file with
//! environment-variable overrides, then injected into each component by
//! value. There is deliberately no process-wide global — see
//! [`resolver::ConfigResolver`] for the one piece of config that legitimately
//! changes after startup (which payment contract address is current).

pub mod resolver;

use crate::model::PriceTable;
use anyhow::{Context, Result};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cp_account_address: Address,
    pub edge_url: String,
    pub chain_rpc: String,
    pub task_payment_contract_address: Address,
    pub task_payment_created_block: i64,
    /// Contract address to use once the chain head passes
    /// `upgrade_activation_block`. See [`resolver::ConfigResolver`].
    #[serde(default)]
    pub task_payment_contract_address_upgrade: Option<Address>,
    #[serde(default)]
    pub upgrade_activation_block: Option<i64>,

    /// If `true` (the default, matching the source's contradictory but
    /// preserved behavior), pricing checks are skipped and any bid is
    /// accepted.
    #[serde(default = "default_pricing_enabled")]
    pub pricing_enabled: bool,
    #[serde(default)]
    pub price_table: PriceTable,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_resource_exporter_container")]
    pub resource_exporter_container: String,

    #[serde(default = "default_reconciler_interval_secs")]
    pub reconciler_interval_secs: u64,
    #[serde(default = "default_sweeper_interval_secs")]
    pub sweeper_interval_secs: u64,
    #[serde(default = "default_stale_block_threshold")]
    pub stale_block_threshold: i64,
}

fn default_pricing_enabled() -> bool {
    true
}
fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_db_path() -> String {
    "./cp-node.sqlite3".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_resource_exporter_container() -> String {
    "resource-exporter".to_string()
}
fn default_reconciler_interval_secs() -> u64 {
    15
}
fn default_sweeper_interval_secs() -> u64 {
    60
}
fn default_stale_block_threshold() -> i64 {
    5000
}

impl Config {
    /// Load from a TOML file, then apply `CP_NODE_*` environment overrides.
    /// Read once at process startup; never refreshed implicitly.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {:?}", path.as_ref()))?;
        let mut config: Config =
            toml::from_str(&raw).with_context(|| "parsing config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CP_NODE_EDGE_URL") {
            self.edge_url = v;
        }
        if let Ok(v) = std::env::var("CP_NODE_CHAIN_RPC") {
            self.chain_rpc = v;
        }
        if let Ok(v) = std::env::var("CP_NODE_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("CP_NODE_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("CP_NODE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("CP_NODE_PRICING_ENABLED") {
            self.pricing_enabled = v == "true" || v == "1";
        }
    }

    pub fn reconciler_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler_interval_secs)
    }

    pub fn sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper_interval_secs)
    }
}
