// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Resolves the active task-payment contract address from current chain
//! height. Computed once at startup and on explicit reload — never on every
//! access, unlike the source's per-access global config refresh.

use crate::config::Config;
use ethers::types::Address;

#[derive(Debug, Clone, Copy)]
pub struct ConfigResolver {
    legacy: Address,
    upgrade: Option<Address>,
    activation_block: Option<i64>,
}

impl ConfigResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            legacy: config.task_payment_contract_address,
            upgrade: config.task_payment_contract_address_upgrade,
            activation_block: config.upgrade_activation_block,
        }
    }

    /// The contract address to scan for `TransferToCPBeneficiary` events at
    /// `current_block`. Falls back to the legacy address if no upgrade
    /// address is configured, or if the chain hasn't reached the activation
    /// block yet.
    pub fn resolve(&self, current_block: i64) -> Address {
        match (self.upgrade, self.activation_block) {
            (Some(upgrade), Some(activation)) if current_block >= activation => upgrade,
            _ => self.legacy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            cp_account_address: Address::zero(),
            edge_url: "http://edge".to_string(),
            chain_rpc: "http://rpc".to_string(),
            task_payment_contract_address: Address::repeat_byte(0x11),
            task_payment_created_block: 0,
            task_payment_contract_address_upgrade: None,
            upgrade_activation_block: None,
            pricing_enabled: true,
            price_table: Default::default(),
            listen_addr: "0.0.0.0:8080".to_string(),
            db_path: ":memory:".to_string(),
            log_level: "info".to_string(),
            resource_exporter_container: "resource-exporter".to_string(),
            reconciler_interval_secs: 15,
            sweeper_interval_secs: 60,
            stale_block_threshold: 5000,
        }
    }

    #[test]
    fn no_upgrade_always_legacy() {
        let config = base_config();
        let resolver = ConfigResolver::new(&config);
        assert_eq!(resolver.resolve(0), config.task_payment_contract_address);
        assert_eq!(
            resolver.resolve(i64::MAX),
            config.task_payment_contract_address
        );
    }

    #[test]
    fn switches_at_activation_block() {
        let mut config = base_config();
        let upgrade = Address::repeat_byte(0x22);
        config.task_payment_contract_address_upgrade = Some(upgrade);
        config.upgrade_activation_block = Some(1000);
        let resolver = ConfigResolver::new(&config);

        assert_eq!(resolver.resolve(999), config.task_payment_contract_address);
        assert_eq!(resolver.resolve(1000), upgrade);
        assert_eq!(resolver.resolve(2000), upgrade);
    }
}
