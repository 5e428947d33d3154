// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chain client: wraps an EVM JSON-RPC provider, verifies the configured
//! chain id on connect, and decodes `TransferToCPBeneficiary` logs into
//! [`TransferEvent`]s for the reconciler.

use ethers::abi::{self, ParamType};
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Address, Filter, Log, H256, U256};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("too many requests")]
    TooManyRequests,
    #[error("chain RPC error: {0}")]
    Rpc(String),
    #[error("chain id mismatch: expected {expected}, got {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error("invalid RPC url: {0}")]
    InvalidUrl(String),
}

impl From<ProviderError> for ChainError {
    fn from(e: ProviderError) -> Self {
        if e.to_string().contains("Too Many Requests") {
            ChainError::TooManyRequests
        } else {
            ChainError::Rpc(e.to_string())
        }
    }
}

/// A single decoded `TransferToCPBeneficiary` event.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub task_uuid: String,
    pub account: Address,
    pub cp_account: Address,
    pub beneficiary: Address,
    pub transfer_amount: U256,
    pub block_number: u64,
    pub log_index: u64,
}

pub struct ChainClientConfig {
    pub rpc_url: String,
    pub chain_id: u64,
}

/// Thin wrapper over `ethers::providers::Provider<Http>`. Connection is
/// verified once at construction, matching the teacher's `Web3Client::new`.
pub struct ChainClient {
    provider: Provider<Http>,
}

impl ChainClient {
    pub async fn connect(config: ChainClientConfig) -> Result<Self, ChainError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| ChainError::InvalidUrl(e.to_string()))?
            .interval(Duration::from_millis(250));

        let chain_id = provider.get_chainid().await?;
        if chain_id.as_u64() != config.chain_id {
            return Err(ChainError::ChainIdMismatch {
                expected: config.chain_id,
                actual: chain_id.as_u64(),
            });
        }

        Ok(Self { provider })
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        let block = self.provider.get_block_number().await?;
        Ok(block.as_u64())
    }

    /// Fetches and decodes `TransferToCPBeneficiary` logs for `cp_account`
    /// in the half-open range `(from_block, to_block]`, ascending by
    /// `(block_number, log_index)`.
    pub async fn fetch_transfer_events(
        &self,
        contract_address: Address,
        cp_account: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, ChainError> {
        if from_block >= to_block {
            return Ok(Vec::new());
        }

        let topic0 = transfer_event_topic0();
        let cp_account_topic = H256::from(cp_account);

        let filter = Filter::new()
            .address(contract_address)
            .from_block(from_block + 1)
            .to_block(to_block)
            .topic0(topic0)
            .topic2(cp_account_topic);

        let logs = self.provider.get_logs(&filter).await?;

        let mut events: Vec<TransferEvent> = logs
            .into_iter()
            .filter_map(|log| match decode_transfer_log(&log) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable TransferToCPBeneficiary log");
                    None
                }
            })
            .collect();

        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }
}

fn transfer_event_topic0() -> H256 {
    H256::from_slice(&ethers::utils::keccak256(
        "TransferToCPBeneficiary(bytes32,address,address,address,uint256)",
    ))
}

/// `taskUUID` and `cpAccount` are indexed; `account`, `beneficiary`, and
/// `transferAmount` are ABI-encoded in the log data in declaration order.
fn decode_transfer_log(log: &Log) -> Result<TransferEvent, ChainError> {
    let task_uuid_topic = log
        .topics
        .get(1)
        .ok_or_else(|| ChainError::Rpc("log missing taskUUID topic".to_string()))?;
    let cp_account_topic = log
        .topics
        .get(2)
        .ok_or_else(|| ChainError::Rpc("log missing cpAccount topic".to_string()))?;
    let cp_account = Address::from(*cp_account_topic);

    let decoded = abi::decode(
        &[
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
        ],
        &log.data,
    )
    .map_err(|e| ChainError::Rpc(format!("failed to decode log data: {}", e)))?;

    let account = decoded[0]
        .clone()
        .into_address()
        .ok_or_else(|| ChainError::Rpc("decoded account was not an address".to_string()))?;
    let beneficiary = decoded[1]
        .clone()
        .into_address()
        .ok_or_else(|| ChainError::Rpc("decoded beneficiary was not an address".to_string()))?;
    let transfer_amount = decoded[2]
        .clone()
        .into_uint()
        .ok_or_else(|| ChainError::Rpc("decoded transferAmount was not a uint".to_string()))?;

    let block_number = log
        .block_number
        .ok_or_else(|| ChainError::Rpc("log missing block number".to_string()))?
        .as_u64();
    let log_index = log
        .log_index
        .ok_or_else(|| ChainError::Rpc("log missing log index".to_string()))?
        .as_u64();

    Ok(TransferEvent {
        task_uuid: bytes32_to_task_uuid(task_uuid_topic),
        account,
        cp_account,
        beneficiary,
        transfer_amount,
        block_number,
        log_index,
    })
}

/// Job uuids are encoded on-chain as their raw ASCII bytes, right-padded
/// with zeros to fill a `bytes32`. Falls back to the hex form if the topic
/// doesn't decode as printable ASCII (e.g. a hashed identifier).
fn bytes32_to_task_uuid(topic: &H256) -> String {
    let bytes = topic.as_bytes();
    let trimmed = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|last| &bytes[..=last])
        .unwrap_or(&[]);

    match std::str::from_utf8(trimmed) {
        Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => s.to_string(),
        _ => format!("0x{}", hex::encode(topic.as_bytes())),
    }
}

/// `wei / 1e18` as an `f64`, matching the source's `big.Float` division.
pub fn wei_to_float(amount: U256) -> f64 {
    if amount.is_zero() {
        return 0.0;
    }
    ethers::utils::format_units(amount, 18)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wei_to_float_converts_one_eth() {
        let amount = U256::from(10u64).pow(U256::from(18u64));
        assert!((wei_to_float(amount) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn wei_to_float_handles_zero() {
        assert_eq!(wei_to_float(U256::zero()), 0.0);
    }

    #[test]
    fn wei_to_float_converts_fractional_amount() {
        let amount = U256::from(2u64) * U256::from(10u64).pow(U256::from(18u64));
        assert!((wei_to_float(amount) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn task_uuid_decodes_ascii_payload() {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(b"T1234567");
        let topic = H256::from(bytes);
        assert_eq!(bytes32_to_task_uuid(&topic), "T1234567");
    }

    #[test]
    fn task_uuid_falls_back_to_hex_for_non_ascii() {
        let topic = H256::from_slice(&ethers::utils::keccak256("not-ascii-safe"));
        let result = bytes32_to_task_uuid(&topic);
        assert!(result.starts_with("0x"));
    }
}
