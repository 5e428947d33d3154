// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Pricing Engine: computes the floor price for a resource request and
//! checks a client's bid against it.

use crate::model::{bytes_to_gib, HardwareResource, PriceTable};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("invalid bid: {0}")]
    InvalidBid(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PricingEngine {
    price_table: PriceTable,
}

impl PricingEngine {
    pub fn new(price_table: PriceTable) -> Self {
        Self { price_table }
    }

    /// `floor = cpu*cpu_per_core + memGiB*mem_per_GiB + storageGiB*storage_per_GiB + gpu*gpu_per_unit`
    pub fn price(&self, req: &HardwareResource) -> f64 {
        let cpu_cost = req.cpu as f64 * self.price_table.cpu_per_core;
        let memory_cost = bytes_to_gib(req.memory) * self.price_table.memory_per_gib;
        let storage_cost = bytes_to_gib(req.storage) * self.price_table.storage_per_gib;
        let gpu_cost = req.gpu as f64 * self.price_table.gpu_per_unit;
        cpu_cost + memory_cost + storage_cost + gpu_cost
    }

    /// Accept iff `bid == 0` (charity/testing mode) or `bid >= floor`.
    /// Returns `(accepted, floor)`.
    pub fn check(&self, bid: &str, req: &HardwareResource) -> Result<(bool, f64), PricingError> {
        let floor = self.price(req);
        let bid_value: f64 = bid
            .trim()
            .parse()
            .map_err(|_| PricingError::InvalidBid(bid.to_string()))?;

        if bid_value == 0.0 {
            return Ok((true, floor));
        }
        Ok((bid_value >= floor, floor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PriceTable {
        PriceTable {
            cpu_per_core: 0.1,
            memory_per_gib: 0.01,
            storage_per_gib: 0.001,
            gpu_per_unit: 1.0,
        }
    }

    fn req() -> HardwareResource {
        HardwareResource {
            cpu: 4,
            memory: 8 * (1i64 << 30),
            storage: 20 * (1i64 << 30),
            gpu: 1,
            gpu_model: "H100".to_string(),
        }
    }

    #[test]
    fn floor_matches_formula() {
        let engine = PricingEngine::new(table());
        let floor = engine.price(&req());
        // 4*0.1 + 8*0.01 + 20*0.001 + 1*1.0 = 0.4 + 0.08 + 0.02 + 1.0 = 1.5
        assert!((floor - 1.5).abs() < 1e-9);
    }

    #[test]
    fn zero_bid_is_accepted() {
        let engine = PricingEngine::new(table());
        let (accepted, floor) = engine.check("0", &req()).unwrap();
        assert!(accepted);
        assert!((floor - 1.5).abs() < 1e-9);
    }

    #[test]
    fn bid_below_floor_is_rejected() {
        let engine = PricingEngine::new(table());
        let (accepted, _floor) = engine.check("1.0", &req()).unwrap();
        assert!(!accepted);
    }

    #[test]
    fn bid_at_or_above_floor_is_accepted() {
        let engine = PricingEngine::new(table());
        let (accepted, _floor) = engine.check("1.5", &req()).unwrap();
        assert!(accepted);
        let (accepted, _floor) = engine.check("2.0", &req()).unwrap();
        assert!(accepted);
    }

    #[test]
    fn malformed_bid_is_an_error() {
        let engine = PricingEngine::new(table());
        assert!(engine.check("not-a-number", &req()).is_err());
    }
}
