// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Core data model shared by the admission, executor, registry and
//! reconciler components: [`Job`], [`HardwareResource`], [`ResourceSnapshot`]
//! and [`ScanCursor`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a [`Job`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Failed,
    Removed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(JobStatus::Created),
            "running" => Some(JobStatus::Running),
            "failed" => Some(JobStatus::Failed),
            "removed" => Some(JobStatus::Removed),
            _ => None,
        }
    }
}

/// The hardware shape requested by a client for a single job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HardwareResource {
    pub cpu: i64,
    pub memory: i64,
    pub storage: i64,
    #[serde(default)]
    pub gpu: u32,
    #[serde(default)]
    pub gpu_model: String,
}

/// GPUs reported by the probe for a single product name, only those in
/// `Available` status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GpuGroup {
    pub count: u32,
    pub indices: Vec<String>,
}

/// Free-resource snapshot produced by the resource probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_free: i64,
    pub memory_free_gib: f64,
    pub storage_free_gib: f64,
    /// Keyed by GPU product name, upper-cased for case-insensitive lookup.
    pub gpus: HashMap<String, GpuGroup>,
}

impl ResourceSnapshot {
    /// Look up a GPU group by product name, case-insensitively.
    pub fn find_gpu(&self, model: &str) -> Option<&GpuGroup> {
        let needle = model.to_uppercase();
        self.gpus.get(&needle)
    }
}

/// The central, durable job entity. Owned exclusively by the job registry;
/// all mutations go through its `update_*`/`delete` methods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub uuid: String,
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub resource: HardwareResource,
    pub container_name: String,
    pub status: JobStatus,
    pub message: String,
    pub reward: f64,
    pub last_block_number: i64,
    /// GPU indices reserved for this job at admission time.
    pub reserved_gpu_indices: Vec<String>,
    pub create_time: i64,
}

impl Job {
    pub fn new(
        uuid: String,
        name: String,
        image: String,
        env: Vec<String>,
        resource: HardwareResource,
        reserved_gpu_indices: Vec<String>,
        create_time: i64,
    ) -> Self {
        Self {
            uuid,
            name,
            image,
            env,
            resource,
            container_name: String::new(),
            status: JobStatus::Created,
            message: String::new(),
            reward: 0.0,
            last_block_number: 0,
            reserved_gpu_indices,
            create_time,
        }
    }
}

/// Per-scanner bookmark into the chain's block stream. One row per scanner
/// kind (`ScannerKind::TaskPayment`, `ScannerKind::TaskManager`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum ScannerKind {
    TaskPayment = 1,
    TaskManager = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanCursor {
    pub scanner_id: i64,
    pub last_block: i64,
    pub updated_at: i64,
}

/// Per-resource unit prices, all positive decimals in native price units
/// per unit-time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceTable {
    pub cpu_per_core: f64,
    pub memory_per_gib: f64,
    pub storage_per_gib: f64,
    pub gpu_per_unit: f64,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            cpu_per_core: 0.0,
            memory_per_gib: 0.0,
            storage_per_gib: 0.0,
            gpu_per_unit: 0.0,
        }
    }
}

pub fn bytes_to_gib(bytes: i64) -> f64 {
    bytes as f64 / (1u64 << 30) as f64
}
