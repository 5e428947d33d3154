// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Resource Probe: reads the stdout log of a co-located `resource-exporter`
//! container and turns it into a [`ResourceSnapshot`]. A missing or
//! unparseable sidecar is treated upstream as "no resources available", not
//! as a job failure — so the contract returns an error, never panics.

use crate::model::{GpuGroup, ResourceSnapshot};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("resource-exporter sidecar unavailable: {0}")]
    SidecarUnavailable(String),
    #[error("failed to parse resource-exporter output: {0}")]
    ParseError(String),
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn snapshot(&self) -> Result<ResourceSnapshot, ProbeError>;
}

/// Raw shape emitted by the sidecar, before unit conversion.
#[derive(Debug, Deserialize)]
struct RawNodeResource {
    cpu: RawCpu,
    memory: RawQuantity,
    storage: RawQuantity,
    gpu: RawGpu,
}

#[derive(Debug, Deserialize)]
struct RawCpu {
    free: String,
}

#[derive(Debug, Deserialize)]
struct RawQuantity {
    free: String,
}

#[derive(Debug, Deserialize)]
struct RawGpu {
    #[serde(default)]
    details: Vec<RawGpuDetail>,
}

#[derive(Debug, Deserialize)]
struct RawGpuDetail {
    product_name: String,
    index: String,
    status: String,
}

/// Parses a `"<float> <unit>"` string into GiB. Unlike the upstream source
/// (which always treats the numeric prefix as GiB regardless of the unit
/// suffix), the unit is parsed and converted — see Open Question 1 in
/// SPEC_FULL.md §4.1. A bare number with no unit is assumed to already be
/// GiB, for compatibility with exporters that omit units.
pub fn parse_quantity_to_gib(raw: &str) -> Result<f64, ProbeError> {
    let trimmed = raw.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let number_part = parts
        .next()
        .ok_or_else(|| ProbeError::ParseError(format!("empty quantity: {:?}", raw)))?;
    let unit_part = parts.next().unwrap_or("").trim().to_lowercase();

    let value: f64 = number_part
        .parse()
        .map_err(|_| ProbeError::ParseError(format!("not a number: {:?}", raw)))?;

    let gib = match unit_part.as_str() {
        "" | "gib" | "gi" | "g" => value,
        "tib" | "ti" | "t" => value * 1024.0,
        "mib" | "mi" | "m" => value / 1024.0,
        "kib" | "ki" | "k" => value / (1024.0 * 1024.0),
        other => {
            return Err(ProbeError::ParseError(format!(
                "unrecognized unit {:?} in quantity {:?}",
                other, raw
            )))
        }
    };
    Ok(gib)
}

fn parse_snapshot(raw_json: &str) -> Result<ResourceSnapshot, ProbeError> {
    let raw: RawNodeResource = serde_json::from_str(raw_json)
        .map_err(|e| ProbeError::ParseError(format!("invalid JSON: {}", e)))?;

    let cpu_free: i64 = raw
        .cpu
        .free
        .trim()
        .parse()
        .map_err(|_| ProbeError::ParseError(format!("invalid cpu.free: {:?}", raw.cpu.free)))?;

    let memory_free_gib = parse_quantity_to_gib(&raw.memory.free)?;
    let storage_free_gib = parse_quantity_to_gib(&raw.storage.free)?;

    let mut gpus: HashMap<String, GpuGroup> = HashMap::new();
    for detail in raw.gpu.details {
        if detail.status != "Available" {
            continue;
        }
        let key = detail.product_name.to_uppercase();
        let entry = gpus.entry(key).or_insert_with(GpuGroup::default);
        entry.count += 1;
        entry.indices.push(detail.index);
    }

    Ok(ResourceSnapshot {
        cpu_free,
        memory_free_gib,
        storage_free_gib,
        gpus,
    })
}

/// Production [`ResourceProbe`] backed by the container daemon: reads the
/// stdout log of the `resource-exporter` sidecar container.
pub struct DockerResourceProbe {
    docker: bollard::Docker,
    container_name: String,
}

impl DockerResourceProbe {
    pub fn new(docker: bollard::Docker, container_name: impl Into<String>) -> Self {
        Self {
            docker,
            container_name: container_name.into(),
        }
    }

    async fn read_log(&self) -> Result<String, ProbeError> {
        use bollard::container::LogsOptions;
        use futures_util::StreamExt;

        let mut stream = self.docker.logs(
            &self.container_name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: false,
                tail: "1".to_string(),
                ..Default::default()
            }),
        );

        let mut last_line = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => last_line = output.to_string(),
                Err(e) => {
                    return Err(ProbeError::SidecarUnavailable(format!(
                        "failed to read logs for {}: {}",
                        self.container_name, e
                    )))
                }
            }
        }

        if last_line.trim().is_empty() {
            return Err(ProbeError::SidecarUnavailable(format!(
                "no output from {}",
                self.container_name
            )));
        }
        Ok(last_line)
    }
}

#[async_trait]
impl ResourceProbe for DockerResourceProbe {
    async fn snapshot(&self) -> Result<ResourceSnapshot, ProbeError> {
        let raw = self.read_log().await?;
        parse_snapshot(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gib_unit() {
        assert_eq!(parse_quantity_to_gib("64.0 GiB").unwrap(), 64.0);
    }

    #[test]
    fn parses_bare_number_as_gib() {
        assert_eq!(parse_quantity_to_gib("64.0").unwrap(), 64.0);
    }

    #[test]
    fn converts_tib_to_gib() {
        assert_eq!(parse_quantity_to_gib("1 TiB").unwrap(), 1024.0);
    }

    #[test]
    fn converts_mib_to_gib() {
        assert!((parse_quantity_to_gib("1024 MiB").unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_quantity_to_gib("5 parsecs").is_err());
    }

    #[test]
    fn builds_snapshot_from_json_with_only_available_gpus() {
        let json = r#"{
            "cpu": {"free": "16"},
            "memory": {"free": "64.0 GiB"},
            "storage": {"free": "500.0 GiB"},
            "gpu": {
                "details": [
                    {"product_name": "H100", "index": "0", "status": "Available"},
                    {"product_name": "H100", "index": "1", "status": "Available"},
                    {"product_name": "H100", "index": "2", "status": "InUse"}
                ]
            }
        }"#;
        let snapshot = parse_snapshot(json).unwrap();
        assert_eq!(snapshot.cpu_free, 16);
        assert_eq!(snapshot.memory_free_gib, 64.0);
        assert_eq!(snapshot.storage_free_gib, 500.0);
        let h100 = snapshot.find_gpu("h100").unwrap();
        assert_eq!(h100.count, 2);
        assert_eq!(h100.indices, vec!["0".to_string(), "1".to_string()]);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_snapshot("not json").is_err());
    }
}
