// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Admission Controller: the single place that decides accept/reject for an
//! incoming job. `deploy` reserves GPU indices and commits a Job row inside
//! a short, lock-held critical section (the "admission serializer"), then
//! returns immediately — image pull and container start happen in a
//! detached dispatcher task.

use crate::executor::{ContainerExecutor, ContainerSpec, ExecutorError};
use crate::model::{HardwareResource, Job};
use crate::monitoring::Metrics;
use crate::pricing::PricingEngine;
use crate::probe::{ProbeError, ResourceProbe};
use crate::registry::{JobRegistry, RegistryError};
use crate::validation::validate_job_name;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid job parameter: {0}")]
    UbiTaskParamError(String),
    #[error("unable to verify price: {0}")]
    CheckPriceError(String),
    #[error("bid price below minimum requirement")]
    BelowPriceError,
    #[error("error while checking resources available: {0}")]
    CheckResourcesError(String),
    #[error("no resources available")]
    NoAvailableResourcesError,
    #[error("error while saving job: {0}")]
    SaveTaskEntityError(String),
}

impl From<ProbeError> for AdmissionError {
    fn from(e: ProbeError) -> Self {
        AdmissionError::CheckResourcesError(e.to_string())
    }
}

impl From<RegistryError> for AdmissionError {
    fn from(e: RegistryError) -> Self {
        AdmissionError::SaveTaskEntityError(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub uuid: String,
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub resource: HardwareResource,
    pub bid: String,
}

pub struct AdmissionController {
    probe: Arc<dyn ResourceProbe>,
    pricing: PricingEngine,
    registry: Arc<dyn JobRegistry>,
    executor: Arc<dyn ContainerExecutor>,
    pricing_enabled: bool,
    metrics: Arc<Metrics>,
    /// Guards the "probe + reserve GPU indices + insert Job" critical
    /// section so two concurrent admissions never reserve the same index.
    /// Never held across container/chain/DB I/O beyond the registry insert.
    intake_lock: Mutex<()>,
}

impl AdmissionController {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        pricing: PricingEngine,
        registry: Arc<dyn JobRegistry>,
        executor: Arc<dyn ContainerExecutor>,
        pricing_enabled: bool,
    ) -> Self {
        Self::with_metrics(probe, pricing, registry, executor, pricing_enabled, Metrics::new())
    }

    pub fn with_metrics(
        probe: Arc<dyn ResourceProbe>,
        pricing: PricingEngine,
        registry: Arc<dyn JobRegistry>,
        executor: Arc<dyn ContainerExecutor>,
        pricing_enabled: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            probe,
            pricing,
            registry,
            executor,
            pricing_enabled,
            metrics,
            intake_lock: Mutex::new(()),
        }
    }

    /// Pure inspection: runs the price and resource checks without
    /// mutating any state.
    pub async fn check_condition(
        &self,
        resource: &HardwareResource,
        bid: &str,
    ) -> Result<(bool, f64), AdmissionError> {
        let floor = if self.pricing_enabled {
            self.pricing.price(resource)
        } else {
            let (accepted, floor) = self
                .pricing
                .check(bid, resource)
                .map_err(|e| AdmissionError::CheckPriceError(e.to_string()))?;
            if !accepted {
                return Err(AdmissionError::BelowPriceError);
            }
            floor
        };

        let snapshot = self.probe.snapshot().await?;
        let reserved = self.registry.reserved_gpu_indices().await?;
        let acceptable = resource_fits(&snapshot, resource, &reserved);

        Ok((acceptable, floor))
    }

    /// Validates, prices, reserves GPU indices, and commits a Job row.
    /// Returns the floor price on success; the caller should treat this as
    /// the commit point — this call is NOT idempotent, retrying with the
    /// same uuid after success creates a second Job row.
    pub async fn deploy(&self, req: DeployRequest) -> Result<f64, AdmissionError> {
        let result = self.deploy_inner(req).await;
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(AdmissionError::BelowPriceError) => "below_price",
            Err(AdmissionError::NoAvailableResourcesError) => "no_resources",
            Err(AdmissionError::UbiTaskParamError(_)) => "invalid_param",
            _ => "error",
        };
        self.metrics.admissions_total.with_label_values(&[outcome]).inc();
        result
    }

    async fn deploy_inner(&self, req: DeployRequest) -> Result<f64, AdmissionError> {
        validate_deploy_request(&req)?;

        let floor = if self.pricing_enabled {
            self.pricing.price(&req.resource)
        } else {
            let (accepted, floor) = self
                .pricing
                .check(&req.bid, &req.resource)
                .map_err(|e| AdmissionError::CheckPriceError(e.to_string()))?;
            if !accepted {
                warn!(uuid = %req.uuid, bid = %req.bid, floor, "bid below floor price");
                return Err(AdmissionError::BelowPriceError);
            }
            floor
        };

        let job = {
            // Critical section: probe + GPU reservation + insert. No
            // container/chain I/O happens while this lock is held.
            let _guard = self.intake_lock.lock().await;

            let snapshot = self.probe.snapshot().await?;
            let reserved = self.registry.reserved_gpu_indices().await?;

            if !resource_fits(&snapshot, &req.resource, &reserved) {
                return Err(AdmissionError::NoAvailableResourcesError);
            }

            let reserved_gpu_indices = reserve_gpu_indices(&snapshot, &req.resource, &reserved)?;

            let env: Vec<String> = req
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();

            let job = Job::new(
                req.uuid.clone(),
                req.name.clone(),
                req.image.clone(),
                env,
                req.resource.clone(),
                reserved_gpu_indices,
                chrono::Utc::now().timestamp(),
            );

            self.registry.insert(job.clone()).await?;
            self.metrics
                .gpu_indices_reserved
                .add(job.reserved_gpu_indices.len() as i64);
            job
        };

        info!(uuid = %job.uuid, floor, "job admitted, dispatching container");
        self.spawn_dispatch(job);

        Ok(floor)
    }

    fn spawn_dispatch(&self, job: Job) {
        let registry = self.registry.clone();
        let executor = self.executor.clone();

        tokio::spawn(async move {
            if let Err(e) = dispatch_job(job.clone(), registry.clone(), executor).await {
                error!(uuid = %job.uuid, error = %e, "dispatch failed");
                let _ = registry.update_message(&job.uuid, &e.to_string()).await;
            }
        });
    }
}

async fn dispatch_job(
    job: Job,
    registry: Arc<dyn JobRegistry>,
    executor: Arc<dyn ContainerExecutor>,
) -> Result<(), ExecutorError> {
    if let Err(e) = executor.pull(&job.image).await {
        let message = format!("failed to pull image: {}", job.image);
        let _ = registry.update_message(&job.uuid, &message).await;
        return Err(e);
    }

    let spec = ContainerSpec {
        image: job.image.clone(),
        job_name: job.name.clone(),
        cpu_cores: job.resource.cpu,
        memory_bytes: job.resource.memory,
        env: job.env.clone(),
        reserved_gpu_indices: job.reserved_gpu_indices.clone(),
    };

    let container_name = match executor.create_and_start(spec).await {
        Ok(name) => name,
        Err(ExecutorError::StartFailed) => {
            let _ = registry
                .update_message(&job.uuid, "failed to start container")
                .await;
            return Err(ExecutorError::StartFailed);
        }
        Err(e) => {
            let _ = registry
                .update_message(&job.uuid, "failed to create container")
                .await;
            return Err(e);
        }
    };

    registry
        .update_container_name(&job.uuid, &container_name)
        .await
        .map_err(|e| ExecutorError::Daemon(e.to_string()))?;
    Ok(())
}

fn validate_deploy_request(req: &DeployRequest) -> Result<(), AdmissionError> {
    if req.uuid.trim().is_empty() {
        return Err(AdmissionError::UbiTaskParamError(
            "missing required field: [uuid]".to_string(),
        ));
    }
    if req.name.trim().is_empty() {
        return Err(AdmissionError::UbiTaskParamError(
            "missing required field: [name]".to_string(),
        ));
    }
    validate_job_name(&req.name).map_err(AdmissionError::UbiTaskParamError)?;
    if req.image.trim().is_empty() {
        return Err(AdmissionError::UbiTaskParamError(
            "missing required field: [image]".to_string(),
        ));
    }
    Ok(())
}

/// `cpu`, `memory`, and `storage` are independent dimensions (the source
/// overwrote `needMemory` with `needStorage` — see Open Question 2 in
/// SPEC_FULL.md). GPU availability is only checked when a model is
/// requested; an unnamed GPU count with no model is accepted as long as the
/// CPU/memory/storage dimensions fit, matching upstream behavior.
fn resource_fits(
    snapshot: &crate::model::ResourceSnapshot,
    req: &HardwareResource,
    already_reserved: &[String],
) -> bool {
    if req.cpu > snapshot.cpu_free {
        return false;
    }
    if req.memory > 0 && crate::model::bytes_to_gib(req.memory) > snapshot.memory_free_gib {
        return false;
    }
    if req.storage > 0 && crate::model::bytes_to_gib(req.storage) > snapshot.storage_free_gib {
        return false;
    }
    if req.gpu > 0 && !req.gpu_model.is_empty() {
        let available = available_indices(snapshot, &req.gpu_model, already_reserved);
        if available.len() < req.gpu as usize {
            return false;
        }
    }
    true
}

fn available_indices(
    snapshot: &crate::model::ResourceSnapshot,
    model: &str,
    already_reserved: &[String],
) -> Vec<String> {
    match snapshot.find_gpu(model) {
        Some(group) => group
            .indices
            .iter()
            .filter(|idx| !already_reserved.contains(idx))
            .cloned()
            .collect(),
        None => Vec::new(),
    }
}

fn reserve_gpu_indices(
    snapshot: &crate::model::ResourceSnapshot,
    req: &HardwareResource,
    already_reserved: &[String],
) -> Result<Vec<String>, AdmissionError> {
    if req.gpu == 0 || req.gpu_model.is_empty() {
        return Ok(Vec::new());
    }
    let available = available_indices(snapshot, &req.gpu_model, already_reserved);
    if available.len() < req.gpu as usize {
        return Err(AdmissionError::NoAvailableResourcesError);
    }
    Ok(available.into_iter().take(req.gpu as usize).collect())
}
