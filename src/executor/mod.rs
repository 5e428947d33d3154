// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Container Executor: pulls images, creates/starts containers with the
//! GPU/CPU/memory shape reserved by the admission controller, verifies
//! startup, and removes containers on teardown.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures_util::StreamExt;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to pull image: {0}")]
    PullFailed(String),
    #[error("failed to create container: {0}")]
    CreateFailed(String),
    #[error("failed to start container")]
    StartFailed,
    #[error("docker daemon error: {0}")]
    Daemon(String),
}

/// CFS period assumed by the container daemon's CPU quota accounting.
const CFS_PERIOD_MICROS: i64 = 100_000;

/// How long to wait after `Start` before verifying the container still
/// exists. NVIDIA device-request failures often surface as an immediate
/// exit; this probe catches that without pegging a watch loop.
const STARTUP_VERIFICATION_DELAY: std::time::Duration = std::time::Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub job_name: String,
    pub cpu_cores: i64,
    pub memory_bytes: i64,
    pub env: Vec<String>,
    pub reserved_gpu_indices: Vec<String>,
}

#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), ExecutorError>;
    /// Creates and starts the container, verifies it is still alive after
    /// the startup delay, and returns the assigned container name.
    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String, ExecutorError>;
    /// Idempotent: removing a nonexistent container is not an error.
    async fn remove(&self, name: &str) -> Result<(), ExecutorError>;
    async fn is_exist_container(&self, name: &str) -> Result<bool, ExecutorError>;
}

pub struct BollardExecutor {
    docker: Docker,
}

impl BollardExecutor {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect_local() -> Result<Self, ExecutorError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| ExecutorError::Daemon(e.to_string()))?;
        Ok(Self::new(docker))
    }
}

fn generate_suffix(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[async_trait]
impl ContainerExecutor for BollardExecutor {
    async fn pull(&self, image: &str) -> Result<(), ExecutorError> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            progress.map_err(|e| ExecutorError::PullFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String, ExecutorError> {
        let mut env = spec.env.clone();

        let device_requests = if !spec.reserved_gpu_indices.is_empty() {
            env.push(format!(
                "CUDA_VISIBLE_DEVICES={}",
                spec.reserved_gpu_indices.join(",")
            ));
            Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(spec.reserved_gpu_indices.clone()),
                capabilities: Some(vec![vec!["compute".to_string(), "utility".to_string()]]),
                ..Default::default()
            }])
        } else {
            None
        };

        let host_config = HostConfig {
            cpu_quota: Some(spec.cpu_cores * CFS_PERIOD_MICROS),
            memory: Some(spec.memory_bytes),
            device_requests,
            privileged: Some(true),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };

        let container_name = format!("{}-{}", spec.job_name, generate_suffix(5));

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| ExecutorError::CreateFailed(e.to_string()))?;

        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutorError::CreateFailed(e.to_string()))?;

        info!(container = %container_name, "starting container");
        tokio::time::sleep(STARTUP_VERIFICATION_DELAY).await;

        if !self.is_exist_container(&container_name).await? {
            warn!(container = %container_name, "container not found after startup delay");
            return Err(ExecutorError::StartFailed);
        }

        info!(container = %container_name, "container started");
        Ok(container_name)
    }

    async fn remove(&self, name: &str) -> Result<(), ExecutorError> {
        if name.is_empty() {
            return Ok(());
        }
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(ExecutorError::Daemon(e.to_string())),
        }
    }

    async fn is_exist_container(&self, name: &str) -> Result<bool, ExecutorError> {
        let mut filters = std::collections::HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| ExecutorError::Daemon(e.to_string()))?;

        Ok(containers.iter().any(|c| {
            c.names
                .as_ref()
                .map(|names| names.iter().any(|n| n.trim_start_matches('/') == name))
                .unwrap_or(false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_has_requested_length_and_charset() {
        let suffix = generate_suffix(5);
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn cpu_quota_scales_with_cfs_period() {
        let quota = 4 * CFS_PERIOD_MICROS;
        assert_eq!(quota, 400_000);
    }
}
