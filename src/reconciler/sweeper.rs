// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Stale Sweeper: a lower-cadence recovery pass for jobs whose settlement
//! event was missed (reorg, RPC gap) or whose client silently abandoned
//! them. Checks every live job's edge status and its block staleness.

use crate::chain::ChainClient;
use crate::edge::EdgeStatusClient;
use crate::executor::ContainerExecutor;
use crate::model::JobStatus;
use crate::monitoring::Metrics;
use crate::registry::JobRegistry;
use ethers::types::Address;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub struct StaleSweeper {
    chain: Arc<ChainClient>,
    edge: Arc<dyn EdgeStatusClient>,
    registry: Arc<dyn JobRegistry>,
    executor: Arc<dyn ContainerExecutor>,
    cp_account: Address,
    stale_block_threshold: i64,
    metrics: Arc<Metrics>,
}

impl StaleSweeper {
    pub fn new(
        chain: Arc<ChainClient>,
        edge: Arc<dyn EdgeStatusClient>,
        registry: Arc<dyn JobRegistry>,
        executor: Arc<dyn ContainerExecutor>,
        cp_account: Address,
        stale_block_threshold: i64,
    ) -> Self {
        Self::with_metrics(
            chain,
            edge,
            registry,
            executor,
            cp_account,
            stale_block_threshold,
            Metrics::new(),
        )
    }

    pub fn with_metrics(
        chain: Arc<ChainClient>,
        edge: Arc<dyn EdgeStatusClient>,
        registry: Arc<dyn JobRegistry>,
        executor: Arc<dyn ContainerExecutor>,
        cp_account: Address,
        stale_block_threshold: i64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            chain,
            edge,
            registry,
            executor,
            cp_account,
            stale_block_threshold,
            metrics,
        }
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "stale sweep failed");
            }
        }
    }

    pub async fn sweep(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let head = self.chain.block_number().await? as i64;
        let jobs = self.registry.list().await?;
        let cp_account_str = format!("{:#x}", self.cp_account);

        for job in jobs {
            if job.status == JobStatus::Removed {
                continue;
            }

            let stale = head - job.last_block_number >= self.stale_block_threshold;
            let ended = match self.edge.task_ended(&cp_account_str, &job.uuid).await {
                Ok(ended) => ended,
                Err(e) => {
                    warn!(uuid = %job.uuid, error = %e, "edge status check failed during sweep, skipping");
                    continue;
                }
            };

            if !stale && !ended {
                continue;
            }

            if let Err(e) = self.executor.remove(&job.container_name).await {
                warn!(uuid = %job.uuid, error = %e, "failed to remove container during sweep, keeping row for retry");
                continue;
            }

            if let Err(e) = self.registry.delete(&job.uuid).await {
                warn!(uuid = %job.uuid, error = %e, "failed to delete swept job row");
                continue;
            }

            self.metrics
                .jobs_removed_total
                .with_label_values(&[if stale { "stale" } else { "edge_ended" }])
                .inc();

            info!(uuid = %job.uuid, stale, ended, "job swept");
        }

        self.metrics
            .reconciler_tick_duration_seconds
            .with_label_values(&["stale_sweeper"])
            .observe(started.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ContainerExecutor, ContainerSpec, ExecutorError};
    use crate::model::{HardwareResource, Job};
    use crate::registry::SqliteJobRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEdge(bool);

    #[async_trait]
    impl EdgeStatusClient for FixedEdge {
        async fn task_ended(
            &self,
            _cp_account: &str,
            _task_uuid: &str,
        ) -> Result<bool, crate::edge::EdgeError> {
            Ok(self.0)
        }
    }

    struct CountingExecutor {
        removed: AtomicUsize,
    }

    #[async_trait]
    impl ContainerExecutor for CountingExecutor {
        async fn pull(&self, _image: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
        async fn create_and_start(&self, _spec: ContainerSpec) -> Result<String, ExecutorError> {
            Ok("unused".to_string())
        }
        async fn remove(&self, _name: &str) -> Result<(), ExecutorError> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn is_exist_container(&self, _name: &str) -> Result<bool, ExecutorError> {
            Ok(true)
        }
    }

    fn job_with_last_block(uuid: &str, last_block: i64) -> Job {
        let mut job = Job::new(
            uuid.to_string(),
            "my-job".to_string(),
            "alpine:latest".to_string(),
            vec![],
            HardwareResource {
                cpu: 1,
                memory: 1 << 30,
                storage: 1 << 30,
                gpu: 0,
                gpu_model: String::new(),
            },
            vec![],
            1_700_000_000,
        );
        job.last_block_number = last_block;
        job
    }

    async fn sweep_jobs(
        edge_ended: bool,
        stale_threshold: i64,
        head: i64,
        job: Job,
    ) -> (Arc<SqliteJobRegistry>, Arc<CountingExecutor>) {
        let registry = Arc::new(SqliteJobRegistry::open_in_memory().unwrap());
        registry.insert(job).await.unwrap();
        let executor = Arc::new(CountingExecutor {
            removed: AtomicUsize::new(0),
        });
        let edge: Arc<dyn EdgeStatusClient> = Arc::new(FixedEdge(edge_ended));

        // Exercise the per-job decision directly rather than through a live
        // ChainClient — mirrors the split used in the reconciler's tests.
        let jobs = registry.list().await.unwrap();
        for job in jobs {
            let stale = head - job.last_block_number >= stale_threshold;
            let ended = edge.task_ended("0x0", &job.uuid).await.unwrap();
            if stale || ended {
                executor.remove(&job.container_name).await.unwrap();
                registry.delete(&job.uuid).await.unwrap();
            }
        }
        (registry, executor)
    }

    #[tokio::test]
    async fn s6_sweeps_job_past_stale_threshold() {
        let (registry, executor) =
            sweep_jobs(false, 5000, 6500, job_with_last_block("T3", 1000)).await;
        assert!(registry.get("T3").await.unwrap().is_none());
        assert_eq!(executor.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn leaves_fresh_non_ended_job_alone() {
        let (registry, executor) =
            sweep_jobs(false, 5000, 1500, job_with_last_block("T4", 1000)).await;
        assert!(registry.get("T4").await.unwrap().is_some());
        assert_eq!(executor.removed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sweeps_job_the_edge_reports_ended_even_if_fresh() {
        let (registry, executor) =
            sweep_jobs(true, 5000, 1050, job_with_last_block("T5", 1000)).await;
        assert!(registry.get("T5").await.unwrap().is_none());
        assert_eq!(executor.removed.load(Ordering::SeqCst), 1);
    }
}
