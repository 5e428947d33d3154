// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chain Reconciler: the node's crash-safety net. A singleton loop that
//! pulls `TransferToCPBeneficiary` events since the last scanned block,
//! updates job rewards idempotently, and tears down jobs whose on-chain
//! task has ended. Never terminates on error — it logs and retries.

pub mod sweeper;

use crate::chain::{wei_to_float, ChainClient, ChainError};
use crate::config::resolver::ConfigResolver;
use crate::edge::EdgeStatusClient;
use crate::executor::ContainerExecutor;
use crate::model::ScannerKind;
use crate::monitoring::Metrics;
use crate::registry::JobRegistry;
use ethers::types::Address;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub struct Reconciler {
    chain: Arc<ChainClient>,
    edge: Arc<dyn EdgeStatusClient>,
    registry: Arc<dyn JobRegistry>,
    executor: Arc<dyn ContainerExecutor>,
    resolver: ConfigResolver,
    cp_account: Address,
    genesis_block: i64,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        chain: Arc<ChainClient>,
        edge: Arc<dyn EdgeStatusClient>,
        registry: Arc<dyn JobRegistry>,
        executor: Arc<dyn ContainerExecutor>,
        resolver: ConfigResolver,
        cp_account: Address,
        genesis_block: i64,
    ) -> Self {
        Self::with_metrics(
            chain,
            edge,
            registry,
            executor,
            resolver,
            cp_account,
            genesis_block,
            Metrics::new(),
        )
    }

    pub fn with_metrics(
        chain: Arc<ChainClient>,
        edge: Arc<dyn EdgeStatusClient>,
        registry: Arc<dyn JobRegistry>,
        executor: Arc<dyn ContainerExecutor>,
        resolver: ConfigResolver,
        cp_account: Address,
        genesis_block: i64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            chain,
            edge,
            registry,
            executor,
            resolver,
            cp_account,
            genesis_block,
            metrics,
        }
    }

    /// Runs forever on `interval` cadence. Intended to be spawned once as a
    /// detached task; a failing tick is logged, never propagated.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "reconciler tick failed");
            }
        }
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = self.tick_inner().await;
        self.metrics
            .reconciler_tick_duration_seconds
            .with_label_values(&["task_payment"])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn tick_inner(&self) -> anyhow::Result<()> {
        let head = match self.chain.block_number().await {
            Ok(h) => h as i64,
            Err(ChainError::TooManyRequests) => {
                warn!("chain RPC rate-limited, backing off 10s");
                tokio::time::sleep(Duration::from_secs(10)).await;
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch chain head, retrying next tick");
                return Ok(());
            }
        };

        let cursor = self
            .registry
            .load_cursor(ScannerKind::TaskPayment as i64, self.genesis_block)
            .await?;
        let last_scanned = cursor.last_block;

        if head <= last_scanned {
            return Ok(());
        }

        let contract_address = self.resolver.resolve(head);

        let events = match self
            .chain
            .fetch_transfer_events(
                contract_address,
                self.cp_account,
                last_scanned as u64,
                head as u64,
            )
            .await
        {
            Ok(events) => events,
            Err(ChainError::TooManyRequests) => {
                warn!("chain RPC rate-limited while fetching logs, backing off 10s");
                tokio::time::sleep(Duration::from_secs(10)).await;
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch transfer events, retrying next tick");
                return Ok(());
            }
        };

        self.metrics
            .reconciler_events_processed_total
            .with_label_values(&["task_payment"])
            .inc_by(events.len() as u64);

        let mut new_cursor = last_scanned;
        for event in &events {
            self.process_event(event).await;
            if event.block_number as i64 > new_cursor {
                new_cursor = event.block_number as i64;
            }
        }

        if new_cursor > last_scanned {
            self.registry
                .save_cursor(ScannerKind::TaskPayment as i64, new_cursor)
                .await?;
        }

        info!(
            from = last_scanned,
            to = head,
            events = events.len(),
            "reconciler tick complete"
        );
        Ok(())
    }

    async fn process_event(&self, event: &crate::chain::TransferEvent) {
        let existed_before = matches!(self.registry.get(&event.task_uuid).await, Ok(Some(_)));

        reconcile_event(
            self.edge.as_ref(),
            self.registry.as_ref(),
            self.executor.as_ref(),
            self.cp_account,
            event,
        )
        .await;

        if existed_before {
            if let Ok(None) = self.registry.get(&event.task_uuid).await {
                self.metrics
                    .jobs_removed_total
                    .with_label_values(&["settled"])
                    .inc();
            }
        }
    }
}

/// Applies one decoded transfer event: idempotent reward update, then
/// edge-status-gated teardown. Free function (rather than a method) so it
/// can be exercised in tests without a live [`ChainClient`].
async fn reconcile_event(
    edge: &dyn EdgeStatusClient,
    registry: &dyn JobRegistry,
    executor: &dyn ContainerExecutor,
    cp_account: Address,
    event: &crate::chain::TransferEvent,
) {
    let job = match registry.get(&event.task_uuid).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            // Event predates this node's admission of the job.
            return;
        }
        Err(e) => {
            warn!(uuid = %event.task_uuid, error = %e, "failed to load job for event");
            return;
        }
    };

    let new_reward = job.reward + wei_to_float(event.transfer_amount);
    if let Err(e) = registry
        .update_reward_and_block(&event.task_uuid, event.block_number as i64, new_reward)
        .await
    {
        warn!(uuid = %event.task_uuid, error = %e, "failed to update reward/block");
        return;
    }

    let cp_account_str = format!("{:#x}", cp_account);
    let ended = match edge.task_ended(&cp_account_str, &event.task_uuid).await {
        Ok(ended) => ended,
        Err(e) => {
            warn!(uuid = %event.task_uuid, error = %e, "edge status check failed, retrying next tick");
            return;
        }
    };

    if !ended {
        return;
    }

    if let Err(e) = executor.remove(&job.container_name).await {
        warn!(uuid = %event.task_uuid, error = %e, "failed to remove container, keeping registry row for retry");
        return;
    }

    if let Err(e) = registry.delete(&event.task_uuid).await {
        warn!(uuid = %event.task_uuid, error = %e, "failed to delete settled job row");
        return;
    }
    info!(uuid = %event.task_uuid, "job settled and torn down");
}
