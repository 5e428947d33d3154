// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Prometheus metrics for admission outcomes, GPU reservation pressure, and
//! reconciler/sweeper activity.

use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

pub struct Metrics {
    registry: Registry,
    pub admissions_total: IntCounterVec,
    pub gpu_indices_reserved: IntGauge,
    pub reconciler_tick_duration_seconds: HistogramVec,
    pub reconciler_events_processed_total: IntCounterVec,
    pub jobs_removed_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let admissions_total = IntCounterVec::new(
            prometheus::Opts::new("admissions_total", "Admission decisions by result"),
            &["result"],
        )
        .expect("metric definition is static and valid");

        let gpu_indices_reserved = IntGauge::new(
            "gpu_indices_reserved",
            "Number of GPU indices currently reserved by live jobs",
        )
        .expect("metric definition is static and valid");

        let reconciler_tick_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "reconciler_tick_duration_seconds",
                "Wall-clock time of a single reconciler tick",
            ),
            &["scanner"],
        )
        .expect("metric definition is static and valid");

        let reconciler_events_processed_total = IntCounterVec::new(
            prometheus::Opts::new(
                "reconciler_events_processed_total",
                "Transfer events processed by the reconciler",
            ),
            &["scanner"],
        )
        .expect("metric definition is static and valid");

        let jobs_removed_total = IntCounterVec::new(
            prometheus::Opts::new("jobs_removed_total", "Jobs torn down, by reason"),
            &["reason"],
        )
        .expect("metric definition is static and valid");

        registry
            .register(Box::new(admissions_total.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(gpu_indices_reserved.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(reconciler_tick_duration_seconds.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(reconciler_events_processed_total.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(jobs_removed_total.clone()))
            .expect("unique metric name");

        Arc::new(Self {
            registry,
            admissions_total,
            gpu_indices_reserved,
            reconciler_tick_duration_seconds,
            reconciler_events_processed_total,
            jobs_removed_total,
        })
    }

    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&metric_families, &mut buf)
            .expect("prometheus text encoding never fails for well-formed metrics");
        String::from_utf8(buf).expect("prometheus text encoding is valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_registered_metric_names() {
        let metrics = Metrics::new();
        metrics.admissions_total.with_label_values(&["accepted"]).inc();
        metrics.gpu_indices_reserved.set(2);

        let text = metrics.encode();
        assert!(text.contains("admissions_total"));
        assert!(text.contains("gpu_indices_reserved"));
    }
}
