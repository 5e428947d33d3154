// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The HTTP surface: admission, status and teardown routes plus health and
//! metrics. Unchanged wire shape from upstream — only the handlers'
//! internals differ.

pub mod errors;
pub mod handlers;

use crate::admission::AdmissionController;
use crate::monitoring::Metrics;
use crate::registry::JobRegistry;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub registry: Arc<dyn JobRegistry>,
    pub metrics: Arc<Metrics>,
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> String {
    state.metrics.encode()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/check_job_condition", post(handlers::check_job_condition))
        .route("/deploy_job", post(handlers::deploy_job))
        .route("/job_status", get(handlers::job_status))
        .route("/job/:job_uuid", delete(handlers::delete_job))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ContainerExecutor, ContainerSpec, ExecutorError};
    use crate::model::PriceTable;
    use crate::pricing::PricingEngine;
    use crate::probe::{ProbeError, ResourceProbe};
    use crate::registry::SqliteJobRegistry;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct EmptyProbe;

    #[async_trait]
    impl ResourceProbe for EmptyProbe {
        async fn snapshot(&self) -> Result<crate::model::ResourceSnapshot, ProbeError> {
            Ok(crate::model::ResourceSnapshot {
                cpu_free: 4,
                memory_free_gib: 16.0,
                storage_free_gib: 100.0,
                gpus: Default::default(),
            })
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl ContainerExecutor for NoopExecutor {
        async fn pull(&self, _image: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
        async fn create_and_start(&self, _spec: ContainerSpec) -> Result<String, ExecutorError> {
            Ok("noop".to_string())
        }
        async fn remove(&self, _name: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
        async fn is_exist_container(&self, _name: &str) -> Result<bool, ExecutorError> {
            Ok(true)
        }
    }

    fn test_state() -> AppState {
        let registry: Arc<dyn JobRegistry> = Arc::new(SqliteJobRegistry::open_in_memory().unwrap());
        let admission = Arc::new(AdmissionController::new(
            Arc::new(EmptyProbe),
            PricingEngine::new(PriceTable::default()),
            registry.clone(),
            Arc::new(NoopExecutor),
            false,
        ));
        AppState {
            admission,
            registry,
            metrics: Metrics::new(),
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn deploy_job_with_bad_json_returns_json_error() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/deploy_job")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_route_exposes_prometheus_text() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
