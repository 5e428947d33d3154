// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Route handlers for the admission/status/teardown HTTP surface.

use super::errors::ApiError;
use super::AppState;
use crate::admission::DeployRequest;
use crate::model::HardwareResource;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CheckJobConditionRequest {
    pub resource: HardwareResource,
    pub price: String,
}

#[derive(Debug, Deserialize)]
pub struct DeployJobRequest {
    pub uuid: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    pub resource: HardwareResource,
    pub price: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub status: &'static str,
    pub code: i32,
    pub data: serde_json::Value,
}

fn success(data: serde_json::Value) -> Json<SuccessResponse> {
    Json(SuccessResponse {
        status: "success",
        code: 200,
        data,
    })
}

pub async fn check_job_condition(
    State(state): State<AppState>,
    body: Result<Json<CheckJobConditionRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::Json(e.to_string()))?;

    let (acceptable, floor) = state
        .admission
        .check_condition(&req.resource, &req.price)
        .await?;

    if !acceptable {
        return Ok(success(serde_json::json!({ "price": floor, "acceptable": false })));
    }
    Ok(success(serde_json::json!({ "price": floor })))
}

pub async fn deploy_job(
    State(state): State<AppState>,
    body: Result<Json<DeployJobRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::Json(e.to_string()))?;

    let env: Vec<(String, String)> = req.envs.into_iter().collect();
    let deploy_request = DeployRequest {
        uuid: req.uuid,
        name: req.name,
        image: req.image,
        env,
        resource: req.resource,
        bid: req.price,
    };

    let price = state.admission.deploy(deploy_request).await?;
    Ok(success(serde_json::json!({ "price": price })))
}

#[derive(Debug, Deserialize)]
pub struct JobStatusQuery {
    pub job_uuid: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobStatusEntry {
    uuid: String,
    status: String,
    message: String,
}

pub async fn job_status(
    State(state): State<AppState>,
    Query(query): Query<JobStatusQuery>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let jobs = match query.job_uuid {
        Some(uuid) => match state
            .registry
            .get(&uuid)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
        {
            Some(job) => vec![job],
            None => vec![],
        },
        None => state
            .registry
            .list()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?,
    };

    let entries: Vec<JobStatusEntry> = jobs
        .into_iter()
        .map(|job| JobStatusEntry {
            uuid: job.uuid,
            status: job.status.as_str().to_string(),
            message: job.message,
        })
        .collect();

    Ok(success(serde_json::to_value(entries).unwrap()))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_uuid): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if job_uuid.trim().is_empty() {
        return Err(ApiError::BadParam("missing required field: [job_uuid]".to_string()));
    }

    state
        .registry
        .delete(&job_uuid)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(success(serde_json::json!("success")))
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}
