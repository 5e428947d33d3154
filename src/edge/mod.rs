// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Edge status client: asks the edge orchestrator whether a task has ended.
//! `200` carries `data.ended` verbatim; `400` means the task is no longer
//! known to the edge, which is itself treated as ended; anything else is a
//! transient failure the reconciler retries on its next tick.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("edge status request failed: {0}")]
    Request(String),
    #[error("edge status response was not valid JSON: {0}")]
    Decode(String),
    #[error("edge status returned unexpected status {0}")]
    UnexpectedStatus(u16),
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    #[allow(dead_code)]
    code: i32,
    #[allow(dead_code)]
    msg: String,
    data: TaskStatusData,
}

#[derive(Debug, Deserialize)]
struct TaskStatusData {
    ended: bool,
    #[allow(dead_code)]
    #[serde(default)]
    status: String,
}

#[async_trait]
pub trait EdgeStatusClient: Send + Sync {
    async fn task_ended(&self, cp_account: &str, task_uuid: &str) -> Result<bool, EdgeError>;
}

pub struct HttpEdgeStatusClient {
    http: reqwest::Client,
    edge_url: String,
}

impl HttpEdgeStatusClient {
    pub fn new(edge_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            http,
            edge_url: edge_url.into(),
        }
    }
}

#[async_trait]
impl EdgeStatusClient for HttpEdgeStatusClient {
    async fn task_ended(&self, cp_account: &str, task_uuid: &str) -> Result<bool, EdgeError> {
        let url = format!("{}/cps/{}/{}", self.edge_url.trim_end_matches('/'), cp_account, task_uuid);

        let response = self
            .http
            .get(&url)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| EdgeError::Request(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 400 {
            return Ok(true);
        }

        if !status.is_success() {
            return Err(EdgeError::UnexpectedStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| EdgeError::Request(e.to_string()))?;
        let parsed: TaskStatusResponse =
            serde_json::from_str(&body).map_err(|e| EdgeError::Decode(e.to_string()))?;
        Ok(parsed.data.ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ended_true() {
        let body = r#"{"code":200,"msg":"ok","data":{"ended":true,"status":"settled"}}"#;
        let parsed: TaskStatusResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.data.ended);
    }

    #[test]
    fn parses_ended_false() {
        let body = r#"{"code":200,"msg":"ok","data":{"ended":false,"status":"running"}}"#;
        let parsed: TaskStatusResponse = serde_json::from_str(body).unwrap();
        assert!(!parsed.data.ended);
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let body = "not json";
        let parsed: Result<TaskStatusResponse, _> = serde_json::from_str(body);
        assert!(parsed.is_err());
    }
}
