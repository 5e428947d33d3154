// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The HTTP error taxonomy: a fixed numeric code table (carried over from
//! the upstream response envelope) plus the `ErrorResponse` shape, adapted
//! from the teacher's `ApiError`/`ErrorResponse` split to this domain's
//! `{status, code, data, message}` envelope.

use crate::admission::AdmissionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub const JSON_ERROR: i32 = 4000;
pub const BAD_PARAM_ERROR: i32 = 4001;
pub const CHECK_RESOURCES_ERROR: i32 = 4004;
pub const NO_AVAILABLE_RESOURCES_ERROR: i32 = 4006;
pub const CHECK_PRICE_ERROR: i32 = 4024;
pub const BELOW_PRICE_ERROR: i32 = 4025;
pub const UBI_TASK_PARAM_ERROR: i32 = 8001;
pub const SAVE_TASK_ENTITY_ERROR: i32 = 8004;
pub const SERVER_ERROR: i32 = 500;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Json(String),
    BadParam(String),
    Admission(AdmissionError),
    NotFound(String),
    Internal(String),
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        ApiError::Admission(e)
    }
}

impl ApiError {
    fn code_and_message(&self) -> (i32, String) {
        match self {
            ApiError::Json(msg) => (JSON_ERROR, msg.clone()),
            ApiError::BadParam(msg) => (BAD_PARAM_ERROR, msg.clone()),
            ApiError::NotFound(msg) => (BAD_PARAM_ERROR, msg.clone()),
            ApiError::Internal(msg) => (SERVER_ERROR, msg.clone()),
            ApiError::Admission(e) => match e {
                AdmissionError::UbiTaskParamError(msg) => (UBI_TASK_PARAM_ERROR, msg.clone()),
                AdmissionError::CheckPriceError(msg) => (CHECK_PRICE_ERROR, msg.clone()),
                AdmissionError::BelowPriceError => {
                    (BELOW_PRICE_ERROR, e.to_string())
                }
                AdmissionError::CheckResourcesError(msg) => (CHECK_RESOURCES_ERROR, msg.clone()),
                AdmissionError::NoAvailableResourcesError => {
                    (NO_AVAILABLE_RESOURCES_ERROR, e.to_string())
                }
                AdmissionError::SaveTaskEntityError(msg) => (SAVE_TASK_ENTITY_ERROR, msg.clone()),
            },
        }
    }

    fn http_status(&self) -> StatusCode {
        match self {
            ApiError::Json(_) | ApiError::BadParam(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Admission(e) => match e {
                AdmissionError::UbiTaskParamError(_)
                | AdmissionError::CheckPriceError(_)
                | AdmissionError::BelowPriceError => StatusCode::BAD_REQUEST,
                AdmissionError::CheckResourcesError(_)
                | AdmissionError::NoAvailableResourcesError
                | AdmissionError::SaveTaskEntityError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let (code, message) = self.code_and_message();
        ErrorResponse {
            status: "fail",
            code,
            data: None,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = self.to_response();
        (status, Json(body)).into_response()
    }
}
