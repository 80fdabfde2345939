use actix_web::http::StatusCode as ActixStatusCode;
use actix_web::{HttpResponse, ResponseError};
use bytes::Bytes;
use http::StatusCode;
use serde_json::json;

use crate::strategy_lb::EngineType;

/// Startup configuration problems. Fatal: the proxy refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Number of {role} hosts ({hosts}) must match number of {role} ports ({ports})")]
    MismatchedEndpoints {
        role: EngineType,
        hosts: usize,
        ports: usize,
    },

    #[error("At least one {role} instance is required")]
    NoEndpoints { role: EngineType },

    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failures that abort a single proxied request.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{phase} backend {endpoint} returned status {status}")]
    UpstreamStatus {
        phase: EngineType,
        endpoint: String,
        status: StatusCode,
        body: Bytes,
        content_type: Option<String>,
    },

    #[error("{phase} backend {endpoint} request failed: {source}")]
    UpstreamConnection {
        phase: EngineType,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("prefill backend {endpoint} returned an invalid JSON body: {source}")]
    InvalidPrefillResponse {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{role} client pool is closed")]
    PoolClosed { role: EngineType },

    #[error("decode stream from {endpoint} interrupted: {source}")]
    StreamInterrupted {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

impl DispatchError {
    pub fn phase(&self) -> EngineType {
        match self {
            DispatchError::UpstreamStatus { phase, .. }
            | DispatchError::UpstreamConnection { phase, .. } => *phase,
            DispatchError::InvalidPrefillResponse { .. } => EngineType::Prefill,
            DispatchError::PoolClosed { role } => *role,
            DispatchError::StreamInterrupted { .. } => EngineType::Decode,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            DispatchError::UpstreamStatus { .. } => "upstream_error",
            DispatchError::UpstreamConnection { .. } => "upstream_unreachable",
            DispatchError::InvalidPrefillResponse { .. } => "invalid_prefill_response",
            DispatchError::PoolClosed { .. } => "pool_closed",
            DispatchError::StreamInterrupted { .. } => "stream_interrupted",
        }
    }
}

impl ResponseError for DispatchError {
    fn status_code(&self) -> ActixStatusCode {
        match self {
            DispatchError::UpstreamStatus { status, .. } => {
                ActixStatusCode::from_u16(status.as_u16()).unwrap_or(ActixStatusCode::BAD_GATEWAY)
            }
            DispatchError::PoolClosed { .. } => ActixStatusCode::SERVICE_UNAVAILABLE,
            DispatchError::UpstreamConnection { .. }
            | DispatchError::InvalidPrefillResponse { .. }
            | DispatchError::StreamInterrupted { .. } => ActixStatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        match self {
            // Upstream failures are surfaced verbatim.
            DispatchError::UpstreamStatus {
                body, content_type, ..
            } => {
                let mut builder = HttpResponse::build(status);
                if let Some(content_type) = content_type {
                    builder.content_type(content_type.as_str());
                }
                builder.body(body.clone())
            }
            _ => HttpResponse::build(status).json(json!({
                "error": {
                    "message": self.to_string(),
                    "type": status.canonical_reason().unwrap_or("error"),
                    "code": self.code(),
                }
            })),
        }
    }
}

/// Reasons the first decode chunk could not carry the merged timing block.
/// Always recovered by forwarding the chunk untouched.
#[derive(Debug, thiserror::Error)]
pub enum MetadataInjectionError {
    #[error("chunk is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("chunk payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("chunk payload is not a JSON object")]
    NotAnObject,

    #[error("chunk has no vllm_timing.queued_time/execute_time")]
    MissingTiming,
}
