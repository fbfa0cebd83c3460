use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;

use crate::auth::AuthDenial;

// Startup errors - the gateway never serves with a bad routing table
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),

    #[error("duplicate service {0:?}")]
    DuplicateService(String),

    #[error("invalid target URL for {service}: {reason}")]
    InvalidTarget { service: String, reason: String },

    #[error("invalid api key header {header:?} for {service}")]
    InvalidHeader { service: String, header: String },

    #[error("invalid rate limit for {service}: window must be longer than zero")]
    InvalidRateWindow { service: String },
}

// Failures talking to an upstream
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream connection failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("upstream request failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl UpstreamError {
    pub fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(deadline)
        } else if err.is_connect() {
            UpstreamError::Connect(err)
        } else {
            UpstreamError::Request(err)
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Connect(_) | UpstreamError::Request(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Terminal outcome of a request that did not make it to (or back from) the upstream.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("service not specified")]
    BadRequest,

    #[error("service {0:?} not found")]
    NotFound(String),

    #[error("unauthorized: {reason}")]
    Unauthorized {
        reason: AuthDenial,
        /// Realm for the `WWW-Authenticate` challenge, bearer policies only.
        challenge: Option<&'static str>,
    },

    #[error("rate limit of {limit} exceeded")]
    RateLimited { limit: u32, retry_after: Duration },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(err) => err.status(),
        }
    }

    // label used for the requests_total metric
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::BadRequest => "bad_request",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Upstream(UpstreamError::Timeout(_)) => "upstream_timeout",
            GatewayError::Upstream(_) => "upstream_error",
        }
    }
}

/// Whole seconds for `Retry-After`, never less than one.
pub fn retry_after_secs(window: Duration) -> u64 {
    let secs = window.as_secs() + u64::from(window.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            GatewayError::BadRequest => "Service not specified",
            GatewayError::NotFound(_) => "Service not found",
            GatewayError::Unauthorized { .. } => "Unauthorized",
            GatewayError::RateLimited { .. } => "Rate limit exceeded",
            GatewayError::Upstream(UpstreamError::Timeout(_)) => "Gateway Timeout",
            GatewayError::Upstream(_) => "Bad Gateway",
        };

        let mut response = (status, format!("{body}\n")).into_response();
        let headers = response.headers_mut();

        match self {
            GatewayError::Unauthorized {
                challenge: Some(realm),
                ..
            } => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer realm=\"{realm}\"")) {
                    headers.insert(header::WWW_AUTHENTICATE, value);
                }
            }
            GatewayError::RateLimited { limit, retry_after } => {
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(retry_after_secs(retry_after)),
                );
            }
            _ => {}
        }

        response
    }
}
