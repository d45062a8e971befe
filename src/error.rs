use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Gateway-wide error taxonomy. Every failure that can reach the HTTP
/// surface is one of these kinds; the `IntoResponse` impl below is the
/// single place status codes are assigned.
#[derive(Debug, Clone)]
pub enum GatewayError {
    BadRequest(String),
    Unauthenticated(String),
    Forbidden(String),
    NotFound(String),
    RateLimited,
    UpstreamTimeout(String),
    UpstreamBadResponse(String),
    NoHealthyBackend,
    Internal(String),
    NotImplemented(String),
}

impl GatewayError {
    /// Whether this error came out of the dispatch path (balancer or
    /// upstream), i.e. the kinds the fallback-response mode may absorb
    /// after the retry budget is exhausted.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTimeout(_)
                | GatewayError::UpstreamBadResponse(_)
                | GatewayError::NoHealthyBackend
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            GatewayError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            GatewayError::Unauthenticated(msg) => {
                let body = Json(json!({ "detail": msg }));
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    body,
                )
                    .into_response();
            }
            GatewayError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            GatewayError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            // Exceeded windows answer with an empty body; the
            // X-RateLimit-* headers only accompany allowed requests.
            GatewayError::RateLimited => {
                return StatusCode::TOO_MANY_REQUESTS.into_response();
            }
            GatewayError::UpstreamTimeout(msg) => {
                (StatusCode::BAD_GATEWAY, format!("Upstream timeout: {}", msg))
            }
            GatewayError::UpstreamBadResponse(msg) => {
                (StatusCode::BAD_GATEWAY, format!("Upstream error: {}", msg))
            }
            GatewayError::NoHealthyBackend => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No healthy backend available".to_string(),
            ),
            GatewayError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", msg))
            }
            GatewayError::NotImplemented(msg) => (StatusCode::NOT_IMPLEMENTED, msg),
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            GatewayError::Unauthenticated(msg) => write!(f, "Unauthenticated: {}", msg),
            GatewayError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            GatewayError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            GatewayError::RateLimited => write!(f, "Rate limit exceeded"),
            GatewayError::UpstreamTimeout(msg) => write!(f, "Upstream Timeout: {}", msg),
            GatewayError::UpstreamBadResponse(msg) => write!(f, "Upstream Error: {}", msg),
            GatewayError::NoHealthyBackend => write!(f, "No healthy backend available"),
            GatewayError::Internal(msg) => write!(f, "Internal Error: {}", msg),
            GatewayError::NotImplemented(msg) => write!(f, "Not Implemented: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    /// Classify HTTP client failures. Timeouts and connection errors are
    /// retryable upstream kinds; everything else that carries a status is
    /// a bad response from the backend.
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::UpstreamTimeout("backend did not respond in time".to_string())
        } else if err.is_connect() {
            GatewayError::UpstreamBadResponse("unable to reach backend".to_string())
        } else if let Some(status) = err.status() {
            GatewayError::UpstreamBadResponse(format!("HTTP {}: {}", status.as_u16(), err))
        } else if err.is_request() {
            GatewayError::BadRequest(format!("invalid request: {}", err))
        } else {
            GatewayError::UpstreamBadResponse(format!("HTTP client error: {}", err))
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("JSON error: {}", err))
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::BadRequest(format!("Invalid URL: {}", err))
    }
}
