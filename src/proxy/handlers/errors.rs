use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Client-visible error taxonomy. Every failure the gateway reports maps to
/// one of these, rendered in the OpenAI error body shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationError,
    AuthenticationError,
    PermissionError,
    NotFound,
    RateLimitExceeded,
    QuotaExceeded,
    UpstreamUnavailable,
    StreamingError,
    InternalError,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
            ErrorKind::PermissionError => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::StreamingError => StatusCode::BAD_GATEWAY,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimitExceeded => "rate_limit_error",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::StreamingError => "streaming_error",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn code_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::StreamingError => "streaming_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

pub fn client_error_body(kind: ErrorKind, message: &str) -> serde_json::Value {
    json!({
        "error": {
            "message": message,
            "type": kind.type_str(),
            "code": kind.code_str(),
        }
    })
}

pub fn to_client_error(kind: ErrorKind, message: impl Into<String>) -> Response {
    let message = message.into();
    (kind.status(), Json(client_error_body(kind, &message))).into_response()
}

/// 429 with a retry hint for the per-key limiter.
pub fn rate_limited_response(retry_after_secs: u64) -> Response {
    let body = client_error_body(
        ErrorKind::RateLimitExceeded,
        &format!("Rate limit exceeded, retry after {}s", retry_after_secs),
    );
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", retry_after_secs.to_string())],
        Json(body),
    )
        .into_response()
}

/// Terminal frame for a stream that broke after the first byte.
pub fn streaming_error_frame(message: &str) -> bytes::Bytes {
    let payload = json!({ "error": message, "type": "streaming_error" });
    bytes::Bytes::from(format!("event: error\ndata: {}\n\n", payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_documented_status_codes() {
        assert_eq!(ErrorKind::ValidationError.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::AuthenticationError.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::PermissionError.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::RateLimitExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::QuotaExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::UpstreamUnavailable.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorKind::InternalError.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn body_has_openai_shape() {
        let body = client_error_body(ErrorKind::PermissionError, "missing permission");
        assert_eq!(body["error"]["message"], "missing permission");
        assert_eq!(body["error"]["type"], "permission_error");
        assert_eq!(body["error"]["code"], "permission_error");
    }

    #[test]
    fn streaming_error_frame_is_well_formed() {
        let frame = streaming_error_frame("upstream reset");
        let text = String::from_utf8(frame.to_vec()).expect("utf8");
        assert!(text.starts_with("event: error\ndata: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"type\":\"streaming_error\""));
    }
}
