//! JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Why the gateway answered a request itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    NotFound,
    /// Slug does not name a known instance
    UnknownInstance,
    /// Instance exists but has no live backend process
    InstanceInactive,
    /// POST carried a deny-listed backend action
    ActionDenied,
    /// Inspected body exceeded the buffering limit
    PayloadTooLarge,
    /// Inspected body used a content coding the gateway does not read
    UnsupportedMediaType,
    BadRequest,
    RequestTimeout,
    ConnectionFailed,
    InternalError,
}

impl ProxyErrorCode {
    fn parts(self) -> (StatusCode, &'static str) {
        use ProxyErrorCode::*;
        match self {
            NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            UnknownInstance => (StatusCode::NOT_FOUND, "UNKNOWN_INSTANCE"),
            InstanceInactive => (StatusCode::SERVICE_UNAVAILABLE, "INSTANCE_INACTIVE"),
            ActionDenied => (StatusCode::FORBIDDEN, "ACTION_DENIED"),
            PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            UnsupportedMediaType => (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE"),
            BadRequest => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            RequestTimeout => (StatusCode::GATEWAY_TIMEOUT, "REQUEST_TIMEOUT"),
            ConnectionFailed => (StatusCode::BAD_GATEWAY, "CONNECTION_FAILED"),
            InternalError => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    pub fn status_code(self) -> StatusCode {
        self.parts().0
    }

    /// Value of the `X-Proxy-Error` header
    pub fn as_header_value(self) -> &'static str {
        self.parts().1
    }
}

/// Body of a gateway error: `{code, message, status}`
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub code: ProxyErrorCode,
    pub message: &'a str,
    pub status: u16,
}

impl<'a> ErrorBody<'a> {
    pub fn new(code: ProxyErrorCode, message: &'a str) -> Self {
        Self {
            code,
            message,
            status: code.status_code().as_u16(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing a fieldwise-plain struct cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The body type every gateway response is boxed into
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Wrap a fully buffered body
pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// Gateway error as a JSON response tagged with `X-Proxy-Error`
pub fn json_error_response(code: ProxyErrorCode, message: impl AsRef<str>) -> Response<GatewayBody> {
    let body = ErrorBody::new(code, message.as_ref()).to_json();
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response builder")
}
