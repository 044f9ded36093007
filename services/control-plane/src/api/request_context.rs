//! Request-scoped context extracted from HTTP requests.

use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use berth_id::RequestId;

use crate::api::error::ApiError;
use crate::error::FleetError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    /// Parse a typed id from a path segment.
    pub fn parse_id<T: FromStr>(&self, raw: &str, code: &str, kind: &str) -> Result<T, ApiError> {
        raw.parse().map_err(|_| {
            ApiError::bad_request(code, format!("Invalid {kind} ID format"))
                .with_request_id(self.request_id.clone())
        })
    }

    /// Convert a fleet failure into a problem response tagged with this request.
    pub fn fail(&self, err: FleetError) -> ApiError {
        ApiError::from(err).with_request_id(self.request_id.clone())
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .unwrap_or_else(|| RequestId::new().to_string());

        Ok(Self { request_id })
    }
}
