//! HTTP handlers: thin shims mapping the transport onto the services.

pub mod audit;
pub mod authz;
pub mod catalog;
pub mod org;
pub mod role;
pub mod service;
pub mod token;

use axum::Extension;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

use crate::services::context::CallContext;
use crate::store::Page;
use service_core::middleware::RequestId;
use service_core::response::ApiResponse;

/// Default per-request deadline when the caller does not set one.
const DEFAULT_DEADLINE_MS: u64 = 10_000;

/// Build the call context from the caller-supplied deadline header.
pub(crate) fn call_context(headers: &HeaderMap) -> CallContext {
    let deadline_ms = headers
        .get("x-deadline-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_DEADLINE_MS);
    CallContext::with_timeout(Duration::from_millis(deadline_ms))
}

/// Bearer token from the Authorization header, if any.
pub(crate) fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Stamp the envelope with the request id when the middleware set one.
pub(crate) fn respond<T: Serialize>(
    request_id: Option<Extension<RequestId>>,
    mut response: ApiResponse<T>,
) -> ApiResponse<T> {
    if let Some(Extension(RequestId(id))) = request_id {
        response.request_id = Some(id);
    }
    response
}

/// Pagination query parameters shared by all list endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageQuery {
    pub fn page(&self) -> Page {
        Page::new(self.page.unwrap_or(1), self.page_size.unwrap_or(50))
    }
}
