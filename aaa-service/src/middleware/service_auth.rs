//! Service caller extraction for machine-to-machine requests.
//!
//! A service request carries its name in `x-service-name` and its key in
//! `x-api-key`; authorization itself runs against the policy document.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};

use service_core::error::AppError;

pub const SERVICE_NAME_HEADER: &str = "x-service-name";
pub const API_KEY_HEADER: &str = "x-api-key";

/// Identity a service request claims; verified by the policy authorizer.
#[derive(Debug, Clone)]
pub struct ServiceCaller {
    pub service_name: String,
    pub api_key: Option<String>,
}

impl ServiceCaller {
    pub fn from_parts(parts: &Parts) -> Option<Self> {
        let service_name = parts
            .headers
            .get(SERVICE_NAME_HEADER)
            .and_then(|v| v.to_str().ok())?
            .to_string();
        let api_key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        Some(Self {
            service_name,
            api_key,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ServiceCaller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_parts(parts).ok_or_else(|| {
            AppError::Unauthenticated(anyhow::anyhow!("Missing {} header", SERVICE_NAME_HEADER))
        })
    }
}
