use std::time::Duration;

use anyhow::Result;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    action: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    Denied(String),
    #[error("authorization service unavailable")]
    Unavailable,
}

/// Adapter over the external token validation capability.
///
/// With no endpoint configured every call is allowed (development mode).
/// When the service cannot be reached the gate fails closed: an outage must
/// not turn into an open administrative surface.
#[derive(Clone)]
pub struct AuthGate {
    endpoint: Option<String>,
    client: Client,
}

impl AuthGate {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            endpoint: config.auth.endpoint.clone(),
            client: ClientBuilder::new()
                .timeout(Duration::from_secs(5))
                .build()?,
        })
    }

    pub async fn validate(&self, token: Option<&str>, action: &str) -> Result<(), AuthError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(());
        };

        let response = self
            .client
            .post(format!("{}/validate", endpoint.trim_end_matches('/')))
            .json(&ValidateRequest { token, action })
            .send()
            .await
            .and_then(|res| res.error_for_status());

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                log::error!("token validation unreachable: action={action}, error={e}");
                return Err(AuthError::Unavailable);
            }
        };

        match response.json::<ValidateResponse>().await {
            Ok(ValidateResponse { valid: true, .. }) => Ok(()),
            Ok(ValidateResponse { error, .. }) => Err(AuthError::Denied(
                error.unwrap_or_else(|| "Permission denied".to_string()),
            )),
            Err(e) => {
                log::error!("malformed token validation response: action={action}, error={e}");
                Err(AuthError::Unavailable)
            }
        }
    }
}
