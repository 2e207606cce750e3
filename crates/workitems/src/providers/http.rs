//! Shared HTTP client for provider adapters
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic. Every request runs
//! under one global timeout, so a stalled provider fails deterministically.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::AccessToken;
use crate::error::ProviderError;

/// ureq agent with a global timeout and status-to-error mapping
#[derive(Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET and decode a JSON response
    pub fn get_json<T: DeserializeOwned>(&self, url: &str, token: &AccessToken) -> Result<T, ProviderError> {
        let mut response = self
            .agent
            .get(url)
            .header("Authorization", &token.bearer())
            .header("Accept", "application/json")
            .call()
            .map_err(|e| self.map_error(e, url))?;

        response
            .body_mut()
            .read_json()
            .map_err(|e| self.map_error(e, url))
    }

    /// POST a JSON body and decode a JSON response
    pub fn post_json<B, T>(&self, url: &str, token: &AccessToken, body: &B) -> Result<T, ProviderError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let mut response = self
            .agent
            .post(url)
            .header("Authorization", &token.bearer())
            .send_json(body)
            .map_err(|e| self.map_error(e, url))?;

        response
            .body_mut()
            .read_json()
            .map_err(|e| self.map_error(e, url))
    }

    /// POST a JSON body, ignoring the response body
    pub fn post_json_no_content<B: Serialize>(
        &self,
        url: &str,
        token: &AccessToken,
        body: &B,
    ) -> Result<(), ProviderError> {
        self.agent
            .post(url)
            .header("Authorization", &token.bearer())
            .send_json(body)
            .map_err(|e| self.map_error(e, url))?;
        Ok(())
    }

    /// PUT a JSON body, ignoring the response body
    pub fn put_json<B: Serialize>(&self, url: &str, token: &AccessToken, body: &B) -> Result<(), ProviderError> {
        self.agent
            .put(url)
            .header("Authorization", &token.bearer())
            .send_json(body)
            .map_err(|e| self.map_error(e, url))?;
        Ok(())
    }

    /// PATCH a JSON body, ignoring the response body
    pub fn patch_json<B: Serialize>(&self, url: &str, token: &AccessToken, body: &B) -> Result<(), ProviderError> {
        self.agent
            .patch(url)
            .header("Authorization", &token.bearer())
            .send_json(body)
            .map_err(|e| self.map_error(e, url))?;
        Ok(())
    }

    fn map_error(&self, err: ureq::Error, url: &str) -> ProviderError {
        match err {
            ureq::Error::StatusCode(status) => status_error(status, url),
            ureq::Error::Timeout(_) => ProviderError::Timeout(self.timeout),
            ureq::Error::Json(e) => ProviderError::Decode(format!("{}: {}", url, e)),
            other => ProviderError::Transient(format!("{}: {}", url, other)),
        }
    }
}

/// Classify a non-2xx status
pub fn status_error(status: u16, url: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::BadCredential(format!("{} returned {}", url, status)),
        404 => ProviderError::NotFound(url.to_string()),
        408 | 429 | 500..=599 => ProviderError::Transient(format!("{} returned {}", url, status)),
        _ => ProviderError::Rejected {
            status,
            message: url.to_string(),
        },
    }
}
