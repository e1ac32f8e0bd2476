//! Typed HTTP client for the SMS gateway
//!
//! All calls use HTTP basic auth and a 5 second deadline. Any network error
//! or unexpected status is surfaced verbatim with a body snippet; callers
//! decide whether to retry, the client itself never does.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-request deadline for every gateway call
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How much of an error body to carry into error messages
const BODY_SNIPPET_LEN: usize = 200;

/// A webhook registration as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    pub id: String,
    pub url: String,
    pub event: String,
}

#[derive(Debug, Serialize)]
struct HookRegistration<'a> {
    url: &'a str,
    event: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    phone_numbers: &'a [String],
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sim_number: Option<i64>,
}

/// Client for the gateway's HTTP API
pub struct GatewayClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build gateway HTTP client")?;

        Ok(Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Probe the gateway's health endpoint; 200 means healthy
    pub async fn health(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, "/health")
            .send()
            .await
            .context("failed to connect to gateway")?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("gateway health check returned {}: {}", status, snippet(&body));
        }

        Ok(())
    }

    /// List all webhook registrations held by the gateway
    pub async fn list_hooks(&self) -> Result<Vec<Hook>> {
        let response = self
            .request(reqwest::Method::GET, "/webhooks")
            .send()
            .await
            .context("failed to list webhooks")?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to list webhooks: status {}: {}", status, snippet(&body));
        }

        response
            .json::<Vec<Hook>>()
            .await
            .context("failed to decode webhook list")
    }

    /// Register a webhook for `event` pointing at `url`
    pub async fn register_hook(&self, event: &str, url: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/webhooks")
            .json(&HookRegistration { url, event })
            .send()
            .await
            .context("failed to register webhook")?;

        let status = response.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "failed to register webhook for {}: status {}: {}",
                event,
                status,
                snippet(&body)
            );
        }

        Ok(())
    }

    /// Delete a webhook registration by id
    pub async fn delete_hook(&self, id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/webhooks/{}", id))
            .send()
            .await
            .context("failed to delete webhook")?;

        let status = response.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to delete webhook {}: status {}: {}", id, status, snippet(&body));
        }

        Ok(())
    }

    /// Submit an outbound message; the gateway answers 202 with an opaque body
    pub async fn send_message(
        &self,
        phone_numbers: &[String],
        message: &str,
        sim_number: Option<i64>,
    ) -> Result<serde_json::Value> {
        let response = self
            .request(reqwest::Method::POST, "/messages")
            .json(&SendRequest {
                phone_numbers,
                message,
                sim_number,
            })
            .send()
            .await
            .context("failed to send message")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status != reqwest::StatusCode::ACCEPTED {
            anyhow::bail!("failed to send message: status {}: {}", status, snippet(&body));
        }

        serde_json::from_str(&body).context("failed to decode send result")
    }
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(BODY_SNIPPET_LEN) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
