//! A generic REST-backed `Provider`. Grounded on the teacher's
//! `scaleway.rs` — same `reqwest::Client` construction with an explicit
//! connect timeout and overall timeout ("default reqwest client has no
//! overall timeout; if the backend stalls, a job can hang forever") and
//! the same header-token auth style — but written against one cloud API
//! shape instead of Scaleway's: a plain REST backend exposing
//! `POST /instances`, `GET /instances/{id}`, `GET /instances`,
//! `DELETE /instances/{id}`, `POST /instances/{id}/start`,
//! `POST /instances/{id}/stop`. The Scaleway-specific diskless-boot and
//! Block Storage volume machinery from the teacher's implementation has
//! no counterpart in this contract and was not carried over.

use crate::{Instance, InstanceState, Provider, ProviderNotFound};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

/// REST API backend reachable over HTTPS with a bearer/header token
/// (spec.md §4.B, §6 Configuration table row "provider credentials").
pub struct HttpProvider {
    client: Client,
    base_url: String,
    auth_header: String,
    auth_token: String,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    id: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    ssh_port: Option<u16>,
    status: String,
}

impl InstanceResponse {
    fn into_instance(self) -> Instance {
        Instance {
            id: self.id,
            ip: self.ip,
            ssh_port: self.ssh_port,
            status: parse_state(&self.status),
        }
    }
}

fn parse_state(s: &str) -> InstanceState {
    match s {
        "active" | "running" => InstanceState::Active,
        "pending" | "booting" | "starting" => InstanceState::Pending,
        "stopped" | "stopping" => InstanceState::Stopped,
        _ => InstanceState::Unknown,
    }
}

impl HttpProvider {
    /// # Errors
    ///
    /// Returns an error if the underlying `reqwest::Client` cannot be
    /// built (TLS backend init failure).
    pub fn new(base_url: String, auth_header: String, auth_token: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build http client for provider")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
            auth_token,
        })
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::HeaderName::from_bytes(self.auth_header.as_bytes())
                .context("invalid auth header name")?,
            reqwest::header::HeaderValue::from_str(&self.auth_token)
                .context("invalid auth token value")?,
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create_instance(
        &self,
        region: &str,
        plan: &str,
        snapshot_id: &str,
        label: &str,
        ssh_key_ids: &[String],
    ) -> Result<Instance> {
        let url = format!("{}/instances", self.base_url);
        let body = json!({
            "region": region,
            "plan": plan,
            "image": snapshot_id,
            "name": label,
            "ssh_key_ids": ssh_key_ids,
        });

        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .context("provider create_instance request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("provider create_instance returned {}", resp.status());
        }

        let parsed: InstanceResponse = resp
            .json()
            .await
            .context("provider create_instance returned malformed body")?;
        Ok(parsed.into_instance())
    }

    async fn wait_for_ready(&self, id: &str, timeout: Duration) -> Result<Instance> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let inst = self.get_instance(id).await?;
            if inst.status == InstanceState::Active && inst.ip.is_some() {
                return Ok(inst);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("provider wait_for_ready timed out for {id}");
            }
            sleep(Duration::from_secs(3)).await;
        }
    }

    async fn get_instance(&self, id: &str) -> Result<Instance> {
        let url = format!("{}/instances/{}", self.base_url, id);
        let resp = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .context("provider get_instance request failed")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!(ProviderNotFound(id.to_string()));
        }
        if !resp.status().is_success() {
            anyhow::bail!("provider get_instance returned {}", resp.status());
        }

        let parsed: InstanceResponse = resp
            .json()
            .await
            .context("provider get_instance returned malformed body")?;
        Ok(parsed.into_instance())
    }

    async fn list_instances(&self, label_filter: Option<&str>) -> Result<Vec<Instance>> {
        let url = format!("{}/instances", self.base_url);
        let mut req = self.client.get(&url).headers(self.headers()?);
        if let Some(name) = label_filter {
            req = req.query(&[("name", name)]);
        }
        let resp = req
            .send()
            .await
            .context("provider list_instances request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("provider list_instances returned {}", resp.status());
        }
        let parsed: Vec<InstanceResponse> = resp
            .json()
            .await
            .context("provider list_instances returned malformed body")?;
        Ok(parsed.into_iter().map(InstanceResponse::into_instance).collect())
    }

    async fn destroy_instance(&self, id: &str) -> Result<()> {
        let url = format!("{}/instances/{}", self.base_url, id);
        let resp = self
            .client
            .delete(&url)
            .headers(self.headers()?)
            .send()
            .await
            .context("provider destroy_instance request failed")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!(ProviderNotFound(id.to_string()));
        }
        if !resp.status().is_success() {
            anyhow::bail!("provider destroy_instance returned {}", resp.status());
        }
        Ok(())
    }

    async fn start_instance(&self, id: &str) -> Result<()> {
        let url = format!("{}/instances/{}/start", self.base_url, id);
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .send()
            .await
            .context("provider start_instance request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("provider start_instance returned {}", resp.status());
        }
        Ok(())
    }

    async fn stop_instance(&self, id: &str) -> Result<()> {
        let url = format!("{}/instances/{}/stop", self.base_url, id);
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .send()
            .await
            .context("provider stop_instance request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("provider stop_instance returned {}", resp.status());
        }
        Ok(())
    }
}
