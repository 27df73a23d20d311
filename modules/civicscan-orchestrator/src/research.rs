//! The research collaborator: one call per jurisdiction returning candidates.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use civicscan_common::{Candidate, Depth};

#[async_trait]
pub trait Researcher: Send + Sync {
    async fn research(
        &self,
        jurisdiction: &str,
        data_types: &[String],
        depth: Depth,
    ) -> Result<Vec<Candidate>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResearchRequest<'a> {
    jurisdiction: &'a str,
    data_types: &'a [String],
    depth: Depth,
}

/// The research service may answer with a bare array or an envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum ResearchResponse {
    Bare(Vec<Candidate>),
    Envelope { candidates: Vec<Candidate> },
}

/// Researcher backed by an HTTP research service.
pub struct HttpResearcher {
    http: Client,
    url: String,
}

impl HttpResearcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build research HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Researcher for HttpResearcher {
    async fn research(
        &self,
        jurisdiction: &str,
        data_types: &[String],
        depth: Depth,
    ) -> Result<Vec<Candidate>> {
        info!(jurisdiction, depth = %depth, "Requesting research");

        let resp = self
            .http
            .post(&self.url)
            .json(&ResearchRequest {
                jurisdiction,
                data_types,
                depth,
            })
            .send()
            .await
            .context("Research service unreachable")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Research service returned HTTP {}: {body}", status.as_u16());
        }

        let parsed: ResearchResponse = resp
            .json()
            .await
            .context("Research service returned malformed candidates")?;
        Ok(match parsed {
            ResearchResponse::Bare(candidates) => candidates,
            ResearchResponse::Envelope { candidates } => candidates,
        })
    }
}
