/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use peerlens_protocol::{SdpKind, SessionDescription};
use std::time::Duration;
use tracing::info;

use crate::negotiation::OfferEndpoint;

/// Posts the local offer to `{api_url}/offer` and returns the server's answer.
///
/// One attempt; a failure closes the session like any other negotiation error.
pub struct ServerOfferClient {
    http: reqwest::Client,
    url: String,
}

impl ServerOfferClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            url: format!("{}/offer", api_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl OfferEndpoint for ServerOfferClient {
    async fn exchange(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        info!(url = %self.url, "posting offer to server");
        let resp = self
            .http
            .post(&self.url)
            .json(offer)
            .send()
            .await
            .with_context(|| format!("post {}", self.url))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("offer post failed: {} {}", status, text));
        }
        let answer: SessionDescription = serde_json::from_str(&text).context("parse answer")?;
        if answer.kind != SdpKind::Answer {
            return Err(anyhow!("server replied with {:?}, expected answer", answer.kind));
        }
        Ok(answer)
    }
}
