//! Document-QA client (`POST /query`)

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::check_status;
use crate::client::api::{DocumentQa, QaAnswer};
use crate::shared::config::SyncConfig;
use crate::shared::error::{Result, SyncError};

// Retrieval plus generation can be slow
const QA_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    k: usize,
}

#[derive(Debug, Clone)]
pub struct QaClient {
    client: Client,
    url: String,
    top_k: usize,
}

impl QaClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(QA_TIMEOUT)
            .build()
            .map_err(|e| SyncError::config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config.qa_endpoint("/query"),
            top_k: config.qa_top_k,
        })
    }
}

#[async_trait]
impl DocumentQa for QaClient {
    async fn ask(&self, question: &str) -> Result<QaAnswer> {
        tracing::debug!("[Http] POST {} (k={})", self.url, self.top_k);
        let response = self
            .client
            .post(&self.url)
            .json(&QueryRequest {
                query: question,
                k: self.top_k,
            })
            .send()
            .await
            .map_err(|e| SyncError::fetch("qa", e.to_string()))?;
        let response = check_status(response, |msg| SyncError::fetch("qa", msg)).await?;
        Ok(response.json().await?)
    }
}
