//! [`BulkWriter`] posting telemetry batches to the Elasticsearch `_bulk` API.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;

use crate::{
    config::models::ElasticSearchConfig,
    core::telemetry::TelemetryRecord,
    ports::telemetry::{BulkWriter, TelemetryError},
};

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

pub struct ElasticsearchWriter {
    http: Client,
    bulk_url: String,
    index: String,
    credentials: Option<(String, String)>,
    request_timeout: Duration,
}

impl ElasticsearchWriter {
    pub fn new(config: &ElasticSearchConfig) -> eyre::Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| eyre::eyre!("Failed to build Elasticsearch client: {e}"))?;
        let credentials = (!config.username.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));

        tracing::info!(url = %config.base_url(), index = %config.index, "Elasticsearch writer ready");
        Ok(Self {
            http,
            bulk_url: format!("{}/_bulk", config.base_url()),
            index: config.index.clone(),
            credentials,
            request_timeout: Duration::from_secs(config.request_timeout.max(1)),
        })
    }

    /// One action line plus one document line per record.
    fn encode(&self, records: &[TelemetryRecord]) -> Result<String, TelemetryError> {
        let action = serde_json::json!({ "index": { "_index": self.index } }).to_string();
        let mut body = String::new();
        for record in records {
            let doc = serde_json::to_string(record)
                .map_err(|e| TelemetryError::Request(e.to_string()))?;
            body.push_str(&action);
            body.push('\n');
            body.push_str(&doc);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl BulkWriter for ElasticsearchWriter {
    async fn bulk_index(&self, records: &[TelemetryRecord]) -> Result<(), TelemetryError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut request = self
            .http
            .post(&self.bulk_url)
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .timeout(self.request_timeout)
            .body(self.encode(records)?);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TelemetryError::Timeout(self.request_timeout)
            } else {
                TelemetryError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Request(format!("bulk returned {status}: {reason}")));
        }

        let bulk: BulkResponse = response
            .json()
            .await
            .map_err(|e| TelemetryError::Request(e.to_string()))?;
        if bulk.errors {
            let failed = bulk
                .items
                .iter()
                .filter(|item| item.get("index").and_then(|i| i.get("error")).is_some())
                .count();
            return Err(TelemetryError::Rejected {
                failed,
                total: records.len(),
            });
        }
        Ok(())
    }
}
