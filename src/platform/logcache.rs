//! log-cache query API client used by the Service Watcher's polling loop.
//! Read failures are retried by the caller (`watcher::service`), not here —
//! this module only performs the single HTTP query.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};

use super::{GaugeEnvelope, LogCacheClient};

pub struct HttpLogCacheClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpLogCacheClient {
    pub fn new(http: reqwest::Client, endpoint: String) -> Self {
        Self { http, endpoint }
    }
}

#[derive(Deserialize)]
struct ReadResponse {
    envelopes: EnvelopeBatch,
}

#[derive(Deserialize)]
struct EnvelopeBatch {
    batch: Vec<WireGaugeEnvelope>,
}

#[derive(Deserialize)]
struct WireGaugeEnvelope {
    #[serde(rename = "sourceId")]
    source_id: String,
    timestamp: String,
    tags: BTreeMap<String, String>,
    gauge: Option<WireGauge>,
}

#[derive(Deserialize)]
struct WireGauge {
    metrics: BTreeMap<String, WireGaugeValue>,
}

#[derive(Deserialize)]
struct WireGaugeValue {
    value: f64,
    unit: String,
}

#[async_trait]
impl LogCacheClient for HttpLogCacheClient {
    async fn read(&self, source_id: &str, since: DateTime<Utc>) -> Result<Vec<GaugeEnvelope>> {
        let url = format!("{}/v1/read/{}", self.endpoint.trim_end_matches('/'), source_id);
        let resp: ReadResponse = self
            .http
            .get(&url)
            .query(&[
                ("start_time", since.timestamp_nanos_opt().unwrap_or_default().to_string()),
                ("envelope_types", "GAUGE".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::LogCacheRead {
                guid: source_id.to_string(),
                source: e,
            })?
            .error_for_status()
            .map_err(|e| Error::LogCacheRead {
                guid: source_id.to_string(),
                source: e,
            })?
            .json()
            .await
            .map_err(|e| Error::LogCacheRead {
                guid: source_id.to_string(),
                source: e,
            })?;

        Ok(resp
            .envelopes
            .batch
            .into_iter()
            .filter_map(|e| {
                let gauge = e.gauge?;
                let timestamp_ns: i64 = e.timestamp.parse().ok()?;
                Some(GaugeEnvelope {
                    source_id: e.source_id,
                    timestamp_ns,
                    tags: e.tags,
                    metrics: gauge
                        .metrics
                        .into_iter()
                        .map(|(k, v)| (k, (v.value, v.unit)))
                        .collect(),
                })
            })
            .collect())
    }
}
