//! Per-app server-sent envelope stream, parsed incrementally off a
//! `reqwest` byte stream. Spec.md's "streaming transport" collaborator —
//! this is the only piece of the crate that speaks the wire format; the
//! `AppWatcher` only ever sees the `Envelope` enum.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Error;

use super::{
    AppStreamProvider, ContainerMetric, Envelope, GaugeEnvelope, HttpStartStop, LogMessage,
    LogMessageType, PeerType,
};

const CHANNEL_CAPACITY: usize = 64;

pub struct SseAppStreamProvider {
    http: reqwest::Client,
    api_endpoint: String,
    app_guid: String,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl SseAppStreamProvider {
    pub fn new(http: reqwest::Client, api_endpoint: String, app_guid: String) -> Self {
        Self {
            http,
            api_endpoint,
            app_guid,
            cancel: None,
            task: None,
        }
    }
}

#[async_trait]
impl AppStreamProvider for SseAppStreamProvider {
    async fn start(&mut self) -> (mpsc::Receiver<Envelope>, mpsc::Receiver<Error>) {
        let (envelope_tx, envelope_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let url = format!("{}/apps/{}/stream", self.api_endpoint, self.app_guid);
        let http = self.http.clone();
        let guid = self.app_guid.clone();

        let task = tokio::spawn(async move {
            let result = pump(http, &url, &envelope_tx, cancel.clone()).await;
            if let Err(e) = result {
                if !cancel.is_cancelled() {
                    let _ = error_tx
                        .send(Error::WatcherStreamClosed {
                            guid,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        });
        self.task = Some(task);

        (envelope_rx, error_rx)
    }

    async fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn pump(
    http: reqwest::Client,
    url: &str,
    envelope_tx: &mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) -> std::result::Result<(), reqwest::Error> {
    let response = http.get(url).send().await?.error_for_status()?;
    let mut stream = response.bytes_stream();
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            chunk = stream.next() => {
                let Some(chunk) = chunk else { return Ok(()) };
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.windows(2).position(|w| w == b"\n\n") {
                    let frame = buf.split_to(pos + 2);
                    if let Some(envelope) = parse_frame(&frame) {
                        if envelope_tx.send(envelope).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct WireContainerMetric {
    instance_index: i32,
    cpu_percentage: f64,
    disk_bytes: u64,
    disk_bytes_quota: u64,
    memory_bytes: u64,
    memory_bytes_quota: u64,
}

#[derive(Deserialize)]
struct WireLogMessage {
    source_type: String,
    message_type: String,
    message: String,
}

#[derive(Deserialize)]
struct WireHttpStartStop {
    peer_type: Option<String>,
    instance_index: i32,
    start_timestamp: i64,
    stop_timestamp: i64,
    status_code: i32,
}

#[derive(Deserialize)]
struct WireGauge {
    source_id: String,
    timestamp: i64,
    tags: BTreeMap<String, String>,
    metrics: BTreeMap<String, WireGaugeValue>,
}

#[derive(Deserialize)]
struct WireGaugeValue {
    value: f64,
    unit: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireEnvelope {
    #[serde(rename = "log")]
    Log(WireLogMessage),
    #[serde(rename = "container_metric")]
    ContainerMetric(WireContainerMetric),
    #[serde(rename = "http_start_stop")]
    HttpStartStop(WireHttpStartStop),
    #[serde(rename = "gauge")]
    Gauge(WireGauge),
}

/// A frame is one `data: <json>\n\n` block.
fn parse_frame(frame: &[u8]) -> Option<Envelope> {
    let text = std::str::from_utf8(frame).ok()?;
    let payload = text
        .lines()
        .find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))?;

    match serde_json::from_str::<WireEnvelope>(payload.trim()) {
        Ok(WireEnvelope::Log(m)) => Some(Envelope::LogMessage(LogMessage {
            source_type: m.source_type,
            message_type: if m.message_type == "OUT" {
                LogMessageType::Out
            } else {
                LogMessageType::Err
            },
            message: m.message.into_bytes(),
        })),
        Ok(WireEnvelope::ContainerMetric(m)) => Some(Envelope::ContainerMetric(ContainerMetric {
            instance_index: m.instance_index,
            cpu_percentage: m.cpu_percentage,
            disk_bytes: m.disk_bytes,
            disk_bytes_quota: m.disk_bytes_quota,
            memory_bytes: m.memory_bytes,
            memory_bytes_quota: m.memory_bytes_quota,
        })),
        Ok(WireEnvelope::HttpStartStop(m)) => Some(Envelope::HttpStartStop(HttpStartStop {
            peer_type: m.peer_type.map(|p| {
                if p == "Server" {
                    PeerType::Server
                } else {
                    PeerType::Client
                }
            }),
            instance_index: m.instance_index,
            start_timestamp_ns: m.start_timestamp,
            stop_timestamp_ns: m.stop_timestamp,
            status_code: m.status_code,
        })),
        Ok(WireEnvelope::Gauge(g)) => Some(Envelope::Gauge(GaugeEnvelope {
            source_id: g.source_id,
            timestamp_ns: g.timestamp,
            tags: g.tags,
            metrics: g
                .metrics
                .into_iter()
                .map(|(k, v)| (k, (v.value, v.unit)))
                .collect(),
        })),
        Err(e) => {
            warn!("failed to parse stream frame, skipping: {e}");
            None
        }
    }
}
