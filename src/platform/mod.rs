//! Trait boundaries for the platform's external collaborators
//! (API client, per-app stream, log-cache reader) and the envelope types
//! that flow across them. Concrete, network-backed implementations live in
//! `client`, `stream`, and `logcache`; tests substitute plain fakes.

pub mod client;
pub mod logcache;
pub mod stream;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identity::{AppDescriptor, ServiceDescriptor};

/// Client side vs. server side of an HTTP request/response pair, as
/// reported by the telemetry stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub source_type: String,
    pub message_type: LogMessageType,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMessageType {
    Out,
    Err,
}

#[derive(Debug, Clone)]
pub struct ContainerMetric {
    pub instance_index: i32,
    pub cpu_percentage: f64,
    pub disk_bytes: u64,
    pub disk_bytes_quota: u64,
    pub memory_bytes: u64,
    pub memory_bytes_quota: u64,
}

#[derive(Debug, Clone)]
pub struct HttpStartStop {
    pub peer_type: Option<PeerType>,
    pub instance_index: i32,
    pub start_timestamp_ns: i64,
    pub stop_timestamp_ns: i64,
    pub status_code: i32,
}

#[derive(Debug, Clone)]
pub struct GaugeEnvelope {
    pub source_id: String,
    pub timestamp_ns: i64,
    pub tags: BTreeMap<String, String>,
    /// metric name -> (value, unit)
    pub metrics: BTreeMap<String, (f64, String)>,
}

#[derive(Debug, Clone)]
pub enum Envelope {
    LogMessage(LogMessage),
    ContainerMetric(ContainerMetric),
    HttpStartStop(HttpStartStop),
    Gauge(GaugeEnvelope),
}

/// Enumerates apps and service instances with joined space/org names,
/// and mints per-app stream providers and a log-cache reader.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn list_apps_with_space_and_org(&self) -> Result<Vec<AppDescriptor>>;
    async fn list_services_with_space_and_org(&self) -> Result<Vec<ServiceDescriptor>>;

    fn new_app_stream_provider(&self, app_guid: &str) -> Box<dyn AppStreamProvider>;
    fn new_log_cache_client(&self) -> Box<dyn LogCacheClient>;
}

/// A single app's long-lived telemetry subscription. `start` returns a
/// pair of channels: envelopes in arrival order, and a terminal error (if
/// any) delivered exactly once before the envelope channel closes.
#[async_trait]
pub trait AppStreamProvider: Send + Sync {
    async fn start(&mut self) -> (mpsc::Receiver<Envelope>, mpsc::Receiver<crate::error::Error>);
    async fn close(&mut self);
}

/// A log-cache query API client, used by the Service Watcher's polling
/// loop.
#[async_trait]
pub trait LogCacheClient: Send + Sync {
    async fn read(&self, source_id: &str, since: DateTime<Utc>) -> Result<Vec<GaugeEnvelope>>;
}
