//! App Watcher (spec §4.1): translates one app's telemetry stream into
//! Prometheus metric updates and tracks per-instance metric sets as scale
//! changes. Ported from `app/watcher.go`.

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::identity::{AppDescriptor, Fingerprint};
use crate::platform::{AppStreamProvider, ContainerMetric, Envelope, HttpStartStop, LogMessage, LogMessageType, PeerType};

const STATUS_RANGES: [&str; 4] = ["2xx", "3xx", "4xx", "5xx"];
const UPDATE_CHANNEL_CAPACITY: usize = 5;
const EXIT_LOG_PREFIX: &[u8] = b"App instance exited with guid ";
const PAYLOAD_MARKER: &[u8] = b" payload: {";

/// The eight collectors owned by one app instance index.
struct InstanceMetricSet {
    cpu: Gauge,
    disk_bytes: Gauge,
    disk_utilization: Gauge,
    memory_bytes: Gauge,
    memory_utilization: Gauge,
    crash: Counter,
    requests: CounterVec,
    response_time: HistogramVec,
}

impl InstanceMetricSet {
    fn new(index: u32, registry: &Registry, base_labels: &HashMap<String, String>) -> Result<Self> {
        let mut labels = base_labels.clone();
        labels.insert("instance".to_string(), index.to_string());

        let cpu = Gauge::with_opts(Opts::new("cpu", "CPU utilisation in percent (0-100)").const_labels(labels.clone()))
            .map_err(Error::DuplicateRegistration)?;
        let disk_bytes = Gauge::with_opts(Opts::new("disk_bytes", "Disk usage in bytes").const_labels(labels.clone()))
            .map_err(Error::DuplicateRegistration)?;
        let disk_utilization = Gauge::with_opts(
            Opts::new("disk_utilization", "Disk space currently in use in percent (0-100)").const_labels(labels.clone()),
        )
        .map_err(Error::DuplicateRegistration)?;
        let memory_bytes = Gauge::with_opts(Opts::new("memory_bytes", "Memory usage in bytes").const_labels(labels.clone()))
            .map_err(Error::DuplicateRegistration)?;
        let memory_utilization = Gauge::with_opts(
            Opts::new("memory_utilization", "Memory currently in use in percent (0-100)").const_labels(labels.clone()),
        )
        .map_err(Error::DuplicateRegistration)?;
        let crash = Counter::with_opts(Opts::new("crash", "Number of app instance crashes").const_labels(labels.clone()))
            .map_err(Error::DuplicateRegistration)?;
        let requests = CounterVec::new(
            Opts::new("requests", "Counter of http requests for a given app instance").const_labels(labels.clone()),
            &["status_range"],
        )
        .map_err(Error::DuplicateRegistration)?;
        let response_time = HistogramVec::new(
            HistogramOpts::new("response_time", "Histogram of http request time for a given app instance")
                .const_labels(labels),
            &["status_range"],
        )
        .map_err(Error::DuplicateRegistration)?;

        // Pre-initialise every status_range bucket so empty series appear on the first scrape.
        for status_range in STATUS_RANGES {
            requests.with_label_values(&[status_range]);
            response_time.with_label_values(&[status_range]);
        }

        registry.register(Box::new(cpu.clone())).map_err(Error::DuplicateRegistration)?;
        registry.register(Box::new(disk_bytes.clone())).map_err(Error::DuplicateRegistration)?;
        registry
            .register(Box::new(disk_utilization.clone()))
            .map_err(Error::DuplicateRegistration)?;
        registry.register(Box::new(memory_bytes.clone())).map_err(Error::DuplicateRegistration)?;
        registry
            .register(Box::new(memory_utilization.clone()))
            .map_err(Error::DuplicateRegistration)?;
        registry.register(Box::new(crash.clone())).map_err(Error::DuplicateRegistration)?;
        registry.register(Box::new(requests.clone())).map_err(Error::DuplicateRegistration)?;
        registry
            .register(Box::new(response_time.clone()))
            .map_err(Error::DuplicateRegistration)?;

        Ok(Self {
            cpu,
            disk_bytes,
            disk_utilization,
            memory_bytes,
            memory_utilization,
            crash,
            requests,
            response_time,
        })
    }

    fn unregister(&self, registry: &Registry) {
        let _ = registry.unregister(Box::new(self.cpu.clone()));
        let _ = registry.unregister(Box::new(self.disk_bytes.clone()));
        let _ = registry.unregister(Box::new(self.disk_utilization.clone()));
        let _ = registry.unregister(Box::new(self.memory_bytes.clone()));
        let _ = registry.unregister(Box::new(self.memory_utilization.clone()));
        let _ = registry.unregister(Box::new(self.crash.clone()));
        let _ = registry.unregister(Box::new(self.requests.clone()));
        let _ = registry.unregister(Box::new(self.response_time.clone()));
    }
}

/// Non-blocking handle a discovery loop uses to notify a running watcher
/// that the desired instance count has changed, and to request shutdown.
#[derive(Clone)]
pub struct AppWatcherHandle {
    update_tx: mpsc::Sender<u32>,
    cancel: CancellationToken,
}

impl AppWatcherHandle {
    /// Best-effort: if the bounded buffer is full, the next reconcile tick
    /// will notify again.
    pub fn update_instances(&self, n: u32) {
        if self.update_tx.try_send(n).is_err() {
            warn!("instance-count update dropped, buffer full; next tick will retry");
        }
    }

    /// Idempotent; safe to call before or after `start` completes.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

pub struct AppWatcher {
    guid: String,
    fingerprint: Fingerprint,
    initial_instances: u32,
    registry: Arc<Registry>,
    base_labels: HashMap<String, String>,
    stream_provider: Box<dyn AppStreamProvider>,
    instances: Vec<InstanceMetricSet>,
    update_rx: mpsc::Receiver<u32>,
    cancel: CancellationToken,
}

impl AppWatcher {
    pub fn new(app: &AppDescriptor, registry: Arc<Registry>, stream_provider: Box<dyn AppStreamProvider>) -> (Self, AppWatcherHandle) {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let mut base_labels = HashMap::new();
        base_labels.insert("guid".to_string(), app.guid.clone());
        base_labels.insert("app".to_string(), app.name.clone());
        base_labels.insert("space".to_string(), app.space_name.clone());
        base_labels.insert("organisation".to_string(), app.org_name.clone());

        let handle = AppWatcherHandle {
            update_tx,
            cancel: cancel.clone(),
        };

        let watcher = Self {
            guid: app.guid.clone(),
            fingerprint: app.fingerprint(),
            initial_instances: app.instances,
            registry,
            base_labels,
            stream_provider,
            instances: Vec::new(),
            update_rx,
            cancel,
        };

        (watcher, handle)
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Opens the stream, registers the initial metric sets, and runs until
    /// cancellation or stream failure. Unregisters every collector it
    /// registered on every exit path.
    pub async fn start(mut self) -> Result<()> {
        let (mut envelopes, mut errors) = self.stream_provider.start().await;

        let result = match self.scale_to(self.initial_instances) {
            Ok(()) => self.main_loop(&mut envelopes, &mut errors).await,
            Err(e) => Err(e),
        };

        self.stream_provider.close().await;
        let _ = self.scale_to(0);

        result
    }

    async fn main_loop(
        &mut self,
        envelopes: &mut mpsc::Receiver<Envelope>,
        errors: &mut mpsc::Receiver<Error>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                maybe_env = envelopes.recv() => {
                    match maybe_env {
                        Some(envelope) => self.handle_envelope(envelope)?,
                        None => {
                            return Err(Error::WatcherStreamClosed {
                                guid: self.guid.clone(),
                                reason: "envelope channel closed".to_string(),
                            });
                        }
                    }
                }
                maybe_err = errors.recv() => {
                    match maybe_err {
                        Some(err) => return Err(err),
                        None => {
                            return Err(Error::WatcherStreamClosed {
                                guid: self.guid.clone(),
                                reason: "error channel closed".to_string(),
                            });
                        }
                    }
                }
                maybe_n = self.update_rx.recv() => {
                    if let Some(n) = maybe_n {
                        self.scale_to(n)?;
                    }
                }
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::ContainerMetric(m) => self.process_container_metric(m),
            Envelope::LogMessage(m) => self.process_log_message(m)?,
            Envelope::HttpStartStop(m) => self.process_http_start_stop(m),
            Envelope::Gauge(_) => {}
        }
        Ok(())
    }

    fn process_container_metric(&self, metric: ContainerMetric) {
        let index = metric.instance_index;
        if index < 0 || index as usize >= self.instances.len() {
            return;
        }
        let instance = &self.instances[index as usize];

        let disk_utilization = metric.disk_bytes as f64 / metric.disk_bytes_quota as f64 * 100.0;
        let memory_utilization = metric.memory_bytes as f64 / metric.memory_bytes_quota as f64 * 100.0;

        instance.cpu.set(metric.cpu_percentage);
        instance.disk_bytes.set(metric.disk_bytes as f64);
        instance.disk_utilization.set(disk_utilization);
        instance.memory_bytes.set(metric.memory_bytes as f64);
        instance.memory_utilization.set(memory_utilization);
    }

    fn process_log_message(&self, message: LogMessage) -> Result<()> {
        if message.source_type != "API" || message.message_type != LogMessageType::Out {
            return Ok(());
        }
        if !message.message.starts_with(EXIT_LOG_PREFIX) {
            return Ok(());
        }

        let marker_pos = find_subslice(&message.message, PAYLOAD_MARKER).ok_or_else(|| {
            Error::LogParse(format!(
                "unable to find start of payload in app instance exit log: {}",
                String::from_utf8_lossy(&message.message)
            ))
        })?;
        let payload_start = marker_pos + PAYLOAD_MARKER.len() - 1;
        let payload = &message.message[payload_start..];

        // The source emits a Ruby-style hash literal; turn it into JSON.
        let payload_json = String::from_utf8_lossy(payload).replace("=>", ":");

        let parsed: ExitLogPayload =
            serde_json::from_str(&payload_json).map_err(|e| Error::LogParse(format!("unable to parse payload in app instance exit log: {e}")))?;

        if parsed.reason != "CRASHED" {
            return Ok(());
        }

        if parsed.index >= 0 && (parsed.index as usize) < self.instances.len() {
            self.instances[parsed.index as usize].crash.inc();
        }
        Ok(())
    }

    fn process_http_start_stop(&self, event: HttpStartStop) {
        if event.peer_type == Some(PeerType::Server) {
            return;
        }

        let duration_seconds = (event.stop_timestamp_ns - event.start_timestamp_ns) as f64 / 1_000_000_000.0;
        let index = event.instance_index;
        if index < 0 || index as usize >= self.instances.len() {
            return;
        }

        let status_range = format!("{}xx", event.status_code / 100);
        let instance = &self.instances[index as usize];
        instance.requests.with_label_values(&[&status_range]).inc();
        instance.response_time.with_label_values(&[&status_range]).observe(duration_seconds);
    }

    /// Registers new instance metric sets for `[current, n)` if scaling up,
    /// or unregisters `[n, current)` in reverse order if scaling down.
    fn scale_to(&mut self, n: u32) -> Result<()> {
        let current = self.instances.len() as u32;

        if current < n {
            for index in current..n {
                let set = InstanceMetricSet::new(index, &self.registry, &self.base_labels)?;
                self.instances.push(set);
            }
        } else {
            for set in self.instances.drain(n as usize..).rev() {
                set.unregister(&self.registry);
            }
        }

        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct ExitLogPayload {
    index: i64,
    reason: String,
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
