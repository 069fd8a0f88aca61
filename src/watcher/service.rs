//! Service Watcher (spec §4.2): polls a log-cache reader at a fixed
//! interval and materializes timestamped gauges from the returned
//! envelopes. Ported from `service/watcher.go`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, Opts, Registry};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::identity::{Fingerprint, ServiceDescriptor};
use crate::platform::{GaugeEnvelope, LogCacheClient};
use crate::sanitise::{sanitise_labels, sanitise_name};

const RESERVED_LABELS: [&str; 4] = ["guid", "service", "space", "organisation"];
const EXCLUDED_LABELS: [&str; 5] = ["deployment", "index", "ip", "job", "origin"];
const VALID_UNITS: [&str; 7] = ["percent", "byte", "bytes", "s", "second", "seconds", "ms"];
const READ_RETRY_ATTEMPTS: u32 = 3;
const READ_RETRY_BASE: Duration = Duration::from_secs(1);
const READ_LOOKBACK: Duration = Duration::from_secs(15 * 60);

/// A gauge whose exposed scrape sample carries the timestamp of the most
/// recent envelope that updated it, rather than scrape time. Expresses the
/// source's inheritance-by-embedding wrapper as an explicit tagged record.
struct TimestampedGauge {
    gauge: Gauge,
    last_timestamp_ns: AtomicI64,
}

impl TimestampedGauge {
    fn new(opts: Opts) -> Result<Self> {
        Ok(Self {
            gauge: Gauge::with_opts(opts).map_err(Error::DuplicateRegistration)?,
            last_timestamp_ns: AtomicI64::new(i64::MIN),
        })
    }

    /// Updates the value only if `timestamp_ns` is strictly newer than the
    /// last accepted one. Returns whether the update was applied.
    fn observe(&self, value: f64, timestamp_ns: i64) -> bool {
        let prev = self.last_timestamp_ns.load(Ordering::SeqCst);
        if timestamp_ns > prev {
            self.gauge.set(value);
            self.last_timestamp_ns.store(timestamp_ns, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

impl Collector for TimestampedGauge {
    fn desc(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.gauge.collect();
        let timestamp_ms = self.last_timestamp_ns.load(Ordering::SeqCst) / 1_000_000;
        for family in families.iter_mut() {
            for metric in family.mut_metric().iter_mut() {
                metric.set_timestamp_ms(timestamp_ms);
            }
        }
        families
    }
}

#[derive(Clone)]
pub struct ServiceWatcherHandle {
    cancel: CancellationToken,
}

impl ServiceWatcherHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

pub struct ServiceWatcher {
    guid: String,
    fingerprint: Fingerprint,
    registry: Arc<Registry>,
    base_labels: HashMap<String, String>,
    logcache_client: Box<dyn LogCacheClient>,
    poll_interval: Duration,
    gauges: HashMap<String, Arc<TimestampedGauge>>,
    cancel: CancellationToken,
}

impl ServiceWatcher {
    pub fn new(
        service: &ServiceDescriptor,
        registry: Arc<Registry>,
        logcache_client: Box<dyn LogCacheClient>,
        poll_interval: Duration,
    ) -> (Self, ServiceWatcherHandle) {
        let cancel = CancellationToken::new();
        let mut base_labels = HashMap::new();
        base_labels.insert("guid".to_string(), service.guid.clone());
        base_labels.insert("service".to_string(), service.name.clone());
        base_labels.insert("space".to_string(), service.space_name.clone());
        base_labels.insert("organisation".to_string(), service.org_name.clone());

        let handle = ServiceWatcherHandle { cancel: cancel.clone() };

        let watcher = Self {
            guid: service.guid.clone(),
            fingerprint: service.fingerprint(),
            registry,
            base_labels,
            logcache_client,
            poll_interval,
            gauges: HashMap::new(),
            cancel,
        };

        (watcher, handle)
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Runs the polling loop until cancelled or until all read-retries
    /// exhaust. Unregisters every collector it created on every exit path.
    pub async fn start(mut self) -> Result<()> {
        let result = self.poll_loop().await;
        self.unregister_all();
        result
    }

    async fn poll_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.process_tick().await?;
                }
            }
        }
    }

    async fn process_tick(&mut self) -> Result<()> {
        let since = Utc::now() - chrono::Duration::from_std(READ_LOOKBACK).unwrap();
        let envelopes = self.read_with_retry(since).await?;
        for envelope in envelopes {
            self.handle_gauge_envelope(&envelope)?;
        }
        Ok(())
    }

    async fn read_with_retry(&self, since: chrono::DateTime<Utc>) -> Result<Vec<GaugeEnvelope>> {
        let mut last_err = None;
        for attempt in 1..=READ_RETRY_ATTEMPTS {
            match self.logcache_client.read(&self.guid, since).await {
                Ok(envelopes) => return Ok(envelopes),
                Err(e) => {
                    warn!(
                        "reading log-cache lines for service {} failed (attempt {attempt} of {READ_RETRY_ATTEMPTS}): {e}",
                        self.guid
                    );
                    last_err = Some(e);
                    tokio::time::sleep(READ_RETRY_BASE * attempt).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::LogParse("exhausted log-cache read retries".to_string())))
    }

    fn handle_gauge_envelope(&mut self, envelope: &GaugeEnvelope) -> Result<()> {
        for (name, (value, unit)) in &envelope.metrics {
            let mut gauge_name = name.clone();
            if VALID_UNITS.contains(&unit.as_str()) {
                gauge_name = format!("{gauge_name}_{unit}");
            }

            if !self.gauges.contains_key(&gauge_name) {
                let processed_name = sanitise_name(&gauge_name);
                let mut const_labels = sanitise_labels(&envelope.tags, &RESERVED_LABELS, &EXCLUDED_LABELS);
                for (k, v) in &self.base_labels {
                    const_labels.insert(k.clone(), v.clone());
                }

                let gauge = TimestampedGauge::new(Opts::new(processed_name, format!("Gauge for {gauge_name}")).const_labels(const_labels))?;
                let gauge = Arc::new(gauge);
                self.registry
                    .register(Box::new(GaugeHandle(gauge.clone())))
                    .map_err(Error::DuplicateRegistration)?;
                self.gauges.insert(gauge_name.clone(), gauge);
            }

            let gauge = self.gauges.get(&gauge_name).expect("just inserted");
            gauge.observe(*value, envelope.timestamp_ns);
        }
        Ok(())
    }

    fn unregister_all(&mut self) {
        for (_, gauge) in self.gauges.drain() {
            let _ = self.registry.unregister(Box::new(GaugeHandle(gauge)));
        }
    }
}

/// `Registry::unregister` takes ownership of a `Box<dyn Collector>` and
/// compares descriptors, so a second, independent handle to the same
/// underlying gauge is required to unregister it later without holding
/// the original box alive for the gauge's whole lifetime.
struct GaugeHandle(Arc<TimestampedGauge>);

impl Collector for GaugeHandle {
    fn desc(&self) -> Vec<&Desc> {
        self.0.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.collect()
    }
}
