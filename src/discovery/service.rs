//! Service Discovery Loop (spec §4.4): reconciles the set of Service
//! Watchers against the platform's full service instance list. Ported
//! from `service/discovery.go`.
//!
//! Unlike the App Discovery Loop, there is no state gate (all returned
//! service instances are tracked) and no rescale notification — a
//! service instance has no instance count to track, so a rename is the
//! only reconcile event besides create/destroy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::identity::{Fingerprint, ServiceDescriptor};
use crate::platform::PlatformClient;
use crate::watcher::{ServiceWatcher, ServiceWatcherHandle};

struct ServiceEntry {
    fingerprint: Fingerprint,
    handle: ServiceWatcherHandle,
    incarnation: u64,
}

/// Reconciles the watcher table against `ListServicesWithSpaceAndOrg`
/// every `check_interval`. List failures are fatal and propagate out of
/// `run`; per-watcher failures are absorbed and the entry is dropped so
/// the next tick recreates it.
pub struct ServiceDiscoveryLoop {
    client: Arc<dyn PlatformClient>,
    registry: Arc<Registry>,
    poll_interval: Duration,
    check_interval: Duration,
    table: Arc<Mutex<HashMap<String, ServiceEntry>>>,
    next_incarnation: AtomicU64,
    cancel: CancellationToken,
}

impl ServiceDiscoveryLoop {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        registry: Arc<Registry>,
        poll_interval: Duration,
        check_interval: Duration,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            registry,
            poll_interval,
            check_interval,
            table: Arc::new(Mutex::new(HashMap::new())),
            next_incarnation: AtomicU64::new(0),
            cancel: parent.child_token(),
        })
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.shutdown();
                        return Ok(());
                    }
                    _ = tokio::time::sleep(self.check_interval) => {}
                }
            }
            first = false;

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown();
                    return Ok(());
                }
                result = self.reconcile() => {
                    if let Err(e) = result {
                        self.shutdown();
                        return Err(e);
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        let entries: Vec<ServiceEntry> = self.table.lock().unwrap().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.handle.close();
        }
    }

    async fn reconcile(&self) -> Result<()> {
        info!("checking for new services");
        let services = self.client.list_services_with_space_and_org().await?;

        let mut running = HashSet::new();
        for service in &services {
            running.insert(service.guid.clone());
            self.reconcile_one(service);
        }

        let stale: Vec<String> = {
            let table = self.table.lock().unwrap();
            table.keys().filter(|g| !running.contains(*g)).cloned().collect()
        };
        for guid in stale {
            self.destroy_watcher(&guid);
        }

        Ok(())
    }

    fn reconcile_one(&self, service: &ServiceDescriptor) {
        let existing = {
            let table = self.table.lock().unwrap();
            table.get(&service.guid).map(|e| e.fingerprint.clone())
        };

        match existing {
            Some(fingerprint) if fingerprint != service.fingerprint() => {
                // Name, space, or org changed: destroy before recreate so
                // stale constant-label series vanish before replacements
                // register.
                self.destroy_watcher(&service.guid);
                self.create_watcher(service);
            }
            Some(_) => {
                // No instance count to rescale; nothing else changes on
                // an unchanged fingerprint.
            }
            None => {
                self.create_watcher(service);
            }
        }
    }

    fn create_watcher(&self, service: &ServiceDescriptor) {
        let logcache_client = self.client.new_log_cache_client();
        let (watcher, handle) = ServiceWatcher::new(service, self.registry.clone(), logcache_client, self.poll_interval);
        let incarnation = self.next_incarnation.fetch_add(1, Ordering::SeqCst);

        self.table.lock().unwrap().insert(
            service.guid.clone(),
            ServiceEntry {
                fingerprint: service.fingerprint(),
                handle,
                incarnation,
            },
        );

        let guid = service.guid.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.start().await {
                warn!("service watcher for {guid} failed: {e}");
                let mut table = table.lock().unwrap();
                if table.get(&guid).map(|e| e.incarnation) == Some(incarnation) {
                    table.remove(&guid);
                }
            }
        });
    }

    fn destroy_watcher(&self, guid: &str) {
        let entry = self.table.lock().unwrap().remove(guid);
        if let Some(entry) = entry {
            entry.handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::identity::AppDescriptor;
    use crate::platform::{AppStreamProvider, Envelope, GaugeEnvelope, LogCacheClient};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct NoopLogCache;

    #[async_trait]
    impl LogCacheClient for NoopLogCache {
        async fn read(&self, _source_id: &str, _since: DateTime<Utc>) -> Result<Vec<GaugeEnvelope>> {
            Ok(vec![])
        }
    }

    struct NoopStreamProvider;

    #[async_trait]
    impl AppStreamProvider for NoopStreamProvider {
        async fn start(&mut self) -> (mpsc::Receiver<Envelope>, mpsc::Receiver<Error>) {
            let (_etx, erx) = mpsc::channel(1);
            let (_ftx, frx) = mpsc::channel(1);
            (erx, frx)
        }
        async fn close(&mut self) {}
    }

    struct FakePlatform {
        services: Mutex<Vec<ServiceDescriptor>>,
        list_calls: AtomicUsize,
    }

    #[async_trait]
    impl PlatformClient for FakePlatform {
        async fn list_apps_with_space_and_org(&self) -> Result<Vec<AppDescriptor>> {
            Ok(vec![])
        }
        async fn list_services_with_space_and_org(&self) -> Result<Vec<ServiceDescriptor>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.services.lock().unwrap().clone())
        }
        fn new_app_stream_provider(&self, _app_guid: &str) -> Box<dyn AppStreamProvider> {
            Box::new(NoopStreamProvider)
        }
        fn new_log_cache_client(&self) -> Box<dyn LogCacheClient> {
            Box::new(NoopLogCache)
        }
    }

    fn service(guid: &str, name: &str, space: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            guid: guid.into(),
            name: name.into(),
            space_name: space.into(),
            org_name: "o".into(),
        }
    }

    #[tokio::test]
    async fn create_reconcile_registers_one_watcher() {
        let registry = Arc::new(Registry::new());
        let platform = Arc::new(FakePlatform {
            services: Mutex::new(vec![service("g1", "db", "s")]),
            list_calls: AtomicUsize::new(0),
        });
        let loop_ = ServiceDiscoveryLoop::new(
            platform,
            registry,
            Duration::from_secs(60),
            Duration::from_secs(300),
            &CancellationToken::new(),
        );
        loop_.reconcile().await.unwrap();
        assert_eq!(loop_.table.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_service_is_destroyed() {
        let registry = Arc::new(Registry::new());
        let platform = Arc::new(FakePlatform {
            services: Mutex::new(vec![service("g1", "db", "s")]),
            list_calls: AtomicUsize::new(0),
        });
        let loop_ = ServiceDiscoveryLoop::new(
            platform.clone(),
            registry,
            Duration::from_secs(60),
            Duration::from_secs(300),
            &CancellationToken::new(),
        );
        loop_.reconcile().await.unwrap();
        assert_eq!(loop_.table.lock().unwrap().len(), 1);

        *platform.services.lock().unwrap() = vec![];
        loop_.reconcile().await.unwrap();
        assert_eq!(loop_.table.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn rename_destroys_and_recreates() {
        let registry = Arc::new(Registry::new());
        let platform = Arc::new(FakePlatform {
            services: Mutex::new(vec![service("g1", "db", "s")]),
            list_calls: AtomicUsize::new(0),
        });
        let loop_ = ServiceDiscoveryLoop::new(
            platform.clone(),
            registry,
            Duration::from_secs(60),
            Duration::from_secs(300),
            &CancellationToken::new(),
        );
        loop_.reconcile().await.unwrap();
        let incarnation_before = loop_.table.lock().unwrap().get("g1").unwrap().incarnation;

        *platform.services.lock().unwrap() = vec![service("g1", "db", "s2")];
        loop_.reconcile().await.unwrap();

        let incarnation_after = loop_.table.lock().unwrap().get("g1").unwrap().incarnation;
        assert_ne!(incarnation_before, incarnation_after);
        assert_eq!(loop_.table.lock().unwrap().get("g1").unwrap().fingerprint.space_name, "s2");
    }

    #[tokio::test]
    async fn idempotent_reconcile_with_unchanged_list() {
        let registry = Arc::new(Registry::new());
        let platform = Arc::new(FakePlatform {
            services: Mutex::new(vec![service("g1", "db", "s")]),
            list_calls: AtomicUsize::new(0),
        });
        let loop_ = ServiceDiscoveryLoop::new(
            platform,
            registry,
            Duration::from_secs(60),
            Duration::from_secs(300),
            &CancellationToken::new(),
        );
        loop_.reconcile().await.unwrap();
        let incarnation_before = loop_.table.lock().unwrap().get("g1").unwrap().incarnation;
        loop_.reconcile().await.unwrap();
        let incarnation_after = loop_.table.lock().unwrap().get("g1").unwrap().incarnation;
        assert_eq!(incarnation_before, incarnation_after);
    }
}
