//! App Discovery Loop (spec §4.3): reconciles the set of App Watchers
//! against the platform's currently `STARTED` apps. Ported from
//! `app/discovery.go`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::identity::{AppDescriptor, AppState, Fingerprint};
use crate::platform::PlatformClient;
use crate::watcher::{AppWatcher, AppWatcherHandle};

struct AppEntry {
    fingerprint: Fingerprint,
    handle: AppWatcherHandle,
    incarnation: u64,
}

/// Reconciles the watcher table against `ListAppsWithSpaceAndOrg` every
/// `check_interval`. List failures are fatal and propagate out of `run`;
/// per-watcher failures are absorbed and the entry is dropped so the next
/// tick recreates it.
pub struct AppDiscoveryLoop {
    client: Arc<dyn PlatformClient>,
    registry: Arc<Registry>,
    check_interval: Duration,
    table: Arc<Mutex<HashMap<String, AppEntry>>>,
    next_incarnation: AtomicU64,
    cancel: CancellationToken,
}

impl AppDiscoveryLoop {
    pub fn new(client: Arc<dyn PlatformClient>, registry: Arc<Registry>, check_interval: Duration, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            client,
            registry,
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
        let entries: Vec<AppEntry> = self.table.lock().unwrap().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.handle.close();
        }
    }

    async fn reconcile(&self) -> Result<()> {
        info!("checking for new apps");
        let apps = self.client.list_apps_with_space_and_org().await?;

        let mut running = HashSet::new();
        for app in apps.iter().filter(|a| a.state == AppState::Started) {
            running.insert(app.guid.clone());
            self.reconcile_one(app).await;
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

    async fn reconcile_one(&self, app: &AppDescriptor) {
        let existing = {
            let table = self.table.lock().unwrap();
            table.get(&app.guid).map(|e| (e.fingerprint.clone(), e.handle.clone()))
        };

        match existing {
            Some((fingerprint, _)) if fingerprint != app.fingerprint() => {
                // Name, space, or org changed: destroy before recreate so
                // stale constant-label series vanish before replacements
                // register.
                self.destroy_watcher(&app.guid);
                self.create_watcher(app);
            }
            Some((_, handle)) => {
                handle.update_instances(app.instances);
            }
            None => {
                self.create_watcher(app);
            }
        }
    }

    fn create_watcher(&self, app: &AppDescriptor) {
        let stream_provider = self.client.new_app_stream_provider(&app.guid);
        let (watcher, handle) = AppWatcher::new(app, self.registry.clone(), stream_provider);
        let incarnation = self.next_incarnation.fetch_add(1, Ordering::SeqCst);

        self.table.lock().unwrap().insert(
            app.guid.clone(),
            AppEntry {
                fingerprint: app.fingerprint(),
                handle,
                incarnation,
            },
        );

        let guid = app.guid.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.start().await {
                warn!("app watcher for {guid} failed: {e}");
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
    use crate::platform::{AppStreamProvider, Envelope};
    use crate::identity::ServiceDescriptor;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Keeps its channel senders alive for as long as the provider is, so
    /// the watcher's main loop blocks on `recv` instead of seeing a closed
    /// channel — this fixture models a stream that just never emits.
    #[derive(Default)]
    struct HangingStreamProvider {
        _envelope_tx: Option<mpsc::Sender<Envelope>>,
        _error_tx: Option<mpsc::Sender<crate::error::Error>>,
    }

    #[async_trait]
    impl AppStreamProvider for HangingStreamProvider {
        async fn start(&mut self) -> (mpsc::Receiver<Envelope>, mpsc::Receiver<crate::error::Error>) {
            let (etx, erx) = mpsc::channel(1);
            let (ftx, frx) = mpsc::channel(1);
            self._envelope_tx = Some(etx);
            self._error_tx = Some(ftx);
            (erx, frx)
        }
        async fn close(&mut self) {}
    }

    struct FakePlatform {
        apps: Mutex<Vec<AppDescriptor>>,
        list_calls: AtomicUsize,
    }

    #[async_trait]
    impl PlatformClient for FakePlatform {
        async fn list_apps_with_space_and_org(&self) -> Result<Vec<AppDescriptor>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.apps.lock().unwrap().clone())
        }
        async fn list_services_with_space_and_org(&self) -> Result<Vec<ServiceDescriptor>> {
            Ok(vec![])
        }
        fn new_app_stream_provider(&self, _app_guid: &str) -> Box<dyn AppStreamProvider> {
            Box::new(HangingStreamProvider::default())
        }
        fn new_log_cache_client(&self) -> Box<dyn crate::platform::LogCacheClient> {
            unimplemented!()
        }
    }

    fn app(guid: &str, name: &str, space: &str, instances: u32) -> AppDescriptor {
        AppDescriptor {
            guid: guid.into(),
            name: name.into(),
            space_name: space.into(),
            org_name: "o".into(),
            instances,
            state: AppState::Started,
        }
    }

    #[tokio::test]
    async fn create_reconcile_registers_one_watcher() {
        let registry = Arc::new(Registry::new());
        let platform = Arc::new(FakePlatform {
            apps: Mutex::new(vec![app("g1", "foo", "s", 1)]),
            list_calls: AtomicUsize::new(0),
        });
        let loop_ = AppDiscoveryLoop::new(platform, registry.clone(), Duration::from_secs(300), &CancellationToken::new());
        loop_.reconcile().await.unwrap();

        assert_eq!(loop_.table.lock().unwrap().len(), 1);
        // 8 series for instance 0.
        let total: usize = registry.gather().iter().map(|f| f.get_metric().len()).sum();
        assert_eq!(total, 8);
    }

    #[tokio::test]
    async fn stopped_app_is_destroyed_like_deletion() {
        let registry = Arc::new(Registry::new());
        let platform = Arc::new(FakePlatform {
            apps: Mutex::new(vec![app("g1", "foo", "s", 1)]),
            list_calls: AtomicUsize::new(0),
        });
        let loop_ = AppDiscoveryLoop::new(platform.clone(), registry.clone(), Duration::from_secs(300), &CancellationToken::new());
        loop_.reconcile().await.unwrap();
        assert_eq!(loop_.table.lock().unwrap().len(), 1);

        let mut stopped = app("g1", "foo", "s", 1);
        stopped.state = AppState::Stopped;
        *platform.apps.lock().unwrap() = vec![stopped];
        loop_.reconcile().await.unwrap();

        assert_eq!(loop_.table.lock().unwrap().len(), 0);
        assert_eq!(registry.gather().len(), 0);
    }

    #[tokio::test]
    async fn rename_destroys_and_recreates() {
        let registry = Arc::new(Registry::new());
        let platform = Arc::new(FakePlatform {
            apps: Mutex::new(vec![app("g1", "foo", "s", 1)]),
            list_calls: AtomicUsize::new(0),
        });
        let loop_ = AppDiscoveryLoop::new(platform.clone(), registry.clone(), Duration::from_secs(300), &CancellationToken::new());
        loop_.reconcile().await.unwrap();
        let incarnation_before = loop_.table.lock().unwrap().get("g1").unwrap().incarnation;

        *platform.apps.lock().unwrap() = vec![app("g1", "foo", "s2", 1)];
        loop_.reconcile().await.unwrap();

        let incarnation_after = loop_.table.lock().unwrap().get("g1").unwrap().incarnation;
        assert_ne!(incarnation_before, incarnation_after);
        assert_eq!(loop_.table.lock().unwrap().get("g1").unwrap().fingerprint.space_name, "s2");
    }

    #[tokio::test]
    async fn idempotent_reconcile_with_unchanged_list() {
        let registry = Arc::new(Registry::new());
        let platform = Arc::new(FakePlatform {
            apps: Mutex::new(vec![app("g1", "foo", "s", 1)]),
            list_calls: AtomicUsize::new(0),
        });
        let loop_ = AppDiscoveryLoop::new(platform, registry.clone(), Duration::from_secs(300), &CancellationToken::new());
        loop_.reconcile().await.unwrap();
        let before: usize = registry.gather().iter().map(|f| f.get_metric().len()).sum();
        loop_.reconcile().await.unwrap();
        let after: usize = registry.gather().iter().map(|f| f.get_metric().len()).sum();
        assert_eq!(before, after);
    }
}
