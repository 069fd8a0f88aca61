//! Owns the root cancellation scope and coordinates shutdown across the
//! two discovery loops and the HTTP listener (spec §5/§9): any of the
//! three failing, or Ctrl-C, brings the rest down together.

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::discovery::{AppDiscoveryLoop, ServiceDiscoveryLoop};
use crate::error::Result;

/// Graceful-shutdown budget for the HTTP listener once the root token is
/// cancelled, mirroring the `shutdown_timeout` actix-web is configured with
/// in `http::serve`.
const HTTP_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    cancel: CancellationToken,
    app_loop: Arc<AppDiscoveryLoop>,
    service_loop: Arc<ServiceDiscoveryLoop>,
    registry: Registry,
    port: u16,
    basic_auth: Option<(String, String)>,
}

impl Supervisor {
    /// `cancel` must be the same token (or an ancestor of the tokens)
    /// passed to the two discovery loops when they were constructed, so
    /// that cancelling it here tears them down too.
    pub fn new(
        cancel: CancellationToken,
        app_loop: Arc<AppDiscoveryLoop>,
        service_loop: Arc<ServiceDiscoveryLoop>,
        registry: Registry,
        port: u16,
        basic_auth: Option<(String, String)>,
    ) -> Self {
        Self {
            cancel,
            app_loop,
            service_loop,
            registry,
            port,
            basic_auth,
        }
    }

    /// Runs until Ctrl-C or any supervised task fails, then cancels the
    /// rest and waits for the HTTP listener to drain. Returns `Err` if
    /// the failure was a supervised task rather than a clean signal.
    pub async fn run(self) -> Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Result<()>>(3);

        let app_cancel = self.cancel.clone();
        let app_loop = self.app_loop.clone();
        let app_tx = fatal_tx.clone();
        tokio::spawn(async move {
            let result = app_loop.run().await;
            if !app_cancel.is_cancelled() {
                let _ = app_tx.send(result).await;
            }
        });

        let service_cancel = self.cancel.clone();
        let service_loop = self.service_loop.clone();
        let service_tx = fatal_tx.clone();
        tokio::spawn(async move {
            let result = service_loop.run().await;
            if !service_cancel.is_cancelled() {
                let _ = service_tx.send(result).await;
            }
        });

        let http_cancel = self.cancel.clone();
        let http_shutdown = self.cancel.clone();
        let registry = self.registry.clone();
        let port = self.port;
        let basic_auth = self.basic_auth.clone();
        let http_tx = fatal_tx.clone();
        let http_task = tokio::spawn(async move {
            let result = crate::http::serve(registry, port, basic_auth, async move {
                http_shutdown.cancelled().await;
            })
            .await;
            if !http_cancel.is_cancelled() {
                let _ = http_tx.send(result).await;
            }
            result
        });
        drop(fatal_tx);

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                self.cancel.cancel();
                Ok(())
            }
            fatal = fatal_rx.recv() => {
                self.cancel.cancel();
                match fatal {
                    Some(Err(e)) => {
                        error!("supervised task failed: {e}");
                        Err(e)
                    }
                    _ => Ok(()),
                }
            }
        };

        match tokio::time::timeout(HTTP_SHUTDOWN_DEADLINE, http_task).await {
            Ok(Ok(Err(e))) if outcome.is_ok() => return Err(e),
            Ok(_) => {}
            Err(_) => warn!("http listener did not shut down within the {HTTP_SHUTDOWN_DEADLINE:?} deadline"),
        }

        outcome
    }
}
