use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use exporter::config::Config;
use exporter::discovery::{AppDiscoveryLoop, ServiceDiscoveryLoop};
use exporter::platform::client::CloudControllerClient;
use exporter::supervisor::Supervisor;
use exporter::metrics;

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let registry = Registry::new();
    if let Err(e) = metrics::register_build_info(&registry, BUILD_VERSION) {
        error!("failed to register build info metric: {e}");
        return ExitCode::FAILURE;
    }

    let client = match CloudControllerClient::new(&config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("failed to construct platform client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let root_cancel = CancellationToken::new();
    let app_loop = AppDiscoveryLoop::new(client.clone(), Arc::new(registry.clone()), config.update_frequency(), &root_cancel);
    let service_loop = ServiceDiscoveryLoop::new(
        client,
        Arc::new(registry.clone()),
        config.scrape_interval(),
        config.update_frequency(),
        &root_cancel,
    );

    let supervisor = Supervisor::new(root_cancel, app_loop, service_loop, registry, config.port, config.basic_auth());

    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("exporter exiting on fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}
