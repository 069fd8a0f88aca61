use thiserror::Error;

/// Crate-wide error type.
///
/// Variants map onto the failure taxonomy of the watcher/discovery
/// subsystem: watcher-local failures (`WatcherStreamClosed`, `LogParse`,
/// `LogCacheRead`, `TokenAcquisition`) are consumed by the owning discovery
/// loop and never leave it; the rest are process-fatal.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to list apps/services from the platform: {0}")]
    PlatformList(#[source] reqwest::Error),

    #[error("watcher stream for guid {guid} terminated: {reason}")]
    WatcherStreamClosed { guid: String, reason: String },

    #[error("failed to parse instance-exit log payload: {0}")]
    LogParse(String),

    #[error("failed to read log-cache logs for {guid} after all retries: {source}")]
    LogCacheRead {
        guid: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("duplicate metric registration: {0}")]
    DuplicateRegistration(#[source] prometheus::Error),

    #[error("failed to acquire an access token after retries: {0}")]
    TokenAcquisition(String),

    #[error("http listener failure: {0}")]
    Http(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
