use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};

const MIN_UPDATE_FREQUENCY_SECS: u64 = 60;
const MIN_SCRAPE_INTERVAL_SECS: u64 = 60;

/// Exporter configuration. Every field can be set as a flag or as the
/// correspondingly named environment variable (clap's `env` attribute).
#[derive(Parser, Debug, Clone)]
#[command(name = "paas-exporter", about = "Prometheus exporter for a Cloud Foundry-style platform")]
pub struct Config {
    /// Cloud Controller API endpoint, e.g. https://api.example.com
    #[arg(long, env = "API_ENDPOINT")]
    pub api_endpoint: String,

    /// log-cache query API endpoint. Defaults to api_endpoint with the
    /// leading `api.` replaced by `log-cache.`.
    #[arg(long, env = "LOGCACHE_ENDPOINT")]
    pub logcache_endpoint: Option<String>,

    #[arg(long, env = "USERNAME", default_value = "")]
    pub username: String,
    #[arg(long, env = "PASSWORD", default_value = "")]
    pub password: String,
    #[arg(long, env = "CLIENT_ID", default_value = "")]
    pub client_id: String,
    #[arg(long, env = "CLIENT_SECRET", default_value = "")]
    pub client_secret: String,

    /// Seconds between discovery reconcile ticks. Floor 60.
    #[arg(long, env = "UPDATE_FREQUENCY", default_value_t = 300)]
    pub update_frequency: u64,

    /// Seconds between service-watcher log-cache polls. Floor 60.
    #[arg(long, env = "SCRAPE_INTERVAL", default_value_t = 60)]
    pub scrape_interval: u64,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "AUTH_USERNAME", default_value = "")]
    pub auth_username: String,
    #[arg(long, env = "AUTH_PASSWORD", default_value = "")]
    pub auth_password: String,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.api_endpoint.trim().is_empty() {
            return Err(Error::Config("API_ENDPOINT must not be empty".into()));
        }
        if self.update_frequency < MIN_UPDATE_FREQUENCY_SECS {
            return Err(Error::Config(format!(
                "UPDATE_FREQUENCY must be at least {MIN_UPDATE_FREQUENCY_SECS}s, got {}",
                self.update_frequency
            )));
        }
        if self.scrape_interval < MIN_SCRAPE_INTERVAL_SECS {
            return Err(Error::Config(format!(
                "SCRAPE_INTERVAL must be at least {MIN_SCRAPE_INTERVAL_SECS}s, got {}",
                self.scrape_interval
            )));
        }
        Ok(())
    }

    pub fn update_frequency(&self) -> Duration {
        Duration::from_secs(self.update_frequency)
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval)
    }

    pub fn logcache_endpoint(&self) -> String {
        self.logcache_endpoint.clone().unwrap_or_else(|| {
            self.api_endpoint.replacen("api.", "log-cache.", 1)
        })
    }

    pub fn basic_auth(&self) -> Option<(String, String)> {
        if self.auth_username.is_empty() {
            None
        } else {
            Some((self.auth_username.clone(), self.auth_password.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            api_endpoint: "https://api.example.com".into(),
            logcache_endpoint: None,
            username: "".into(),
            password: "".into(),
            client_id: "".into(),
            client_secret: "".into(),
            update_frequency: 300,
            scrape_interval: 60,
            port: 8080,
            auth_username: "".into(),
            auth_password: "".into(),
        }
    }

    #[test]
    fn rejects_blank_endpoint() {
        let mut c = base();
        c.api_endpoint = "  ".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn enforces_update_frequency_floor() {
        let mut c = base();
        c.update_frequency = 30;
        assert!(c.validate().is_err());
    }

    #[test]
    fn enforces_scrape_interval_floor() {
        let mut c = base();
        c.scrape_interval = 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn derives_logcache_endpoint_from_api_endpoint() {
        let c = base();
        assert_eq!(c.logcache_endpoint(), "https://log-cache.example.com");
    }

    #[test]
    fn explicit_logcache_endpoint_wins() {
        let mut c = base();
        c.logcache_endpoint = Some("https://logs.internal".into());
        assert_eq!(c.logcache_endpoint(), "https://logs.internal");
    }

    #[test]
    fn no_auth_when_username_blank() {
        assert!(base().basic_auth().is_none());
    }
}
