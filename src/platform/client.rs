//! `reqwest`-backed Cloud Controller API client: lists apps/services with
//! joined space/org names and mints per-app stream providers plus a
//! log-cache client. Grounded in `cf/client.go`'s `ListAppsWithSpaceAndOrg`
//! and token-refresh flow, expressed with typed request/response structs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::{AppDescriptor, AppState, ServiceDescriptor};

use super::logcache::HttpLogCacheClient;
use super::stream::SseAppStreamProvider;
use super::{AppStreamProvider, LogCacheClient, PlatformClient};

const TOKEN_RETRY_ATTEMPTS: u32 = 3;
const TOKEN_RETRY_BASE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct CloudControllerClient {
    http: reqwest::Client,
    api_endpoint: String,
    logcache_endpoint: String,
    auth: AuthConfig,
    token: Arc<RwLock<Option<String>>>,
}

#[derive(Clone)]
struct AuthConfig {
    token_endpoint: String,
    username: String,
    password: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct RawSpace {
    name: String,
    #[serde(rename = "organization_guid")]
    org_guid: String,
}

#[derive(Deserialize)]
struct RawOrg {
    name: String,
}

#[derive(Deserialize)]
struct RawApp {
    guid: String,
    name: String,
    state: String,
    instances: u32,
    space_guid: String,
}

#[derive(Deserialize)]
struct RawServiceInstance {
    guid: String,
    name: String,
    space_guid: String,
}

impl CloudControllerClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(Error::PlatformList)?;

        Ok(Self {
            http,
            api_endpoint: config.api_endpoint.trim_end_matches('/').to_string(),
            logcache_endpoint: config.logcache_endpoint(),
            auth: AuthConfig {
                token_endpoint: format!("{}/oauth/token", config.api_endpoint.trim_end_matches('/')),
                username: config.username.clone(),
                password: config.password.clone(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
            },
            token: Arc::new(RwLock::new(None)),
        })
    }

    /// Returns a cached token, acquiring or refreshing one with linear
    /// back-off on failure (spec §7 item 7).
    pub async fn token(&self) -> Result<String> {
        if let Some(tok) = self.token.read().await.clone() {
            return Ok(tok);
        }
        self.refresh_token().await
    }

    async fn refresh_token(&self) -> Result<String> {
        let mut last_err = None;
        for attempt in 1..=TOKEN_RETRY_ATTEMPTS {
            match self.request_token().await {
                Ok(tok) => {
                    *self.token.write().await = Some(tok.clone());
                    return Ok(tok);
                }
                Err(e) => {
                    warn!("token acquisition attempt {attempt} of {TOKEN_RETRY_ATTEMPTS} failed: {e}");
                    last_err = Some(e.to_string());
                    tokio::time::sleep(TOKEN_RETRY_BASE * attempt).await;
                }
            }
        }
        Err(Error::TokenAcquisition(last_err.unwrap_or_default()))
    }

    async fn request_token(&self) -> std::result::Result<String, reqwest::Error> {
        let mut form = HashMap::new();
        if !self.auth.client_id.is_empty() {
            form.insert("grant_type", "client_credentials".to_string());
            form.insert("client_id", self.auth.client_id.clone());
            form.insert("client_secret", self.auth.client_secret.clone());
        } else {
            form.insert("grant_type", "password".to_string());
            form.insert("username", self.auth.username.clone());
            form.insert("password", self.auth.password.clone());
        }

        let resp: TokenResponse = self
            .http
            .post(&self.auth.token_endpoint)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.access_token)
    }

    /// Issues a GET and retries exactly once, with a freshly re-acquired
    /// token, if the first attempt comes back 401 — the cached token may
    /// have expired server-side between reconcile ticks.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let token = self.token().await?;
        match self.get_json_with_token(path, &token).await {
            Err(Error::PlatformList(e)) if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) => {
                *self.token.write().await = None;
                let token = self.refresh_token().await?;
                self.get_json_with_token(path, &token).await
            }
            result => result,
        }
    }

    async fn get_json_with_token<T: serde::de::DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let url = format!("{}{}", self.api_endpoint, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(Error::PlatformList)?
            .error_for_status()
            .map_err(Error::PlatformList)?;
        resp.json().await.map_err(Error::PlatformList)
    }

    async fn space_name(&self, space_guid: &str, cache: &mut HashMap<String, (String, String)>) -> Result<(String, String)> {
        if let Some(cached) = cache.get(space_guid) {
            return Ok(cached.clone());
        }
        let space: RawSpace = self.get_json(&format!("/v2/spaces/{space_guid}")).await?;
        let org: RawOrg = self.get_json(&format!("/v2/organizations/{}", space.org_guid)).await?;
        let result = (space.name, org.name);
        cache.insert(space_guid.to_string(), result.clone());
        Ok(result)
    }
}

#[async_trait]
impl PlatformClient for CloudControllerClient {
    async fn list_apps_with_space_and_org(&self) -> Result<Vec<AppDescriptor>> {
        let raw: Vec<RawApp> = self.get_json("/v2/apps").await?;
        let mut space_cache = HashMap::new();
        let mut out = Vec::with_capacity(raw.len());
        for app in raw {
            let (space_name, org_name) = self.space_name(&app.space_guid, &mut space_cache).await?;
            out.push(AppDescriptor {
                guid: app.guid,
                name: app.name,
                space_name,
                org_name,
                instances: app.instances,
                state: if app.state == "STARTED" {
                    AppState::Started
                } else if app.state == "STOPPED" {
                    AppState::Stopped
                } else {
                    AppState::Other
                },
            });
        }
        Ok(out)
    }

    async fn list_services_with_space_and_org(&self) -> Result<Vec<ServiceDescriptor>> {
        let raw: Vec<RawServiceInstance> = self.get_json("/v2/service_instances").await?;
        let mut space_cache = HashMap::new();
        let mut out = Vec::with_capacity(raw.len());
        for svc in raw {
            let (space_name, org_name) = self.space_name(&svc.space_guid, &mut space_cache).await?;
            out.push(ServiceDescriptor {
                guid: svc.guid,
                name: svc.name,
                space_name,
                org_name,
            });
        }
        Ok(out)
    }

    fn new_app_stream_provider(&self, app_guid: &str) -> Box<dyn AppStreamProvider> {
        Box::new(SseAppStreamProvider::new(
            self.http.clone(),
            self.api_endpoint.clone(),
            app_guid.to_string(),
        ))
    }

    fn new_log_cache_client(&self) -> Box<dyn LogCacheClient> {
        Box::new(HttpLogCacheClient::new(self.http.clone(), self.logcache_endpoint.clone()))
    }
}
