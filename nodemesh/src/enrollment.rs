//! Child self-registration with the master
//!
//! A child node registers on start, retrying with exponential backoff until
//! the master answers. It then keeps its access token fresh by exchanging the
//! refresh token shortly before expiry, and registers again if the master no
//! longer accepts it.

use crate::api::{RefreshRequest, REGISTRATION_TOKEN_HEADER};
use crate::auth::TokenPair;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{NodeDescriptor, RegistrationResponse};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Refresh this long before the access token expires
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Credentials received from the master
#[derive(Debug, Clone)]
pub struct Enrolled {
    pub node_id: String,
    pub api_key: String,
    pub tokens: TokenPair,
}

pub struct Enrollment {
    master_url: String,
    descriptor: NodeDescriptor,
    registration_token: Option<String>,
    http: reqwest::Client,
    state: RwLock<Option<Enrolled>>,
    running: RwLock<bool>,
    wake: Notify,
}

impl Enrollment {
    pub fn new(config: &Config) -> Result<Self> {
        let master_url = config
            .node
            .master_url
            .clone()
            .ok_or_else(|| Error::Config("node.master_url is required for enrollment".into()))?;
        let url = config
            .node
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", config.server.bind_addr));

        let http = reqwest::Client::builder()
            .user_agent(concat!("nodemesh/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            master_url: master_url.trim_end_matches('/').to_string(),
            descriptor: NodeDescriptor {
                name: config.node.name.clone(),
                url,
                capabilities: config.node.capabilities.clone(),
                metadata: config.node.metadata.clone(),
                weight: None,
                id: Some(config.node.node_id.clone()),
            },
            registration_token: config.auth.registration_token.clone(),
            http,
            state: RwLock::new(None),
            running: RwLock::new(false),
            wake: Notify::new(),
        })
    }

    pub fn enrolled(&self) -> Option<Enrolled> {
        self.state.read().clone()
    }

    /// Register once
    pub async fn register(&self) -> Result<Enrolled> {
        let mut request = self
            .http
            .post(format!("{}/register", self.master_url))
            .json(&self.descriptor);
        if let Some(token) = &self.registration_token {
            request = request.header(REGISTRATION_TOKEN_HEADER, token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::RemoteStatus {
                node_id: "master".to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let registration: RegistrationResponse = resp.json().await?;

        let enrolled = Enrolled {
            node_id: registration.node.id,
            api_key: registration.api_key,
            tokens: TokenPair {
                access_token: registration.access_token,
                refresh_token: registration.refresh_token,
                access_expires_at: registration.access_expires_at,
                refresh_expires_at: registration.refresh_expires_at,
                token_type: registration.token_type,
            },
        };
        *self.state.write() = Some(enrolled.clone());
        info!(
            "Registered with master {} as node {}",
            self.master_url, enrolled.node_id
        );
        Ok(enrolled)
    }

    /// Exchange the stored refresh token for a new pair
    pub async fn refresh(&self) -> Result<TokenPair> {
        let refresh_token = self
            .state
            .read()
            .as_ref()
            .map(|s| s.tokens.refresh_token.clone())
            .ok_or(Error::InvalidRefreshToken)?;

        let resp = self
            .http
            .post(format!("{}/refresh-token", self.master_url))
            .json(&RefreshRequest {
                refresh_token: Some(refresh_token),
            })
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::InvalidRefreshToken);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::RemoteStatus {
                node_id: "master".to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let tokens: TokenPair = resp.json().await?;

        if let Some(state) = self.state.write().as_mut() {
            state.tokens = tokens.clone();
        }
        debug!("Refreshed access token, valid until {}", tokens.access_expires_at);
        Ok(tokens)
    }

    /// Register, retrying with backoff until it succeeds or enrollment stops
    async fn register_with_retry(&self) -> Option<Enrolled> {
        let mut backoff = INITIAL_BACKOFF;
        while self.is_running() {
            match self.register().await {
                Ok(enrolled) => return Some(enrolled),
                Err(e) => {
                    warn!(
                        "Registration with {} failed: {}; retrying in {}s",
                        self.master_url,
                        e,
                        backoff.as_secs()
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.wake.notified() => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        None
    }

    /// Start the background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        *self.running.write() = true;
        let enrollment = Arc::clone(&self);
        tokio::spawn(async move {
            enrollment.run_loop().await;
        })
    }

    pub fn stop(&self) {
        *self.running.write() = false;
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    async fn run_loop(&self) {
        if self.register_with_retry().await.is_none() {
            return;
        }

        while self.is_running() {
            let expires_at = self
                .state
                .read()
                .as_ref()
                .map(|s| s.tokens.access_expires_at);
            let delay = refresh_delay(expires_at, Utc::now());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
            if !self.is_running() {
                break;
            }

            match self.refresh().await {
                Ok(_) => {}
                Err(Error::InvalidRefreshToken) => {
                    warn!("Master rejected refresh token, registering again");
                    if self.register_with_retry().await.is_none() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Token refresh failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(INITIAL_BACKOFF * 5) => {}
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }

        info!("Enrollment stopped");
    }
}

fn refresh_delay(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    let Some(expires_at) = expires_at else {
        return MIN_REFRESH_DELAY;
    };
    let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
    remaining
        .saturating_sub(REFRESH_MARGIN)
        .max(MIN_REFRESH_DELAY)
}
