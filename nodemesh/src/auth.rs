//! Node authentication
//!
//! Nodes authenticate with short-lived HS256 access tokens backed by
//! single-use refresh tokens. Static API keys are accepted as a weaker
//! fallback, either generated per node at registration or provisioned by the
//! operator in `auth.api_keys`.
//!
//! Refresh tokens and API keys are only ever stored as sha256 hashes.

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::registry::NodeRegistry;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

const ACCESS_TOKEN_TYPE: &str = "access";

/// sha256 hex digest of a secret
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Random URL-safe secret with the given prefix
pub fn generate_secret(prefix: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(bytes))
}

/// Compare two byte strings without short-circuiting on the first mismatch
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    exp: i64,
    iat: i64,
    jti: String,
    typ: String,
    #[serde(default)]
    gen: u64,
}

/// Access and refresh token issued together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub token_type: String,
}

/// How a caller proved its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    AccessToken,
    /// Per-node key generated at registration
    ApiKey,
    /// Operator-provisioned key from the config file
    StaticKey,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::AccessToken => "access_token",
            AuthMethod::ApiKey => "api_key",
            AuthMethod::StaticKey => "static_key",
        }
    }
}

/// What an authenticated caller may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Operator holding a static key: every route
    Operator,
    /// Peer node: node-to-node routes only
    Node,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Node => "node",
        }
    }

    /// Whether this role satisfies `required`
    pub fn permits(&self, required: Role) -> bool {
        match (self, required) {
            (Role::Operator, _) => true,
            (Role::Node, Role::Node) => true,
            (Role::Node, Role::Operator) => false,
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    /// Node id, or the configured name of a static key
    pub id: String,
    pub method: AuthMethod,
    pub role: Role,
}

#[derive(Debug, Clone)]
struct RefreshRecord {
    node_id: String,
    expires_at: DateTime<Utc>,
}

/// Issues and validates node credentials
pub struct AuthService {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    /// Keyed by sha256 of the refresh token
    refresh_tokens: DashMap<String, RefreshRecord>,
    /// Tokens carrying an older generation are rejected
    generations: DashMap<String, u64>,
    /// (hash, name) of operator-provisioned keys
    static_keys: Vec<(String, String)>,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        let secret = config.signing_secret.as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        validation.validate_aud = false;

        let static_keys = config
            .api_keys
            .iter()
            .map(|k| (hash_secret(&k.key), k.name.clone()))
            .collect();

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            refresh_tokens: DashMap::new(),
            generations: DashMap::new(),
            static_keys,
            config,
        }
    }

    fn generation(&self, node_id: &str) -> u64 {
        self.generations.get(node_id).map(|g| *g).unwrap_or(0)
    }

    /// Sign an access token for `node_id`
    pub fn issue_access_token(&self, node_id: &str) -> Result<(String, DateTime<Utc>)> {
        self.issue_access_token_at(node_id, Utc::now())
    }

    fn issue_access_token_at(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>)> {
        let ttl = ChronoDuration::seconds(self.config.access_token_ttl_secs as i64);
        let expires_at = now + ttl;
        let claims = AccessClaims {
            sub: node_id.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
            gen: self.generation(node_id),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign access token: {}", e)))?;
        Ok((token, expires_at))
    }

    /// Issue a fresh access/refresh pair for a node
    pub fn issue_token_pair(&self, node_id: &str) -> Result<TokenPair> {
        let now = Utc::now();
        let (access_token, access_expires_at) = self.issue_access_token_at(node_id, now)?;

        let refresh_token = generate_secret("nmr_");
        let refresh_expires_at =
            now + ChronoDuration::seconds(self.config.refresh_token_ttl_secs as i64);
        self.refresh_tokens.insert(
            hash_secret(&refresh_token),
            RefreshRecord {
                node_id: node_id.to_string(),
                expires_at: refresh_expires_at,
            },
        );

        debug!("Issued token pair for node {}", node_id);
        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
            token_type: "Bearer".to_string(),
        })
    }

    /// Validate an access token and return the node id it was issued to
    pub fn validate_access_token(&self, token: &str) -> Result<String> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::ExpiredToken,
                _ => Error::InvalidToken(e.to_string()),
            },
        )?;
        let claims = data.claims;

        if claims.typ != ACCESS_TOKEN_TYPE {
            return Err(Error::InvalidToken(format!(
                "unexpected token type '{}'",
                claims.typ
            )));
        }
        if claims.gen < self.generation(&claims.sub) {
            return Err(Error::InvalidToken("token has been revoked".to_string()));
        }
        Ok(claims.sub)
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// consumed whether or not it turns out to be expired.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let (_, record) = self
            .refresh_tokens
            .remove(&hash_secret(refresh_token))
            .ok_or(Error::InvalidRefreshToken)?;

        if record.expires_at <= Utc::now() {
            debug!("Rejected expired refresh token for node {}", record.node_id);
            return Err(Error::InvalidRefreshToken);
        }

        info!("Rotated tokens for node {}", record.node_id);
        self.issue_token_pair(&record.node_id)
    }

    /// Drop every refresh token of a node and invalidate its access tokens
    pub fn revoke(&self, node_id: &str) {
        self.refresh_tokens.retain(|_, r| r.node_id != node_id);
        *self.generations.entry(node_id.to_string()).or_insert(0) += 1;
        info!("Revoked all credentials of node {}", node_id);
    }

    /// Drop expired refresh tokens, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.refresh_tokens.len();
        self.refresh_tokens.retain(|_, r| r.expires_at > now);
        before.saturating_sub(self.refresh_tokens.len())
    }

    pub fn check_registration_token(&self, presented: Option<&str>) -> Result<()> {
        match &self.config.registration_token {
            None => Ok(()),
            Some(expected) => match presented {
                Some(p) if constant_time_eq(p.as_bytes(), expected.as_bytes()) => Ok(()),
                Some(_) => Err(Error::InvalidToken("invalid registration token".into())),
                None => Err(Error::InvalidToken("registration token required".into())),
            },
        }
    }

    fn verify_static_key(&self, key: &str) -> Option<String> {
        let hash = hash_secret(key);
        self.static_keys
            .iter()
            .find(|(h, _)| constant_time_eq(h.as_bytes(), hash.as_bytes()))
            .map(|(_, name)| name.clone())
    }

    /// Authenticate a bearer credential: access token first, then operator
    /// keys, then per-node API keys.
    pub fn authenticate(&self, credential: &str, registry: &NodeRegistry) -> Result<Principal> {
        if looks_like_jwt(credential) {
            let id = self.validate_access_token(credential)?;
            return Ok(Principal {
                id,
                method: AuthMethod::AccessToken,
                role: Role::Node,
            });
        }

        if let Some(name) = self.verify_static_key(credential) {
            warn!(
                target: "nodemesh::audit",
                principal = %name,
                method = "static_key",
                "Authenticated with static API key"
            );
            return Ok(Principal {
                id: name,
                method: AuthMethod::StaticKey,
                role: Role::Operator,
            });
        }

        if let Some(node_id) = registry.verify_api_key(credential) {
            warn!(
                target: "nodemesh::audit",
                principal = %node_id,
                method = "api_key",
                "Authenticated with node API key"
            );
            return Ok(Principal {
                id: node_id,
                method: AuthMethod::ApiKey,
                role: Role::Node,
            });
        }

        Err(Error::InvalidToken("unrecognized credential".to_string()))
    }
}

fn looks_like_jwt(credential: &str) -> bool {
    credential.split('.').count() == 3
}
