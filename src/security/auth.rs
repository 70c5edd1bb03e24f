//! Credential checks and identity tokens.
//!
//! # Check Order
//! ```text
//! X-API-KEY prefix
//!     → X-SIGNATURE (base64 HMAC-SHA256 of the body)
//!     → client IP allow-list
//!     → Bearer token: verify, or issue one when absent
//!     → permission claim contains the service id
//! ```
//!
//! Any failed check rejects the request. A missing token is not a failure:
//! the caller receives a freshly issued token instead of a forwarded request.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::schema::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Claims carried by identity tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub permission: Vec<String>,
    pub exp: u64,
}

/// Rejected credentials. The message is sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid API Key")]
    ApiKey,

    #[error("Invalid Signature")]
    Signature,

    #[error("IP not allowed: {0}")]
    IpNotAllowed(IpAddr),

    #[error("Invalid JWT")]
    InvalidToken,

    #[error("No permission for service {0}")]
    Permission(String),

    #[error("Failed to issue token")]
    Issue,
}

/// Identity token operations.
pub trait IdentityProvider: Send + Sync {
    /// Token presented by the request, if any.
    fn extract_identity(&self, headers: &HeaderMap) -> Option<String>;

    fn verify(&self, token: &str) -> Result<Claims, AuthError>;

    fn issue(&self) -> Result<String, AuthError>;

    fn has_permission(&self, claims: &Claims, service_id: &str) -> bool {
        claims.permission.iter().any(|p| p == service_id)
    }
}

/// HS256 bearer tokens.
pub struct JwtIdentity {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: u64,
    user_id: String,
    name: String,
    permissions: Vec<String>,
}

impl JwtIdentity {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            ttl_secs: config.token_ttl_secs,
            user_id: config.issued_user_id.clone(),
            name: config.issued_name.clone(),
            permissions: config.issued_permissions.clone(),
        }
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "Token signing failed");
            AuthError::Issue
        })
    }
}

impl IdentityProvider for JwtIdentity {
    fn extract_identity(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected");
                AuthError::InvalidToken
            })
    }

    fn issue(&self) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AuthError::Issue)?
            .as_secs();
        self.sign(&Claims {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            permission: self.permissions.clone(),
            exp: now + self.ttl_secs,
        })
    }
}

/// Result of a successful check sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Valid token with permission for the service.
    Verified(Claims),
    /// No token was presented; this one was issued instead.
    Issued(String),
}

/// Runs the credential checks in order.
pub struct Authenticator {
    api_key_prefix: Option<String>,
    signature_secret: Option<String>,
    allow_list: Vec<IpAddr>,
    identity: Arc<dyn IdentityProvider>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        let allow_list = config
            .ip_allow_list
            .iter()
            .filter_map(|ip| match ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!(entry = %ip, "Ignoring invalid IP allow-list entry");
                    None
                }
            })
            .collect();

        Self {
            api_key_prefix: config.api_key_prefix.clone(),
            signature_secret: config.signature_secret.clone(),
            allow_list,
            identity,
        }
    }

    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        client_ip: IpAddr,
        service_id: &str,
    ) -> Result<AuthOutcome, AuthError> {
        self.check_api_key(headers)?;
        self.check_signature(headers, body)?;
        self.check_ip(client_ip)?;

        let Some(token) = self.identity.extract_identity(headers) else {
            return self.identity.issue().map(AuthOutcome::Issued);
        };
        let claims = self.identity.verify(&token)?;
        if !self.identity.has_permission(&claims, service_id) {
            return Err(AuthError::Permission(service_id.to_string()));
        }
        Ok(AuthOutcome::Verified(claims))
    }

    fn check_api_key(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let Some(prefix) = &self.api_key_prefix else {
            return Ok(());
        };
        match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            Some(key) if key.starts_with(prefix.as_str()) => Ok(()),
            _ => Err(AuthError::ApiKey),
        }
    }

    fn check_signature(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AuthError> {
        let Some(secret) = &self.signature_secret else {
            return Ok(());
        };
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| general_purpose::STANDARD.decode(v).ok())
            .ok_or(AuthError::Signature)?;

        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Signature)?;
        mac.update(body);
        mac.verify_slice(&provided).map_err(|_| AuthError::Signature)
    }

    fn check_ip(&self, client_ip: IpAddr) -> Result<(), AuthError> {
        if self.allow_list.is_empty() {
            return Ok(());
        }
        let client_ip = client_ip.to_canonical();
        if self.allow_list.iter().any(|ip| ip.to_canonical() == client_ip) {
            Ok(())
        } else {
            Err(AuthError::IpNotAllowed(client_ip))
        }
    }
}

/// Base64 HMAC-SHA256 of `body`, as expected in `X-SIGNATURE`.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}
