//! Service-account credential handling.
//!
//! The credential descriptor is the JSON blob Google issues for a service
//! account. Deployments provide it through the `SERVICE_KEY` env var; a
//! local key file is accepted as a fallback for development. Loading is
//! strict and never retried: a request that needs the store either gets a
//! usable key or fails with one of three distinguishable causes (missing
//! configuration, malformed JSON, unusable credential structure).

use std::path::Path;

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ring::signature::RsaKeyPair;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Env var carrying the raw service-account JSON (preferred over a key file).
pub const SERVICE_KEY_ENV: &str = "SERVICE_KEY";

/// The one OAuth scope this system ever requests.
pub const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("SERVICE_KEY missing (set the env var or pass --key-file)")]
    Missing,
    #[error("JSON parse error: {0}")]
    InvalidJson(String),
    #[error("credentials error: {0}")]
    InvalidKey(String),
}

/// The subset of the service-account descriptor this system uses.
///
/// Google's blob carries more fields (cert URLs, universe domain); anything
/// not needed for the JWT-bearer exchange is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub private_key_id: String,
    pub private_key: String,
    pub client_email: String,
    pub token_uri: String,
}

#[derive(Serialize)]
struct JwtHeader {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

/// Load the service-account key from `SERVICE_KEY` or, failing that, from
/// the given key file.
pub fn load_service_key(key_file: Option<&Path>) -> Result<ServiceAccountKey, CredentialsError> {
    let raw = std::env::var(SERVICE_KEY_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty());
    load_from(raw, key_file)
}

fn load_from(
    raw: Option<String>,
    key_file: Option<&Path>,
) -> Result<ServiceAccountKey, CredentialsError> {
    let raw = match (raw, key_file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            CredentialsError::InvalidKey(format!(
                "failed to read key file {}: {e}",
                path.display()
            ))
        })?,
        (None, None) => return Err(CredentialsError::Missing),
    };
    parse_service_key(&raw)
}

/// Parse and validate a raw descriptor.
///
/// Parsing is two-phase so the error distinguishes JSON syntax problems from
/// structural ones. The PEM key is parsed eagerly as well: a descriptor that
/// cannot sign is rejected here rather than at first use.
pub fn parse_service_key(raw: &str) -> Result<ServiceAccountKey, CredentialsError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| CredentialsError::InvalidJson(e.to_string()))?;
    let key: ServiceAccountKey = serde_json::from_value(value)
        .map_err(|e| CredentialsError::InvalidKey(e.to_string()))?;
    key.rsa_key_pair()?;
    Ok(key)
}

impl ServiceAccountKey {
    fn rsa_key_pair(&self) -> Result<RsaKeyPair, CredentialsError> {
        let mut reader = std::io::Cursor::new(self.private_key.as_bytes());
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| CredentialsError::InvalidKey(format!("invalid PEM private key: {e}")))?;
        match item {
            Some(rustls_pemfile::Item::Pkcs8Key(der)) => {
                RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()).map_err(|_| {
                    CredentialsError::InvalidKey("not a usable PKCS#8 RSA key".to_string())
                })
            }
            Some(rustls_pemfile::Item::Pkcs1Key(der)) => RsaKeyPair::from_der(der.secret_pkcs1_der())
                .map_err(|_| {
                    CredentialsError::InvalidKey("not a usable PKCS#1 RSA key".to_string())
                }),
            _ => Err(CredentialsError::InvalidKey(
                "private_key holds no PEM private key".to_string(),
            )),
        }
    }

    /// Build the signed RS256 JWT-bearer assertion for the token exchange.
    pub fn signed_jwt(&self, now: DateTime<Utc>) -> Result<String, CredentialsError> {
        let iat = now.timestamp();
        let exp = (now + Duration::seconds(TOKEN_LIFETIME_SECS)).timestamp();

        let header = JwtHeader {
            alg: "RS256",
            typ: "JWT",
        };
        let claims = JwtClaims {
            iss: &self.client_email,
            scope: SPREADSHEETS_SCOPE,
            aud: &self.token_uri,
            exp,
            iat,
        };

        let header_b64 = BASE64_URL_SAFE_NO_PAD.encode(
            serde_json::to_string(&header)
                .map_err(|e| CredentialsError::InvalidKey(format!("encode jwt header: {e}")))?,
        );
        let claims_b64 = BASE64_URL_SAFE_NO_PAD.encode(
            serde_json::to_string(&claims)
                .map_err(|e| CredentialsError::InvalidKey(format!("encode jwt claims: {e}")))?,
        );
        let signing_input = format!("{header_b64}.{claims_b64}");

        let key_pair = self.rsa_key_pair()?;
        let mut signature = vec![0; key_pair.public().modulus_len()];
        key_pair
            .sign(
                &ring::signature::RSA_PKCS1_SHA256,
                &ring::rand::SystemRandom::new(),
                signing_input.as_bytes(),
                &mut signature,
            )
            .map_err(|_| CredentialsError::InvalidKey("failed to sign jwt payload".to_string()))?;

        let sig_b64 = BASE64_URL_SAFE_NO_PAD.encode(&signature);
        Ok(format!("{signing_input}.{sig_b64}"))
    }
}
