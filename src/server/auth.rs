//! Credential extraction and scoped-token verification.
//!
//! API keys arrive via `X-API-Key` or `Authorization: Bearer`. A Bearer
//! value carrying the scoped-token prefix is not a raw key but an
//! HMAC-SHA256-signed grant that binds a key id to a tool whitelist and an
//! optional expiry; verifying it yields the key plus the whitelist the gate
//! enforces as `token_scope`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Marks a Bearer value as a scoped token rather than a raw API key.
pub const SCOPED_TOKEN_PREFIX: &str = "pgst_";

// ─── Credentials ──────────────────────────────────────────────────────────────

/// What authenticated the request.
#[derive(Debug, Clone)]
pub enum Credential {
    /// A raw API key (the key id is the credential).
    ApiKey(String),
    /// A verified scoped token: key id plus tool whitelist.
    Scoped(ScopedToken),
}

#[derive(Debug, Clone)]
pub struct ScopedToken {
    pub key: String,
    pub tools: HashSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Pull the credential off the request, verifying scoped tokens against
/// `secret`. `Ok(None)` means no credential was presented; `Err` means a
/// scoped token was presented but failed verification.
pub fn extract_credential(headers: &HeaderMap, secret: &[u8]) -> Result<Option<Credential>> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let key = key.trim();
        if !key.is_empty() {
            return Ok(Some(Credential::ApiKey(key.to_string())));
        }
    }
    let Some(bearer) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return Ok(None);
    };
    let bearer = bearer.trim();
    if bearer.is_empty() {
        return Ok(None);
    }
    if bearer.starts_with(SCOPED_TOKEN_PREFIX) {
        let token = verify_scoped_token(secret, bearer)?;
        return Ok(Some(Credential::Scoped(token)));
    }
    Ok(Some(Credential::ApiKey(bearer.to_string())))
}

/// First `X-Forwarded-For` hop, else the transport peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<std::net::SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    peer.map(|addr| addr.ip().to_string())
}

/// Country code from the trusted `X-Country` header.
pub fn client_country(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-country")
        .and_then(|v| v.to_str().ok())
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
}

// ─── Scoped tokens ────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ScopedClaims {
    key: String,
    tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Mint `pgst_<base64url(claims)>.<hex(hmac)>` for a key and tool whitelist.
pub fn mint_scoped_token(
    secret: &[u8],
    key: &str,
    tools: &[String],
    expires_at: Option<DateTime<Utc>>,
) -> Result<String> {
    let claims = ScopedClaims {
        key: key.to_string(),
        tools: tools.to_vec(),
        exp: expires_at.map(|t| t.timestamp()),
    };
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
    let mut mac = HmacSha256::new_from_slice(secret).context("invalid HMAC secret")?;
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    Ok(format!("{SCOPED_TOKEN_PREFIX}{payload}.{signature}"))
}

/// Verify the signature and expiry of a scoped token.
pub fn verify_scoped_token(secret: &[u8], token: &str) -> Result<ScopedToken> {
    let rest = token
        .strip_prefix(SCOPED_TOKEN_PREFIX)
        .context("not a scoped token")?;
    let (payload, signature) = rest.rsplit_once('.').context("malformed scoped token")?;

    let mut mac = HmacSha256::new_from_slice(secret).context("invalid HMAC secret")?;
    mac.update(payload.as_bytes());
    let signature = hex::decode(signature).context("malformed token signature")?;
    mac.verify_slice(&signature)
        .map_err(|_| anyhow::anyhow!("scoped token signature mismatch"))?;

    let claims: ScopedClaims = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(payload)
            .context("malformed token payload")?,
    )?;
    let expires_at = match claims.exp {
        Some(ts) => {
            let exp = Utc
                .timestamp_opt(ts, 0)
                .single()
                .context("invalid token expiry")?;
            if Utc::now() >= exp {
                bail!("scoped token expired");
            }
            Some(exp)
        }
        None => None,
    };
    Ok(ScopedToken {
        key: claims.key,
        tools: claims.tools.into_iter().collect(),
        expires_at,
    })
}

// ─── Admin token ──────────────────────────────────────────────────────────────

/// Return the admin bearer token, generating it on first use.
///
/// The token file is created with user-only permissions (mode 0600 on Unix)
/// from the start, so there is no window where another local user can read
/// it. It is the only credential protecting the admin surface.
pub fn get_or_create_token(data_dir: &Path, filename: &str) -> Result<String> {
    let path = data_dir.join(filename);

    if path.exists() {
        let token = std::fs::read_to_string(&path)?.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let token = Uuid::new_v4().to_string().replace('-', "");
    std::fs::create_dir_all(data_dir)?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        f.write_all(token.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(&path, &token)?;

    Ok(token)
}

/// Constant-time token comparison to prevent timing-based token oracles.
pub fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn scoped_token_roundtrip() {
        let secret = b"test-secret";
        let token = mint_scoped_token(
            secret,
            "pg_abc",
            &["fs:read_file".to_string(), "fs:list_dir".to_string()],
            None,
        )
        .unwrap();
        assert!(token.starts_with(SCOPED_TOKEN_PREFIX));

        let verified = verify_scoped_token(secret, &token).unwrap();
        assert_eq!(verified.key, "pg_abc");
        assert!(verified.tools.contains("fs:read_file"));
        assert!(verified.expires_at.is_none());
    }

    #[test]
    fn tampered_token_rejected() {
        let secret = b"test-secret";
        let token = mint_scoped_token(secret, "pg_abc", &["a".into()], None).unwrap();
        let mut tampered = token.clone();
        tampered.truncate(token.len() - 2);
        tampered.push_str("ff");
        assert!(verify_scoped_token(secret, &tampered).is_err());
        assert!(verify_scoped_token(b"other-secret", &token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let secret = b"s";
        let token = mint_scoped_token(
            secret,
            "pg_abc",
            &["a".into()],
            Some(Utc::now() - chrono::Duration::minutes(1)),
        )
        .unwrap();
        assert!(verify_scoped_token(secret, &token).is_err());
    }

    #[test]
    fn api_key_header_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("pg_header"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer pg_bearer"),
        );
        match extract_credential(&headers, b"s").unwrap() {
            Some(Credential::ApiKey(key)) => assert_eq!(key, "pg_header"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bearer_scoped_token_parsed() {
        let secret = b"edge-secret";
        let token = mint_scoped_token(secret, "pg_k", &["fs:read_file".into()], None).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        match extract_credential(&headers, secret).unwrap() {
            Some(Credential::Scoped(scoped)) => {
                assert_eq!(scoped.key, "pg_k");
                assert!(scoped.tools.contains("fs:read_file"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, None).as_deref(), Some("203.0.113.9"));

        let peer: std::net::SocketAddr = "192.0.2.1:4000".parse().unwrap();
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(peer)).as_deref(),
            Some("192.0.2.1")
        );
    }

    #[test]
    fn constant_time_compare() {
        assert!(tokens_equal("abc", "abc"));
        assert!(!tokens_equal("abc", "abd"));
        assert!(!tokens_equal("abc", "abcd"));
    }
}
