use axum::http::HeaderMap;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as b64, Engine};
use hmac::{Hmac, Mac};
use picshare_core::{User, UserId};
use picshare_storage::Storage;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;

// Two key slots so rotation keeps tokens minted under the outgoing key
// valid. Env: AUTH_KEY_ACTIVE / AUTH_KEY_NEXT plus the matching _ID vars.
#[derive(Clone, Default)]
pub struct AuthKeys {
    pub active: Option<(String, String)>,
    pub next: Option<(String, String)>,
}

impl AuthKeys {
    pub fn from_env() -> Self {
        let slot = |secret_key: &str, id_key: &str, default_id: &str| {
            std::env::var(secret_key).ok().map(|secret| {
                let kid = std::env::var(id_key).unwrap_or_else(|_| default_id.to_string());
                (kid, secret)
            })
        };
        Self {
            active: slot("AUTH_KEY_ACTIVE", "AUTH_KEY_ACTIVE_ID", "active"),
            next: slot("AUTH_KEY_NEXT", "AUTH_KEY_NEXT_ID", "next"),
        }
    }

    pub fn single(kid: &str, secret: &str) -> Self {
        Self {
            active: Some((kid.to_string(), secret.to_string())),
            next: None,
        }
    }

    fn secret_for(&self, kid: &str) -> Option<&str> {
        [&self.active, &self.next]
            .into_iter()
            .flatten()
            .find(|(k, _)| k == kid)
            .map(|(_, s)| s.as_str())
    }
}

// Role flags always come from the stored user row, never from the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub exp: i64,
    #[serde(default)]
    pub jti: Option<String>,
}

// Token format: kid.payload.sig, base64url without padding, HMAC-SHA256
// over the raw payload bytes.
pub fn verify_token(keys: &AuthKeys, token: &str) -> Result<Claims, ApiError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(ApiError::Unauthorized("bad token".into()));
    }
    let payload = b64
        .decode(parts[1])
        .map_err(|_| ApiError::Unauthorized("bad b64".into()))?;
    let sig = b64
        .decode(parts[2])
        .map_err(|_| ApiError::Unauthorized("bad b64".into()))?;
    let secret = keys
        .secret_for(parts[0])
        .ok_or_else(|| ApiError::Unauthorized("unknown kid".into()))?;
    let mut mac = <Hmac<Sha256>>::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::Unauthorized("bad key".into()))?;
    mac.update(&payload);
    if mac.verify_slice(&sig).is_err() {
        return Err(ApiError::Unauthorized("bad sig".into()));
    }
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|_| ApiError::Unauthorized("bad claims".into()))?;
    if claims.exp < chrono::Utc::now().timestamp() {
        return Err(ApiError::Unauthorized("expired".into()));
    }
    Ok(claims)
}

// Production issuance lives outside this service; this signs for tests and
// the dev tooling.
pub fn mint_token(kid: &str, secret: &str, claims: &Claims) -> Result<String, ApiError> {
    let payload = serde_json::to_vec(claims).map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut mac = <Hmac<Sha256>>::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::Internal("bad signing key".into()))?;
    mac.update(&payload);
    let sig = mac.finalize().into_bytes();
    Ok(format!("{kid}.{}.{}", b64.encode(payload), b64.encode(sig)))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

// With no configured keys nothing verifies, so every authenticated route
// answers 401.
pub async fn authenticate(app: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let Some(token) = bearer(headers) else {
        metrics::AUTH_FAILURES_TOTAL
            .with_label_values(&["missing_token"])
            .inc();
        return Err(ApiError::Unauthorized("missing token".into()));
    };
    let claims = verify_token(&app.auth, token).map_err(|e| {
        metrics::AUTH_FAILURES_TOTAL
            .with_label_values(&["bad_token"])
            .inc();
        e
    })?;
    match app.store.get_user(claims.sub).await {
        Ok(user) => Ok(user),
        Err(_) => {
            metrics::AUTH_FAILURES_TOTAL
                .with_label_values(&["unknown_user"])
                .inc();
            Err(ApiError::Unauthorized("unknown user".into()))
        }
    }
}

pub fn require_moderator(user: &User) -> Result<(), ApiError> {
    if user.is_moderator || user.is_admin {
        Ok(())
    } else {
        metrics::AUTH_FAILURES_TOTAL
            .with_label_values(&["forbidden"])
            .inc();
        Err(ApiError::Forbidden("moderator or admin role required".into()))
    }
}

pub fn require_admin(user: &User) -> Result<(), ApiError> {
    if user.is_admin {
        Ok(())
    } else {
        metrics::AUTH_FAILURES_TOTAL
            .with_label_values(&["forbidden"])
            .inc();
        Err(ApiError::Forbidden("admin role required".into()))
    }
}
