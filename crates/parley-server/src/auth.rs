//! The credential/identity seam.
//!
//! Registration and password handling live in the external account system;
//! the server only resolves opaque bearer tokens to identities. REST
//! handlers pull the identity through the [`AuthedUser`] extractor; the
//! WebSocket gateway also accepts the token as a query parameter since
//! browsers cannot set headers on socket upgrades.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap};

use parley_shared::UserId;

use crate::error::ServerError;
use crate::state::{AppState, SharedDb};

/// Narrow interface over the token table: bearer string in, identity out.
pub struct CredentialCheck {
    db: SharedDb,
}

impl CredentialCheck {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Resolve a bearer token. `Ok(None)` means the token is unknown or
    /// revoked.
    pub async fn identify(&self, bearer: &str) -> Result<Option<UserId>, ServerError> {
        if bearer.is_empty() {
            return Ok(None);
        }
        let db = self.db.lock().await;
        Ok(db.user_for_token(bearer)?)
    }
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    auth.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

/// Mint a fresh opaque token. The account system seeds these out of band;
/// the server itself never issues credentials.
#[allow(dead_code)]
pub fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// The authenticated caller of a REST request.
pub struct AuthedUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_from_headers(&parts.headers).ok_or(ServerError::Unauthorized)?;
        let user = state
            .credentials
            .identify(&token)
            .await?
            .ok_or(ServerError::Unauthorized)?;
        Ok(AuthedUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_from_headers(&headers), Some("abc123".to_string()));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("abc123"));
        assert_eq!(bearer_from_headers(&headers), None);
    }

    #[test]
    fn test_generated_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
