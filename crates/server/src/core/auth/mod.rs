//! Connection Authentication
//!
//! Resolves the credential presented on a connection handshake (or an HTTP
//! request) to an [`Identity`]. Tokens are HS256 JWTs whose issuer and
//! audience are checked; the subject must still exist in the store.
//! Token issuance lives elsewhere.

pub mod middleware;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::RealtimeConfig;
use crate::core::error::{Error, Result};
use crate::core::models::Identity;
use crate::core::store::ChatStore;

/// Claims carried by a connection token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub exp: usize,
    pub iss: String,
    pub aud: String,
}

/// Turns a raw credential into an identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_identity(&self, token: &str) -> Result<Identity>;
}

/// Verifies signed tokens and loads the subject from the store.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    store: Arc<ChatStore>,
}

impl JwtVerifier {
    pub fn new(config: &RealtimeConfig, store: Arc<ChatStore>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.jwt_issuer.as_str()]);
        validation.set_audience(&[config.jwt_audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            store,
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify_identity(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;

        let user = self
            .store
            .get_user(&data.claims.sub)
            .await?
            .ok_or_else(|| Error::Authentication("user no longer exists".to_string()))?;

        Ok(Identity::from(user))
    }
}

/// Front door for every connection and authenticated HTTP request.
pub struct Authenticator {
    verifier: Arc<dyn IdentityVerifier>,
}

impl Authenticator {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { verifier }
    }

    /// Fails with `Authentication` for a missing or invalid credential.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity> {
        let token = credential
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Authentication("missing credential".to_string()))?;

        match self.verifier.verify_identity(token).await {
            Ok(identity) => {
                debug!("[Auth] Authenticated {}", identity.user_id);
                Ok(identity)
            }
            Err(e) => {
                warn!("[Auth] Rejected credential: {}", e);
                Err(e)
            }
        }
    }
}

/// Pulls a credential out of `Authorization: Bearer <token>`, falling back
/// to a `token` query parameter (browsers cannot set headers on a socket
/// handshake).
pub fn extract_credential(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    from_header.or_else(|| query_token.map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            jwt_secret: "test-secret".to_string(),
            ..Default::default()
        }
    }

    fn token(config: &RealtimeConfig, sub: &str, iss: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
            iss: iss.to_string(),
            aud: config.jwt_audience.clone(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap()
    }

    async fn authenticator() -> (Authenticator, Arc<ChatStore>, RealtimeConfig) {
        let config = config();
        let store = Arc::new(ChatStore::in_memory().await.unwrap());
        let verifier = Arc::new(JwtVerifier::new(&config, store.clone()));
        (Authenticator::new(verifier), store, config)
    }

    #[tokio::test]
    async fn test_valid_token_resolves_identity() {
        let (auth, store, config) = authenticator().await;
        let user = store.create_user("ann@example.com", "Ann").await.unwrap();

        let identity = auth
            .authenticate(Some(&token(&config, &user.id, &config.jwt_issuer, 3600)))
            .await
            .unwrap();
        assert_eq!(identity.user_id, user.id);
        assert_eq!(identity.display_name, "Ann");
        assert_eq!(identity.email, "ann@example.com");
    }

    #[tokio::test]
    async fn test_rejections() {
        let (auth, store, config) = authenticator().await;
        let user = store.create_user("ann@example.com", "Ann").await.unwrap();

        let cases = vec![
            None,
            Some("".to_string()),
            Some("not-a-jwt".to_string()),
            Some(token(&config, &user.id, &config.jwt_issuer, -3600)),
            Some(token(&config, &user.id, "someone-else", 3600)),
            Some(token(&config, "ghost-user", &config.jwt_issuer, 3600)),
        ];

        for credential in cases {
            let err = auth.authenticate(credential.as_deref()).await.unwrap_err();
            assert!(
                matches!(err, Error::Authentication(_)),
                "expected auth error for {:?}, got {:?}",
                credential,
                err
            );
        }
    }

    #[test]
    fn test_extract_credential_prefers_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_credential(&headers, Some("q")), Some("q".to_string()));

        headers.insert(header::AUTHORIZATION, "Bearer h".parse().unwrap());
        assert_eq!(extract_credential(&headers, Some("q")), Some("h".to_string()));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(extract_credential(&headers, None), None);
    }
}
