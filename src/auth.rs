//! Connect-time identity verification.
//!
//! Every socket must present a bearer token minted by the HTTP auth layer.
//! The token is checked for signature and expiry, and the identity it names
//! must still exist in the user directory; only then does the connection get
//! a session.

use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Token payload as minted by the HTTP auth layer (camelCase claim names).
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub exp: usize,
}

/// The identity a verified token resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub email: String,
}

/// Lookup into the account store owned by the HTTP auth layer. A token can
/// outlive its account, so verification re-checks existence on every connect.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find(&self, user_id: &str) -> Option<Identity>;
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity>;
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    directory: Arc<dyn UserDirectory>,
}

impl JwtVerifier {
    pub fn new(secret: &str, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            directory,
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| Error::Auth(format!("token rejected: {}", e)))?;
        self.directory
            .find(&data.claims.user_id)
            .await
            .ok_or_else(|| Error::Auth(format!("unknown user {}", data.claims.user_id)))
    }
}

/// In-memory directory, used by the tests and by deployments that push the
/// account list into the process at startup.
#[derive(Default)]
pub struct StaticDirectory {
    users: HashMap<String, Identity>,
}

impl StaticDirectory {
    pub fn with_user(mut self, user_id: &str, email: &str) -> Self {
        self.users.insert(
            user_id.to_owned(),
            Identity {
                email: email.to_owned(),
            },
        );
        self
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn find(&self, user_id: &str) -> Option<Identity> {
        self.users.get(user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn token_for(user_id: &str, exp_offset: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = Claims {
            user_id: user_id.to_owned(),
            exp: (now + exp_offset) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> JwtVerifier {
        let dir = StaticDirectory::default().with_user("u1", "alice@example.com");
        JwtVerifier::new(SECRET, Arc::new(dir))
    }

    #[tokio::test]
    async fn valid_token_resolves_identity() {
        let identity = verifier().verify(&token_for("u1", 3600)).await.unwrap();
        assert_eq!(identity.email, "alice@example.com");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let err = verifier().verify(&token_for("u1", -3600)).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn deleted_user_is_rejected() {
        let err = verifier().verify(&token_for("gone", 3600)).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let err = verifier().verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn accepts_camel_case_claim_from_auth_service() {
        // The auth service signs `{ userId, exp }`; its tokens must verify
        // without re-minting.
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let token = encode(
            &Header::default(),
            &serde_json::json!({ "userId": "u1", "exp": now + 3600 }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let identity = verifier().verify(&token).await.unwrap();
        assert_eq!(identity.email, "alice@example.com");
    }
}
