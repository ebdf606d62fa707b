//! Resolving access credentials into user identities.
//!
//! Credentials are HS256 access tokens issued elsewhere. The resolver checks
//! an in-memory cache keyed by the raw credential before doing full
//! verification, and caches successful resolutions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::debug;
use moka::future::Cache;
use serde::Deserialize;
use thiserror::Error;

/// Default lifetime of a cached identity.
pub const DEFAULT_IDENTITY_CACHE_TTL: Duration = Duration::from_secs(600);

const IDENTITY_CACHE_CAPACITY: u64 = 10_000;

/// A verified user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Malformed credential: {0}")]
    Malformed(String),

    #[error("Credential expired")]
    Expired,

    #[error("Invalid credential signature")]
    InvalidSignature,

    #[error("Wrong token type: {0}")]
    WrongTokenType(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            _ => AuthError::Malformed(e.to_string()),
        }
    }
}

/// Port to the external authentication collaborator.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, access: &str) -> Result<Identity, AuthError>;
}

/// `user_id` may be issued as a number or a numeric string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClaimId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    user_id: ClaimId,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Full verification of HS256 access tokens.
pub struct JwtIdentityResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityResolver {
    pub fn new(secret: &[u8]) -> Self {
        // `exp` is required and checked by default
        let validation = Validation::new(Algorithm::HS256);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, access: &str) -> Result<Identity, AuthError> {
        let token_data = decode::<AccessClaims>(access, &self.key, &self.validation)?;
        let claims = token_data.claims;

        if let Some(token_type) = claims.token_type {
            if token_type != "access" {
                return Err(AuthError::WrongTokenType(token_type));
            }
        }

        let id = match claims.user_id {
            ClaimId::Number(id) => id,
            ClaimId::Text(text) => text
                .parse()
                .map_err(|_| AuthError::Malformed(format!("non-numeric user_id {:?}", text)))?,
        };

        Ok(Identity {
            id,
            username: claims.username,
        })
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, access: &str) -> Result<Identity, AuthError> {
        self.verify(access)
    }
}

/// Cache in front of another resolver. Failures are never cached.
pub struct CachedIdentityResolver {
    inner: Arc<dyn IdentityResolver>,
    cache: Cache<String, Identity>,
}

impl CachedIdentityResolver {
    pub fn new(inner: Arc<dyn IdentityResolver>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(IDENTITY_CACHE_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self { inner, cache }
    }

    pub async fn get_cached(&self, access: &str) -> Option<Identity> {
        self.cache.get(access).await
    }
}

#[async_trait]
impl IdentityResolver for CachedIdentityResolver {
    async fn resolve(&self, access: &str) -> Result<Identity, AuthError> {
        if let Some(identity) = self.get_cached(access).await {
            debug!("Identity cache hit for user {}", identity.id);
            return Ok(identity);
        }
        let identity = self.inner.resolve(access).await?;
        self.cache.insert(access.to_string(), identity.clone()).await;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::*;

    const SECRET: &[u8] = b"test-secret";

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn token(claims: serde_json::Value, secret: &[u8]) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn test_valid_access_token() {
        let resolver = JwtIdentityResolver::new(SECRET);
        let access = token(
            json!({"user_id": 42, "username": "alice", "token_type": "access", "exp": now() + 300}),
            SECRET,
        );
        let identity = resolver.verify(&access).unwrap();
        assert_eq!(identity.id, 42);
        assert_eq!(identity.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_string_user_id() {
        let resolver = JwtIdentityResolver::new(SECRET);
        let access = token(json!({"user_id": "7", "exp": now() + 300}), SECRET);
        assert_eq!(resolver.verify(&access).unwrap().id, 7);

        let access = token(json!({"user_id": "seven", "exp": now() + 300}), SECRET);
        assert!(matches!(resolver.verify(&access), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_rejections() {
        let resolver = JwtIdentityResolver::new(SECRET);

        let expired = token(json!({"user_id": 1, "exp": now() - 3600}), SECRET);
        assert!(matches!(resolver.verify(&expired), Err(AuthError::Expired)));

        let forged = token(json!({"user_id": 1, "exp": now() + 300}), b"other-secret");
        assert!(matches!(resolver.verify(&forged), Err(AuthError::InvalidSignature)));

        let refresh = token(
            json!({"user_id": 1, "token_type": "refresh", "exp": now() + 300}),
            SECRET,
        );
        assert!(matches!(resolver.verify(&refresh), Err(AuthError::WrongTokenType(_))));

        assert!(matches!(resolver.verify("not-a-jwt"), Err(AuthError::Malformed(_))));

        let no_exp = token(json!({"user_id": 1}), SECRET);
        assert!(resolver.verify(&no_exp).is_err());
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IdentityResolver for CountingResolver {
        async fn resolve(&self, access: &str) -> Result<Identity, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if access == "good" {
                Ok(Identity {
                    id: 1,
                    username: None,
                })
            } else {
                Err(AuthError::Malformed(access.to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_cache_consulted_first() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let resolver = CachedIdentityResolver::new(inner.clone(), DEFAULT_IDENTITY_CACHE_TTL);

        assert_eq!(resolver.resolve("good").await.unwrap().id, 1);
        assert_eq!(resolver.resolve("good").await.unwrap().id, 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        assert!(resolver.resolve("bad").await.is_err());
        assert!(resolver.resolve("bad").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert!(resolver.get_cached("bad").await.is_none());
    }
}
