//! JWT validation for realtime clients
//!
//! Tokens are minted by the platform's identity service; this side only
//! verifies them and maps the claims onto an [`Identity`].

use async_trait::async_trait;
use forkcast_realtime::AuthVerifier;
use forkcast_shared::{Identity, RealtimeError, RealtimeResult, Role};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Claims carried by a platform access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Platform role (`customer`, `restaurant_owner`, `delivery_person`, `admin`)
    pub role: String,
    /// Expiration
    pub exp: i64,
    /// Restaurant owned by a restaurant owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<Value>,
}

/// Verifies HS256 tokens signed with the shared secret
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    leeway_secs: u64,
}

impl JwtVerifier {
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            leeway_secs,
        }
    }

    /// Validate and decode a token
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_secs;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }

    /// Validate a token and build the identity it vouches for
    pub fn identity(&self, token: &str) -> Result<Identity, JwtError> {
        let claims = self.validate_token(token)?;
        if claims.sub.is_empty() {
            return Err(JwtError::Invalid);
        }
        let role = claims
            .role
            .parse::<Role>()
            .map_err(|e| JwtError::Validation(e.to_string()))?;

        let identity = Identity::new(claims.sub, role);
        Ok(match claims.restaurant_id {
            Some(restaurant_id) => identity.with_claim("restaurant_id", restaurant_id),
            None => identity,
        })
    }
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> RealtimeResult<Identity> {
        self.identity(credential).map_err(|e| {
            tracing::debug!(error = %e, "Token rejected");
            RealtimeError::Authentication(e.to_string())
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    fn token(sub: &str, role: &str, ttl_secs: i64, restaurant_id: Option<Value>) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            role: role.to_string(),
            exp: OffsetDateTime::now_utc().unix_timestamp() + ttl_secs,
            restaurant_id,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_token_maps_to_identity() {
        let verifier = JwtVerifier::new(SECRET, 60);
        let identity = verifier
            .identity(&token("42", "restaurant_owner", 3600, Some(Value::from(7))))
            .expect("Invalid token");

        assert_eq!(identity.user_id.as_str(), "42");
        assert_eq!(identity.role, Role::RestaurantOwner);
        assert_eq!(identity.restaurant_id().as_deref(), Some("7"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new(SECRET, 0);
        let result = verifier.identity(&token("42", "customer", -120, None));
        assert!(matches!(result, Err(JwtError::Expired)));
    }

    #[test]
    fn test_wrong_secret_and_unknown_role_rejected() {
        let other = JwtVerifier::new("another-secret-key-at-least-32-chars", 60);
        assert!(other.identity(&token("42", "customer", 3600, None)).is_err());

        let verifier = JwtVerifier::new(SECRET, 60);
        let result = verifier.identity(&token("42", "chef", 3600, None));
        assert!(matches!(result, Err(JwtError::Validation(_))));
    }

    #[tokio::test]
    async fn test_verifier_reports_authentication_error() {
        let verifier = JwtVerifier::new(SECRET, 60);
        let err = verifier.verify("garbage").await.unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    }
}
