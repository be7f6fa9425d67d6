// Capability tokens
// Signed access tokens scoping a caller to one actor, and short-lived connection tokens

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Caller, CallerType};
use crate::{LiveStateError, Result};

const ACCESS_TOKEN_DAYS: i64 = 30;
const CONNECTION_TOKEN_DAYS: i64 = 1;

/// Claims carried by both token kinds.
///
/// | claim | access token                  | connection token |
/// |-------|-------------------------------|------------------|
/// | `sub` | `"{callerType}-{callerId}"`   | actor id         |
/// | `jti` | actor id                      | connection id    |
/// | `aud` | actor type                    | absent           |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies capability tokens with one shared HS256 secret
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    connection_ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl", &self.access_ttl)
            .field("connection_ttl", &self.connection_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::days(ACCESS_TOKEN_DAYS),
            connection_ttl: Duration::days(CONNECTION_TOKEN_DAYS),
        }
    }

    pub fn with_ttls(mut self, access_ttl: Duration, connection_ttl: Duration) -> Self {
        self.access_ttl = access_ttl;
        self.connection_ttl = connection_ttl;
        self
    }

    pub fn create_access_token(
        &self,
        actor_id: &str,
        caller_id: &str,
        caller_type: CallerType,
        actor_type: &str,
    ) -> Result<String> {
        let caller = Caller::new(caller_id, caller_type);
        self.sign(caller.subject(), actor_id, Some(actor_type), self.access_ttl)
    }

    /// Verify an access token for `expected_actor_type`/`expected_actor_id` and
    /// return the caller it was issued to.
    pub fn verify_access_token(
        &self,
        token: &str,
        expected_actor_type: &str,
        expected_actor_id: &str,
    ) -> Result<Caller> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[expected_actor_type]);
        let claims = self.decode(token, &validation)?;

        if claims.jti != expected_actor_id {
            return Err(LiveStateError::Unauthorized(format!(
                "token is scoped to actor {}, not {}",
                claims.jti, expected_actor_id
            )));
        }
        if claims.aud.as_deref() != Some(expected_actor_type) {
            return Err(LiveStateError::Unauthorized(format!(
                "token audience does not match {}",
                expected_actor_type
            )));
        }
        if claims.sub.is_empty() {
            return Err(LiveStateError::Unauthorized(
                "token has no subject".to_string(),
            ));
        }

        Caller::from_subject(&claims.sub)
    }

    pub fn create_connection_token(&self, actor_id: &str, connection_id: &str) -> Result<String> {
        self.sign(actor_id.to_string(), connection_id, None, self.connection_ttl)
    }

    /// Verify a connection token and return the connection id it is bound to.
    ///
    /// The caller is not part of the token; the host looks it up by this id.
    pub fn verify_connection_token(&self, token: &str) -> Result<String> {
        let validation = Validation::new(Algorithm::HS256);
        let claims = self.decode(token, &validation)?;

        if claims.aud.is_some() {
            return Err(LiveStateError::Unauthorized(
                "access tokens cannot open connections".to_string(),
            ));
        }
        if claims.jti.is_empty() {
            return Err(LiveStateError::Unauthorized(
                "connection token has no id".to_string(),
            ));
        }
        Ok(claims.jti)
    }

    fn sign(&self, sub: String, jti: &str, aud: Option<&str>, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = TokenClaims {
            sub,
            jti: jti.to_string(),
            aud: aud.map(str::to_string),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| LiveStateError::Internal(format!("failed to sign token: {}", e)))
    }

    fn decode(&self, token: &str, validation: &Validation) -> Result<TokenClaims> {
        decode::<TokenClaims>(token, &self.decoding_key, validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Token rejected: {}", e);
                LiveStateError::Unauthorized(format!("invalid token: {}", e))
            })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret")
    }

    #[test]
    fn test_access_token_round_trip() {
        let tokens = service();
        let token = tokens
            .create_access_token("room-1", "u-42", CallerType::User, "session")
            .unwrap();

        let caller = tokens.verify_access_token(&token, "session", "room-1").unwrap();
        assert_eq!(caller, Caller::user("u-42"));
    }

    #[test]
    fn test_access_token_is_scoped_to_actor_and_type() {
        let tokens = service();
        let token = tokens
            .create_access_token("room-1", "g1", CallerType::Guest, "session")
            .unwrap();

        assert!(tokens.verify_access_token(&token, "session", "room-2").is_err());
        assert!(tokens.verify_access_token(&token, "page_session", "room-1").is_err());
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = service()
            .create_access_token("room-1", "g1", CallerType::Guest, "session")
            .unwrap();
        let other = TokenService::new("other-secret");
        assert!(matches!(
            other.verify_access_token(&token, "session", "room-1"),
            Err(LiveStateError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let tokens = service().with_ttls(Duration::minutes(-10), Duration::minutes(-10));
        let token = tokens
            .create_access_token("room-1", "g1", CallerType::Guest, "session")
            .unwrap();
        assert!(tokens.verify_access_token(&token, "session", "room-1").is_err());
    }

    #[test]
    fn test_connection_token_round_trip() {
        let tokens = service();
        let token = tokens.create_connection_token("room-1", "conn-7").unwrap();
        assert_eq!(tokens.verify_connection_token(&token).unwrap(), "conn-7");
    }

    #[test]
    fn test_token_kinds_are_not_interchangeable() {
        let tokens = service();
        let access = tokens
            .create_access_token("room-1", "g1", CallerType::Guest, "session")
            .unwrap();
        let connection = tokens.create_connection_token("room-1", "conn-7").unwrap();

        assert!(tokens.verify_connection_token(&access).is_err());
        assert!(tokens.verify_access_token(&connection, "session", "room-1").is_err());
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer"), None);
    }
}
