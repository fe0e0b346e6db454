use crate::{
    constants::API_ERROR_INVALID_TOKEN,
    error::GatewayError,
    models::{TokenData, UserId, UserRole},
};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// Turns a raw bearer credential into a verified identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<TokenData, GatewayError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub id: u32,
    pub username: String,
    pub role: UserRole,
    pub exp: i64,
}

/// HS256 verifier for tokens signed with a shared secret by the token issuer.
pub struct JwtTokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtTokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<TokenData, GatewayError> {
        let decoded = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(|err| {
            tracing::debug!(error = %err, "token verification failed");
            GatewayError::unauthorized(API_ERROR_INVALID_TOKEN)
        })?;
        let claims = decoded.claims;
        Ok(TokenData {
            id: UserId(claims.id),
            username: claims.username,
            role: claims.role,
        })
    }
}

/// Verifier used when authentication is disabled; every token is refused.
pub struct DisabledTokenVerifier;

#[async_trait]
impl TokenVerifier for DisabledTokenVerifier {
    async fn verify(&self, _token: &str) -> Result<TokenData, GatewayError> {
        Err(GatewayError::unauthorized(API_ERROR_INVALID_TOKEN))
    }
}

#[cfg(test)]
mod tests {
    use super::{JwtTokenVerifier, TokenClaims, TokenVerifier};
    use crate::models::{UserId, UserRole};
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn sign(secret: &[u8], claims: &TokenClaims) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret)).expect("sign token")
    }

    fn claims(exp: i64) -> TokenClaims {
        TokenClaims {
            id: 7,
            username: "bob".to_string(),
            role: UserRole::Standard,
            exp,
        }
    }

    #[tokio::test]
    async fn accepts_token_signed_with_shared_secret() {
        let verifier = JwtTokenVerifier::new(b"secret");
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = sign(b"secret", &claims(exp));
        let data = verifier.verify(&token).await.expect("valid token");
        assert_eq!(data.id, UserId(7));
        assert_eq!(data.username, "bob");
        assert_eq!(data.role, UserRole::Standard);
    }

    #[tokio::test]
    async fn rejects_token_with_wrong_signature() {
        let verifier = JwtTokenVerifier::new(b"secret");
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = sign(b"other", &claims(exp));
        let err = verifier.verify(&token).await.expect_err("bad signature");
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let verifier = JwtTokenVerifier::new(b"secret");
        let exp = chrono::Utc::now().timestamp() - 3600;
        let token = sign(b"secret", &claims(exp));
        assert!(verifier.verify(&token).await.is_err());
    }
}
