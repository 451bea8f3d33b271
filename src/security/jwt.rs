use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::security::auth::AuthError;

/// Salesforce rejects assertions that expire more than a few minutes out.
pub const ASSERTION_LIFETIME_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
}

/// RS256 assertion for the JWT bearer grant.
#[derive(Debug, Clone)]
pub struct JwtAssertion {
    claims: AssertionClaims,
}

impl JwtAssertion {
    pub fn new(client_id: &str, subject: &str, audience: &str) -> Self {
        Self {
            claims: AssertionClaims {
                iss: client_id.to_string(),
                sub: subject.to_string(),
                aud: audience.trim_end_matches('/').to_string(),
                exp: Utc::now().timestamp() + ASSERTION_LIFETIME_SECS,
            },
        }
    }

    pub fn claims(&self) -> &AssertionClaims {
        &self.claims
    }

    pub fn sign(&self, private_key_pem: &[u8]) -> Result<String, AuthError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| AuthError::Key(format!("parsing RSA private key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &self.claims, &key)
            .map_err(|e| AuthError::Key(format!("signing assertion: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/jwt_test_key.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/jwt_test_key.pub.pem");

    #[test]
    fn test_assertion_claims() {
        let before = Utc::now().timestamp();
        let assertion = JwtAssertion::new("client-123", "api@example.com", "https://login.salesforce.com/");
        let claims = assertion.claims();

        assert_eq!(claims.iss, "client-123");
        assert_eq!(claims.sub, "api@example.com");
        assert_eq!(claims.aud, "https://login.salesforce.com");
        assert!(claims.exp >= before + ASSERTION_LIFETIME_SECS);
        assert!(claims.exp <= Utc::now().timestamp() + ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn test_signed_assertion_verifies_with_public_key() {
        let assertion = JwtAssertion::new("client-123", "api@example.com", "https://test.salesforce.com");
        let token = assertion.sign(PRIVATE_KEY.as_bytes()).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["https://test.salesforce.com"]);
        validation.set_issuer(&["client-123"]);
        let decoded = decode::<AssertionClaims>(
            &token,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(&decoded.claims, assertion.claims());
        assert_eq!(decoded.header.alg, Algorithm::RS256);
    }

    #[test]
    fn test_invalid_key_is_key_error() {
        let assertion = JwtAssertion::new("client", "user", "https://login.salesforce.com");
        let err = assertion.sign(b"not a pem").unwrap_err();
        assert!(matches!(err, AuthError::Key(_)));
    }
}
