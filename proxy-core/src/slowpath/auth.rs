//! Flow authentication: JWT and opaque token validation
//!
//! A `SlowPathRule` in `AuthMode::Jwt` or `AuthMode::Opaque` carries its
//! own key material (per-rule, not a single process-wide secret), so two
//! rules can authenticate against different issuers. Validation only —
//! the data plane never issues tokens.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::FlowError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
}

/// Per-rule key material for JWT validation.
#[derive(Debug, Clone)]
pub struct JwtKeyMaterial {
    pub algorithm: Algorithm,
    pub public_key_pem: Vec<u8>,
    pub expected_issuer: Option<String>,
    pub expected_audience: Option<String>,
}

/// Per-rule opaque token store: a fixed set of valid tokens mapped to the
/// identity they authenticate as. A production deployment would back this
/// with the control plane's token introspection endpoint; tests and small
/// deployments can use a static set.
#[derive(Debug, Clone, Default)]
pub struct OpaqueTokenStore {
    valid_tokens: std::collections::HashMap<String, String>,
}

impl OpaqueTokenStore {
    pub fn new(valid_tokens: std::collections::HashMap<String, String>) -> Self {
        Self { valid_tokens }
    }

    pub fn validate(&self, token: &str) -> Result<String, FlowError> {
        self.valid_tokens
            .get(token)
            .cloned()
            .ok_or_else(|| FlowError::AuthFailed("opaque token not recognized".into()))
    }
}

/// Validate a JWT against a rule's key material, returning the subject
/// identity on success.
pub fn validate_jwt(token: &str, key: &JwtKeyMaterial) -> Result<String, FlowError> {
    let decoding_key = match key.algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => DecodingKey::from_secret(&key.public_key_pem),
        _ => DecodingKey::from_rsa_pem(&key.public_key_pem)
            .or_else(|_| DecodingKey::from_ec_pem(&key.public_key_pem))
            .map_err(|e| FlowError::AuthFailed(format!("invalid key material: {e}")))?,
    };

    let mut validation = Validation::new(key.algorithm);
    if let Some(iss) = &key.expected_issuer {
        validation.set_issuer(&[iss.clone()]);
    }
    if let Some(aud) = &key.expected_audience {
        validation.set_audience(&[aud.clone()]);
    }

    let data = decode::<JwtClaims>(token, &decoding_key, &validation)
        .map_err(|e| FlowError::AuthFailed(format!("jwt validation failed: {e}")))?;

    Ok(data.claims.sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn hs256_key(secret: &str) -> JwtKeyMaterial {
        JwtKeyMaterial {
            algorithm: Algorithm::HS256,
            public_key_pem: secret.as_bytes().to_vec(),
            expected_issuer: None,
            expected_audience: None,
        }
    }

    #[test]
    fn test_valid_jwt_returns_subject() {
        let claims = JwtClaims { sub: "user-1".into(), exp: 9_999_999_999, iss: None, aud: None };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"secret")).unwrap();
        let subject = validate_jwt(&token, &hs256_key("secret")).unwrap();
        assert_eq!(subject, "user-1");
    }

    #[test]
    fn test_wrong_secret_fails() {
        let claims = JwtClaims { sub: "user-1".into(), exp: 9_999_999_999, iss: None, aud: None };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"secret")).unwrap();
        assert!(validate_jwt(&token, &hs256_key("wrong")).is_err());
    }

    #[test]
    fn test_opaque_token_lookup() {
        let mut tokens = std::collections::HashMap::new();
        tokens.insert("tok-abc".to_string(), "service-x".to_string());
        let store = OpaqueTokenStore::new(tokens);
        assert_eq!(store.validate("tok-abc").unwrap(), "service-x");
        assert!(store.validate("unknown").is_err());
    }
}
