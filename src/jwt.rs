//! Session JWT verification
//!
//! Verifies the HS256 compact form and extracts the few claims the core
//! reads. Anything beyond this contract (JWKS rotation, asymmetric
//! algorithms) belongs to the external auth service.
//!
//! # Token layout
//!
//! `base64url(header).base64url(claims).base64url(hmac_sha256(signing_input))`

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Clock-skew tolerance for `exp`, in seconds
const EXP_LEEWAY_SECS: u64 = 30;

/// Claims extracted from a verified token
#[derive(Debug, Clone)]
pub struct Claims {
    pub sub: Option<String>,
    pub role: Option<String>,
    pub exp: Option<u64>,
    /// The full claims object, forwarded to authorization probes
    pub raw: Value,
}

/// Token verifier bound to one tenant's secret
pub struct TokenVerifier {
    key: Vec<u8>,
    /// Claim names that must be present (from `jwt_claim_validators`)
    required_claims: Vec<String>,
}

impl TokenVerifier {
    pub fn new(secret: &str, required_claims: Vec<String>) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            required_claims,
        }
    }

    /// Verify a compact JWT and return its claims
    pub fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(VerifyError::InvalidFormat);
        }

        let header: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0])?)?;
        match header.get("alg").and_then(|a| a.as_str()) {
            Some("HS256") => {}
            Some(other) => return Err(VerifyError::UnsupportedAlgorithm(other.to_string())),
            None => return Err(VerifyError::InvalidFormat),
        }

        let signing_input = &token[..parts[0].len() + 1 + parts[1].len()];
        if !self.verify_signature(signing_input.as_bytes(), parts[2])? {
            return Err(VerifyError::InvalidSignature);
        }

        let raw: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1])?)?;
        let claims = Claims {
            sub: raw.get("sub").and_then(|v| v.as_str()).map(String::from),
            role: raw.get("role").and_then(|v| v.as_str()).map(String::from),
            exp: raw.get("exp").and_then(|v| v.as_u64()),
            raw,
        };

        self.validate_claims(&claims)?;
        Ok(claims)
    }

    /// Verify the HMAC signature in constant time
    fn verify_signature(&self, data: &[u8], signature: &str) -> Result<bool, VerifyError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| VerifyError::InvalidKey)?;
        mac.update(data);
        let expected = mac.finalize().into_bytes();
        let given = URL_SAFE_NO_PAD.decode(signature)?;

        Ok(expected.as_slice().ct_eq(given.as_slice()).into())
    }

    fn validate_claims(&self, claims: &Claims) -> Result<(), VerifyError> {
        for name in &self.required_claims {
            if claims.raw.get(name).is_none() {
                return Err(VerifyError::MissingClaim(name.clone()));
            }
        }

        if let Some(exp) = claims.exp {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if exp + EXP_LEEWAY_SECS < now {
                return Err(VerifyError::Expired);
            }
        }

        Ok(())
    }

    /// Generate a signed token (for testing)
    #[allow(dead_code)]
    pub fn sign(&self, claims: &Value) -> Result<String, VerifyError> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{header}.{payload}");

        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| VerifyError::InvalidKey)?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }
}

/// Errors during token verification
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    #[error("token expired")]
    Expired,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_verify_roundtrip() {
        let verifier = TokenVerifier::new("test-secret", vec![]);
        let token = verifier
            .sign(&json!({"sub": "user_42", "role": "authenticated"}))
            .unwrap();

        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("user_42"));
        assert_eq!(claims.role.as_deref(), Some("authenticated"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signer = TokenVerifier::new("secret-a", vec![]);
        let verifier = TokenVerifier::new("secret-b", vec![]);
        let token = signer.sign(&json!({"sub": "user_42"})).unwrap();

        assert!(matches!(
            verifier.verify(&token),
            Err(VerifyError::InvalidSignature)
        ));
    }

    #[test]
    fn test_invalid_format() {
        let verifier = TokenVerifier::new("test-secret", vec![]);
        assert!(verifier.verify("only.two").is_err());
        assert!(verifier.verify("garbage").is_err());
    }

    #[test]
    fn test_required_claim_enforced() {
        let verifier = TokenVerifier::new("test-secret", vec!["exp".to_string()]);
        let token = verifier.sign(&json!({"sub": "user_42"})).unwrap();

        assert!(matches!(
            verifier.verify(&token),
            Err(VerifyError::MissingClaim(name)) if name == "exp"
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = TokenVerifier::new("test-secret", vec![]);
        let token = verifier.sign(&json!({"sub": "u", "exp": 1000})).unwrap();

        assert!(matches!(verifier.verify(&token), Err(VerifyError::Expired)));
    }

    #[test]
    fn test_non_hs256_rejected() {
        let verifier = TokenVerifier::new("test-secret", vec![]);
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"u"}"#);
        let token = format!("{header}.{payload}.c2ln");

        assert!(matches!(
            verifier.verify(&token),
            Err(VerifyError::UnsupportedAlgorithm(_))
        ));
    }
}
