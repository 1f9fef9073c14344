//! Handshake token verification
//!
//! Tokens are issued by the auth service and presented at upgrade.
//!
//! # Token format
//!
//! 1. Encode claims: Base64(JSON({"sub": user_id, "sid": session_id, "exp": unix_secs}))
//! 2. Calculate HMAC-SHA256 digest of the encoded part
//! 3. Format: `${encoded}--${digest_hex}`

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::protocol::{CLOSE_TOKEN_EXPIRED, CLOSE_TOKEN_INVALID};

type HmacSha256 = Hmac<Sha256>;

/// Identity carried by a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Session id
    pub sid: String,
    /// Expiry, unix seconds
    pub exp: i64,
}

/// Token verifier using HMAC-SHA256
pub struct TokenVerifier {
    key: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    /// Verify a token against the current time
    pub fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    /// Verify a token as of `now` (unix seconds)
    pub fn verify_at(&self, token: &str, now: i64) -> Result<Claims, VerifyError> {
        let (encoded, signature) = match token.split_once("--") {
            Some((encoded, signature)) if !signature.contains("--") => (encoded, signature),
            _ => return Err(VerifyError::InvalidFormat),
        };

        if !self.verify_signature(encoded.as_bytes(), signature)? {
            return Err(VerifyError::InvalidSignature);
        }

        let json = String::from_utf8(base64_decode(encoded)?)?;
        let claims: Claims = serde_json::from_str(&json)?;

        if claims.sub.is_empty() || claims.sid.is_empty() {
            return Err(VerifyError::InvalidFormat);
        }
        if claims.exp <= now {
            return Err(VerifyError::Expired);
        }

        Ok(claims)
    }

    fn verify_signature(&self, data: &[u8], signature: &str) -> Result<bool, VerifyError> {
        let expected_hex = hex::encode(self.digest(data)?);

        // Constant-time comparison
        Ok(expected_hex.as_bytes().ct_eq(signature.as_bytes()).into())
    }

    fn digest(&self, data: &[u8]) -> Result<Vec<u8>, VerifyError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| VerifyError::InvalidKey)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Issue a token (tooling and tests)
    pub fn sign(&self, claims: &Claims) -> Result<String, VerifyError> {
        let json = serde_json::to_string(claims)?;
        let encoded = base64_encode(json.as_bytes());
        let signature = hex::encode(self.digest(encoded.as_bytes())?);

        Ok(format!("{}--{}", encoded, signature))
    }
}

/// Errors during token verification
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid key")]
    InvalidKey,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VerifyError {
    /// Close code for a rejected handshake
    pub fn close_code(&self) -> u16 {
        match self {
            VerifyError::Expired => CLOSE_TOKEN_EXPIRED,
            _ => CLOSE_TOKEN_INVALID,
        }
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::{Engine, engine::general_purpose::STANDARD};
    STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::{Engine, engine::general_purpose::STANDARD};
    STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp: i64) -> Claims {
        Claims {
            sub: "user_42".to_string(),
            sid: "sess_1".to_string(),
            exp,
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.sign(&claims(2_000)).unwrap();
        assert_eq!(verifier.verify_at(&token, 1_000).unwrap(), claims(2_000));
    }

    #[test]
    fn test_expired() {
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.sign(&claims(1_000)).unwrap();
        let err = verifier.verify_at(&token, 1_000).unwrap_err();
        assert!(matches!(err, VerifyError::Expired));
        assert_eq!(err.close_code(), CLOSE_TOKEN_EXPIRED);
    }

    #[test]
    fn test_wrong_secret() {
        let token = TokenVerifier::new("other-secret").sign(&claims(2_000)).unwrap();
        let err = TokenVerifier::new("test-secret")
            .verify_at(&token, 1_000)
            .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidSignature));
        assert_eq!(err.close_code(), CLOSE_TOKEN_INVALID);
    }

    #[test]
    fn test_tampered_claims() {
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.sign(&claims(2_000)).unwrap();
        let (_, signature) = token.split_once("--").unwrap();

        let forged = base64_encode(br#"{"sub":"admin","sid":"x","exp":9999999999}"#);
        let err = verifier
            .verify_at(&format!("{forged}--{signature}"), 1_000)
            .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidSignature));
    }

    #[test]
    fn test_invalid_format() {
        let verifier = TokenVerifier::new("test-secret");
        assert!(matches!(
            verifier.verify_at("no-separator", 0),
            Err(VerifyError::InvalidFormat)
        ));
        assert!(matches!(
            verifier.verify_at("too--many--parts", 0),
            Err(VerifyError::InvalidFormat)
        ));
    }

    #[test]
    fn test_signed_garbage_is_rejected() {
        let verifier = TokenVerifier::new("test-secret");
        let encoded = base64_encode(b"\"just a string\"");
        let signature = hex::encode(verifier.digest(encoded.as_bytes()).unwrap());
        assert!(matches!(
            verifier.verify_at(&format!("{encoded}--{signature}"), 0),
            Err(VerifyError::Json(_))
        ));
    }
}
