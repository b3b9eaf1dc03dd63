//! Webhook signatures and the shared API secret

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::errors::AgentError;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the `X-Hub-Signature-256` header value for `body`
pub fn sign(secret: &SecretString, body: &[u8]) -> Result<String, AgentError> {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| AgentError::Internal(format!("hmac key: {}", e)))?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verify an `X-Hub-Signature-256` header against the raw body in constant time
pub fn verify(secret: &SecretString, body: &[u8], header: Option<&str>) -> Result<(), AgentError> {
    let header = header.ok_or_else(|| AgentError::AuthError("missing signature".to_string()))?;
    let digest = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| AgentError::AuthError("malformed signature".to_string()))?;
    let expected = hex::decode(digest)
        .map_err(|_| AgentError::AuthError("malformed signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| AgentError::Internal(format!("hmac key: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| AgentError::AuthError("signature mismatch".to_string()))
}

/// Check a caller-supplied secret against the configured one in constant time
pub fn check_secret(configured: &SecretString, supplied: Option<&str>) -> Result<(), AgentError> {
    let supplied = supplied.ok_or_else(|| AgentError::AuthError("missing secret".to_string()))?;
    let matches: bool = configured
        .expose_secret()
        .as_bytes()
        .ct_eq(supplied.as_bytes())
        .into();
    if !matches {
        return Err(AgentError::AuthError("invalid secret".to_string()));
    }
    Ok(())
}

/// Independent copy of a secret for another owner
pub fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}
