//! HMAC-SHA256 webhook signature verification.
//!
//! Providers sign the raw request body with a shared secret and send the
//! result as `<prefix><hex digest>` in a header, `sha256=<hex>` in
//! `x-hub-signature-256` by default. Verification runs before the body is
//! parsed.
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const DEFAULT_SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    #[error("request carries no signature header")]
    Missing,
    #[error("signature does not match the request body")]
    Invalid,
    #[error("signature verification is enabled but no secret is configured")]
    NotConfigured,
}

impl SignatureError {
    pub fn code(&self) -> &'static str {
        match self {
            SignatureError::Missing => "MISSING_SIGNATURE",
            SignatureError::Invalid => "INVALID_SIGNATURE",
            SignatureError::NotConfigured => "SIGNATURE_NOT_CONFIGURED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: Option<Vec<u8>>,
    header: String,
    prefix: String,
    enabled: bool,
}

impl SignatureVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Some(secret.as_bytes().to_vec()),
            ..Self::unconfigured()
        }
    }

    /// An enabled verifier with no secret: every request fails with `NotConfigured`.
    pub fn unconfigured() -> Self {
        Self {
            secret: None,
            header: DEFAULT_SIGNATURE_HEADER.to_owned(),
            prefix: DEFAULT_SIGNATURE_PREFIX.to_owned(),
            enabled: true,
        }
    }

    pub fn header(mut self, header: &str) -> Self {
        self.header = header.to_ascii_lowercase();
        self
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_owned();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn header_name(&self) -> &str {
        &self.header
    }

    fn mac(&self) -> Result<HmacSha256, SignatureError> {
        let secret = self.secret.as_deref().ok_or(SignatureError::NotConfigured)?;
        HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::NotConfigured)
    }

    /// Header value a provider would send for `body`.
    pub fn sign(&self, body: &[u8]) -> Result<String, SignatureError> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(format!(
            "{}{}",
            self.prefix,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    /// Check `signature` against `body`. The digest comparison is constant-time.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), SignatureError> {
        if !self.enabled {
            return Ok(());
        }

        let mut mac = self.mac()?;
        let signature = signature
            .map(str::trim)
            .filter(|signature| !signature.is_empty())
            .ok_or(SignatureError::Missing)?;

        let digest = signature
            .strip_prefix(self.prefix.as_str())
            .and_then(|hex_digest| hex::decode(hex_digest).ok())
            .ok_or(SignatureError::Invalid)?;

        mac.update(body);
        mac.verify_slice(&digest)
            .map_err(|_| SignatureError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"object":"whatsapp_business_account","entry":[]}"#;

    #[test]
    fn test_valid_signature() {
        let verifier = SignatureVerifier::new("app-secret");
        let signature = verifier.sign(BODY).unwrap();

        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert_eq!(verifier.verify(BODY, Some(&signature)), Ok(()));
    }

    #[test]
    fn test_known_digest() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let verifier = SignatureVerifier::new("key");
        assert_eq!(
            verifier
                .sign(b"The quick brown fox jumps over the lazy dog")
                .unwrap(),
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_missing_signature() {
        let verifier = SignatureVerifier::new("app-secret");

        assert_eq!(verifier.verify(BODY, None), Err(SignatureError::Missing));
        assert_eq!(verifier.verify(BODY, Some("  ")), Err(SignatureError::Missing));
        assert_eq!(SignatureError::Missing.code(), "MISSING_SIGNATURE");
    }

    #[test]
    fn test_invalid_signature() {
        let verifier = SignatureVerifier::new("app-secret");
        let other = SignatureVerifier::new("other-secret").sign(BODY).unwrap();

        assert_eq!(
            verifier.verify(BODY, Some(&other)),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            verifier.verify(BODY, Some("sha256=not-hex")),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            verifier.verify(BODY, Some("sha1=abcdef")),
            Err(SignatureError::Invalid)
        );
        assert_eq!(SignatureError::Invalid.code(), "INVALID_SIGNATURE");
    }

    #[test]
    fn test_tampered_body() {
        let verifier = SignatureVerifier::new("app-secret");
        let signature = verifier.sign(BODY).unwrap();

        assert_eq!(
            verifier.verify(b"{\"tampered\":true}", Some(&signature)),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn test_custom_prefix() {
        let verifier = SignatureVerifier::new("secret").prefix("");
        let signature = verifier.sign(BODY).unwrap();

        assert!(!signature.starts_with("sha256="));
        assert_eq!(verifier.verify(BODY, Some(&signature)), Ok(()));
    }

    #[test]
    fn test_disabled_and_unconfigured() {
        let disabled = SignatureVerifier::unconfigured().enabled(false);
        assert_eq!(disabled.verify(BODY, None), Ok(()));

        let unconfigured = SignatureVerifier::unconfigured();
        assert_eq!(
            unconfigured.verify(BODY, Some("sha256=00")),
            Err(SignatureError::NotConfigured)
        );
    }
}
