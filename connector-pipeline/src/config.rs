use connector_common::config::{EnvMsDuration, NonEmptyString};
use envconfig::Envconfig;

use crate::signature::SignatureVerifier;

#[derive(Envconfig, Clone)]
pub struct WebhookConfig {
    #[envconfig(from = "WEBHOOK_SIGNATURE_ENABLED", default = "true")]
    pub signature_enabled: bool,

    #[envconfig(from = "WEBHOOK_SIGNATURE_SECRET")]
    pub signature_secret: Option<NonEmptyString>,

    #[envconfig(from = "WEBHOOK_SIGNATURE_HEADER", default = "x-hub-signature-256")]
    pub signature_header: String,

    #[envconfig(from = "WEBHOOK_SIGNATURE_PREFIX", default = "sha256=")]
    pub signature_prefix: String,

    #[envconfig(from = "WEBHOOK_VERIFY_TOKEN")]
    pub verify_token: Option<NonEmptyString>,

    #[envconfig(from = "WEBHOOK_DEDUPE_TTL_MS", default = "86400000")]
    pub dedupe_ttl: EnvMsDuration,
}

impl WebhookConfig {
    pub fn signature_verifier(&self) -> SignatureVerifier {
        let verifier = match &self.signature_secret {
            Some(secret) => SignatureVerifier::new(secret.as_str()),
            None => SignatureVerifier::unconfigured(),
        };

        verifier
            .header(&self.signature_header)
            .prefix(&self.signature_prefix)
            .enabled(self.signature_enabled)
    }
}
