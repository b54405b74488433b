use connector_common::config::{BackoffEnvConfig, EnvMsDuration, NonEmptyString};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct ProviderClientConfig {
    #[envconfig(from = "PROVIDER_BASE_URL", default = "https://graph.facebook.com")]
    pub base_url: NonEmptyString,

    #[envconfig(from = "PROVIDER_API_VERSION")]
    pub api_version: Option<NonEmptyString>,

    #[envconfig(from = "PROVIDER_ACCESS_TOKEN")]
    pub access_token: Option<NonEmptyString>,

    #[envconfig(from = "PROVIDER_REQUEST_TIMEOUT_MS", default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "PROVIDER_CONNECTOR")]
    pub connector: Option<NonEmptyString>,

    #[envconfig(nested = true)]
    pub backoff: BackoffEnvConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_provider_config_defaults() {
        let env = HashMap::from([("PROVIDER_API_VERSION".to_owned(), "v19.0".to_owned())]);
        let config = ProviderClientConfig::init_from_hashmap(&env).unwrap();

        assert_eq!(config.base_url.as_str(), "https://graph.facebook.com");
        assert_eq!(
            config.api_version.as_ref().map(NonEmptyString::as_str),
            Some("v19.0")
        );
        assert!(config.access_token.is_none());
        assert_eq!(config.request_timeout.0, Duration::from_secs(10));
        assert_eq!(config.backoff.max_retries, 3);
    }
}
