pub mod client;
pub mod config;
pub mod error;

pub use client::{ProviderClient, ProviderRequest, ProviderResponse, RequestBody, ResponseBody};
pub use error::{ConfigError, ErrorClassification, ErrorKind, ProviderError};
