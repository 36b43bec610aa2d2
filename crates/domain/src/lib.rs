pub mod config;
pub mod errors;
pub mod upstream_url;

pub use config::{ProxyConfig, RawConfig, DEFAULT_TIMEOUT_MS};
pub use errors::ProxyError;
pub use upstream_url::{UpstreamAddr, UpstreamUrl};
