use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid DNS packet: {0}")]
    InvalidPacket(String),

    #[error("Failed to encode DNS message: {0}")]
    Encode(String),

    #[error("Message framing error: {0}")]
    Framing(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Timeout talking to {server}")]
    TransportTimeout { server: String },

    #[error("Transport error talking to {server}: {message}")]
    Transport { server: String, message: String },

    #[error("DoH server {server} returned HTTP {status}")]
    HttpStatus { server: String, status: u16 },

    #[error("Bootstrap resolution failed for {hostname}: {message}")]
    Bootstrap { hostname: String, message: String },

    #[error("NAT64 prefix discovery failed: {0}")]
    Dns64Discovery(String),

    #[error("Proxy is not started")]
    NotStarted,
}

impl ProxyError {
    pub fn io(err: std::io::Error) -> Self {
        ProxyError::Io(err.to_string())
    }
}
