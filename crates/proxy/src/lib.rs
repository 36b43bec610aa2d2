//! Adaptive DNS forwarding proxy.
//!
//! Accepts queries over UDP, TCP, DNS-over-TLS and DNS-over-HTTPS, forwards
//! them to upstream resolvers chosen by observed round-trip time, and writes
//! the replies back on the originating transport. Optional layers: a
//! short-term response cache, per-client UDP rate limiting, and DNS64
//! synthesis for IPv6-only networks.

pub mod bootstrap;
pub mod cache;
pub mod codec;
pub mod context;
pub mod dns64;
pub mod events;
pub mod listeners;
pub mod pipeline;
pub mod proxy;
pub mod ratelimit;
pub mod selector;
pub mod upstream;

pub use context::{DnsContext, Proto};
pub use events::{set_listener, ProcessedEvent, ProcessedEventListener};
pub use pipeline::{Pipeline, ResolveHandler, ResolveHook};
pub use proxy::{ListenConfig, Proxy};
pub use upstream::Upstream;
