//! Client-facing listeners. All four feed the same [`Pipeline`]; shutdown is
//! broadcast over a `watch` channel that every accept and read loop selects
//! on.

pub mod https;
pub mod stream;
pub mod udp;

pub use https::HttpsListener;
pub use stream::StreamListener;
pub use udp::UdpListener;

use std::time::Duration;

/// Per-read deadline on client streams and write deadline everywhere.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(10);
