use clap::Parser;
use corten_dns_domain::RawConfig;
use corten_dns_proxy::Proxy;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "corten-dns")]
#[command(version)]
#[command(about = "Adaptive DNS forwarding proxy with DoT/DoH upstreams")]
struct Cli {
    /// Listen address
    #[arg(short = 'l', long, default_value = "127.0.0.1")]
    listen: String,

    /// Listen port (0 picks a free port)
    #[arg(short = 'p', long, default_value_t = 53)]
    port: u16,

    /// Upstream URL, repeatable (udp implied; tcp://, tls://, https://)
    #[arg(short = 'u', long = "upstream", required = true)]
    upstreams: Vec<String>,

    /// Fallback upstream URL, repeatable
    #[arg(short = 'f', long = "fallback")]
    fallbacks: Vec<String>,

    /// Bootstrap DNS server for resolving upstream hostnames, repeatable
    #[arg(short = 'b', long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Upstream exchange timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Response cache size in entries (0 disables)
    #[arg(long, default_value_t = 0)]
    cache_size: usize,

    /// Max concurrent upstream exchanges
    #[arg(long, default_value_t = 8)]
    max_parallel: usize,

    /// Refuse ANY queries with NOTIMPL
    #[arg(long)]
    refuse_any: bool,

    /// Per-client UDP queries per second (0 disables)
    #[arg(short = 'r', long, default_value_t = 0)]
    ratelimit: u32,

    /// Client IP exempt from rate limiting, repeatable
    #[arg(long = "ratelimit-whitelist")]
    ratelimit_whitelist: Vec<String>,

    /// Candidate DNS64 resolver (IPv6 literal), repeatable
    #[arg(long = "dns64-upstream")]
    dns64_upstreams: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("corten-dns v{}", env!("CARGO_PKG_VERSION"));

    let raw = RawConfig {
        listen_addr: cli.listen,
        listen_port: cli.port,
        bootstrap_dns: cli.bootstrap.join("\n"),
        fallbacks: cli.fallbacks.join("\n"),
        timeout_ms: cli.timeout_ms,
        upstreams: cli.upstreams.join("\n"),
        max_parallel: cli.max_parallel,
        cache_size: cli.cache_size,
        dns64_upstreams: cli.dns64_upstreams.join("\n"),
        refuse_any: cli.refuse_any,
        ratelimit: cli.ratelimit,
        ratelimit_whitelist: cli.ratelimit_whitelist.join("\n"),
    };
    let config = raw.parse()?;

    let proxy = Proxy::new(config);
    proxy.start().await?;
    info!(addr = %proxy.addr().await?, "serving DNS");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    proxy.stop().await?;

    Ok(())
}
