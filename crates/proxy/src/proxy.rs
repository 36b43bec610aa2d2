//! The proxy facade: configuration validation, listener lifecycle, and the
//! embedding operations (`start`, `stop`, `addr`, `resolve`).

use crate::bootstrap;
use crate::cache::ResponseCache;
use crate::codec;
use crate::context::DnsContext;
use crate::dns64;
use crate::listeners::{HttpsListener, StreamListener, UdpListener};
use crate::pipeline::{Pipeline, ResolveHook};
use crate::ratelimit::UdpRateLimiter;
use crate::selector::UpstreamSelector;
use crate::upstream::{self, Upstream};
use corten_dns_domain::{ProxyConfig, ProxyError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Where the proxy listens. The plaintext listeners come straight from the
/// embedding config; DoT/DoH are opted into by embedders that own a TLS
/// certificate.
#[derive(Default)]
pub struct ListenConfig {
    pub udp: Option<SocketAddr>,
    pub tcp: Option<SocketAddr>,
    pub tls: Option<(SocketAddr, Arc<rustls::ServerConfig>)>,
    pub https: Option<(SocketAddr, Arc<rustls::ServerConfig>)>,
}

impl ListenConfig {
    /// UDP + TCP on the configured listen address, the mobile-config shape.
    pub fn plaintext(config: &ProxyConfig) -> Self {
        let addr = SocketAddr::new(config.listen_addr, config.listen_port);
        Self {
            udp: Some(addr),
            tcp: Some(addr),
            tls: None,
            https: None,
        }
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pipeline: Arc<Pipeline>,
    udp_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
    tls_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
}

pub struct Proxy {
    config: ProxyConfig,
    listen: ListenConfig,
    hook: ResolveHook,
    state: Mutex<Option<Running>>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        let listen = ListenConfig::plaintext(&config);
        Self::with_listeners(config, listen)
    }

    pub fn with_listeners(config: ProxyConfig, listen: ListenConfig) -> Self {
        Self {
            config,
            listen,
            hook: ResolveHook::Default,
            state: Mutex::new(None),
        }
    }

    /// Replaces the default resolution path. Must be called before `start`.
    pub fn with_hook(mut self, hook: ResolveHook) -> Self {
        self.hook = hook;
        self
    }

    pub async fn start(&self) -> Result<(), ProxyError> {
        info!("starting the DNS proxy");
        self.config.validate()?;

        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ProxyError::Config("proxy is already started".into()));
        }

        let timeout = self.config.timeout();

        // Resolve hostname-form upstreams through the bootstrap servers,
        // then build the drivers.
        let upstream_urls =
            bootstrap::resolve_upstreams(&self.config.upstreams, &self.config.bootstrap, timeout)
                .await?;
        let upstreams = upstream_urls
            .iter()
            .map(|url| upstream::build(url, timeout))
            .collect::<Result<Vec<Arc<dyn Upstream>>, _>>()?;

        let fallback_urls =
            bootstrap::resolve_upstreams(&self.config.fallbacks, &self.config.bootstrap, timeout)
                .await?;
        let fallbacks = fallback_urls
            .iter()
            .map(|url| upstream::build(url, timeout))
            .collect::<Result<Vec<Arc<dyn Upstream>>, _>>()?;

        let cache = ResponseCache::new(self.config.cache_size);
        if cache.is_some() {
            info!(capacity = self.config.cache_size, "response cache enabled");
        }
        if self.config.ratelimit > 0 {
            info!(rps = self.config.ratelimit, "UDP rate limiting enabled");
        }
        if self.config.refuse_any {
            info!("refusing ANY requests");
        }

        let pipeline = Arc::new(Pipeline::new(
            UpstreamSelector::new(upstreams),
            fallbacks,
            cache,
            UdpRateLimiter::new(
                self.config.ratelimit,
                self.config.ratelimit_whitelist.clone(),
            ),
            self.config.max_parallel,
            self.config.refuse_any,
            self.hook.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut udp_addr = None;
        let mut tcp_addr = None;
        let mut tls_addr = None;
        let mut https_addr = None;

        if let Some(addr) = self.listen.udp {
            let listener = UdpListener::bind(addr).await?;
            udp_addr = Some(listener.local_addr());
            tasks.push(listener.spawn(Arc::clone(&pipeline), shutdown_rx.clone()));
        }
        if let Some(addr) = self.listen.tcp {
            let listener = StreamListener::bind_tcp(addr).await?;
            tcp_addr = Some(listener.local_addr());
            tasks.push(listener.spawn(Arc::clone(&pipeline), shutdown_rx.clone()));
        }
        if let Some((addr, tls_config)) = &self.listen.tls {
            let listener = StreamListener::bind_tls(*addr, Arc::clone(tls_config)).await?;
            tls_addr = Some(listener.local_addr());
            tasks.push(listener.spawn(Arc::clone(&pipeline), shutdown_rx.clone()));
        }
        if let Some((addr, tls_config)) = &self.listen.https {
            let listener = HttpsListener::bind(*addr, Arc::clone(tls_config)).await?;
            https_addr = Some(listener.local_addr());
            tasks.push(listener.spawn(Arc::clone(&pipeline), shutdown_rx.clone()));
        }

        if udp_addr.is_none() && tcp_addr.is_none() && tls_addr.is_none() && https_addr.is_none() {
            return Err(ProxyError::Config("no listen address specified".into()));
        }

        // NAT64 prefix discovery runs in the background; queries processed
        // before it completes behave as if DNS64 were off.
        let candidates = dns64::well_formed_candidates(&self.config.dns64_upstreams);
        if !candidates.is_empty() {
            let pipeline = Arc::clone(&pipeline);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    discovered = dns64::discover(candidates) => match discovered {
                        Ok(prefix) => pipeline.set_nat64_prefix(prefix),
                        Err(e) => warn!(error = %e, "NAT64 prefix discovery failed"),
                    }
                }
            }));
        }

        *state = Some(Running {
            shutdown_tx,
            tasks,
            pipeline,
            udp_addr,
            tcp_addr,
            tls_addr,
            https_addr,
        });
        info!("DNS proxy started");
        Ok(())
    }

    /// Stops all listeners. Idempotent; in-flight requests complete to their
    /// response write.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let running = self.state.lock().await.take();
        let Some(running) = running else {
            info!("the DNS proxy is not started");
            return Ok(());
        };

        let _ = running.shutdown_tx.send(true);
        for task in running.tasks {
            if task.await.is_err() {
                warn!("listener task panicked during shutdown");
            }
        }
        info!("DNS proxy stopped");
        Ok(())
    }

    /// Local address of the UDP listener, the primary embedding handle.
    pub async fn addr(&self) -> Result<SocketAddr, ProxyError> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .and_then(|running| running.udp_addr)
            .ok_or(ProxyError::NotStarted)
    }

    pub async fn tcp_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().and_then(|r| r.tcp_addr)
    }

    pub async fn tls_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().and_then(|r| r.tls_addr)
    }

    pub async fn https_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().and_then(|r| r.https_addr)
    }

    /// True once NAT64 prefix discovery has stored a prefix.
    pub async fn nat64_prefix_discovered(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| r.pipeline.nat64_prefix().is_some())
    }

    /// Feeds a wire-form query straight into the pipeline and returns the
    /// wire-form response. The embedding entry point for platforms that own
    /// their own sockets.
    pub async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let pipeline = {
            let state = self.state.lock().await;
            let running = state.as_ref().ok_or(ProxyError::NotStarted)?;
            Arc::clone(&running.pipeline)
        };

        let request = codec::unpack(query)?;
        let mut ctx = DnsContext::internal(request);
        let response = pipeline
            .handle(&mut ctx)
            .await
            .expect("internal requests are never rate limited");
        codec::pack(&response)
    }
}
