use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::HandlerConfig;
use crate::discovery;
use crate::error::LifecycleError;
use crate::lifecycle::LifecycleManager;
use crate::registry::fingerprint;
use crate::upstream::DialTarget;

/// Request attributes available to placeholder expansion and discovery.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub method: String,
    pub host: String,
}

/// Expands `{...}` placeholder tokens against a request.
///
/// The host implements this against its own config-engine replacer; this
/// crate only depends on the trait, never a concrete expander, so it never
/// has to guess the host's templating syntax.
pub trait PlaceholderExpander: Send + Sync {
    fn expand(&self, template: &str, ctx: &RequestContext) -> String;
}

/// Reference expander used by this crate's own tests and by hosts that have
/// no templating of their own: replaces literal `{name}` tokens from a
/// fixed map, plus `{path}`/`{method}`/`{host}` from the request context.
pub struct StaticPlaceholderExpander {
    pub values: HashMap<String, String>,
}

impl PlaceholderExpander for StaticPlaceholderExpander {
    fn expand(&self, template: &str, ctx: &RequestContext) -> String {
        let mut out = template.to_string();
        out = out.replace("{path}", &ctx.path);
        out = out.replace("{method}", &ctx.method);
        out = out.replace("{host}", &ctx.host);
        for (k, v) in &self.values {
            out = out.replace(&format!("{{{k}}}"), v);
        }
        out
    }
}

/// The host's reverse-proxy primitive: forward the current request to
/// `upstream` and write the response. Implemented by the host framework;
/// this crate never opens a listening socket of its own.
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    async fn forward(&self, upstream: &DialTarget, ctx: &RequestContext) -> Result<(), anyhow::Error>;
}

/// Per-route entry point. One `Handler` is created per configured handler
/// block; it is cheap to clone (everything it owns is `Arc`'d) so the host
/// may hand out copies per worker without sharing mutable state unsafely.
pub struct Handler<P: PlaceholderExpander, R: ReverseProxy> {
    config: Arc<HandlerConfig>,
    lifecycle: Arc<LifecycleManager>,
    expander: Arc<P>,
    proxy: Arc<R>,
}

impl<P: PlaceholderExpander, R: ReverseProxy> Handler<P, R> {
    pub fn new(config: HandlerConfig, lifecycle: Arc<LifecycleManager>, expander: Arc<P>, proxy: Arc<R>) -> Self {
        Self {
            config: Arc::new(config),
            lifecycle,
            expander,
            proxy,
        }
    }

    /// Serve one request: resolve the effective config (via discovery if
    /// configured), ensure a ready backend, rewrite the upstream, and
    /// delegate to the host's reverse proxy. Always releases the backend's
    /// active-request count before returning, on every exit path.
    pub async fn serve_http(&self, ctx: &RequestContext) -> Result<(), HandlerOutcome> {
        if self.config.inspect {
            return self.inspect(ctx).await;
        }

        let effective = self.resolve_effective_config(ctx).await?;
        let key = fingerprint(&effective);

        let instance = self
            .lifecycle
            .ensure_ready(&key, Arc::new(effective.clone()))
            .await
            .map_err(HandlerOutcome::from)?;

        let result = self.proxy.forward(&instance.upstream, ctx).await;
        self.lifecycle.release(instance, effective.idle_timeout).await;

        result.map_err(|e| HandlerOutcome::from(LifecycleError::Proxy(e)))
    }

    async fn resolve_effective_config(&self, ctx: &RequestContext) -> Result<HandlerConfig, HandlerOutcome> {
        match &self.config.discovery_cmd {
            None => Ok(self.expand_config(&self.config, ctx)),
            Some(argv) => {
                let expanded_argv: Vec<String> = argv.iter().map(|a| self.expander.expand(a, ctx)).collect();
                let base = self.expand_config(&self.config, ctx);
                discovery::resolve(&base, &expanded_argv, self.config.discovery_timeout)
                    .await
                    .map_err(HandlerOutcome::from)
            }
        }
    }

    fn expand_config(&self, base: &HandlerConfig, ctx: &RequestContext) -> HandlerConfig {
        let mut cfg = base.clone();
        cfg.executable = cfg.executable.iter().map(|a| self.expander.expand(a, ctx)).collect();
        cfg.upstream_spec = self.expander.expand(&cfg.upstream_spec, ctx);
        if let Some(dir) = &cfg.working_dir {
            cfg.working_dir = Some(self.expander.expand(dir, ctx));
        }
        cfg
    }

    async fn inspect(&self, ctx: &RequestContext) -> Result<(), HandlerOutcome> {
        let effective = self.resolve_effective_config(ctx).await?;
        let key = fingerprint(&effective);
        debug!(key, executable = ?effective.executable, upstream = %effective.upstream_spec, "inspect");
        // The host is expected to observe this via its own logging sink or a
        // side channel; this crate never writes an HTTP body itself since it
        // has no socket of its own. Surfacing the computed values as an
        // error-shaped outcome keeps `serve_http`'s single return path.
        Err(HandlerOutcome::Inspect {
            key,
            executable: effective.executable,
            upstream_spec: effective.upstream_spec,
        })
    }
}

/// What the host should do in response to a non-proxied `serve_http` result.
#[derive(Debug)]
pub enum HandlerOutcome {
    InvalidConfig(String),
    DiscoveryFailed(String),
    BackendUnavailable(String),
    Proxy(anyhow::Error),
    Inspect {
        key: String,
        executable: Vec<String>,
        upstream_spec: String,
    },
}

impl From<LifecycleError> for HandlerOutcome {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidConfig(msg) => HandlerOutcome::InvalidConfig(msg),
            LifecycleError::DiscoveryFailed(msg) => HandlerOutcome::DiscoveryFailed(msg),
            LifecycleError::SpawnFailed { key, source } => {
                HandlerOutcome::BackendUnavailable(format!("failed to start backend '{key}': {source}"))
            }
            LifecycleError::ReadinessTimeout { key, timeout_ms } => {
                HandlerOutcome::BackendUnavailable(format!("backend '{key}' not ready after {timeout_ms}ms"))
            }
            LifecycleError::BackendDead { key } => {
                HandlerOutcome::BackendUnavailable(format!("backend '{key}' is dead"))
            }
            LifecycleError::Proxy(e) => HandlerOutcome::Proxy(e),
        }
    }
}

impl HandlerOutcome {
    /// HTTP status class the host should respond with.
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerOutcome::InvalidConfig(_) => 500,
            HandlerOutcome::DiscoveryFailed(_) => 502,
            HandlerOutcome::BackendUnavailable(msg) if msg.contains("not ready") => 504,
            HandlerOutcome::BackendUnavailable(_) => 502,
            HandlerOutcome::Proxy(_) => 502,
            HandlerOutcome::Inspect { .. } => 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct RecordingProxy {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReverseProxy for RecordingProxy {
        async fn forward(&self, _upstream: &DialTarget, _ctx: &RequestContext) -> Result<(), anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn static_expander() -> Arc<StaticPlaceholderExpander> {
        Arc::new(StaticPlaceholderExpander {
            values: HashMap::new(),
        })
    }

    async fn listening_target() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        (addr.to_string(), handle)
    }

    #[tokio::test]
    async fn serves_a_static_backend_request() {
        let (addr, _listener) = listening_target().await;
        let mut cfg = HandlerConfig::default();
        cfg.executable = vec!["sleep".to_string(), "5".to_string()];
        cfg.upstream_spec = addr;
        cfg.startup_timeout = Duration::from_secs(2);

        let lifecycle = LifecycleManager::new(CancellationToken::new());
        let proxy = Arc::new(RecordingProxy {
            calls: AtomicUsize::new(0),
        });
        let handler = Handler::new(cfg, lifecycle, static_expander(), Arc::clone(&proxy));

        let ctx = RequestContext {
            path: "/x".to_string(),
            method: "GET".to_string(),
            host: "h".to_string(),
        };
        handler.serve_http(&ctx).await.unwrap();
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_failure_surfaces_as_discovery_failed() {
        let mut cfg = HandlerConfig::default();
        cfg.discovery_cmd = Some(vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()]);
        cfg.discovery_timeout = Duration::from_secs(2);

        let lifecycle = LifecycleManager::new(CancellationToken::new());
        let proxy = Arc::new(RecordingProxy {
            calls: AtomicUsize::new(0),
        });
        let handler = Handler::new(cfg, lifecycle, static_expander(), proxy);

        let ctx = RequestContext::default();
        let outcome = handler.serve_http(&ctx).await.unwrap_err();
        assert!(matches!(outcome, HandlerOutcome::DiscoveryFailed(_)));
        assert_eq!(outcome.status_code(), 502);
    }

    #[tokio::test]
    async fn readiness_timeout_surfaces_as_504() {
        let mut cfg = HandlerConfig::default();
        cfg.executable = vec!["sleep".to_string(), "5".to_string()];
        cfg.upstream_spec = "127.0.0.1:1".to_string();
        cfg.startup_timeout = Duration::from_millis(200);

        let lifecycle = LifecycleManager::new(CancellationToken::new());
        let proxy = Arc::new(RecordingProxy {
            calls: AtomicUsize::new(0),
        });
        let handler = Handler::new(cfg, lifecycle, static_expander(), proxy);

        let ctx = RequestContext::default();
        let outcome = handler.serve_http(&ctx).await.unwrap_err();
        assert!(matches!(outcome, HandlerOutcome::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn inspect_never_starts_a_backend() {
        let mut cfg = HandlerConfig::default();
        cfg.executable = vec!["sleep".to_string(), "5".to_string()];
        cfg.upstream_spec = "127.0.0.1:1".to_string();
        cfg.inspect = true;

        let lifecycle = LifecycleManager::new(CancellationToken::new());
        let proxy = Arc::new(RecordingProxy {
            calls: AtomicUsize::new(0),
        });
        let handler = Handler::new(cfg, lifecycle.clone(), static_expander(), proxy);

        let ctx = RequestContext::default();
        let outcome = handler.serve_http(&ctx).await.unwrap_err();
        assert!(matches!(outcome, HandlerOutcome::Inspect { .. }));
        assert_eq!(lifecycle.registry().len(), 0);
    }
}
