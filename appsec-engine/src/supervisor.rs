use crate::auth::{AuthProbe, Authenticator};
use crate::config::EngineConfig;
use crate::engine::{Phase, RuleEngineHandle, RuleSet};
use crate::ingress::{build_router, IngressState};
use crate::metrics::EngineMetrics;
use crate::request::ParsedRequest;
use crate::runner::Runner;
use anyhow::Context;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use common_events::EventSink;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// How long in-flight requests get to finish once shutdown starts before
/// their connections are force-closed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the engine lifecycle: freezes the rule set, spawns the runner pool,
/// opens the listeners and coordinates graceful shutdown.
pub struct Supervisor {
    config: EngineConfig,
    rule_set: RuleSet,
    events: EventSink,
    ready: Option<oneshot::Sender<SocketAddr>>,
}

impl Supervisor {
    pub fn new(config: EngineConfig, rule_set: RuleSet, events: EventSink) -> Self {
        Self {
            config,
            rule_set,
            events,
            ready: None,
        }
    }

    /// Registers interest in the bound TCP address, reported once the
    /// listener is accepting. Dropped without a value when no TCP listener
    /// is configured.
    pub fn ready_signal(&mut self) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.ready = Some(tx);
        rx
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Self {
            config,
            rule_set,
            events,
            ready,
        } = self;
        let engine = config.name.clone();

        // OnLoad hooks run exactly once; the rule set is immutable afterwards.
        let rule_set = Arc::new(rule_set.finalize());
        info!(
            engine = %engine,
            inband_rules = rule_set.rule_count(Phase::InBand),
            outofband_rules = rule_set.rule_count(Phase::OutOfBand),
            "rule set loaded"
        );

        let metrics = Arc::new(EngineMetrics::new()?);

        // Capacity 1 is the smallest bound the runtime offers; with every
        // runner busy the send parks the handler, which is the intended
        // backpressure towards the HTTP layer.
        let (job_tx, job_rx) = async_channel::bounded::<ParsedRequest>(1);

        // Graceful shutdown never cancels a runner mid-request; this token
        // only lets rule primitives observe a hard abort.
        let primitive_cancel = CancellationToken::new();

        let mut runners = Vec::with_capacity(config.routines);
        for id in 0..config.routines {
            let runner = Runner::new(
                id,
                job_rx.clone(),
                RuleEngineHandle::new(rule_set.clone(), primitive_cancel.child_token()),
                metrics.clone(),
                events.clone(),
                config.labels.clone(),
            );
            runners.push(tokio::spawn(runner.run()));
        }
        drop(job_rx);

        let auth = Arc::new(Authenticator::new(
            AuthProbe::new(&config.lapi_url)?,
            config.auth_cache_duration,
        ));
        let state = IngressState {
            engine: engine.clone(),
            auth,
            jobs: job_tx.clone(),
            metrics: metrics.clone(),
            max_body_size: config.max_body_size,
        };
        let app = build_router(state, &config.path);

        let tls = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => Some(
                RustlsConfig::from_pem_file(cert, key)
                    .await
                    .context("failed to load TLS certificate")?,
            ),
            _ => None,
        };

        let drain = CancellationToken::new();
        let mut listeners = JoinSet::new();

        let tcp_handle = axum_server::Handle::new();
        if let Some(addr) = config.tcp_addr() {
            info!(%addr, tls = tls.is_some(), "tcp listener starting");
            let app = app.clone();
            let handle = tcp_handle.clone();
            let tls = tls.clone();
            listeners.spawn(async move {
                let service = app.into_make_service_with_connect_info::<SocketAddr>();
                let served = match tls {
                    Some(tls) => {
                        axum_server::bind_rustls(addr, tls)
                            .handle(handle)
                            .serve(service)
                            .await
                    }
                    None => axum_server::bind(addr).handle(handle).serve(service).await,
                };
                served.map_err(|err| anyhow::anyhow!("tcp listener failed: {err}"))
            });
            if let Some(tx) = ready {
                let handle = tcp_handle.clone();
                tokio::spawn(async move {
                    if let Some(addr) = handle.listening().await {
                        let _ = tx.send(addr);
                    }
                });
            }
        }

        if let Some(path) = config.listen_socket.clone() {
            if path.exists() {
                std::fs::remove_file(&path).with_context(|| {
                    format!("failed to remove stale socket {}", path.display())
                })?;
            }
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind socket {}", path.display()))?;
            let acceptor = match (&config.cert_file, &config.key_file) {
                (Some(cert), Some(key)) => Some(tls_acceptor(cert, key)?),
                _ => None,
            };
            info!(socket = %path.display(), tls = acceptor.is_some(), "socket listener starting");
            listeners.spawn(serve_unix(
                listener,
                app.clone(),
                acceptor,
                drain.child_token(),
            ));
        }

        if listeners.is_empty() {
            anyhow::bail!("no listener configured");
        }

        // Serve until shutdown is requested or every listener has died.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                joined = listeners.join_next() => match joined {
                    Some(result) => {
                        match result {
                            Ok(Ok(())) => info!("listener stopped"),
                            Ok(Err(err)) => error!(%err, "listener failed"),
                            Err(err) => error!(%err, "listener task aborted"),
                        }
                        if listeners.is_empty() {
                            error!("all listeners stopped, shutting down");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        info!("draining in-flight requests");
        tcp_handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
        drain.cancel();
        while let Some(result) = listeners.join_next().await {
            if let Ok(Err(err)) = result {
                error!(%err, "listener failed during drain");
            }
        }

        // No handler can enqueue anymore: close the queue so the runners
        // drain what is left and exit. A late sender gets an error and the
        // caller a 503.
        job_tx.close();
        for runner in runners {
            if let Err(err) = runner.await {
                error!(%err, "runner task aborted");
            }
        }

        if let Some(path) = &config.listen_socket {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(%err, socket = %path.display(), "failed to remove socket file");
            }
        }

        info!(engine = %engine, "appsec engine stopped");
        Ok(())
    }
}

fn tls_acceptor(cert: &Path, key: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert).with_context(|| format!("opening {}", cert.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("failed to parse certificate file")?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key).with_context(|| format!("opening {}", key.display()))?,
    ))
    .context("failed to parse key file")?
    .context("no private key found")?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate or key")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept loop for the filesystem socket. Shares the routing mux with the
/// TCP listener; on shutdown it stops accepting and waits for in-flight
/// connections to finish.
async fn serve_unix(
    listener: UnixListener,
    app: Router,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let connections = TaskTracker::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "socket accept failed");
                        continue;
                    }
                };
                let app = app.clone();
                let tls = tls.clone();
                let token = shutdown.clone();
                connections.spawn(async move {
                    serve_unix_connection(stream, app, tls, token).await;
                });
            }
            _ = shutdown.cancelled() => break,
        }
    }
    connections.close();
    connections.wait().await;
    Ok(())
}

async fn serve_unix_connection(
    stream: UnixStream,
    app: Router,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) {
    let service = TowerToHyperService::new(app);
    let result = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => serve_connection(TokioIo::new(stream), service, shutdown).await,
            Err(err) => {
                warn!(%err, "tls handshake failed on socket listener");
                return;
            }
        },
        None => serve_connection(TokioIo::new(stream), service, shutdown).await,
    };
    if let Err(err) = result {
        warn!(err = %err, "error serving socket connection");
    }
}

async fn serve_connection<I>(
    io: I,
    service: TowerToHyperService<Router>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}
