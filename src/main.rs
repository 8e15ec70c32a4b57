mod annotations;
mod config;
mod engine;
mod handlers;
mod health;
mod metrics;
mod patch;
mod pod_spec;
mod resource;
mod sidecar;
mod tls;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(
    name = "sqlbee",
    about = "Kubernetes admission webhook injecting a Cloud SQL proxy sidecar"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/sqlbee/config.yaml", env = "SQLBEE_CONFIG")]
    config: String,
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

#[derive(Clone, Copy)]
struct ConnectionTimeouts {
    handshake: Duration,
    idle: Duration,
}

async fn run_https_server(
    addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    router: Router,
    ready: Arc<AtomicBool>,
    timeouts: ConnectionTimeouts,
    grace: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind HTTPS on {addr}: {e}"));

    info!(%addr, "HTTPS webhook server listening");
    ready.store(true, Ordering::Relaxed);

    let mut connections = JoinSet::new();

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            _ = shutdown_rx.changed() => {
                info!("HTTPS server shutting down");
                break;
            }
        };

        connections.spawn(serve_connection(
            tcp_stream,
            remote_addr,
            tls_acceptor.clone(),
            router.clone(),
            timeouts,
            shutdown_rx.clone(),
        ));
    }

    drop(listener);
    let in_flight = connections.len();
    info!(in_flight, grace_secs = grace.as_secs(), "draining HTTPS connections");
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "grace period elapsed, aborting open HTTPS connections"
        );
        connections.abort_all();
    }
}

/// Serves one TLS connection. Once shutdown is signalled the connection
/// finishes its in-flight request and closes instead of staying alive.
async fn serve_connection(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    router: Router,
    timeouts: ConnectionTimeouts,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let tls_stream =
        match tokio::time::timeout(timeouts.handshake, tls_acceptor.accept(tcp_stream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(%remote_addr, "TLS handshake failed: {e}");
                return;
            }
            Err(_) => {
                warn!(%remote_addr, "TLS handshake timed out");
                return;
            }
        };

    let io = TokioIo::new(tls_stream);
    let service = TowerToHyperService::new(router.into_service());

    let mut builder = HttpBuilder::new(TokioExecutor::new()).http1_only();
    // hyper arms the header timer whenever the connection waits for a
    // request, so this bounds keep-alive idle time as well.
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.idle);
    let connection = builder.serve_connection(io, service);
    tokio::pin!(connection);

    let mut closing = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                match result {
                    Ok(()) => {}
                    Err(e) if is_timeout(&*e) => {
                        debug!(%remote_addr, "closing idle connection");
                    }
                    Err(e) => error!(%remote_addr, "error serving connection: {e}"),
                }
                return;
            }
            _ = shutdown_rx.changed(), if !closing => {
                closing = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

fn is_timeout(e: &(dyn std::error::Error + 'static)) -> bool {
    e.downcast_ref::<hyper::Error>()
        .is_some_and(hyper::Error::is_timeout)
}

async fn run_http_server(
    addr: SocketAddr,
    router: Router,
    grace: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind HTTP on {addr}: {e}"));

    info!(%addr, "HTTP health server listening");

    let mut stopping = shutdown_rx.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .into_future();

    // The grace period only starts once shutdown has been requested.
    let grace_elapsed = async move {
        let _ = stopping.changed().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {e}");
            }
        }
        _ = grace_elapsed => warn!("grace period elapsed, stopping HTTP server"),
    }
}

fn parse_addr(name: &str, value: &str) -> SocketAddr {
    value.parse().unwrap_or_else(|e| {
        eprintln!("Invalid {name} '{value}': {e}");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let cli = Cli::parse();

    let config = config::SqlbeeConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {}: {e}", cli.config);
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %config.listen_addr,
        health_addr = %config.health_addr,
        log_level = %config.log_level,
        mutation.default_instance = %config.mutation.default_instance,
        mutation.default_secret_name = %config.mutation.default_secret_name,
        mutation.default_ca_config_map = %config.mutation.default_ca_config_map,
        mutation.require_annotation = config.mutation.require_annotation,
        mutation.default_image = %config.mutation.default_image,
        "sqlbee starting"
    );

    let certified_key = tls::load_certified_key(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| {
            error!(
                cert_path = %config.tls_cert_path,
                key_path = %config.tls_key_path,
                "failed to load TLS key pair: {e}"
            );
            std::process::exit(1);
        });
    let cert_store = Arc::new(tls::CertStore::new(certified_key));
    let tls_acceptor = TlsAcceptor::from(tls::server_config(cert_store.clone()));

    let mut registry = Registry::default();
    let sqlbee_metrics = metrics::SqlbeeMetrics::new(&mut registry);
    let certificate_reloads = metrics::certificate_reloads(&mut registry);
    let registry = Arc::new(registry);

    let injector = Arc::new(engine::SidecarInjector::new(config.mutation.clone()));

    let app_state = Arc::new(handlers::AppState {
        mutator: Some(injector.clone()),
        needs_mutation: Some(injector),
        admitter: None,
        metrics: sqlbee_metrics,
        read_timeout: config.read_timeout(),
    });
    let webhook_router = handlers::webhook_router(app_state);

    let ready = Arc::new(AtomicBool::new(false));
    let health_router = health::health_router(Arc::new(health::HealthState {
        registry,
        ready: ready.clone(),
    }));

    let listen_addr = parse_addr("listen_addr", &config.listen_addr);
    let health_addr = parse_addr("health_addr", &config.health_addr);
    let grace = config.shutdown_grace();
    let timeouts = ConnectionTimeouts {
        handshake: config.read_timeout(),
        idle: config.idle_timeout(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let https_shutdown_rx = shutdown_rx.clone();
    let http_shutdown_rx = shutdown_rx;

    tokio::spawn(shutdown_signal(shutdown_tx));

    let cert_watcher = tokio::spawn(tls::watch_certificate(
        cert_store,
        config.tls_cert_path.clone(),
        config.tls_key_path.clone(),
        certificate_reloads,
    ));

    let servers = async {
        tokio::join!(
            run_https_server(
                listen_addr,
                tls_acceptor,
                webhook_router,
                ready,
                timeouts,
                grace,
                https_shutdown_rx,
            ),
            run_http_server(health_addr, health_router, grace, http_shutdown_rx),
        )
    };

    tokio::select! {
        _ = servers => {}
        result = cert_watcher => {
            match result {
                Ok(e) => error!(
                    error = %e,
                    "certificate reload failed, refusing to serve with a stale identity"
                ),
                Err(e) => error!("certificate watcher task failed: {e}"),
            }
            std::process::exit(1);
        }
    }

    info!("sqlbee shut down gracefully");
}

#[cfg(test)]
mod tests {
    use rustls::pki_types::ServerName;
    use tokio::task::JoinHandle;
    use tokio_rustls::client::TlsStream;

    use super::*;
    use crate::tls::fixtures;

    const SHORT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_stalled_handshake_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, remote_addr) = listener.accept().await.unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let timeouts = ConnectionTimeouts {
            handshake: SHORT,
            idle: Duration::from_secs(60),
        };

        let served = tokio::time::timeout(
            Duration::from_secs(5),
            serve_connection(
                stream,
                remote_addr,
                fixtures::acceptor("stalled-handshake"),
                Router::new(),
                timeouts,
                shutdown_rx,
            ),
        )
        .await;
        assert!(served.is_ok(), "connection outlived the handshake timeout");
    }

    async fn idle_tls_connection(
        name: &str,
        timeouts: ConnectionTimeouts,
        shutdown_rx: watch::Receiver<()>,
    ) -> (JoinHandle<()>, TlsStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = fixtures::acceptor(name);
        let server = tokio::spawn(async move {
            let (stream, remote_addr) = listener.accept().await.unwrap();
            serve_connection(stream, remote_addr, acceptor, Router::new(), timeouts, shutdown_rx)
                .await;
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let client = fixtures::connector()
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let timeouts = ConnectionTimeouts {
            handshake: Duration::from_secs(5),
            idle: SHORT,
        };

        let (server, _client) = idle_tls_connection("idle-timeout", timeouts, shutdown_rx).await;

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("idle connection was kept open")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connection() {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let timeouts = ConnectionTimeouts {
            handshake: Duration::from_secs(5),
            idle: Duration::from_secs(60),
        };

        let (server, _client) = idle_tls_connection("shutdown", timeouts, shutdown_rx).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("connection ignored shutdown")
            .unwrap();
    }
}
