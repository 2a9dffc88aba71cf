use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use plugbus_engine::{Broker, BrokerStats, Outbound};
use plugbus_store::PluginStore;

use crate::client::{self, ConnectionRegistry, Inbound};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    /// HTTP health endpoint; disabled when `None`.
    pub health_port: Option<u16>,
    pub max_connections: usize,
    pub max_send_queue: usize,
    pub max_frame_size: usize,
    /// Deadline for forwarded calls; calls wait indefinitely when `None`.
    pub call_timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7475,
            health_port: Some(7476),
            max_connections: 1024,
            max_send_queue: 256,
            max_frame_size: 4 * 1024 * 1024,
            call_timeout: None,
            sweep_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle returned by [`start`]; keeps the background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub health_addr: Option<SocketAddr>,
    stats: watch::Receiver<BrokerStats>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Latest broker counters, refreshed after every dispatched event.
    pub fn stats(&self) -> BrokerStats {
        *self.stats.borrow()
    }

    /// Stop accepting, close every connection and wait for tasks to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("server stopped");
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Bind the listeners and spawn the accept loop, the dispatcher and the
/// health endpoint.
pub async fn start(config: ServerConfig, store: Arc<dyn PluginStore>) -> Result<ServerHandle, ServerError> {
    let listener = bind(&config.host, config.port).await?;
    let addr = listener.local_addr()?;

    let cancel = CancellationToken::new();
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(1024);
    let (stats_tx, stats_rx) = watch::channel(BrokerStats::default());

    let broker = Broker::new(store).with_call_timeout(config.call_timeout);
    let mut tasks = vec![
        tokio::spawn(run_dispatcher(
            broker,
            inbound_rx,
            Arc::clone(&registry),
            stats_tx,
            config.sweep_interval,
            cancel.clone(),
        )),
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            inbound_tx,
            config.clone(),
            cancel.clone(),
        )),
    ];

    let health_addr = match config.health_port {
        Some(port) => {
            let health_listener = bind(&config.host, port).await?;
            let health_addr = health_listener.local_addr()?;
            let router = build_router(HealthState {
                started: Instant::now(),
                stats: stats_rx.clone(),
            });
            let shutdown = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let served = axum::serve(health_listener, router)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = served {
                    warn!(error = %e, "health endpoint failed");
                }
            }));
            Some(health_addr)
        }
        None => None,
    };

    info!(%addr, health = ?health_addr, "plugbus broker listening");

    Ok(ServerHandle {
        addr,
        health_addr,
        stats: stats_rx,
        cancel,
        tasks,
    })
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    inbound: mpsc::Sender<Inbound>,
    config: ServerConfig,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        if registry.count() >= config.max_connections {
            warn!(%peer, limit = config.max_connections, "connection limit reached, refusing");
            drop(stream);
            continue;
        }
        let _ = stream.set_nodelay(true);

        let (conn_id, rx, conn_cancel) = registry.register(&cancel);
        debug!(conn_id = %conn_id, %peer, "accepted");
        // Opened must reach the dispatcher before any frame from this socket.
        if inbound.send(Inbound::Opened(conn_id.clone())).await.is_err() {
            break;
        }
        tokio::spawn(client::handle_connection(
            stream,
            conn_id,
            rx,
            conn_cancel,
            Arc::clone(&registry),
            inbound.clone(),
            config.max_frame_size,
        ));
    }
}

/// The single owner of broker state. Every inbound event is handled to
/// completion before the next one is read.
async fn run_dispatcher(
    mut broker: Broker,
    mut inbound: mpsc::Receiver<Inbound>,
    registry: Arc<ConnectionRegistry>,
    stats: watch::Sender<BrokerStats>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outbound = tokio::select! {
            _ = cancel.cancelled() => break,
            event = inbound.recv() => match event {
                Some(Inbound::Opened(conn)) => {
                    broker.on_connection_opened(conn);
                    Vec::new()
                }
                Some(Inbound::Frame(conn, message)) => {
                    broker.dispatch(&conn, message, Instant::now().into_std())
                }
                Some(Inbound::Closed(conn)) => broker.on_connection_closed(&conn),
                None => break,
            },
            _ = sweep.tick() => broker.expire(Instant::now().into_std()),
        };

        deliver(&registry, outbound);
        stats.send_if_modified(|current| {
            let next = broker.stats();
            let changed = *current != next;
            *current = next;
            changed
        });
    }
    debug!("dispatcher stopped");
}

fn deliver(registry: &ConnectionRegistry, outbound: Vec<Outbound>) {
    for item in outbound {
        match item {
            Outbound::Send { target, message } => {
                registry.send_to(&target, message);
            }
            Outbound::Close { target } => registry.close(&target),
        }
    }
}

#[derive(Clone)]
struct HealthState {
    started: Instant,
    stats: watch::Receiver<BrokerStats>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_secs: u64,
    #[serde(flatten)]
    stats: BrokerStats,
}

fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let stats = *state.stats.borrow();
    Json(HealthBody {
        status: "ok",
        uptime_secs: state.started.elapsed().as_secs(),
        stats,
    })
}
