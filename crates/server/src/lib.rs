// Hello World responder
// Decision: One route, no state; unmatched paths get axum's default 404
// Decision: Multi-worker mode runs one current-thread runtime per thread on a SO_REUSEPORT socket

use std::net::{SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Body returned by `GET /`
pub const GREETING: &str = "Hello World!";

/// Default listen address
pub const DEFAULT_BIND: &str = "0.0.0.0:3000";

/// Pending connections queued per listener in multi-worker mode
#[cfg(unix)]
const LISTEN_BACKLOG: u32 = 1024;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start worker: {0}")]
    Worker(#[source] std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Serialize)]
struct HelloResponse {
    message: &'static str,
}

async fn hello_world() -> Json<HelloResponse> {
    Json(HelloResponse { message: GREETING })
}

/// Build the router (extracted for testing)
pub fn router() -> Router {
    Router::new()
        .route("/", get(hello_world))
        .layer(TraceLayer::new_for_http())
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `0.0.0.0:3000`
    pub bind: String,
    /// Number of worker threads, each with its own runtime and listener
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            workers: default_workers(),
        }
    }
}

/// One worker per available CPU
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ServerConfig {
    /// Resolve the bind address
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        self.bind
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ServerError::InvalidAddress(self.bind.clone()))
    }
}

/// Serve on an already bound listener until `shutdown` is cancelled
pub async fn serve_on(listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError> {
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Serve)
}

/// Bind `config.bind` and serve on the current runtime
pub async fn serve(config: &ServerConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!("Server running on http://{}", addr);
    serve_on(listener, shutdown).await
}

/// Run `config.workers` threads, each with a current-thread runtime and
/// its own `SO_REUSEPORT` listener. Blocks until every worker exits; a
/// worker that fails stops the others.
#[cfg(unix)]
pub fn serve_workers(config: &ServerConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    let addr = config.socket_addr()?;
    info!(
        workers = config.workers.max(1),
        "Server running on http://{} (reuseport mode)", addr
    );
    let bind: Binder = Arc::new(|_: usize, addr: SocketAddr| reuseport_listener(addr));
    run_workers(config.workers, addr, shutdown, bind)
}

/// Binds the listener of a worker, given its index
#[cfg(unix)]
type Binder = Arc<dyn Fn(usize, SocketAddr) -> std::io::Result<TcpListener> + Send + Sync>;

#[cfg(unix)]
fn run_workers(
    workers: usize,
    addr: SocketAddr,
    shutdown: CancellationToken,
    bind: Binder,
) -> Result<(), ServerError> {
    let workers = workers.max(1);
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let worker_shutdown = shutdown.clone();
        let bind = bind.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("hello-worker-{}", worker))
            .spawn(move || {
                let result = run_worker(worker, addr, worker_shutdown.clone(), bind);
                if let Err(e) = &result {
                    tracing::error!(worker, error = %e, "Worker failed, stopping server");
                    worker_shutdown.cancel();
                }
                result
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                shutdown.cancel();
                join_workers(handles, &shutdown)?;
                return Err(ServerError::Worker(e));
            }
        }
    }
    join_workers(handles, &shutdown)
}

#[cfg(unix)]
fn run_worker(
    worker: usize,
    addr: SocketAddr,
    shutdown: CancellationToken,
    bind: Binder,
) -> Result<(), ServerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ServerError::Worker)?;
    runtime.block_on(async move {
        let listener = bind(worker, addr).map_err(|source| ServerError::Bind { addr, source })?;
        tracing::debug!(worker, "Worker listening");
        serve_on(listener, shutdown).await
    })
}

#[cfg(unix)]
fn join_workers(
    handles: Vec<std::thread::JoinHandle<Result<(), ServerError>>>,
    shutdown: &CancellationToken,
) -> Result<(), ServerError> {
    let mut first_error = None;
    for handle in handles {
        let result = handle.join().map_err(|_| ServerError::WorkerPanicked);
        if let Err(e) | Ok(Err(e)) = result {
            shutdown.cancel();
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Without `SO_REUSEPORT`, fall back to one multi-threaded runtime
#[cfg(not(unix))]
pub fn serve_workers(config: &ServerConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers.max(1))
        .enable_all()
        .build()
        .map_err(ServerError::Worker)?;
    runtime.block_on(serve(config, shutdown))
}

#[cfg(unix)]
fn reuseport_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}
