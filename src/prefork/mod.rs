//! Prefork process groups.
//!
//! One launched program re-executes itself N times. Every copy binds the same
//! address with `SO_REUSEPORT`, so the kernel balances connections across
//! processes instead of an in-process scheduler.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Coordinator   │  spawns, waits for first exit,
//!                     │ (original exec) │  kills the rest
//!                     └────────┬────────┘
//!                              │ PREFORK_WORKER=1
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ :8080     │  │ :8080     │  │ :8080     │
//!         └───────────┘  └───────────┘  └───────────┘
//!                  SO_REUSEPORT, kernel load-balanced
//! ```
//!
//! # Example
//!
//! ```no_run
//! use axum::{Router, routing::get};
//! use prefork::Prefork;
//!
//! fn main() -> prefork::Result<()> {
//!     let app = Router::new().route("/", get(|| async { "hello" }));
//!     Prefork::new(app).run("0.0.0.0:8080")
//! }
//! ```

pub mod listener;
pub mod role;
pub mod signals;
pub mod supervisor;
pub mod watch;

use std::future::Future;
use std::sync::Arc;

use rustls::ServerConfig;
use tracing::info;

use crate::error::{PreforkError, Result};

pub use listener::{Connection, Listener, bind};
pub use role::{ProcessRole, WORKER_ENV_KEY, WORKER_ENV_VALUE, is_worker};
pub use supervisor::{LaunchConfig, default_parallelism, launch};

/// Something that takes over a bound listener and serves on it until done.
pub trait Service: Send + 'static {
    fn serve(self, listener: Listener) -> impl Future<Output = Result<()>> + Send;
}

impl Service for axum::Router {
    async fn serve(self, listener: Listener) -> Result<()> {
        axum::serve(listener, self)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(PreforkError::Serve)
    }
}

/// Adapts an async closure into a [`Service`].
pub struct ServeFn<F>(pub F);

impl<F, Fut> Service for ServeFn<F>
where
    F: FnOnce(Listener) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    fn serve(self, listener: Listener) -> impl Future<Output = Result<()>> + Send {
        (self.0)(listener)
    }
}

/// Group settings.
#[derive(Debug, Clone, Default)]
pub struct PreforkConfig {
    /// Worker count; `None` means one per available CPU.
    pub workers: Option<usize>,
}

/// Entry point for a prefork server.
///
/// The same call runs in every process: the coordinator launches workers,
/// workers bind and serve.
pub struct Prefork<S> {
    service: S,
    config: PreforkConfig,
}

impl<S: Service> Prefork<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            config: PreforkConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PreforkConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the number of worker processes.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = Some(workers);
        self
    }

    /// Serve plaintext on `addr`. Blocks for the life of the process group.
    pub fn run(self, addr: &str) -> Result<()> {
        self.start(addr, None)
    }

    /// Serve TLS on `addr`. Blocks for the life of the process group.
    pub fn run_tls(self, addr: &str, tls: Arc<ServerConfig>) -> Result<()> {
        self.start(addr, Some(tls))
    }

    fn start(self, addr: &str, tls: Option<Arc<ServerConfig>>) -> Result<()> {
        // A single-threaded runtime per process: parallelism comes from the
        // process count, not from threads.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        match ProcessRole::detect() {
            ProcessRole::Worker => runtime.block_on(serve_worker(self.service, addr, tls)),
            ProcessRole::Coordinator => {
                let workers = self.config.workers.unwrap_or_else(default_parallelism);
                let config = LaunchConfig::current(workers)?;
                info!(workers, addr, "Starting prefork group");
                runtime.block_on(launch(&config))
            }
        }
    }
}

/// Worker path: bind the shared address, watch the coordinator, then serve.
pub async fn serve_worker<S: Service>(
    service: S,
    addr: &str,
    tls: Option<Arc<ServerConfig>>,
) -> Result<()> {
    let listener = bind(addr, tls).await?;
    info!(
        pid = std::process::id(),
        addr = %listener.local_addr(),
        tls = listener.is_tls(),
        "Worker listening"
    );

    tokio::spawn(watch::watch_parent());

    service.serve(listener).await
}

/// Resolves on SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
