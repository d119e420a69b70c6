use std::io;
use std::net::SocketAddr;
use std::path::Path;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Router serving files under `root`; `/` maps to `index.html`.
pub fn router(root: impl AsRef<Path>) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(root.as_ref()))
        .layer(TraceLayer::new_for_http())
}

/// A static file server on a background task.
///
/// Dropping the handle also shuts the server down, without waiting for it.
pub struct StaticFileServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

impl StaticFileServer {
    /// Bind `addr` (port 0 picks a free port) and start serving `root`.
    pub async fn start(root: impl AsRef<Path>, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let app = router(root.as_ref());
        let (shutdown, signal) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await
        });
        info!(%addr, root = %root.as_ref().display(), "file server listening");
        Ok(Self { addr, shutdown, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn stop(self) -> io::Result<()> {
        let Self { addr, shutdown, task } = self;
        let _ = shutdown.send(());
        let served = task.await.map_err(|e| {
            warn!(%addr, error = %e, "file server task failed");
            io::Error::other(e)
        })?;
        info!(%addr, "file server stopped");
        served
    }
}
