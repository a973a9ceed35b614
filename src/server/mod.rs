//! Async TCP accept loop using Tokio.
//!
//! Accepts client connections and hands each one to the [`Proxy`] on its own
//! task. The loop never waits for a handler; it stops when the [`Shutdown`]
//! flag is set or the listener fails, and drops the listener on the way out.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::proxy::Proxy;
use crate::shutdown::Shutdown;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// The proxy's listening socket.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use cacheproxy::cache::CacheStore;
/// use cacheproxy::proxy::{Backend, Proxy};
/// use cacheproxy::server::Server;
/// use cacheproxy::shutdown::Shutdown;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let cache = Arc::new(CacheStore::new(Duration::from_secs(60)));
///     let proxy = Proxy::new(cache, Backend::new("127.0.0.1:80", None));
///     let server = Server::bind("0.0.0.0:8000").await?;
///     server.run(Arc::new(proxy), Shutdown::new()).await;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    limiter: Option<Arc<Semaphore>>,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            limiter: None,
        })
    }

    /// Caps the number of connections handled at once.
    ///
    /// Once `max` handlers are running the loop stops accepting until one
    /// finishes. Without a limit every connection gets its own task immediately.
    /// `max` is capped at [`Semaphore::MAX_PERMITS`].
    #[must_use]
    pub fn with_connection_limit(mut self, max: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(max.min(Semaphore::MAX_PERMITS))));
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and dispatches them to `proxy` until shutdown.
    ///
    /// The flag is checked before every accept, and a pending accept is
    /// abandoned as soon as it is set. An accept error also ends the loop.
    /// In-flight handlers are left running.
    pub async fn run(self, proxy: Arc<Proxy>, shutdown: Shutdown) {
        info!(address = %self.local_addr, "proxy listening");

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    _ = shutdown.triggered() => break,
                    permit = Arc::clone(limiter).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.triggered() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        break;
                    }
                },
            };

            info!(peer = %peer_addr, "connection accepted");
            let proxy = Arc::clone(&proxy);

            tokio::spawn(async move {
                let _permit = permit;
                proxy.handle(stream, peer_addr).await;
                debug!(peer = %peer_addr, "connection closed");
            });
        }

        drop(self.listener);
        info!("proxy stopped");
    }
}
