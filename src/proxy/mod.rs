//! Per-connection proxying logic.
//!
//! A connection carries exactly one request. Its first line, trimmed and
//! lowercased, is the cache key. A fresh hit is answered from the
//! [`CacheStore`]; anything else is forwarded byte-for-byte to the backend, the
//! full response is drained until the backend closes, stored, and relayed.
//!
//! Failures are logged and end the connection; they never reach the accept
//! loop, and nothing is inserted unless the backend response was complete.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::str::{self, Utf8Error};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, Lookup};

/// Largest request accepted from a client, read in a single call.
pub const MAX_REQUEST_SIZE: usize = 4096;

/// Capacity reserved before each backend read.
const READ_CHUNK: usize = 4096;

/// Errors that end a single proxied connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("request line is not valid UTF-8: {0}")]
    InvalidRequestLine(#[from] Utf8Error),

    #[error("failed to connect to backend {addr}: {source}")]
    BackendConnect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("backend {addr} timed out while {stage}")]
    BackendTimeout { addr: String, stage: &'static str },

    #[error("client sent no request within {0:?}")]
    ClientTimeout(Duration),
}

/// How a connection was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// The client sent nothing; the connection was closed.
    Empty,
    /// The response came from the cache.
    Hit,
    /// The response came from the backend. `expired` is set when a stale entry was evicted first.
    Miss { expired: bool },
}

/// Returns the first line of `request`, without its line terminator.
///
/// # Errors
///
/// Returns the UTF-8 error if the line is not valid text.
pub fn request_line(request: &[u8]) -> Result<&str, Utf8Error> {
    let end = request
        .iter()
        .position(|&b| b == b'\n' || b == b'\r')
        .unwrap_or(request.len());
    str::from_utf8(&request[..end])
}

/// Normalizes a request line into its cache key.
///
/// Method, target and version stay one opaque string, so lines that only
/// differ in letter case share an entry.
///
/// ```
/// use cacheproxy::proxy::cache_key;
///
/// assert_eq!(cache_key("  GET /Index.html HTTP/1.1 "), "get /index.html http/1.1");
/// ```
pub fn cache_key(request_line: &str) -> String {
    request_line.trim().to_lowercase()
}

/// The single upstream server every cache miss is forwarded to.
#[derive(Debug, Clone)]
pub struct Backend {
    addr: String,
    timeout: Option<Duration>,
}

impl Backend {
    /// Creates a backend at `addr` (`host:port`). `timeout` bounds the connect,
    /// the write and each individual read; `None` waits indefinitely.
    pub fn new(addr: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Returns the backend address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends `request` verbatim and returns everything the backend writes before closing.
    pub async fn fetch(&self, request: &[u8]) -> Result<Bytes, ProxyError> {
        let connect = TcpStream::connect(self.addr.as_str());
        let mut stream = match self.bounded("connecting", connect).await {
            Ok(stream) => stream,
            Err(ProxyError::Io(source)) => {
                return Err(ProxyError::BackendConnect {
                    addr: self.addr.clone(),
                    source,
                });
            }
            Err(e) => return Err(e),
        };

        self.bounded("writing", stream.write_all(request)).await?;

        let mut response = BytesMut::with_capacity(READ_CHUNK);
        loop {
            response.reserve(READ_CHUNK);
            let n = self.bounded("reading", stream.read_buf(&mut response)).await?;
            if n == 0 {
                break;
            }
        }
        drop(stream);

        Ok(response.freeze())
    }

    async fn bounded<T, F>(&self, stage: &'static str, op: F) -> Result<T, ProxyError>
    where
        F: Future<Output = io::Result<T>>,
    {
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| ProxyError::BackendTimeout {
                    addr: self.addr.clone(),
                    stage,
                })?,
            None => op.await,
        };
        Ok(result?)
    }
}

/// Serves client connections from the cache or the backend.
#[derive(Debug)]
pub struct Proxy {
    cache: Arc<CacheStore>,
    backend: Backend,
    client_timeout: Option<Duration>,
}

impl Proxy {
    /// Creates a proxy that waits indefinitely for clients to send their request.
    pub fn new(cache: Arc<CacheStore>, backend: Backend) -> Self {
        Self {
            cache,
            backend,
            client_timeout: None,
        }
    }

    /// Bounds the wait for a client's request; `None` waits indefinitely.
    ///
    /// An idle client otherwise holds its task, and its connection permit, forever.
    #[must_use]
    pub fn with_client_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Handles one accepted connection to completion.
    ///
    /// Errors are logged here and go no further. The client is closed when it
    /// is dropped at the end of this call, whatever the outcome.
    pub async fn handle<S>(&self, mut client: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.serve(&mut client).await {
            Ok(Served::Empty) => debug!(peer = %peer, "empty request, closing"),
            Ok(served) => debug!(peer = %peer, ?served, "connection served"),
            Err(e) => warn!(peer = %peer, error = %e, "client error"),
        }
    }

    /// Reads one request from `client` and writes the response back.
    ///
    /// # Errors
    ///
    /// Returns the first I/O, decoding or backend failure. The cache is only
    /// written after the backend response has been fully received.
    pub async fn serve<S>(&self, client: &mut S) -> Result<Served, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; MAX_REQUEST_SIZE];
        let read = client.read(&mut buf);
        let n = match self.client_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ProxyError::ClientTimeout(limit))??,
            None => read.await?,
        };
        if n == 0 {
            return Ok(Served::Empty);
        }
        let request = &buf[..n];

        let line = request_line(request)?;
        let key = cache_key(line);

        let expired = match self.cache.lookup(&key) {
            Lookup::Fresh(entry) => {
                info!(request = %line, "cache hit");
                client.write_all(entry.payload()).await?;
                client.flush().await?;
                return Ok(Served::Hit);
            }
            Lookup::Stale => {
                info!(request = %line, "cache entry expired");
                true
            }
            Lookup::Absent => false,
        };

        info!(request = %line, "cache miss");
        let response = self.backend.fetch(request).await?;
        self.cache.insert(key, response.clone(), Instant::now());

        client.write_all(&response).await?;
        client.flush().await?;
        Ok(Served::Miss { expired })
    }
}
