//! # cacheproxy
//!
//! A forwarding TCP proxy that caches whole backend responses, keyed by the
//! normalized request line, for a fixed expiration window.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cacheproxy::{Backend, CacheStore, Config, Proxy, Server, Shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("config.toml")?;
//!     let cache = Arc::new(CacheStore::new(config.expiration()));
//!     let backend = Backend::new(config.backend_addr(), config.backend_timeout());
//!     let server = Server::bind(config.listen_addr()).await?;
//!     server.run(Arc::new(Proxy::new(cache, backend)), Shutdown::new()).await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod console;
pub mod proxy;
pub mod server;
pub mod shutdown;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheEntry, CacheStore, Lookup};
pub use config::{Config, ConfigError};
pub use console::{Command, Console, ConsoleExit, Reply};
pub use proxy::{Backend, Proxy, ProxyError, Served};
pub use server::{Server, ServerError};
pub use shutdown::Shutdown;
