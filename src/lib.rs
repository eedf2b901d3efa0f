//! wgveil: obfuscating UDP relay for WireGuard traffic
//!
//! wgveil sits between remote WireGuard peers and a local WireGuard
//! endpoint. On the proxy side it speaks obfuscated datagrams; on the wg
//! side, native WireGuard. Each remote client gets its own session with a
//! dedicated upstream socket, so the OS demultiplexes return traffic
//! without the relay inspecting WireGuard internals.
//!
//! # Architecture
//!
//! ```text
//! remote client → proxy socket → ingress (decrypt, demux)
//!                                   ↓ per-session send queue
//!                              forward worker → upstream socket → WireGuard
//!                              reply worker   ← upstream socket ← WireGuard
//! remote client ← proxy socket (re-encrypt, pktinfo echo)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wgveil::config::load_config;
//! use wgveil::relay::Server;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/wgveil/config.json")?;
//!
//! let mut servers = Vec::new();
//! for server_config in config.servers {
//!     let server = Arc::new(Server::new(server_config)?);
//!     server.start()?;
//!     servers.push(server);
//! }
//!
//! // ... run until shutdown ...
//! for server in &servers {
//!     server.stop().await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`io`]: Buffer pool and batch I/O
//! - [`net`]: Sockets, pktinfo ancillary data, read deadlines
//! - [`packet`]: Obfuscation packet handlers
//! - [`relay`]: The relay server core

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod io;
pub mod net;
pub mod packet;
pub mod relay;

// Re-export commonly used types at the crate root
pub use config::{Config, LogConfig, PerfConfig, ServerConfig};
pub use error::{ConfigError, Error, HandlerError, RelayError, Result};
pub use packet::{handler_for_mode, PacketHandler, ParanoidHandler, PassthroughHandler};
pub use relay::{Server, REJECT_AFTER_TIME};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
