//! # mcadmin - A Memcached Administration Client
//!
//! mcadmin speaks the memcached text protocol for the jobs an operator
//! does by hand: reading and writing individual keys, listing every key
//! with its expiry and size, and reading server statistics.
//!
//! ## Features
//!
//! - **Verb-aware framing**: Each verb's reply is read until its own
//!   terminator, with `VALUE` blocks framed by their declared length
//! - **Allow-list**: Only known verbs reach the socket, so the reader never
//!   waits for a terminator that cannot arrive
//! - **Soft timeouts**: A server that stops answering yields a partial
//!   reply within the configured ceiling rather than a hang
//! - **Key listing**: `lru_crawler metadump` on modern servers, slab-by-slab
//!   `stats cachedump` on old ones
//! - **Async I/O**: Built on Tokio, over TCP or unix-domain sockets
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              mcadmin                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Caller /   │───>│ Memcached   │───>│  Command    │                  │
//! │  │  CLI        │    │ Client      │    │ (allow-list)│                  │
//! │  └──────▲──────┘    └──────▲──────┘    └──────┬──────┘                  │
//! │         │                  │                  │                         │
//! │         │                  │                  ▼                         │
//! │  ┌──────┴──────┐    ┌──────┴──────┐    ┌─────────────┐    ┌──────────┐  │
//! │  │  Listing    │    │  Parsers    │<───│ Connection  │<──>│memcached │  │
//! │  │ (TTL, sort) │    │             │    │  + framing  │    │          │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └──────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use mcadmin::client::{ClientConfig, MemcachedClient};
//! use mcadmin::listing::{now_epoch, to_rows};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::new("127.0.0.1:11211".parse()?);
//!     let mut client = MemcachedClient::new(config);
//!
//!     client.set("name", "Ariz", 300).await?;
//!     println!("{:?}", client.get("name").await?);
//!
//!     for row in to_rows(&client.get_keys().await?, now_epoch()) {
//!         println!("{} ttl={} size={}", row.key, row.ttl, row.size);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: Verb table, reply framing and reply parsers
//! - [`commands`]: Command construction and validation
//! - [`connection`]: The socket to one memcached node
//! - [`client`]: The typed client API
//! - [`listing`]: Display-side key listing (remaining TTL, filter, sort)

pub mod client;
pub mod commands;
pub mod connection;
pub mod listing;
pub mod protocol;

// Re-export commonly used types for convenience
pub use client::{ClientConfig, ClientError, ClientResult, MemcachedClient};
pub use commands::Command;
pub use connection::{ConnectionStats, ServerEndpoint};
pub use protocol::{KeyRecord, Response, ServerStats, StatValue};

/// The default memcached port
pub const DEFAULT_PORT: u16 = 11211;

/// The default memcached host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of mcadmin
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
