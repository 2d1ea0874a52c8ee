//! Connection Module
//!
//! This module manages the single socket the client keeps to a memcached
//! node. The connection is opened lazily, checked before every command and
//! replaced transparently when the server has closed it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   MemcachedClient                           │
//! │                  (client module)                            │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ exchange(&Command)
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Connection                              │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Ensure live │───>│ Write cmd   │───>│ Read + frame│      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      ┌─────────────┐        │
//! │                                      │  Response   │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: Uses Tokio for non-blocking network operations
//! - **TCP and unix sockets**: One [`ServerEndpoint`] type for both
//! - **Soft deadline**: A slow reply comes back marked incomplete rather
//!   than as an error
//! - **Pipelining**: Several commands can share one write
//! - **Statistics**: Tracks connects, commands, bytes and timeouts
//!
//! ## Example
//!
//! ```no_run
//! use mcadmin::commands::Command;
//! use mcadmin::connection::{Connection, ServerEndpoint};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoint: ServerEndpoint = "127.0.0.1:11211".parse()?;
//! let mut conn = Connection::new(endpoint, Duration::from_secs(1), Duration::from_secs(5));
//!
//! let reply = conn.exchange(&Command::version()?).await?;
//! println!("{}", reply.text());
//! # Ok(())
//! # }
//! ```

pub mod handler;

// Re-export commonly used types
pub use handler::{Connection, ConnectionError, ConnectionStats, ServerEndpoint};
