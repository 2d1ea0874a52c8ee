//! Client Module
//!
//! The public, typed API over the memcached text protocol.
//!
//! ```text
//! caller ──> MemcachedClient ──> Command ──> Connection ──> memcached
//!                 ▲                                │
//!                 └──────── parser <── Response ───┘
//! ```
//!
//! Value and error contract:
//!
//! - Lookups that miss return `None`, never an error or an empty string.
//! - `delete` of a missing key returns `false`.
//! - A reply cut short by the response timeout is a degraded result, not
//!   an error.
//! - Connection failures and rejected commands are [`ClientError`]s.

pub mod handler;

pub use handler::{
    ClientConfig, ClientError, ClientResult, KeyListing, MemcachedClient, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RESPONSE_TIMEOUT,
};
