//! Memcached Text Protocol
//!
//! This module implements the client side of the subset of the memcached
//! text protocol needed for administrative browsing.
//!
//! ## Overview
//!
//! The protocol is line oriented and half duplex: one command goes out, its
//! whole reply comes back, and only then may the next command be sent.
//! Replies carry no length prefix and no universal terminator, so deciding
//! where a reply ends depends on which verb was sent.
//!
//! ## Modules
//!
//! - `types`: The verb table, marker tokens and parsed value types
//! - `frame`: Incremental detection of where a reply ends
//! - `parser`: Reply parsers for `get`, `stats`, `metadump`, `me` and friends
//!
//! ## Example
//!
//! ```
//! use mcadmin::protocol::{frame_response, parse_stats, terminator_class};
//!
//! let reply = b"STAT curr_items 2\r\nEND\r\n";
//! let class = terminator_class("stats").unwrap();
//!
//! let len = frame_response(reply, class).unwrap();
//! let stats = parse_stats(&reply[..len]);
//! assert_eq!(stats["curr_items"].as_int(), Some(2));
//! ```

pub mod frame;
pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use frame::{frame_response, frame_responses};
pub use parser::{
    parse_cachedump, parse_counter, parse_get, parse_get_bytes, parse_item_slabs, parse_key_meta,
    parse_metadump, parse_stats, parse_version,
};
pub use types::{
    terminator_class, Expiry, KeyRecord, Response, ServerStats, ServerVersion, StatValue,
    TerminatorClass, TimeBase, CRLF,
};
