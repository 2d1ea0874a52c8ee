//! Command Module
//!
//! This module builds the requests the client sends. It sits between the
//! public client API and the connection:
//!
//! ```text
//! MemcachedClient::set / get / run_command ...
//!       │
//!       ▼
//! ┌─────────────────┐
//! │    Command      │  (this module)
//! │                 │
//! │  - Allow-list   │
//! │  - Normalize    │
//! │  - Frame        │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   Connection    │  (connection module)
//! └─────────────────┘
//! ```
//!
//! ## Allowed Verbs
//!
//! - Storage: `set`, `add`, `replace`, `append`, `prepend`, `cas`
//! - Retrieval: `get`, `gets`, `gat`, `gats`
//! - Keys: `delete`, `touch`, `incr`, `decr`
//! - Server: `flush_all`, `stats`, `lru_crawler`, `slabs`, `verbosity`,
//!   `version`, `cache_memlimit`, `quit`
//! - Meta: `mg`, `ms`, `md`, `ma`, `me`, `mn`

pub mod command;

// Re-export the command types
pub use command::{validate_key, Command, CommandError, StorageVerb};
