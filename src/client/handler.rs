//! Memcached Client
//!
//! [`MemcachedClient`] is the typed API callers use. Every operation builds
//! a [`Command`] (so the allow-list and the verb's terminator class always
//! apply), exchanges it over the client's single [`Connection`] and hands
//! the reply to one of the protocol parsers.
//!
//! ## Key Listing
//!
//! Servers from 1.4.31 on can list every key with `lru_crawler metadump
//! all`. Older servers, and servers where the crawler is disabled, are
//! enumerated slab by slab:
//!
//! ```text
//! version >= 1.4.31 ?
//!    │ yes                          │ no
//!    ▼                              ▼
//! lru_crawler metadump all     stats items ──> slab ids
//!    │                              │
//!    │ error reply?  ──────────────>│
//!    │                              ▼
//!    │                     stats cachedump <id> <limit>  (per slab)
//!    ▼                              │
//! dedupe by key <───────────────────┘
//! ```
//!
//! The strategy follows from the server version, which is fetched once per
//! connection and cached until the socket is replaced.
//!
//! ## Times
//!
//! The client returns expiry and last-access times exactly as the server
//! reports them. Converting to "seconds remaining" is done by the caller,
//! see [`crate::listing`].

use crate::commands::{Command, CommandError, StorageVerb};
use crate::connection::{Connection, ConnectionError, ConnectionStats, ServerEndpoint};
use crate::protocol::parser::{
    parse_cachedump, parse_counter, parse_get_bytes, parse_item_slabs, parse_key_meta, parse_metadump,
    parse_stats, parse_version,
};
use crate::protocol::types::{KeyRecord, Response, ServerStats, ServerVersion};
use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default ceiling on how long to wait for a complete reply
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced to callers of [`MemcachedClient`].
///
/// A slow server is not an error: replies cut short by the response
/// timeout come back as best-effort results.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The socket could not be opened or failed while in use
    #[error("connection error: {reason}")]
    Connection { reason: String },

    /// The command was rejected before anything was sent
    #[error("protocol error: command '{command}' is not allowed or malformed")]
    Protocol { command: String },

    /// The key breaks the text protocol's key rules
    #[error("invalid key {key:?}")]
    InvalidKey { key: String },

    /// The endpoint string could not be parsed
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}

impl From<ConnectionError> for ClientError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::InvalidEndpoint(endpoint) => ClientError::InvalidEndpoint(endpoint),
            other => ClientError::Connection {
                reason: other.to_string(),
            },
        }
    }
}

impl From<CommandError> for ClientError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Empty => ClientError::Protocol {
                command: String::new(),
            },
            CommandError::Disallowed { command } | CommandError::Malformed { command } => {
                ClientError::Protocol { command }
            }
            CommandError::InvalidKey { key } => ClientError::InvalidKey { key },
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// The node to talk to
    pub endpoint: ServerEndpoint,
    /// How long opening the socket may take
    pub connect_timeout: Duration,
    /// How long to wait for a complete reply before returning what arrived
    pub response_timeout: Duration,
    /// Per-slab key limit for `stats cachedump` (0 = server maximum)
    pub cachedump_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: ServerEndpoint::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            cachedump_limit: 0,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: ServerEndpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: ServerEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_cachedump_limit(mut self, limit: u32) -> Self {
        self.cachedump_limit = limit;
        self
    }
}

/// How keys are enumerated on a given server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyListing {
    /// `lru_crawler metadump all`
    Metadump,
    /// `stats items` followed by `stats cachedump` per slab
    Cachedump,
}

impl KeyListing {
    /// Picks the strategy for a server version. An unrecognised version
    /// tries metadump first; an error reply still falls back to cachedump.
    pub fn for_version(version: Option<ServerVersion>) -> Self {
        match version {
            Some(v) if !v.supports_metadump() => KeyListing::Cachedump,
            _ => KeyListing::Metadump,
        }
    }
}

/// A client bound to one memcached node.
///
/// Commands run one at a time: every operation takes `&mut self`, which is
/// what the text protocol requires since it has no request ids. To share a
/// client between tasks, put it behind a `tokio::sync::Mutex`.
///
/// # Example
///
/// ```no_run
/// use mcadmin::client::{ClientConfig, MemcachedClient};
///
/// # async fn demo() -> mcadmin::client::ClientResult<()> {
/// let mut client = MemcachedClient::new(ClientConfig::default());
///
/// assert!(client.set("greeting", "hello", 0).await?);
/// assert_eq!(client.get("greeting").await?, Some("hello".to_string()));
/// assert!(client.delete("greeting").await?);
/// assert_eq!(client.get("greeting").await?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemcachedClient {
    config: ClientConfig,
    connection: Connection,
    /// Version string and the connection generation it was read on
    version: Option<(u64, String)>,
}

impl MemcachedClient {
    /// Creates a client. The socket is opened on first use.
    pub fn new(config: ClientConfig) -> Self {
        let connection = Connection::new(
            config.endpoint.clone(),
            config.connect_timeout,
            config.response_timeout,
        );

        Self {
            config,
            connection,
            version: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        self.connection.endpoint()
    }

    /// Connection counters.
    pub fn stats(&self) -> &ConnectionStats {
        self.connection.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Opens the socket now rather than on the first command.
    pub async fn connect(&mut self) -> ClientResult<()> {
        Ok(self.connection.connect().await?)
    }

    /// Closes the socket. The next command reconnects.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Sends a prepared command and returns the raw reply.
    ///
    /// Check [`Response::is_complete`] before trusting the reply: one that
    /// did not finish before the response timeout is returned as it stood.
    pub async fn execute(&mut self, command: &Command) -> ClientResult<Response> {
        Ok(self.connection.exchange(command).await?)
    }

    /// Sends operator-typed command text and returns the reply text with
    /// its final line terminator trimmed.
    ///
    /// Literal `\r\n` escapes in `text` become real line terminators. A
    /// verb outside the allow-list fails with [`ClientError::Protocol`]
    /// without touching the socket.
    pub async fn run_command(&mut self, text: &str) -> ClientResult<String> {
        let command = Command::parse(text)?;
        let response = self.execute(&command).await?;
        Ok(response.text())
    }

    async fn store(
        &mut self,
        verb: StorageVerb,
        key: &str,
        value: &[u8],
        ttl: u32,
    ) -> ClientResult<bool> {
        let command = Command::store(verb, key, 0, ttl, value)?;
        let response = self.execute(&command).await?;
        Ok(response.is("STORED"))
    }

    /// Stores `value` under `key`. `ttl` is in seconds, 0 for no expiry.
    pub async fn set(&mut self, key: &str, value: impl AsRef<[u8]>, ttl: u32) -> ClientResult<bool> {
        self.store(StorageVerb::Set, key, value.as_ref(), ttl).await
    }

    /// Stores only if the key does not exist.
    pub async fn add(&mut self, key: &str, value: impl AsRef<[u8]>, ttl: u32) -> ClientResult<bool> {
        self.store(StorageVerb::Add, key, value.as_ref(), ttl).await
    }

    /// Stores only if the key already exists.
    pub async fn replace(&mut self, key: &str, value: impl AsRef<[u8]>, ttl: u32) -> ClientResult<bool> {
        self.store(StorageVerb::Replace, key, value.as_ref(), ttl).await
    }

    pub async fn append(&mut self, key: &str, value: impl AsRef<[u8]>) -> ClientResult<bool> {
        self.store(StorageVerb::Append, key, value.as_ref(), 0).await
    }

    pub async fn prepend(&mut self, key: &str, value: impl AsRef<[u8]>) -> ClientResult<bool> {
        self.store(StorageVerb::Prepend, key, value.as_ref(), 0).await
    }

    /// Fetches a value as raw bytes. `None` means the key does not exist,
    /// which is distinct from a stored empty value.
    pub async fn get_bytes(&mut self, key: &str) -> ClientResult<Option<Bytes>> {
        let response = self.execute(&Command::get(key)?).await?;
        Ok(parse_get_bytes(response.data()))
    }

    /// Fetches a value as text, replacing invalid UTF-8.
    pub async fn get(&mut self, key: &str) -> ClientResult<Option<String>> {
        let value = self.get_bytes(key).await?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Whether the key exists, answered with a single `get`.
    pub async fn exists(&mut self, key: &str) -> ClientResult<bool> {
        Ok(self.get_bytes(key).await?.is_some())
    }

    /// Removes a key. Returns `false` when it did not exist.
    pub async fn delete(&mut self, key: &str) -> ClientResult<bool> {
        let response = self.execute(&Command::delete(key)?).await?;
        Ok(response.is("DELETED"))
    }

    /// Invalidates every item on the server.
    pub async fn flush(&mut self) -> ClientResult<bool> {
        let response = self.execute(&Command::flush_all()?).await?;
        Ok(response.is("OK"))
    }

    /// Sets a new TTL without fetching the value.
    pub async fn touch(&mut self, key: &str, ttl: u32) -> ClientResult<bool> {
        let response = self.execute(&Command::touch(key, ttl)?).await?;
        Ok(response.is("TOUCHED"))
    }

    /// Increments a numeric value, returning the new value or `None` if the
    /// key does not exist.
    pub async fn incr(&mut self, key: &str, delta: u64) -> ClientResult<Option<u64>> {
        let response = self.execute(&Command::incr(key, delta)?).await?;
        Ok(parse_counter(response.as_bytes()))
    }

    /// Decrements a numeric value (memcached clamps at zero).
    pub async fn decr(&mut self, key: &str, delta: u64) -> ClientResult<Option<u64>> {
        let response = self.execute(&Command::decr(key, delta)?).await?;
        Ok(parse_counter(response.as_bytes()))
    }

    /// Fetches `stats` or `stats <section>`.
    pub async fn get_server_stats(&mut self, section: Option<&str>) -> ClientResult<ServerStats> {
        let response = self.execute(&Command::stats(section)?).await?;
        if !response.is_complete() {
            warn!(endpoint = %self.endpoint(), section = ?section, "Stats reply incomplete");
        }
        Ok(parse_stats(response.as_bytes()))
    }

    /// Fetches several stats sections in one round trip. An empty section
    /// name stands for plain `stats`. The result holds one map per section,
    /// in order; sections whose replies did not arrive in time are missing
    /// from the end.
    pub async fn get_server_stats_many(&mut self, sections: &[&str]) -> ClientResult<Vec<ServerStats>> {
        let commands = sections
            .iter()
            .map(|section| Command::stats(Some(*section)))
            .collect::<Result<Vec<_>, _>>()?;

        let responses = self.connection.exchange_many(&commands).await?;
        if responses.len() < commands.len() || responses.iter().any(|r| !r.is_complete()) {
            warn!(
                endpoint = %self.endpoint(),
                requested = commands.len(),
                received = responses.len(),
                "Pipelined stats incomplete"
            );
        }

        Ok(responses.iter().map(|r| parse_stats(r.as_bytes())).collect())
    }

    /// Slab class ids that currently hold items, ascending.
    pub async fn get_slabs(&mut self) -> ClientResult<Vec<u32>> {
        let response = self.execute(&Command::stats(Some("items"))?).await?;
        Ok(parse_item_slabs(response.as_bytes()))
    }

    /// The server's version string, cached for the life of the connection.
    ///
    /// Returns an empty string when no version reply arrived in time; that
    /// outcome is not cached.
    pub async fn version(&mut self) -> ClientResult<String> {
        if let Some((generation, version)) = &self.version {
            if *generation == self.connection.generation() && self.connection.is_connected() {
                return Ok(version.clone());
            }
        }

        let response = self.execute(&Command::version()?).await?;
        let Some(version) = parse_version(response.as_bytes()) else {
            warn!(endpoint = %self.endpoint(), reply = %response.text(), "No version in reply");
            return Ok(String::new());
        };

        debug!(endpoint = %self.endpoint(), version = %version, "Server version");
        self.version = Some((self.connection.generation(), version.clone()));
        Ok(version)
    }

    /// The server version as a comparable value, if it parses.
    pub async fn server_version(&mut self) -> ClientResult<Option<ServerVersion>> {
        Ok(ServerVersion::parse(&self.version().await?))
    }

    /// The key listing strategy for this server.
    pub async fn key_listing(&mut self) -> ClientResult<KeyListing> {
        Ok(KeyListing::for_version(self.server_version().await?))
    }

    /// Lists every key on the server with its metadata.
    ///
    /// Keys appear once each. Listing is best-effort: malformed lines are
    /// skipped and a listing cut short by the response timeout returns the
    /// keys that arrived.
    pub async fn get_keys(&mut self) -> ClientResult<Vec<KeyRecord>> {
        match self.key_listing().await? {
            KeyListing::Metadump => {
                let response = self.execute(&Command::metadump()?).await?;

                if response.is_error() {
                    debug!(
                        endpoint = %self.endpoint(),
                        reply = %String::from_utf8_lossy(response.last_line()),
                        "Metadump refused, falling back to cachedump"
                    );
                    return self.keys_from_cachedump().await;
                }
                if !response.is_complete() {
                    warn!(endpoint = %self.endpoint(), "Metadump incomplete, listing is partial");
                }

                Ok(unique_keys(parse_metadump(response.as_bytes())))
            }
            KeyListing::Cachedump => self.keys_from_cachedump().await,
        }
    }

    async fn keys_from_cachedump(&mut self) -> ClientResult<Vec<KeyRecord>> {
        let slabs = self.get_slabs().await?;
        debug!(endpoint = %self.endpoint(), slabs = slabs.len(), "Listing keys with cachedump");

        let mut records = Vec::new();
        for slab in slabs {
            let command = Command::cachedump(slab, self.config.cachedump_limit)?;
            let response = self.execute(&command).await?;
            if !response.is_complete() {
                warn!(endpoint = %self.endpoint(), slab = slab, "Cachedump incomplete");
            }
            records.extend(parse_cachedump(response.as_bytes(), slab));
        }

        Ok(unique_keys(records))
    }

    /// Metadata for one key via `me <key>`, or `None` if it does not exist.
    ///
    /// `me` reports relative times; the record is tagged
    /// [`TimeBase::Relative`](crate::protocol::types::TimeBase::Relative).
    pub async fn get_key_meta(&mut self, key: &str) -> ClientResult<Option<KeyRecord>> {
        let response = self.execute(&Command::meta_debug(key)?).await?;
        Ok(parse_key_meta(response.as_bytes()))
    }
}

/// Keeps the first record for each key.
fn unique_keys(records: Vec<KeyRecord>) -> Vec<KeyRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.key.clone()))
        .collect()
}
