//! Memcached Text Protocol Types
//!
//! This module defines the static vocabulary of the text protocol as the
//! client sees it: which verbs may be sent, how each verb's reply is
//! terminated, which lines count as terminating markers, and the structured
//! values the response parsers produce.
//!
//! ## Protocol Format
//!
//! Every request and every reply line ends with CRLF (`\r\n`). Storage
//! commands carry a data block after the command line:
//!
//! ```text
//! set <key> <flags> <exptime> <bytes>\r\n
//! <data block>\r\n
//! ```
//!
//! Replies have no length prefix. Most of them end with a marker line such
//! as `STORED`, `END` or `ERROR`; a few (`version`, `incr`, the meta
//! commands) are a single line and carry no marker at all. The
//! [`TerminatorClass`] of a verb decides which rule applies.

use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// The CRLF terminator used by the text protocol
pub const CRLF: &[u8] = b"\r\n";

/// Longest key the server accepts
pub const MAX_KEY_LENGTH: usize = 250;

/// Raw expiry value meaning "does not expire"
pub const NEVER_EXPIRES: i64 = -1;

/// First server release that ships `lru_crawler metadump`
pub const METADUMP_MIN_VERSION: ServerVersion = ServerVersion::new(1, 4, 31);

/// How the end of a reply is detected for a given verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminatorClass {
    /// The reply is a single line (or a meta `VA <n>` line plus its data
    /// block). No marker is waited for; some servers send nothing at all.
    NoResponseExpected,

    /// The reply ends with a line that is one of [`MARKERS`].
    TerminatedByMarker,
}

/// Verbs the client is willing to send, and the terminator rule for each.
///
/// Verbs missing from this table are rejected before any I/O happens. A
/// verb like `watch` streams forever and `shutdown` never answers, so they
/// stay out.
pub const COMMAND_TABLE: &[(&str, TerminatorClass)] = &[
    // Storage
    ("set", TerminatorClass::TerminatedByMarker),
    ("add", TerminatorClass::TerminatedByMarker),
    ("replace", TerminatorClass::TerminatedByMarker),
    ("append", TerminatorClass::TerminatedByMarker),
    ("prepend", TerminatorClass::TerminatedByMarker),
    ("cas", TerminatorClass::TerminatedByMarker),
    // Retrieval
    ("get", TerminatorClass::TerminatedByMarker),
    ("gets", TerminatorClass::TerminatedByMarker),
    ("gat", TerminatorClass::TerminatedByMarker),
    ("gats", TerminatorClass::TerminatedByMarker),
    // Keys
    ("delete", TerminatorClass::TerminatedByMarker),
    ("touch", TerminatorClass::TerminatedByMarker),
    ("incr", TerminatorClass::NoResponseExpected),
    ("decr", TerminatorClass::NoResponseExpected),
    // Server
    ("flush_all", TerminatorClass::TerminatedByMarker),
    ("stats", TerminatorClass::TerminatedByMarker),
    ("lru_crawler", TerminatorClass::TerminatedByMarker),
    ("slabs", TerminatorClass::TerminatedByMarker),
    ("verbosity", TerminatorClass::TerminatedByMarker),
    ("version", TerminatorClass::NoResponseExpected),
    ("cache_memlimit", TerminatorClass::NoResponseExpected),
    ("quit", TerminatorClass::NoResponseExpected),
    // Meta
    ("mg", TerminatorClass::NoResponseExpected),
    ("ms", TerminatorClass::NoResponseExpected),
    ("md", TerminatorClass::NoResponseExpected),
    ("ma", TerminatorClass::NoResponseExpected),
    ("me", TerminatorClass::NoResponseExpected),
    ("mn", TerminatorClass::NoResponseExpected),
];

/// Lines that end a [`TerminatorClass::TerminatedByMarker`] reply.
///
/// A line terminates the reply when it equals one of these tokens or starts
/// with the token followed by a space (`SERVER_ERROR out of memory`).
pub const MARKERS: &[&str] = &[
    "STORED",
    "NOT_STORED",
    "EXISTS",
    "NOT_FOUND",
    "DELETED",
    "TOUCHED",
    "OK",
    "END",
    "ERROR",
    "CLIENT_ERROR",
    "SERVER_ERROR",
    "BUSY",
    "BADCLASS",
    "NOSPARE",
    "NOTFULL",
    "UNSAFE",
    "SAME",
    "RESET",
    "EN",
    "HD",
];

/// Verbs that take a trailing `noreply`, with the number of arguments that
/// come before it. A `noreply` inside those arguments is a key or value.
pub const NOREPLY_VERBS: &[(&str, usize)] = &[
    ("set", 4),
    ("add", 4),
    ("replace", 4),
    ("append", 4),
    ("prepend", 4),
    ("cas", 5),
    ("delete", 1),
    ("touch", 2),
    ("incr", 2),
    ("decr", 2),
    ("flush_all", 0),
    ("verbosity", 1),
    ("cache_memlimit", 1),
];

/// Whether the arguments after `verb` end with a `noreply` flag.
pub fn has_noreply_flag(verb: &str, args: &[&str]) -> bool {
    NOREPLY_VERBS
        .iter()
        .find(|(name, _)| *name == verb)
        .is_some_and(|(_, fixed)| args.len() > *fixed && args.last() == Some(&"noreply"))
}

/// Verbs whose effect is the same if the server sees them twice. Only these
/// are resent after a reused socket turns out to be dead, since the first
/// copy may have been applied before the server closed.
pub const REPEATABLE_VERBS: &[&str] = &[
    "get",
    "gets",
    "gat",
    "gats",
    "mg",
    "me",
    "mn",
    "set",
    "replace",
    "delete",
    "touch",
    "flush_all",
    "stats",
    "lru_crawler",
    "slabs",
    "verbosity",
    "version",
    "cache_memlimit",
];

/// Markers that signal a failed command rather than a normal reply.
pub const ERROR_MARKERS: &[&str] = &[
    "ERROR",
    "CLIENT_ERROR",
    "SERVER_ERROR",
    "BUSY",
    "BADCLASS",
];

/// Looks up the terminator rule for a lower-cased verb.
pub fn terminator_class(verb: &str) -> Option<TerminatorClass> {
    COMMAND_TABLE
        .iter()
        .find(|(name, _)| *name == verb)
        .map(|(_, class)| *class)
}

/// Returns true if `line` (without its CRLF) is a terminating marker line.
pub fn is_marker_line(line: &[u8]) -> bool {
    MARKERS.iter().any(|marker| starts_with_token(line, marker))
}

/// Returns true if `line` (without its CRLF) reports a command failure.
pub fn is_error_line(line: &[u8]) -> bool {
    ERROR_MARKERS
        .iter()
        .any(|marker| starts_with_token(line, marker))
}

/// `line == token` or `line` starts with `token ` .
fn starts_with_token(line: &[u8], token: &str) -> bool {
    let token = token.as_bytes();
    line.starts_with(token) && (line.len() == token.len() || line[token.len()] == b' ')
}

/// A raw reply as read off the socket.
///
/// `complete` is false when the response ceiling expired or the peer closed
/// the socket before the reply was framed; the data is then whatever had
/// arrived, and callers must treat it as a possibly partial reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    data: Bytes,
    complete: bool,
}

impl Response {
    /// A fully framed reply.
    pub fn complete(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            complete: true,
        }
    }

    /// A reply cut short by the timeout or by the peer.
    pub fn incomplete(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw bytes, including the final CRLF when one arrived.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The raw bytes as a shared buffer.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The reply with its trailing line terminator trimmed.
    pub fn body(&self) -> &[u8] {
        self.data.strip_suffix(CRLF).unwrap_or(&self.data)
    }

    /// The trimmed reply as text. Invalid UTF-8 is replaced, not rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.body()).into_owned()
    }

    /// The first line of the reply, without its terminator.
    pub fn first_line(&self) -> &[u8] {
        let body = self.body();
        match body.windows(2).position(|w| w == CRLF) {
            Some(pos) => &body[..pos],
            None => body,
        }
    }

    /// The last line of the reply, without its terminator.
    pub fn last_line(&self) -> &[u8] {
        let body = self.body();
        match body.windows(2).rposition(|w| w == CRLF) {
            Some(pos) => &body[pos + 2..],
            None => body,
        }
    }

    /// True if the reply is exactly one line equal to `marker`.
    pub fn is(&self, marker: &str) -> bool {
        self.body() == marker.as_bytes()
    }

    /// True if the final line reports a failed command.
    pub fn is_error(&self) -> bool {
        is_error_line(self.last_line())
    }
}

/// When a key expires, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expiry {
    /// The key was stored without a TTL.
    Never,
    /// Absolute Unix timestamp (metadump, cachedump) or seconds remaining
    /// (`me`), depending on the record's [`TimeBase`].
    At(i64),
}

impl Expiry {
    /// Decodes the wire value, where `-1` means "does not expire".
    pub fn from_raw(raw: i64) -> Self {
        if raw == NEVER_EXPIRES {
            Expiry::Never
        } else {
            Expiry::At(raw)
        }
    }

    /// Encodes back to the wire convention.
    pub fn as_raw(&self) -> i64 {
        match self {
            Expiry::Never => NEVER_EXPIRES,
            Expiry::At(t) => *t,
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Expiry::Never)
    }
}

/// Which clock a [`KeyRecord`]'s time fields are measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeBase {
    /// `exp` and `la` are Unix timestamps (`lru_crawler metadump`,
    /// `stats cachedump`).
    Absolute,
    /// `exp` is seconds remaining and `la` is seconds since last access
    /// (`me`).
    Relative,
}

/// Metadata for a single cached key.
///
/// The client reports times exactly as the server sent them. Turning them
/// into "seconds remaining" is the caller's job, see
/// [`crate::listing::KeyRow`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRecord {
    pub key: String,
    pub expiry: Expiry,
    pub last_access: i64,
    pub size: u64,
    pub slab_class: Option<u32>,
    pub time_base: TimeBase,
}

impl KeyRecord {
    pub fn new(key: impl Into<String>, time_base: TimeBase) -> Self {
        Self {
            key: key.into(),
            expiry: Expiry::Never,
            last_access: 0,
            size: 0,
            slab_class: None,
            time_base,
        }
    }
}

/// A single `STAT` value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatValue {
    Int(i64),
    Text(String),
}

impl StatValue {
    /// Integers become [`StatValue::Int`], anything else stays text.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => StatValue::Int(n),
            Err(_) => StatValue::Text(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StatValue::Int(n) => Some(*n),
            StatValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StatValue::Int(_) => None,
            StatValue::Text(s) => Some(s),
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Int(n) => write!(f, "{}", n),
            StatValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Counters from a `stats` reply, ordered by name.
pub type ServerStats = BTreeMap<String, StatValue>;

/// A `major.minor.patch` server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses strings like `1.6.21`, `1.4.5-dev` or `1.6`.
    ///
    /// Each component keeps its leading digits only; missing components
    /// count as zero. Returns `None` when the major version is absent.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });

        let major = parts.next().flatten()?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }

    /// Whether this server can list keys with `lru_crawler metadump`.
    pub fn supports_metadump(&self) -> bool {
        *self >= METADUMP_MIN_VERSION
    }
}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
