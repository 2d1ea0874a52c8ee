//! Command Construction and Validation
//!
//! Every request the client writes is a [`Command`]. Building one is the
//! only way to reach the socket, so the checks done here hold for every
//! code path:
//!
//! 1. **Allow-list**: The verb (first token, lower-cased) must appear in
//!    [`COMMAND_TABLE`]. An unknown verb could leave the reader waiting for a
//!    terminator the server will never send, so it is rejected up front.
//! 2. **Terminator class**: The verb's class is resolved once, here, and
//!    travels with the command to the reader.
//! 3. **Framing**: The command ends with exactly one CRLF, and storage
//!    commands carry their data block with the correct byte count.
//!
//! Operator-typed text goes through [`Command::parse`], which also turns the
//! two-character escape `\r\n` into a real line terminator so multi-line
//! input can be typed on one line:
//!
//! ```text
//! set greeting 0 0 5\r\nhello   ->   set greeting 0 0 5<CR><LF>hello<CR><LF>
//! ```
//!
//! [`COMMAND_TABLE`]: crate::protocol::types::COMMAND_TABLE

use crate::protocol::frame::find_crlf;
use crate::protocol::types::{
    has_noreply_flag, terminator_class, TerminatorClass, CRLF, MAX_KEY_LENGTH,
    REPEATABLE_VERBS,
};
use std::fmt;
use thiserror::Error;

/// Literal escape sequence accepted in operator-typed commands
const ESCAPED_CRLF: &str = "\\r\\n";

/// Errors raised while building a command. Nothing has touched the socket
/// when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command text has no verb
    #[error("empty command")]
    Empty,

    /// The verb is not in the allow-list
    #[error("command '{command}' is not allowed")]
    Disallowed { command: String },

    /// A command line contains a line terminator or other framing hazard
    #[error("malformed command '{command}'")]
    Malformed { command: String },

    /// The key is empty, too long, or contains whitespace/control bytes
    #[error("invalid key {key:?}")]
    InvalidKey { key: String },
}

/// Storage verbs that carry a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StorageVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageVerb::Set => "set",
            StorageVerb::Add => "add",
            StorageVerb::Replace => "replace",
            StorageVerb::Append => "append",
            StorageVerb::Prepend => "prepend",
        }
    }
}

/// A validated request, ready to be written in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: String,
    class: TerminatorClass,
    bytes: Vec<u8>,
    expects_reply: bool,
}

impl Command {
    /// Builds a command from operator-typed text.
    ///
    /// Literal `\r\n` escapes become real line terminators, trailing
    /// terminators are trimmed and exactly one CRLF is appended.
    ///
    /// # Example
    ///
    /// ```
    /// use mcadmin::commands::Command;
    ///
    /// let cmd = Command::parse("set k 0 0 2\\r\\nhi").unwrap();
    /// assert_eq!(cmd.verb(), "set");
    /// assert_eq!(cmd.as_bytes(), b"set k 0 0 2\r\nhi\r\n");
    ///
    /// assert!(Command::parse("shutdown").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let normalized = text.replace(ESCAPED_CRLF, "\r\n");
        let trimmed = normalized.trim_end_matches(['\r', '\n']);

        let mut bytes = Vec::with_capacity(trimmed.len() + CRLF.len());
        bytes.extend_from_slice(trimmed.as_bytes());
        Self::finish(bytes, true)
    }

    /// Builds a single-line command from internally generated text.
    fn line(line: String) -> Result<Self, CommandError> {
        if line.contains(['\r', '\n']) {
            return Err(CommandError::Malformed { command: line });
        }
        Self::finish(line.into_bytes(), false)
    }

    /// Resolves the verb and class, then appends the final CRLF.
    ///
    /// Only operator text may be fire-and-forget; built commands always
    /// wait for their reply, whatever their key is called.
    fn finish(mut bytes: Vec<u8>, operator_text: bool) -> Result<Self, CommandError> {
        let first_line_end = find_crlf(&bytes).unwrap_or(bytes.len());
        let first_line = String::from_utf8_lossy(&bytes[..first_line_end]);

        let mut tokens = first_line.split_whitespace();
        let verb = tokens
            .next()
            .ok_or(CommandError::Empty)?
            .to_ascii_lowercase();

        let class = terminator_class(&verb).ok_or_else(|| CommandError::Disallowed {
            command: verb.clone(),
        })?;

        let args: Vec<&str> = tokens.collect();
        let noreply = operator_text && has_noreply_flag(&verb, &args);
        let expects_reply = verb != "quit" && !noreply;

        bytes.extend_from_slice(CRLF);

        Ok(Self {
            verb,
            class,
            bytes,
            expects_reply,
        })
    }

    /// `<verb> <key> <flags> <ttl> <bytes>` followed by the data block.
    pub fn store(
        verb: StorageVerb,
        key: &str,
        flags: u32,
        ttl: u32,
        value: &[u8],
    ) -> Result<Self, CommandError> {
        validate_key(key)?;

        let line = format!("{} {} {} {} {}", verb.as_str(), key, flags, ttl, value.len());
        let mut bytes = Vec::with_capacity(line.len() + value.len() + 2 * CRLF.len());
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(CRLF);
        bytes.extend_from_slice(value);
        Self::finish(bytes, false)
    }

    pub fn get(key: &str) -> Result<Self, CommandError> {
        validate_key(key)?;
        Self::line(format!("get {}", key))
    }

    pub fn delete(key: &str) -> Result<Self, CommandError> {
        validate_key(key)?;
        Self::line(format!("delete {}", key))
    }

    pub fn touch(key: &str, ttl: u32) -> Result<Self, CommandError> {
        validate_key(key)?;
        Self::line(format!("touch {} {}", key, ttl))
    }

    pub fn incr(key: &str, delta: u64) -> Result<Self, CommandError> {
        validate_key(key)?;
        Self::line(format!("incr {} {}", key, delta))
    }

    pub fn decr(key: &str, delta: u64) -> Result<Self, CommandError> {
        validate_key(key)?;
        Self::line(format!("decr {} {}", key, delta))
    }

    /// `me <key>`: key metadata without fetching the value.
    pub fn meta_debug(key: &str) -> Result<Self, CommandError> {
        validate_key(key)?;
        Self::line(format!("me {}", key))
    }

    pub fn flush_all() -> Result<Self, CommandError> {
        Self::line("flush_all".to_string())
    }

    pub fn version() -> Result<Self, CommandError> {
        Self::line("version".to_string())
    }

    /// `stats` or `stats <section>`.
    pub fn stats(section: Option<&str>) -> Result<Self, CommandError> {
        match section.map(str::trim).filter(|s| !s.is_empty()) {
            Some(section) => Self::line(format!("stats {}", section)),
            None => Self::line("stats".to_string()),
        }
    }

    /// `stats cachedump <slab> <limit>`; a limit of 0 asks for as many keys
    /// as the server is willing to dump.
    pub fn cachedump(slab: u32, limit: u32) -> Result<Self, CommandError> {
        Self::line(format!("stats cachedump {} {}", slab, limit))
    }

    /// `lru_crawler metadump all`
    pub fn metadump() -> Result<Self, CommandError> {
        Self::line("lru_crawler metadump all".to_string())
    }

    /// The lower-cased verb.
    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn class(&self) -> TerminatorClass {
        self.class
    }

    /// The full request, ending with CRLF.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// False for `quit` and anything sent with `noreply`; the reader must
    /// not wait for these.
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    /// Whether sending this twice leaves the server as sending it once.
    /// `incr`, `add`, `append` and the like are not.
    pub fn is_repeatable(&self) -> bool {
        REPEATABLE_VERBS.contains(&self.verb.as_str())
    }
}

impl fmt::Display for Command {
    /// Shows the command line only, never the data block.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = find_crlf(&self.bytes).unwrap_or(self.bytes.len());
        write!(f, "{}", String::from_utf8_lossy(&self.bytes[..end]))
    }
}

/// Checks a key against the text protocol's key rules.
pub fn validate_key(key: &str) -> Result<(), CommandError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key.bytes().all(|b| b > b' ' && b != 0x7f);

    if valid {
        Ok(())
    } else {
        Err(CommandError::InvalidKey {
            key: key.to_string(),
        })
    }
}
