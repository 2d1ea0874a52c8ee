//! Key Listing
//!
//! The caller-side view of [`MemcachedClient::get_keys`]: turns the raw
//! records the client returns into rows ready for display, then filters
//! and sorts them.
//!
//! This is the only place server times are converted. The client reports
//! `exp` and `la` exactly as the server sent them (absolute epochs from
//! `metadump` and `cachedump`, relative seconds from `me`); [`KeyRow`]
//! turns both into "seconds remaining" and "seconds idle" against a
//! caller-supplied clock.
//!
//! ## Example
//!
//! ```
//! use mcadmin::listing::{filter_keys, sort_keys, KeyRow, SortBy};
//! use mcadmin::protocol::parse_metadump;
//!
//! let raw = b"key=b exp=-1 la=990 size=3\r\nkey=a exp=1060 la=995 size=5\r\nEND\r\n";
//! let now = 1000;
//!
//! let mut rows: Vec<KeyRow> = parse_metadump(raw)
//!     .iter()
//!     .map(|record| KeyRow::from_record(record, now))
//!     .collect();
//! sort_keys(&mut rows, SortBy::Key);
//!
//! assert_eq!(rows[0].key, "a");
//! assert_eq!(rows[0].ttl, 60);
//! assert_eq!(rows[1].ttl, -1);
//! assert_eq!(filter_keys(rows, "B").len(), 1);
//! ```
//!
//! [`MemcachedClient::get_keys`]: crate::client::MemcachedClient::get_keys

use crate::protocol::types::{Expiry, KeyRecord, TimeBase, NEVER_EXPIRES};
use std::cmp::Ordering;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// One key, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRow {
    pub key: String,
    /// Seconds until expiry, `-1` if the key never expires, `0` if it has
    /// already expired but not yet been reclaimed
    pub ttl: i64,
    /// Seconds since the key was last accessed
    pub idle: i64,
    /// Item size in bytes
    pub size: u64,
    pub slab_class: Option<u32>,
}

impl KeyRow {
    /// Converts a record using `now` as the current Unix time.
    pub fn from_record(record: &KeyRecord, now: i64) -> Self {
        let ttl = match (record.expiry, record.time_base) {
            (Expiry::Never, _) => NEVER_EXPIRES,
            (Expiry::At(exp), TimeBase::Absolute) => (exp - now).max(0),
            (Expiry::At(remaining), TimeBase::Relative) => remaining.max(0),
        };

        let idle = match record.time_base {
            // Cachedump carries no access time.
            TimeBase::Absolute if record.last_access <= 0 => 0,
            TimeBase::Absolute => (now - record.last_access).max(0),
            TimeBase::Relative => record.last_access.max(0),
        };

        Self {
            key: record.key.clone(),
            ttl,
            idle,
            size: record.size,
            slab_class: record.slab_class,
        }
    }

    pub fn never_expires(&self) -> bool {
        self.ttl == NEVER_EXPIRES
    }
}

/// The current Unix time in seconds.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Converts a whole listing against one clock reading.
pub fn to_rows(records: &[KeyRecord], now: i64) -> Vec<KeyRow> {
    records
        .iter()
        .map(|record| KeyRow::from_record(record, now))
        .collect()
}

/// Keeps rows whose key contains `search`, ignoring case. An empty search
/// keeps everything.
pub fn filter_keys(rows: Vec<KeyRow>, search: &str) -> Vec<KeyRow> {
    let search = search.trim().to_lowercase();
    if search.is_empty() {
        return rows;
    }

    rows.into_iter()
        .filter(|row| row.key.to_lowercase().contains(&search))
        .collect()
}

/// Sort orders for [`sort_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    /// Alphabetical by key
    #[default]
    Key,
    /// Soonest expiry first, keys that never expire last
    Ttl,
    /// Largest first
    Size,
}

impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "key" | "name" => Ok(SortBy::Key),
            "ttl" | "exp" | "expiry" => Ok(SortBy::Ttl),
            "size" => Ok(SortBy::Size),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

/// Sorts rows in place. Ties are broken by key.
pub fn sort_keys(rows: &mut [KeyRow], by: SortBy) {
    rows.sort_by(|a, b| {
        let primary = match by {
            SortBy::Key => Ordering::Equal,
            SortBy::Ttl => ttl_order(a).cmp(&ttl_order(b)),
            SortBy::Size => b.size.cmp(&a.size),
        };
        primary.then_with(|| a.key.cmp(&b.key))
    });
}

fn ttl_order(row: &KeyRow) -> (bool, i64) {
    (row.never_expires(), row.ttl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, expiry: Expiry, last_access: i64, size: u64, base: TimeBase) -> KeyRecord {
        let mut record = KeyRecord::new(key, base);
        record.expiry = expiry;
        record.last_access = last_access;
        record.size = size;
        record
    }

    fn row(key: &str, ttl: i64, size: u64) -> KeyRow {
        KeyRow {
            key: key.to_string(),
            ttl,
            idle: 0,
            size,
            slab_class: None,
        }
    }

    #[test]
    fn test_absolute_expiry_becomes_remaining() {
        let r = record("k", Expiry::At(1_700_000_300), 1_699_999_990, 10, TimeBase::Absolute);
        let row = KeyRow::from_record(&r, 1_700_000_000);

        assert_eq!(row.ttl, 300);
        assert_eq!(row.idle, 10);
        assert_eq!(row.size, 10);
    }

    #[test]
    fn test_never_expires_stays_sentinel() {
        let r = record("k", Expiry::Never, 0, 1, TimeBase::Absolute);
        let row = KeyRow::from_record(&r, 1_700_000_000);

        assert_eq!(row.ttl, -1);
        assert!(row.never_expires());
    }

    #[test]
    fn test_expired_clamps_to_zero() {
        let r = record("k", Expiry::At(1_699_999_000), 0, 1, TimeBase::Absolute);
        let row = KeyRow::from_record(&r, 1_700_000_000);

        assert_eq!(row.ttl, 0);
        assert!(!row.never_expires());
    }

    #[test]
    fn test_relative_times_pass_through() {
        let r = record("k", Expiry::At(42), 7, 1, TimeBase::Relative);
        let row = KeyRow::from_record(&r, 1_700_000_000);

        assert_eq!(row.ttl, 42);
        assert_eq!(row.idle, 7);
    }

    #[test]
    fn test_cachedump_rows_have_no_idle_time() {
        let r = record("k", Expiry::Never, 0, 1, TimeBase::Absolute);
        assert_eq!(KeyRow::from_record(&r, 1_700_000_000).idle, 0);
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let rows = vec![row("User:1", 10, 1), row("session:2", 10, 1), row("user:3", 10, 1)];

        let found = filter_keys(rows.clone(), "USER");
        assert_eq!(found.len(), 2);

        assert_eq!(filter_keys(rows.clone(), "").len(), 3);
        assert_eq!(filter_keys(rows, "missing").len(), 0);
    }

    #[test]
    fn test_sort_by_ttl_puts_never_last() {
        let mut rows = vec![row("c", -1, 1), row("b", 50, 1), row("a", 5, 1), row("d", 0, 1)];
        sort_keys(&mut rows, SortBy::Ttl);

        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_sort_by_size_and_key() {
        let mut rows = vec![row("b", 1, 10), row("a", 1, 10), row("c", 1, 99)];

        sort_keys(&mut rows, SortBy::Size);
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);

        sort_keys(&mut rows, SortBy::Key);
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sort_by_parse() {
        assert_eq!("ttl".parse::<SortBy>(), Ok(SortBy::Ttl));
        assert_eq!("SIZE".parse::<SortBy>(), Ok(SortBy::Size));
        assert_eq!("key".parse::<SortBy>(), Ok(SortBy::Key));
        assert!("random".parse::<SortBy>().is_err());
    }
}
