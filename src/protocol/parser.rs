//! Response Parsers
//!
//! This module turns framed replies into structured values. Every parser
//! takes the raw reply bytes (with or without the final CRLF) and never
//! fails: a reply that does not have the expected shape yields `None` or an
//! empty collection, and a malformed line inside a bulk listing is skipped
//! while the rest of the listing is kept.
//!
//! ## Design Philosophy
//!
//! 1. **Pure**: Parsers do no I/O and never consult the clock. Times are
//!    returned exactly as the server reported them.
//! 2. **Tolerant**: A partial reply (the response ceiling expired) parses
//!    to whatever complete lines it contains.
//! 3. **Fresh**: Each call builds and returns a new collection.
//!
//! ## Reply Shapes
//!
//! ```text
//! get        VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\nEND\r\n
//! stats      STAT <name> <value>\r\n ... END\r\n
//! metadump   key=<urlencoded> exp=<epoch|-1> la=<epoch> ... size=<n>\r\n ... END\r\n
//! me         ME <key> exp=<secs|-1> la=<secs> cas=<n> fetch=<yes|no> cls=<n> size=<n>\r\n
//! cachedump  ITEM <key> [<size> b; <epoch> s]\r\n ... END\r\n
//! version    VERSION <version>\r\n
//! ```

use crate::protocol::frame::find_crlf;
use crate::protocol::types::{
    Expiry, KeyRecord, ServerStats, StatValue, TimeBase, CRLF,
};
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ops::Range;
use tracing::trace;

/// Legacy value standing for a serialized `false`/`null`, shown as empty
const EMPTY_VALUE_SENTINEL: &[u8] = b"N;";

/// Parses a `get`/`gets` reply for a single key.
///
/// Returns `None` when the reply has no `VALUE` block (the key does not
/// exist) or the block is truncated. A stored value of exactly `N;` is
/// reported as the empty string. Non-UTF-8 bytes are replaced; use
/// [`parse_get_bytes`] for binary values.
pub fn parse_get(raw: &[u8]) -> Option<String> {
    let range = value_range(raw)?;
    Some(String::from_utf8_lossy(&raw[range]).into_owned())
}

/// Like [`parse_get`], but returns the value bytes untouched, sharing the
/// reply's buffer.
pub fn parse_get_bytes(raw: &Bytes) -> Option<Bytes> {
    let range = value_range(raw)?;
    Some(raw.slice(range))
}

/// Locates the data block of the first `VALUE` entry. The legacy `N;`
/// value maps to an empty range.
fn value_range(raw: &[u8]) -> Option<Range<usize>> {
    let header_end = find_crlf(raw)?;
    let header = std::str::from_utf8(&raw[..header_end]).ok()?;

    let mut parts = header.split(' ');
    let (Some("VALUE"), Some(_key), Some(_flags), Some(len)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    let len: usize = len.parse().ok()?;

    let start = header_end + CRLF.len();
    let end = start.checked_add(len)?;
    let data = raw.get(start..end)?;

    if data == EMPTY_VALUE_SENTINEL {
        return Some(start..start);
    }

    Some(start..end)
}

/// Parses a `stats [section]` reply.
///
/// Each `STAT <name> <value>` line becomes one entry. Values that parse as
/// integers are stored as [`StatValue::Int`]; everything else, including
/// floats and multi-word values, is kept as text.
pub fn parse_stats(raw: &[u8]) -> ServerStats {
    let mut stats = ServerStats::new();

    for line in lines(raw) {
        let line = String::from_utf8_lossy(line);
        let mut parts = line.splitn(3, ' ');

        match (parts.next(), parts.next(), parts.next()) {
            (Some("STAT"), Some(name), Some(value)) => {
                stats.insert(name.to_string(), StatValue::parse(value));
            }
            (Some("END"), None, None) => {}
            _ => trace!(line = %line, "Skipping non-stat line"),
        }
    }

    stats
}

/// Parses an `lru_crawler metadump` reply into one record per key.
///
/// Keys are percent-decoded. `exp=-1` becomes [`Expiry::Never`]; any other
/// `exp` is the absolute Unix timestamp the server reported, unmodified.
pub fn parse_metadump(raw: &[u8]) -> Vec<KeyRecord> {
    let mut records = Vec::new();

    for line in lines(raw) {
        if line.is_empty() || line == b"END" {
            continue;
        }

        let line = String::from_utf8_lossy(line);
        match parse_metadump_line(&line) {
            Some(record) => records.push(record),
            None => trace!(line = %line, "Skipping malformed metadump line"),
        }
    }

    records
}

/// Parses one `key=... exp=... la=... size=...` line.
pub fn parse_metadump_line(line: &str) -> Option<KeyRecord> {
    let mut key = None;
    let mut record = KeyRecord::new(String::new(), TimeBase::Absolute);

    for token in line.split(' ').filter(|t| !t.is_empty()) {
        let (name, value) = token.split_once('=')?;
        if name == "key" {
            key = Some(decode_key(value).into_owned());
        } else {
            apply_meta_field(&mut record, name, value)?;
        }
    }

    record.key = key.filter(|k| !k.is_empty())?;
    Some(record)
}

/// Parses an `me <key>` reply.
///
/// Strips the `ME <key> ` prefix and reads the remaining fields with the
/// same token rules as a metadump line. `me` reports `exp` as seconds
/// remaining and `la` as seconds since last access, so the record carries
/// [`TimeBase::Relative`]. Returns `None` for `EN` and anything else that
/// is not an `ME` line.
pub fn parse_key_meta(raw: &[u8]) -> Option<KeyRecord> {
    let line = lines(raw).next()?;
    let line = String::from_utf8_lossy(line);
    let rest = line.strip_prefix("ME ")?;

    let (key, fields) = match rest.split_once(' ') {
        Some((key, fields)) => (key, fields),
        None => (rest, ""),
    };
    if key.is_empty() {
        return None;
    }

    let mut record = KeyRecord::new(key, TimeBase::Relative);
    for token in fields.split(' ').filter(|t| !t.is_empty()) {
        let (name, value) = token.split_once('=')?;
        apply_meta_field(&mut record, name, value)?;
    }

    Some(record)
}

/// Applies one `name=value` field. Unknown fields are ignored; a known
/// field whose value does not parse rejects the whole line.
fn apply_meta_field(record: &mut KeyRecord, name: &str, value: &str) -> Option<()> {
    match name {
        "exp" => record.expiry = Expiry::from_raw(value.parse().ok()?),
        "la" => record.last_access = value.parse().ok()?,
        "size" => record.size = value.parse().ok()?,
        "cls" => record.slab_class = Some(value.parse().ok()?),
        _ => {}
    }
    Some(())
}

/// Parses a `stats cachedump <slab> <limit>` reply.
///
/// Lines look like `ITEM <key> [<size> b; <expiry> s]`. An expiry of `0`
/// means the item never expires; other values are absolute timestamps.
pub fn parse_cachedump(raw: &[u8], slab: u32) -> Vec<KeyRecord> {
    let mut records = Vec::new();

    for line in lines(raw) {
        if line.is_empty() || line == b"END" {
            continue;
        }

        let line = String::from_utf8_lossy(line);
        match parse_cachedump_line(&line, slab) {
            Some(record) => records.push(record),
            None => trace!(line = %line, "Skipping malformed cachedump line"),
        }
    }

    records
}

fn parse_cachedump_line(line: &str, slab: u32) -> Option<KeyRecord> {
    let rest = line.strip_prefix("ITEM ")?;
    let (key, info) = rest.split_once(' ')?;
    let info = info.strip_prefix('[')?.strip_suffix(']')?;
    let (size, exp) = info.split_once("; ")?;

    let size = size.strip_suffix(" b")?.trim().parse().ok()?;
    let exp: i64 = exp.strip_suffix(" s")?.trim().parse().ok()?;

    let mut record = KeyRecord::new(key, TimeBase::Absolute);
    record.size = size;
    record.slab_class = Some(slab);
    record.expiry = if exp == 0 {
        Expiry::Never
    } else {
        Expiry::At(exp)
    };
    Some(record)
}

/// Collects the slab class ids named in a `stats items` reply, ascending
/// and without duplicates.
pub fn parse_item_slabs(raw: &[u8]) -> Vec<u32> {
    let slabs: BTreeSet<u32> = parse_stats(raw)
        .keys()
        .filter_map(|name| {
            name.strip_prefix("items:")?
                .split(':')
                .next()?
                .parse()
                .ok()
        })
        .collect();

    slabs.into_iter().collect()
}

/// Extracts the version string from `VERSION <version>`.
pub fn parse_version(raw: &[u8]) -> Option<String> {
    let line = lines(raw).next()?;
    let line = String::from_utf8_lossy(line);
    let version = line.strip_prefix("VERSION ")?.trim();
    (!version.is_empty()).then(|| version.to_string())
}

/// Parses the reply to `incr`/`decr`: the new value, or `None` for
/// `NOT_FOUND` and errors.
pub fn parse_counter(raw: &[u8]) -> Option<u64> {
    let line = lines(raw).next()?;
    std::str::from_utf8(line).ok()?.trim().parse().ok()
}

/// Iterates over the lines of a reply, without their terminators.
fn lines(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    let raw = raw.strip_suffix(CRLF).unwrap_or(raw);
    raw.split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

/// Decodes a percent-encoded key, falling back to the raw text.
pub fn decode_key(raw: &str) -> Cow<'_, str> {
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_hit() {
        let raw = b"VALUE greeting 0 5\r\nhello\r\nEND\r\n";
        assert_eq!(parse_get(raw), Some("hello".to_string()));
    }

    #[test]
    fn test_parse_get_trimmed_reply() {
        let raw = b"VALUE greeting 0 5\r\nhello\r\nEND";
        assert_eq!(parse_get(raw), Some("hello".to_string()));
    }

    #[test]
    fn test_parse_get_miss() {
        assert_eq!(parse_get(b"END\r\n"), None);
        assert_eq!(parse_get(b"END"), None);
        assert_eq!(parse_get(b""), None);
        assert_eq!(parse_get(b"SERVER_ERROR out of memory\r\n"), None);
    }

    #[test]
    fn test_parse_get_empty_and_sentinel() {
        assert_eq!(parse_get(b"VALUE k 0 0\r\n\r\nEND\r\n"), Some(String::new()));
        assert_eq!(parse_get(b"VALUE k 0 2\r\nN;\r\nEND\r\n"), Some(String::new()));
    }

    #[test]
    fn test_parse_get_value_with_line_breaks() {
        let raw = b"VALUE k 0 9\r\nOK\r\nEND\r\n\r\nEND\r\n";
        assert_eq!(parse_get(raw), Some("OK\r\nEND\r\n".to_string()));
    }

    #[test]
    fn test_parse_get_bytes_keeps_binary() {
        let raw = Bytes::from_static(b"VALUE blob 0 4\r\n\xff\x00\xfe\n\r\nEND\r\n");
        assert_eq!(
            parse_get_bytes(&raw),
            Some(Bytes::from_static(b"\xff\x00\xfe\n"))
        );
        assert_eq!(
            parse_get_bytes(&Bytes::from_static(b"VALUE k 0 2\r\nN;\r\nEND\r\n")),
            Some(Bytes::new())
        );
        assert_eq!(parse_get_bytes(&Bytes::from_static(b"END\r\n")), None);
    }

    #[test]
    fn test_parse_get_with_cas() {
        let raw = b"VALUE k 3 2 77\r\nhi\r\nEND\r\n";
        assert_eq!(parse_get(raw), Some("hi".to_string()));
    }

    #[test]
    fn test_parse_get_truncated() {
        assert_eq!(parse_get(b"VALUE k 0 10\r\nhello"), None);
        assert_eq!(parse_get(b"VALUE k 0 abc\r\nhello\r\nEND\r\n"), None);
    }

    #[test]
    fn test_parse_stats() {
        let raw = b"STAT pid 1234\r\nSTAT rusage_user 0.123456\r\nSTAT version 1.6.21\r\nSTAT libevent 2.1.12-stable\r\nEND\r\n";
        let stats = parse_stats(raw);

        assert_eq!(stats.len(), 4);
        assert_eq!(stats.get("pid"), Some(&StatValue::Int(1234)));
        assert_eq!(
            stats.get("rusage_user"),
            Some(&StatValue::Text("0.123456".to_string()))
        );
        assert_eq!(
            stats.get("version"),
            Some(&StatValue::Text("1.6.21".to_string()))
        );
    }

    #[test]
    fn test_parse_stats_skips_noise() {
        let raw = b"STAT curr_items 3\r\ngarbage line\r\nSTAT\r\nEND\r\n";
        let stats = parse_stats(raw);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["curr_items"].as_int(), Some(3));
    }

    #[test]
    fn test_parse_stats_multi_word_value() {
        let raw = b"STAT ext_path /var/cache/mc 64\r\nEND\r\n";
        let stats = parse_stats(raw);
        assert_eq!(stats["ext_path"].as_text(), Some("/var/cache/mc 64"));
    }

    #[test]
    fn test_parse_metadump() {
        let raw = b"key=memcached%2Fmurmur3_hash.c exp=1687216956 la=1687216656 cas=259502 fetch=yes cls=17 size=2912\r\n\
key=session exp=-1 la=1687216000 cas=1 fetch=no cls=1 size=70\r\n\
END\r\n";
        let records = parse_metadump(raw);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "memcached/murmur3_hash.c");
        assert_eq!(records[0].expiry, Expiry::At(1687216956));
        assert_eq!(records[0].last_access, 1687216656);
        assert_eq!(records[0].size, 2912);
        assert_eq!(records[0].slab_class, Some(17));
        assert_eq!(records[0].time_base, TimeBase::Absolute);

        assert_eq!(records[1].key, "session");
        assert_eq!(records[1].expiry, Expiry::Never);
        assert_eq!(records[1].expiry.as_raw(), -1);
    }

    #[test]
    fn test_parse_metadump_skips_corrupt_lines() {
        let raw = b"key=a exp=-1 la=1 size=10\r\n\
key=b exp=soon la=1 size=10\r\n\
exp=-1 la=1 size=10\r\n\
not a metadump line\r\n\
key=c exp=100 la=1 size=12\r\n\
END\r\n";
        let records = parse_metadump(raw);
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn test_parse_metadump_empty() {
        assert!(parse_metadump(b"END\r\n").is_empty());
        assert!(parse_metadump(b"").is_empty());
    }

    #[test]
    fn test_parse_metadump_partial_reply() {
        // The ceiling expired mid-line: complete lines survive, the torn
        // line is dropped.
        let raw = b"key=a exp=-1 la=1 size=10\r\nkey=b exp=-1 la=1 si";
        let records = parse_metadump(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "a");
    }

    #[test]
    fn test_parse_key_meta() {
        let raw = b"ME user:1 exp=3590 la=4 cas=12 fetch=yes cls=2 size=96\r\n";
        let record = parse_key_meta(raw).unwrap();

        assert_eq!(record.key, "user:1");
        assert_eq!(record.expiry, Expiry::At(3590));
        assert_eq!(record.last_access, 4);
        assert_eq!(record.size, 96);
        assert_eq!(record.slab_class, Some(2));
        assert_eq!(record.time_base, TimeBase::Relative);
    }

    #[test]
    fn test_parse_key_meta_never_expires() {
        let record = parse_key_meta(b"ME k exp=-1 la=0 cas=1 fetch=no cls=1 size=60").unwrap();
        assert!(record.expiry.is_never());
    }

    #[test]
    fn test_parse_key_meta_miss() {
        assert_eq!(parse_key_meta(b"EN\r\n"), None);
        assert_eq!(parse_key_meta(b"ERROR\r\n"), None);
        assert_eq!(parse_key_meta(b""), None);
    }

    #[test]
    fn test_parse_cachedump() {
        let raw = b"ITEM user:1 [5 b; 1687216956 s]\r\nITEM forever [12 b; 0 s]\r\nITEM broken\r\nEND\r\n";
        let records = parse_cachedump(raw, 3);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "user:1");
        assert_eq!(records[0].size, 5);
        assert_eq!(records[0].expiry, Expiry::At(1687216956));
        assert_eq!(records[0].slab_class, Some(3));
        assert_eq!(records[1].expiry, Expiry::Never);
    }

    #[test]
    fn test_parse_item_slabs() {
        let raw = b"STAT items:1:number 5\r\nSTAT items:1:age 10\r\nSTAT items:12:number 1\r\nSTAT items:3:number 2\r\nEND\r\n";
        assert_eq!(parse_item_slabs(raw), vec![1, 3, 12]);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version(b"VERSION 1.6.21\r\n"), Some("1.6.21".to_string()));
        assert_eq!(parse_version(b"VERSION 1.4.5"), Some("1.4.5".to_string()));
        assert_eq!(parse_version(b"ERROR\r\n"), None);
        assert_eq!(parse_version(b""), None);
    }

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter(b"42\r\n"), Some(42));
        assert_eq!(parse_counter(b"NOT_FOUND\r\n"), None);
        assert_eq!(parse_counter(b"CLIENT_ERROR invalid numeric delta argument\r\n"), None);
    }

    #[test]
    fn test_decode_key() {
        assert_eq!(decode_key("a%20b"), "a b");
        assert_eq!(decode_key("plain"), "plain");
        assert_eq!(decode_key("bad%FF"), "bad%FF");
    }
}
