//! In-process fake memcached for integration tests.
//!
//! Speaks enough of the text protocol to exercise the client: storage
//! verbs, `get`, `delete`, `touch`, `incr`/`decr`, `flush_all`, `version`,
//! `stats` (plain, `items`, `cachedump`), `lru_crawler metadump all` and
//! `me`. Items land in slab 1 when small and slab 5 otherwise.

#![allow(dead_code)]

use mcadmin::client::{ClientConfig, MemcachedClient};
use mcadmin::ServerEndpoint;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Largest value stored in slab 1
const SMALL_ITEM_LIMIT: usize = 96;

#[derive(Debug, Clone)]
pub struct FakeConfig {
    /// Reported by `version`; below 1.4.31 `lru_crawler` is unknown
    pub version: String,
    /// Read commands but never answer
    pub silent: bool,
    /// Answer `lru_crawler metadump` with a BUSY error
    pub crawler_busy: bool,
    /// Report every cachedump item twice
    pub duplicate_dumps: bool,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            version: "1.6.21".to_string(),
            silent: false,
            crawler_busy: false,
            duplicate_dumps: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Item {
    value: Vec<u8>,
    flags: u32,
    /// Absolute expiry, 0 for none
    exp: i64,
    last_access: i64,
}

impl Item {
    fn slab(&self) -> u32 {
        if self.value.len() <= SMALL_ITEM_LIMIT {
            1
        } else {
            5
        }
    }

    fn expired(&self, now: i64) -> bool {
        self.exp != 0 && self.exp <= now
    }
}

struct State {
    config: FakeConfig,
    items: Mutex<HashMap<String, Item>>,
    hang_up: Notify,
}

pub struct FakeServer {
    pub addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        Self::with_config(FakeConfig::default()).await
    }

    pub async fn with_version(version: &str) -> Self {
        Self::with_config(FakeConfig {
            version: version.to_string(),
            ..FakeConfig::default()
        })
        .await
    }

    pub async fn with_config(config: FakeConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            config,
            items: Mutex::new(HashMap::new()),
            hang_up: Notify::new(),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state, task }
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::tcp(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.endpoint()).with_response_timeout(Duration::from_secs(2))
    }

    pub fn client(&self) -> MemcachedClient {
        MemcachedClient::new(self.config())
    }

    /// Closes every open client connection, as an idle timeout would.
    pub fn hang_up(&self) {
        self.state.hang_up.notify_waiters();
    }

    pub fn item_count(&self) -> usize {
        self.state.items.lock().unwrap().len()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn version_at_least(version: &str, major: u32, minor: u32, patch: u32) -> bool {
    let parts: Vec<u32> = version
        .split('.')
        .map(|p| p.parse().unwrap_or(0))
        .collect();
    let get = |i: usize| parts.get(i).copied().unwrap_or(0);
    (get(0), get(1), get(2)) >= (major, minor, patch)
}

async fn serve(stream: TcpStream, state: Arc<State>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let mut line = String::new();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read,
            _ = state.hang_up.notified() => return,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        if state.config.silent {
            continue;
        }

        let line = line.trim_end_matches(['\r', '\n']).to_string();
        let Some(reply) = handle(&line, &mut reader, &state).await else {
            return;
        };

        if !reply.is_empty() && write.write_all(&reply).await.is_err() {
            return;
        }
    }
}

/// Produces the reply for one command line, or `None` to close.
async fn handle(line: &str, reader: &mut BufReader<OwnedReadHalf>, state: &State) -> Option<Vec<u8>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(verb) = tokens.first() else {
        return Some(b"ERROR\r\n".to_vec());
    };
    let noreply = wants_noreply(&tokens);
    let now = now();

    let reply = match *verb {
        "set" | "add" | "replace" | "append" | "prepend" => {
            let (Some(key), Some(flags), Some(ttl), Some(len)) =
                (tokens.get(1), tokens.get(2), tokens.get(3), tokens.get(4))
            else {
                return Some(b"ERROR\r\n".to_vec());
            };
            let len: usize = len.parse().ok()?;
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data).await.ok()?;
            if &data[len..] != b"\r\n" {
                return Some(b"CLIENT_ERROR bad data chunk\r\nERROR\r\n".to_vec());
            }
            data.truncate(len);

            let ttl: i64 = ttl.parse().unwrap_or(0);
            let item = Item {
                value: data,
                flags: flags.parse().unwrap_or(0),
                exp: if ttl == 0 { 0 } else { now + ttl },
                last_access: now,
            };

            let mut items = state.items.lock().unwrap();
            let exists = items.get(*key).is_some_and(|i| !i.expired(now));
            let stored = match *verb {
                "set" => {
                    items.insert(key.to_string(), item);
                    true
                }
                "add" if !exists => {
                    items.insert(key.to_string(), item);
                    true
                }
                "replace" if exists => {
                    items.insert(key.to_string(), item);
                    true
                }
                "append" | "prepend" if exists => {
                    if let Some(existing) = items.get_mut(*key) {
                        if *verb == "append" {
                            existing.value.extend_from_slice(&item.value);
                        } else {
                            let mut value = item.value;
                            value.extend_from_slice(&existing.value);
                            existing.value = value;
                        }
                    }
                    true
                }
                _ => false,
            };

            if stored {
                b"STORED\r\n".to_vec()
            } else {
                b"NOT_STORED\r\n".to_vec()
            }
        }
        "get" | "gets" => {
            let mut items = state.items.lock().unwrap();
            let mut reply = Vec::new();
            for key in &tokens[1..] {
                if let Some(item) = items.get_mut(*key).filter(|i| !i.expired(now)) {
                    item.last_access = now;
                    reply.extend_from_slice(
                        format!("VALUE {} {} {}\r\n", key, item.flags, item.value.len()).as_bytes(),
                    );
                    reply.extend_from_slice(&item.value);
                    reply.extend_from_slice(b"\r\n");
                }
            }
            reply.extend_from_slice(b"END\r\n");
            reply
        }
        "delete" => {
            let removed = tokens
                .get(1)
                .and_then(|key| state.items.lock().unwrap().remove(*key))
                .filter(|i| !i.expired(now));
            match removed {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        "touch" => {
            let (Some(key), Some(ttl)) = (tokens.get(1), tokens.get(2)) else {
                return Some(b"ERROR\r\n".to_vec());
            };
            let ttl: i64 = ttl.parse().unwrap_or(0);
            let mut items = state.items.lock().unwrap();
            match items.get_mut(*key).filter(|i| !i.expired(now)) {
                Some(item) => {
                    item.exp = if ttl == 0 { 0 } else { now + ttl };
                    b"TOUCHED\r\n".to_vec()
                }
                None => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        "incr" | "decr" => {
            let (Some(key), Some(delta)) = (tokens.get(1), tokens.get(2)) else {
                return Some(b"ERROR\r\n".to_vec());
            };
            let delta: u64 = delta.parse().unwrap_or(0);
            let mut items = state.items.lock().unwrap();
            match items.get_mut(*key).filter(|i| !i.expired(now)) {
                Some(item) => {
                    let current: u64 = String::from_utf8_lossy(&item.value).parse().unwrap_or(0);
                    let next = if *verb == "incr" {
                        current.wrapping_add(delta)
                    } else {
                        current.saturating_sub(delta)
                    };
                    item.value = next.to_string().into_bytes();
                    format!("{}\r\n", next).into_bytes()
                }
                None => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        "flush_all" => {
            state.items.lock().unwrap().clear();
            b"OK\r\n".to_vec()
        }
        "version" => format!("VERSION {}\r\n", state.config.version).into_bytes(),
        "stats" => stats_reply(&tokens[1..], state, now),
        "lru_crawler" => {
            if !version_at_least(&state.config.version, 1, 4, 31) {
                b"ERROR\r\n".to_vec()
            } else if state.config.crawler_busy {
                b"BUSY currently processing crawler request\r\n".to_vec()
            } else if tokens.get(1) == Some(&"metadump") {
                let items = state.items.lock().unwrap();
                let mut reply = Vec::new();
                for (key, item) in items.iter().filter(|(_, i)| !i.expired(now)) {
                    let exp = if item.exp == 0 { -1 } else { item.exp };
                    reply.extend_from_slice(
                        format!(
                            "key={} exp={} la={} cas=1 fetch=no cls={} size={}\r\n",
                            urlencoding::encode(key),
                            exp,
                            item.last_access,
                            item.slab(),
                            item.value.len()
                        )
                        .as_bytes(),
                    );
                }
                reply.extend_from_slice(b"END\r\n");
                reply
            } else {
                b"CLIENT_ERROR bad command line format\r\n".to_vec()
            }
        }
        "me" => {
            let items = state.items.lock().unwrap();
            match tokens
                .get(1)
                .and_then(|key| items.get(*key).map(|item| (key, item)))
                .filter(|(_, i)| !i.expired(now))
            {
                Some((key, item)) => {
                    let exp = if item.exp == 0 { -1 } else { item.exp - now };
                    format!(
                        "ME {} exp={} la={} cas=1 fetch=no cls={} size={}\r\n",
                        key,
                        exp,
                        now - item.last_access,
                        item.slab(),
                        item.value.len()
                    )
                    .into_bytes()
                }
                None => b"EN\r\n".to_vec(),
            }
        }
        "quit" => return None,
        _ => b"ERROR\r\n".to_vec(),
    };

    if noreply {
        Some(Vec::new())
    } else {
        Some(reply)
    }
}

/// `noreply` counts only past the verb's fixed arguments, so a key named
/// `noreply` still gets its reply.
fn wants_noreply(tokens: &[&str]) -> bool {
    let fixed = match tokens.first().copied() {
        Some("set" | "add" | "replace" | "append" | "prepend") => 5,
        Some("delete") => 2,
        Some("touch" | "incr" | "decr") => 3,
        Some("flush_all") => 1,
        _ => return false,
    };
    tokens.len() > fixed && tokens.last() == Some(&"noreply")
}

fn stats_reply(args: &[&str], state: &State, now: i64) -> Vec<u8> {
    let items = state.items.lock().unwrap();
    let live: Vec<(&String, &Item)> = items.iter().filter(|(_, i)| !i.expired(now)).collect();
    let mut reply = String::new();

    match args.first().copied() {
        None => {
            reply.push_str("STAT pid 4242\r\n");
            reply.push_str("STAT uptime 360\r\n");
            reply.push_str(&format!("STAT version {}\r\n", state.config.version));
            reply.push_str("STAT rusage_user 0.125000\r\n");
            reply.push_str(&format!("STAT curr_items {}\r\n", live.len()));
        }
        Some("items") => {
            for slab in [1u32, 5] {
                let count = live.iter().filter(|(_, i)| i.slab() == slab).count();
                if count > 0 {
                    reply.push_str(&format!("STAT items:{}:number {}\r\n", slab, count));
                    reply.push_str(&format!("STAT items:{}:age 60\r\n", slab));
                }
            }
        }
        Some("cachedump") => {
            let slab: u32 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            let limit: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
            let repeats = if state.config.duplicate_dumps { 2 } else { 1 };

            let in_slab: Vec<_> = live.iter().filter(|(_, i)| i.slab() == slab).collect();
            let take = if limit == 0 { in_slab.len() } else { limit };
            for _ in 0..repeats {
                for (key, item) in in_slab.iter().take(take) {
                    reply.push_str(&format!("ITEM {} [{} b; {} s]\r\n", key, item.value.len(), item.exp));
                }
            }
        }
        Some("slabs") => {
            reply.push_str("STAT 1:chunk_size 96\r\n");
            reply.push_str("STAT active_slabs 1\r\n");
        }
        Some(_) => return b"ERROR\r\n".to_vec(),
    }

    reply.push_str("END\r\n");
    reply.into_bytes()
}
