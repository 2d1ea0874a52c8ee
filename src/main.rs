//! mcadmin - A Memcached Administration Client
//!
//! This is the command-line front end. It parses arguments, sets up
//! logging, runs one subcommand against one server and prints the result.

use anyhow::{bail, Context};
use mcadmin::client::{ClientConfig, MemcachedClient};
use mcadmin::commands::Command;
use mcadmin::listing::{filter_keys, now_epoch, sort_keys, to_rows, KeyRow, SortBy};
use std::io::Write;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// What to do once connected
#[derive(Debug)]
enum Action {
    Get(String),
    Set { key: String, value: String, ttl: u32 },
    Delete(String),
    Exists(String),
    Flush,
    Stats(Option<String>),
    Keys { search: String, sort: SortBy },
    Meta(String),
    Version,
    Raw(String),
}

/// CLI configuration
struct Config {
    /// Client settings
    client: ClientConfig,
    /// Log at debug level
    verbose: bool,
    /// The subcommand
    action: Action,
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut client = ClientConfig::default();
        let mut verbose = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--server" | "-s" => {
                    let value = option_value(&args, i, "--server");
                    client.endpoint = value.parse().unwrap_or_else(|e| {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--timeout" | "-t" => {
                    let value = option_value(&args, i, "--timeout");
                    let secs = value
                        .parse::<f64>()
                        .ok()
                        .filter(|secs| secs.is_finite() && *secs >= 0.0)
                        .unwrap_or_else(|| {
                            eprintln!("Error: invalid timeout '{}'", value);
                            std::process::exit(1);
                        });
                    client.response_timeout = Duration::from_secs_f64(secs);
                    i += 2;
                }
                "--connect-timeout" => {
                    let value = option_value(&args, i, "--connect-timeout");
                    let ms: u64 = value.parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid connect timeout '{}'", value);
                        std::process::exit(1);
                    });
                    client.connect_timeout = Duration::from_millis(ms);
                    i += 2;
                }
                "--limit" => {
                    let value = option_value(&args, i, "--limit");
                    client.cachedump_limit = value.parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid cachedump limit '{}'", value);
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--verbose" => {
                    verbose = true;
                    i += 1;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-V" => {
                    println!("mcadmin version {}", mcadmin::VERSION);
                    std::process::exit(0);
                }
                arg if arg.starts_with('-') => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
                _ => break,
            }
        }

        let action = parse_action(&args[i..]).unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        });

        Config {
            client,
            verbose,
            action,
        }
    }
}

fn option_value<'a>(args: &'a [String], i: usize, name: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", name);
            std::process::exit(1);
        }
    }
}

fn parse_action(args: &[String]) -> anyhow::Result<Action> {
    let Some((name, rest)) = args.split_first() else {
        bail!("missing subcommand");
    };
    let arg = |index: usize, what: &str| -> anyhow::Result<String> {
        rest.get(index)
            .cloned()
            .with_context(|| format!("'{}' requires {}", name, what))
    };

    let action = match name.as_str() {
        "get" => Action::Get(arg(0, "a key")?),
        "set" => {
            let ttl = match rest.get(2) {
                Some(ttl) => ttl.parse().with_context(|| format!("invalid ttl '{}'", ttl))?,
                None => 0,
            };
            Action::Set {
                key: arg(0, "a key")?,
                value: arg(1, "a value")?,
                ttl,
            }
        }
        "delete" | "del" => Action::Delete(arg(0, "a key")?),
        "exists" => Action::Exists(arg(0, "a key")?),
        "flush" => Action::Flush,
        "stats" => Action::Stats(rest.first().cloned()),
        "keys" => {
            let mut search = String::new();
            let mut sort = SortBy::default();
            let mut j = 0;
            while j < rest.len() {
                if rest[j] == "--sort" {
                    let order = rest.get(j + 1).context("--sort requires a value")?;
                    sort = order.parse().map_err(anyhow::Error::msg)?;
                    j += 2;
                } else {
                    search = rest[j].clone();
                    j += 1;
                }
            }
            Action::Keys { search, sort }
        }
        "meta" => Action::Meta(arg(0, "a key")?),
        "version" => Action::Version,
        "raw" => {
            if rest.is_empty() {
                bail!("'raw' requires a command");
            }
            Action::Raw(rest.join(" "))
        }
        other => bail!("unknown subcommand '{}'", other),
    };

    Ok(action)
}

fn print_help() {
    println!(
        r#"
mcadmin - A Memcached Administration Client

USAGE:
    mcadmin [OPTIONS] <SUBCOMMAND> [ARGS]

OPTIONS:
    -s, --server <ENDPOINT>      host:port, host, unix:/path or /path (default: 127.0.0.1:11211)
    -t, --timeout <SECS>         Response timeout in seconds (default: 5)
        --connect-timeout <MS>   Connect timeout in milliseconds (default: 1000)
        --limit <N>              Keys per slab when listing with cachedump (default: 0 = all)
        --verbose                Log at debug level (RUST_LOG also works)
    -V, --version                Print version information
    -h, --help                   Print this help message

SUBCOMMANDS:
    get <key>                    Print a value
    set <key> <value> [ttl]      Store a value
    delete <key>                 Remove a key
    exists <key>                 Print whether a key exists
    flush                        Invalidate every item
    stats [section]              Print server statistics (items, slabs, sizes, ...)
    keys [search] [--sort key|ttl|size]
                                 List keys with remaining TTL and size
    meta <key>                   Print a key's metadata
    version                      Print the server version
    raw <command...>             Send a raw command; \r\n in the text becomes a line break

EXAMPLES:
    mcadmin stats
    mcadmin -s cache01:11211 keys session --sort ttl
    mcadmin set name Ariz 300
    mcadmin raw 'set greeting 0 0 5\r\nhello'
"#
    );
}

fn format_ttl(ttl: i64) -> String {
    if ttl < 0 {
        "never".to_string()
    } else {
        format!("{}s", ttl)
    }
}

/// Runs the action. Returns `false` when the outcome should set a failing
/// exit status (a miss, or a command the server refused).
async fn run(client: &mut MemcachedClient, action: Action) -> anyhow::Result<bool> {
    match action {
        Action::Get(key) => match client.get_bytes(&key).await? {
            Some(value) => {
                // Raw bytes, so binary values survive a pipe.
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&value)?;
                stdout.write_all(b"\n")?;
                Ok(true)
            }
            None => {
                eprintln!("NOT_FOUND");
                Ok(false)
            }
        },
        Action::Set { key, value, ttl } => {
            let stored = client.set(&key, &value, ttl).await?;
            println!("{}", if stored { "STORED" } else { "NOT_STORED" });
            Ok(stored)
        }
        Action::Delete(key) => {
            let deleted = client.delete(&key).await?;
            println!("{}", if deleted { "DELETED" } else { "NOT_FOUND" });
            Ok(deleted)
        }
        Action::Exists(key) => {
            let exists = client.exists(&key).await?;
            println!("{}", exists);
            Ok(exists)
        }
        Action::Flush => {
            let flushed = client.flush().await?;
            println!("{}", if flushed { "OK" } else { "FAILED" });
            Ok(flushed)
        }
        Action::Stats(section) => {
            let stats = client.get_server_stats(section.as_deref()).await?;
            let width = stats.keys().map(String::len).max().unwrap_or(0);
            for (name, value) in &stats {
                println!("{:width$}  {}", name, value, width = width);
            }
            Ok(!stats.is_empty())
        }
        Action::Keys { search, sort } => {
            let records = client.get_keys().await?;
            debug!(count = records.len(), "Keys listed");

            let mut rows = filter_keys(to_rows(&records, now_epoch()), &search);
            sort_keys(&mut rows, sort);

            let width = rows.iter().map(|r| r.key.len()).max().unwrap_or(3).max(3);
            println!("{:width$}  {:>10}  {:>10}  {:>10}", "KEY", "TTL", "IDLE", "SIZE", width = width);
            for row in &rows {
                println!(
                    "{:width$}  {:>10}  {:>10}  {:>10}",
                    row.key,
                    format_ttl(row.ttl),
                    format!("{}s", row.idle),
                    row.size,
                    width = width
                );
            }
            eprintln!("{} key(s)", rows.len());
            Ok(true)
        }
        Action::Meta(key) => match client.get_key_meta(&key).await? {
            Some(record) => {
                let row = KeyRow::from_record(&record, now_epoch());
                println!("key   {}", record.key);
                println!("ttl   {}", format_ttl(row.ttl));
                println!("idle  {}s", row.idle);
                println!("size  {}", record.size);
                if let Some(slab) = record.slab_class {
                    println!("slab  {}", slab);
                }
                Ok(true)
            }
            None => {
                eprintln!("NOT_FOUND");
                Ok(false)
            }
        },
        Action::Version => {
            let version = client.version().await?;
            if version.is_empty() {
                bail!("no version reply from {}", client.endpoint());
            }
            println!("{}", version);
            Ok(true)
        }
        Action::Raw(text) => {
            let command = Command::parse(&text)?;
            let response = client.execute(&command).await?;
            if !response.is_empty() {
                println!("{}", response.text());
            }
            if !response.is_complete() {
                eprintln!("warning: reply incomplete after {:?}", client.config().response_timeout);
            }
            Ok(response.is_complete() && !response.is_error())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let Config {
        client: client_config,
        verbose,
        action,
    } = Config::from_args();

    // Set up logging; stdout stays clean for command output
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    debug!(endpoint = %client_config.endpoint, action = ?action, "Starting");

    let mut client = MemcachedClient::new(client_config);
    let result = run(&mut client, action).await;
    client.disconnect();

    if !result.with_context(|| format!("{} failed", client.endpoint()))? {
        std::process::exit(1);
    }

    Ok(())
}
