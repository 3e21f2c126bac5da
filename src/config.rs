//! Configuration loading.
//!
//! The config file is INI-style: `[section]` headers followed by `key=value`
//! pairs, with `#` or `;` starting a comment line. Two sections are
//! recognized, `[options]` and `[mappings]`; the latter is required.
//!
//! Parsing is deliberately forgiving: a malformed mapping or worker entry is
//! logged and skipped, never fatal. The only fatal conditions are an
//! unreadable file and a missing `[mappings]` section.

use crate::{Error, Result, DEFAULT_BUFFER_SIZE};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use tracing::{debug, warn};

/// Reference text printed by `--help-config`.
pub const CONFIG_HELP: &str = "\
Config file reference

The file is split into [section] headers followed by key=value lines.
Lines starting with `#` or `;` are comments.

  [options]      (optional)

    pre_resolve_workers=0/1     [default 1]
        Resolve worker hostnames once, when the config is read. Saves a
        DNS lookup per connection; disable it if your DNS entries change
        and workers should follow them.

    buffer_size=BYTES           [default 4096]
        Chunk size for relay reads and writes.

  [mappings]     (required)

    localaddr:port=worker1:port,worker2:port...
        Listen on the interface `localaddr` (an IPv4 literal) on `port`,
        forwarding to the given workers.
        Ex: 192.168.1.100:80=10.10.0.1:5900,10.10.0.2:5900

    port=worker1:port,worker2:port...
        Same, listening on all interfaces.
        Ex: 80=10.10.0.1:5900,10.10.0.2:5900
";

/// A backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub addr: String,
    pub port: u16,
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A local listen endpoint and the ordered worker pool serving it.
///
/// Worker order matters: round-robin dispatch follows declaration order.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub local: SocketAddr,
    pub workers: Vec<Worker>,
}

/// Everything the balancer needs to run. Read once at startup, immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub buffer_size: usize,
    pub pre_resolve_workers: bool,
    pub mappings: Vec<Mapping>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            buffer_size: DEFAULT_BUFFER_SIZE,
            pre_resolve_workers: true,
            mappings: Vec::new(),
        }
    }
}

impl Config {
    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Config::parse(&raw)
    }

    /// Parse config text.
    ///
    /// `[options]` entries are applied before `[mappings]` regardless of the
    /// order they appear in, since `pre_resolve_workers` changes how worker
    /// addresses are interpreted.
    pub fn parse(raw: &str) -> Result<Config> {
        let mut options = Vec::new();
        let mut mapping_entries = Vec::new();
        let mut saw_mappings_section = false;

        let mut section = None;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                if name == "mappings" {
                    saw_mappings_section = true;
                }
                section = Some(name.to_string());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("skipping config line without `=`: `{line}`");
                continue;
            };
            let (key, value) = (key.trim().to_string(), value.trim().to_string());
            match section.as_deref() {
                Some("options") => options.push((key, value)),
                Some("mappings") => mapping_entries.push((key, value)),
                Some(other) => debug!("ignoring `{key}` in unrecognized section [{other}]"),
                None => warn!("skipping `{key}`: it appears before any [section] header"),
            }
        }

        if !saw_mappings_section {
            return Err(Error::MissingMappings);
        }

        let mut config = Config::default();
        for (key, value) in options {
            config.apply_option(&key, &value);
        }
        for (key, value) in mapping_entries {
            let Some(mapping) = parse_mapping(&key, &value, config.pre_resolve_workers) else {
                continue;
            };
            match config.mappings.iter_mut().find(|m| m.local == mapping.local) {
                Some(existing) => {
                    warn!("overriding existing mapping for {}", mapping.local);
                    *existing = mapping;
                }
                None => config.mappings.push(mapping),
            }
        }

        Ok(config)
    }

    /// Apply one `[options]` entry. An unknown key or unparseable value is
    /// warned about and the previous value kept.
    fn apply_option(&mut self, key: &str, value: &str) {
        match key {
            "pre_resolve_workers" => match value.to_ascii_lowercase().as_str() {
                "1" | "true" => self.pre_resolve_workers = true,
                "0" | "false" => self.pre_resolve_workers = false,
                _ => warn!(
                    "unknown value `{value}` for pre_resolve_workers, keeping `{}`",
                    self.pre_resolve_workers
                ),
            },
            "buffer_size" => match value.parse::<usize>() {
                Ok(size) if size > 0 => self.buffer_size = size,
                _ => warn!(
                    "invalid buffer_size `{value}`, keeping {} bytes",
                    self.buffer_size
                ),
            },
            _ => warn!("unknown option `{key}`"),
        }
    }
}

/// Parse one `[mappings]` entry. Returns `None` (after warning) when the
/// entry is unusable.
fn parse_mapping(key: &str, value: &str, pre_resolve: bool) -> Option<Mapping> {
    if value.is_empty() {
        warn!("skipping `{key}`: no workers defined");
        return None;
    }

    let local = match parse_local_endpoint(key) {
        Some(local) => local,
        None => {
            warn!("skipping invalid mapping `{key}`");
            return None;
        }
    };

    let mut workers = Vec::new();
    for token in value.split(',') {
        match parse_worker(token.trim(), pre_resolve) {
            Some(worker) => workers.push(worker),
            None => warn!("skipping invalid worker `{}` for {local}", token.trim()),
        }
    }
    if workers.is_empty() {
        warn!("skipping `{key}`: no usable workers");
        return None;
    }

    Some(Mapping { local, workers })
}

/// The left-hand side of a mapping: either `port` (listen on all
/// interfaces) or `ipv4:port`. Anything else, IPv6 literals included, is
/// malformed.
fn parse_local_endpoint(key: &str) -> Option<SocketAddr> {
    let parts = key.split(':').collect::<Vec<_>>();
    let (addr, port) = match parts.as_slice() {
        [port] => (Ipv4Addr::UNSPECIFIED, *port),
        [addr, port] => (addr.trim().parse::<Ipv4Addr>().ok()?, *port),
        _ => return None,
    };
    let port = parse_port(port.trim())?;
    Some(SocketAddr::new(IpAddr::V4(addr), port))
}

/// One `workerAddr:workerPort` token.
fn parse_worker(token: &str, pre_resolve: bool) -> Option<Worker> {
    let parts = token.split(':').collect::<Vec<_>>();
    let &[addr, port] = parts.as_slice() else {
        return None;
    };
    if addr.len() < 3 {
        return None;
    }
    let port = parse_port(port)?;

    let addr = if pre_resolve {
        resolve_ipv4(addr)?.to_string()
    } else {
        addr.to_string()
    };
    Some(Worker { addr, port })
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Resolve a worker host once, at config load. Dotted-quad literals pass
/// through the resolver without a DNS round trip.
fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    let addrs = (host, 0u16).to_socket_addrs().ok()?;
    addrs.into_iter().find_map(|addr| match addr.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(addr: &str, port: u16) -> Worker {
        Worker {
            addr: addr.to_string(),
            port,
        }
    }

    #[test]
    fn minimal_mapping_with_defaults() {
        let config = Config::parse("[mappings]\n9000=127.0.0.1:18001\n").unwrap();

        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.pre_resolve_workers);
        assert_eq!(config.mappings.len(), 1);
        assert_eq!(config.mappings[0].local, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.mappings[0].workers, vec![worker("127.0.0.1", 18001)]);
    }

    #[test]
    fn missing_mappings_section_is_fatal() {
        let err = Config::parse("[options]\nbuffer_size=1024\n").unwrap_err();
        assert!(matches!(err, Error::MissingMappings));
    }

    #[test]
    fn unreadable_file_is_fatal() {
        let err = Config::load("/definitely/not/here.cfg").unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn empty_mappings_section_is_accepted() {
        let config = Config::parse("[mappings]\n").unwrap();
        assert!(config.mappings.is_empty());
    }

    #[test]
    fn options_are_parsed() {
        let config = Config::parse(
            "[options]\npre_resolve_workers=false\nbuffer_size=8192\n[mappings]\n",
        )
        .unwrap();

        assert!(!config.pre_resolve_workers);
        assert_eq!(config.buffer_size, 8192);
    }

    #[test]
    fn options_apply_even_when_declared_after_mappings() {
        let config = Config::parse(
            "[mappings]\n9000=localhost:18001\n[options]\npre_resolve_workers=0\n",
        )
        .unwrap();

        // Resolution was off, so the hostname is kept verbatim.
        assert_eq!(config.mappings[0].workers, vec![worker("localhost", 18001)]);
    }

    #[test]
    #[tracing_test::traced_test]
    fn unknown_option_values_keep_the_previous_value() {
        let config = Config::parse(
            "[options]\npre_resolve_workers=maybe\nbuffer_size=-3\nbuffer_size=0\n[mappings]\n",
        )
        .unwrap();

        assert!(config.pre_resolve_workers);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(logs_contain("unknown value `maybe`"));
        assert!(logs_contain("invalid buffer_size"));
    }

    #[test]
    fn accepted_boolean_spellings() {
        for (value, expected) in [("1", true), ("true", true), ("0", false), ("FALSE", false)] {
            let raw = format!("[options]\npre_resolve_workers={value}\n[mappings]\n");
            let config = Config::parse(&raw).unwrap();
            assert_eq!(config.pre_resolve_workers, expected, "value {value:?}");
        }
    }

    #[test]
    fn local_address_form() {
        let config = Config::parse("[mappings]\n127.0.0.1:9000=127.0.0.1:18001\n").unwrap();
        assert_eq!(config.mappings[0].local, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    #[tracing_test::traced_test]
    fn malformed_mappings_are_skipped() {
        let config = Config::parse(
            "[mappings]\n\
             bad:port=127.0.0.1:18001\n\
             1:2:3=127.0.0.1:18001\n\
             0=127.0.0.1:18001\n\
             70000=127.0.0.1:18001\n\
             ::1:9000=127.0.0.1:18001\n\
             9000=127.0.0.1:18001\n",
        )
        .unwrap();

        assert_eq!(config.mappings.len(), 1);
        assert_eq!(config.mappings[0].local, "0.0.0.0:9000".parse().unwrap());
        assert!(logs_contain("skipping invalid mapping `bad:port`"));
    }

    #[test]
    fn invalid_workers_are_skipped_but_mapping_survives() {
        let config = Config::parse(
            "[mappings]\n9000=ab:18001,127.0.0.1:notaport,127.0.0.1:0,127.0.0.1,127.0.0.1:18001\n",
        )
        .unwrap();

        assert_eq!(config.mappings[0].workers, vec![worker("127.0.0.1", 18001)]);
    }

    #[test]
    #[tracing_test::traced_test]
    fn mapping_with_no_usable_workers_is_dropped() {
        let config = Config::parse("[mappings]\n9000=ab:1,xy:2\n").unwrap();
        assert!(config.mappings.is_empty());
        assert!(logs_contain("no usable workers"));
    }

    #[test]
    fn empty_worker_list_skips_the_mapping() {
        let config = Config::parse("[mappings]\n9000=\n").unwrap();
        assert!(config.mappings.is_empty());
    }

    #[test]
    fn whitespace_around_workers_is_stripped() {
        let config =
            Config::parse("[mappings]\n9000 = 127.0.0.1:18001 , 127.0.0.2:18002\n").unwrap();

        assert_eq!(
            config.mappings[0].workers,
            vec![worker("127.0.0.1", 18001), worker("127.0.0.2", 18002)]
        );
    }

    #[test]
    #[tracing_test::traced_test]
    fn duplicate_mappings_overwrite() {
        let config = Config::parse(
            "[mappings]\n9000=127.0.0.1:18001\n9000=127.0.0.1:18002\n",
        )
        .unwrap();

        assert_eq!(config.mappings.len(), 1);
        assert_eq!(config.mappings[0].workers, vec![worker("127.0.0.1", 18002)]);
        assert!(logs_contain("overriding existing mapping"));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let config = Config::parse(
            "# top comment\n\n[mappings]\n; another\n9000=127.0.0.1:18001\n",
        )
        .unwrap();
        assert_eq!(config.mappings.len(), 1);
    }

    #[test]
    fn pre_resolution_turns_hostnames_into_addresses() {
        let config = Config::parse("[mappings]\n9000=localhost:18001\n").unwrap();
        assert_eq!(config.mappings[0].workers, vec![worker("127.0.0.1", 18001)]);
    }

    #[test]
    fn worker_ordering_is_preserved() {
        let config = Config::parse(
            "[mappings]\n9000=127.0.0.3:3,127.0.0.1:1,127.0.0.2:2\n",
        )
        .unwrap();

        let ports: Vec<u16> = config.mappings[0].workers.iter().map(|w| w.port).collect();
        assert_eq!(ports, vec![3, 1, 2]);
    }
}
