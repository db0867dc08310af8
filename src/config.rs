use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `SPACEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Missing or unparseable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("SPACEBOOK_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "SPACEBOOK_PORT").unwrap_or(defaults.port),
            data_dir: lookup("SPACEBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parsed::<usize>(&lookup, "SPACEBOOK_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "SPACEBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("SPACEBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("SPACEBOOK_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&lookup, "SPACEBOOK_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("spacebook.wal")
    }
}
