//! Configuration (C14): a line-based `<key> <value>` config file reader
//! plus `clap` CLI overrides, ported from `original_source/config/config.go`'s
//! shape (SPEC_FULL.md §4.12) — not a TOML/YAML layer, since the file
//! format itself is plain `key value` lines.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 6389;
const DEFAULT_DATABASES: usize = 16;
const DEFAULT_REPL_TIMEOUT_SECS: u64 = 60;

/// The recognized config-file keys (SPEC_FULL.md §4.12), with the
/// `yes`/anything-else boolean convention and comma-separated-list
/// convention the original source uses.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub appendonly: bool,
    pub appendfilename: String,
    pub maxclients: Option<u32>,
    pub requirepass: Option<String>,
    pub databases: usize,
    pub dbfilename: String,
    pub masterauth: Option<String>,
    pub slave_announce_port: Option<u16>,
    pub slave_announce_ip: Option<String>,
    pub repl_timeout: Duration,
    pub peers: Vec<String>,
    pub myself: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            appendonly: false,
            appendfilename: "appendonly.aof".to_string(),
            maxclients: None,
            requirepass: None,
            databases: DEFAULT_DATABASES,
            dbfilename: "dump.rdb".to_string(),
            masterauth: None,
            slave_announce_port: None,
            slave_announce_ip: None,
            repl_timeout: Duration::from_secs(DEFAULT_REPL_TIMEOUT_SECS),
            peers: Vec::new(),
            myself: None,
        }
    }
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Parse a line-based config file: one `<key> <value>` pair per line,
    /// `#`-prefixed comments and blank lines ignored.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config = Config::default();
        for (lineno, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                anyhow::bail!("{}:{}: malformed config line: {raw_line:?}", path.display(), lineno + 1);
            };
            config.apply(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        fn is_yes(v: &str) -> bool {
            v.eq_ignore_ascii_case("yes")
        }
        fn csv(v: &str) -> Vec<String> {
            v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
        }

        match key.to_ascii_lowercase().as_str() {
            "bind" => self.bind = value.to_string(),
            "port" => self.port = value.parse()?,
            "appendonly" => self.appendonly = is_yes(value),
            "appendfilename" => self.appendfilename = value.to_string(),
            "maxclients" => self.maxclients = Some(value.parse()?),
            "requirepass" => self.requirepass = Some(value.to_string()),
            "databases" => self.databases = value.parse()?,
            "dbfilename" => self.dbfilename = value.to_string(),
            "masterauth" => self.masterauth = Some(value.to_string()),
            "slave-announce-port" => self.slave_announce_port = Some(value.parse()?),
            "slave-announce-ip" => self.slave_announce_ip = Some(value.to_string()),
            "repl-timeout" => self.repl_timeout = Duration::from_secs(value.parse()?),
            "peers" => self.peers = csv(value),
            "self" => self.myself = Some(value.to_string()),
            other => anyhow::bail!("unrecognized config key {other:?}"),
        }
        Ok(())
    }

    /// Bootstrap (§4.12): `GO_CACHE_CONFIG` env var, else `./redis.conf`
    /// if present, else built-in defaults — then apply CLI overrides.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = cli.config.clone().or_else(|| env::var("GO_CACHE_CONFIG").ok().map(PathBuf::from)) {
            Config::from_file(&path)?
        } else if Path::new("./redis.conf").exists() {
            Config::from_file(Path::new("./redis.conf"))?
        } else {
            Config::default()
        };

        if let Some(port) = cli.port {
            config.port = port;
        }
        if cli.appendonly {
            config.appendonly = true;
        }
        Ok(config)
    }
}

/// CLI overrides layered on top of the file-based config (file values
/// override built-in defaults, flags override file values).
#[derive(Debug, Parser)]
#[command(name = "kv-server", about = "An in-memory, RESP-protocol key-value server")]
pub struct Cli {
    /// Path to a config file; falls back to `GO_CACHE_CONFIG` then `./redis.conf`.
    #[arg(long, env = "GO_CACHE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub appendonly: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys_and_ignores_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redis.conf");
        std::fs::write(
            &path,
            "# a comment\nport 7000\nappendonly yes\ndatabases 4\npeers a,b,c\n\nrequirepass hunter2\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert!(config.appendonly);
        assert_eq!(config.databases, 4);
        assert_eq!(config.peers, vec!["a", "b", "c"]);
        assert_eq!(config.requirepass.as_deref(), Some("hunter2"));
    }

    #[test]
    fn unrecognized_key_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redis.conf");
        std::fs::write(&path, "bogus-key value\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn default_config_matches_the_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:6389");
        assert!(!config.appendonly);
        assert_eq!(config.databases, 16);
    }
}
