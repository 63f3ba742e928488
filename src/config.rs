//! Server configuration.
//!
//! Parsed from the command line, with environment variable fallbacks:
//!
//! ```text
//! ferrokv --port 6380 --dir /var/lib/ferrokv --dbfilename dump.rdb
//! ferrokv --replicaof "127.0.0.1 6379"
//! FERROKV_PORT=6381 ferrokv
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Master address given as `"<host> <port>"`, the same shape `REPLICAOF` takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for MasterAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) => {
                let port = port
                    .parse()
                    .map_err(|_| format!("invalid master port '{}'", port))?;
                Ok(MasterAddr {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(format!("expected \"<host> <port>\", got '{}'", s)),
        }
    }
}

/// Runtime configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "ferrokv", version, about = "A Redis-compatible key-value server")]
pub struct Config {
    /// Address to bind to
    #[arg(long, visible_alias = "bind", env = "FERROKV_HOST", default_value = crate::DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "FERROKV_PORT", default_value_t = crate::DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding the snapshot file
    #[arg(long, env = "FERROKV_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Snapshot file name inside `dir`
    #[arg(long, env = "FERROKV_DBFILENAME", default_value = "dump.rdb")]
    pub dbfilename: String,

    /// Start as a replica of "<host> <port>"
    #[arg(long, env = "FERROKV_REPLICAOF")]
    pub replicaof: Option<MasterAddr>,

    /// Depth of the command queue before producers wait
    #[arg(long, default_value_t = crate::sync::synchronizer::DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Starting interval of the active expiry sweeper in milliseconds, 0 disables it
    #[arg(long, default_value_t = 100)]
    pub active_expire_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            dir: PathBuf::from("."),
            dbfilename: "dump.rdb".to_string(),
            replicaof: None,
            queue_capacity: crate::sync::synchronizer::DEFAULT_QUEUE_CAPACITY,
            active_expire_interval_ms: 100,
        }
    }
}

impl Config {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full path of the snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    pub fn active_expire_interval(&self) -> Option<Duration> {
        match self.active_expire_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Parameters exposed through `CONFIG GET`, in reply order.
    pub fn parameters(&self) -> Vec<(&'static str, String)> {
        vec![
            ("dir", self.dir.display().to_string()),
            ("dbfilename", self.dbfilename.clone()),
            ("port", self.port.to_string()),
            ("bind", self.host.clone()),
        ]
    }
}
