use std::path::Path;
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_CONCURRENCY: usize = 64;
const DEFAULT_START_INTERVAL_MS: u64 = 100;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

pub const STORAGE_KINDS: &[&str] = &["file", "webdav", "alist"];

/// Mirror cluster node
///
/// Only flags that were actually given are layered over the file and
/// environment, so every field is optional here.
#[derive(Parser, Serialize, Deserialize, Clone, Debug, Default)]
#[command(name = "mirror-node", version, about = "Mirror cluster node")]
pub struct Cli {
    /// Port to listen on
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./mirror.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "is_false")]
    pub json_logs: bool,

    /// Do not emit per-request access log lines
    #[arg(long)]
    #[serde(skip_serializing_if = "is_false")]
    pub disable_access_log: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    pub disable_access_log: bool,
    /// Failures tolerated before the node exits.
    pub fault_threshold: u32,
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            disable_access_log: false,
            fault_threshold: 5,
            cluster: ClusterConfig::default(),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Identity of this node within the cluster and where the authority lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub id: String,
    pub secret: String,
    pub server_url: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            secret: String::new(),
            server_url: "https://openbmclapi.bangbang93.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend: "file", "webdav" or "alist"
    pub kind: String,
    /// Root directory for the file backend
    pub path: String,
    pub webdav: WebDavConfig,
    pub alist: AListConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: "file".to_string(),
            path: "./cache".to_string(),
            webdav: WebDavConfig::default(),
            alist: AListConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDavConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Root collection on the share
    pub path: String,
    /// Wait after a 423 Locked response before retrying
    pub lock_cooldown_secs: u64,
}

impl Default for WebDavConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            path: "/".to_string(),
            lock_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AListConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub path: String,
    /// Pre-issued token; skips the login handshake when set
    pub token: String,
}

impl Default for AListConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            path: "/data".to_string(),
            token: String::new(),
        }
    }
}

/// Tunables for the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent downloads (<= 0 means the default of 64)
    pub max_concurrency: i64,
    /// Gap between download submissions (< 0 means 100, 0 disables)
    pub start_interval_ms: i64,
    /// Unit of linear backoff between retries
    pub retry_backoff_ms: u64,
    /// Longest wait for the authority to send more bytes (0 means 30)
    pub read_timeout_secs: u64,
    /// Re-run reconciliation every N seconds (0 = once at startup)
    pub interval_secs: u64,
    /// Delete objects not in the manifest after a clean pass
    pub gc: bool,
    /// Write the decoded manifest as JSON here (debugging)
    pub save_manifest: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY as i64,
            start_interval_ms: DEFAULT_START_INTERVAL_MS as i64,
            retry_backoff_ms: 1000,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            interval_secs: 0,
            gc: false,
            save_manifest: String::new(),
        }
    }
}

impl SyncConfig {
    pub fn concurrency(&self) -> usize {
        if self.max_concurrency <= 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            self.max_concurrency as usize
        }
    }

    pub fn start_interval(&self) -> Duration {
        if self.start_interval_ms < 0 {
            Duration::from_millis(DEFAULT_START_INTERVAL_MS)
        } else {
            Duration::from_millis(self.start_interval_ms as u64)
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Idle timeout for authority reads. A download that keeps receiving
    /// bytes may take as long as it needs.
    pub fn read_timeout(&self) -> Duration {
        match self.read_timeout_secs {
            0 => Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    /// `None` when periodic reconciliation is off.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    pub fn manifest_dump(&self) -> Option<&Path> {
        (!self.save_manifest.is_empty()).then(|| Path::new(&self.save_manifest))
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (MIRROR_*) < CLI args
    ///
    /// Returns the parsed CLI alongside so the caller can act on
    /// `--generate-config`.
    pub fn load() -> Result<(Self, Cli), figment::Error> {
        let cli = Cli::parse();
        let config = Self::figment(&cli.config)
            .merge(Serialized::defaults(&cli))
            .extract()?;
        Ok((config, cli))
    }

    /// Everything below the CLI layer.
    pub fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("MIRROR_").split("__"))
    }

    /// Reject configurations the node cannot start with.
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster.id.trim().is_empty() {
            return Err("cluster.id must be set (MIRROR_CLUSTER__ID)".to_string());
        }
        if self.cluster.secret.trim().is_empty() {
            return Err("cluster.secret must be set (MIRROR_CLUSTER__SECRET)".to_string());
        }
        if !STORAGE_KINDS.contains(&self.storage.kind.as_str()) {
            return Err(format!(
                "storage.kind must be one of {}, got {:?}",
                STORAGE_KINDS.join(", "),
                self.storage.kind
            ));
        }
        match self.storage.kind.as_str() {
            "webdav" if self.storage.webdav.endpoint.is_empty() => {
                Err("storage.webdav.endpoint must be set".to_string())
            }
            "alist" if self.storage.alist.endpoint.is_empty() => {
                Err("storage.alist.endpoint must be set".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Mirror Node Configuration
# Place this file at ./mirror.toml or specify with --config <path>
# All settings can be overridden via environment variables
# (MIRROR_PORT, MIRROR_CLUSTER__SECRET, MIRROR_STORAGE__WEBDAV__ENDPOINT, ...)
# or CLI flags (--port, --json-logs, ...)

# Server port (default: 4000)
# port = 4000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Suppress per-request access log lines
# disable_access_log = false

# Consecutive failures tolerated before the node exits
# fault_threshold = 5

# ---- Cluster identity ----
[cluster]
# Both are issued by the cluster operator and are required.
id = ""
secret = ""
# server_url = "https://openbmclapi.bangbang93.com"

# ---- Storage ----
[storage]
# Backend: "file", "webdav" or "alist"
# kind = "file"

# Root directory for the file backend
# path = "./cache"

# [storage.webdav]
# endpoint = "https://dav.example.com"
# username = ""
# password = ""
# path = "/"
# lock_cooldown_secs = 60

# [storage.alist]
# endpoint = "https://alist.example.com"
# username = ""
# password = ""
# path = "/data"
# token = ""   # Skips login when set

# ---- Reconciliation ----
# [sync]
# max_concurrency = 64      # <= 0 means 64
# start_interval_ms = 100   # Gap between download starts; 0 disables
# retry_backoff_ms = 1000   # Retry n waits n * this
# read_timeout_secs = 30    # Give up on an authority read that stalls this long
# interval_secs = 0         # 0 = reconcile once at startup
# gc = false                # Delete objects no longer in the manifest
# save_manifest = ""        # Dump the decoded manifest as JSON
"#
    .to_string()
}
