use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::Args;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use patchd_core::ratelimit::RateLimitConfig;

const DEFAULT_FILES_DIR: &str = "./files";
const DEFAULT_BIND: &str = "0.0.0.0:8081";
const DEFAULT_SHUTDOWN_SECS: u64 = 30;
pub const ANY_ORIGIN: &str = "*";

/// `patchd serve` options. Every value can also come from the environment or
/// from `--config <file.toml>`; flags and env win over the file.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// TOML file with defaults for any of the options below
    #[arg(long, env = "PATCHD_CONFIG")]
    pub config: Option<PathBuf>,
    /// Directory holding the distributable files and manifest.json
    #[arg(long, env = "PATCHD_FILES_DIR")]
    pub files_dir: Option<PathBuf>,
    #[arg(long, env = "PATCHD_BIND")]
    pub bind: Option<SocketAddr>,
    /// Bearer token accepted for client routes (repeatable)
    #[arg(long = "api-token", env = "PATCHD_API_TOKENS", value_delimiter = ',')]
    pub api_tokens: Vec<String>,
    /// Bearer token that also grants the admin role
    #[arg(long, env = "PATCHD_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,
    /// Requests a client may burst before being throttled
    #[arg(long, env = "PATCHD_RATE_CAPACITY")]
    pub rate_capacity: Option<u32>,
    /// Seconds for an empty bucket to refill completely
    #[arg(long, env = "PATCHD_RATE_REFILL_SECS")]
    pub rate_refill_secs: Option<u64>,
    /// File-name globs left out of generated manifests (repeatable)
    #[arg(long, env = "PATCHD_EXCLUDE", value_delimiter = ',')]
    pub exclude: Vec<String>,
    #[arg(long, env = "PATCHD_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: Option<u64>,
    /// Origins allowed to call the API from a browser; `*` allows any (repeatable)
    #[arg(long = "allowed-origin", env = "PATCHD_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub files_dir: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub api_tokens: Vec<String>,
    pub admin_token: Option<String>,
    pub rate_capacity: Option<u32>,
    pub rate_refill_secs: Option<u64>,
    pub exclude: Vec<String>,
    pub shutdown_timeout_secs: Option<u64>,
    pub allowed_origins: Vec<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        toml::from_str(&s).with_context(|| format!("parse config {:?}", path))
    }
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub files_dir: PathBuf,
    pub bind: SocketAddr,
    pub api_tokens: Vec<String>,
    pub admin_token: Option<String>,
    pub rate: RateLimitConfig,
    pub exclude: Vec<String>,
    pub shutdown_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

impl ServeArgs {
    pub fn resolve(self) -> Result<ServerConfig> {
        let file = match &self.config {
            Some(p) => FileConfig::read(p)?,
            None => FileConfig::default(),
        };
        let pick_vec = |cli: Vec<String>, file: Vec<String>| if cli.is_empty() { file } else { cli };

        let mut rate = RateLimitConfig::default();
        if let Some(c) = self.rate_capacity.or(file.rate_capacity) {
            anyhow::ensure!(c > 0, "rate capacity must be positive");
            rate.capacity = c;
        }
        if let Some(s) = self.rate_refill_secs.or(file.rate_refill_secs) {
            anyhow::ensure!(s > 0, "rate refill interval must be positive");
            rate.refill_interval = Duration::from_secs(s);
        }

        let mut allowed_origins = pick_vec(self.allowed_origins, file.allowed_origins);
        if allowed_origins.is_empty() {
            allowed_origins.push(ANY_ORIGIN.to_string());
        }
        for o in &allowed_origins {
            HeaderValue::from_str(o).with_context(|| format!("invalid allowed origin {:?}", o))?;
        }

        Ok(ServerConfig {
            files_dir: self.files_dir.or(file.files_dir).unwrap_or_else(|| DEFAULT_FILES_DIR.into()),
            bind: match self.bind.or(file.bind) {
                Some(b) => b,
                None => DEFAULT_BIND.parse()?,
            },
            api_tokens: pick_vec(self.api_tokens, file.api_tokens),
            admin_token: self.admin_token.or(file.admin_token),
            rate,
            exclude: pick_vec(self.exclude, file.exclude),
            shutdown_timeout: Duration::from_secs(
                self.shutdown_timeout_secs.or(file.shutdown_timeout_secs).unwrap_or(DEFAULT_SHUTDOWN_SECS),
            ),
            allowed_origins,
        })
    }
}
