//! Server configuration.
//!
//! Loaded from an optional TOML file; every key has a default and the
//! command line overrides the file.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use kubestream_logs::BackfillOptions;
use kubestream_web::StreamSettings;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server listens on
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Kubeconfig context; the current one when absent
    pub context: Option<String>,

    /// Namespaces clients may read
    pub namespaces: Vec<String>,

    /// Container to read in multi-container pods
    pub container: Option<String>,

    /// Seconds between pod list polls
    pub discovery_interval_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            context: None,
            namespaces: vec!["default".to_string()],
            container: None,
            discovery_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    pub heartbeat_secs: u64,
    pub backfill_minimum: usize,
    pub backfill_window_secs: u64,
    pub buffer_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 5,
            backfill_minimum: 50,
            backfill_window_secs: 10,
            buffer_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub kubernetes: KubernetesConfig,
    pub stream: StreamConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load from `path`, or the defaults when there is no file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    /// Apply command line values on top of the file
    pub fn with_overrides(
        mut self,
        addr: Option<SocketAddr>,
        context: Option<String>,
        namespaces: Vec<String>,
    ) -> Self {
        if let Some(addr) = addr {
            self.server.addr = addr;
        }
        if context.is_some() {
            self.kubernetes.context = context;
        }
        if !namespaces.is_empty() {
            self.kubernetes.namespaces = namespaces;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.kubernetes.namespaces.is_empty() {
            bail!("at least one namespace must be configured");
        }
        if self.kubernetes.discovery_interval_secs == 0 {
            bail!("kubernetes.discovery_interval_secs must be positive");
        }
        if self.stream.heartbeat_secs == 0 {
            bail!("stream.heartbeat_secs must be positive");
        }
        if self.stream.backfill_window_secs == 0 {
            bail!("stream.backfill_window_secs must be positive");
        }
        if self.stream.buffer_capacity == 0 {
            bail!("stream.buffer_capacity must be positive");
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.kubernetes.discovery_interval_secs)
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            heartbeat: Duration::from_secs(self.stream.heartbeat_secs),
            backfill: BackfillOptions {
                minimum: self.stream.backfill_minimum,
                initial_window: Duration::from_secs(self.stream.backfill_window_secs),
            },
            buffer_capacity: self.stream.buffer_capacity,
        }
    }
}
