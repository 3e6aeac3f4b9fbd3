//! Manager configuration.
//!
//! Built in code with the `with_*` builders or read from the environment with
//! [`ManagerConfig::from_env`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::protocol::{ClusterId, CommandManifest, ShardId};
use crate::rebroadcast::ReadyInfo;
use crate::state::{IdentityError, WorkerIdentity};
use crate::version::BuildInfo;

pub const DEFAULT_SUPERVISOR_ADDR: &str = "127.0.0.1:4242";
pub const DEFAULT_STATS_FLUSH_INTERVAL: Duration = Duration::from_secs(120);
/// How long queued outbound envelopes may take to drain once the loop stops.
pub const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("{var} is not a valid integer: {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("invalid shard assignment: {0}")]
    InvalidShards(#[from] IdentityError),

    #[error("failed to read command manifest {}: {source}", path.display())]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse command manifest {}: {source}", path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub cluster_id: ClusterId,
    pub shard_count: u32,
    pub shards: Vec<ShardId>,
    /// `host:port` of the supervisor's control socket.
    pub supervisor_addr: String,
    pub ready: ReadyInfo,
    /// Where inbound event counters are persisted; `None` disables persistence.
    pub stats_path: Option<PathBuf>,
    pub stats_flush_interval: Duration,
    /// Upper bound on flushing the outbound queue at shutdown. A supervisor
    /// that stopped reading must not keep the process alive.
    pub writer_drain_timeout: Duration,
}

impl ManagerConfig {
    pub fn new(
        cluster_id: ClusterId,
        shard_count: u32,
        shards: impl IntoIterator<Item = ShardId>,
    ) -> Self {
        Self {
            cluster_id,
            shard_count,
            shards: shards.into_iter().collect(),
            supervisor_addr: DEFAULT_SUPERVISOR_ADDR.to_string(),
            ready: ReadyInfo {
                name: "manager".to_string(),
                env: "development".to_string(),
                build: BuildInfo::detect(),
                ..ReadyInfo::default()
            },
            stats_path: None,
            stats_flush_interval: DEFAULT_STATS_FLUSH_INTERVAL,
            writer_drain_timeout: WRITER_DRAIN_TIMEOUT,
        }
    }

    pub fn with_supervisor_addr(mut self, addr: impl Into<String>) -> Self {
        self.supervisor_addr = addr.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.ready.name = name.into();
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.ready.avatar = avatar.into();
        self
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.ready.env = env.into();
        self
    }

    pub fn with_process_tag(mut self, tag: impl Into<String>) -> Self {
        self.ready.process_tag = Some(tag.into());
        self
    }

    pub fn with_commands(mut self, commands: CommandManifest) -> Self {
        self.ready.commands = commands;
        self
    }

    pub fn with_build(mut self, build: BuildInfo) -> Self {
        self.ready.build = build;
        self
    }

    pub fn with_stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_path = Some(path.into());
        self
    }

    pub fn with_stats_flush_interval(mut self, interval: Duration) -> Self {
        self.stats_flush_interval = interval;
        self
    }

    pub fn with_writer_drain_timeout(mut self, timeout: Duration) -> Self {
        self.writer_drain_timeout = timeout;
        self
    }

    /// Validated identity for this configuration.
    pub fn identity(&self) -> Result<WorkerIdentity, IdentityError> {
        WorkerIdentity::new(self.cluster_id, self.shard_count, self.shards.iter().copied())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from `lookup`, which maps variable names to values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let cluster_id = parse_number("AETHER_CLUSTER_ID", &require("AETHER_CLUSTER_ID")?)?;
        let shard_count = parse_number("AETHER_SHARD_COUNT", &require("AETHER_SHARD_COUNT")?)?;
        let shards = require("AETHER_SHARDS")?
            .split(',')
            .map(|s| parse_number("AETHER_SHARDS", s))
            .collect::<Result<Vec<ShardId>, _>>()?;

        let mut config = Self::new(cluster_id, shard_count, shards)
            .with_supervisor_addr(require("AETHER_ADDR")?)
            .with_build(BuildInfo::from_lookup(&lookup));
        config.identity()?;

        if let Some(name) = get("AETHER_NAME") {
            config = config.with_name(name);
        }
        if let Some(avatar) = get("AETHER_AVATAR") {
            config = config.with_avatar(avatar);
        }
        if let Some(env) = get("AETHER_ENV").or_else(|| get("NODE_ENV")) {
            config = config.with_env(env);
        }
        if let Some(tag) = get("AETHER_PROCESS_TAG").or_else(|| get("pm_id")) {
            config = config.with_process_tag(tag);
        }
        if let Some(path) = get("AETHER_COMMANDS") {
            config = config.with_commands(load_manifest(Path::new(&path))?);
        }
        if let Some(path) = get("AETHER_STATS_PATH") {
            config = config.with_stats_path(path);
        }

        Ok(config)
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        })
}

fn load_manifest(path: &Path) -> Result<CommandManifest, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::ManifestRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::ManifestParse {
        path: path.to_path_buf(),
        source,
    })
}
