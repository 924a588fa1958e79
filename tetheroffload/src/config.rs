// Configuration load/save

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::coordinator::poller::DEFAULT_POLL_INTERVAL;

const CONFIG_DIR: &str = "tetheroffload";
const CONFIG_FILE: &str = "offload.json";

/// Names of the six pinned kernel maps, relative to `map_pin_dir`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapNames {
    pub downstream4: String,
    pub upstream4: String,
    pub downstream6: String,
    pub upstream6: String,
    pub stats: String,
    pub limit: String,
}

impl Default for MapNames {
    fn default() -> Self {
        Self {
            downstream4: "map_offload_tether_downstream4_map".to_string(),
            upstream4: "map_offload_tether_upstream4_map".to_string(),
            downstream6: "map_offload_tether_downstream6_map".to_string(),
            upstream6: "map_offload_tether_upstream6_map".to_string(),
            stats: "map_offload_tether_stats_map".to_string(),
            limit: "map_offload_tether_limit_map".to_string(),
        }
    }
}

impl MapNames {
    /// (label, file name) of every map, in probe order
    pub fn all(&self) -> [(&'static str, &str); 6] {
        [
            ("downstream4", self.downstream4.as_str()),
            ("upstream4", self.upstream4.as_str()),
            ("downstream6", self.downstream6.as_str()),
            ("upstream6", self.upstream6.as_str()),
            ("stats", self.stats.as_str()),
            ("limit", self.limit.as_str()),
        ]
    }
}

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Master switch for kernel offload
    #[serde(default = "default_offload_enabled")]
    pub offload_enabled: bool,

    /// Stats polling interval, clamped to the default minimum
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// bpffs directory holding the pinned maps
    #[serde(default = "default_map_pin_dir")]
    pub map_pin_dir: PathBuf,

    #[serde(default)]
    pub map_names: MapNames,

    /// Object file with the TC forwarding programs; attachment is skipped when unset
    #[serde(default)]
    pub program_object: Option<PathBuf>,

    /// Program attached to downstream-facing interfaces
    #[serde(default = "default_upstream_program")]
    pub upstream_program: String,

    /// Program attached to upstream interfaces
    #[serde(default = "default_downstream_program")]
    pub downstream_program: String,

    /// Executable used for connection tracking events
    #[serde(default = "default_conntrack_command")]
    pub conntrack_command: String,

    /// Data limits by upstream interface name, applied at startup
    #[serde(default)]
    pub data_limits: BTreeMap<String, i64>,
}

fn default_offload_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_map_pin_dir() -> PathBuf {
    PathBuf::from("/sys/fs/bpf/tethering")
}

fn default_upstream_program() -> String {
    "sched_cls_tether_upstream6_ether".to_string()
}

fn default_downstream_program() -> String {
    "sched_cls_tether_downstream6_ether".to_string()
}

fn default_conntrack_command() -> String {
    "conntrack".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            offload_enabled: default_offload_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            map_pin_dir: default_map_pin_dir(),
            map_names: MapNames::default(),
            program_object: None,
            upstream_program: default_upstream_program(),
            downstream_program: default_downstream_program(),
            conntrack_command: default_conntrack_command(),
            data_limits: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join(CONFIG_DIR);
        Ok(config_dir.join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to `path`, or to the default location
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Full path of a pinned map
    pub fn map_path(&self, name: &str) -> PathBuf {
        self.map_pin_dir.join(name)
    }
}
