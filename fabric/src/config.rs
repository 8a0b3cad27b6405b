//! Configuration for a node.

use std::{
    env,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use url::Url;

use crate::{anchor::AnchorOptions, defaults};

/// Node configuration
///
/// The config is usually loaded from a TOML file with [`Self::load`]. Every field has a
/// default, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where trust anchors come from.
    pub anchors: AnchorOptions,
    /// Bounds of the record stores.
    pub store: StoreConfig,
    /// Client side PUT settings.
    pub put: PutConfig,
    /// Bootstrap nodes handed to the DHT substrate.
    pub bootstrap: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            anchors: AnchorOptions::default(),
            store: StoreConfig::default(),
            put: PutConfig::default(),
            bootstrap: defaults::BOOTSTRAP_NODES.map(String::from).to_vec(),
        }
    }
}

/// Bounds of the zone and event stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum records per store.
    pub max_size: NonZeroUsize,
    /// Records not re-put within this time are dropped.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// How often expired records are removed.
    #[serde(with = "humantime_serde")]
    pub eviction_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_size: NonZeroUsize::new(defaults::STORE_MAX_SIZE).unwrap_or(NonZeroUsize::MIN),
            max_age: defaults::STORE_MAX_AGE,
            eviction_interval: defaults::STORE_EVICTION_INTERVAL,
        }
    }
}

/// Client side PUT settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PutConfig {
    /// Number of closest nodes a record is sent to.
    pub max_closest_nodes: usize,
}

impl Default for PutConfig {
    fn default() -> Self {
        Self {
            max_closest_nodes: defaults::MAX_CLOSEST_NODES,
        }
    }
}

/// Errors loading a [`Config`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid config file"))]
    Parse { source: toml::de::Error },
    #[snafu(display("invalid anchor url {url:?}"))]
    Url {
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("{field} must not be zero"))]
    Zero { field: &'static str },
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let config: Config = toml::from_str(&s).context(ParseSnafu)?;
        Ok(config)
    }

    /// Applies anchor sources from the environment.
    ///
    /// `FABRIC_LOCAL_ANCHORS` names an anchor file and `FABRIC_REMOTE_ANCHORS` holds comma
    /// separated URLs. If no source is configured afterwards the default remote URL is used.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        let local = env::var_os(defaults::ENV_LOCAL_ANCHORS).map(PathBuf::from);
        let remote = env::var(defaults::ENV_REMOTE_ANCHORS).ok();
        self.apply_env(local, remote.as_deref())
    }

    fn apply_env(
        mut self,
        local: Option<PathBuf>,
        remote: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = local {
            self.anchors.local_path = Some(path);
            self.anchors.remote_urls = None;
            self.anchors.static_anchors = None;
        } else if let Some(remote) = remote {
            let urls = parse_urls(remote)?;
            if !urls.is_empty() {
                self.anchors.local_path = None;
                self.anchors.remote_urls = Some(urls);
                self.anchors.static_anchors = None;
            }
        }
        if !self.anchors.has_source() {
            let url = parse_urls(defaults::DEFAULT_REMOTE_ANCHORS)?;
            self.anchors.remote_urls = Some(url);
        }
        Ok(self)
    }

    /// Checks values serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("anchors.check_interval", self.anchors.check_interval),
            ("anchors.retry_delay", self.anchors.retry_delay),
            ("anchors.watch_interval", self.anchors.watch_interval),
            ("store.eviction_interval", self.store.eviction_interval),
        ];
        for (field, interval) in intervals {
            snafu::ensure!(!interval.is_zero(), ZeroSnafu { field });
        }
        snafu::ensure!(
            self.put.max_closest_nodes > 0,
            ZeroSnafu {
                field: "put.max_closest_nodes"
            }
        );
        Ok(())
    }
}

fn parse_urls(list: &str) -> Result<Vec<Url>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Url::parse(s).context(UrlSnafu { url: s }))
        .collect()
}
