//! Pipeline configuration.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use thiserror::Error;

use atlas_metrics::util::AsciiSet;

/// Characters allowed in tag keys and values unless overridden.
pub const DEFAULT_TAG_CHARACTERS: &str = "-._A-Za-z0-9";

/// Problems constructing a [`Config`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The publish step is not a positive integer multiple of the primary
    /// step.
    #[error("publish step {publish_ms}ms is not a multiple of primary step {primary_ms}ms")]
    InvalidStep {
        /// Primary step in milliseconds.
        primary_ms: u64,
        /// Publish step in milliseconds.
        publish_ms: u64,
    },
    /// A recognized option had a value that does not parse.
    #[error("invalid value '{value}' for option '{key}'")]
    InvalidValue {
        /// The option key.
        key: String,
        /// The offending value.
        value: String,
    },
    /// Batch size must be positive.
    #[error("batch size must be positive")]
    InvalidBatchSize,
}

/// Settings for the publish pipeline. Build with [`Config::builder`] or
/// [`Config::from_map`]; unknown map options are ignored.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether publishing to the publish endpoint is active.
    pub enabled: bool,
    /// Whether streaming evaluation is active.
    pub lwc_enabled: bool,
    /// Primary step at which raw accumulators rotate.
    pub step: Duration,
    /// Publish step at which consolidated values are emitted. Must be a
    /// multiple of `step`.
    pub lwc_step: Duration,
    /// Meter TTL for registry expiration.
    pub meter_ttl: Duration,
    /// Publish endpoint.
    pub uri: String,
    /// Streaming eval endpoint.
    pub eval_uri: String,
    /// Subscription list endpoint.
    pub config_uri: String,
    /// Maximum measurements per POST.
    pub batch_size: usize,
    /// How often polled gauges are sampled.
    pub gauge_polling_frequency: Duration,
    /// How often the subscription list is refreshed.
    pub config_refresh_frequency: Duration,
    /// Allowed characters for tag keys and values.
    pub valid_tag_characters: AsciiSet,
    /// Per-key overrides for allowed value characters.
    pub valid_tag_value_characters: HashMap<String, AsciiSet>,
    /// Tags injected into every published measurement.
    pub common_tags: BTreeMap<String, String>,
    /// Connect timeout for publish requests.
    pub connect_timeout: Duration,
    /// Read timeout for publish requests.
    pub read_timeout: Duration,
}

impl Config {
    /// Start building a config.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Build from string options. Recognized keys follow the backend's
    /// naming (`step`, `lwc.step`, `meterTTL`, `enabled`, `lwcEnabled`,
    /// `uri`, `evalUri`, `configUri`, `batchSize`,
    /// `gaugePollingFrequency`, `validTagCharacters`,
    /// `validTagValueCharacters.<key>`, `commonTags`); anything else is
    /// ignored. Durations accept integer milliseconds or an `s`/`m`
    /// suffix.
    pub fn from_map(options: &HashMap<String, String>) -> Result<Config, ConfigError> {
        let mut builder = Config::builder();
        for (key, value) in options {
            builder = match key.as_str() {
                "step" => builder.with_step(parse_duration(key, value)?),
                "lwc.step" => builder.with_lwc_step(parse_duration(key, value)?),
                "meterTTL" => builder.with_meter_ttl(parse_duration(key, value)?),
                "enabled" => builder.with_enabled(parse_bool(key, value)?),
                "lwcEnabled" => builder.with_lwc_enabled(parse_bool(key, value)?),
                "uri" => builder.with_uri(value),
                "evalUri" => builder.with_eval_uri(value),
                "configUri" => builder.with_config_uri(value),
                "batchSize" => {
                    let n: usize = value.parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                    })?;
                    builder.with_batch_size(n)
                }
                "gaugePollingFrequency" => {
                    builder.with_gauge_polling_frequency(parse_duration(key, value)?)
                }
                "configRefreshFrequency" => {
                    builder.with_config_refresh_frequency(parse_duration(key, value)?)
                }
                "validTagCharacters" => {
                    builder.with_valid_tag_characters(AsciiSet::from_pattern(value))
                }
                "commonTags" => {
                    let mut b = builder;
                    for pair in value.split(',').filter(|p| !p.is_empty()) {
                        let (k, v) =
                            pair.split_once('=')
                                .ok_or_else(|| ConfigError::InvalidValue {
                                    key: key.clone(),
                                    value: value.clone(),
                                })?;
                        b = b.with_common_tag(k, v);
                    }
                    b
                }
                _ => match key.strip_prefix("validTagValueCharacters.") {
                    Some(tag_key) => builder
                        .with_valid_tag_value_characters(tag_key, AsciiSet::from_pattern(value)),
                    None => builder,
                },
            };
        }
        builder.build()
    }

    /// Publish step divided by primary step.
    pub fn consolidation_multiple(&self) -> usize {
        (self.lwc_step.as_millis() / self.step.as_millis().max(1)) as usize
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        let mut overrides = HashMap::new();
        // The cluster tag historically carries shard separators.
        overrides.insert(
            "cluster".to_string(),
            AsciiSet::from_pattern(DEFAULT_TAG_CHARACTERS).union(&AsciiSet::from_pattern("^~")),
        );
        ConfigBuilder {
            config: Config {
                enabled: true,
                lwc_enabled: true,
                step: Duration::from_secs(5),
                lwc_step: Duration::from_secs(60),
                meter_ttl: Duration::from_secs(15 * 60),
                uri: "https://atlas/api/v1/publish".to_string(),
                eval_uri: "https://atlas/lwc/api/v1/evaluate".to_string(),
                config_uri: "https://atlas/lwc/api/v1/expressions".to_string(),
                batch_size: 10_000,
                gauge_polling_frequency: Duration::from_secs(10),
                config_refresh_frequency: Duration::from_secs(10),
                valid_tag_characters: AsciiSet::from_pattern(DEFAULT_TAG_CHARACTERS),
                valid_tag_value_characters: overrides,
                common_tags: BTreeMap::new(),
                connect_timeout: Duration::from_secs(1),
                read_timeout: Duration::from_secs(10),
            },
        }
    }
}

impl ConfigBuilder {
    /// Enable or disable publishing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Enable or disable streaming evaluation.
    pub fn with_lwc_enabled(mut self, enabled: bool) -> Self {
        self.config.lwc_enabled = enabled;
        self
    }

    /// Primary step duration.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.config.step = step;
        self
    }

    /// Publish step duration.
    pub fn with_lwc_step(mut self, step: Duration) -> Self {
        self.config.lwc_step = step;
        self
    }

    /// Meter TTL.
    pub fn with_meter_ttl(mut self, ttl: Duration) -> Self {
        self.config.meter_ttl = ttl;
        self
    }

    /// Publish endpoint.
    pub fn with_uri(mut self, uri: &str) -> Self {
        self.config.uri = uri.to_string();
        self
    }

    /// Streaming eval endpoint.
    pub fn with_eval_uri(mut self, uri: &str) -> Self {
        self.config.eval_uri = uri.to_string();
        self
    }

    /// Subscription list endpoint.
    pub fn with_config_uri(mut self, uri: &str) -> Self {
        self.config.config_uri = uri.to_string();
        self
    }

    /// Maximum measurements per POST.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// How often polled gauges are sampled.
    pub fn with_gauge_polling_frequency(mut self, frequency: Duration) -> Self {
        self.config.gauge_polling_frequency = frequency;
        self
    }

    /// How often the subscription list is refreshed.
    pub fn with_config_refresh_frequency(mut self, frequency: Duration) -> Self {
        self.config.config_refresh_frequency = frequency;
        self
    }

    /// Allowed characters for tag keys and values.
    pub fn with_valid_tag_characters(mut self, set: AsciiSet) -> Self {
        self.config.valid_tag_characters = set;
        self
    }

    /// Override the allowed value characters for one tag key.
    pub fn with_valid_tag_value_characters(mut self, key: &str, set: AsciiSet) -> Self {
        self.config
            .valid_tag_value_characters
            .insert(key.to_string(), set);
        self
    }

    /// Add a tag injected into every published measurement.
    pub fn with_common_tag(mut self, key: &str, value: &str) -> Self {
        self.config
            .common_tags
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Validate and produce the config.
    pub fn build(self) -> Result<Config, ConfigError> {
        let primary_ms = self.config.step.as_millis() as u64;
        let publish_ms = self.config.lwc_step.as_millis() as u64;
        if primary_ms == 0 || publish_ms == 0 || publish_ms % primary_ms != 0 {
            return Err(ConfigError::InvalidStep {
                primary_ms,
                publish_ms,
            });
        }
        if self.config.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(self.config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    };
    if let Some(n) = value.strip_suffix("ms") {
        return n.parse().map(Duration::from_millis).map_err(|_| invalid());
    }
    if let Some(n) = value.strip_suffix('s') {
        return n.parse().map(Duration::from_secs).map_err(|_| invalid());
    }
    if let Some(n) = value.strip_suffix('m') {
        return n
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|_| invalid());
    }
    value.parse().map(Duration::from_millis).map_err(|_| invalid())
}
