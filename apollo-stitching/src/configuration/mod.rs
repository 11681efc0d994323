//! Logic for loading configuration in to an object model

use std::num::NonZeroUsize;

use derivative::Derivative;
use displaydoc::Display;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not parse configuration: {0}
    InvalidYaml(serde_yaml::Error),
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
}

/// The configuration of the stitching engine.
///
/// Can be created through `serde::Deserialize` from various formats,
/// or loaded from YAML with [`Configuration::from_yaml`].
#[derive(Clone, Derivative, Deserialize, Serialize, JsonSchema, Default, PartialEq, Eq)]
#[derivative(Debug)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Query planning options.
    pub query_planning: QueryPlanning,

    /// Forwarding of `@defer`/`@stream` payloads produced by subgraphs.
    pub incremental_delivery: IncrementalDelivery,

    /// Logging output.
    pub logging: LoggingConfiguration,
}

impl Configuration {
    /// Parses a YAML document. An empty document is the default configuration.
    pub fn from_yaml(raw_yaml: &str) -> Result<Self, ConfigurationError> {
        if raw_yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let configuration: Configuration =
            serde_yaml::from_str(raw_yaml).map_err(ConfigurationError::InvalidYaml)?;
        configuration.validate()?;
        Ok(configuration)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(filter) = &self.logging.filter
            && let Err(err) = tracing_subscriber::EnvFilter::try_new(filter)
        {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "invalid logging filter",
                error: err.to_string(),
            });
        }
        Ok(())
    }

    /// The JSON schema of the configuration.
    pub fn schema() -> RootSchema {
        let settings = SchemaSettings::draft07().with(|s| {
            s.option_nullable = true;
            s.option_add_null_type = false;
            s.inline_subschemas = true;
        });
        settings.into_generator().into_root_schema_for::<Configuration>()
    }
}

/// Query planning options.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct QueryPlanning {
    /// Cache of query plans.
    pub cache: Cache,
}

/// Cache of query plans.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Cache {
    /// Number of plans kept in memory, least recently used first out.
    /// Defaults to 512
    #[serde(default = "default_cache_limit")]
    pub limit: NonZeroUsize,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            limit: default_cache_limit(),
        }
    }
}

fn default_cache_limit() -> NonZeroUsize {
    NonZeroUsize::new(512).unwrap_or(NonZeroUsize::MIN)
}

/// Incremental delivery options.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IncrementalDelivery {
    /// When disabled, only the initial payload of a subgraph is used and responses are never split.
    /// enabled by default
    #[serde(default = "default_incremental_delivery")]
    pub enabled: bool,
}

impl Default for IncrementalDelivery {
    fn default() -> Self {
        Self {
            enabled: default_incremental_delivery(),
        }
    }
}

fn default_incremental_delivery() -> bool {
    true
}

/// Logging options.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfiguration {
    /// Output format.
    pub format: LoggingFormat,

    /// An `EnvFilter` directive, such as `apollo_stitching=debug`.
    /// `RUST_LOG` is used when unset, then `info`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Logging output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}
