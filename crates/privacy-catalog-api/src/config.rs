use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use privacy_catalog_core::{
    EntityKind, IngestPolicy, Metric, RankSumMetric, ScoreTableMetric, MAX_SCORE, MIN_SCORE,
};
use privacy_catalog_store_sqlite::{ConflictPolicy, StoreOptions, DEFAULT_BUSY_TIMEOUT_MS};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid catalog config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid score table {}: {source}", path.display())]
    Table {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

/// Runtime configuration of a catalogue: store behaviour, ingestion allowlist
/// and the ordered metric registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub busy_timeout_ms: u64,
    pub conflict_policy: ConflictPolicy,
    pub ingest: IngestConfig,
    pub metrics: Vec<MetricDescriptor>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            conflict_policy: ConflictPolicy::default(),
            ingest: IngestConfig::default(),
            metrics: vec![MetricDescriptor::RankSum {
                name: "RPNDroid".to_string(),
                protection_level: None,
                normalizer: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Entity tags an ingested document may carry; absent means every tag.
    pub allowed_kinds: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricDescriptor {
    RankSum {
        name: String,
        #[serde(default)]
        protection_level: Option<String>,
        #[serde(default)]
        normalizer: Option<f64>,
    },
    ScoreTable {
        name: String,
        /// JSON object mapping package names to scores.
        table: PathBuf,
    },
}

impl MetricDescriptor {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::RankSum { name, .. } | Self::ScoreTable { name, .. } => name,
        }
    }
}

impl CatalogConfig {
    /// Read a YAML config file. Relative score table paths resolve against the
    /// directory holding the config file.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read, parsed or validated.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let mut config = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            for descriptor in &mut config.metrics {
                if let MetricDescriptor::ScoreTable { table, .. } = descriptor {
                    if table.is_relative() {
                        *table = base.join(&*table);
                    }
                }
            }
        }
        Ok(config)
    }

    /// Parse YAML config text.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the text is not a valid config.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.busy_timeout_ms == 0 {
            return Err(ConfigError::Validation("busy_timeout_ms MUST be positive".into()));
        }
        self.ingest_policy()?;

        let mut seen = Vec::with_capacity(self.metrics.len());
        for descriptor in &self.metrics {
            let name = descriptor.name();
            if name.trim().is_empty() {
                return Err(ConfigError::Validation("metric name cannot be empty".into()));
            }
            if seen.contains(&name) {
                return Err(ConfigError::Validation(format!("metric `{name}` is registered twice")));
            }
            seen.push(name);

            if let MetricDescriptor::RankSum { normalizer: Some(normalizer), .. } = descriptor {
                if !normalizer.is_finite() || *normalizer <= 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "metric `{name}` normalizer MUST be positive, got {normalizer}"
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions { busy_timeout_ms: self.busy_timeout_ms, conflict_policy: self.conflict_policy }
    }

    /// # Errors
    /// Returns [`ConfigError::Validation`] for an allowlist entry that is not an entity tag.
    pub fn ingest_policy(&self) -> Result<IngestPolicy, ConfigError> {
        let Some(tags) = &self.ingest.allowed_kinds else {
            return Ok(IngestPolicy::allow_all());
        };
        let kinds = tags
            .iter()
            .map(|tag| {
                EntityKind::parse(tag)
                    .ok_or_else(|| ConfigError::Validation(format!("unknown entity tag `{tag}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IngestPolicy::only(kinds))
    }

    /// Instantiate the metric registry in configured order.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a score table cannot be read or holds
    /// scores outside `[0, 10]`.
    pub fn build_metrics(&self) -> Result<Vec<Box<dyn Metric>>, ConfigError> {
        let mut metrics: Vec<Box<dyn Metric>> = Vec::with_capacity(self.metrics.len());
        for descriptor in &self.metrics {
            match descriptor {
                MetricDescriptor::RankSum { name, protection_level, normalizer } => {
                    let mut metric = RankSumMetric::new(name.clone());
                    if let Some(level) = protection_level {
                        metric = metric.with_protection_level(level.clone());
                    }
                    if let Some(normalizer) = normalizer {
                        metric = metric.with_normalizer(*normalizer);
                    }
                    metrics.push(Box::new(metric));
                }
                MetricDescriptor::ScoreTable { name, table } => {
                    metrics.push(Box::new(ScoreTableMetric::new(name.clone(), read_score_table(table)?)));
                }
            }
        }
        Ok(metrics)
    }
}

fn read_score_table(path: &Path) -> Result<BTreeMap<String, f64>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let table: BTreeMap<String, f64> = serde_json::from_str(&content)
        .map_err(|source| ConfigError::Table { path: path.to_path_buf(), source })?;

    if let Some((package, score)) =
        table.iter().find(|(_, score)| !(MIN_SCORE..=MAX_SCORE).contains(*score))
    {
        return Err(ConfigError::Validation(format!(
            "score table {} gives {package} score {score} outside [{MIN_SCORE}, {MAX_SCORE}]",
            path.display()
        )));
    }
    Ok(table)
}
