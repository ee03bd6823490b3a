use std::collections::{BTreeMap, BTreeSet};

use crate::{App, PrivacyRank};

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 10.0;

/// Rank sum of an app requesting every dangerous permission under the stock ledger.
pub const DEFAULT_RANK_SUM_NORMALIZER: f64 = 3.134_764_254_093_17;
pub const DEFAULT_RANK_SUM_PROTECTION_LEVEL: &str = "dangerous";

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum MetricError {
    #[error("metric {metric} cannot score app {app_hash}: {reason}")]
    Unscorable { metric: String, app_hash: String, reason: String },
    #[error("metric {metric} produced out-of-range score {value} for app {app_hash}")]
    OutOfRange { metric: String, app_hash: String, value: f64 },
}

/// A scoring strategy bound to a privacy rank of the same name.
pub trait Metric: Send + Sync {
    /// Name of the privacy rank this metric fills.
    fn name(&self) -> &str;

    /// Provenance recorded on a lazily created ledger.
    fn source(&self) -> Option<&str> {
        None
    }

    /// Packages this metric applies to; `None` means every catalogued app.
    fn candidate_packages(&self) -> Option<BTreeSet<String>> {
        None
    }

    /// Score one app against the current ledger. `Ok(None)` means the metric
    /// has nothing to say about this app.
    ///
    /// # Errors
    /// Returns [`MetricError`] when the app cannot be scored.
    fn score(&self, app: &App, ledger: &PrivacyRank) -> Result<Option<f64>, MetricError>;
}

/// Sums the ledger weights of the permissions an app uses whose protection
/// level carries `protection_level`, normalised to `[0, 10]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RankSumMetric {
    name: String,
    protection_level: String,
    normalizer: f64,
}

impl RankSumMetric {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protection_level: DEFAULT_RANK_SUM_PROTECTION_LEVEL.to_string(),
            normalizer: DEFAULT_RANK_SUM_NORMALIZER,
        }
    }

    #[must_use]
    pub fn rpn_droid() -> Self {
        Self::new("RPNDroid")
    }

    #[must_use]
    pub fn with_protection_level(mut self, protection_level: impl Into<String>) -> Self {
        self.protection_level = protection_level.into();
        self
    }

    #[must_use]
    pub fn with_normalizer(mut self, normalizer: f64) -> Self {
        self.normalizer = normalizer;
        self
    }
}

impl Metric for RankSumMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Option<&str> {
        Some("rank-sum")
    }

    fn score(&self, app: &App, ledger: &PrivacyRank) -> Result<Option<f64>, MetricError> {
        if !self.normalizer.is_finite() || self.normalizer <= 0.0 {
            return Err(MetricError::Unscorable {
                metric: self.name.clone(),
                app_hash: app.hash.clone(),
                reason: format!("normalizer {} MUST be positive", self.normalizer),
            });
        }

        let total: f64 = app
            .uses_permissions
            .iter()
            .filter(|permission| permission.has_protection_level(&self.protection_level))
            .filter_map(|permission| ledger.find_permission_rank(&permission.name))
            .map(|rank| rank.value)
            .sum();

        Ok(Some((total / self.normalizer * MAX_SCORE).clamp(MIN_SCORE, MAX_SCORE)))
    }
}

/// Fixed package-to-score table, typically transcribed from a published study.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreTableMetric {
    name: String,
    scores: BTreeMap<String, f64>,
}

impl ScoreTableMetric {
    #[must_use]
    pub fn new(name: impl Into<String>, scores: BTreeMap<String, f64>) -> Self {
        Self { name: name.into(), scores }
    }
}

impl Metric for ScoreTableMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Option<&str> {
        Some("score-table")
    }

    fn candidate_packages(&self) -> Option<BTreeSet<String>> {
        Some(self.scores.keys().cloned().collect())
    }

    fn score(&self, app: &App, _ledger: &PrivacyRank) -> Result<Option<f64>, MetricError> {
        Ok(self.scores.get(&app.package).copied())
    }
}
