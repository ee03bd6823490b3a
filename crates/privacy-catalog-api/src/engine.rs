use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use privacy_catalog_core::{Metric, MetricError, Score, MAX_SCORE, MIN_SCORE};
use privacy_catalog_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricRunSummary {
    pub name: String,
    /// Catalogued apps this metric may score, after candidate narrowing.
    pub universe: usize,
    pub already_scored: usize,
    pub remaining: usize,
    pub scored: usize,
    /// Apps the metric had nothing to say about.
    pub unscored: usize,
    /// Apps the metric failed on; they stay unscored and are retried next run.
    pub unscorable: usize,
    /// First error seen by this metric, per app or fatal.
    pub failure: Option<String>,
    pub interrupted: bool,
}

impl MetricRunSummary {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            universe: 0,
            already_scored: 0,
            remaining: 0,
            scored: 0,
            unscored: 0,
            unscorable: 0,
            failure: None,
            interrupted: false,
        }
    }

    fn record_unscorable(&mut self, err: &MetricError) {
        tracing::warn!("metric {} skipped an app: {err}", self.name);
        self.unscorable += 1;
        if self.failure.is_none() {
            self.failure = Some(err.to_string());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineReport {
    pub run_id: String,
    pub metrics: Vec<MetricRunSummary>,
    /// New scores persisted across every metric in this run.
    pub scored: usize,
}

impl EngineReport {
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.metrics.iter().any(|summary| summary.interrupted)
    }
}

/// Drives an ordered metric registry over the catalogue, scoring each app at
/// most once per metric.
pub struct MetricEngine {
    metrics: Vec<Box<dyn Metric>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl MetricEngine {
    #[must_use]
    pub fn new(metrics: Vec<Box<dyn Metric>>) -> Self {
        Self { metrics, cancel: None }
    }

    /// Stop cleanly before the next app once `flag` is set. A later run picks
    /// up where this one stopped.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[must_use]
    pub fn metric_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|metric| metric.name()).collect()
    }

    /// Run every metric in registry order. An app a metric fails on is counted
    /// as unscorable and the metric moves on; a storage failure ends that
    /// metric only, and the next metric still runs.
    pub fn run_all(&self, store: &mut SqliteStore) -> EngineReport {
        let run_id = Ulid::new().to_string();
        tracing::info!("metric run {run_id} starting with {} metrics", self.metrics.len());

        let mut report = EngineReport { run_id, metrics: Vec::with_capacity(self.metrics.len()), scored: 0 };
        for metric in &self.metrics {
            let mut summary = MetricRunSummary::new(metric.name());
            if self.cancelled() {
                summary.interrupted = true;
                report.metrics.push(summary);
                continue;
            }

            if let Err(err) = self.run_metric(metric.as_ref(), store, &mut summary) {
                tracing::error!("metric {} failed in run {}: {err}", summary.name, report.run_id);
                summary.failure = Some(err.to_string());
            }
            tracing::info!(
                "metric {}: {} remaining, {} scored, {} unscored, {} unscorable",
                summary.name,
                summary.remaining,
                summary.scored,
                summary.unscored,
                summary.unscorable
            );
            report.scored += summary.scored;
            report.metrics.push(summary);
        }

        report
    }

    fn run_metric(
        &self,
        metric: &dyn Metric,
        store: &mut SqliteStore,
        summary: &mut MetricRunSummary,
    ) -> Result<(), ApiError> {
        let ledger = store.ensure_privacy_rank(metric.name(), metric.source())?;
        let done = ledger.scored_app_hashes();

        let universe: BTreeSet<String> = match metric.candidate_packages() {
            Some(packages) => {
                let mut narrowed = BTreeSet::new();
                for package in &packages {
                    narrowed.extend(store.app_hashes_by_package(package)?);
                }
                narrowed
            }
            None => store.app_hashes()?.into_iter().collect(),
        };
        let remaining: Vec<&String> = universe.difference(&done).collect();
        summary.universe = universe.len();
        summary.already_scored = summary.universe - remaining.len();
        summary.remaining = remaining.len();

        for hash in remaining {
            if self.cancelled() {
                tracing::warn!("metric {} interrupted after {} scores", summary.name, summary.scored);
                summary.interrupted = true;
                break;
            }
            let Some(app) = store.download_app(hash)? else {
                continue;
            };

            let value = match metric.score(&app, &ledger) {
                Ok(Some(value)) if (MIN_SCORE..=MAX_SCORE).contains(&value) => value,
                Ok(Some(value)) => {
                    summary.record_unscorable(&MetricError::OutOfRange {
                        metric: summary.name.clone(),
                        app_hash: app.hash,
                        value,
                    });
                    continue;
                }
                Ok(None) => {
                    summary.unscored += 1;
                    continue;
                }
                Err(err) => {
                    summary.record_unscorable(&err);
                    continue;
                }
            };

            let score = Score { value, app_hash: app.hash, rank_name: summary.name.clone() };
            summary.scored += store.load_score(&score)?.rows_affected;
        }

        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use anyhow::Result;
    use privacy_catalog_core::{App, Permission, PrivacyRank, Rank, RankSumMetric, ScoreTableMetric};

    use super::*;

    fn memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn app_using_camera(hash: &str, package: &str) -> App {
        App {
            uses_permissions: vec![Permission {
                protection_level: Some("dangerous".to_string()),
                ..Permission::new("android.permission.CAMERA")
            }],
            ..App::new(hash, package)
        }
    }

    /// Scores every app with a fixed value, or fails on one package.
    struct FixedMetric {
        name: String,
        value: f64,
        fail_on: Option<String>,
        cancel_after_first: Option<Arc<AtomicBool>>,
    }

    impl FixedMetric {
        fn new(name: &str, value: f64) -> Self {
            Self { name: name.to_string(), value, fail_on: None, cancel_after_first: None }
        }
    }

    impl Metric for FixedMetric {
        fn name(&self) -> &str {
            &self.name
        }

        fn score(&self, app: &App, _ledger: &PrivacyRank) -> Result<Option<f64>, MetricError> {
            if self.fail_on.as_deref() == Some(app.package.as_str()) {
                return Err(MetricError::Unscorable {
                    metric: self.name.clone(),
                    app_hash: app.hash.clone(),
                    reason: "fixture failure".to_string(),
                });
            }
            if let Some(flag) = &self.cancel_after_first {
                flag.store(true, Ordering::SeqCst);
            }
            Ok(Some(self.value))
        }
    }

    #[test]
    fn rank_sum_scores_once_and_converges() -> Result<()> {
        let mut store = memory_store()?;
        store.load_app(&app_using_camera("H1", "com.example"))?;
        store.load_privacy_rank(&PrivacyRank {
            ranks: vec![Rank {
                value: 5.0,
                permission_name: "android.permission.CAMERA".to_string(),
                rank_name: "R1".to_string(),
            }],
            ..PrivacyRank::new("R1")
        })?;

        let engine = MetricEngine::new(vec![Box::new(RankSumMetric::new("R1").with_normalizer(10.0))]);
        let first = engine.run_all(&mut store);
        assert_eq!(first.scored, 1);
        assert_eq!(first.metrics[0].failure, None);

        let scores = store.scores_by_app("H1")?;
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].rank_name, "R1");
        assert!((scores[0].value - 5.0).abs() < 1e-9);

        let second = engine.run_all(&mut store);
        assert_eq!(second.scored, 0);
        assert_eq!(second.metrics[0].already_scored, 1);
        assert_eq!(second.metrics[0].remaining, 0);
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(store.scores_by_rank("R1")?.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_ledger_is_created_on_first_run() -> Result<()> {
        let mut store = memory_store()?;
        store.load_app(&app_using_camera("H1", "com.example"))?;

        let report = MetricEngine::new(vec![Box::new(RankSumMetric::rpn_droid())]).run_all(&mut store);
        assert_eq!(report.scored, 1);

        let Some(ledger) = store.download_privacy_rank("RPNDroid")? else {
            panic!("engine should create the RPNDroid ledger");
        };
        assert_eq!(ledger.source.as_deref(), Some("rank-sum"));
        assert_eq!(ledger.scored_app_hashes(), BTreeSet::from(["H1".to_string()]));
        Ok(())
    }

    #[test]
    fn candidate_packages_restrict_the_universe() -> Result<()> {
        let mut store = memory_store()?;
        store.load_app(&App::new("h1", "com.example"))?;
        store.load_app(&App::new("h2", "com.other"))?;
        store.load_app(&App::new("h3", "com.example.lite"))?;

        let table = BTreeMap::from([("com.example".to_string(), 7.0)]);
        let report =
            MetricEngine::new(vec![Box::new(ScoreTableMetric::new("Paper", table))]).run_all(&mut store);

        assert_eq!(report.metrics[0].universe, 1);
        let hashes: Vec<String> =
            store.scores_by_rank("Paper")?.into_iter().map(|score| score.app_hash).collect();
        assert_eq!(hashes, vec!["h1".to_string()]);
        Ok(())
    }

    #[test]
    fn failing_metric_does_not_block_the_next_one() -> Result<()> {
        let mut store = memory_store()?;
        store.load_app(&App::new("h1", "com.broken"))?;
        store.load_app(&App::new("h2", "com.fine"))?;

        let broken = FixedMetric { fail_on: Some("com.broken".to_string()), ..FixedMetric::new("Broken", 1.0) };
        let engine = MetricEngine::new(vec![
            Box::new(broken),
            Box::new(FixedMetric::new("TooHigh", 11.0)),
            Box::new(FixedMetric::new("Fine", 2.0)),
        ]);
        let report = engine.run_all(&mut store);

        assert!(report.metrics[0].failure.is_some());
        assert_eq!((report.metrics[0].scored, report.metrics[0].unscorable), (1, 1));
        assert!(report.metrics[1].failure.as_deref().is_some_and(|msg| msg.contains("out-of-range")));
        assert_eq!(report.metrics[1].unscorable, 2);
        assert_eq!(report.metrics[2].failure, None);
        assert_eq!(report.metrics[2].scored, 2);
        assert!(store.scores_by_rank("TooHigh")?.is_empty());
        Ok(())
    }

    #[test]
    fn unscorable_app_does_not_starve_later_apps() -> Result<()> {
        let mut store = memory_store()?;
        store.load_app(&App::new("h0", "com.broken"))?;
        store.load_app(&App::new("h1", "com.fine"))?;
        store.load_app(&App::new("h2", "com.fine.lite"))?;

        let metric = FixedMetric { fail_on: Some("com.broken".to_string()), ..FixedMetric::new("Fixed", 4.0) };
        let engine = MetricEngine::new(vec![Box::new(metric)]);

        let first = engine.run_all(&mut store);
        assert_eq!(first.scored, 2);
        assert_eq!(first.metrics[0].unscorable, 1);

        let second = engine.run_all(&mut store);
        assert_eq!(second.metrics[0].remaining, 1);
        assert_eq!((second.scored, second.metrics[0].unscorable), (0, 1));
        let hashes: Vec<String> =
            store.scores_by_rank("Fixed")?.into_iter().map(|score| score.app_hash).collect();
        assert_eq!(hashes, vec!["h1".to_string(), "h2".to_string()]);
        Ok(())
    }

    #[test]
    fn cancelled_run_resumes_without_rescoring() -> Result<()> {
        let mut store = memory_store()?;
        for index in 0..3 {
            store.load_app(&App::new(format!("h{index}"), "com.example"))?;
        }

        let flag = Arc::new(AtomicBool::new(false));
        let metric = FixedMetric {
            cancel_after_first: Some(Arc::clone(&flag)),
            ..FixedMetric::new("Fixed", 3.0)
        };
        let engine = MetricEngine::new(vec![Box::new(metric)]).with_cancel_flag(Arc::clone(&flag));

        let first = engine.run_all(&mut store);
        assert!(first.interrupted());
        assert_eq!(first.scored, 1);

        flag.store(false, Ordering::SeqCst);
        let resumed = engine.run_all(&mut store);
        assert!(resumed.interrupted());
        assert_eq!(resumed.metrics[0].already_scored, 1);
        assert_eq!(resumed.scored, 1);

        flag.store(false, Ordering::SeqCst);
        let last = engine.run_all(&mut store);
        assert_eq!(last.scored, 1);
        assert!(!last.interrupted());
        assert_eq!(store.scores_by_rank("Fixed")?.len(), 3);
        Ok(())
    }
}
