use std::path::PathBuf;

use privacy_catalog_core::{
    decode_document, App, AzMetadata, CatalogError, Entity, EntityKind, ExtractionMetadata,
    IngestPolicy, MetricError, Permission, PrivacyRank,
};
use privacy_catalog_store_sqlite::{IntegrityReport, LoadOutcome, SqliteStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod config;
mod engine;

pub use config::{CatalogConfig, ConfigError, IngestConfig, MetricDescriptor};
pub use engine::{EngineReport, MetricEngine, MetricRunSummary};

pub const API_CONTRACT_VERSION: &str = "catalog.v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// Coarse outcome an outer surface can report without knowing the error types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Lock contention; the same call may succeed later.
    Busy,
    /// The input itself was refused: bad document, divergent entity, disallowed kind.
    Rejected,
    Failed,
}

impl ApiError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(err) if err.is_retryable() => ErrorClass::Busy,
            Self::Store(
                StoreError::Conflict { .. } | StoreError::Unroutable(_) | StoreError::Catalog(_),
            )
            | Self::Catalog(_) => ErrorClass::Rejected,
            Self::Store(_) | Self::Config(_) | Self::Metric(_) => ErrorClass::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestedEntity {
    pub kind: EntityKind,
    pub key: String,
    pub rows_affected: usize,
    pub cascade_rows: usize,
    pub skipped: usize,
}

impl From<LoadOutcome> for IngestedEntity {
    fn from(outcome: LoadOutcome) -> Self {
        Self {
            kind: outcome.kind,
            key: outcome.key,
            rows_affected: outcome.rows_affected,
            cascade_rows: outcome.cascade_rows,
            skipped: outcome.skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub document_sha256: String,
    pub entities: Vec<IngestedEntity>,
    /// Root rows newly written across the document.
    pub rows_affected: usize,
}

/// Library entry point for outer surfaces: one short-lived store handle per call.
#[derive(Debug, Clone)]
pub struct PrivacyCatalogApi {
    db_path: PathBuf,
    config: CatalogConfig,
}

impl PrivacyCatalogApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_config(db_path, CatalogConfig::default())
    }

    #[must_use]
    pub fn with_config(db_path: PathBuf, config: CatalogConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore, ApiError> {
        let mut store = SqliteStore::open_with_options(&self.db_path, self.config.store_options())?;
        store.migrate()?;
        Ok(store)
    }

    /// Create the schema if needed and report its version.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn migrate(&self) -> Result<i64, ApiError> {
        let store = self.open_store()?;
        Ok(store.schema_version()?)
    }

    /// Read the schema version without applying the catalogue schema.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_version(&self) -> Result<i64, ApiError> {
        let store = SqliteStore::open_with_options(&self.db_path, self.config.store_options())?;
        Ok(store.schema_version()?)
    }

    /// # Errors
    /// Returns an error when the integrity checks cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport, ApiError> {
        let store = self.open_store()?;
        Ok(store.integrity_check()?)
    }

    /// Ingest a document under the configured allowlist.
    ///
    /// # Errors
    /// See [`PrivacyCatalogApi::ingest_with_policy`].
    pub fn ingest(&self, text: &str) -> Result<IngestReport, ApiError> {
        let policy = self.config.ingest_policy()?;
        self.ingest_with_policy(text, &policy)
    }

    /// Decode the whole document, then load its entities in document order.
    /// Each entity commits on its own, so a storage failure leaves the
    /// entities before it in place.
    ///
    /// # Errors
    /// Returns [`ApiError::Catalog`] when the document is rejected (nothing is
    /// loaded) and [`ApiError::Store`] when a load fails.
    pub fn ingest_with_policy(
        &self,
        text: &str,
        policy: &IngestPolicy,
    ) -> Result<IngestReport, ApiError> {
        let document_sha256 = format!("{:x}", Sha256::digest(text.as_bytes()));
        let entities = decode_document(text, policy)
            .inspect_err(|err| tracing::warn!("rejected document {document_sha256}: {err}"))?;

        let mut store = self.open_store()?;
        let mut report =
            IngestReport { document_sha256, entities: Vec::with_capacity(entities.len()), rows_affected: 0 };
        for entity in &entities {
            let outcome = store.load_entity(entity)?;
            report.rows_affected += outcome.rows_affected;
            report.entities.push(outcome.into());
        }

        tracing::info!(
            "ingested document {}: {} entities, {} new rows",
            report.document_sha256,
            report.entities.len(),
            report.rows_affected
        );
        Ok(report)
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn load(&self, entity: &Entity) -> Result<LoadOutcome, ApiError> {
        let mut store = self.open_store()?;
        Ok(store.load_entity(entity)?)
    }

    /// Append provenance to an app that is already catalogued.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn append_extraction_metadata(
        &self,
        app_hash: &str,
        meta: &ExtractionMetadata,
    ) -> Result<LoadOutcome, ApiError> {
        let mut store = self.open_store()?;
        Ok(store.load_extraction_metadata(app_hash, meta)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn app(&self, hash: &str) -> Result<Option<App>, ApiError> {
        Ok(self.open_store()?.download_app(hash)?)
    }

    /// Latest version of the best match for `package`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn latest_app(&self, package: &str) -> Result<Option<App>, ApiError> {
        Ok(self.open_store()?.download_latest_app(package)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn app_hashes(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.open_store()?.app_hashes()?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn app_versions(&self, package: &str) -> Result<Vec<(String, Option<String>)>, ApiError> {
        Ok(self.open_store()?.app_versions_by_package(package)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn extraction_metadata(&self, app_hash: &str) -> Result<Vec<ExtractionMetadata>, ApiError> {
        Ok(self.open_store()?.download_extraction_metadata(app_hash)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn permission(&self, name: &str) -> Result<Option<Permission>, ApiError> {
        Ok(self.open_store()?.download_permission(name)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn privacy_rank(&self, name: &str) -> Result<Option<PrivacyRank>, ApiError> {
        Ok(self.open_store()?.download_privacy_rank(name)?)
    }

    /// Marketplace snapshots of an app, or the single snapshot taken on `date`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn az_metadata(&self, app_hash: &str, date: Option<&str>) -> Result<Vec<AzMetadata>, ApiError> {
        let store = self.open_store()?;
        match date {
            Some(date) => Ok(store.download_az_metadata(app_hash, date)?.into_iter().collect()),
            None => Ok(store.download_az_metadata_list(app_hash)?),
        }
    }

    /// Run the configured metric registry once.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be built or the store cannot
    /// be opened; per-metric failures are reported inside [`EngineReport`].
    pub fn run_metrics(&self) -> Result<EngineReport, ApiError> {
        let engine = MetricEngine::new(self.config.build_metrics()?);
        self.run_engine(&engine)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened.
    pub fn run_engine(&self, engine: &MetricEngine) -> Result<EngineReport, ApiError> {
        let mut store = self.open_store()?;
        Ok(engine.run_all(&mut store))
    }
}
