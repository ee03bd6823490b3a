use std::path::Path;
use std::time::Duration;

use privacy_catalog_core::{
    App, AzDependency, AzMetadata, CatalogError, Entity, EntityKind, ExtractionMetadata,
    Permission, PermissionGroup, PrivacyRank, Rank, Score,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, ToSql, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod downloads;
mod loaders;

pub use downloads::Reader;
pub use loaders::{EntityLoader, Loader};

pub const SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS app (
  hash TEXT PRIMARY KEY,
  package TEXT NOT NULL,
  version_code INTEGER,
  version_name TEXT,
  min_sdk INTEGER,
  target_sdk INTEGER,
  max_sdk INTEGER,
  category TEXT
);

CREATE TABLE IF NOT EXISTS permission (
  name TEXT PRIMARY KEY,
  protection_level TEXT
);

CREATE TABLE IF NOT EXISTS permission_group (
  name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS android_permission_group (
  name TEXT PRIMARY KEY,
  added_in_api TEXT,
  FOREIGN KEY (name) REFERENCES permission_group(name)
);

CREATE TABLE IF NOT EXISTS android_permission (
  name TEXT PRIMARY KEY,
  added_in_api TEXT,
  group_name TEXT,
  FOREIGN KEY (name) REFERENCES permission(name),
  FOREIGN KEY (group_name) REFERENCES permission_group(name)
);

CREATE TABLE IF NOT EXISTS privacy_rank (
  name TEXT PRIMARY KEY,
  source TEXT,
  timestamp TEXT
);

CREATE TABLE IF NOT EXISTS permission_rank (
  value REAL NOT NULL,
  permission_name TEXT NOT NULL,
  privacy_rank_name TEXT NOT NULL,
  PRIMARY KEY (permission_name, privacy_rank_name),
  FOREIGN KEY (permission_name) REFERENCES permission(name),
  FOREIGN KEY (privacy_rank_name) REFERENCES privacy_rank(name)
);

CREATE TABLE IF NOT EXISTS score (
  value REAL NOT NULL CHECK (value >= 0 AND value <= 10),
  app_hash TEXT NOT NULL,
  privacy_rank_name TEXT NOT NULL,
  PRIMARY KEY (app_hash, privacy_rank_name),
  FOREIGN KEY (app_hash) REFERENCES app(hash),
  FOREIGN KEY (privacy_rank_name) REFERENCES privacy_rank(name)
);

CREATE TABLE IF NOT EXISTS extraction_metadata (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source TEXT,
  method TEXT,
  timestamp TEXT,
  app_hash TEXT NOT NULL,
  FOREIGN KEY (app_hash) REFERENCES app(hash)
);

CREATE TABLE IF NOT EXISTS az_metadata (
  app_hash TEXT NOT NULL,
  date TEXT NOT NULL,
  ratings_count INTEGER,
  star_rating REAL,
  comment_count INTEGER,
  one_star_ratings INTEGER,
  two_star_ratings INTEGER,
  three_star_ratings INTEGER,
  four_star_ratings INTEGER,
  five_star_ratings INTEGER,
  upload_date TEXT,
  creator TEXT,
  developer_name TEXT,
  developer_address TEXT,
  developer_email TEXT,
  developer_website TEXT,
  size INTEGER,
  num_downloads TEXT,
  app_url TEXT,
  app_title TEXT,
  privacy_policy_url TEXT,
  PRIMARY KEY (app_hash, date),
  FOREIGN KEY (app_hash) REFERENCES app(hash)
);

CREATE TABLE IF NOT EXISTS az_dependency (
  package TEXT NOT NULL,
  version_code INTEGER NOT NULL,
  PRIMARY KEY (package, version_code)
);

CREATE TABLE IF NOT EXISTS app_defines_group (
  group_name TEXT NOT NULL,
  app_hash TEXT NOT NULL,
  PRIMARY KEY (app_hash, group_name),
  FOREIGN KEY (group_name) REFERENCES permission_group(name),
  FOREIGN KEY (app_hash) REFERENCES app(hash)
);

CREATE TABLE IF NOT EXISTS app_defines_permission (
  app_hash TEXT NOT NULL,
  permission_name TEXT NOT NULL,
  PRIMARY KEY (app_hash, permission_name),
  FOREIGN KEY (app_hash) REFERENCES app(hash),
  FOREIGN KEY (permission_name) REFERENCES permission(name)
);

CREATE TABLE IF NOT EXISTS app_uses_permission (
  app_hash TEXT NOT NULL,
  permission_name TEXT NOT NULL,
  PRIMARY KEY (app_hash, permission_name),
  FOREIGN KEY (app_hash) REFERENCES app(hash),
  FOREIGN KEY (permission_name) REFERENCES permission(name)
);

CREATE TABLE IF NOT EXISTS app_bind_permission_to_group (
  group_name TEXT NOT NULL,
  permission_name TEXT NOT NULL,
  app_hash TEXT NOT NULL,
  PRIMARY KEY (app_hash, permission_name, group_name),
  FOREIGN KEY (group_name) REFERENCES permission_group(name),
  FOREIGN KEY (permission_name) REFERENCES permission(name),
  FOREIGN KEY (app_hash) REFERENCES app(hash)
);

CREATE TABLE IF NOT EXISTS az_bind_dependency (
  app_hash TEXT NOT NULL,
  date TEXT NOT NULL,
  package TEXT NOT NULL,
  version_code INTEGER NOT NULL,
  PRIMARY KEY (app_hash, date, package, version_code),
  FOREIGN KEY (app_hash, date) REFERENCES az_metadata(app_hash, date),
  FOREIGN KEY (package, version_code) REFERENCES az_dependency(package, version_code)
);

CREATE INDEX IF NOT EXISTS idx_app_package ON app(package);
CREATE INDEX IF NOT EXISTS idx_score_privacy_rank ON score(privacy_rank_name);
CREATE INDEX IF NOT EXISTS idx_permission_rank_privacy_rank ON permission_rank(privacy_rank_name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_extraction_metadata_event
  ON extraction_metadata(app_hash, IFNULL(source, ''), IFNULL(method, ''), IFNULL(timestamp, ''));
CREATE INDEX IF NOT EXISTS idx_az_bind_dependency_target ON az_bind_dependency(package, version_code);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage failure during `{operation}`: {source}")]
    Storage {
        operation: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{entity} `{key}` is already stored with different contents")]
    Conflict { entity: EntityKind, key: String },
    #[error("{0} has no key of its own; load it through its owning app")]
    Unroutable(EntityKind),
    #[error("unsupported schema version {found}; expected {expected}")]
    UnsupportedSchema { found: i64, expected: i64 },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl StoreError {
    pub(crate) fn storage(operation: &str, source: rusqlite::Error) -> Self {
        Self::Storage { operation: statement_label(operation), source }
    }

    /// Lock contention is worth retrying; every other failure is fatal for the call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { source: rusqlite::Error::SqliteFailure(err, _), .. } => {
                matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }
}

/// What happens when an incoming entity carries a key that is already stored
/// with different field values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// First writer wins silently.
    #[default]
    Ignore,
    /// First writer wins; the divergence is logged.
    Warn,
    /// The load fails and its transaction rolls back.
    Reject,
}

impl ConflictPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Warn => "warn",
            Self::Reject => "reject",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ignore" => Some(Self::Ignore),
            "warn" => Some(Self::Warn),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoreOptions {
    pub busy_timeout_ms: u64,
    pub conflict_policy: ConflictPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS, conflict_policy: ConflictPolicy::Ignore }
    }
}

/// Result of one `load_*` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadOutcome {
    pub kind: EntityKind,
    pub key: String,
    /// Rows written for the entity itself: 1 on first load, 0 afterwards.
    pub rows_affected: usize,
    /// Rows written for owned sub-entities and binds.
    pub cascade_rows: usize,
    /// Sub-entities skipped because a referenced entity is not catalogued.
    pub skipped: usize,
}

impl LoadOutcome {
    pub(crate) fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self { kind, key: key.into(), rows_affected: 0, cascade_rows: 0, skipped: 0 }
    }

    pub(crate) fn absorb(&mut self, child: &Self) {
        self.cascade_rows += child.rows_affected + child.cascade_rows;
        self.skipped += child.skipped;
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.rows_affected + self.cascade_rows
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_version: i64,
}

/// Parameterized write/read primitives the loaders are written against.
pub trait Executor {
    /// Run one statement and return the rows it changed. A unique or primary
    /// key violation is reported as zero rows.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] for every other failure.
    fn write(&self, statement: &str, params: &[&dyn ToSql]) -> Result<usize, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Storage`] when the query or the row mapping fails.
    fn read_one<T, F>(&self, query: &str, params: &[&dyn ToSql], map: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>;

    /// # Errors
    /// Returns [`StoreError::Storage`] when the query or any row mapping fails.
    fn read_all<T, F>(&self, query: &str, params: &[&dyn ToSql], map: F) -> Result<Vec<T>, StoreError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>;
}

impl Executor for Connection {
    fn write(&self, statement: &str, params: &[&dyn ToSql]) -> Result<usize, StoreError> {
        match self.prepare_cached(statement).and_then(|mut stmt| stmt.execute(params)) {
            Ok(rows) => Ok(rows),
            Err(err) if is_duplicate_key(&err) => Ok(0),
            Err(err) => Err(StoreError::storage(statement, err)),
        }
    }

    fn read_one<T, F>(&self, query: &str, params: &[&dyn ToSql], map: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.query_row(query, params, map)
            .optional()
            .map_err(|err| StoreError::storage(query, err))
    }

    fn read_all<T, F>(&self, query: &str, params: &[&dyn ToSql], map: F) -> Result<Vec<T>, StoreError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.prepare_cached(query).map_err(|err| StoreError::storage(query, err))?;
        let rows = stmt.query_map(params, map).map_err(|err| StoreError::storage(query, err))?;
        rows.collect::<rusqlite::Result<Vec<T>>>().map_err(|err| StoreError::storage(query, err))
    }
}

fn is_duplicate_key(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn statement_label(statement: &str) -> String {
    statement.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

pub struct SqliteStore {
    conn: Connection,
    options: StoreOptions,
}

impl SqliteStore {
    /// Open a SQLite-backed catalogue with default options.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Open a SQLite-backed catalogue and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_options(path: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|err| StoreError::storage(&format!("open {}", path.display()), err))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|err| StoreError::storage("configure pragmas", err))?;
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))
            .map_err(|err| StoreError::storage("configure busy timeout", err))?;

        Ok(Self { conn, options })
    }

    #[must_use]
    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Create the catalogue schema if it is missing.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be applied or the database
    /// records a newer schema than this build understands.
    pub fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(|err| StoreError::storage("create schema_migrations", err))?;

        match self.schema_version()? {
            0 => {
                let tx = self
                    .conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|err| StoreError::storage("begin migration", err))?;
                tx.execute_batch(MIGRATION_001_SQL)
                    .map_err(|err| StoreError::storage("apply migration 1", err))?;
                tx.execute(
                    "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                    params![SCHEMA_VERSION, now_timestamp()],
                )
                .map_err(|err| StoreError::storage("record schema version", err))?;
                tx.commit().map_err(|err| StoreError::storage("commit migration", err))?;
                tracing::info!("created catalogue schema version {SCHEMA_VERSION}");
                Ok(())
            }
            SCHEMA_VERSION => Ok(()),
            found => Err(StoreError::UnsupportedSchema { found, expected: SCHEMA_VERSION }),
        }
    }

    /// Highest recorded schema version, 0 for an empty database.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(|err| StoreError::storage("create schema_migrations", err))?;
        let version = self.conn.read_one(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            &[],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    /// Run quick-check and foreign-key-check health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let quick_check_message = self
            .conn
            .read_one("PRAGMA quick_check", &[], |row| row.get::<_, String>(0))?
            .unwrap_or_default();

        let foreign_key_violations =
            self.conn.read_all("PRAGMA foreign_key_check", &[], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_version: self.schema_version()?,
        })
    }

    /// Route a decoded entity to its loader inside one transaction.
    ///
    /// # Errors
    /// Returns [`StoreError::Unroutable`] for extraction metadata without an
    /// owning app, and any error of the matching `load_*` call.
    pub fn load_entity(&mut self, entity: &Entity) -> Result<LoadOutcome, StoreError> {
        match entity {
            Entity::App(app) => self.load_app(app),
            Entity::Permission(permission) => self.load_permission(permission),
            Entity::PermissionGroup(group) => self.load_permission_group(group),
            Entity::Rank(rank) => self.load_rank(rank),
            Entity::Score(score) => self.load_score(score),
            Entity::PrivacyRank(rank) => self.load_privacy_rank(rank),
            Entity::ExtractionMetadata(_) => {
                Err(StoreError::Unroutable(EntityKind::ExtractionMetadata))
            }
            Entity::AzMetadata(meta) => self.load_az_metadata(meta),
            Entity::AzDependency(dep) => self.load_az_dependency(dep),
        }
    }

    /// Load an app with its permissions, groups, provenance, scores and binds.
    /// An already stored app is left untouched and nothing below it is loaded.
    ///
    /// # Errors
    /// Returns an error when validation or any write fails; the whole cascade rolls back.
    pub fn load_app(&mut self, app: &App) -> Result<LoadOutcome, StoreError> {
        app.validate()?;
        self.in_transaction("load app", |loader| loader.load(app))
    }

    /// # Errors
    /// Returns an error when validation or any write fails; the whole cascade rolls back.
    pub fn load_permission(&mut self, permission: &Permission) -> Result<LoadOutcome, StoreError> {
        permission.validate()?;
        self.in_transaction("load permission", |loader| loader.load(permission))
    }

    /// # Errors
    /// Returns an error when validation or any write fails.
    pub fn load_permission_group(
        &mut self,
        group: &PermissionGroup,
    ) -> Result<LoadOutcome, StoreError> {
        group.validate()?;
        self.in_transaction("load permission group", |loader| loader.load(group))
    }

    /// # Errors
    /// Returns an error when validation or the write fails.
    pub fn load_rank(&mut self, rank: &Rank) -> Result<LoadOutcome, StoreError> {
        rank.validate()?;
        self.in_transaction("load rank", |loader| loader.load(rank))
    }

    /// # Errors
    /// Returns an error when validation or the write fails.
    pub fn load_score(&mut self, score: &Score) -> Result<LoadOutcome, StoreError> {
        score.validate()?;
        self.in_transaction("load score", |loader| loader.load(score))
    }

    /// Load a privacy rank. Its ranks and scores are always visited so a
    /// ledger created earlier still receives later contributions.
    ///
    /// # Errors
    /// Returns an error when validation or any write fails; the whole cascade rolls back.
    pub fn load_privacy_rank(&mut self, rank: &PrivacyRank) -> Result<LoadOutcome, StoreError> {
        rank.validate()?;
        self.in_transaction("load privacy rank", |loader| loader.load(rank))
    }

    /// Append one provenance record to an already catalogued app.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn load_extraction_metadata(
        &mut self,
        app_hash: &str,
        meta: &ExtractionMetadata,
    ) -> Result<LoadOutcome, StoreError> {
        self.in_transaction("load extraction metadata", |loader| {
            loader.extraction_metadata(app_hash, meta)
        })
    }

    /// # Errors
    /// Returns an error when validation or any write fails; the whole cascade rolls back.
    pub fn load_az_metadata(&mut self, meta: &AzMetadata) -> Result<LoadOutcome, StoreError> {
        meta.validate()?;
        self.in_transaction("load az metadata", |loader| loader.load(meta))
    }

    /// # Errors
    /// Returns an error when validation or the write fails.
    pub fn load_az_dependency(&mut self, dep: &AzDependency) -> Result<LoadOutcome, StoreError> {
        dep.validate()?;
        self.in_transaction("load az dependency", |loader| loader.load(dep))
    }

    /// Fetch a privacy rank, creating an empty one first when it does not exist.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be written or read back.
    pub fn ensure_privacy_rank(
        &mut self,
        name: &str,
        source: Option<&str>,
    ) -> Result<PrivacyRank, StoreError> {
        let ledger = PrivacyRank {
            source: source.map(str::to_string),
            timestamp: Some(now_timestamp()),
            ..PrivacyRank::new(name)
        };
        ledger.validate()?;
        let (created, stored) = self.in_transaction("ensure privacy rank", |loader| {
            let created =
                loader.create_privacy_rank(&ledger.name, source, ledger.timestamp.as_deref().unwrap_or_default())?;
            let stored = Reader::new(loader.executor()).privacy_rank(name)?;
            Ok((created, stored))
        })?;
        if created > 0 {
            tracing::info!("created empty privacy rank ledger {name}");
        }
        Ok(stored.unwrap_or(ledger))
    }

    /// # Errors
    /// Returns an error when any read fails.
    pub fn download_app(&self, hash: &str) -> Result<Option<App>, StoreError> {
        self.read(|reader| reader.app(hash))
    }

    /// Permission with every group any app bound it to.
    ///
    /// # Errors
    /// Returns an error when any read fails.
    pub fn download_permission(&self, name: &str) -> Result<Option<Permission>, StoreError> {
        self.read(|reader| reader.permission(name, None))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn download_permission_group(
        &self,
        name: &str,
    ) -> Result<Option<PermissionGroup>, StoreError> {
        self.read(|reader| reader.permission_group(name))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn download_rank(
        &self,
        permission_name: &str,
        rank_name: &str,
    ) -> Result<Option<Rank>, StoreError> {
        self.read(|reader| reader.rank(permission_name, rank_name))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn download_score(&self, app_hash: &str, rank_name: &str) -> Result<Option<Score>, StoreError> {
        self.read(|reader| reader.score(app_hash, rank_name))
    }

    /// # Errors
    /// Returns an error when any read fails.
    pub fn download_privacy_rank(&self, name: &str) -> Result<Option<PrivacyRank>, StoreError> {
        self.read(|reader| reader.privacy_rank(name))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn download_extraction_metadata(
        &self,
        app_hash: &str,
    ) -> Result<Vec<ExtractionMetadata>, StoreError> {
        self.read(|reader| reader.extraction_metadata(app_hash))
    }

    /// # Errors
    /// Returns an error when any read fails.
    pub fn download_az_metadata(
        &self,
        app_hash: &str,
        date: &str,
    ) -> Result<Option<AzMetadata>, StoreError> {
        self.read(|reader| reader.az_metadata(app_hash, date))
    }

    /// Every marketplace snapshot of an app, oldest date first.
    ///
    /// # Errors
    /// Returns an error when any read fails.
    pub fn download_az_metadata_list(&self, app_hash: &str) -> Result<Vec<AzMetadata>, StoreError> {
        self.read(|reader| reader.az_metadata_list(app_hash))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn download_az_dependency(
        &self,
        package: &str,
        version_code: i64,
    ) -> Result<Option<AzDependency>, StoreError> {
        self.read(|reader| reader.az_dependency(package, version_code))
    }

    /// Newest build whose package matches `package`, trying progressively looser
    /// matches: exact, embedded segment, suffix, prefix, substring.
    ///
    /// # Errors
    /// Returns an error when any read fails.
    pub fn download_latest_app(&self, package: &str) -> Result<Option<App>, StoreError> {
        self.read(|reader| match reader.latest_app_hash(package)? {
            Some(hash) => reader.app(&hash),
            None => Ok(None),
        })
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn app_hashes(&self) -> Result<Vec<String>, StoreError> {
        self.read(|reader| reader.app_hashes())
    }

    /// Hashes of every build with exactly this package name.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn app_hashes_by_package(&self, package: &str) -> Result<Vec<String>, StoreError> {
        self.read(|reader| reader.app_hashes_by_package(package))
    }

    /// `(hash, version_name)` of every build of a package.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn app_versions_by_package(
        &self,
        package: &str,
    ) -> Result<Vec<(String, Option<String>)>, StoreError> {
        self.read(|reader| reader.app_versions_by_package(package))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn scores_by_app(&self, app_hash: &str) -> Result<Vec<Score>, StoreError> {
        self.read(|reader| reader.scores_by_app(app_hash))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn scores_by_rank(&self, rank_name: &str) -> Result<Vec<Score>, StoreError> {
        self.read(|reader| reader.scores_by_rank(rank_name))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn ranks_by_permission(&self, permission_name: &str) -> Result<Vec<Rank>, StoreError> {
        self.read(|reader| reader.ranks_by_permission(permission_name))
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn ranks_by_rank(&self, rank_name: &str) -> Result<Vec<Rank>, StoreError> {
        self.read(|reader| reader.ranks_by_rank(rank_name))
    }

    fn in_transaction<T, F>(&mut self, operation: &str, body: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Loader<'_, Connection>) -> Result<T, StoreError>,
    {
        let policy = self.options.conflict_policy;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::storage(&format!("begin {operation}"), err))?;
        let conn: &Connection = &tx;
        let value = body(&Loader::new(conn, policy))?;
        tx.commit().map_err(|err| StoreError::storage(&format!("commit {operation}"), err))?;
        Ok(value)
    }

    /// Multi-statement reads share one snapshot.
    fn read<T, F>(&self, body: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Reader<'_, Connection>) -> Result<T, StoreError>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|err| StoreError::storage("begin read", err))?;
        let conn: &Connection = &tx;
        let value = body(&Reader::new(conn))?;
        tx.commit().map_err(|err| StoreError::storage("end read", err))?;
        Ok(value)
    }
}

pub(crate) fn now_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
