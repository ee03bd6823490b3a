use privacy_catalog_core::{
    App, AzDependency, AzMetadata, EntityKind, ExtractionMetadata, Permission, PermissionGroup,
    PrivacyRank, Rank, Score,
};
use rusqlite::types::Value;
use rusqlite::{params, ToSql};

use crate::{ConflictPolicy, Executor, LoadOutcome, StoreError};

/// Natural-key upsert of one entity type and everything it owns.
pub trait EntityLoader<T: ?Sized> {
    /// Insert `entity` unless its key is already stored.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] for failed writes and
    /// [`StoreError::Conflict`] when the conflict policy rejects a divergent row.
    fn load(&self, entity: &T) -> Result<LoadOutcome, StoreError>;
}

/// Write path over an [`Executor`], normally one open transaction.
pub struct Loader<'a, E> {
    db: &'a E,
    policy: ConflictPolicy,
}

impl<'a, E: Executor> Loader<'a, E> {
    #[must_use]
    pub fn new(db: &'a E, policy: ConflictPolicy) -> Self {
        Self { db, policy }
    }

    #[must_use]
    pub fn executor(&self) -> &'a E {
        self.db
    }

    /// Append a provenance record to a stored app. Identical records collapse.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when the write fails.
    pub fn extraction_metadata(
        &self,
        app_hash: &str,
        meta: &ExtractionMetadata,
    ) -> Result<LoadOutcome, StoreError> {
        let mut outcome = LoadOutcome::new(
            EntityKind::ExtractionMetadata,
            format!(
                "{app_hash}/{}/{}",
                meta.source.as_deref().unwrap_or_default(),
                meta.timestamp.as_deref().unwrap_or_default()
            ),
        );
        if !self.exists("SELECT EXISTS(SELECT 1 FROM app WHERE hash = ?1)", params![app_hash])? {
            tracing::warn!("skipping extraction metadata for {app_hash}: app is not catalogued");
            outcome.skipped = 1;
            return Ok(outcome);
        }

        outcome.rows_affected = self.db.write(
            "INSERT INTO extraction_metadata(source, method, timestamp, app_hash)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![meta.source, meta.method, meta.timestamp, app_hash],
        )?;
        Ok(outcome)
    }

    /// Create an empty ledger row if none exists; never compares contents.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when the write fails.
    pub fn create_privacy_rank(
        &self,
        name: &str,
        source: Option<&str>,
        timestamp: &str,
    ) -> Result<usize, StoreError> {
        self.db.write(
            "INSERT INTO privacy_rank(name, source, timestamp) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![name, source, timestamp],
        )
    }

    fn exists(&self, query: &str, params: &[&dyn ToSql]) -> Result<bool, StoreError> {
        Ok(self.db.read_one(query, params, |row| row.get::<_, bool>(0))?.unwrap_or(false))
    }

    /// Compare the stored non-key columns of an existing row with the incoming
    /// values and apply the conflict policy.
    fn check_divergence(
        &self,
        entity: EntityKind,
        key: &str,
        query: &str,
        params: &[&dyn ToSql],
        incoming: &[Value],
    ) -> Result<(), StoreError> {
        if self.policy == ConflictPolicy::Ignore {
            return Ok(());
        }

        let width = incoming.len();
        let stored = self.db.read_one(query, params, |row| {
            (0..width).map(|index| row.get::<_, Value>(index)).collect::<rusqlite::Result<Vec<_>>>()
        })?;
        match stored {
            Some(stored) if stored != incoming => match self.policy {
                ConflictPolicy::Reject => {
                    Err(StoreError::Conflict { entity, key: key.to_string() })
                }
                ConflictPolicy::Warn => {
                    tracing::warn!("{entity} {key} re-ingested with different contents; keeping stored row");
                    Ok(())
                }
                ConflictPolicy::Ignore => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

fn text(value: Option<&str>) -> Value {
    Value::from(value.map(str::to_string))
}

impl<E: Executor> EntityLoader<App> for Loader<'_, E> {
    fn load(&self, app: &App) -> Result<LoadOutcome, StoreError> {
        let mut outcome = LoadOutcome::new(EntityKind::App, &app.hash);
        outcome.rows_affected = self.db.write(
            "INSERT INTO app(hash, package, version_code, version_name, min_sdk, target_sdk, max_sdk, category)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT DO NOTHING",
            params![
                app.hash,
                app.package,
                app.version_code,
                app.version_name,
                app.min_sdk_version,
                app.target_sdk_version,
                app.max_sdk_version,
                app.category,
            ],
        )?;

        if outcome.rows_affected == 0 {
            self.check_divergence(
                EntityKind::App,
                &app.hash,
                "SELECT package, version_code, version_name, min_sdk, target_sdk, max_sdk, category
                 FROM app WHERE hash = ?1",
                params![app.hash],
                &[
                    Value::from(app.package.clone()),
                    Value::from(app.version_code),
                    text(app.version_name.as_deref()),
                    Value::from(app.min_sdk_version),
                    Value::from(app.target_sdk_version),
                    Value::from(app.max_sdk_version),
                    text(app.category.as_deref()),
                ],
            )?;
            return Ok(outcome);
        }

        for group in &app.defines_groups {
            outcome.absorb(&self.load(group)?);
        }
        for permission in app.defines_permissions.iter().chain(&app.uses_permissions) {
            outcome.absorb(&self.load(permission)?);
        }
        for meta in &app.extraction_metadata {
            outcome.absorb(&self.extraction_metadata(&app.hash, meta)?);
        }
        for score in &app.scores {
            outcome.absorb(&self.load(score)?);
        }

        for group in &app.defines_groups {
            outcome.cascade_rows += self.db.write(
                "INSERT INTO app_defines_group(group_name, app_hash) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![group.name, app.hash],
            )?;
        }
        for permission in &app.defines_permissions {
            outcome.cascade_rows += self.db.write(
                "INSERT INTO app_defines_permission(app_hash, permission_name) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![app.hash, permission.name],
            )?;
        }
        for permission in &app.uses_permissions {
            outcome.cascade_rows += self.db.write(
                "INSERT INTO app_uses_permission(app_hash, permission_name) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![app.hash, permission.name],
            )?;
        }
        for permission in app.defines_permissions.iter().chain(&app.uses_permissions) {
            for group in &permission.declared_groups {
                outcome.cascade_rows += self.db.write(
                    "INSERT INTO app_bind_permission_to_group(group_name, permission_name, app_hash)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT DO NOTHING",
                    params![group.name, permission.name, app.hash],
                )?;
            }
        }

        tracing::debug!(
            "loaded app {} ({} cascade rows, {} skipped)",
            app.hash,
            outcome.cascade_rows,
            outcome.skipped
        );
        Ok(outcome)
    }
}

impl<E: Executor> EntityLoader<PermissionGroup> for Loader<'_, E> {
    fn load(&self, group: &PermissionGroup) -> Result<LoadOutcome, StoreError> {
        let mut outcome = LoadOutcome::new(group.kind(), &group.name);
        let base = self.db.write(
            "INSERT INTO permission_group(name) VALUES (?1) ON CONFLICT DO NOTHING",
            params![group.name],
        )?;

        if let Some(platform) = &group.platform {
            let inserted = self.db.write(
                "INSERT INTO android_permission_group(name, added_in_api) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![group.name, platform.added_in_api_level],
            )?;
            if inserted == 0 {
                self.check_divergence(
                    EntityKind::AndroidPermissionGroup,
                    &group.name,
                    "SELECT added_in_api FROM android_permission_group WHERE name = ?1",
                    params![group.name],
                    &[text(platform.added_in_api_level.as_deref())],
                )?;
            }
            // The specialization row is what a platform group adds.
            outcome.rows_affected = inserted;
            outcome.cascade_rows += base;
        } else {
            outcome.rows_affected = base;
        }

        Ok(outcome)
    }
}

impl<E: Executor> EntityLoader<Permission> for Loader<'_, E> {
    fn load(&self, permission: &Permission) -> Result<LoadOutcome, StoreError> {
        let mut outcome = LoadOutcome::new(permission.kind(), &permission.name);
        let base = self.db.write(
            "INSERT INTO permission(name, protection_level) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![permission.name, permission.protection_level],
        )?;
        if base == 0 {
            self.check_divergence(
                EntityKind::Permission,
                &permission.name,
                "SELECT protection_level FROM permission WHERE name = ?1",
                params![permission.name],
                &[text(permission.protection_level.as_deref())],
            )?;
        }

        if let Some(platform) = &permission.platform {
            if let Some(group) = &platform.declared_group {
                outcome.absorb(&self.load(group)?);
            }
            let group_name = platform.declared_group.as_ref().map(|group| group.name.as_str());
            let inserted = self.db.write(
                "INSERT INTO android_permission(name, added_in_api, group_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT DO NOTHING",
                params![permission.name, platform.added_in_api_level, group_name],
            )?;
            if inserted == 0 {
                self.check_divergence(
                    EntityKind::AndroidPermission,
                    &permission.name,
                    "SELECT added_in_api, group_name FROM android_permission WHERE name = ?1",
                    params![permission.name],
                    &[text(platform.added_in_api_level.as_deref()), text(group_name)],
                )?;
            }
            outcome.rows_affected = inserted;
            outcome.cascade_rows += base;
        } else {
            outcome.rows_affected = base;
        }

        for group in &permission.declared_groups {
            outcome.absorb(&self.load(group)?);
        }
        for rank in &permission.ranks {
            outcome.absorb(&self.load(rank)?);
        }

        Ok(outcome)
    }
}

impl<E: Executor> EntityLoader<Rank> for Loader<'_, E> {
    fn load(&self, rank: &Rank) -> Result<LoadOutcome, StoreError> {
        let key = format!("{}/{}", rank.rank_name, rank.permission_name);
        let mut outcome = LoadOutcome::new(EntityKind::Rank, &key);
        let referenced = self.exists(
            "SELECT EXISTS(SELECT 1 FROM permission WHERE name = ?1)
                AND EXISTS(SELECT 1 FROM privacy_rank WHERE name = ?2)",
            params![rank.permission_name, rank.rank_name],
        )?;
        if !referenced {
            tracing::warn!("skipping rank {key}: permission or privacy rank is not catalogued");
            outcome.skipped = 1;
            return Ok(outcome);
        }

        outcome.rows_affected = self.db.write(
            "INSERT INTO permission_rank(value, permission_name, privacy_rank_name)
             VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![rank.value, rank.permission_name, rank.rank_name],
        )?;
        if outcome.rows_affected == 0 {
            self.check_divergence(
                EntityKind::Rank,
                &key,
                "SELECT value FROM permission_rank WHERE permission_name = ?1 AND privacy_rank_name = ?2",
                params![rank.permission_name, rank.rank_name],
                &[Value::Real(rank.value)],
            )?;
        }
        Ok(outcome)
    }
}

impl<E: Executor> EntityLoader<Score> for Loader<'_, E> {
    fn load(&self, score: &Score) -> Result<LoadOutcome, StoreError> {
        let key = format!("{}/{}", score.rank_name, score.app_hash);
        let mut outcome = LoadOutcome::new(EntityKind::Score, &key);
        let referenced = self.exists(
            "SELECT EXISTS(SELECT 1 FROM app WHERE hash = ?1)
                AND EXISTS(SELECT 1 FROM privacy_rank WHERE name = ?2)",
            params![score.app_hash, score.rank_name],
        )?;
        if !referenced {
            tracing::warn!("skipping score {key}: app or privacy rank is not catalogued");
            outcome.skipped = 1;
            return Ok(outcome);
        }

        outcome.rows_affected = self.db.write(
            "INSERT INTO score(value, app_hash, privacy_rank_name) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![score.value, score.app_hash, score.rank_name],
        )?;
        if outcome.rows_affected == 0 {
            self.check_divergence(
                EntityKind::Score,
                &key,
                "SELECT value FROM score WHERE app_hash = ?1 AND privacy_rank_name = ?2",
                params![score.app_hash, score.rank_name],
                &[Value::Real(score.value)],
            )?;
        }
        Ok(outcome)
    }
}

impl<E: Executor> EntityLoader<PrivacyRank> for Loader<'_, E> {
    fn load(&self, rank: &PrivacyRank) -> Result<LoadOutcome, StoreError> {
        let mut outcome = LoadOutcome::new(EntityKind::PrivacyRank, &rank.name);
        outcome.rows_affected = self.db.write(
            "INSERT INTO privacy_rank(name, source, timestamp) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![rank.name, rank.source, rank.timestamp],
        )?;
        if outcome.rows_affected == 0 {
            // Timestamps record when a copy was extracted, not what it contains.
            self.check_divergence(
                EntityKind::PrivacyRank,
                &rank.name,
                "SELECT source FROM privacy_rank WHERE name = ?1",
                params![rank.name],
                &[text(rank.source.as_deref())],
            )?;
        }

        for permission_rank in &rank.ranks {
            outcome.absorb(&self.load(permission_rank)?);
        }
        for score in &rank.scores {
            outcome.absorb(&self.load(score)?);
        }
        Ok(outcome)
    }
}

impl<E: Executor> EntityLoader<AzDependency> for Loader<'_, E> {
    fn load(&self, dep: &AzDependency) -> Result<LoadOutcome, StoreError> {
        let mut outcome =
            LoadOutcome::new(EntityKind::AzDependency, format!("{}:{}", dep.package, dep.version_code));
        outcome.rows_affected = self.db.write(
            "INSERT INTO az_dependency(package, version_code) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![dep.package, dep.version_code],
        )?;
        Ok(outcome)
    }
}

impl<E: Executor> EntityLoader<AzMetadata> for Loader<'_, E> {
    fn load(&self, meta: &AzMetadata) -> Result<LoadOutcome, StoreError> {
        let key = format!("{}@{}", meta.app_hash, meta.date);
        let mut outcome = LoadOutcome::new(EntityKind::AzMetadata, &key);
        if !self.exists("SELECT EXISTS(SELECT 1 FROM app WHERE hash = ?1)", params![meta.app_hash])? {
            tracing::warn!("skipping az metadata {key}: app is not catalogued");
            outcome.skipped = 1;
            return Ok(outcome);
        }

        outcome.rows_affected = self.db.write(
            "INSERT INTO az_metadata(
                app_hash, date, ratings_count, star_rating, comment_count,
                one_star_ratings, two_star_ratings, three_star_ratings, four_star_ratings,
                five_star_ratings, upload_date, creator, developer_name, developer_address,
                developer_email, developer_website, size, num_downloads, app_url, app_title,
                privacy_policy_url
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT DO NOTHING",
            params![
                meta.app_hash,
                meta.date,
                meta.ratings_count,
                meta.star_rating,
                meta.comment_count,
                meta.one_star_ratings,
                meta.two_star_ratings,
                meta.three_star_ratings,
                meta.four_star_ratings,
                meta.five_star_ratings,
                meta.upload_date,
                meta.creator,
                meta.developer_name,
                meta.developer_address,
                meta.developer_email,
                meta.developer_website,
                meta.size,
                meta.num_downloads,
                meta.app_url,
                meta.app_title,
                meta.privacy_policy_url,
            ],
        )?;

        if outcome.rows_affected == 0 {
            self.check_divergence(
                EntityKind::AzMetadata,
                &key,
                "SELECT ratings_count, star_rating, comment_count, num_downloads, app_title, privacy_policy_url
                 FROM az_metadata WHERE app_hash = ?1 AND date = ?2",
                params![meta.app_hash, meta.date],
                &[
                    Value::from(meta.ratings_count),
                    Value::from(meta.star_rating),
                    Value::from(meta.comment_count),
                    text(meta.num_downloads.as_deref()),
                    text(meta.app_title.as_deref()),
                    text(meta.privacy_policy_url.as_deref()),
                ],
            )?;
            return Ok(outcome);
        }

        for dep in &meta.dependencies {
            outcome.absorb(&self.load(dep)?);
        }
        for dep in &meta.dependencies {
            outcome.cascade_rows += self.db.write(
                "INSERT INTO az_bind_dependency(app_hash, date, package, version_code)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT DO NOTHING",
                params![meta.app_hash, meta.date, dep.package, dep.version_code],
            )?;
        }
        Ok(outcome)
    }
}
