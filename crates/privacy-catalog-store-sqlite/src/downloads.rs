use privacy_catalog_core::{
    App, AzDependency, AzMetadata, ExtractionMetadata, Permission, PermissionGroup, PlatformGroup,
    PlatformPermission, PrivacyRank, Rank, Score,
};
use rusqlite::{params, Row};

use crate::{Executor, StoreError};

const APP_COLUMNS: &str =
    "hash, package, version_code, version_name, min_sdk, target_sdk, max_sdk, category";

const AZ_METADATA_COLUMNS: &str = "app_hash, date, ratings_count, star_rating, comment_count,
    one_star_ratings, two_star_ratings, three_star_ratings, four_star_ratings, five_star_ratings,
    upload_date, creator, developer_name, developer_address, developer_email, developer_website,
    size, num_downloads, app_url, app_title, privacy_policy_url";

/// Read path: rebuilds typed entities, and their owned collections, from rows.
/// Absent keys are `Ok(None)`.
pub struct Reader<'a, E> {
    db: &'a E,
}

impl<'a, E: Executor> Reader<'a, E> {
    #[must_use]
    pub fn new(db: &'a E) -> Self {
        Self { db }
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when any read fails.
    pub fn app(&self, hash: &str) -> Result<Option<App>, StoreError> {
        let query = format!("SELECT {APP_COLUMNS} FROM app WHERE hash = ?1");
        let Some(mut app) = self.db.read_one(&query, params![hash], map_app)? else {
            return Ok(None);
        };

        app.uses_permissions = self.bound_permissions(
            "SELECT permission_name FROM app_uses_permission WHERE app_hash = ?1 ORDER BY rowid",
            hash,
        )?;
        app.defines_permissions = self.bound_permissions(
            "SELECT permission_name FROM app_defines_permission WHERE app_hash = ?1 ORDER BY rowid",
            hash,
        )?;
        let group_names = self.db.read_all(
            "SELECT group_name FROM app_defines_group WHERE app_hash = ?1 ORDER BY rowid",
            params![hash],
            |row| row.get::<_, String>(0),
        )?;
        app.defines_groups = self.groups(&group_names)?;
        app.extraction_metadata = self.extraction_metadata(hash)?;
        app.scores = self.scores_by_app(hash)?;

        Ok(Some(app))
    }

    fn bound_permissions(&self, query: &str, hash: &str) -> Result<Vec<Permission>, StoreError> {
        let names = self.db.read_all(query, params![hash], |row| row.get::<_, String>(0))?;
        let mut permissions = Vec::with_capacity(names.len());
        for name in names {
            if let Some(permission) = self.permission(&name, Some(hash))? {
                permissions.push(permission);
            }
        }
        Ok(permissions)
    }

    /// Permission with its platform data and ranks. Declared groups are those
    /// bound within `app_hash`, or across every app when `None`.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when any read fails.
    pub fn permission(
        &self,
        name: &str,
        app_hash: Option<&str>,
    ) -> Result<Option<Permission>, StoreError> {
        let row = self.db.read_one(
            "SELECT p.name, p.protection_level, ap.name IS NOT NULL, ap.added_in_api, ap.group_name
             FROM permission p
             LEFT JOIN android_permission ap ON ap.name = p.name
             WHERE p.name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )?;
        let Some((name, protection_level, is_platform, added_in_api_level, group_name)) = row else {
            return Ok(None);
        };

        let group_names = match app_hash {
            Some(hash) => self.db.read_all(
                "SELECT group_name FROM app_bind_permission_to_group
                 WHERE app_hash = ?1 AND permission_name = ?2
                 ORDER BY rowid",
                params![hash, name],
                |row| row.get::<_, String>(0),
            )?,
            None => self.db.read_all(
                "SELECT group_name FROM app_bind_permission_to_group
                 WHERE permission_name = ?1
                 GROUP BY group_name
                 ORDER BY MIN(rowid)",
                params![name],
                |row| row.get::<_, String>(0),
            )?,
        };

        let platform = if is_platform {
            // A platform permission's declared group is always a platform group.
            let declared_group = match group_name {
                Some(group_name) => self.permission_group(&group_name)?.map(|group| {
                    PermissionGroup { platform: Some(group.platform.unwrap_or_default()), ..group }
                }),
                None => None,
            };
            Some(PlatformPermission { added_in_api_level, declared_group })
        } else {
            None
        };

        Ok(Some(Permission {
            declared_groups: self.groups(&group_names)?,
            ranks: self.ranks_by_permission(&name)?,
            name,
            protection_level,
            platform,
        }))
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn permission_group(&self, name: &str) -> Result<Option<PermissionGroup>, StoreError> {
        self.db.read_one(
            "SELECT g.name, apg.name IS NOT NULL, apg.added_in_api
             FROM permission_group g
             LEFT JOIN android_permission_group apg ON apg.name = g.name
             WHERE g.name = ?1",
            params![name],
            |row| {
                let platform = if row.get::<_, bool>(1)? {
                    Some(PlatformGroup { added_in_api_level: row.get(2)? })
                } else {
                    None
                };
                Ok(PermissionGroup { name: row.get(0)?, platform })
            },
        )
    }

    fn groups(&self, names: &[String]) -> Result<Vec<PermissionGroup>, StoreError> {
        let mut groups = Vec::with_capacity(names.len());
        for name in names {
            if let Some(group) = self.permission_group(name)? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn rank(&self, permission_name: &str, rank_name: &str) -> Result<Option<Rank>, StoreError> {
        self.db.read_one(
            "SELECT value, permission_name, privacy_rank_name FROM permission_rank
             WHERE permission_name = ?1 AND privacy_rank_name = ?2",
            params![permission_name, rank_name],
            map_rank,
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn ranks_by_permission(&self, permission_name: &str) -> Result<Vec<Rank>, StoreError> {
        self.db.read_all(
            "SELECT value, permission_name, privacy_rank_name FROM permission_rank
             WHERE permission_name = ?1 ORDER BY rowid",
            params![permission_name],
            map_rank,
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn ranks_by_rank(&self, rank_name: &str) -> Result<Vec<Rank>, StoreError> {
        self.db.read_all(
            "SELECT value, permission_name, privacy_rank_name FROM permission_rank
             WHERE privacy_rank_name = ?1 ORDER BY rowid",
            params![rank_name],
            map_rank,
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn score(&self, app_hash: &str, rank_name: &str) -> Result<Option<Score>, StoreError> {
        self.db.read_one(
            "SELECT value, app_hash, privacy_rank_name FROM score
             WHERE app_hash = ?1 AND privacy_rank_name = ?2",
            params![app_hash, rank_name],
            map_score,
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn scores_by_app(&self, app_hash: &str) -> Result<Vec<Score>, StoreError> {
        self.db.read_all(
            "SELECT value, app_hash, privacy_rank_name FROM score WHERE app_hash = ?1 ORDER BY rowid",
            params![app_hash],
            map_score,
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn scores_by_rank(&self, rank_name: &str) -> Result<Vec<Score>, StoreError> {
        self.db.read_all(
            "SELECT value, app_hash, privacy_rank_name FROM score
             WHERE privacy_rank_name = ?1 ORDER BY rowid",
            params![rank_name],
            map_score,
        )
    }

    /// Ledger with every rank and score recorded under it.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when any read fails.
    pub fn privacy_rank(&self, name: &str) -> Result<Option<PrivacyRank>, StoreError> {
        let row = self.db.read_one(
            "SELECT name, source, timestamp FROM privacy_rank WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )?;
        let Some((name, source, timestamp)) = row else {
            return Ok(None);
        };
        Ok(Some(PrivacyRank {
            ranks: self.ranks_by_rank(&name)?,
            scores: self.scores_by_rank(&name)?,
            name,
            source,
            timestamp,
        }))
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn extraction_metadata(&self, app_hash: &str) -> Result<Vec<ExtractionMetadata>, StoreError> {
        self.db.read_all(
            "SELECT source, method, timestamp FROM extraction_metadata WHERE app_hash = ?1 ORDER BY id",
            params![app_hash],
            |row| {
                Ok(ExtractionMetadata {
                    source: row.get(0)?,
                    method: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            },
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when any read fails.
    pub fn az_metadata(&self, app_hash: &str, date: &str) -> Result<Option<AzMetadata>, StoreError> {
        let query = format!("SELECT {AZ_METADATA_COLUMNS} FROM az_metadata WHERE app_hash = ?1 AND date = ?2");
        let Some(mut meta) = self.db.read_one(&query, params![app_hash, date], map_az_metadata)?
        else {
            return Ok(None);
        };
        meta.dependencies = self.bound_dependencies(app_hash, date)?;
        Ok(Some(meta))
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when any read fails.
    pub fn az_metadata_list(&self, app_hash: &str) -> Result<Vec<AzMetadata>, StoreError> {
        let query =
            format!("SELECT {AZ_METADATA_COLUMNS} FROM az_metadata WHERE app_hash = ?1 ORDER BY date");
        let mut list = self.db.read_all(&query, params![app_hash], map_az_metadata)?;
        for meta in &mut list {
            meta.dependencies = self.bound_dependencies(&meta.app_hash, &meta.date)?;
        }
        Ok(list)
    }

    fn bound_dependencies(&self, app_hash: &str, date: &str) -> Result<Vec<AzDependency>, StoreError> {
        self.db.read_all(
            "SELECT package, version_code FROM az_bind_dependency
             WHERE app_hash = ?1 AND date = ?2 ORDER BY rowid",
            params![app_hash, date],
            map_az_dependency,
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn az_dependency(
        &self,
        package: &str,
        version_code: i64,
    ) -> Result<Option<AzDependency>, StoreError> {
        self.db.read_one(
            "SELECT package, version_code FROM az_dependency WHERE package = ?1 AND version_code = ?2",
            params![package, version_code],
            map_az_dependency,
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn app_hashes(&self) -> Result<Vec<String>, StoreError> {
        self.db.read_all("SELECT hash FROM app ORDER BY hash", &[], |row| row.get(0))
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn app_hashes_by_package(&self, package: &str) -> Result<Vec<String>, StoreError> {
        self.db.read_all(
            "SELECT hash FROM app WHERE package = ?1 ORDER BY hash",
            params![package],
            |row| row.get(0),
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the read fails.
    pub fn app_versions_by_package(
        &self,
        package: &str,
    ) -> Result<Vec<(String, Option<String>)>, StoreError> {
        self.db.read_all(
            "SELECT hash, version_name FROM app WHERE package = ?1
             ORDER BY version_code DESC, hash",
            params![package],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when any read fails.
    pub fn latest_app_hash(&self, package: &str) -> Result<Option<String>, StoreError> {
        let escaped = escape_like(package);
        let patterns = [
            escaped.clone(),
            format!("%.{escaped}.%"),
            format!("%.{escaped}"),
            format!("{escaped}.%"),
            format!("%{escaped}%"),
        ];
        for pattern in patterns {
            let hash = self.db.read_one(
                "SELECT hash FROM app WHERE package LIKE ?1 ESCAPE '\\'
                 ORDER BY version_code DESC, hash
                 LIMIT 1",
                params![pattern],
                |row| row.get::<_, String>(0),
            )?;
            if hash.is_some() {
                return Ok(hash);
            }
        }
        Ok(None)
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn map_app(row: &Row<'_>) -> rusqlite::Result<App> {
    Ok(App {
        hash: row.get(0)?,
        package: row.get(1)?,
        version_code: row.get(2)?,
        version_name: row.get(3)?,
        min_sdk_version: row.get(4)?,
        target_sdk_version: row.get(5)?,
        max_sdk_version: row.get(6)?,
        category: row.get(7)?,
        ..App::default()
    })
}

fn map_rank(row: &Row<'_>) -> rusqlite::Result<Rank> {
    Ok(Rank { value: row.get(0)?, permission_name: row.get(1)?, rank_name: row.get(2)? })
}

fn map_score(row: &Row<'_>) -> rusqlite::Result<Score> {
    Ok(Score { value: row.get(0)?, app_hash: row.get(1)?, rank_name: row.get(2)? })
}

fn map_az_dependency(row: &Row<'_>) -> rusqlite::Result<AzDependency> {
    Ok(AzDependency { package: row.get(0)?, version_code: row.get(1)? })
}

fn map_az_metadata(row: &Row<'_>) -> rusqlite::Result<AzMetadata> {
    Ok(AzMetadata {
        app_hash: row.get(0)?,
        date: row.get(1)?,
        ratings_count: row.get(2)?,
        star_rating: row.get(3)?,
        comment_count: row.get(4)?,
        one_star_ratings: row.get(5)?,
        two_star_ratings: row.get(6)?,
        three_star_ratings: row.get(7)?,
        four_star_ratings: row.get(8)?,
        five_star_ratings: row.get(9)?,
        upload_date: row.get(10)?,
        creator: row.get(11)?,
        developer_name: row.get(12)?,
        developer_address: row.get(13)?,
        developer_email: row.get(14)?,
        developer_website: row.get(15)?,
        size: row.get(16)?,
        num_downloads: row.get(17)?,
        app_url: row.get(18)?,
        app_title: row.get(19)?,
        privacy_policy_url: row.get(20)?,
        dependencies: Vec::new(),
    })
}
