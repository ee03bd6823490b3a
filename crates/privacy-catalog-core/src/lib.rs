use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod ingest;
mod metric;
mod wire;

pub use ingest::{decode_document, IngestPolicy};
pub use metric::{
    Metric, MetricError, RankSumMetric, ScoreTableMetric, DEFAULT_RANK_SUM_NORMALIZER,
    DEFAULT_RANK_SUM_PROTECTION_LEVEL, MAX_SCORE, MIN_SCORE,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CatalogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown entity tag `{0}`")]
    UnknownTag(String),
    #[error("entity kind `{0}` is not accepted by this ingestion policy")]
    DisallowedKind(String),
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("failed to decode `{tag}` entity: {message}")]
    Decode { tag: String, message: String },
}

/// Every tag that may appear on the interchange format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EntityKind {
    App,
    Permission,
    AndroidPermission,
    PermissionGroup,
    AndroidPermissionGroup,
    Rank,
    Score,
    PrivacyRank,
    ExtractionMetadata,
    AzMetadata,
    AzDependency,
}

impl EntityKind {
    pub const ALL: [Self; 11] = [
        Self::App,
        Self::Permission,
        Self::AndroidPermission,
        Self::PermissionGroup,
        Self::AndroidPermissionGroup,
        Self::Rank,
        Self::Score,
        Self::PrivacyRank,
        Self::ExtractionMetadata,
        Self::AzMetadata,
        Self::AzDependency,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "App",
            Self::Permission => "Permission",
            Self::AndroidPermission => "AndroidPermission",
            Self::PermissionGroup => "PermissionGroup",
            Self::AndroidPermissionGroup => "AndroidPermissionGroup",
            Self::Rank => "Rank",
            Self::Score => "Score",
            Self::PrivacyRank => "PrivacyRank",
            Self::ExtractionMetadata => "ExtractionMetadata",
            Self::AzMetadata => "AzMetadata",
            Self::AzDependency => "AzDependency",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform-specific data attached to a group declared by the OS vendor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformGroup {
    pub added_in_api_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionGroup {
    pub name: String,
    pub platform: Option<PlatformGroup>,
}

impl PermissionGroup {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), platform: None }
    }

    #[must_use]
    pub fn is_platform(&self) -> bool {
        self.platform.is_some()
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        if self.is_platform() {
            EntityKind::AndroidPermissionGroup
        } else {
            EntityKind::PermissionGroup
        }
    }

    /// Validate the group identity.
    ///
    /// # Errors
    /// Returns [`CatalogError::Validation`] when the name is blank.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_blank(&self.name, "permission group name")
    }
}

/// Platform-specific data attached to a permission declared by the OS vendor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformPermission {
    pub added_in_api_level: Option<String>,
    pub declared_group: Option<PermissionGroup>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Permission {
    pub name: String,
    pub protection_level: Option<String>,
    pub declared_groups: Vec<PermissionGroup>,
    pub ranks: Vec<Rank>,
    pub platform: Option<PlatformPermission>,
}

impl Permission {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    #[must_use]
    pub fn is_platform(&self) -> bool {
        self.platform.is_some()
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        if self.is_platform() {
            EntityKind::AndroidPermission
        } else {
            EntityKind::Permission
        }
    }

    /// Substring match against the protection level, e.g. `dangerous` matches
    /// `dangerous|privileged`.
    #[must_use]
    pub fn has_protection_level(&self, marker: &str) -> bool {
        self.protection_level.as_deref().is_some_and(|level| level.contains(marker))
    }

    /// Validate the permission and everything nested under it.
    ///
    /// # Errors
    /// Returns [`CatalogError::Validation`] when the name is blank, a nested
    /// group or rank is invalid, or the platform-declared group is not itself a
    /// platform group.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_blank(&self.name, "permission name")?;
        for group in &self.declared_groups {
            group.validate()?;
        }
        if let Some(group) = self.platform.as_ref().and_then(|p| p.declared_group.as_ref()) {
            group.validate()?;
            if !group.is_platform() {
                return Err(CatalogError::Validation(format!(
                    "declared group {} of platform permission {} MUST be a platform group",
                    group.name, self.name
                )));
            }
        }
        for rank in &self.ranks {
            rank.validate()?;
        }
        Ok(())
    }
}

/// Weight assigned to one permission within one privacy rank.
#[derive(Debug, Clone, PartialEq)]
pub struct Rank {
    pub value: f64,
    pub permission_name: String,
    pub rank_name: String,
}

impl Rank {
    /// # Errors
    /// Returns [`CatalogError::Validation`] when a key is blank or the value is not finite.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_blank(&self.permission_name, "rank permission_name")?;
        require_non_blank(&self.rank_name, "rank rank_name")?;
        if !self.value.is_finite() {
            return Err(CatalogError::Validation(format!(
                "rank value for {} in {} MUST be finite",
                self.permission_name, self.rank_name
            )));
        }
        Ok(())
    }
}

/// Privacy score of one app under one privacy rank.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub value: f64,
    pub app_hash: String,
    pub rank_name: String,
}

impl Score {
    /// # Errors
    /// Returns [`CatalogError::Validation`] when a key is blank or the value is
    /// outside `[MIN_SCORE, MAX_SCORE]`.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_blank(&self.app_hash, "score app_hash")?;
        require_non_blank(&self.rank_name, "score rank_name")?;
        if !self.value.is_finite() || !(MIN_SCORE..=MAX_SCORE).contains(&self.value) {
            return Err(CatalogError::Validation(format!(
                "score value {} for {} MUST be within [{MIN_SCORE}, {MAX_SCORE}]",
                self.value, self.app_hash
            )));
        }
        Ok(())
    }
}

/// A named scoring scheme: the per-permission weights it was built from and
/// the ledger of app scores it has produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrivacyRank {
    pub name: String,
    pub source: Option<String>,
    pub timestamp: Option<String>,
    pub ranks: Vec<Rank>,
    pub scores: Vec<Score>,
}

impl PrivacyRank {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    #[must_use]
    pub fn find_permission_rank(&self, permission_name: &str) -> Option<&Rank> {
        self.ranks.iter().find(|rank| rank.permission_name == permission_name)
    }

    #[must_use]
    pub fn scored_app_hashes(&self) -> BTreeSet<String> {
        self.scores.iter().map(|score| score.app_hash.clone()).collect()
    }

    /// # Errors
    /// Returns [`CatalogError::Validation`] when the name or any nested rank or score is invalid.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_blank(&self.name, "privacy rank name")?;
        for rank in &self.ranks {
            rank.validate()?;
        }
        for score in &self.scores {
            score.validate()?;
        }
        Ok(())
    }
}

/// Provenance of an extraction: which source, which method, when.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExtractionMetadata {
    pub source: Option<String>,
    pub method: Option<String>,
    pub timestamp: Option<String>,
}

/// One specific build of an application, keyed by its content hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct App {
    pub hash: String,
    pub package: String,
    pub version_code: Option<i64>,
    pub version_name: Option<String>,
    pub min_sdk_version: Option<i64>,
    pub target_sdk_version: Option<i64>,
    pub max_sdk_version: Option<i64>,
    pub category: Option<String>,
    pub uses_permissions: Vec<Permission>,
    pub defines_permissions: Vec<Permission>,
    pub defines_groups: Vec<PermissionGroup>,
    pub extraction_metadata: Vec<ExtractionMetadata>,
    pub scores: Vec<Score>,
}

impl App {
    #[must_use]
    pub fn new(hash: impl Into<String>, package: impl Into<String>) -> Self {
        Self { hash: hash.into(), package: package.into(), ..Self::default() }
    }

    /// # Errors
    /// Returns [`CatalogError::Validation`] when the identity or any nested entity is invalid.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_blank(&self.hash, "app hash")?;
        require_non_blank(&self.package, "app package")?;
        for permission in self.uses_permissions.iter().chain(&self.defines_permissions) {
            permission.validate()?;
        }
        for group in &self.defines_groups {
            group.validate()?;
        }
        for score in &self.scores {
            score.validate()?;
            if score.app_hash != self.hash {
                return Err(CatalogError::Validation(format!(
                    "score for {} nested under app {}",
                    score.app_hash, self.hash
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AzDependency {
    pub package: String,
    pub version_code: i64,
}

impl AzDependency {
    /// # Errors
    /// Returns [`CatalogError::Validation`] when the package is blank.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_blank(&self.package, "dependency package")
    }
}

/// Marketplace snapshot of an app at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AzMetadata {
    pub app_hash: String,
    pub date: String,
    pub ratings_count: Option<i64>,
    pub star_rating: Option<f64>,
    pub comment_count: Option<i64>,
    pub one_star_ratings: Option<i64>,
    pub two_star_ratings: Option<i64>,
    pub three_star_ratings: Option<i64>,
    pub four_star_ratings: Option<i64>,
    pub five_star_ratings: Option<i64>,
    pub upload_date: Option<String>,
    pub creator: Option<String>,
    pub developer_name: Option<String>,
    pub developer_address: Option<String>,
    pub developer_email: Option<String>,
    pub developer_website: Option<String>,
    pub size: Option<i64>,
    pub num_downloads: Option<String>,
    pub app_url: Option<String>,
    pub app_title: Option<String>,
    pub privacy_policy_url: Option<String>,
    pub dependencies: Vec<AzDependency>,
}

impl AzMetadata {
    /// # Errors
    /// Returns [`CatalogError::Validation`] when the key or a dependency is invalid.
    pub fn validate(&self) -> Result<(), CatalogError> {
        require_non_blank(&self.app_hash, "az metadata app_hash")?;
        require_non_blank(&self.date, "az metadata date")?;
        for dependency in &self.dependencies {
            dependency.validate()?;
        }
        Ok(())
    }
}

/// Closed set of catalogue entities, one variant per loadable root.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    App(App),
    Permission(Permission),
    PermissionGroup(PermissionGroup),
    Rank(Rank),
    Score(Score),
    PrivacyRank(PrivacyRank),
    ExtractionMetadata(ExtractionMetadata),
    AzMetadata(AzMetadata),
    AzDependency(AzDependency),
}

impl Entity {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::App(_) => EntityKind::App,
            Self::Permission(permission) => permission.kind(),
            Self::PermissionGroup(group) => group.kind(),
            Self::Rank(_) => EntityKind::Rank,
            Self::Score(_) => EntityKind::Score,
            Self::PrivacyRank(_) => EntityKind::PrivacyRank,
            Self::ExtractionMetadata(_) => EntityKind::ExtractionMetadata,
            Self::AzMetadata(_) => EntityKind::AzMetadata,
            Self::AzDependency(_) => EntityKind::AzDependency,
        }
    }

    /// Human-readable natural key, used in reports and log lines.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::App(app) => app.hash.clone(),
            Self::Permission(permission) => permission.name.clone(),
            Self::PermissionGroup(group) => group.name.clone(),
            Self::Rank(rank) => format!("{}/{}", rank.rank_name, rank.permission_name),
            Self::Score(score) => format!("{}/{}", score.rank_name, score.app_hash),
            Self::PrivacyRank(rank) => rank.name.clone(),
            Self::ExtractionMetadata(meta) => format!(
                "{}/{}/{}",
                meta.source.as_deref().unwrap_or_default(),
                meta.method.as_deref().unwrap_or_default(),
                meta.timestamp.as_deref().unwrap_or_default()
            ),
            Self::AzMetadata(meta) => format!("{}@{}", meta.app_hash, meta.date),
            Self::AzDependency(dep) => format!("{}:{}", dep.package, dep.version_code),
        }
    }

    /// # Errors
    /// Returns [`CatalogError::Validation`] when the wrapped entity is invalid.
    pub fn validate(&self) -> Result<(), CatalogError> {
        match self {
            Self::App(app) => app.validate(),
            Self::Permission(permission) => permission.validate(),
            Self::PermissionGroup(group) => group.validate(),
            Self::Rank(rank) => rank.validate(),
            Self::Score(score) => score.validate(),
            Self::PrivacyRank(rank) => rank.validate(),
            Self::ExtractionMetadata(_) => Ok(()),
            Self::AzMetadata(meta) => meta.validate(),
            Self::AzDependency(dep) => dep.validate(),
        }
    }

    /// Encode into the tagged interchange form `{"Tag": {...}}`.
    #[must_use]
    pub fn encode(&self) -> serde_json::Value {
        wire::encode(self)
    }

    /// Decode one tagged element `{"Tag": {...}}`.
    ///
    /// # Errors
    /// Returns [`CatalogError::Malformed`] when the value is not a single-key
    /// object, [`CatalogError::UnknownTag`] for tags outside [`EntityKind`], and
    /// [`CatalogError::Decode`] when the fields do not match the tag.
    pub fn decode(value: serde_json::Value) -> Result<Self, CatalogError> {
        wire::decode(value)
    }
}

fn require_non_blank(value: &str, field: &str) -> Result<(), CatalogError> {
    if value.trim().is_empty() {
        return Err(CatalogError::Validation(format!("{field} MUST be provided")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_parse_round_trips_every_tag() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("Widget"), None);
        assert_eq!(EntityKind::parse("app"), None);
    }

    #[test]
    fn platform_capability_selects_kind() {
        let mut permission = Permission::new("android.permission.CAMERA");
        assert_eq!(permission.kind(), EntityKind::Permission);
        permission.platform = Some(PlatformPermission::default());
        assert_eq!(permission.kind(), EntityKind::AndroidPermission);
        assert_eq!(Entity::Permission(permission).kind(), EntityKind::AndroidPermission);
    }

    #[test]
    fn platform_permission_requires_a_platform_declared_group() {
        let mut permission = Permission {
            platform: Some(PlatformPermission {
                added_in_api_level: Some("1".to_string()),
                declared_group: Some(PermissionGroup::new("android.permission-group.CAMERA")),
            }),
            ..Permission::new("android.permission.CAMERA")
        };
        assert!(matches!(permission.validate(), Err(CatalogError::Validation(_))));

        if let Some(group) = permission.platform.as_mut().and_then(|p| p.declared_group.as_mut()) {
            group.platform = Some(PlatformGroup::default());
        }
        assert_eq!(permission.validate(), Ok(()));
    }

    #[test]
    fn protection_level_matches_by_substring() {
        let mut permission = Permission::new("android.permission.READ_SMS");
        assert!(!permission.has_protection_level("dangerous"));
        permission.protection_level = Some("dangerous|appop".to_string());
        assert!(permission.has_protection_level("dangerous"));
        assert!(!permission.has_protection_level("signature"));
    }

    #[test]
    fn score_validation_enforces_range() {
        let mut score =
            Score { value: 10.0, app_hash: "h1".to_string(), rank_name: "R".to_string() };
        assert!(score.validate().is_ok());
        score.value = 10.5;
        assert!(matches!(score.validate(), Err(CatalogError::Validation(_))));
        score.value = f64::NAN;
        assert!(matches!(score.validate(), Err(CatalogError::Validation(_))));
        score.value = -0.1;
        assert!(matches!(score.validate(), Err(CatalogError::Validation(_))));
    }

    #[test]
    fn app_validation_rejects_blank_package_and_foreign_scores() {
        let mut app = App::new("h1", " ");
        let err = match app.validate() {
            Ok(()) => panic!("blank package should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("app package MUST be provided"));

        app.package = "com.example".to_string();
        app.scores.push(Score { value: 1.0, app_hash: "h2".to_string(), rank_name: "R".to_string() });
        assert!(matches!(app.validate(), Err(CatalogError::Validation(_))));
    }

    #[test]
    fn privacy_rank_lookup_helpers() {
        let mut ledger = PrivacyRank::new("R");
        ledger.ranks.push(Rank {
            value: 3.0,
            permission_name: "p1".to_string(),
            rank_name: "R".to_string(),
        });
        ledger.scores.push(Score { value: 2.0, app_hash: "h1".to_string(), rank_name: "R".to_string() });

        assert_eq!(ledger.find_permission_rank("p1").map(|rank| rank.value), Some(3.0));
        assert!(ledger.find_permission_rank("p2").is_none());
        assert_eq!(ledger.scored_app_hashes(), BTreeSet::from(["h1".to_string()]));
    }

    #[test]
    fn entity_keys_are_stable() {
        let dep = Entity::AzDependency(AzDependency { package: "okhttp".to_string(), version_code: 4 });
        assert_eq!(dep.key(), "okhttp:4");
        let meta = Entity::AzMetadata(AzMetadata {
            app_hash: "h1".to_string(),
            date: "2023-01-01".to_string(),
            ..AzMetadata::default()
        });
        assert_eq!(meta.key(), "h1@2023-01-01");
    }
}
