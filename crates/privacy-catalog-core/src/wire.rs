//! Tagged interchange format: every element is a single-key object
//! `{"Tag": {fields}}`, absent lists are `null`, and platform entities nest
//! their base record under the base tag.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    App, AzDependency, AzMetadata, CatalogError, Entity, EntityKind, ExtractionMetadata,
    Permission, PermissionGroup, PlatformGroup, PlatformPermission, PrivacyRank, Rank, Score,
};

#[derive(Debug, Serialize, Deserialize)]
enum WireEntity {
    App(WireApp),
    Permission(WirePermission),
    AndroidPermission(WireAndroidPermission),
    PermissionGroup(WirePermissionGroup),
    AndroidPermissionGroup(WireAndroidPermissionGroup),
    Rank(WireRank),
    Score(WireScore),
    PrivacyRank(WirePrivacyRank),
    ExtractionMetadata(WireExtractionMetadata),
    AzMetadata(WireAzMetadata),
    AzDependency(WireAzDependency),
}

#[derive(Debug, Serialize, Deserialize)]
enum PermissionElement {
    Permission(WirePermission),
    AndroidPermission(WireAndroidPermission),
}

#[derive(Debug, Serialize, Deserialize)]
enum GroupElement {
    PermissionGroup(WirePermissionGroup),
    AndroidPermissionGroup(WireAndroidPermissionGroup),
}

#[derive(Debug, Serialize, Deserialize)]
enum PlatformGroupElement {
    AndroidPermissionGroup(WireAndroidPermissionGroup),
}

#[derive(Debug, Serialize, Deserialize)]
enum RankElement {
    Rank(WireRank),
}

#[derive(Debug, Serialize, Deserialize)]
enum ScoreElement {
    Score(WireScore),
}

#[derive(Debug, Serialize, Deserialize)]
enum MetadataElement {
    ExtractionMetadata(WireExtractionMetadata),
}

#[derive(Debug, Serialize, Deserialize)]
enum DependencyElement {
    AzDependency(WireAzDependency),
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePermissionGroup {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireAndroidPermissionGroup {
    #[serde(rename = "PermissionGroup")]
    base: WirePermissionGroup,
    #[serde(default, deserialize_with = "lenient_api_level")]
    added_in_api_level: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePermission {
    name: String,
    #[serde(default)]
    protection_level: Option<String>,
    #[serde(default)]
    declared_group_list: Option<Vec<GroupElement>>,
    #[serde(default)]
    rank_list: Option<Vec<RankElement>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireAndroidPermission {
    #[serde(rename = "Permission")]
    base: WirePermission,
    #[serde(default, deserialize_with = "lenient_api_level")]
    added_in_api_level: Option<String>,
    #[serde(default)]
    google_declared_group: Option<PlatformGroupElement>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRank {
    value: f64,
    rank_name: String,
    permission_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireScore {
    value: f64,
    rank_name: String,
    app_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePrivacyRank {
    name: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    permission_ranks_list: Option<Vec<RankElement>>,
    #[serde(default)]
    app_scores_list: Option<Vec<ScoreElement>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireExtractionMetadata {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireApp {
    hash: String,
    package: String,
    #[serde(default, deserialize_with = "lenient_int")]
    version_code: Option<i64>,
    #[serde(default)]
    version_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    min_sdk_version: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    target_sdk_version: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    max_sdk_version: Option<i64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    uses_permission_list: Option<Vec<PermissionElement>>,
    #[serde(default)]
    defines_permission_list: Option<Vec<PermissionElement>>,
    #[serde(default)]
    defines_group_list: Option<Vec<GroupElement>>,
    #[serde(default)]
    extraction_metadata_list: Option<Vec<MetadataElement>>,
    #[serde(default)]
    score_list: Option<Vec<ScoreElement>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireAzMetadata {
    app_hash: String,
    az_metadata_date: String,
    #[serde(default)]
    ratings_count: Option<i64>,
    #[serde(default)]
    star_rating: Option<f64>,
    #[serde(default)]
    comment_count: Option<i64>,
    #[serde(default)]
    one_star_ratings: Option<i64>,
    #[serde(default)]
    two_star_ratings: Option<i64>,
    #[serde(default)]
    three_star_ratings: Option<i64>,
    #[serde(default)]
    four_star_ratings: Option<i64>,
    #[serde(default)]
    five_star_ratings: Option<i64>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    creator: Option<String>,
    #[serde(default)]
    developer_name: Option<String>,
    #[serde(default)]
    developer_address: Option<String>,
    #[serde(default)]
    developer_email: Option<String>,
    #[serde(default)]
    developer_website: Option<String>,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    num_downloads: Option<String>,
    #[serde(default)]
    app_url: Option<String>,
    #[serde(default)]
    app_title: Option<String>,
    #[serde(default)]
    privacy_policy_url: Option<String>,
    #[serde(default)]
    az_dependency_list: Option<Vec<DependencyElement>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireAzDependency {
    package: String,
    version_code: i64,
}

pub(crate) fn encode(entity: &Entity) -> Value {
    let wire = match entity {
        Entity::App(app) => WireEntity::App(WireApp::from(app)),
        Entity::Permission(permission) => match permission_element(permission) {
            PermissionElement::Permission(base) => WireEntity::Permission(base),
            PermissionElement::AndroidPermission(platform) => {
                WireEntity::AndroidPermission(platform)
            }
        },
        Entity::PermissionGroup(group) => match group_element(group) {
            GroupElement::PermissionGroup(base) => WireEntity::PermissionGroup(base),
            GroupElement::AndroidPermissionGroup(platform) => {
                WireEntity::AndroidPermissionGroup(platform)
            }
        },
        Entity::Rank(rank) => WireEntity::Rank(WireRank::from(rank)),
        Entity::Score(score) => WireEntity::Score(WireScore::from(score)),
        Entity::PrivacyRank(rank) => WireEntity::PrivacyRank(WirePrivacyRank::from(rank)),
        Entity::ExtractionMetadata(meta) => {
            WireEntity::ExtractionMetadata(WireExtractionMetadata::from(meta))
        }
        Entity::AzMetadata(meta) => WireEntity::AzMetadata(WireAzMetadata::from(meta)),
        Entity::AzDependency(dep) => WireEntity::AzDependency(WireAzDependency::from(dep)),
    };
    // Plain structs with string keys always serialize into a Value.
    serde_json::to_value(wire).unwrap_or(Value::Null)
}

pub(crate) fn decode(value: Value) -> Result<Entity, CatalogError> {
    let tag = single_tag(&value)?;
    if EntityKind::parse(&tag).is_none() {
        return Err(CatalogError::UnknownTag(tag));
    }
    let wire: WireEntity = serde_json::from_value(value)
        .map_err(|err| CatalogError::Decode { tag, message: err.to_string() })?;

    Ok(match wire {
        WireEntity::App(app) => Entity::App(app.into()),
        WireEntity::Permission(base) => Entity::Permission(base.into()),
        WireEntity::AndroidPermission(platform) => Entity::Permission(platform.into()),
        WireEntity::PermissionGroup(base) => Entity::PermissionGroup(base.into()),
        WireEntity::AndroidPermissionGroup(platform) => Entity::PermissionGroup(platform.into()),
        WireEntity::Rank(rank) => Entity::Rank(rank.into()),
        WireEntity::Score(score) => Entity::Score(score.into()),
        WireEntity::PrivacyRank(rank) => Entity::PrivacyRank(rank.into()),
        WireEntity::ExtractionMetadata(meta) => Entity::ExtractionMetadata(meta.into()),
        WireEntity::AzMetadata(meta) => Entity::AzMetadata(meta.into()),
        WireEntity::AzDependency(dep) => Entity::AzDependency(dep.into()),
    })
}

/// Return the only key of a tagged element.
pub(crate) fn single_tag(value: &Value) -> Result<String, CatalogError> {
    let Value::Object(map) = value else {
        return Err(CatalogError::Malformed(format!("expected a tagged object, got {value}")));
    };
    let mut keys = map.keys();
    match (keys.next(), keys.next()) {
        (Some(tag), None) => Ok(tag.clone()),
        _ => Err(CatalogError::Malformed(format!(
            "expected exactly one tag per element, got {}",
            map.len()
        ))),
    }
}

fn lenient_api_level<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(level)) => Ok(Some(level)),
        Some(Value::Number(level)) => Ok(Some(level.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "added_in_api_level must be a string or a number, got {other}"
        ))),
    }
}

fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {number}"))),
        Some(Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected an integer, got {text:?}"))),
        Some(other) => {
            Err(serde::de::Error::custom(format!("expected an integer, got {other}")))
        }
    }
}

fn wire_list<T, U>(items: &[T], convert: impl Fn(&T) -> U) -> Option<Vec<U>> {
    if items.is_empty() {
        None
    } else {
        Some(items.iter().map(convert).collect())
    }
}

fn domain_list<T, U: From<T>>(items: Option<Vec<T>>) -> Vec<U> {
    items.unwrap_or_default().into_iter().map(U::from).collect()
}

fn permission_element(permission: &Permission) -> PermissionElement {
    let base = WirePermission {
        name: permission.name.clone(),
        protection_level: permission.protection_level.clone(),
        declared_group_list: wire_list(&permission.declared_groups, group_element),
        rank_list: wire_list(&permission.ranks, |rank| RankElement::Rank(rank.into())),
    };
    match &permission.platform {
        None => PermissionElement::Permission(base),
        Some(platform) => PermissionElement::AndroidPermission(WireAndroidPermission {
            base,
            added_in_api_level: platform.added_in_api_level.clone(),
            google_declared_group: platform.declared_group.as_ref().map(|group| {
                PlatformGroupElement::AndroidPermissionGroup(platform_group(group))
            }),
        }),
    }
}

fn platform_group(group: &PermissionGroup) -> WireAndroidPermissionGroup {
    WireAndroidPermissionGroup {
        base: WirePermissionGroup { name: group.name.clone() },
        added_in_api_level: group.platform.as_ref().and_then(|p| p.added_in_api_level.clone()),
    }
}

fn group_element(group: &PermissionGroup) -> GroupElement {
    if group.is_platform() {
        GroupElement::AndroidPermissionGroup(platform_group(group))
    } else {
        GroupElement::PermissionGroup(WirePermissionGroup { name: group.name.clone() })
    }
}

impl From<WirePermissionGroup> for PermissionGroup {
    fn from(wire: WirePermissionGroup) -> Self {
        Self { name: wire.name, platform: None }
    }
}

impl From<WireAndroidPermissionGroup> for PermissionGroup {
    fn from(wire: WireAndroidPermissionGroup) -> Self {
        Self {
            name: wire.base.name,
            platform: Some(PlatformGroup { added_in_api_level: wire.added_in_api_level }),
        }
    }
}

impl From<GroupElement> for PermissionGroup {
    fn from(element: GroupElement) -> Self {
        match element {
            GroupElement::PermissionGroup(base) => base.into(),
            GroupElement::AndroidPermissionGroup(platform) => platform.into(),
        }
    }
}

impl From<WirePermission> for Permission {
    fn from(wire: WirePermission) -> Self {
        Self {
            name: wire.name,
            protection_level: wire.protection_level,
            declared_groups: domain_list(wire.declared_group_list),
            ranks: domain_list(wire.rank_list),
            platform: None,
        }
    }
}

impl From<WireAndroidPermission> for Permission {
    fn from(wire: WireAndroidPermission) -> Self {
        let mut permission = Self::from(wire.base);
        permission.platform = Some(PlatformPermission {
            added_in_api_level: wire.added_in_api_level,
            declared_group: wire
                .google_declared_group
                .map(|PlatformGroupElement::AndroidPermissionGroup(group)| group.into()),
        });
        permission
    }
}

impl From<PermissionElement> for Permission {
    fn from(element: PermissionElement) -> Self {
        match element {
            PermissionElement::Permission(base) => base.into(),
            PermissionElement::AndroidPermission(platform) => platform.into(),
        }
    }
}

impl From<&Rank> for WireRank {
    fn from(rank: &Rank) -> Self {
        Self {
            value: rank.value,
            rank_name: rank.rank_name.clone(),
            permission_name: rank.permission_name.clone(),
        }
    }
}

impl From<WireRank> for Rank {
    fn from(wire: WireRank) -> Self {
        Self { value: wire.value, permission_name: wire.permission_name, rank_name: wire.rank_name }
    }
}

impl From<RankElement> for Rank {
    fn from(RankElement::Rank(wire): RankElement) -> Self {
        wire.into()
    }
}

impl From<&Score> for WireScore {
    fn from(score: &Score) -> Self {
        Self { value: score.value, rank_name: score.rank_name.clone(), app_hash: score.app_hash.clone() }
    }
}

impl From<WireScore> for Score {
    fn from(wire: WireScore) -> Self {
        Self { value: wire.value, app_hash: wire.app_hash, rank_name: wire.rank_name }
    }
}

impl From<ScoreElement> for Score {
    fn from(ScoreElement::Score(wire): ScoreElement) -> Self {
        wire.into()
    }
}

impl From<&PrivacyRank> for WirePrivacyRank {
    fn from(rank: &PrivacyRank) -> Self {
        Self {
            name: rank.name.clone(),
            source: rank.source.clone(),
            timestamp: rank.timestamp.clone(),
            permission_ranks_list: wire_list(&rank.ranks, |r| RankElement::Rank(r.into())),
            app_scores_list: wire_list(&rank.scores, |s| ScoreElement::Score(s.into())),
        }
    }
}

impl From<WirePrivacyRank> for PrivacyRank {
    fn from(wire: WirePrivacyRank) -> Self {
        Self {
            name: wire.name,
            source: wire.source,
            timestamp: wire.timestamp,
            ranks: domain_list(wire.permission_ranks_list),
            scores: domain_list(wire.app_scores_list),
        }
    }
}

impl From<&ExtractionMetadata> for WireExtractionMetadata {
    fn from(meta: &ExtractionMetadata) -> Self {
        Self { source: meta.source.clone(), method: meta.method.clone(), timestamp: meta.timestamp.clone() }
    }
}

impl From<WireExtractionMetadata> for ExtractionMetadata {
    fn from(wire: WireExtractionMetadata) -> Self {
        Self { source: wire.source, method: wire.method, timestamp: wire.timestamp }
    }
}

impl From<MetadataElement> for ExtractionMetadata {
    fn from(MetadataElement::ExtractionMetadata(wire): MetadataElement) -> Self {
        wire.into()
    }
}

impl From<&App> for WireApp {
    fn from(app: &App) -> Self {
        Self {
            hash: app.hash.clone(),
            package: app.package.clone(),
            version_code: app.version_code,
            version_name: app.version_name.clone(),
            min_sdk_version: app.min_sdk_version,
            target_sdk_version: app.target_sdk_version,
            max_sdk_version: app.max_sdk_version,
            category: app.category.clone(),
            uses_permission_list: wire_list(&app.uses_permissions, permission_element),
            defines_permission_list: wire_list(&app.defines_permissions, permission_element),
            defines_group_list: wire_list(&app.defines_groups, group_element),
            extraction_metadata_list: wire_list(&app.extraction_metadata, |meta| {
                MetadataElement::ExtractionMetadata(meta.into())
            }),
            score_list: wire_list(&app.scores, |score| ScoreElement::Score(score.into())),
        }
    }
}

impl From<WireApp> for App {
    fn from(wire: WireApp) -> Self {
        Self {
            hash: wire.hash,
            package: wire.package,
            version_code: wire.version_code,
            version_name: wire.version_name,
            min_sdk_version: wire.min_sdk_version,
            target_sdk_version: wire.target_sdk_version,
            max_sdk_version: wire.max_sdk_version,
            category: wire.category,
            uses_permissions: domain_list(wire.uses_permission_list),
            defines_permissions: domain_list(wire.defines_permission_list),
            defines_groups: domain_list(wire.defines_group_list),
            extraction_metadata: domain_list(wire.extraction_metadata_list),
            scores: domain_list(wire.score_list),
        }
    }
}

impl From<&AzDependency> for WireAzDependency {
    fn from(dep: &AzDependency) -> Self {
        Self { package: dep.package.clone(), version_code: dep.version_code }
    }
}

impl From<WireAzDependency> for AzDependency {
    fn from(wire: WireAzDependency) -> Self {
        Self { package: wire.package, version_code: wire.version_code }
    }
}

impl From<DependencyElement> for AzDependency {
    fn from(DependencyElement::AzDependency(wire): DependencyElement) -> Self {
        wire.into()
    }
}

impl From<&AzMetadata> for WireAzMetadata {
    fn from(meta: &AzMetadata) -> Self {
        Self {
            app_hash: meta.app_hash.clone(),
            az_metadata_date: meta.date.clone(),
            ratings_count: meta.ratings_count,
            star_rating: meta.star_rating,
            comment_count: meta.comment_count,
            one_star_ratings: meta.one_star_ratings,
            two_star_ratings: meta.two_star_ratings,
            three_star_ratings: meta.three_star_ratings,
            four_star_ratings: meta.four_star_ratings,
            five_star_ratings: meta.five_star_ratings,
            upload_date: meta.upload_date.clone(),
            creator: meta.creator.clone(),
            developer_name: meta.developer_name.clone(),
            developer_address: meta.developer_address.clone(),
            developer_email: meta.developer_email.clone(),
            developer_website: meta.developer_website.clone(),
            size: meta.size,
            num_downloads: meta.num_downloads.clone(),
            app_url: meta.app_url.clone(),
            app_title: meta.app_title.clone(),
            privacy_policy_url: meta.privacy_policy_url.clone(),
            az_dependency_list: wire_list(&meta.dependencies, |dep| {
                DependencyElement::AzDependency(dep.into())
            }),
        }
    }
}

impl From<WireAzMetadata> for AzMetadata {
    fn from(wire: WireAzMetadata) -> Self {
        Self {
            app_hash: wire.app_hash,
            date: wire.az_metadata_date,
            ratings_count: wire.ratings_count,
            star_rating: wire.star_rating,
            comment_count: wire.comment_count,
            one_star_ratings: wire.one_star_ratings,
            two_star_ratings: wire.two_star_ratings,
            three_star_ratings: wire.three_star_ratings,
            four_star_ratings: wire.four_star_ratings,
            five_star_ratings: wire.five_star_ratings,
            upload_date: wire.upload_date,
            creator: wire.creator,
            developer_name: wire.developer_name,
            developer_address: wire.developer_address,
            developer_email: wire.developer_email,
            developer_website: wire.developer_website,
            size: wire.size,
            num_downloads: wire.num_downloads,
            app_url: wire.app_url,
            app_title: wire.app_title,
            privacy_policy_url: wire.privacy_policy_url,
            dependencies: domain_list(wire.az_dependency_list),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn decoded(value: Value) -> Entity {
        match decode(value) {
            Ok(entity) => entity,
            Err(err) => panic!("decode failed: {err}"),
        }
    }

    #[test]
    fn app_encodes_with_tag_and_null_lists() {
        let app = App {
            version_code: Some(42),
            version_name: Some("1.2.0".to_string()),
            ..App::new("abc123", "com.example.notes")
        };

        let encoded = encode(&Entity::App(app));
        assert_eq!(
            encoded,
            json!({"App": {
                "hash": "abc123",
                "package": "com.example.notes",
                "version_code": 42,
                "version_name": "1.2.0",
                "min_sdk_version": null,
                "target_sdk_version": null,
                "max_sdk_version": null,
                "category": null,
                "uses_permission_list": null,
                "defines_permission_list": null,
                "defines_group_list": null,
                "extraction_metadata_list": null,
                "score_list": null
            }})
        );
    }

    #[test]
    fn platform_permission_nests_base_record() {
        let permission = Permission {
            protection_level: Some("dangerous".to_string()),
            platform: Some(PlatformPermission {
                added_in_api_level: Some("1".to_string()),
                declared_group: Some(PermissionGroup {
                    name: "android.permission-group.CAMERA".to_string(),
                    platform: Some(PlatformGroup { added_in_api_level: Some("29".to_string()) }),
                }),
            }),
            ..Permission::new("android.permission.CAMERA")
        };

        let encoded = encode(&Entity::Permission(permission.clone()));
        assert_eq!(
            encoded,
            json!({"AndroidPermission": {
                "Permission": {
                    "name": "android.permission.CAMERA",
                    "protection_level": "dangerous",
                    "declared_group_list": null,
                    "rank_list": null
                },
                "added_in_api_level": "1",
                "google_declared_group": {"AndroidPermissionGroup": {
                    "PermissionGroup": {"name": "android.permission-group.CAMERA"},
                    "added_in_api_level": "29"
                }}
            }})
        );
        assert_eq!(decoded(encoded), Entity::Permission(permission));
    }

    #[test]
    fn missing_and_null_fields_decode_identically() {
        let with_nulls = decoded(json!({"App": {
            "hash": "h1",
            "package": "com.example",
            "version_code": null,
            "uses_permission_list": null,
            "score_list": null
        }}));
        let without = decoded(json!({"App": {"hash": "h1", "package": "com.example"}}));
        assert_eq!(with_nulls, without);
    }

    #[test]
    fn api_level_accepts_numbers_and_strings() {
        let numeric = decoded(json!({"AndroidPermissionGroup": {
            "PermissionGroup": {"name": "g"},
            "added_in_api_level": 23
        }}));
        let textual = decoded(json!({"AndroidPermissionGroup": {
            "PermissionGroup": {"name": "g"},
            "added_in_api_level": "23"
        }}));
        assert_eq!(numeric, textual);
    }

    #[test]
    fn nested_permission_lists_accept_both_tags() {
        let entity = decoded(json!({"App": {
            "hash": "h1",
            "package": "com.example",
            "version_code": "7",
            "uses_permission_list": [
                {"Permission": {"name": "com.example.CUSTOM"}},
                {"AndroidPermission": {
                    "Permission": {"name": "android.permission.CAMERA", "protection_level": "dangerous"},
                    "added_in_api_level": "1",
                    "google_declared_group": null
                }}
            ]
        }}));

        let Entity::App(app) = entity else { panic!("expected an app") };
        assert_eq!(app.version_code, Some(7));
        assert_eq!(app.uses_permissions.len(), 2);
        assert!(!app.uses_permissions[0].is_platform());
        assert!(app.uses_permissions[1].is_platform());
    }

    #[test]
    fn unknown_tags_and_shapes_are_rejected() {
        assert_eq!(
            decode(json!({"Widget": {"name": "x"}})),
            Err(CatalogError::UnknownTag("Widget".to_string()))
        );
        assert!(matches!(decode(json!([1, 2])), Err(CatalogError::Malformed(_))));
        assert!(matches!(
            decode(json!({"Rank": {}, "Score": {}})),
            Err(CatalogError::Malformed(_))
        ));
        assert!(matches!(
            decode(json!({"Rank": {"value": "high"}})),
            Err(CatalogError::Decode { tag, .. }) if tag == "Rank"
        ));
    }

    #[test]
    fn az_metadata_uses_wire_field_names() {
        let entity = decoded(json!({"AzMetadata": {
            "app_hash": "h1",
            "az_metadata_date": "2023-03-01",
            "star_rating": 4.5,
            "num_downloads": "1,000+",
            "az_dependency_list": [{"AzDependency": {"package": "okhttp", "version_code": 4}}]
        }}));
        let Entity::AzMetadata(meta) = entity else { panic!("expected az metadata") };
        assert_eq!(meta.date, "2023-03-01");
        assert_eq!(meta.num_downloads.as_deref(), Some("1,000+"));
        assert_eq!(meta.dependencies, vec![AzDependency { package: "okhttp".to_string(), version_code: 4 }]);
    }

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}"
    }

    fn arb_text() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[A-Za-z0-9 ,+.-]{0,12}")
    }

    fn arb_api_level() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[1-9][0-9]?")
    }

    fn arb_platform_group() -> impl Strategy<Value = PermissionGroup> {
        (arb_name(), arb_api_level()).prop_map(|(name, added_in_api_level)| PermissionGroup {
            name,
            platform: Some(PlatformGroup { added_in_api_level }),
        })
    }

    fn arb_group() -> impl Strategy<Value = PermissionGroup> {
        prop_oneof![arb_name().prop_map(PermissionGroup::new), arb_platform_group()]
    }

    fn arb_rank() -> impl Strategy<Value = Rank> {
        (0.0_f64..100.0, arb_name(), arb_name())
            .prop_map(|(value, permission_name, rank_name)| Rank { value, permission_name, rank_name })
    }

    fn arb_score() -> impl Strategy<Value = Score> {
        (0.0_f64..=10.0, "[0-9a-f]{8,16}", arb_name())
            .prop_map(|(value, app_hash, rank_name)| Score { value, app_hash, rank_name })
    }

    fn arb_permission() -> impl Strategy<Value = Permission> {
        (
            arb_name(),
            proptest::option::of("normal|dangerous|signature"),
            proptest::collection::vec(arb_group(), 0..3),
            proptest::collection::vec(arb_rank(), 0..3),
            proptest::option::of((arb_api_level(), proptest::option::of(arb_platform_group()))),
        )
            .prop_map(|(name, protection_level, declared_groups, ranks, platform)| Permission {
                name,
                protection_level,
                declared_groups,
                ranks,
                platform: platform.map(|(added_in_api_level, declared_group)| PlatformPermission {
                    added_in_api_level,
                    declared_group,
                }),
            })
    }

    fn arb_metadata() -> impl Strategy<Value = ExtractionMetadata> {
        (arb_text(), arb_text(), arb_text())
            .prop_map(|(source, method, timestamp)| ExtractionMetadata { source, method, timestamp })
    }

    fn arb_app() -> impl Strategy<Value = App> {
        let sdk = || proptest::option::of(1_i64..35);
        (
            ("[0-9a-f]{8,16}", arb_name(), proptest::option::of(0_i64..100_000), arb_text()),
            (sdk(), sdk(), sdk(), arb_text()),
            (
                proptest::collection::vec(arb_permission(), 0..3),
                proptest::collection::vec(arb_permission(), 0..2),
                proptest::collection::vec(arb_group(), 0..2),
                proptest::collection::vec(arb_metadata(), 0..2),
            ),
            proptest::collection::vec(0.0_f64..=10.0, 0..2),
        )
            .prop_map(
                |(
                    (hash, package, version_code, version_name),
                    (min_sdk_version, target_sdk_version, max_sdk_version, category),
                    (uses_permissions, defines_permissions, defines_groups, extraction_metadata),
                    score_values,
                )| {
                    let scores = score_values
                        .into_iter()
                        .enumerate()
                        .map(|(index, value)| Score {
                            value,
                            app_hash: hash.clone(),
                            rank_name: format!("R{index}"),
                        })
                        .collect();
                    App {
                        hash,
                        package,
                        version_code,
                        version_name,
                        min_sdk_version,
                        target_sdk_version,
                        max_sdk_version,
                        category,
                        uses_permissions,
                        defines_permissions,
                        defines_groups,
                        extraction_metadata,
                        scores,
                    }
                },
            )
    }

    fn arb_privacy_rank() -> impl Strategy<Value = PrivacyRank> {
        (
            arb_name(),
            arb_text(),
            arb_text(),
            proptest::collection::vec(arb_rank(), 0..3),
            proptest::collection::vec(arb_score(), 0..3),
        )
            .prop_map(|(name, source, timestamp, ranks, scores)| PrivacyRank {
                name,
                source,
                timestamp,
                ranks,
                scores,
            })
    }

    fn arb_dependency() -> impl Strategy<Value = AzDependency> {
        (arb_name(), 0_i64..1_000).prop_map(|(package, version_code)| AzDependency { package, version_code })
    }

    fn arb_az_metadata() -> impl Strategy<Value = AzMetadata> {
        (
            (
                "[0-9a-f]{8,16}",
                "20[0-9]{2}-0[1-9]-[0-2][1-9]",
                proptest::option::of(0.0_f64..=5.0),
                proptest::collection::vec(proptest::option::of(0_i64..1_000_000), 7),
            ),
            (arb_text(), arb_text(), arb_text(), arb_text(), arb_text(), arb_text()),
            (proptest::option::of(0_i64..(1 << 30)), arb_text(), arb_text(), arb_text(), arb_text()),
            proptest::collection::vec(arb_dependency(), 0..3),
        )
            .prop_map(
                |(
                    (app_hash, date, star_rating, counts),
                    (upload_date, creator, developer_name, developer_address, developer_email, developer_website),
                    (size, num_downloads, app_url, app_title, privacy_policy_url),
                    dependencies,
                )| AzMetadata {
                    app_hash,
                    date,
                    ratings_count: counts[0],
                    star_rating,
                    comment_count: counts[1],
                    one_star_ratings: counts[2],
                    two_star_ratings: counts[3],
                    three_star_ratings: counts[4],
                    four_star_ratings: counts[5],
                    five_star_ratings: counts[6],
                    upload_date,
                    creator,
                    developer_name,
                    developer_address,
                    developer_email,
                    developer_website,
                    size,
                    num_downloads,
                    app_url,
                    app_title,
                    privacy_policy_url,
                    dependencies,
                },
            )
    }

    fn arb_entity() -> impl Strategy<Value = Entity> {
        prop_oneof![
            arb_app().prop_map(Entity::App),
            arb_permission().prop_map(Entity::Permission),
            arb_group().prop_map(Entity::PermissionGroup),
            arb_rank().prop_map(Entity::Rank),
            arb_score().prop_map(Entity::Score),
            arb_privacy_rank().prop_map(Entity::PrivacyRank),
            arb_metadata().prop_map(Entity::ExtractionMetadata),
            arb_az_metadata().prop_map(Entity::AzMetadata),
            arb_dependency().prop_map(Entity::AzDependency),
        ]
    }

    proptest! {
        #[test]
        fn property_every_entity_survives_encode_decode(entity in arb_entity()) {
            prop_assert_eq!(entity.validate(), Ok(()));
            let round_trip = decode(encode(&entity));
            prop_assert_eq!(round_trip, Ok(entity));
        }
    }
}
