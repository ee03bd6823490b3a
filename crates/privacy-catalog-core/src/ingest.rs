use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::{wire, CatalogError, Entity, EntityKind};

/// Optional allowlist of entity kinds an ingestion call may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestPolicy {
    allowed: Option<BTreeSet<EntityKind>>,
}

impl IngestPolicy {
    #[must_use]
    pub fn allow_all() -> Self {
        Self { allowed: None }
    }

    #[must_use]
    pub fn only(kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        Self { allowed: Some(kinds.into_iter().collect()) }
    }

    /// Policy for externally submitted ledgers: privacy ranks and scores only.
    #[must_use]
    pub fn ledger_only() -> Self {
        Self::only([EntityKind::PrivacyRank, EntityKind::Score])
    }

    #[must_use]
    pub fn allows(&self, kind: EntityKind) -> bool {
        self.allowed.as_ref().map_or(true, |allowed| allowed.contains(&kind))
    }

    #[must_use]
    pub fn allowed_kinds(&self) -> Option<&BTreeSet<EntityKind>> {
        self.allowed.as_ref()
    }
}

/// Decode a whole interchange document into entities, in document order.
///
/// A top-level key containing `_` wraps an array of tagged elements; any other
/// key is itself an entity tag. Nothing is returned unless every element
/// decodes, so callers never persist part of a rejected document.
///
/// # Errors
/// Returns [`CatalogError::Malformed`] for invalid JSON or shapes, including
/// top-level `ExtractionMetadata` (it only exists nested under an app).
/// Returns [`CatalogError::UnknownTag`] / [`CatalogError::Decode`] for bad
/// elements and [`CatalogError::DisallowedKind`] when `policy` rejects an
/// element kind.
pub fn decode_document(text: &str, policy: &IngestPolicy) -> Result<Vec<Entity>, CatalogError> {
    let document: Map<String, Value> = serde_json::from_str(text)
        .map_err(|err| CatalogError::Malformed(format!("document is not a JSON object: {err}")))?;

    let mut entities = Vec::new();
    for (tag, value) in document {
        if tag.contains('_') {
            let Value::Array(elements) = value else {
                return Err(CatalogError::Malformed(format!(
                    "list tag `{tag}` MUST hold an array of tagged elements"
                )));
            };
            for element in elements {
                entities.push(decode_element(element, policy)?);
            }
        } else {
            let mut element = Map::new();
            element.insert(tag, value);
            entities.push(decode_element(Value::Object(element), policy)?);
        }
    }

    Ok(entities)
}

fn decode_element(element: Value, policy: &IngestPolicy) -> Result<Entity, CatalogError> {
    let tag = wire::single_tag(&element)?;
    let kind = EntityKind::parse(&tag).ok_or_else(|| CatalogError::UnknownTag(tag.clone()))?;
    if !policy.allows(kind) {
        return Err(CatalogError::DisallowedKind(tag));
    }
    if kind == EntityKind::ExtractionMetadata {
        return Err(CatalogError::Malformed(
            "`ExtractionMetadata` has no key of its own; nest it under an `App`".to_string(),
        ));
    }
    let entity = wire::decode(element)?;
    entity.validate()?;
    Ok(entity)
}
