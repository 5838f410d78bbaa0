//! Personal-attribute redaction for exported snapshots.
//!
//! Runs on every change-record snapshot and every `latest` row before a
//! change-set leaves the source. Always works on a copy; the stored audit
//! trail is never modified.
//!
//! For an item type whose [`ItemTypeDescriptor`](crate::registry::ItemTypeDescriptor)
//! names an owner link, a record carrying a non-empty link has every
//! attribute outside the allow-list nulled, or replaced by its mask rule.
//! Unlinked records of the same type pass through unfiltered.
//!
//! Timestamp attributes (names ending in `_at`) whose year falls outside
//! `0001..=9999` cannot be written by the destination serializer. They are
//! downcast to the nearest representable date (`9999-12-31` or
//! `0001-01-01`) so a single bad value never aborts an export.
//!
//! Redaction is idempotent: masks derive from the allow-listed `id`, the owner
//! link itself is nulled, and a normalized timestamp is already in range.

use crate::change::{Attributes, ChangeRecord};
use crate::registry::ItemTypeRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Latest year the destination serializer can represent.
pub const MAX_REPRESENTABLE_YEAR: i64 = 9999;
/// Earliest year the destination serializer can represent.
pub const MIN_REPRESENTABLE_YEAR: i64 = 1;

const MAX_DATE: &str = "9999-12-31";
const MIN_DATE: &str = "0001-01-01";

/// Strips personal attributes according to an [`ItemTypeRegistry`].
#[derive(Debug, Clone)]
pub struct Redactor {
    registry: Arc<ItemTypeRegistry>,
}

impl Redactor {
    pub fn new(registry: Arc<ItemTypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ItemTypeRegistry {
        &self.registry
    }

    /// Return a filtered copy of `attributes`.
    pub fn redact(&self, item_type: &str, attributes: &Attributes) -> Attributes {
        let descriptor = self
            .registry
            .get(item_type)
            .filter(|d| d.requires_redaction(attributes));

        attributes
            .iter()
            .map(|(name, value)| {
                let mut value = match descriptor {
                    Some(d) if !d.allowed_fields.contains(name) => match d.mask_rules.get(name) {
                        Some(rule) => rule.apply(attributes),
                        None => Value::Null,
                    },
                    _ => value.clone(),
                };
                if is_timestamp_attribute(name) {
                    if let Value::String(s) = &value {
                        if let Some(normalized) = normalize_timestamp(s) {
                            value = Value::String(normalized);
                        }
                    }
                }
                (name.clone(), value)
            })
            .collect()
    }

    /// Return a copy of `record` with its snapshot redacted.
    pub fn redact_record(&self, record: &ChangeRecord) -> ChangeRecord {
        ChangeRecord {
            object: record
                .object
                .as_ref()
                .map(|object| self.redact(&record.item_type, object)),
            ..record.clone()
        }
    }
}

fn is_timestamp_attribute(name: &str) -> bool {
    name.ends_with("_at")
}

/// Downcast an out-of-range timestamp string to a representable date.
///
/// Returns `None` when the value is in range or does not look like a
/// timestamp at all.
pub fn normalize_timestamp(value: &str) -> Option<String> {
    let trimmed = value.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "infinity" | "+infinity" => return Some(MAX_DATE.to_string()),
        "-infinity" => return Some(MIN_DATE.to_string()),
        _ => {}
    }

    let year = timestamp_year(trimmed)?;
    if year > MAX_REPRESENTABLE_YEAR {
        Some(MAX_DATE.to_string())
    } else if year < MIN_REPRESENTABLE_YEAR {
        Some(MIN_DATE.to_string())
    } else {
        None
    }
}

/// Extract the signed year of a `[+-]YYYY...-MM-DD[...]` string.
///
/// Years too large for `i64` saturate in their sign's direction.
fn timestamp_year(value: &str) -> Option<i64> {
    let (negative, rest) = match value.as_bytes().first()? {
        b'-' => (true, &value[1..]),
        b'+' => (false, &value[1..]),
        _ => (false, value),
    };

    let dash = rest.find('-')?;
    let (digits, tail) = rest.split_at(dash);
    if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    // tail = "-MM-DD..."
    let tail = tail.as_bytes();
    if tail.len() < 6
        || !tail[1].is_ascii_digit()
        || !tail[2].is_ascii_digit()
        || tail[3] != b'-'
        || !tail[4].is_ascii_digit()
        || !tail[5].is_ascii_digit()
    {
        return None;
    }

    let magnitude = digits.parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::EventKind;
    use chrono::Utc;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn redactor() -> Redactor {
        Redactor::new(Arc::new(ItemTypeRegistry::catalog()))
    }

    #[test]
    fn test_linked_agent_is_redacted() {
        let input = attrs(json!({
            "id": 7,
            "user_id": 3,
            "full_name": "Taro Yamada",
            "email": "taro@example.jp",
            "agent_identifier": "A-7",
            "created_at": "2014-10-29T12:43:25Z"
        }));

        let out = redactor().redact("Agent", &input);

        assert_eq!(out["id"], json!(7));
        assert_eq!(out["user_id"], Value::Null);
        assert_eq!(out["full_name"], json!("(Agent#7)"));
        assert_eq!(out["email"], Value::Null);
        assert_eq!(out["agent_identifier"], json!("A-7"));
        assert_eq!(out["created_at"], json!("2014-10-29T12:43:25Z"));
    }

    #[test]
    fn test_unlinked_agent_passes_through() {
        let input = attrs(json!({
            "id": 8,
            "user_id": null,
            "full_name": "Public Author",
            "email": "press@example.jp"
        }));
        assert_eq!(redactor().redact("Agent", &input), input);
    }

    #[test]
    fn test_other_types_pass_through() {
        let input = attrs(json!({"id": 1, "title": "T", "user_id": 9}));
        assert_eq!(redactor().redact("Book", &input), input);
    }

    #[test]
    fn test_redaction_is_idempotent() {
        let input = attrs(json!({
            "id": 7,
            "user_id": 3,
            "full_name": "Taro Yamada",
            "note": "private",
            "updated_at": "+20000-01-01T00:00:00Z"
        }));
        let r = redactor();
        let once = r.redact("Agent", &input);
        let twice = r.redact("Agent", &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_redact_record_leaves_original_untouched() {
        let original = ChangeRecord {
            id: 1,
            item_type: "Agent".to_string(),
            item_id: 7,
            event: EventKind::Update,
            object: Some(attrs(json!({"id": 7, "user_id": 3, "full_name": "Taro"}))),
            created_at: Utc::now(),
        };
        let redacted = redactor().redact_record(&original);

        assert_eq!(original.object.as_ref().unwrap()["full_name"], json!("Taro"));
        assert_eq!(redacted.object.as_ref().unwrap()["full_name"], json!("(Agent#7)"));
        assert_eq!(redacted.id, original.id);
        assert_eq!(redacted.event, original.event);
    }

    #[test]
    fn test_record_without_snapshot() {
        let create = ChangeRecord {
            id: 1,
            item_type: "Agent".to_string(),
            item_id: 7,
            event: EventKind::Create,
            object: None,
            created_at: Utc::now(),
        };
        assert!(redactor().redact_record(&create).object.is_none());
    }

    #[test]
    fn test_normalize_timestamp_in_range() {
        assert_eq!(normalize_timestamp("2014-10-29T12:43:25Z"), None);
        assert_eq!(normalize_timestamp("9999-12-31"), None);
        assert_eq!(normalize_timestamp("0001-01-01T00:00:00Z"), None);
    }

    #[test]
    fn test_normalize_timestamp_out_of_range() {
        assert_eq!(
            normalize_timestamp("+275760-09-13T00:00:00Z").as_deref(),
            Some("9999-12-31")
        );
        assert_eq!(
            normalize_timestamp("10000-01-01 00:00:00").as_deref(),
            Some("9999-12-31")
        );
        assert_eq!(
            normalize_timestamp("-0044-03-15T00:00:00Z").as_deref(),
            Some("0001-01-01")
        );
        assert_eq!(
            normalize_timestamp("0000-01-01T00:00:00Z").as_deref(),
            Some("0001-01-01")
        );
        assert_eq!(normalize_timestamp("infinity").as_deref(), Some("9999-12-31"));
        assert_eq!(normalize_timestamp("-infinity").as_deref(), Some("0001-01-01"));
    }

    #[test]
    fn test_normalize_timestamp_ignores_non_timestamps() {
        assert_eq!(normalize_timestamp(""), None);
        assert_eq!(normalize_timestamp("yesterday"), None);
        assert_eq!(normalize_timestamp("12-34"), None);
        assert_eq!(normalize_timestamp("2014/10/29"), None);
    }

    #[test]
    fn test_overflowing_timestamp_in_unfiltered_type() {
        let input = attrs(json!({"id": 1, "published_at": "99999-01-01T00:00:00Z", "title": "99999-01-01"}));
        let out = redactor().redact("Book", &input);
        assert_eq!(out["published_at"], json!("9999-12-31"));
        // Only `_at` attributes are treated as timestamps.
        assert_eq!(out["title"], json!("99999-01-01"));
    }
}
