//! Per-item-type behavior registry.
//!
//! Redaction rules and replay hook suppression vary by item type. Instead of
//! comparing type names at each call site, every behavior is described once
//! in an [`ItemTypeDescriptor`] and looked up by name.
//!
//! # YAML Example
//!
//! ```yaml
//! Agent:
//!   owner_link_field: user_id
//!   allowed_fields: [id, created_at, updated_at, agent_identifier]
//!   mask_rules:
//!     full_name: { kind: identifier_placeholder, label: Agent }
//! Library:
//!   suppress_hooks: true
//! ```

use crate::change::Attributes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Deterministic replacement for a personal attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaskRule {
    /// `"(<label>#<id>)"`, derived from the record's own `id` attribute.
    IdentifierPlaceholder { label: String },
}

impl MaskRule {
    /// Produce the masked value for a record.
    pub fn apply(&self, attributes: &Attributes) -> Value {
        match self {
            MaskRule::IdentifierPlaceholder { label } => {
                let id = match attributes.get("id") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => "?".to_string(),
                    Some(other) => other.to_string(),
                };
                Value::String(format!("({}#{})", label, id))
            }
        }
    }
}

/// Behavior of one item type during export and replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemTypeDescriptor {
    /// Attribute linking a record to an owning actor. Redaction only applies
    /// to records where this attribute is present and non-empty. `None`
    /// disables redaction for the type.
    #[serde(default)]
    pub owner_link_field: Option<String>,

    /// Attributes that survive redaction untouched.
    #[serde(default)]
    pub allowed_fields: BTreeSet<String>,

    /// Attributes replaced by a deterministic placeholder instead of null.
    #[serde(default)]
    pub mask_rules: BTreeMap<String, MaskRule>,

    /// Suppress create-time side effects while replaying a new record.
    #[serde(default)]
    pub suppress_hooks: bool,
}

impl ItemTypeDescriptor {
    /// True when this record is linked to an owning actor and must be redacted.
    pub fn requires_redaction(&self, attributes: &Attributes) -> bool {
        let Some(field) = self.owner_link_field.as_deref() else {
            return false;
        };
        match attributes.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }
}

/// Item type name → descriptor.
///
/// Types without an entry are exported unfiltered and replayed with side
/// effects enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemTypeRegistry {
    descriptors: HashMap<String, ItemTypeDescriptor>,
}

impl Default for ItemTypeRegistry {
    fn default() -> Self {
        Self::catalog()
    }
}

impl ItemTypeRegistry {
    /// Registry with no entries.
    pub fn empty() -> Self {
        Self {
            descriptors: HashMap::new(),
        }
    }

    /// The catalog registry: agents linked to a user account are redacted,
    /// libraries are replayed without auto-provisioning shelves.
    pub fn catalog() -> Self {
        let agent = ItemTypeDescriptor {
            owner_link_field: Some("user_id".to_string()),
            allowed_fields: [
                "id",
                "created_at",
                "updated_at",
                "deleted_at",
                "language_id",
                "country_id",
                "agent_type_id",
                "required_role_id",
                "required_score",
                "agent_identifier",
                "exclude_state",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            mask_rules: BTreeMap::from([(
                "full_name".to_string(),
                MaskRule::IdentifierPlaceholder {
                    label: "Agent".to_string(),
                },
            )]),
            suppress_hooks: false,
        };
        let library = ItemTypeDescriptor {
            suppress_hooks: true,
            ..Default::default()
        };

        Self::empty()
            .with("Agent", agent)
            .with("Library", library)
    }

    /// Add or replace a descriptor.
    pub fn with(mut self, item_type: impl Into<String>, descriptor: ItemTypeDescriptor) -> Self {
        self.descriptors.insert(item_type.into(), descriptor);
        self
    }

    pub fn get(&self, item_type: &str) -> Option<&ItemTypeDescriptor> {
        self.descriptors.get(item_type)
    }

    /// Whether replaying a new record of this type must suppress side effects.
    pub fn suppresses_hooks(&self, item_type: &str) -> bool {
        self.get(item_type).map(|d| d.suppress_hooks).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_mask_rule_numeric_id() {
        let rule = MaskRule::IdentifierPlaceholder {
            label: "Agent".to_string(),
        };
        assert_eq!(rule.apply(&attrs(json!({"id": 42}))), json!("(Agent#42)"));
    }

    #[test]
    fn test_mask_rule_string_and_missing_id() {
        let rule = MaskRule::IdentifierPlaceholder {
            label: "Agent".to_string(),
        };
        assert_eq!(rule.apply(&attrs(json!({"id": "a-1"}))), json!("(Agent#a-1)"));
        assert_eq!(rule.apply(&attrs(json!({}))), json!("(Agent#?)"));
    }

    #[test]
    fn test_requires_redaction_only_when_linked() {
        let registry = ItemTypeRegistry::catalog();
        let agent = registry.get("Agent").unwrap();

        assert!(agent.requires_redaction(&attrs(json!({"user_id": 3}))));
        assert!(!agent.requires_redaction(&attrs(json!({"user_id": null}))));
        assert!(!agent.requires_redaction(&attrs(json!({"user_id": ""}))));
        assert!(!agent.requires_redaction(&attrs(json!({"full_name": "x"}))));
    }

    #[test]
    fn test_descriptor_without_link_never_redacts() {
        let descriptor = ItemTypeDescriptor::default();
        assert!(!descriptor.requires_redaction(&attrs(json!({"user_id": 3}))));
    }

    #[test]
    fn test_catalog_hook_suppression() {
        let registry = ItemTypeRegistry::catalog();
        assert!(registry.suppresses_hooks("Library"));
        assert!(!registry.suppresses_hooks("Agent"));
        assert!(!registry.suppresses_hooks("Book"));
    }

    #[test]
    fn test_registry_yaml_like_json_roundtrip() {
        let json = r#"{
            "Agent": {
                "owner_link_field": "user_id",
                "allowed_fields": ["id"],
                "mask_rules": {"full_name": {"kind": "identifier_placeholder", "label": "Agent"}}
            },
            "Library": {"suppress_hooks": true}
        }"#;
        let registry: ItemTypeRegistry = serde_json::from_str(json).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.suppresses_hooks("Library"));
        let agent = registry.get("Agent").unwrap();
        assert!(agent.allowed_fields.contains("id"));
        assert!(agent.mask_rules.contains_key("full_name"));
    }

    #[test]
    fn test_default_is_catalog() {
        assert_eq!(ItemTypeRegistry::default(), ItemTypeRegistry::catalog());
        assert!(ItemTypeRegistry::empty().is_empty());
    }
}
