//! Property projection, placeholder stripping and Created/Updated
//! classification of raw CRM records.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::crm::model::CrmObject;
use crate::model::{Action, ActionKind, EntityType};

/// Values the CRM uses in place of "no data". Compared case-insensitively.
pub const SENTINEL_VALUES: [&str; 8] = [
    "[not provided]",
    "placeholder",
    "[[unknown]]",
    "not set",
    "not provided",
    "unknown",
    "undefined",
    "n/a",
];

/// Substring that marks an unresolved template value.
pub const RECORD_MARKER: &str = "!$record";

/// How the sentinel set and the record marker combine to reject a value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SentinelPredicate {
    /// Keep a value only if it is neither a sentinel nor marked.
    #[default]
    Conjunction,
    /// Keep a value if it is not a sentinel or not marked. No sentinel
    /// contains the marker, so this keeps every non-empty string.
    Legacy,
}

impl SentinelPredicate {
    pub fn keeps(&self, value: &str) -> bool {
        let lower = value.to_lowercase();
        let sentinel = SENTINEL_VALUES.contains(&lower.as_str());
        let marked = lower.contains(RECORD_MARKER);
        match self {
            SentinelPredicate::Conjunction => !sentinel && !marked,
            SentinelPredicate::Legacy => !sentinel || !marked,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    predicate: SentinelPredicate,
}

impl Normalizer {
    pub fn new(predicate: SentinelPredicate) -> Self {
        Self { predicate }
    }

    /// Drops empty and placeholder values. Applying it twice is the same as once.
    pub fn strip_placeholders(&self, props: BTreeMap<String, String>) -> BTreeMap<String, String> {
        props
            .into_iter()
            .filter(|(_, v)| !v.is_empty() && self.predicate.keeps(v))
            .collect()
    }

    /// Builds the action for one record, or `None` when the record carries no
    /// properties at all. `checkpoint` is the entity's checkpoint from before
    /// the sweep started.
    pub fn to_action(
        &self,
        entity: EntityType,
        record: &CrmObject,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Option<Action> {
        let raw = record.properties.as_ref()?;
        let projected: BTreeMap<String, String> = entity
            .properties()
            .iter()
            .filter_map(|&name| {
                let value = render_value(raw.get(name)?)?;
                Some((name.to_string(), value))
            })
            .collect();

        let kind = classify(record.created_at, checkpoint);
        let action_date = match kind {
            ActionKind::Created => record.created_at,
            ActionKind::Updated => record.updated_at,
        };

        Some(Action {
            id: Uuid::new_v4(),
            action_name: format!("{} {}", entity.action_prefix(), kind.as_str()),
            action_date,
            include_in_analytics: false,
            entity_type: entity,
            properties: self.strip_placeholders(projected),
            contact_emails: None,
        })
    }
}

/// A record is new if it was created strictly after the checkpoint. Without
/// a checkpoint nothing can be proven new, so the record counts as updated.
pub fn classify(created_at: DateTime<Utc>, checkpoint: Option<DateTime<Utc>>) -> ActionKind {
    match checkpoint {
        Some(checkpoint) if created_at > checkpoint => ActionKind::Created,
        _ => ActionKind::Updated,
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
