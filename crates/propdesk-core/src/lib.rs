//! Core domain model for PropDesk intake reconciliation: the whitelisted
//! field schema, patch sanitizer, deep-merge engine, status vocabulary and
//! per-field provenance. Pure data and functions, no I/O.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Value};

pub const CRATE_NAME: &str = "propdesk-core";

/// Declared type of a whitelisted intake field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    /// Fixed literal allow-set; anything else normalizes to absent.
    Literal(&'static [&'static str]),
}

/// One entry of the intake field schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// The fixed, ordered allow-list of fields an extraction or a manual patch
/// may carry. Unknown keys never pass the sanitizer.
pub const INTAKE_FIELDS: &[FieldSpec] = &[
    FieldSpec { name: "address", kind: FieldKind::Text },
    FieldSpec { name: "area", kind: FieldKind::Number },
    FieldSpec { name: "rooms", kind: FieldKind::Number },
    FieldSpec { name: "yearBuilt", kind: FieldKind::Number },
    FieldSpec { name: "energyRating", kind: FieldKind::Text },
    FieldSpec { name: "description", kind: FieldKind::Text },
    FieldSpec { name: "schemaVersion", kind: FieldKind::Literal(&["v1", "v2"]) },
];

/// Result of sanitizing an arbitrary inbound patch. A key is present iff it
/// appeared in the input and belongs to the schema; `None` means the caller
/// explicitly submitted an empty/invalid value for it, which downstream
/// layers interpret as "reset this field".
pub type SanitizedPatch = BTreeMap<&'static str, Option<Value>>;

impl FieldKind {
    fn coerce(self, value: &Value) -> Option<Value> {
        match self {
            FieldKind::Text => match value {
                Value::String(s) if !s.is_empty() => Some(value.clone()),
                _ => None,
            },
            FieldKind::Number => coerce_number(value),
            FieldKind::Literal(allowed) => match value {
                Value::String(s) if allowed.contains(&s.as_str()) => Some(value.clone()),
                _ => None,
            },
        }
    }
}

fn coerce_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => {
            if n.as_f64().map(f64::is_finite).unwrap_or(false) {
                Some(value.clone())
            } else {
                None
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(int) = trimmed.parse::<i64>() {
                return Some(Value::from(int));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        }
        _ => None,
    }
}

/// Filter an arbitrary JSON value down to the whitelisted field schema.
/// Permissive by design: unknown keys are dropped silently because upstream
/// forms over-post, and non-objects sanitize to an empty patch.
pub fn sanitize(input: &Value) -> SanitizedPatch {
    let mut out = SanitizedPatch::new();
    let Value::Object(map) = input else {
        return out;
    };
    for spec in INTAKE_FIELDS {
        if let Some(value) = map.get(spec.name) {
            out.insert(spec.name, spec.kind.coerce(value));
        }
    }
    out
}

/// Keep only the keys of a sanitized patch that resolved to a defined value.
pub fn defined(patch: &SanitizedPatch) -> JsonMap<String, Value> {
    let mut out = JsonMap::new();
    for (name, value) in patch {
        if let Some(value) = value {
            out.insert((*name).to_string(), value.clone());
        }
    }
    out
}

/// Deep-merge `patch` over `base`.
///
/// Objects merge recursively key-by-key with patch keys winning; arrays are
/// replaced wholesale, never concatenated; a `null` patch value is the
/// sparse "absent" marker and yields the base value; everything else is a
/// plain replacement. Deterministic and panic-free for any JSON input.
pub fn merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut out = base_map.clone();
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    continue;
                }
                let merged = match base_map.get(key) {
                    Some(base_value @ Value::Object(_)) if patch_value.is_object() => {
                        merge(base_value, patch_value)
                    }
                    _ => patch_value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => {
            if patch.is_null() {
                base.clone()
            } else {
                patch.clone()
            }
        }
    }
}

/// Fold a sanitized patch into an existing override/draft map: defined
/// values deep-merge in, explicitly-cleared keys are removed entirely
/// (never stored as null).
pub fn apply_sanitized(existing: &JsonMap<String, Value>, patch: &SanitizedPatch) -> JsonMap<String, Value> {
    let merged = merge(
        &Value::Object(existing.clone()),
        &Value::Object(defined(patch)),
    );
    let mut out = match merged {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    };
    for (name, value) in patch {
        if value.is_none() {
            out.remove(*name);
        }
    }
    out
}

/// Drop every override key whose value is strictly equal to the raw value
/// it would shadow, so a correction that merely duplicates the source does
/// not mask future changes to that source.
pub fn prune_matching(data: &mut JsonMap<String, Value>, raw: &JsonMap<String, Value>) {
    let stale: Vec<String> = data
        .iter()
        .filter(|(key, value)| raw.get(key.as_str()) == Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    for key in stale {
        data.remove(&key);
    }
}

/// Lifecycle status shared by intake runs and their parser jobs. Statuses
/// outside the known set round-trip verbatim so a newer parser can grow the
/// vocabulary without breaking ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Other(String),
}

impl IntakeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntakeStatus::Succeeded | IntakeStatus::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            IntakeStatus::Queued => "queued",
            IntakeStatus::Processing => "processing",
            IntakeStatus::Succeeded => "succeeded",
            IntakeStatus::Failed => "failed",
            IntakeStatus::Other(s) => s,
        }
    }
}

impl From<&str> for IntakeStatus {
    fn from(s: &str) -> Self {
        match s {
            "queued" => IntakeStatus::Queued,
            "processing" => IntakeStatus::Processing,
            "succeeded" => IntakeStatus::Succeeded,
            "failed" => IntakeStatus::Failed,
            other => IntakeStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for IntakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for IntakeStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IntakeStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(IntakeStatus::from(s.as_str()))
    }
}

/// Where a merged-view field came from; rendered as a per-field tag by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSource {
    Raw,
    Override,
}

/// Provenance map for the merged view: every key of raw and overrides,
/// tagged with the layer that supplies its merged value.
pub fn provenance(
    raw: &JsonMap<String, Value>,
    overrides: &JsonMap<String, Value>,
) -> BTreeMap<String, FieldSource> {
    let mut out = BTreeMap::new();
    for key in raw.keys() {
        out.insert(key.clone(), FieldSource::Raw);
    }
    for key in overrides.keys() {
        out.insert(key.clone(), FieldSource::Override);
    }
    out
}

/// Placeholder dataset rendered when an object has no succeeded extraction
/// yet, so the intake form is populated instead of broken.
pub fn fallback_dataset() -> JsonMap<String, Value> {
    let value = serde_json::json!({
        "schemaVersion": "v1",
        "address": "",
        "area": 0,
        "rooms": 0,
        "yearBuilt": 0,
        "energyRating": "",
        "description": "",
    });
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}
