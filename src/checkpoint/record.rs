//! Result records stored in the checkpoint.
//!
//! On disk a record is a flat JSON object: the `id`, followed either by the
//! stage's success fields or by `error` and `error_kind`.

use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::dataset::{ItemId, ID_FIELD};

/// Field carrying the failure message.
pub const ERROR_FIELD: &str = "error";

/// Field carrying the failure classification.
pub const ERROR_KIND_FIELD: &str = "error_kind";

/// Closed classification of per-item failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The item lacks a required field.
    Validation,
    /// The referenced attachment does not exist or cannot be read.
    AttachmentMissing,
    /// Rate limiting persisted past the retry budget.
    RemoteTransient,
    /// The provider rejected the call.
    RemoteFatal,
    /// The response carried nothing that could be parsed, not even raw text.
    ParseFallback,
}

impl FailureKind {
    /// All kinds, in display order.
    pub const ALL: [FailureKind; 5] = [
        FailureKind::Validation,
        FailureKind::AttachmentMissing,
        FailureKind::RemoteTransient,
        FailureKind::RemoteFatal,
        FailureKind::ParseFallback,
    ];

    /// Stable snake_case name, matching the on-disk form.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::AttachmentMissing => "attachment_missing",
            FailureKind::RemoteTransient => "remote_transient",
            FailureKind::RemoteFatal => "remote_fatal",
            FailureKind::ParseFallback => "parse_fallback",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified per-item failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Read from a record written without `error_kind`; saved without it too.
    unclassified: bool,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            unclassified: false,
        }
    }

    /// A failure from an older checkpoint that carries no kind. It counts as
    /// `remote_fatal`.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            unclassified: true,
            ..Self::new(FailureKind::RemoteFatal, message)
        }
    }

    /// Whether the kind was inferred rather than recorded.
    pub fn is_unclassified(&self) -> bool {
        self.unclassified
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn attachment_missing(message: impl Into<String>) -> Self {
        Self::new(FailureKind::AttachmentMissing, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one unit of work. Exactly one of success or failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Map<String, Value>),
    Failure(Failure),
}

/// The outcome for one work item, keyed by the item's identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub id: ItemId,
    pub outcome: Outcome,
}

impl ResultRecord {
    /// Creates a success record. An `id` key inside `payload` is ignored.
    pub fn success(id: ItemId, mut payload: Map<String, Value>) -> Self {
        payload.remove(ID_FIELD);
        Self {
            id,
            outcome: Outcome::Success(payload),
        }
    }

    /// Creates a failure record.
    pub fn failure(id: ItemId, failure: Failure) -> Self {
        Self {
            id,
            outcome: Outcome::Failure(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failure(_))
    }

    /// The failure, if this is a failure record.
    pub fn failure_ref(&self) -> Option<&Failure> {
        match &self.outcome {
            Outcome::Failure(f) => Some(f),
            Outcome::Success(_) => None,
        }
    }

    /// The success payload, if this is a success record.
    pub fn payload(&self) -> Option<&Map<String, Value>> {
        match &self.outcome {
            Outcome::Success(p) => Some(p),
            Outcome::Failure(_) => None,
        }
    }

    /// Whether the record counts as done.
    ///
    /// Failures are resolved unless `retry_failed` is set. A success record
    /// with an empty payload carries nothing and is always unresolved.
    pub fn is_resolved(&self, retry_failed: bool) -> bool {
        match &self.outcome {
            Outcome::Success(payload) => !payload.is_empty(),
            Outcome::Failure(_) => !retry_failed,
        }
    }

    /// Parses a record from its on-disk JSON object.
    ///
    /// Returns `None` when the value is not an object or has no usable `id`.
    /// Failure records written without `error_kind` load as `remote_fatal`.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        let id = fields.remove(ID_FIELD).as_ref().and_then(ItemId::from_value)?;

        if let Some(error) = fields.get(ERROR_FIELD) {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let kind = fields
                .get(ERROR_KIND_FIELD)
                .cloned()
                .and_then(|k| serde_json::from_value::<FailureKind>(k).ok());
            let failure = match kind {
                Some(kind) => Failure::new(kind, message),
                None => Failure::unclassified(message),
            };
            return Some(Self::failure(id, failure));
        }

        Some(Self::success(id, fields))
    }
}

impl Serialize for ResultRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(ID_FIELD, &self.id)?;
        match &self.outcome {
            Outcome::Success(payload) => {
                for (k, v) in payload {
                    map.serialize_entry(k, v)?;
                }
            }
            Outcome::Failure(failure) => {
                map.serialize_entry(ERROR_FIELD, &failure.message)?;
                if !failure.unclassified {
                    map.serialize_entry(ERROR_KIND_FIELD, &failure.kind)?;
                }
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResultRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ResultRecord::from_value(value)
            .ok_or_else(|| D::Error::custom("result record must be an object with an integer or string id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_success_serializes_flat() {
        let record = ResultRecord::success(
            ItemId::Int(4),
            payload(json!({"translation": "hello", "id": 99})),
        );
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value, json!({"id": 4, "translation": "hello"}));
    }

    #[test]
    fn test_failure_serializes_kind() {
        let record = ResultRecord::failure(
            ItemId::from("q-1"),
            Failure::attachment_missing("Image not found: a.png"),
        );
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(
            value,
            json!({"id": "q-1", "error": "Image not found: a.png", "error_kind": "attachment_missing"})
        );
    }

    #[test]
    fn test_legacy_failure_defaults_to_remote_fatal() {
        let record: ResultRecord =
            serde_json::from_value(json!({"id": 2, "error": "boom"})).expect("deserialize");
        let failure = record.failure_ref().expect("failure");
        assert_eq!(failure.kind, FailureKind::RemoteFatal);
        assert_eq!(failure.message, "boom");
        assert!(failure.is_unclassified());
    }

    #[test]
    fn test_legacy_failure_saves_without_kind() {
        let original = json!({"id": 2, "error": "boom"});
        let record: ResultRecord = serde_json::from_value(original.clone()).expect("deserialize");
        assert_eq!(serde_json::to_value(&record).expect("serialize"), original);

        let classified: ResultRecord = serde_json::from_value(
            json!({"id": 3, "error": "slow", "error_kind": "remote_transient"}),
        )
        .expect("deserialize");
        assert!(!classified.failure_ref().expect("failure").is_unclassified());
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        assert!(ResultRecord::from_value(json!({"translation": "x"})).is_none());
        assert!(serde_json::from_value::<ResultRecord>(json!([1, 2])).is_err());
    }

    #[test]
    fn test_resolution_rules() {
        let success = ResultRecord::success(ItemId::Int(1), payload(json!({"answer": "A"})));
        let empty = ResultRecord::success(ItemId::Int(2), Map::new());
        let failure = ResultRecord::failure(ItemId::Int(3), Failure::validation("missing image"));

        assert!(success.is_resolved(false));
        assert!(success.is_resolved(true));
        assert!(!empty.is_resolved(false));
        assert!(failure.is_resolved(false));
        assert!(!failure.is_resolved(true));
    }

    #[test]
    fn test_failure_kind_names_match_serde() {
        for kind in FailureKind::ALL {
            let value = serde_json::to_value(kind).expect("serialize");
            assert_eq!(value, json!(kind.as_str()));
        }
    }
}
