/*!
Checkpoint data model and key layout.

A [`Checkpoint`] is an opaque, versioned snapshot of a workflow's execution
state. The core never interprets `context`; it only stores and returns it.
*/

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{CheckpointError, Result};

/// Current checkpoint format version
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Version assumed for records written without a version tag
pub const LEGACY_FORMAT_VERSION: u32 = 1;

/// Separator between key segments; reserved in workflow and checkpoint ids
pub const KEY_SEPARATOR: char = ':';

const CHECKPOINT_KEY_PREFIX: &str = "checkpoint";
const WORKFLOW_KEY_PREFIX: &str = "workflow";

/// Why a checkpoint was taken. Informational only.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    #[default]
    Auto,
    Manual,
    BeforeStep,
    AfterStep,
}

/// A durable, timestamped snapshot of resumable execution state
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Unique identifier; generated on save when empty
    #[serde(default)]
    pub id: String,

    /// Owning workflow; all of its checkpoints share a key prefix
    pub workflow_id: String,

    /// Creation time; set to now on save when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Node the workflow was executing when the checkpoint was taken
    #[serde(default)]
    pub current_node: String,

    #[serde(default)]
    pub completed_nodes: Vec<String>,

    /// Opaque resumable state
    #[serde(default)]
    pub context: serde_json::Value,

    #[serde(rename = "type", default)]
    pub checkpoint_type: CheckpointType,

    /// Format version; zero means "unset" and reads back as legacy v1
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Checkpoint {
    /// Create a checkpoint for a workflow at a node
    ///
    /// `id`, `timestamp` and `version` are left unset so the manager assigns
    /// them on save.
    ///
    /// # Example
    /// ```rust
    /// use waypoint_core::Checkpoint;
    ///
    /// let checkpoint = Checkpoint::new("w1", "plan", serde_json::json!({"step": 1}));
    /// assert!(checkpoint.id.is_empty());
    /// assert_eq!(checkpoint.workflow_id, "w1");
    /// ```
    pub fn new<S1, S2>(workflow_id: S1, current_node: S2, context: serde_json::Value) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: String::new(),
            workflow_id: workflow_id.into(),
            timestamp: None,
            current_node: current_node.into(),
            completed_nodes: Vec::new(),
            context,
            checkpoint_type: CheckpointType::Auto,
            version: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a checkpoint whose context is the serialized form of `state`
    pub fn with_context<S1, S2, T>(workflow_id: S1, current_node: S2, state: &T) -> Result<Self>
    where
        S1: Into<String>,
        S2: Into<String>,
        T: Serialize,
    {
        let context = serde_json::to_value(state)?;
        Ok(Self::new(workflow_id, current_node, context))
    }

    /// Deserialize the opaque context into a caller-defined type
    pub fn context_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.context.clone()).map_err(CheckpointError::Json)
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_type(mut self, checkpoint_type: CheckpointType) -> Self {
        self.checkpoint_type = checkpoint_type;
        self
    }

    pub fn with_completed_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.completed_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Fill in id, timestamp and version where the caller left them unset
    pub fn assign_defaults(&mut self) {
        if self.id.is_empty() {
            self.id = generate_checkpoint_id();
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        if self.version == 0 {
            self.version = CHECKPOINT_FORMAT_VERSION;
        }
    }

    /// Creation time, or the Unix epoch if the checkpoint was never saved
    pub fn created_at(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Storage key for this checkpoint
    pub fn key(&self) -> String {
        checkpoint_key(&self.workflow_id, &self.id)
    }

    /// Validate a checkpoint before it is persisted
    ///
    /// Rejects an empty workflow or checkpoint id, ids containing the key
    /// separator, a null context and a zero version.
    pub fn validate(&self) -> Result<()> {
        validate_segment("workflow_id", &self.workflow_id)?;
        validate_segment("id", &self.id)?;
        if self.context.is_null() {
            return Err(CheckpointError::validation("checkpoint context is missing"));
        }
        if self.version == 0 {
            return Err(CheckpointError::validation(
                "checkpoint version must be positive",
            ));
        }
        Ok(())
    }
}

/// Check that an id is usable as a key segment
pub(crate) fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CheckpointError::validation(format!("{field} cannot be empty")));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(CheckpointError::validation(format!(
            "{field} cannot contain '{KEY_SEPARATOR}': {value}"
        )));
    }
    Ok(())
}

/// Generate a collision-resistant checkpoint id (time-ordered UUIDv7)
pub fn generate_checkpoint_id() -> String {
    Uuid::now_v7().to_string()
}

/// Lightweight projection of a checkpoint for listing and eviction
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub id: String,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub current_node: String,
    #[serde(rename = "type")]
    pub checkpoint_type: CheckpointType,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Size of the stored (possibly compressed) record in bytes
    pub size: u64,
}

impl CheckpointInfo {
    pub fn from_checkpoint(checkpoint: &Checkpoint, size: u64) -> Self {
        Self {
            id: checkpoint.id.clone(),
            workflow_id: checkpoint.workflow_id.clone(),
            timestamp: checkpoint.created_at(),
            current_node: checkpoint.current_node.clone(),
            checkpoint_type: checkpoint.checkpoint_type,
            metadata: checkpoint.metadata.clone(),
            size,
        }
    }

    pub fn key(&self) -> String {
        checkpoint_key(&self.workflow_id, &self.id)
    }
}

/// Record mapping a workflow to its most recent checkpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LatestPointer {
    pub checkpoint_id: String,
    /// RFC 3339 on the wire
    pub timestamp: DateTime<Utc>,
}

/// `checkpoint:<workflow_id>:<checkpoint_id>`
pub fn checkpoint_key(workflow_id: &str, checkpoint_id: &str) -> String {
    format!("{CHECKPOINT_KEY_PREFIX}{KEY_SEPARATOR}{workflow_id}{KEY_SEPARATOR}{checkpoint_id}")
}

/// Prefix shared by every checkpoint of one workflow
pub fn workflow_checkpoint_prefix(workflow_id: &str) -> String {
    format!("{CHECKPOINT_KEY_PREFIX}{KEY_SEPARATOR}{workflow_id}{KEY_SEPARATOR}")
}

/// Prefix shared by every checkpoint in the store
pub fn all_checkpoints_prefix() -> String {
    format!("{CHECKPOINT_KEY_PREFIX}{KEY_SEPARATOR}")
}

/// `workflow:<workflow_id>:latest`
pub fn latest_pointer_key(workflow_id: &str) -> String {
    format!("{WORKFLOW_KEY_PREFIX}{KEY_SEPARATOR}{workflow_id}{KEY_SEPARATOR}latest")
}

/// Split a checkpoint key into `(workflow_id, checkpoint_id)`
pub fn parse_checkpoint_key(key: &str) -> Option<(&str, &str)> {
    let rest = key
        .strip_prefix(CHECKPOINT_KEY_PREFIX)?
        .strip_prefix(KEY_SEPARATOR)?;
    let (workflow_id, checkpoint_id) = rest.split_once(KEY_SEPARATOR)?;
    if workflow_id.is_empty() || checkpoint_id.is_empty() {
        return None;
    }
    Some((workflow_id, checkpoint_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_leaves_identity_unset() {
        let checkpoint = Checkpoint::new("w1", "start", json!({"a": 1}));
        assert!(checkpoint.id.is_empty());
        assert!(checkpoint.timestamp.is_none());
        assert_eq!(checkpoint.version, 0);
        assert_eq!(checkpoint.checkpoint_type, CheckpointType::Auto);
    }

    #[test]
    fn test_assign_defaults() {
        let mut checkpoint = Checkpoint::new("w1", "start", json!({}));
        checkpoint.assign_defaults();
        assert!(!checkpoint.id.is_empty());
        assert!(checkpoint.timestamp.is_some());
        assert_eq!(checkpoint.version, CHECKPOINT_FORMAT_VERSION);

        let current_time = Utc::now();
        let time_diff = (current_time - checkpoint.created_at()).num_seconds().abs();
        assert!(time_diff <= 5);
    }

    #[test]
    fn test_assign_defaults_preserves_explicit_values() {
        let ts = Utc::now() - chrono::Duration::hours(3);
        let mut checkpoint = Checkpoint::new("w1", "start", json!({}))
            .with_id("fixed")
            .with_timestamp(ts);
        checkpoint.version = 4;
        checkpoint.assign_defaults();
        assert_eq!(checkpoint.id, "fixed");
        assert_eq!(checkpoint.timestamp, Some(ts));
        assert_eq!(checkpoint.version, 4);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| generate_checkpoint_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_validation() {
        let mut checkpoint = Checkpoint::new("w1", "n", json!({"k": "v"}));
        checkpoint.assign_defaults();
        assert!(checkpoint.validate().is_ok());

        let mut bad = checkpoint.clone();
        bad.workflow_id.clear();
        assert!(bad.validate().is_err());

        let mut bad = checkpoint.clone();
        bad.workflow_id = "a:b".into();
        assert!(bad.validate().is_err());

        let mut bad = checkpoint.clone();
        bad.context = serde_json::Value::Null;
        assert!(bad.validate().is_err());

        let mut bad = checkpoint;
        bad.version = 0;
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_typed_context_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct PlanState {
            step: u32,
            notes: Vec<String>,
        }

        let state = PlanState {
            step: 3,
            notes: vec!["draft".into()],
        };
        let checkpoint = Checkpoint::with_context("w1", "plan", &state).unwrap();
        let restored: PlanState = checkpoint.context_as().unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_serialization_field_names() {
        let checkpoint = Checkpoint::new("w1", "n", json!(1))
            .with_type(CheckpointType::BeforeStep)
            .with_metadata("attempt", json!(2));
        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["type"], "before_step");
        assert_eq!(value["workflow_id"], "w1");
        assert_eq!(value["metadata"]["attempt"], 2);
    }

    #[test]
    fn test_missing_version_deserializes_as_zero() {
        let raw = r#"{"id":"x","workflow_id":"w1","context":{"a":1}}"#;
        let checkpoint: Checkpoint = serde_json::from_str(raw).unwrap();
        assert_eq!(checkpoint.version, 0);
        assert_eq!(checkpoint.checkpoint_type, CheckpointType::Auto);
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(checkpoint_key("w1", "abc"), "checkpoint:w1:abc");
        assert_eq!(latest_pointer_key("w1"), "workflow:w1:latest");
        assert_eq!(workflow_checkpoint_prefix("w1"), "checkpoint:w1:");
        assert_eq!(all_checkpoints_prefix(), "checkpoint:");
    }

    #[test]
    fn test_parse_checkpoint_key() {
        assert_eq!(parse_checkpoint_key("checkpoint:w1:abc"), Some(("w1", "abc")));
        assert_eq!(parse_checkpoint_key("workflow:w1:latest"), None);
        assert_eq!(parse_checkpoint_key("checkpoint:w1"), None);
        assert_eq!(parse_checkpoint_key("checkpoint::abc"), None);
    }

    #[test]
    fn test_latest_pointer_wire_format() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let pointer = LatestPointer {
            checkpoint_id: "abc".into(),
            timestamp: ts,
        };
        let json = serde_json::to_string(&pointer).unwrap();
        assert_eq!(json, r#"{"checkpoint_id":"abc","timestamp":"2024-05-01T10:00:00Z"}"#);
    }
}
