//! Core event type for Zoidberg.
//!
//! An [`EventRecord`] is one occurrence reported by a review host's event
//! stream, e.g. a comment being added or a new patchset being uploaded.
//! The event type is an open string so new server-side event types route
//! without code changes here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event reported by a review host.
///
/// # Fields
///
/// - `event_type`: Type used for rule matching (e.g. "comment-added",
///   "patchset-created")
/// - `project`, `branch`: Used by rule and pattern matching
/// - `payload`: The full event object as received; passed through to
///   actions unmodified
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    /// Event type used for routing
    #[serde(rename = "type")]
    pub event_type: String,

    /// Project the event applies to
    #[serde(default)]
    pub project: String,

    /// Branch the event applies to
    #[serde(default)]
    pub branch: String,

    /// Complete event body, opaque to the engine
    pub payload: Value,
}

impl EventRecord {
    /// Create a new event with empty project/branch fields.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            project: String::new(),
            branch: String::new(),
            payload,
        }
    }

    /// Set the project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    /// Set the branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Build an event from a raw stream-events JSON object.
    ///
    /// Returns `None` when the object carries no `type` field. The project
    /// and branch are lifted out of the nested `change` object when present
    /// (the shape Gerrit uses for change-related events), falling back to
    /// top-level fields, and finally to empty strings. The full object is
    /// retained as the payload.
    pub fn from_json(value: Value) -> Option<Self> {
        let event_type = value.get("type")?.as_str()?.to_string();

        let lookup = |field: &str| -> String {
            value
                .get("change")
                .and_then(|c| c.get(field))
                .or_else(|| value.get(field))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Some(Self {
            event_type,
            project: lookup("project"),
            branch: lookup("branch"),
            payload: value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_lifts_change_fields() {
        let raw = json!({
            "type": "comment-added",
            "change": {
                "project": "tools/ci",
                "branch": "master",
                "number": 42
            },
            "comment": "looks good"
        });

        let event = EventRecord::from_json(raw.clone()).unwrap();
        assert_eq!(event.event_type, "comment-added");
        assert_eq!(event.project, "tools/ci");
        assert_eq!(event.branch, "master");
        assert_eq!(event.payload, raw);
    }

    #[test]
    fn from_json_falls_back_to_top_level_fields() {
        let raw = json!({
            "type": "project-created",
            "project": "new-project"
        });

        let event = EventRecord::from_json(raw).unwrap();
        assert_eq!(event.project, "new-project");
        assert_eq!(event.branch, "");
    }

    #[test]
    fn from_json_without_type_is_rejected() {
        assert!(EventRecord::from_json(json!({"change": {}})).is_none());
        assert!(EventRecord::from_json(json!("not an object")).is_none());
    }

    #[test]
    fn builder_sets_fields() {
        let event = EventRecord::new("patchset-created", json!({}))
            .with_project("tools/ci")
            .with_branch("stable/1.0");

        assert_eq!(event.event_type, "patchset-created");
        assert_eq!(event.project, "tools/ci");
        assert_eq!(event.branch, "stable/1.0");
    }
}
