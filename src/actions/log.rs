//! Log Action - Structured logging of matched events.
//!
//! The [`LogAction`] records every event it receives using the `tracing`
//! crate. Bind it to an event type to audit what a rule would see before
//! wiring up a heavier action.

use async_trait::async_trait;
use tracing::info;

use super::{Action, ActionError, ActionOutcome};
use crate::config::EndpointRecord;
use crate::event::EventRecord;

/// An action that logs matched events.
///
/// Useful for:
/// - Auditing event flow between endpoints
/// - Debugging routing rules
/// - Development/testing
#[derive(Debug, Clone)]
pub struct LogAction {
    /// Optional prefix for log messages
    prefix: String,
}

impl LogAction {
    /// Create a LogAction with the default prefix
    pub fn new() -> Self {
        Self {
            prefix: "event".to_string(),
        }
    }

    /// Create a LogAction with a custom prefix, useful for distinguishing
    /// several log bindings (e.g. "audit", "debug")
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Action for LogAction {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(
        &self,
        event: &EventRecord,
        source: &EndpointRecord,
        target: &EndpointRecord,
    ) -> Result<ActionOutcome, ActionError> {
        info!(
            prefix = %self.prefix,
            event_type = %event.event_type,
            project = %event.project,
            branch = %event.branch,
            source = %source.name,
            target = %target.name,
            "[{}] {} from {} for {}",
            self.prefix,
            event.event_type,
            source.name,
            target.name
        );

        Ok(ActionOutcome::success(
            self.name(),
            format!(
                "Logged {} from {} for {}",
                event.event_type, source.name, target.name
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_endpoint;
    use serde_json::json;

    #[tokio::test]
    async fn log_action_reports_endpoints() {
        let action = LogAction::new();
        let source = test_endpoint("master");
        let target = test_endpoint("thirdparty");
        let event = EventRecord::new("comment-added", json!({"comment": "hi"}))
            .with_project("tools/ci")
            .with_branch("master");

        let outcome = action.execute(&event, &source, &target).await.unwrap();
        assert_eq!(outcome.action_id, "log");
        assert!(outcome.message.contains("comment-added"));
        assert!(outcome.message.contains("master"));
        assert!(outcome.message.contains("thirdparty"));
    }

    #[tokio::test]
    async fn log_action_with_prefix() {
        let action = LogAction::with_prefix("audit");
        let source = test_endpoint("master");
        let target = test_endpoint("master");
        let event = EventRecord::new("patchset-created", json!({}));

        let outcome = action.execute(&event, &source, &target).await.unwrap();
        assert!(outcome.message.contains("patchset-created"));
    }
}
