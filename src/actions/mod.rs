//! Action system for Zoidberg.
//!
//! Actions are the units of work executed when an event matches a routing
//! rule. Each rule names an action by id; the id is resolved against the
//! [`ActionRegistry`] when configuration is built, so a rule referencing an
//! unregistered action fails at load time rather than at dispatch time.
//!
//! ## Built-in Actions
//!
//! - [`LogAction`]: Structured logging of matched events (audit/debug)
//!
//! Business actions (mirroring comments, voting, triggering builds) are
//! supplied by the embedding process: register them before loading
//! configuration.
//!
//! ## Creating Custom Actions
//!
//! ```rust,ignore
//! use zoidberg::actions::{Action, ActionError, ActionOutcome};
//! use zoidberg::config::EndpointRecord;
//! use zoidberg::event::EventRecord;
//! use async_trait::async_trait;
//!
//! struct VoteAction;
//!
//! #[async_trait]
//! impl Action for VoteAction {
//!     fn name(&self) -> &str {
//!         "vote"
//!     }
//!
//!     async fn execute(
//!         &self,
//!         event: &EventRecord,
//!         source: &EndpointRecord,
//!         target: &EndpointRecord,
//!     ) -> Result<ActionOutcome, ActionError> {
//!         // Apply the vote against `target` here
//!         Ok(ActionOutcome::success("vote", "Vote applied"))
//!     }
//! }
//! ```

pub mod log;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::client::ClientError;
use crate::config::EndpointRecord;
use crate::event::EventRecord;

pub use log::LogAction;

/// Errors that can occur during action execution.
#[derive(Error, Debug)]
pub enum ActionError {
    /// The action timed out
    #[error("action timed out after {0}ms")]
    Timeout(u64),

    /// A client operation against the target host failed
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic action failure
    #[error("action failed: {0}")]
    Failed(String),
}

/// Result of a successful action execution.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// Id of the action that produced this outcome
    pub action_id: String,

    /// Human-readable description of what happened
    pub message: String,
}

impl ActionOutcome {
    /// Create a success outcome with a message
    pub fn success(action_id: &str, message: impl Into<String>) -> Self {
        Self {
            action_id: action_id.to_string(),
            message: message.into(),
        }
    }
}

/// The core Action trait.
///
/// An action receives the matched event together with the endpoint the
/// event came from and the endpoint the rule targets. Actions must be
/// `Send + Sync`; they are shared behind `Arc` across dispatches.
#[async_trait(?Send)]
pub trait Action: Send + Sync {
    /// Unique id of this action (e.g. "log", "propagate-comment")
    fn name(&self) -> &str;

    /// Execute the action for the given event.
    async fn execute(
        &self,
        event: &EventRecord,
        source: &EndpointRecord,
        target: &EndpointRecord,
    ) -> Result<ActionOutcome, ActionError>;
}

/// Registry mapping action ids to implementations.
///
/// Configuration building resolves every rule's action id through this
/// registry; an id with no registered implementation is a configuration
/// error.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Create a registry with the built-in actions registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LogAction::new()));
        registry
    }

    /// Register an action under its own name
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    /// Look up an action by id
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// List all registered action ids
    pub fn list(&self) -> Vec<&str> {
        self.actions.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestAction;

    #[async_trait(?Send)]
    impl Action for TestAction {
        fn name(&self) -> &str {
            "test"
        }

        async fn execute(
            &self,
            _event: &EventRecord,
            _source: &EndpointRecord,
            _target: &EndpointRecord,
        ) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::success("test", "Test executed"))
        }
    }

    #[test]
    fn registry_lookup() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(TestAction));

        assert!(registry.get("test").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.list(), vec!["test"]);
    }

    #[test]
    fn builtins_include_log() {
        let registry = ActionRegistry::with_builtins();
        assert!(registry.get("log").is_some());
    }

    #[test]
    fn outcome_carries_message() {
        let outcome = ActionOutcome::success("test", "Done");
        assert_eq!(outcome.action_id, "test");
        assert_eq!(outcome.message, "Done");
    }
}
