//! Configuration for Zoidberg.
//!
//! Massages the yaml config into the routing model the engine runs on.
//! The source file's top level is an ordered sequence of single-key
//! mappings, e.g.:
//!
//! ```yaml
//! - gerrits:
//!   - master:
//!       host: review.example.com
//!       username: zoidberg
//!       project-pattern: ".*"
//!       key_filename: /etc/zoidberg/id_rsa
//!       startup:
//!         - "version"
//!       events:
//!         - type: comment-added
//!           action: log
//!           target: thirdparty
//!           branch-pattern: "^master$"
//!   - thirdparty:
//!       host: review-3p.example.com
//!       username: zoidberg
//!       project-pattern: "^tools/.*"
//! - plugins:
//!   - sync-branches
//! ```
//!
//! A [`Configuration`] is a snapshot: built in one pass, never mutated
//! afterwards except for the per-endpoint runtime fields (`client`,
//! `started`) the engine owns. Reloading builds an entirely new snapshot.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::actions::{Action, ActionRegistry};
use crate::client::{ClientFactory, StreamClient};
use crate::DEFAULT_GERRIT_PORT;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config root must be a sequence of single-key mappings")]
    RootShape,

    #[error("section '{0}' must be a sequence")]
    SectionShape(String),

    #[error("endpoint entry must be a single-key mapping with a string name")]
    EndpointShape,

    #[error("endpoint '{endpoint}' is invalid: {source}")]
    InvalidEndpoint {
        endpoint: String,
        source: serde_yaml::Error,
    },

    #[error("endpoint '{endpoint}' is missing required field '{field}'")]
    MissingField {
        endpoint: String,
        field: &'static str,
    },

    #[error("endpoint '{endpoint}' has invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        endpoint: String,
        pattern: String,
        source: regex::Error,
    },

    #[error("endpoint '{endpoint}' references unknown action '{action}'")]
    UnknownAction { endpoint: String, action: String },
}

/// One routing rule binding: run `action` against the endpoint named
/// `target_name` when the owning event type matches.
pub struct ActionBinding {
    /// Action id as written in the config (kept for logging)
    pub action_id: String,

    /// Resolved action implementation
    pub action: Arc<dyn Action>,

    /// Endpoint the action acts upon; may differ from the source endpoint
    pub target_name: String,

    /// When present, the binding only applies to branches matching this
    /// pattern; when absent, all branches match
    pub branch_pattern: Option<Regex>,
}

impl ActionBinding {
    /// Whether this binding applies to the given branch.
    pub fn matches_branch(&self, branch: &str) -> bool {
        match &self.branch_pattern {
            Some(pattern) => pattern.is_match(branch),
            None => true,
        }
    }
}

impl std::fmt::Debug for ActionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBinding")
            .field("action_id", &self.action_id)
            .field("target_name", &self.target_name)
            .field(
                "branch_pattern",
                &self.branch_pattern.as_ref().map(Regex::as_str),
            )
            .finish()
    }
}

/// One configured review host plus its routing rules and runtime state.
pub struct EndpointRecord {
    /// Unique name, identity for lookup and logging
    pub name: String,

    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_filename: Option<PathBuf>,

    /// Projects this endpoint cares about; actions consult it when acting
    /// against the endpoint
    pub project_pattern: Regex,

    /// Server commands run once, in order, after the connection activates
    pub startup_tasks: Vec<String>,

    /// Event type -> ordered bindings, preserving file order within a type
    pub event_rules: HashMap<String, Vec<ActionBinding>>,

    /// Stream client for this endpoint. Absent for a disabled endpoint;
    /// always check presence before use.
    pub client: Option<Box<dyn StreamClient>>,

    /// Whether startup sequencing completed for the current connection.
    /// Reset on every reload since a fresh client is created.
    pub started: bool,
}

impl std::fmt::Debug for EndpointRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRecord")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("project_pattern", &self.project_pattern.as_str())
            .field("startup_tasks", &self.startup_tasks)
            .field("event_rules", &self.event_rules)
            .field("has_client", &self.client.is_some())
            .field("started", &self.started)
            .finish()
    }
}

/// Raw endpoint body as written in the file.
#[derive(Debug, Deserialize)]
struct RawEndpoint {
    host: String,
    username: String,

    #[serde(rename = "project-pattern")]
    project_pattern: Option<String>,

    key_filename: Option<PathBuf>,

    #[serde(default)]
    startup: Vec<String>,

    #[serde(default = "default_port")]
    port: u16,

    #[serde(default)]
    events: Vec<RawEventRule>,
}

#[derive(Debug, Deserialize)]
struct RawEventRule {
    #[serde(rename = "type")]
    event_type: String,

    action: String,
    target: String,

    #[serde(rename = "branch-pattern")]
    branch_pattern: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_GERRIT_PORT
}

/// The complete routing configuration in effect at a point in time.
pub struct Configuration {
    /// Endpoints in declaration order
    pub endpoints: Vec<EndpointRecord>,

    /// Ordered plugin identifiers
    pub plugins: Vec<String>,
}

impl Configuration {
    /// Load and build a configuration from a file path.
    pub fn from_file(
        path: &Path,
        registry: &ActionRegistry,
        factory: &dyn ClientFactory,
    ) -> Result<Self, ConfigError> {
        let raw = load_raw(path)?;
        Self::from_raw(&raw, registry, factory)
    }

    /// Build a configuration from the raw parsed structure.
    ///
    /// Compiles every pattern, resolves every action id, and constructs one
    /// unconnected client per endpoint. No network I/O happens here;
    /// connections are deferred to the engine's startup sequencing.
    pub fn from_raw(
        raw: &[Value],
        registry: &ActionRegistry,
        factory: &dyn ClientFactory,
    ) -> Result<Self, ConfigError> {
        let mut endpoints = Vec::new();

        if let Some(entries) = section(raw, "gerrits") {
            let entries = entries
                .as_sequence()
                .ok_or_else(|| ConfigError::SectionShape("gerrits".to_string()))?;

            for entry in entries {
                let mapping = entry.as_mapping().ok_or(ConfigError::EndpointShape)?;
                let (key, body) = mapping.iter().next().ok_or(ConfigError::EndpointShape)?;
                let name = key
                    .as_str()
                    .ok_or(ConfigError::EndpointShape)?
                    .to_string();

                let mut endpoint = build_endpoint(name, body, registry)?;
                // The only place a client is constructed; it holds no
                // connection until the engine activates it.
                endpoint.client = Some(factory.create(&endpoint));
                endpoints.push(endpoint);
            }
        }

        let plugins: Vec<String> = match section(raw, "plugins") {
            Some(value) => serde_yaml::from_value(value.clone())?,
            None => Vec::new(),
        };

        info!(
            endpoints = endpoints.len(),
            plugins = ?plugins,
            "Configuration built"
        );

        Ok(Self { endpoints, plugins })
    }

    /// Look up an endpoint by name.
    pub fn endpoint(&self, name: &str) -> Option<&EndpointRecord> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Look up an endpoint's position by name.
    pub fn endpoint_index(&self, name: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.name == name)
    }

    /// Close the client connections for all endpoints in this snapshot.
    pub async fn close_clients(&mut self) {
        for endpoint in &mut self.endpoints {
            if let Some(client) = endpoint.client.as_mut() {
                info!(endpoint = %endpoint.name, "Shutting down client");
                client.stop_event_stream().await;
            }
        }
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("endpoints", &self.endpoints)
            .field("plugins", &self.plugins)
            .finish()
    }
}

/// Read a config file into its raw top-level sequence.
pub fn load_raw(path: &Path) -> Result<Vec<Value>, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let root: Value = serde_yaml::from_str(&contents)?;
    match root {
        Value::Sequence(items) => Ok(items),
        _ => Err(ConfigError::RootShape),
    }
}

/// Find a section in the raw top-level sequence.
///
/// The source schema nests each section under its own single-key mapping;
/// the first item whose key equals `name` wins. This lookup shape is a
/// compatibility requirement of the file format.
pub fn section<'a>(raw: &'a [Value], name: &str) -> Option<&'a Value> {
    raw.iter().find_map(|item| {
        let mapping = item.as_mapping()?;
        let (key, value) = mapping.iter().next()?;
        (key.as_str() == Some(name)).then_some(value)
    })
}

fn build_endpoint(
    name: String,
    body: &Value,
    registry: &ActionRegistry,
) -> Result<EndpointRecord, ConfigError> {
    let raw: RawEndpoint =
        serde_yaml::from_value(body.clone()).map_err(|source| ConfigError::InvalidEndpoint {
            endpoint: name.clone(),
            source,
        })?;

    let pattern = raw
        .project_pattern
        .ok_or_else(|| ConfigError::MissingField {
            endpoint: name.clone(),
            field: "project-pattern",
        })?;
    let project_pattern =
        Regex::new(&pattern).map_err(|source| ConfigError::InvalidPattern {
            endpoint: name.clone(),
            pattern: pattern.clone(),
            source,
        })?;

    // Group rules by event type, preserving file order within each type.
    let mut event_rules: HashMap<String, Vec<ActionBinding>> = HashMap::new();
    for rule in raw.events {
        let action = registry
            .get(&rule.action)
            .ok_or_else(|| ConfigError::UnknownAction {
                endpoint: name.clone(),
                action: rule.action.clone(),
            })?;

        let branch_pattern = match rule.branch_pattern {
            Some(pattern) => Some(Regex::new(&pattern).map_err(|source| {
                ConfigError::InvalidPattern {
                    endpoint: name.clone(),
                    pattern,
                    source,
                }
            })?),
            None => None,
        };

        debug!(
            endpoint = %name,
            event_type = %rule.event_type,
            action = %rule.action,
            target = %rule.target,
            "Registering event rule"
        );

        event_rules
            .entry(rule.event_type)
            .or_default()
            .push(ActionBinding {
                action_id: rule.action,
                action,
                target_name: rule.target,
                branch_pattern,
            });
    }

    Ok(EndpointRecord {
        name,
        host: raw.host,
        port: raw.port,
        username: raw.username,
        key_filename: raw.key_filename,
        project_pattern,
        startup_tasks: raw.startup,
        event_rules,
        client: None,
        started: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::NullClientFactory;

    fn sample_yaml() -> &'static str {
        r#"
- gerrits:
  - master:
      host: review.example.com
      username: zoidberg
      project-pattern: "^tools/.*"
      key_filename: /etc/zoidberg/id_rsa
      startup:
        - "version"
        - "ls-projects"
      events:
        - type: comment-added
          action: log
          target: thirdparty
          branch-pattern: "^master$"
        - type: comment-added
          action: log
          target: master
        - type: patchset-created
          action: log
          target: thirdparty
  - thirdparty:
      host: review-3p.example.com
      username: relay
      project-pattern: ".*"
- plugins:
  - sync-branches
"#
    }

    fn parse(yaml: &str) -> Vec<Value> {
        match serde_yaml::from_str::<Value>(yaml).unwrap() {
            Value::Sequence(items) => items,
            _ => panic!("expected sequence root"),
        }
    }

    fn build(yaml: &str) -> Result<Configuration, ConfigError> {
        let registry = ActionRegistry::with_builtins();
        Configuration::from_raw(&parse(yaml), &registry, &NullClientFactory)
    }

    #[test]
    fn section_returns_first_matching_key() {
        let raw = parse(sample_yaml());
        assert!(section(&raw, "gerrits").is_some());
        assert!(section(&raw, "plugins").is_some());
        assert!(section(&raw, "nonexistent").is_none());
    }

    #[test]
    fn builds_endpoints_in_declaration_order() {
        let config = build(sample_yaml()).unwrap();
        let names: Vec<&str> = config.endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["master", "thirdparty"]);
        assert_eq!(config.plugins, vec!["sync-branches"]);
    }

    #[test]
    fn round_trips_endpoint_fields() {
        let config = build(sample_yaml()).unwrap();
        let master = config.endpoint("master").unwrap();

        assert_eq!(master.host, "review.example.com");
        assert_eq!(master.username, "zoidberg");
        assert_eq!(master.port, DEFAULT_GERRIT_PORT);
        assert_eq!(
            master.key_filename.as_deref(),
            Some(Path::new("/etc/zoidberg/id_rsa"))
        );
        assert_eq!(master.startup_tasks, vec!["version", "ls-projects"]);

        // Patterns compare by matching behavior
        assert!(master.project_pattern.is_match("tools/ci"));
        assert!(!master.project_pattern.is_match("other/repo"));

        assert!(master.client.is_some());
        assert!(!master.started);
    }

    #[test]
    fn groups_rules_by_type_preserving_order() {
        let config = build(sample_yaml()).unwrap();
        let master = config.endpoint("master").unwrap();

        let comment_rules = &master.event_rules["comment-added"];
        assert_eq!(comment_rules.len(), 2);
        assert_eq!(comment_rules[0].target_name, "thirdparty");
        assert_eq!(comment_rules[1].target_name, "master");

        assert!(comment_rules[0].matches_branch("master"));
        assert!(!comment_rules[0].matches_branch("stable/1.0"));
        // No branch pattern matches every branch
        assert!(comment_rules[1].matches_branch("anything"));

        assert_eq!(master.event_rules["patchset-created"].len(), 1);
    }

    #[test]
    fn missing_project_pattern_is_an_error() {
        let yaml = r#"
- gerrits:
  - broken:
      host: review.example.com
      username: zoidberg
"#;
        match build(yaml) {
            Err(ConfigError::MissingField { endpoint, field }) => {
                assert_eq!(endpoint, "broken");
                assert_eq!(field, "project-pattern");
            }
            other => panic!("expected MissingField, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn invalid_project_pattern_is_an_error() {
        let yaml = r#"
- gerrits:
  - broken:
      host: review.example.com
      username: zoidberg
      project-pattern: "("
"#;
        assert!(matches!(
            build(yaml),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn unknown_action_is_an_error() {
        let yaml = r#"
- gerrits:
  - master:
      host: review.example.com
      username: zoidberg
      project-pattern: ".*"
      events:
        - type: comment-added
          action: no-such-action
          target: master
"#;
        match build(yaml) {
            Err(ConfigError::UnknownAction { action, .. }) => {
                assert_eq!(action, "no-such-action");
            }
            other => panic!("expected UnknownAction, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let config = build("- unrelated: []").unwrap();
        assert!(config.endpoints.is_empty());
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn non_sequence_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zoidberg.yaml");
        fs::write(&path, "gerrits: {}").unwrap();
        assert!(matches!(load_raw(&path), Err(ConfigError::RootShape)));
    }

    #[test]
    fn explicit_port_overrides_default() {
        let yaml = r#"
- gerrits:
  - custom:
      host: review.example.com
      username: zoidberg
      project-pattern: ".*"
      port: 2222
"#;
        let config = build(yaml).unwrap();
        assert_eq!(config.endpoint("custom").unwrap().port, 2222);
    }
}
