//! Test doubles shared across module tests: scripted stream clients,
//! a recording client factory, and a counting action.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::actions::{Action, ActionError, ActionOutcome};
use crate::client::{ClientError, ClientFactory, StreamClient};
use crate::config::EndpointRecord;
use crate::event::EventRecord;

/// A minimal endpoint record for tests that need one directly.
pub fn test_endpoint(name: &str) -> EndpointRecord {
    EndpointRecord {
        name: name.to_string(),
        host: format!("{name}.example.com"),
        port: crate::DEFAULT_GERRIT_PORT,
        username: "zoidberg".to_string(),
        key_filename: None,
        project_pattern: Regex::new(".*").unwrap(),
        startup_tasks: Vec::new(),
        event_rules: HashMap::new(),
        client: None,
        started: false,
    }
}

/// Call counters recorded by a [`ScriptedClient`].
#[derive(Debug, Default)]
pub struct ClientCalls {
    pub activations: AtomicUsize,
    pub polls: AtomicUsize,
    pub stops: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
    pub poll_waits: Mutex<Vec<Duration>>,
}

/// A stream client that yields a fixed script of events.
pub struct ScriptedClient {
    events: VecDeque<EventRecord>,
    fail_activations: u32,
    poll_errors: u32,
    active: bool,
    calls: Arc<ClientCalls>,
}

#[async_trait]
impl StreamClient for ScriptedClient {
    async fn activate(&mut self) -> Result<(), ClientError> {
        self.calls.activations.fetch_add(1, Ordering::SeqCst);
        if self.fail_activations > 0 {
            self.fail_activations -= 1;
            return Err(ClientError::Connection("scripted failure".to_string()));
        }
        self.active = true;
        Ok(())
    }

    async fn next_event(&mut self, wait: Duration) -> Result<Option<EventRecord>, ClientError> {
        self.calls.polls.fetch_add(1, Ordering::SeqCst);
        self.calls.poll_waits.lock().unwrap().push(wait);
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        if self.poll_errors > 0 {
            self.poll_errors -= 1;
            return Err(ClientError::StreamClosed);
        }
        Ok(None)
    }

    async fn run_command(&mut self, command: &str) -> Result<(), ClientError> {
        self.calls.commands.lock().unwrap().push(command.to_string());
        Ok(())
    }

    async fn stop_event_stream(&mut self) {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

#[derive(Default)]
struct ScriptSpec {
    events: VecDeque<EventRecord>,
    fail_activations: u32,
    poll_errors: u32,
}

#[derive(Default)]
struct FactoryInner {
    scripts: Mutex<HashMap<String, ScriptSpec>>,
    created: Mutex<Vec<(String, Arc<ClientCalls>)>>,
}

/// Factory producing [`ScriptedClient`]s and keeping their call counters
/// inspectable after the engine takes ownership of the clients.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    inner: Arc<FactoryInner>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events the next client created for `endpoint` will yield, in order.
    pub fn script(&self, endpoint: &str, events: Vec<EventRecord>) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .events
            .extend(events);
    }

    /// Make the next `n` activation attempts for `endpoint` fail.
    pub fn fail_activations(&self, endpoint: &str, n: u32) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .fail_activations = n;
    }

    /// Make `n` polls fail once `endpoint`'s scripted events run out.
    pub fn fail_polls(&self, endpoint: &str, n: u32) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .poll_errors = n;
    }

    /// Call counters for every client created for `endpoint`, oldest first.
    pub fn calls_for(&self, endpoint: &str) -> Vec<Arc<ClientCalls>> {
        self.inner
            .created
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == endpoint)
            .map(|(_, calls)| calls.clone())
            .collect()
    }

    /// How many clients have been created for `endpoint`.
    pub fn created_count(&self, endpoint: &str) -> usize {
        self.calls_for(endpoint).len()
    }
}

impl ClientFactory for ScriptedFactory {
    fn create(&self, endpoint: &EndpointRecord) -> Box<dyn StreamClient> {
        let spec = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .remove(&endpoint.name)
            .unwrap_or_default();
        let calls = Arc::new(ClientCalls::default());
        self.inner
            .created
            .lock()
            .unwrap()
            .push((endpoint.name.clone(), calls.clone()));
        Box::new(ScriptedClient {
            events: spec.events,
            fail_activations: spec.fail_activations,
            poll_errors: spec.poll_errors,
            active: false,
            calls,
        })
    }
}

/// Factory for tests that never poll: every client yields no events.
#[derive(Debug, Default, Clone)]
pub struct NullClientFactory;

impl ClientFactory for NullClientFactory {
    fn create(&self, _endpoint: &EndpointRecord) -> Box<dyn StreamClient> {
        Box::new(ScriptedClient {
            events: VecDeque::new(),
            fail_activations: 0,
            poll_errors: 0,
            active: false,
            calls: Arc::new(ClientCalls::default()),
        })
    }
}

/// One recorded action invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExecution {
    pub event_type: String,
    pub source: String,
    pub target: String,
}

/// An action that records every invocation and can be scripted to fail.
pub struct CountingAction {
    name: String,
    fail_remaining: AtomicU32,
    executions: Mutex<Vec<RecordedExecution>>,
}

impl CountingAction {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_remaining: AtomicU32::new(0),
            executions: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `n` invocations return an error.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Every invocation so far, including ones that returned an error.
    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.executions.lock().unwrap().clone()
    }
}

#[async_trait(?Send)]
impl Action for CountingAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        event: &EventRecord,
        source: &EndpointRecord,
        target: &EndpointRecord,
    ) -> Result<ActionOutcome, ActionError> {
        self.executions.lock().unwrap().push(RecordedExecution {
            event_type: event.event_type.clone(),
            source: source.name.clone(),
            target: target.name.clone(),
        });

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ActionError::Failed("scripted failure".to_string()));
        }

        Ok(ActionOutcome::success(&self.name, "counted"))
    }
}
