//! The Zoidberg process loop.
//!
//! [`Zoidberg`] multiplexes every configured endpoint's event stream on a
//! single control task. One iteration of the loop:
//!
//! 1. Startup sequencing: activate any endpoint whose connection is not up
//!    yet and run its startup tasks. Idempotent per endpoint; a failed
//!    activation is retried on the next iteration.
//! 2. Reload check: when the config file changed since the last load,
//!    rebuild the configuration. On success the old snapshot's clients are
//!    closed and the new snapshot becomes current; on any failure the
//!    previous snapshot stays fully operational. At most one load attempt
//!    per iteration.
//! 3. Per-endpoint pass, in declaration order: poll for one event with a
//!    bounded wait, dispatch it through the endpoint's rules if one
//!    arrived, then drain the endpoint's retry queue.
//!
//! Fairness comes from the bounded poll wait alone: no endpoint can hold
//! the control task longer than the poll timeout, so every endpoint gets a
//! turn each iteration. Nothing that happens inside one endpoint's
//! processing can terminate the loop; the only fatal error is an initial
//! configuration that cannot be loaded at all.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::actions::ActionRegistry;
use crate::client::ClientFactory;
use crate::config::{ConfigError, Configuration};
use crate::event::EventRecord;
use crate::retry::RetryQueue;

/// Default bounded wait for one event poll.
///
/// Short enough that no single endpoint can starve the others' turn within
/// an iteration.
const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;

/// The orchestration engine.
pub struct Zoidberg {
    config_path: PathBuf,

    /// The current configuration snapshot. Replaced wholesale on reload,
    /// never mutated in place apart from per-endpoint runtime state.
    config: Configuration,

    registry: ActionRegistry,
    factory: Box<dyn ClientFactory>,

    /// Failed-event queues keyed by endpoint name. Queues survive reloads
    /// for endpoints that stay configured; queues for removed endpoints
    /// are dropped.
    retry_queues: HashMap<String, RetryQueue>,

    /// Externally settable run flag, checked once per iteration.
    running: Arc<AtomicBool>,

    /// Content signature of the config file at the last load attempt.
    config_signature: Option<u64>,

    poll_timeout: Duration,
}

impl Zoidberg {
    /// Build an engine from a config file.
    ///
    /// This is the one place a configuration failure is fatal: the process
    /// cannot start without an initial snapshot. Later reload failures are
    /// logged and survived.
    pub fn new(
        config_path: impl Into<PathBuf>,
        registry: ActionRegistry,
        factory: Box<dyn ClientFactory>,
    ) -> Result<Self, ConfigError> {
        let config_path = config_path.into();
        let config = Configuration::from_file(&config_path, &registry, factory.as_ref())?;
        let config_signature = file_signature(&config_path);

        Ok(Self {
            config_path,
            config,
            registry,
            factory,
            retry_queues: HashMap::new(),
            running: Arc::new(AtomicBool::new(true)),
            config_signature,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        })
    }

    /// Override the bounded poll wait.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Handle to the run flag; clearing it stops the loop after the
    /// in-flight iteration.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Request a stop after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// The current configuration snapshot.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Run until the run flag is cleared, then close every client.
    pub async fn run(&mut self) {
        info!(
            endpoints = self.config.endpoints.len(),
            "Process loop starting"
        );

        while self.running.load(Ordering::SeqCst) {
            self.run_once().await;
        }

        info!("Process loop stopping; closing clients");
        self.config.close_clients().await;
    }

    /// One full iteration of the process loop.
    pub async fn run_once(&mut self) {
        self.process_startup_tasks().await;

        if self.config_file_has_changed() {
            self.reload_config().await;
        }

        for idx in 0..self.config.endpoints.len() {
            if let Some(event) = self.poll_endpoint(idx).await {
                self.process_event(event, idx).await;
            }
            self.drain_retry_queue(idx).await;
        }
    }

    /// Activate every endpoint that is not started yet and run its startup
    /// tasks. Already-started endpoints are untouched, so calling this once
    /// per iteration does not re-run startup.
    async fn process_startup_tasks(&mut self) {
        for endpoint in &mut self.config.endpoints {
            if endpoint.started {
                continue;
            }

            let Some(client) = endpoint.client.as_mut() else {
                trace!(endpoint = %endpoint.name, "No client; skipping startup");
                continue;
            };

            match client.activate().await {
                Ok(()) => {
                    for task in &endpoint.startup_tasks {
                        if let Err(e) = client.run_command(task).await {
                            warn!(
                                endpoint = %endpoint.name,
                                task = %task,
                                error = %e,
                                "Startup task failed"
                            );
                        }
                    }
                    endpoint.started = true;
                    info!(endpoint = %endpoint.name, "Endpoint started");
                }
                Err(e) => {
                    // Leave `started` false; the next iteration retries.
                    warn!(
                        endpoint = %endpoint.name,
                        error = %e,
                        "Connection failed, will retry"
                    );
                }
            }
        }
    }

    fn config_file_has_changed(&self) -> bool {
        file_signature(&self.config_path) != self.config_signature
    }

    /// Attempt to replace the current snapshot from the config file.
    ///
    /// The attempted signature is recorded up front so a broken file is not
    /// re-parsed every iteration until it changes again.
    async fn reload_config(&mut self) {
        info!(path = %self.config_path.display(), "Config file changed, reloading");
        self.config_signature = file_signature(&self.config_path);

        match Configuration::from_file(&self.config_path, &self.registry, self.factory.as_ref()) {
            Ok(new_config) => {
                self.config.close_clients().await;
                self.config = new_config;

                let names: HashSet<&str> = self
                    .config
                    .endpoints
                    .iter()
                    .map(|e| e.name.as_str())
                    .collect();
                self.retry_queues.retain(|name, _| names.contains(name.as_str()));

                info!(
                    endpoints = self.config.endpoints.len(),
                    "Configuration reloaded"
                );
            }
            Err(e) => {
                error!(error = %e, "Reload failed, keeping previous configuration");
            }
        }
    }

    /// Poll one endpoint for its next event with the bounded wait.
    async fn poll_endpoint(&mut self, idx: usize) -> Option<EventRecord> {
        let poll_timeout = self.poll_timeout;
        let endpoint = &mut self.config.endpoints[idx];

        let Some(client) = endpoint.client.as_mut() else {
            trace!(endpoint = %endpoint.name, "No client, skipping poll");
            return None;
        };

        match client.next_event(poll_timeout).await {
            Ok(event) => event,
            Err(e) => {
                // A dead stream is a connection problem, not a loop
                // problem: flag the endpoint for re-activation.
                warn!(
                    endpoint = %endpoint.name,
                    error = %e,
                    "Event poll failed, endpoint will reconnect"
                );
                endpoint.started = false;
                None
            }
        }
    }

    /// Dispatch a freshly polled event; queue it for retry when any of its
    /// bindings failed.
    async fn process_event(&mut self, event: EventRecord, source_idx: usize) {
        let failures = run_bindings(&self.config, &event, source_idx).await;
        if failures > 0 {
            let name = self.config.endpoints[source_idx].name.clone();
            self.retry_queues.entry(name).or_default().push(event);
        }
    }

    /// Re-attempt dispatch for every event queued against one endpoint.
    async fn drain_retry_queue(&mut self, idx: usize) {
        let name = self.config.endpoints[idx].name.clone();
        let pending = match self.retry_queues.get_mut(&name) {
            Some(queue) if !queue.is_empty() => queue.drain_pending(),
            _ => return,
        };

        debug!(endpoint = %name, pending = pending.len(), "Retrying failed events");

        for entry in pending {
            let failures = run_bindings(&self.config, &entry.event, idx).await;
            if failures > 0 {
                if let Some(queue) = self.retry_queues.get_mut(&name) {
                    queue.requeue(entry);
                }
            } else {
                debug!(
                    endpoint = %name,
                    event_type = %entry.event.event_type,
                    "Retry succeeded"
                );
            }
        }
    }
}

/// Run every binding matching the event against its source endpoint.
///
/// Returns the number of bindings that failed. A failing binding never
/// aborts the remaining bindings for the same event, and an event whose
/// type has no rule is dropped silently.
async fn run_bindings(config: &Configuration, event: &EventRecord, source_idx: usize) -> usize {
    let source = &config.endpoints[source_idx];

    let Some(bindings) = source.event_rules.get(&event.event_type) else {
        debug!(
            endpoint = %source.name,
            event_type = %event.event_type,
            "No rule for event type, dropping"
        );
        return 0;
    };

    let mut failures = 0;
    for binding in bindings {
        if !binding.matches_branch(&event.branch) {
            trace!(
                endpoint = %source.name,
                action = %binding.action_id,
                branch = %event.branch,
                "Branch does not match, skipping binding"
            );
            continue;
        }

        let Some(target) = config.endpoint(&binding.target_name) else {
            warn!(
                endpoint = %source.name,
                action = %binding.action_id,
                target = %binding.target_name,
                "Rule targets unknown endpoint, skipping binding"
            );
            continue;
        };

        match binding.action.execute(event, source, target).await {
            Ok(outcome) => {
                debug!(
                    action = %binding.action_id,
                    message = %outcome.message,
                    "Action executed"
                );
            }
            Err(e) => {
                warn!(
                    action = %binding.action_id,
                    endpoint = %source.name,
                    target = %binding.target_name,
                    error = %e,
                    "Action failed"
                );
                failures += 1;
            }
        }
    }

    failures
}

/// Content signature of the config file, or `None` when it is unreadable.
fn file_signature(path: &Path) -> Option<u64> {
    let bytes = fs::read(path).ok()?;
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    Some(hasher.finish())
}
