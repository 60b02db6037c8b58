//! Event-stream clients.
//!
//! A [`StreamClient`] owns one connection to a review host: it can be
//! activated, polled for the next event with a bounded wait, asked to run a
//! one-shot server command, and torn down. Clients are constructed
//! unconnected by the configuration builder; the engine activates them
//! during startup sequencing.
//!
//! [`SshStreamClient`] is the production implementation. It spawns
//! `ssh ... gerrit stream-events` as a child process and parses each stdout
//! line as one JSON event.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use crate::config::EndpointRecord;
use crate::event::EventRecord;

/// Errors from stream-client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A one-shot server command exited unsuccessfully.
    #[error("command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// The event stream ended (connection dropped by the remote side).
    #[error("event stream closed")]
    StreamClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connection to one review host's event stream.
///
/// `stop_event_stream` is idempotent and safe to call on a client that was
/// never activated.
#[async_trait]
pub trait StreamClient: Send {
    /// Open the connection and begin streaming events.
    async fn activate(&mut self) -> Result<(), ClientError>;

    /// Wait up to `wait` for the next event.
    ///
    /// Returns `Ok(None)` when no event arrived within the wait window.
    async fn next_event(&mut self, wait: Duration) -> Result<Option<EventRecord>, ClientError>;

    /// Run a one-shot server command over the same credentials.
    async fn run_command(&mut self, command: &str) -> Result<(), ClientError>;

    /// Tear down the connection.
    async fn stop_event_stream(&mut self);

    /// Whether the client currently holds an active connection.
    fn is_active(&self) -> bool;
}

/// Builds a client for an endpoint.
///
/// The configuration builder calls this once per endpoint so that tests can
/// substitute scripted clients for the ssh implementation.
pub trait ClientFactory: Send + Sync {
    fn create(&self, endpoint: &EndpointRecord) -> Box<dyn StreamClient>;
}

/// Stream client backed by an `ssh ... gerrit stream-events` child process.
pub struct SshStreamClient {
    host: String,
    port: u16,
    username: String,
    key_filename: Option<PathBuf>,
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

impl SshStreamClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        key_filename: Option<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            key_filename,
            child: None,
            lines: None,
        }
    }

    /// Base ssh invocation with credentials and batch-mode options.
    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p").arg(self.port.to_string());
        if let Some(key) = &self.key_filename {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg(format!("{}@{}", self.username, self.host));
        cmd
    }
}

#[async_trait]
impl StreamClient for SshStreamClient {
    async fn activate(&mut self) -> Result<(), ClientError> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut child = self
            .ssh_command()
            .arg("gerrit")
            .arg("stream-events")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::Connection(format!("{}: {}", self.host, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Connection("no stdout from ssh".to_string()))?;

        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);

        debug!(host = %self.host, port = self.port, "Event stream activated");
        Ok(())
    }

    async fn next_event(&mut self, wait: Duration) -> Result<Option<EventRecord>, ClientError> {
        let Some(lines) = self.lines.as_mut() else {
            // Not connected; nothing to poll.
            return Ok(None);
        };

        let line = match tokio::time::timeout(wait, lines.next_line()).await {
            Err(_elapsed) => return Ok(None),
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Ok(Ok(None)) => {
                // EOF: the remote side closed the stream.
                self.stop_event_stream().await;
                return Err(ClientError::StreamClosed);
            }
            Ok(Ok(Some(line))) => line,
        };

        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(value) => match EventRecord::from_json(value) {
                Some(event) => Ok(Some(event)),
                None => {
                    debug!(host = %self.host, "Skipping event without a type field");
                    Ok(None)
                }
            },
            Err(e) => {
                warn!(host = %self.host, error = %e, "Skipping unparseable stream line");
                Ok(None)
            }
        }
    }

    async fn run_command(&mut self, command: &str) -> Result<(), ClientError> {
        let output = self
            .ssh_command()
            .arg("gerrit")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            debug!(host = %self.host, command = %command, "Command completed");
            Ok(())
        } else {
            Err(ClientError::CommandFailed {
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    async fn stop_event_stream(&mut self) {
        self.lines = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(host = %self.host, error = %e, "Failed to kill stream process");
            }
        }
    }

    fn is_active(&self) -> bool {
        self.child.is_some()
    }
}

/// Factory producing [`SshStreamClient`]s from endpoint settings.
#[derive(Debug, Default, Clone)]
pub struct SshClientFactory;

impl ClientFactory for SshClientFactory {
    fn create(&self, endpoint: &EndpointRecord) -> Box<dyn StreamClient> {
        Box::new(SshStreamClient::new(
            endpoint.host.clone(),
            endpoint.port,
            endpoint.username.clone(),
            endpoint.key_filename.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_is_safe_on_unconnected_client() {
        let mut client = SshStreamClient::new("gerrit.example.com", 29418, "zoidberg", None);
        assert!(!client.is_active());

        client.stop_event_stream().await;
        client.stop_event_stream().await;
        assert!(!client.is_active());
    }

    #[tokio::test]
    async fn next_event_on_unconnected_client_yields_nothing() {
        let mut client = SshStreamClient::new("gerrit.example.com", 29418, "zoidberg", None);
        let event = client
            .next_event(Duration::from_millis(10))
            .await
            .expect("poll should not error when unconnected");
        assert!(event.is_none());
    }
}
