//! Scripted driver.
//!
//! A [`Scenario`] is a JSON list of timed steps. [`ScenarioDriver`] plays it into an
//! [`EvpMock`] from a tokio task, standing in for the cloud side of a device while
//! the guest polls on its own thread.

use crate::evp::{EvpEvent, EvpMock, RpcId};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// An injectable event as written in a scenario file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ScenarioEvent {
    /// Configuration update for the configuration callback
    Configuration {
        /// Topic
        topic: String,
        /// UTF-8 payload
        payload: String,
    },
    /// Incoming message for the message callback
    Message {
        /// Topic
        topic: String,
        /// UTF-8 payload
        payload: String,
    },
    /// RPC request for the RPC callback
    Rpc {
        /// Request id
        id: RpcId,
        /// Method name
        method: String,
        /// JSON parameters as text
        #[serde(default)]
        params: String,
    },
    /// Ask the guest to exit
    Shutdown,
}

impl From<ScenarioEvent> for EvpEvent {
    fn from(event: ScenarioEvent) -> Self {
        match event {
            ScenarioEvent::Configuration { topic, payload } => EvpEvent::ConfigurationPushed {
                topic,
                payload: payload.into_bytes(),
            },
            ScenarioEvent::Message { topic, payload } => EvpEvent::MessageReceived {
                topic,
                payload: payload.into_bytes(),
            },
            ScenarioEvent::Rpc { id, method, params } => {
                EvpEvent::RpcRequestPushed { id, method, params }
            }
            ScenarioEvent::Shutdown => EvpEvent::ShutdownRequested,
        }
    }
}

/// One timed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStep {
    /// Delay before injecting, relative to the previous step
    #[serde(default)]
    pub delay_ms: u64,
    /// Event to inject
    pub event: ScenarioEvent,
}

/// A scripted sequence of cloud-side events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    /// Steps in order
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
    /// Inject a shutdown request after the last step
    #[serde(default)]
    pub shutdown_at_end: bool,
}

impl Scenario {
    /// Parse a scenario from JSON text
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("Malformed scenario JSON")
    }

    /// Load a scenario file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read scenario {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("In scenario {}", path.display()))
    }

    /// Append a step
    pub fn step(mut self, delay_ms: u64, event: ScenarioEvent) -> Self {
        self.steps.push(ScenarioStep { delay_ms, event });
        self
    }

    /// Request shutdown once every step has been injected
    pub fn then_shutdown(mut self) -> Self {
        self.shutdown_at_end = true;
        self
    }
}

/// A running scenario
pub struct ScenarioDriver {
    handle: JoinHandle<usize>,
}

impl ScenarioDriver {
    /// Start playing `scenario` into `target` on the current tokio runtime
    pub fn spawn(target: Arc<EvpMock>, scenario: Scenario) -> Self {
        let session = target.session_id();
        info!(session = %session, steps = scenario.steps.len(), "Starting scenario");

        let handle = tokio::spawn(async move {
            let mut injected = 0;
            for step in scenario.steps {
                if step.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
                }
                let event = EvpEvent::from(step.event);
                debug!(session = %session, event = event.name(), "Scenario step");
                target.inject(event);
                injected += 1;
            }
            if scenario.shutdown_at_end {
                target.request_shutdown();
                injected += 1;
            }
            info!(session = %session, injected, "Scenario finished");
            injected
        });

        Self { handle }
    }

    /// Abort the scenario; steps not yet injected are skipped
    pub fn stop(&self) {
        self.handle.abort();
    }

    /// Whether every step has been played or the task was stopped
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the scenario to finish; returns how many events were injected
    pub async fn wait(self) -> anyhow::Result<usize> {
        self.handle.await.context("Scenario task did not complete")
    }
}
