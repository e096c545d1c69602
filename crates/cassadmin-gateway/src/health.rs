//! Health monitoring of the nodetool path.
//!
//! A background task periodically runs `nodetool status` through the same
//! launcher the dispatcher uses, bypassing the admission gate. The result
//! feeds [`HealthTracker`], a two-state machine: Healthy turns Degraded after
//! `threshold` consecutive failures and recovers on the first success.

use crate::dispatcher::CallContext;
use crate::executor::CommandLauncher;
use crate::registry::{BoundCommand, CommandRegistry, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Snapshot of the monitor's view, served by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_checks: u64,
    pub total_failures: u64,
}

/// A status change produced by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthStatus,
    pub to: HealthStatus,
}

/// Pure health state machine.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
}

impl HealthTracker {
    /// Starts Healthy. A zero threshold is treated as one.
    pub fn new(threshold: u32) -> Self {
        Self {
            state: HealthState {
                status: HealthStatus::Healthy,
                consecutive_failures: 0,
                failure_threshold: threshold.max(1),
                last_check: None,
                last_success: None,
                last_error: None,
                total_checks: 0,
                total_failures: 0,
            },
        }
    }

    pub fn state(&self) -> &HealthState {
        &self.state
    }

    pub fn status(&self) -> HealthStatus {
        self.state.status
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) -> Option<Transition> {
        self.state.total_checks += 1;
        self.state.consecutive_failures = 0;
        self.state.last_check = Some(at);
        self.state.last_success = Some(at);
        self.state.last_error = None;
        self.set_status(HealthStatus::Healthy)
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, error: impl Into<String>) -> Option<Transition> {
        self.state.total_checks += 1;
        self.state.total_failures += 1;
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.last_check = Some(at);
        self.state.last_error = Some(error.into());
        if self.state.consecutive_failures >= self.state.failure_threshold {
            self.set_status(HealthStatus::Degraded)
        } else {
            None
        }
    }

    fn set_status(&mut self, to: HealthStatus) -> Option<Transition> {
        let from = self.state.status;
        if from == to {
            return None;
        }
        self.state.status = to;
        Some(Transition { from, to })
    }
}

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    launcher: Arc<dyn CommandLauncher>,
    probe: BoundCommand,
    config: HealthConfig,
    tracker: Arc<RwLock<HealthTracker>>,
}

impl HealthMonitor {
    pub fn new(launcher: Arc<dyn CommandLauncher>, registry: &CommandRegistry, config: HealthConfig) -> Self {
        // The probe is built from the full catalogue even if `status` is not
        // exposed to callers.
        let probe = BoundCommand {
            operation: Operation::Status,
            program: registry.program().to_path_buf(),
            args: Operation::Status.tokens(&Default::default()),
            target_host: None,
        };
        Self {
            launcher,
            probe,
            tracker: Arc::new(RwLock::new(HealthTracker::new(config.failure_threshold))),
            config,
        }
    }

    pub fn probe(&self) -> &BoundCommand {
        &self.probe
    }

    pub async fn state(&self) -> HealthState {
        self.tracker.read().await.state().clone()
    }

    /// Run one probe and fold its result into the tracker.
    pub async fn check_once(&self) -> HealthStatus {
        let ctx = CallContext::new("health-monitor");
        let result = self
            .launcher
            .run(&self.probe, self.config.probe_timeout, &ctx)
            .await;
        let now = Utc::now();

        let mut tracker = self.tracker.write().await;
        let transition = match result.outcome {
            Ok(_) => {
                debug!(elapsed_ms = result.elapsed.as_millis() as u64, "health probe succeeded");
                tracker.record_success(now)
            }
            Err(ref err) => {
                debug!(error = %err, "health probe failed");
                tracker.record_failure(now, err.to_string())
            }
        };

        if let Some(transition) = transition {
            let state = tracker.state();
            match transition.to {
                HealthStatus::Degraded => warn!(
                    consecutive_failures = state.consecutive_failures,
                    threshold = state.failure_threshold,
                    last_error = state.last_error.as_deref().unwrap_or(""),
                    "nodetool health degraded"
                ),
                HealthStatus::Healthy => info!(
                    total_failures = state.total_failures,
                    "nodetool health recovered"
                ),
            }
        }
        tracker.status()
    }

    /// Probe on every tick until cancelled. The first probe runs immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval.as_secs(),
            probe_timeout_secs = self.config.probe_timeout.as_secs(),
            threshold = self.config.failure_threshold,
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("health monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // A cancelled probe drops its process guard, which kills nodetool.
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("health monitor shutting down");
                            break;
                        }
                        _ = self.check_once() => {}
                    }
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

/// Serialized shape of `GET /health`.
pub fn health_document(state: &HealthState, extra: HashMap<&'static str, serde_json::Value>) -> serde_json::Value {
    let mut doc = serde_json::to_value(state).unwrap_or_else(|_| serde_json::json!({}));
    if let serde_json::Value::Object(ref mut map) = doc {
        for (key, value) in extra {
            map.insert(key.to_string(), value);
        }
    }
    doc
}
