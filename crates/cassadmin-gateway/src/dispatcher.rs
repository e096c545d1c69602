//! Operation dispatcher.
//!
//! One call flows through: credential check, operation lookup, argument
//! binding, admission, then a single executor run. The order is fixed:
//! nothing is looked up for an unauthenticated caller and nothing is launched
//! for a call that failed validation. No call is ever retried here.

use crate::admission::AdmissionGate;
use crate::auth::{AuthOutcome, CredentialValidator};
use crate::error::{sanitize_name, DispatchError};
use crate::executor::CommandLauncher;
use crate::registry::{BoundCommand, CommandRegistry, Operation};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-call identity threaded through logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub request_id: Uuid,
    /// Transport-level client label (peer address, `stdio`, ...).
    pub client: String,
}

impl CallContext {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client: client.into(),
        }
    }
}

/// A decoded inbound call.
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest {
    pub operation: String,
    pub arguments: HashMap<String, String>,
    pub credential: Option<String>,
    pub target_host: Option<String>,
}

/// The single result produced for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub request_id: Uuid,
    /// Operation name, sanitized when it did not resolve.
    pub operation: String,
    pub outcome: Result<String, DispatchError>,
    pub elapsed: Duration,
}

impl InvocationResult {
    pub fn failure(ctx: &CallContext, operation: &str, error: DispatchError, elapsed: Duration) -> Self {
        Self {
            request_id: ctx.request_id,
            operation: sanitize_name(operation),
            outcome: Err(error),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Per-operation deadlines. An override replaces the default outright.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    default: Duration,
    overrides: HashMap<Operation, Duration>,
}

impl TimeoutPolicy {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, operation: Operation, timeout: Duration) -> Self {
        self.overrides.insert(operation, timeout);
        self
    }

    pub fn for_operation(&self, operation: Operation) -> Duration {
        self.overrides.get(&operation).copied().unwrap_or(self.default)
    }
}

pub struct Dispatcher {
    validator: CredentialValidator,
    registry: Arc<CommandRegistry>,
    launcher: Arc<dyn CommandLauncher>,
    gate: AdmissionGate,
    timeouts: TimeoutPolicy,
}

impl Dispatcher {
    pub fn new(
        validator: CredentialValidator,
        registry: Arc<CommandRegistry>,
        launcher: Arc<dyn CommandLauncher>,
        gate: AdmissionGate,
        timeouts: TimeoutPolicy,
    ) -> Self {
        Self {
            validator,
            registry,
            launcher,
            gate,
            timeouts,
        }
    }

    pub fn validator(&self) -> &CredentialValidator {
        &self.validator
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Run one call to completion. Every failure comes back as a typed result.
    pub async fn dispatch(&self, request: InvocationRequest, ctx: &CallContext) -> InvocationResult {
        let started = Instant::now();

        let (command, timeout) = match self.prepare(&request, ctx) {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::info!(
                    target: "cassadmin::dispatch",
                    request_id = %ctx.request_id,
                    client = %ctx.client,
                    operation = %sanitize_name(&request.operation),
                    kind = %err.kind(),
                    error = %err,
                    "call rejected"
                );
                return InvocationResult::failure(ctx, &request.operation, err, started.elapsed());
            }
        };

        // Time spent queued comes out of the run's own budget.
        let admitted = self
            .gate
            .admit(timeout)
            .await
            .map(|permit| (timeout.saturating_sub(permit.waited()), permit))
            .filter(|(budget, _)| !budget.is_zero());
        let (budget, permit) = match admitted {
            Some(admitted) => admitted,
            None => {
                tracing::warn!(
                    target: "cassadmin::dispatch",
                    request_id = %ctx.request_id,
                    operation = %command.operation,
                    capacity = self.gate.capacity(),
                    policy = ?self.gate.policy(),
                    "admission gate saturated"
                );
                return InvocationResult::failure(
                    ctx,
                    command.operation.name(),
                    DispatchError::Busy,
                    started.elapsed(),
                );
            }
        };

        let result = self.launcher.run(&command, budget, ctx).await;
        drop(permit);
        result
    }

    fn prepare(
        &self,
        request: &InvocationRequest,
        ctx: &CallContext,
    ) -> Result<(BoundCommand, Duration), DispatchError> {
        match self.validator.check(request.credential.as_deref(), ctx) {
            AuthOutcome::Accepted => {}
            AuthOutcome::Missing => return Err(DispatchError::MissingCredential),
            AuthOutcome::Rejected => return Err(DispatchError::InvalidCredential),
        }

        let operation = self.registry.resolve(&request.operation)?;
        let command = self.registry.bind(
            operation,
            &request.arguments,
            request.target_host.as_deref(),
        )?;
        Ok((command, self.timeouts.for_operation(operation)))
    }
}
