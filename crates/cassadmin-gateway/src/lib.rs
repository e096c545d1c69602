//! cassadmin: authenticated gateway exposing a fixed catalogue of Cassandra
//! nodetool operations, with bounded process execution, admission control and
//! health monitoring.

pub mod admission;
pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod health;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod security;
pub mod stdio;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionGate, AdmissionPolicy};
pub use api::GatewayApi;
pub use auth::{CredentialSet, CredentialStore, CredentialValidator};
pub use config::{ConfigError, GatewayConfig, LogFormat};
pub use dispatcher::{CallContext, Dispatcher, InvocationRequest, InvocationResult, TimeoutPolicy};
pub use error::{DispatchError, ErrorKind};
pub use executor::{CommandLauncher, ExecutorConfig, ProcessExecutor};
pub use health::{HealthMonitor, HealthState, HealthStatus, HealthTracker};
pub use registry::{BoundCommand, CommandRegistry, Operation};
pub use runtime::Gateway;
