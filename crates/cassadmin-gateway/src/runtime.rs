//! Assembly of the long-lived components from a validated configuration.

use crate::auth::{CredentialStore, CredentialValidator};
use crate::config::{ConfigError, GatewayConfig};
use crate::dispatcher::Dispatcher;
use crate::executor::{CommandLauncher, ProcessExecutor};
use crate::health::HealthMonitor;
use std::path::Path;
use std::sync::Arc;

pub struct Gateway {
    pub config: GatewayConfig,
    pub credentials: Arc<CredentialStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub health: HealthMonitor,
}

impl Gateway {
    pub fn build(config: GatewayConfig) -> Result<Self, ConfigError> {
        let launcher: Arc<dyn CommandLauncher> =
            Arc::new(ProcessExecutor::new(config.executor_config()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(
        config: GatewayConfig,
        launcher: Arc<dyn CommandLauncher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        if !config.nodetool_path.exists() {
            tracing::warn!(
                path = %config.nodetool_path.display(),
                "nodetool binary not found; calls will fail until it is available"
            );
        }

        let credentials = Arc::new(CredentialStore::new(config.credential_set()?));
        let registry = Arc::new(config.registry()?);
        let health = HealthMonitor::new(launcher.clone(), &registry, config.health_config());
        let dispatcher = Arc::new(Dispatcher::new(
            CredentialValidator::new(credentials.clone()),
            registry,
            launcher,
            config.admission_gate(),
            config.timeout_policy()?,
        ));

        tracing::info!(
            operations = dispatcher.registry().operations().len(),
            keys = credentials.active().len(),
            max_concurrent_processes = config.max_concurrent_processes,
            admission_policy = ?config.admission_policy,
            default_timeout_secs = config.default_timeout_secs,
            "gateway initialized"
        );

        Ok(Self {
            config,
            credentials,
            dispatcher,
            health,
        })
    }

    /// Re-read `path` and swap in its credential set. Other settings need a
    /// restart. On error the active set is left untouched.
    pub fn reload_credentials(&self, path: &Path) -> Result<usize, ConfigError> {
        let fresh = GatewayConfig::load(path)?;
        let set = fresh.credential_set()?;
        let count = set.len();
        self.credentials.replace(set);
        Ok(count)
    }
}
