use crate::admission::{AdmissionGate, AdmissionPolicy};
use crate::auth::{CredentialError, CredentialSet};
use crate::dispatcher::TimeoutPolicy;
use crate::executor::ExecutorConfig;
use crate::health::HealthConfig;
use crate::registry::{CommandRegistry, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config file extension: {0:?}")]
    UnsupportedExtension(String),
    #[error("invalid credentials: {0}")]
    Credentials(#[from] CredentialError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Proxies allowed to name the client in `X-Forwarded-For`.
    pub trusted_proxies: Vec<IpAddr>,
    /// Grace given to in-flight HTTP calls at shutdown before they are cancelled.
    pub shutdown_drain_secs: u64,
    pub api_keys: Vec<String>,
    pub nodetool_path: PathBuf,
    pub java_home: Option<PathBuf>,
    pub default_timeout_secs: u64,
    /// Replaces `default_timeout_secs` for the named operations.
    pub operation_timeouts_secs: BTreeMap<String, u64>,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub health_failure_threshold: u32,
    pub max_concurrent_processes: usize,
    pub admission_policy: AdmissionPolicy,
    pub kill_grace_period_ms: u64,
    pub max_output_bytes: usize,
    pub max_error_bytes: usize,
    /// Subset of the catalogue to expose. `None` exposes everything.
    pub enabled_operations: Option<Vec<String>>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let executor = ExecutorConfig::default();
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8443)),
            trusted_proxies: Vec::new(),
            shutdown_drain_secs: 10,
            api_keys: Vec::new(),
            nodetool_path: PathBuf::from("/usr/local/cassandra/bin/nodetool"),
            java_home: None,
            default_timeout_secs: 300,
            operation_timeouts_secs: BTreeMap::new(),
            health_check_interval_secs: 30,
            health_check_timeout_secs: 10,
            health_failure_threshold: 3,
            max_concurrent_processes: 4,
            admission_policy: AdmissionPolicy::Queue,
            kill_grace_period_ms: executor.kill_grace_period.as_millis() as u64,
            max_output_bytes: executor.max_output_bytes,
            max_error_bytes: executor.max_error_bytes,
            enabled_operations: None,
            log_level: String::from("info"),
            log_format: LogFormat::Text,
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(ConfigError::UnsupportedExtension(ext.to_string())),
        }
    }

    /// Load and validate. Any error here is fatal at startup.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credential_set()?;

        let nonzero = [
            ("default_timeout_secs", self.default_timeout_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("health_check_timeout_secs", self.health_check_timeout_secs),
            ("health_failure_threshold", u64::from(self.health_failure_threshold)),
            ("max_concurrent_processes", self.max_concurrent_processes as u64),
            ("max_output_bytes", self.max_output_bytes as u64),
            ("max_error_bytes", self.max_error_bytes as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }

        for (name, secs) in &self.operation_timeouts_secs {
            parse_operation(name, "operation_timeouts_secs")?;
            if *secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "operation_timeouts_secs.{name} must be greater than zero"
                )));
            }
        }

        if let Some(ref names) = self.enabled_operations {
            if names.is_empty() {
                return Err(ConfigError::Invalid(
                    "enabled_operations must not be empty".to_string(),
                ));
            }
            for name in names {
                parse_operation(name, "enabled_operations")?;
            }
        }

        if self.nodetool_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("nodetool_path must be set".to_string()));
        }
        Ok(())
    }

    pub fn credential_set(&self) -> Result<CredentialSet, ConfigError> {
        Ok(CredentialSet::new(&self.api_keys)?)
    }

    pub fn operations(&self) -> Result<Vec<Operation>, ConfigError> {
        match self.enabled_operations {
            None => Ok(Operation::ALL.to_vec()),
            Some(ref names) => names
                .iter()
                .map(|name| parse_operation(name, "enabled_operations"))
                .collect(),
        }
    }

    pub fn registry(&self) -> Result<CommandRegistry, ConfigError> {
        Ok(CommandRegistry::with_operations(
            self.nodetool_path.clone(),
            &self.operations()?,
        ))
    }

    pub fn timeout_policy(&self) -> Result<TimeoutPolicy, ConfigError> {
        let mut policy = TimeoutPolicy::new(Duration::from_secs(self.default_timeout_secs));
        for (name, secs) in &self.operation_timeouts_secs {
            let op = parse_operation(name, "operation_timeouts_secs")?;
            policy = policy.with_override(op, Duration::from_secs(*secs));
        }
        Ok(policy)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            kill_grace_period: Duration::from_millis(self.kill_grace_period_ms),
            max_output_bytes: self.max_output_bytes,
            max_error_bytes: self.max_error_bytes,
            java_home: self.java_home.clone(),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health_check_interval_secs),
            probe_timeout: Duration::from_secs(self.health_check_timeout_secs),
            failure_threshold: self.health_failure_threshold,
        }
    }

    pub fn admission_gate(&self) -> AdmissionGate {
        AdmissionGate::new(self.max_concurrent_processes, self.admission_policy)
    }

    /// Configured keys with all but a short prefix hidden.
    pub fn masked_keys(&self) -> Vec<String> {
        self.api_keys.iter().map(|key| mask_key(key)).collect()
    }
}

fn parse_operation(name: &str, setting: &str) -> Result<Operation, ConfigError> {
    Operation::from_name(name)
        .ok_or_else(|| ConfigError::Invalid(format!("{setting}: unknown operation '{name}'")))
}

pub fn mask_key(key: &str) -> String {
    if key.chars().count() <= 8 {
        return "****".to_string();
    }
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}****")
}
