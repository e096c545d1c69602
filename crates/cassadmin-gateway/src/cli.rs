use crate::config::GatewayConfig;
use crate::protocol::{Envelope, Response as WireResponse};
use crate::registry::{ArgSpec, CommandRegistry};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "/etc/cassadmin/cassadmin.toml";

#[derive(Parser)]
#[command(name = "cassadmin")]
#[command(about = "Authenticated gateway for Cassandra nodetool operations", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8443")]
    pub server: String,

    #[arg(short, long, env = "CASSADMIN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP gateway and the health monitor.
    Serve {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Serve JSON-lines calls on stdin/stdout.
    Stdio {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Load and validate a configuration file.
    CheckConfig {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// List the built-in operation catalogue.
    Operations,
    /// Invoke an operation on a running gateway.
    Call {
        operation: String,
        /// Argument as KEY=VALUE; repeatable.
        #[arg(short, long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
        /// Node to target with `nodetool -h`.
        #[arg(long)]
        host: Option<String>,
    },
    /// Show the gateway's health state.
    Health,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

impl Cli {
    /// Client-side commands. `serve` and `stdio` are run by the binary.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::CheckConfig { ref config } => check_config(config),
            Command::Operations => {
                print_operations();
                Ok(())
            }
            Command::Call {
                ref operation,
                ref args,
                ref host,
            } => self.call(operation, args, host.as_deref()).await,
            Command::Health => self.health().await,
            Command::Serve { .. } | Command::Stdio { .. } => {
                anyhow::bail!("serve and stdio are handled by the cassadmin binary")
            }
        }
    }

    async fn call(&self, operation: &str, args: &[(String, String)], host: Option<&str>) -> Result<()> {
        let client = Client::new();
        let url = endpoint(&self.server, &["api", "v1", "operations", operation])?;
        let arguments: HashMap<&str, &str> = args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let mut request = client.post(url).json(&serde_json::json!({
            "arguments": arguments,
            "target_host": host,
        }));
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Request failed: {status}: {e}"))?;

        match envelope.response {
            WireResponse::Ok { output, elapsed_ms } => {
                print!("{output}");
                if !output.ends_with('\n') {
                    println!();
                }
                tracing::debug!(elapsed_ms, "call completed");
                Ok(())
            }
            WireResponse::Error { error_kind, message } => {
                anyhow::bail!("{error_kind} ({status}): {message}")
            }
        }
    }

    async fn health(&self) -> Result<()> {
        let client = Client::new();
        let url = endpoint(&self.server, &["health"])?;

        let response = client.get(url).send().await?;
        let status = response.status();
        let health: serde_json::Value = response.json().await?;

        println!("Status: {}", health["status"].as_str().unwrap_or("unknown"));
        println!(
            "Consecutive failures: {} / {}",
            health["consecutiveFailures"], health["failureThreshold"]
        );
        println!("Last check: {}", health["lastCheck"].as_str().unwrap_or("never"));
        println!("Last success: {}", health["lastSuccess"].as_str().unwrap_or("never"));
        if let Some(error) = health["lastError"].as_str() {
            println!("Last error: {error}");
        }
        println!(
            "Processes: {} / {}",
            health["inFlight"], health["maxConcurrentProcesses"]
        );

        if !status.is_success() {
            anyhow::bail!("gateway reports degraded health ({status})");
        }
        Ok(())
    }
}

/// `server` with `segments` appended, each percent-encoded as one path segment.
fn endpoint(server: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(server).with_context(|| format!("invalid server URL '{server}'"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("server URL '{server}' cannot take a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn check_config(path: &Path) -> Result<()> {
    let config = GatewayConfig::load(path)?;
    let registry = config.registry()?;
    let timeouts = config.timeout_policy()?;

    println!("Configuration OK: {}", path.display());
    println!("Bind address: {}", config.bind_addr);
    println!("nodetool: {}", config.nodetool_path.display());
    if !config.nodetool_path.exists() {
        println!("  warning: nodetool binary not found");
    }
    if let Some(ref java_home) = config.java_home {
        println!("JAVA_HOME: {}", java_home.display());
    }
    println!("API keys: {}", config.masked_keys().join(", "));
    println!(
        "Admission: {} processes, {:?} policy",
        config.max_concurrent_processes, config.admission_policy
    );
    println!(
        "Health check: every {}s, timeout {}s, degraded after {} failures",
        config.health_check_interval_secs,
        config.health_check_timeout_secs,
        config.health_failure_threshold
    );
    println!();
    println!("{:<26} {:>10}", "OPERATION", "TIMEOUT");
    println!("{}", "-".repeat(37));
    for op in registry.operations() {
        println!(
            "{:<26} {:>9}s",
            op.name(),
            timeouts.for_operation(op).as_secs()
        );
    }
    Ok(())
}

fn print_operations() {
    let registry = CommandRegistry::new(GatewayConfig::default().nodetool_path);
    println!("{:<26} {:<12} {:<44} {}", "OPERATION", "CATEGORY", "ARGUMENTS", "DESCRIPTION");
    println!("{}", "-".repeat(110));
    for op in registry.operations() {
        println!(
            "{:<26} {:<12} {:<44} {}",
            op.name(),
            format!("{:?}", op.category()).to_lowercase(),
            format_args_summary(op.schema()),
            op.description()
        );
    }
}

fn format_args_summary(schema: &[ArgSpec]) -> String {
    if schema.is_empty() {
        return "-".to_string();
    }
    schema
        .iter()
        .map(|arg| {
            let mut label = arg.name.to_string();
            if let Some(default) = arg.default {
                label = format!("{label}={default}");
            }
            if arg.required {
                label
            } else {
                format!("[{label}]")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
