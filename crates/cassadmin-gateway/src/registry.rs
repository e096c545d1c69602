//! Command registry: the closed catalogue of nodetool operations.
//!
//! Every operation is a variant of [`Operation`] carrying its argument schema
//! and token template. Nothing outside this file can add an operation; a
//! deployment may only narrow the set through configuration. Binding turns a
//! caller's raw string map into an argv-style [`BoundCommand`] where every
//! value is exactly one element, so no caller text is ever parsed by a shell.

use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Longest accepted free-text argument value in bytes.
pub const MAX_TEXT_LEN: usize = 256;

/// Reserved argument name the transports lift into the request's target host.
pub const TARGET_HOST_ARG: &str = "target_host";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Monitoring,
    Maintenance,
    Extended,
    Compaction,
}

/// Accepted shape of an argument value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ArgKind {
    /// Free text: one argv element, no control characters, no leading `-`.
    Text,
    /// IPv4, IPv6 or an RFC 1123 host name.
    HostAddress,
    /// Non-negative decimal that fits in a `u32`.
    Integer,
    /// One of a fixed set of literals.
    Choice(&'static [&'static str]),
}

impl ArgKind {
    fn check(&self, field: &str, value: &str) -> Result<(), DispatchError> {
        match self {
            ArgKind::Text => {
                if value.len() > MAX_TEXT_LEN {
                    return Err(DispatchError::invalid(
                        field,
                        format!("value longer than {MAX_TEXT_LEN} bytes"),
                    ));
                }
                if value.chars().any(char::is_control) {
                    return Err(DispatchError::invalid(field, "value contains control characters"));
                }
                if value.starts_with('-') {
                    return Err(DispatchError::invalid(field, "value must not start with '-'"));
                }
                Ok(())
            }
            ArgKind::HostAddress => normalize_host(value)
                .map(|_| ())
                .ok_or_else(|| DispatchError::invalid(field, "not a valid host address")),
            ArgKind::Integer => {
                let digits = !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit());
                if digits && value.parse::<u32>().is_ok() {
                    Ok(())
                } else {
                    Err(DispatchError::invalid(field, "expected a non-negative integer"))
                }
            }
            ArgKind::Choice(values) => {
                if values.iter().any(|allowed| *allowed == value) {
                    Ok(())
                } else {
                    Err(DispatchError::invalid(
                        field,
                        format!("expected one of: {}", values.join(", ")),
                    ))
                }
            }
        }
    }
}

/// Schema entry for one argument of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<&'static str>,
    /// Another argument that must be bound whenever this one is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<&'static str>,
    pub description: &'static str,
}

impl ArgSpec {
    const fn required(name: &'static str, kind: ArgKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            requires: None,
            description,
        }
    }

    const fn optional(name: &'static str, kind: ArgKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            requires: None,
            description,
        }
    }

    const fn requiring(self, other: &'static str) -> Self {
        Self {
            requires: Some(other),
            ..self
        }
    }

    const fn defaulting(self, value: &'static str) -> Self {
        Self {
            default: Some(value),
            ..self
        }
    }
}

const KEYSPACE: ArgSpec = ArgSpec::optional("keyspace", ArgKind::Text, "Keyspace name");
const TABLE: ArgSpec =
    ArgSpec::optional("table", ArgKind::Text, "Table name within the keyspace").requiring("keyspace");
const REPAIR_MODE: ArgSpec = ArgSpec::optional(
    "mode",
    ArgKind::Choice(&["incremental", "full"]),
    "Repair mode",
)
.defaulting("incremental");
const SNAPSHOT_TAG: ArgSpec = ArgSpec::required("tag", ArgKind::Text, "Snapshot name");
const SSTABLE_KEYSPACE: ArgSpec = ArgSpec::required("keyspace", ArgKind::Text, "Keyspace name");
const SSTABLE_TABLE: ArgSpec = ArgSpec::required("table", ArgKind::Text, "Table name");
const SSTABLE_KEY: ArgSpec = ArgSpec::required("key", ArgKind::Text, "Partition key");
const THROUGHPUT: ArgSpec = ArgSpec::required(
    "value",
    ArgKind::Integer,
    "Compaction throughput in MB/s, 0 disables throttling",
);

/// A supported nodetool operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Status,
    Ring,
    Info,
    Netstats,
    Repair,
    Snapshot,
    Cleanup,
    Compact,
    GetSstables,
    GetCompactionThroughput,
    SetCompactionThroughput,
    GetConcurrentCompactors,
}

impl Operation {
    pub const ALL: [Operation; 12] = [
        Operation::Status,
        Operation::Ring,
        Operation::Info,
        Operation::Netstats,
        Operation::Repair,
        Operation::Snapshot,
        Operation::Cleanup,
        Operation::Compact,
        Operation::GetSstables,
        Operation::GetCompactionThroughput,
        Operation::SetCompactionThroughput,
        Operation::GetConcurrentCompactors,
    ];

    /// The operation name, which is also the nodetool subcommand.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Status => "status",
            Operation::Ring => "ring",
            Operation::Info => "info",
            Operation::Netstats => "netstats",
            Operation::Repair => "repair",
            Operation::Snapshot => "snapshot",
            Operation::Cleanup => "cleanup",
            Operation::Compact => "compact",
            Operation::GetSstables => "getsstables",
            Operation::GetCompactionThroughput => "getcompactionthroughput",
            Operation::SetCompactionThroughput => "setcompactionthroughput",
            Operation::GetConcurrentCompactors => "getconcurrentcompactors",
        }
    }

    pub fn from_name(name: &str) -> Option<Operation> {
        Operation::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn category(&self) -> Category {
        match self {
            Operation::Status | Operation::Ring | Operation::Info | Operation::Netstats => {
                Category::Monitoring
            }
            Operation::Repair | Operation::Snapshot | Operation::Cleanup | Operation::Compact => {
                Category::Maintenance
            }
            Operation::GetSstables => Category::Extended,
            Operation::GetCompactionThroughput
            | Operation::SetCompactionThroughput
            | Operation::GetConcurrentCompactors => Category::Compaction,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Operation::Status => "Cluster status and per-node state",
            Operation::Ring => "Token ring information",
            Operation::Info => "Information about the target node",
            Operation::Netstats => "Network and streaming statistics",
            Operation::Repair => "Repair one or more tables",
            Operation::Snapshot => "Take a named snapshot",
            Operation::Cleanup => "Remove keys no longer owned by the node",
            Operation::Compact => "Force a major compaction",
            Operation::GetSstables => "List the SSTables holding a partition key",
            Operation::GetCompactionThroughput => "Current compaction throughput limit",
            Operation::SetCompactionThroughput => "Set the compaction throughput limit",
            Operation::GetConcurrentCompactors => "Number of concurrent compactors",
        }
    }

    pub fn schema(&self) -> &'static [ArgSpec] {
        match self {
            Operation::Status | Operation::Ring => &[KEYSPACE],
            Operation::Info
            | Operation::Netstats
            | Operation::GetCompactionThroughput
            | Operation::GetConcurrentCompactors => &[],
            Operation::Repair => &[KEYSPACE, TABLE, REPAIR_MODE],
            Operation::Snapshot => &[SNAPSHOT_TAG, KEYSPACE],
            Operation::Cleanup | Operation::Compact => &[KEYSPACE, TABLE],
            Operation::GetSstables => &[SSTABLE_KEYSPACE, SSTABLE_TABLE, SSTABLE_KEY],
            Operation::SetCompactionThroughput => &[THROUGHPUT],
        }
    }

    /// Validate raw caller arguments against the schema.
    ///
    /// Rejects unknown names, missing required values, values of the wrong
    /// kind and unmet `requires` links. Empty values count as absent.
    pub fn bind_args(&self, raw: &HashMap<String, String>) -> Result<BoundArgs, DispatchError> {
        let schema = self.schema();

        let mut unknown: Vec<&str> = raw
            .keys()
            .map(String::as_str)
            .filter(|name| !schema.iter().any(|arg| arg.name == *name))
            .collect();
        unknown.sort_unstable();
        if let Some(name) = unknown.first() {
            return Err(DispatchError::invalid(name, "unknown argument"));
        }

        let mut bound = BoundArgs::default();
        for arg in schema {
            let value = raw
                .get(arg.name)
                .map(String::as_str)
                .filter(|v| !v.is_empty());
            match (value, arg.default) {
                (Some(value), _) => {
                    arg.kind.check(arg.name, value)?;
                    bound.values.insert(arg.name, value.to_string());
                }
                (None, Some(default)) => {
                    bound.values.insert(arg.name, default.to_string());
                }
                (None, None) if arg.required => {
                    return Err(DispatchError::invalid(arg.name, "required argument is missing"));
                }
                (None, None) => {}
            }
        }

        for arg in schema {
            if let Some(needed) = arg.requires {
                if bound.contains(arg.name) && !bound.contains(needed) {
                    return Err(DispatchError::invalid(
                        arg.name,
                        format!("requires argument '{needed}'"),
                    ));
                }
            }
        }

        Ok(bound)
    }

    /// Token template: subcommand followed by its arguments, one value per token.
    pub fn tokens(&self, args: &BoundArgs) -> Vec<String> {
        let mut tokens = vec![self.name().to_string()];
        match self {
            Operation::Status | Operation::Ring => {
                tokens.extend(args.owned("keyspace"));
            }
            Operation::Repair => {
                if args.get("mode") == Some("full") {
                    tokens.push("--full".to_string());
                }
                tokens.extend(args.owned("keyspace"));
                tokens.extend(args.owned("table"));
            }
            Operation::Snapshot => {
                tokens.push("-t".to_string());
                tokens.extend(args.owned("tag"));
                tokens.extend(args.owned("keyspace"));
            }
            Operation::Cleanup | Operation::Compact => {
                tokens.extend(args.owned("keyspace"));
                tokens.extend(args.owned("table"));
            }
            Operation::GetSstables => {
                tokens.extend(args.owned("keyspace"));
                tokens.extend(args.owned("table"));
                tokens.extend(args.owned("key"));
            }
            Operation::SetCompactionThroughput => {
                tokens.extend(args.owned("value"));
            }
            Operation::Info
            | Operation::Netstats
            | Operation::GetCompactionThroughput
            | Operation::GetConcurrentCompactors => {}
        }
        tokens
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments that passed schema validation, keyed by schema name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundArgs {
    values: BTreeMap<&'static str, String>,
}

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn owned(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A fully resolved argv ready for launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundCommand {
    pub operation: Operation,
    pub program: PathBuf,
    /// Everything after the program, in order.
    pub args: Vec<String>,
    pub target_host: Option<String>,
}

impl BoundCommand {
    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.display().to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Serializable description of an operation for listings.
#[derive(Debug, Clone, Serialize)]
pub struct OperationDescriptor {
    pub name: &'static str,
    pub category: Category,
    pub description: &'static str,
    pub arguments: &'static [ArgSpec],
    pub accepts_target_host: bool,
}

/// The set of operations this process exposes, bound to one nodetool binary.
///
/// Built once at startup and shared read-only.
pub struct CommandRegistry {
    program: PathBuf,
    operations: HashMap<&'static str, Operation>,
    lookups: AtomicU64,
}

impl CommandRegistry {
    /// Registry exposing the whole catalogue.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_operations(program, &Operation::ALL)
    }

    /// Registry restricted to a subset of the catalogue.
    pub fn with_operations(program: impl Into<PathBuf>, operations: &[Operation]) -> Self {
        Self {
            program: program.into(),
            operations: operations.iter().map(|op| (op.name(), *op)).collect(),
            lookups: AtomicU64::new(0),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn resolve(&self, name: &str) -> Result<Operation, DispatchError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.operations
            .get(name)
            .copied()
            .ok_or_else(|| DispatchError::UnknownOperation(crate::error::sanitize_name(name)))
    }

    /// Number of `resolve` calls served so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Validate arguments and target host and produce the argv.
    pub fn bind(
        &self,
        operation: Operation,
        raw: &HashMap<String, String>,
        target_host: Option<&str>,
    ) -> Result<BoundCommand, DispatchError> {
        let bound = operation.bind_args(raw)?;

        let target_host = match target_host.filter(|h| !h.is_empty()) {
            Some(host) => Some(
                normalize_host(host)
                    .ok_or_else(|| DispatchError::invalid(TARGET_HOST_ARG, "not a valid host address"))?,
            ),
            None => None,
        };

        let mut args = Vec::new();
        if let Some(ref host) = target_host {
            args.push("-h".to_string());
            args.push(host.clone());
        }
        args.extend(operation.tokens(&bound));

        Ok(BoundCommand {
            operation,
            program: self.program.clone(),
            args,
            target_host,
        })
    }

    /// Exposed operations in catalogue order.
    pub fn operations(&self) -> Vec<Operation> {
        Operation::ALL
            .into_iter()
            .filter(|op| self.operations.contains_key(op.name()))
            .collect()
    }

    pub fn describe(&self) -> Vec<OperationDescriptor> {
        self.operations()
            .into_iter()
            .map(|op| OperationDescriptor {
                name: op.name(),
                category: op.category(),
                description: op.description(),
                arguments: op.schema(),
                accepts_target_host: true,
            })
            .collect()
    }
}

/// Validate a host address and return the form handed to nodetool.
///
/// IPv6 may be bracketed; brackets are stripped. Host names follow RFC 1123
/// and must not end in an all-numeric label, so malformed dotted quads such
/// as `999.1.1.1` are rejected rather than treated as names.
pub fn normalize_host(host: &str) -> Option<String> {
    if host.is_empty() || host.len() > 253 {
        return None;
    }

    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return match inner.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => Some(addr.to_string()),
            _ => None,
        };
    }

    if let Ok(addr) = host.parse::<IpAddr>() {
        return Some(addr.to_string());
    }

    let labels: Vec<&str> = host.split('.').collect();
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });
    let last_numeric = labels
        .last()
        .map(|label| label.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(true);

    if labels_ok && !last_numeric {
        Some(host.to_ascii_lowercase())
    } else {
        None
    }
}
