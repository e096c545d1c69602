//! Property-based tests for the dispatch pipeline.
//!
//! Every property drives `Dispatcher::dispatch` with a recording launcher
//! and checks what reached the launch primitive, never the behaviour of a
//! real process.

use async_trait::async_trait;
use cassadmin_gateway::{
    registry::{normalize_host, MAX_TEXT_LEN},
    AdmissionGate, AdmissionPolicy, BoundCommand, CallContext, CommandLauncher, CommandRegistry,
    CredentialSet, CredentialStore, CredentialValidator, DispatchError, Dispatcher, ErrorKind,
    HealthStatus, HealthTracker, InvocationRequest, InvocationResult, Operation, TimeoutPolicy,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const KEY: &str = "prop-test-key-0001";

#[derive(Default)]
struct RecordingLauncher {
    calls: Mutex<Vec<BoundCommand>>,
}

#[async_trait]
impl CommandLauncher for RecordingLauncher {
    async fn run(&self, command: &BoundCommand, _timeout: Duration, ctx: &CallContext) -> InvocationResult {
        self.calls.lock().push(command.clone());
        InvocationResult {
            request_id: ctx.request_id,
            operation: command.operation.name().to_string(),
            outcome: Ok(String::new()),
            elapsed: Duration::ZERO,
        }
    }
}

struct Fixture {
    dispatcher: Dispatcher,
    registry: Arc<CommandRegistry>,
    launcher: Arc<RecordingLauncher>,
}

fn fixture() -> Fixture {
    let set = CredentialSet::new([KEY]).unwrap();
    let registry = Arc::new(CommandRegistry::new("/opt/cassandra/bin/nodetool"));
    let launcher = Arc::new(RecordingLauncher::default());
    let dispatcher = Dispatcher::new(
        CredentialValidator::new(Arc::new(CredentialStore::new(set))),
        registry.clone(),
        launcher.clone(),
        AdmissionGate::new(8, AdmissionPolicy::Reject),
        TimeoutPolicy::new(Duration::from_secs(60)),
    );
    Fixture {
        dispatcher,
        registry,
        launcher,
    }
}

fn dispatch(fixture: &Fixture, request: InvocationRequest) -> InvocationResult {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(fixture.dispatcher.dispatch(request, &CallContext::new("proptest")))
}

/// Operations with at least one required argument.
fn op_with_required() -> impl Strategy<Value = Operation> {
    prop::sample::select(
        Operation::ALL
            .into_iter()
            .filter(|op| op.schema().iter().any(|arg| arg.required))
            .collect::<Vec<_>>(),
    )
}

/// Free text that passes the `Text` kind rules, metacharacters included.
fn valid_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_;$`|&<>(){}'\" /*?!.:=+#%@^~\\[\\]]{1,64}"
        .prop_filter("must not start with '-'", |s| !s.starts_with('-'))
}

fn required_args(op: Operation, value: &str) -> HashMap<String, String> {
    op.schema()
        .iter()
        .filter(|arg| arg.required)
        .map(|arg| {
            let value = if arg.name == "value" { "16" } else { value };
            (arg.name.to_string(), value.to_string())
        })
        .collect()
}

proptest! {
    #[test]
    fn test_unknown_operations_never_launch(name in "[a-z_;$ ]{1,32}") {
        prop_assume!(Operation::from_name(&name).is_none());
        let fixture = fixture();
        let result = dispatch(&fixture, InvocationRequest {
            operation: name,
            credential: Some(KEY.to_string()),
            ..Default::default()
        });
        prop_assert_eq!(result.outcome.unwrap_err().kind(), ErrorKind::UnknownOperation);
        prop_assert!(fixture.launcher.calls.lock().is_empty());
    }

    #[test]
    fn test_missing_required_field_never_launches(
        op in op_with_required(),
        drop_index in 0usize..3,
    ) {
        let fixture = fixture();
        let mut args = required_args(op, "value_1");
        let mut names: Vec<String> = args.keys().cloned().collect();
        names.sort();
        let dropped = names[drop_index % names.len()].clone();
        args.remove(&dropped);

        let result = dispatch(&fixture, InvocationRequest {
            operation: op.name().to_string(),
            arguments: args,
            credential: Some(KEY.to_string()),
            target_host: None,
        });
        match result.outcome {
            Err(DispatchError::InvalidArguments { field, .. }) => prop_assert_eq!(field, dropped),
            other => prop_assert!(false, "unexpected outcome {:?}", other),
        }
        prop_assert!(fixture.launcher.calls.lock().is_empty());
    }

    #[test]
    fn test_bad_credentials_fail_before_lookup(
        credential in proptest::option::of(".{0,40}"),
        op in prop::sample::select(Operation::ALL.to_vec()),
    ) {
        prop_assume!(credential.as_deref() != Some(KEY));
        let fixture = fixture();
        let result = dispatch(&fixture, InvocationRequest {
            operation: op.name().to_string(),
            credential,
            ..Default::default()
        });
        prop_assert_eq!(result.outcome.unwrap_err().kind(), ErrorKind::Unauthenticated);
        prop_assert_eq!(fixture.registry.lookups(), 0);
        prop_assert!(fixture.launcher.calls.lock().is_empty());
    }

    #[test]
    fn test_metacharacters_stay_single_tokens(value in valid_text()) {
        let fixture = fixture();
        let result = dispatch(&fixture, InvocationRequest {
            operation: "snapshot".to_string(),
            arguments: HashMap::from([("tag".to_string(), value.clone())]),
            credential: Some(KEY.to_string()),
            target_host: None,
        });
        prop_assert!(result.is_success());
        let calls = fixture.launcher.calls.lock();
        prop_assert_eq!(calls.len(), 1);
        prop_assert_eq!(
            calls[0].args.clone(),
            vec!["snapshot".to_string(), "-t".to_string(), value]
        );
    }

    #[test]
    fn test_getsstables_key_is_one_argv_element(key in valid_text()) {
        let fixture = fixture();
        let result = dispatch(&fixture, InvocationRequest {
            operation: "getsstables".to_string(),
            arguments: HashMap::from([
                ("keyspace".to_string(), "app".to_string()),
                ("table".to_string(), "users".to_string()),
                ("key".to_string(), key.clone()),
            ]),
            credential: Some(KEY.to_string()),
            target_host: None,
        });
        prop_assert!(result.is_success());
        let argv = fixture.launcher.calls.lock()[0].argv();
        prop_assert_eq!(argv.len(), 5);
        prop_assert_eq!(&argv[4], &key);
    }

    #[test]
    fn test_option_like_values_rejected(rest in "[a-z-]{0,20}") {
        let fixture = fixture();
        let result = dispatch(&fixture, InvocationRequest {
            operation: "cleanup".to_string(),
            arguments: HashMap::from([("keyspace".to_string(), format!("-{rest}"))]),
            credential: Some(KEY.to_string()),
            target_host: None,
        });
        prop_assert_eq!(result.outcome.unwrap_err().kind(), ErrorKind::InvalidArguments);
        prop_assert!(fixture.launcher.calls.lock().is_empty());
    }

    #[test]
    fn test_overlong_values_rejected(extra in 1usize..64) {
        let fixture = fixture();
        let result = dispatch(&fixture, InvocationRequest {
            operation: "snapshot".to_string(),
            arguments: HashMap::from([("tag".to_string(), "t".repeat(MAX_TEXT_LEN + extra))]),
            credential: Some(KEY.to_string()),
            target_host: None,
        });
        prop_assert_eq!(result.outcome.unwrap_err().kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_hosts_with_shell_metacharacters_rejected(
        prefix in "[a-z0-9.]{0,12}",
        meta in prop::sample::select(vec![";", "$", "`", "|", "&", " ", "/", "\\", "(", ")", "<", ">", "'", "\"", "*", "\n"]),
        suffix in "[a-z0-9.]{0,12}",
    ) {
        let host = format!("{prefix}{meta}{suffix}");
        prop_assert!(normalize_host(&host).is_none());
    }

    #[test]
    fn test_ipv4_hosts_accepted(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255) {
        let host = format!("{a}.{b}.{c}.{d}");
        prop_assert_eq!(normalize_host(&host), Some(host.clone()));
    }

    #[test]
    fn test_health_below_threshold_never_degrades(
        threshold in 1u32..10,
        runs in proptest::collection::vec(0u32..10, 1..20),
    ) {
        let mut tracker = HealthTracker::new(threshold);
        let now = chrono::Utc::now();
        for run in runs {
            let failures = run % threshold;
            for _ in 0..failures {
                tracker.record_failure(now, "probe failed");
            }
            tracker.record_success(now);
            prop_assert_eq!(tracker.status(), HealthStatus::Healthy);
        }
    }

    #[test]
    fn test_health_degrades_at_exactly_threshold(threshold in 1u32..10) {
        let mut tracker = HealthTracker::new(threshold);
        let now = chrono::Utc::now();
        for i in 1..=threshold {
            tracker.record_failure(now, "probe failed");
            let expected = if i == threshold { HealthStatus::Degraded } else { HealthStatus::Healthy };
            prop_assert_eq!(tracker.status(), expected);
        }
        tracker.record_success(now);
        prop_assert_eq!(tracker.status(), HealthStatus::Healthy);
    }
}
