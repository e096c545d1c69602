//! Event capture for asserting on structured log output in unit tests.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

#[derive(Debug, Clone)]
struct CapturedEvent {
    target: String,
    outcome: Option<String>,
}

/// Records the target and `outcome` field of every event on this thread.
#[derive(Clone, Default)]
pub(crate) struct EventCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl EventCapture {
    /// Install as the thread's default subscriber until the guard drops.
    pub(crate) fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    /// `outcome` values of the events logged on `target`, in order.
    pub(crate) fn outcomes(&self, target: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.target == target)
            .map(|event| event.outcome.clone().unwrap_or_default())
            .collect()
    }
}

struct OutcomeField(Option<String>);

impl Visit for OutcomeField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "outcome" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "outcome" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for EventCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut outcome = OutcomeField(None);
        event.record(&mut outcome);
        self.events.lock().push(CapturedEvent {
            target: event.metadata().target().to_string(),
            outcome: outcome.0,
        });
    }
}
