use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use deckart_contracts::events::{EventPayload, EventWriter};
use deckart_contracts::runs::summary::FailureSummary;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Reference,
    Generation,
    Critique,
    Selection,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Reference => "reference",
            Stage::Generation => "generation",
            Stage::Critique => "critique",
            Stage::Selection => "selection",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub stage: Stage,
    pub entity_id: String,
    pub message: String,
}

/// Collects per-task failures and warnings for the whole run.
///
/// Cloning shares the underlying buffers, so one reporter is handed to every
/// stage and read back once the run is over. Entries are mirrored to `tracing`
/// and, when an [`EventWriter`] is attached, to the run's event log.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    inner: Arc<ReporterInner>,
}

#[derive(Debug, Default)]
struct ReporterInner {
    events: Option<EventWriter>,
    failures: Mutex<Vec<Failure>>,
    warnings: Mutex<Vec<String>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: EventWriter) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                events: Some(events),
                ..ReporterInner::default()
            }),
        }
    }

    pub fn failure(&self, stage: Stage, entity_id: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(%stage, entity_id, error = %message, "task failed");
        self.event(
            &format!("{stage}_failed"),
            json!({"entity_id": entity_id, "error": message}),
        );
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Failure {
                stage,
                entity_id: entity_id.to_string(),
                message,
            });
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.event("warning", json!({"message": message}));
        let mut warnings = self
            .inner
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !warnings.contains(&message) {
            warnings.push(message);
        }
    }

    /// Best effort: an unwritable event log never fails the pipeline.
    pub fn event(&self, event_type: &str, payload: Value) {
        let Some(events) = self.inner.events.as_ref() else {
            return;
        };
        let payload: EventPayload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = events.emit(event_type, payload) {
            debug!(event_type, error = %err, "event emit failed");
        }
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn failures_for(&self, stage: Stage) -> Vec<Failure> {
        self.failures()
            .into_iter()
            .filter(|failure| failure.stage == stage)
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.inner
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summary(&self) -> FailureSummary {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut entities = BTreeSet::new();
        for failure in self.failures() {
            *counts.entry(failure.stage.as_str().to_string()).or_default() += 1;
            entities.insert(failure.entity_id);
        }
        FailureSummary {
            counts,
            entities: entities.into_iter().collect(),
        }
    }
}
