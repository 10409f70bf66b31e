//! Lifecycle events from the test framework
//!
//! The framework fires [`Event`]s in run -> (passed | failed | skipped) order
//! per scenario, with framework steps nested inside in run -> (passed | failed)
//! order. Listeners receive every event through a [`Dispatcher`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use stepwise_common::{Failure, Label, Result};
use tracing::trace;

use crate::scheduler::SharedScheduler;

/// Static description of a scenario
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioInfo {
    /// Stable identity across runs, e.g. `scenarios/login/login_as_admin.py`
    pub unique_id: String,
    /// Human-readable title
    pub subject: String,
    /// Path relative to the project root
    pub path: PathBuf,
    pub tags: Vec<String>,
    /// Labels declared on the scenario itself
    pub labels: Vec<Label>,
    /// Labels declared on the template the scenario was built from
    pub template_labels: Vec<Label>,
}

impl ScenarioInfo {
    pub fn new(unique_id: impl Into<String>, subject: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            unique_id: unique_id.into(),
            subject: subject.into(),
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_labels(mut self, labels: Vec<Label>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn with_template_labels(mut self, labels: Vec<Label>) -> Self {
        self.template_labels.extend(labels);
        self
    }

    /// Template labels first, then scenario labels; nothing is deduplicated
    pub fn declared_labels(&self) -> Vec<Label> {
        self.template_labels
            .iter()
            .chain(self.labels.iter())
            .cloned()
            .collect()
    }

    /// Dotted package derived from the scenario's directory
    pub fn package(&self) -> String {
        self.path
            .parent()
            .map(|dir| {
                dir.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(".")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScenarioStatus {
    #[default]
    Pending,
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameworkStepStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

/// An artifact produced by a scenario or one of its framework steps
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Memory {
        name: String,
        mime_type: String,
        data: Vec<u8>,
    },
    File {
        name: String,
        mime_type: String,
        path: PathBuf,
    },
    /// Any other artifact kind; reporting one is an error
    Other { kind: String, name: String },
}

impl Artifact {
    pub fn memory(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Artifact::Memory {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn file(name: impl Into<String>, mime_type: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Artifact::File {
            name: name.into(),
            mime_type: mime_type.into(),
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Artifact::Memory { name, .. } | Artifact::File { name, .. } | Artifact::Other { name, .. } => name,
        }
    }
}

/// A scope variable captured at the end of a scenario
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeValue {
    /// JSON-representable value
    Json(serde_json::Value),
    /// Anything else, already rendered as text
    Repr(String),
}

/// One framework step (`given_*`, `when_*`, `then_*`, ...) of an execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameworkStepOutcome {
    /// Function name, e.g. `given_user`
    pub name: String,
    pub status: FrameworkStepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<Failure>,
    pub artifacts: Vec<Artifact>,
}

impl FrameworkStepOutcome {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Name shown in the report: underscores become spaces
    pub fn readable_name(&self) -> String {
        self.name.replace('_', " ")
    }

    pub fn mark_passed(mut self) -> Self {
        self.status = FrameworkStepStatus::Passed;
        self
    }

    pub fn mark_failed(mut self, failure: Failure) -> Self {
        self.status = FrameworkStepStatus::Failed;
        self.failure = Some(failure);
        self
    }

    pub fn with_times(mut self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// One execution attempt of a scenario
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioOutcome {
    pub scenario: ScenarioInfo,
    pub status: ScenarioStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub step_results: Vec<FrameworkStepOutcome>,
    pub artifacts: Vec<Artifact>,
    pub scope: BTreeMap<String, ScopeValue>,
}

impl ScenarioOutcome {
    pub fn new(scenario: ScenarioInfo) -> Self {
        Self {
            scenario,
            ..Default::default()
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.scenario.unique_id
    }

    pub fn is_passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    pub fn is_failed(&self) -> bool {
        self.status == ScenarioStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == ScenarioStatus::Skipped
    }

    pub fn mark_passed(mut self) -> Self {
        self.status = ScenarioStatus::Passed;
        self
    }

    pub fn mark_failed(mut self) -> Self {
        self.status = ScenarioStatus::Failed;
        self
    }

    pub fn mark_skipped(mut self) -> Self {
        self.status = ScenarioStatus::Skipped;
        self
    }

    pub fn with_times(mut self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
        self
    }

    pub fn with_step(mut self, step: FrameworkStepOutcome) -> Self {
        self.step_results.push(step);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_scope(mut self, key: impl Into<String>, value: ScopeValue) -> Self {
        self.scope.insert(key.into(), value);
        self
    }
}

/// The reconciled outcome of every attempt of one scenario
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutcome {
    /// The attempt chosen to stand for the scenario
    pub representative: ScenarioOutcome,
    /// Every attempt, in execution order
    pub attempts: Vec<ScenarioOutcome>,
}

/// How the attempts of a scenario played out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionDescription {
    /// Passed without any failed attempt
    Passed,
    /// Passed after at least one failed attempt
    Flaky,
    /// Every attempt that ran failed
    Failed,
    /// Neither passed nor failed, e.g. skipped
    Inconclusive,
}

impl AggregateOutcome {
    pub fn status(&self) -> ScenarioStatus {
        self.representative.status
    }

    pub fn describe(&self) -> ExecutionDescription {
        let any_failed = self.attempts.iter().any(ScenarioOutcome::is_failed);
        match self.representative.status {
            ScenarioStatus::Passed if any_failed => ExecutionDescription::Flaky,
            ScenarioStatus::Passed => ExecutionDescription::Passed,
            ScenarioStatus::Failed => ExecutionDescription::Failed,
            _ => ExecutionDescription::Inconclusive,
        }
    }
}

/// End-of-run report that listeners can add summary lines to
#[derive(Debug, Default)]
pub struct RunReport {
    summaries: Mutex<Vec<String>>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_summary(&self, line: impl Into<String>) {
        self.summaries.lock().push(line.into());
    }

    pub fn summaries(&self) -> Vec<String> {
        self.summaries.lock().clone()
    }
}

/// A lifecycle notification
#[derive(Clone)]
pub enum Event {
    Startup { scheduler: SharedScheduler },
    ScenarioRun(ScenarioOutcome),
    ScenarioPassed(ScenarioOutcome),
    ScenarioFailed(ScenarioOutcome),
    ScenarioSkipped(ScenarioOutcome),
    StepRun(FrameworkStepOutcome),
    StepPassed(FrameworkStepOutcome),
    StepFailed(FrameworkStepOutcome),
    ScenarioReported(AggregateOutcome),
    Cleanup { report: Arc<RunReport> },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Startup { .. } => "startup",
            Event::ScenarioRun(_) => "scenario_run",
            Event::ScenarioPassed(_) => "scenario_passed",
            Event::ScenarioFailed(_) => "scenario_failed",
            Event::ScenarioSkipped(_) => "scenario_skipped",
            Event::StepRun(_) => "step_run",
            Event::StepPassed(_) => "step_passed",
            Event::StepFailed(_) => "step_failed",
            Event::ScenarioReported(_) => "scenario_reported",
            Event::Cleanup { .. } => "cleanup",
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives lifecycle events
#[async_trait]
pub trait Listener: Send {
    async fn on_event(&mut self, event: &Event) -> Result<()>;
}

/// Fans events out to listeners in registration order
#[derive(Default)]
pub struct Dispatcher {
    listeners: Vec<Box<dyn Listener>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: impl Listener + 'static) -> &mut Self {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver `event` to every listener; the first error stops delivery
    pub async fn fire(&mut self, event: &Event) -> Result<()> {
        trace!("Dispatching {} to {} listener(s)", event.name(), self.listeners.len());
        for listener in self.listeners.iter_mut() {
            listener.on_event(event).await?;
        }
        Ok(())
    }
}
