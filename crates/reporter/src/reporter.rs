//! Result reporter
//!
//! Turns a finished scenario into a [`TestResult`]: labels, attachments, one
//! step per framework step, and the ad-hoc steps recorded on this thread
//! spliced in under the framework step they ran in.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use stepwise_common::{
    digest, now_millis, Attachment, Error, Label, LabelType, ReporterConfig, Result, Status,
    StatusDetails, StepResult, TestResult, UngroupedSteps,
};
use tracing::{debug, info, warn};

use crate::attachments::{AttachmentFactory, TEXT_PLAIN};
use crate::context::{RecordedSteps, StepContext};
use crate::events::{
    Artifact, Event, FrameworkStepOutcome, FrameworkStepStatus, Listener, ScenarioInfo,
    ScenarioOutcome, ScenarioStatus, ScopeValue,
};
use crate::record::StepRef;
use crate::scheduler::SharedScheduler;
use crate::sink::SharedSink;

pub struct ResultReporter {
    config: ReporterConfig,
    label_filter: Vec<(String, String)>,
    sink: SharedSink,
    attachments: AttachmentFactory,
    context: StepContext,
}

impl ResultReporter {
    /// Create a reporter recording through the global step context
    pub fn new(config: ReporterConfig, sink: SharedSink) -> Result<Self> {
        Self::with_context(config, sink, StepContext::global().clone())
    }

    pub fn with_context(config: ReporterConfig, sink: SharedSink, context: StepContext) -> Result<Self> {
        let label_filter = config.parsed_label_filter()?;
        context.set_sink(sink.clone());
        context.set_detect_framework_steps(config.detect_framework_steps);
        Ok(Self {
            config,
            label_filter,
            attachments: AttachmentFactory::new(sink.clone()),
            sink,
            context,
        })
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    pub fn context(&self) -> &StepContext {
        &self.context
    }

    /// Labels for a scenario, in report order
    pub fn build_labels(&self, scenario: &ScenarioInfo) -> Vec<Label> {
        let mut labels = vec![
            Label::new(LabelType::FRAMEWORK, &self.config.framework),
            Label::new(LabelType::PACKAGE, scenario.package()),
            Label::new(LabelType::SUITE, &self.config.suite),
        ];
        if !self.config.project_name.is_empty() {
            labels.push(Label::new(LabelType::PROJECT_NAME, &self.config.project_name));
        }
        labels.extend(self.config.labels.iter().cloned());
        if self.config.attach_tags {
            labels.extend(scenario.tags.iter().map(Label::tag));
        }
        labels.extend(scenario.declared_labels());
        labels
    }

    /// Whether a scenario carries every configured label filter
    pub fn matches_label_filter(&self, scenario: &ScenarioInfo) -> bool {
        let declared: HashSet<(String, String)> = scenario
            .declared_labels()
            .into_iter()
            .map(|label| (label.name.to_lowercase(), label.value))
            .collect();
        self.label_filter.iter().all(|filter| declared.contains(filter))
    }

    /// Ignore every scenario that does not match the label filter
    pub async fn filter_scenarios(&self, scheduler: &SharedScheduler) {
        if self.label_filter.is_empty() {
            return;
        }
        let mut scenarios = scheduler.scenarios();
        let mut ignored = 0usize;
        while let Some(scenario) = scenarios.next().await {
            if !self.matches_label_filter(&scenario) {
                scheduler.ignore(&scenario);
                ignored += 1;
            }
        }
        info!("Label filter ignored {} scenario(s)", ignored);
    }

    /// Attachments for a list of artifacts.
    ///
    /// An [`Artifact::Other`] is an error; a missing file artifact is skipped.
    pub fn build_attachments(&self, artifacts: &[Artifact]) -> Result<Vec<Attachment>> {
        let mut attachments = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            match artifact {
                Artifact::Memory { name, mime_type, data } => {
                    attachments.push(self.attachments.memory(data, name, mime_type)?);
                }
                Artifact::File { name, mime_type, path } => {
                    match self.attachments.file(path, Some(name.as_str()), Some(mime_type.as_str()))? {
                        Some(attachment) => attachments.push(attachment),
                        None => warn!("Skipping artifact '{}': {} does not exist", name, path.display()),
                    }
                }
                Artifact::Other { kind, name } => {
                    return Err(Error::UnknownArtifact {
                        kind: kind.clone(),
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(attachments)
    }

    /// Report one execution with the given status and hand it to the sink.
    ///
    /// Clears this thread's step context afterwards, also when building the
    /// result fails.
    pub fn report_result(&self, outcome: &ScenarioOutcome, status: Status) -> Result<TestResult> {
        let built = self.build_result(outcome, status);
        self.context.clear_all();
        let result = built?;

        debug!(
            steps = result.steps.iter().map(StepResult::count).sum::<usize>(),
            "Reporting {} as {}",
            result.full_name,
            result.status
        );
        self.sink.report_result(result.clone())?;
        Ok(result)
    }

    fn build_result(&self, outcome: &ScenarioOutcome, status: Status) -> Result<TestResult> {
        let scenario = &outcome.scenario;
        let scenario_id = digest::scenario_id(&self.config.project_name, &scenario.unique_id);

        let mut result = TestResult {
            uuid: digest::new_uuid(),
            history_id: scenario_id.clone(),
            test_case_id: scenario_id,
            name: scenario.subject.clone(),
            full_name: scenario.unique_id.clone(),
            status,
            status_details: None,
            labels: self.build_labels(scenario),
            attachments: Vec::new(),
            steps: Vec::new(),
            start: to_millis(outcome.started_at),
            stop: to_millis(outcome.ended_at),
        };

        if self.config.attach_artifacts {
            result.attachments = self.build_attachments(&outcome.artifacts)?;
        }

        if self.config.attach_scope && status != Status::Skipped {
            let body = format_scope(&outcome.scope);
            result
                .attachments
                .push(self.attachments.text(&body, "Scope", TEXT_PLAIN)?);
        }

        for step in &outcome.step_results {
            let mut step_result = framework_step_result(step);
            if let Some(failure) = &step.failure {
                result.status_details = Some(StatusDetails::from_failure(failure));
            }
            if self.config.attach_artifacts {
                step_result.attachments = self.build_attachments(&step.artifacts)?;
            }
            result.steps.push(step_result);
        }

        let recorded = self.context.recorded_steps();
        self.splice_recorded_steps(&mut result, &recorded);
        Ok(result)
    }

    fn splice_recorded_steps(&self, result: &mut TestResult, recorded: &RecordedSteps) {
        if recorded.is_empty() {
            return;
        }

        let mut spliced: Vec<&StepRef> = Vec::new();
        for step in result.steps.iter_mut() {
            if let Some(records) = recorded.by_framework_step.get(&step.name) {
                step.steps.extend(snapshot_all(records));
                spliced.extend(records);
            }
        }

        // Untagged steps plus steps tagged with a framework step this scenario does not have
        let leftover: Vec<StepRef> = recorded
            .top_level
            .iter()
            .filter(|record| !spliced.iter().any(|done| Arc::ptr_eq(*done, *record)))
            .cloned()
            .collect();

        if leftover.is_empty() {
            return;
        }
        match self.config.ungrouped_steps {
            UngroupedSteps::FirstStep => match result.steps.first_mut() {
                Some(first) => first.steps.extend(snapshot_all(&leftover)),
                None => result.steps.extend(snapshot_all(&leftover)),
            },
            UngroupedSteps::Scenario => result.steps.extend(snapshot_all(&leftover)),
            UngroupedSteps::Drop => {
                debug!("Dropping {} ungrouped step(s)", leftover.len());
            }
        }
    }

    async fn on_scenario_reported(&self, outcome: &ScenarioOutcome) -> Result<()> {
        let status = match outcome.status {
            ScenarioStatus::Passed => Status::Passed,
            ScenarioStatus::Failed => Status::Failed,
            ScenarioStatus::Skipped => Status::Skipped,
            ScenarioStatus::Pending => return Ok(()),
        };
        self.report_result(outcome, status).map(|_| ())
    }
}

#[async_trait]
impl Listener for ResultReporter {
    async fn on_event(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::Startup { scheduler } => self.filter_scenarios(scheduler).await,
            Event::ScenarioRun(_) => self.context.clear_all(),
            Event::StepRun(step) => self.context.set_current_framework_step(step.readable_name()),
            Event::StepPassed(_) | Event::StepFailed(_) => self.context.clear_current_framework_step(),
            Event::ScenarioReported(aggregate) => {
                return self.on_scenario_reported(&aggregate.representative).await;
            }
            _ => {}
        }
        Ok(())
    }
}

fn to_millis(at: Option<DateTime<Utc>>) -> i64 {
    at.map(|t| t.timestamp_millis()).unwrap_or_else(now_millis)
}

fn snapshot_all(records: &[StepRef]) -> Vec<StepResult> {
    records.iter().map(|r| r.lock().snapshot()).collect()
}

fn framework_step_result(step: &FrameworkStepOutcome) -> StepResult {
    StepResult {
        uuid: digest::new_uuid(),
        name: step.readable_name(),
        status: match step.status {
            FrameworkStepStatus::Passed => Status::Passed,
            FrameworkStepStatus::Failed => Status::Failed,
            FrameworkStepStatus::Pending => Status::Unknown,
        },
        status_details: step.failure.as_ref().map(StatusDetails::from_failure),
        start: to_millis(step.started_at),
        stop: to_millis(step.ended_at),
        ..Default::default()
    }
}

/// Render scope variables as `    key:\n{json}\n\n` blocks
pub fn format_scope(scope: &BTreeMap<String, ScopeValue>) -> String {
    let mut out = String::new();
    for (key, value) in scope {
        let rendered = match value {
            ScopeValue::Json(json) => to_indented_json(json).unwrap_or_else(|| json.to_string()),
            ScopeValue::Repr(text) => text.clone(),
        };
        out.push_str(&format!("    {}:\n{}\n\n", key, rendered));
    }
    out
}

fn to_indented_json(value: &serde_json::Value) -> Option<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer).ok()?;
    String::from_utf8(buf).ok()
}
