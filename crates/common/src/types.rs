//! Report model for the external test-reporting service
//!
//! These are the records handed to a result sink. Field names serialize in the
//! camelCase layout the reporting service expects; the sink owns the on-disk
//! format.

use serde::{Deserialize, Serialize};

use crate::failure::Failure;

/// Current time as milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Final status of a test or step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Passed,
    Failed,
    Broken,
    Skipped,
    Unknown,
}

impl Default for Status {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Passed => write!(f, "passed"),
            Status::Failed => write!(f, "failed"),
            Status::Broken => write!(f, "broken"),
            Status::Skipped => write!(f, "skipped"),
            Status::Unknown => write!(f, "unknown"),
        }
    }
}

/// Human-readable failure description attached to a failed test or step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace: String,
}

impl StatusDetails {
    pub fn new(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Build the scenario-level details for a failure.
    ///
    /// A comparison wins over the plain message. An empty message falls back
    /// to the failure kind, suffixed with the failing source line when known.
    pub fn from_failure(failure: &Failure) -> Self {
        let message = match &failure.comparison {
            Some(cmp) => cmp.to_string(),
            None if failure.message.is_empty() => match &failure.source_line {
                Some(line) => format!("{}: {}", failure.kind, line),
                None => failure.kind.clone(),
            },
            None => failure.message.clone(),
        };
        Self::new(message, failure.trace.clone())
    }
}

/// Well-known label names
pub struct LabelType;

impl LabelType {
    pub const FRAMEWORK: &'static str = "framework";
    pub const SUITE: &'static str = "suite";
    pub const PACKAGE: &'static str = "package";
    pub const TAG: &'static str = "tag";
    pub const EPIC: &'static str = "epic";
    pub const FEATURE: &'static str = "feature";
    pub const STORY: &'static str = "story";
    pub const PROJECT_NAME: &'static str = "project_name";
}

/// A name/value label on a test result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn epic(value: impl Into<String>) -> Self {
        Self::new(LabelType::EPIC, value)
    }

    pub fn feature(value: impl Into<String>) -> Self {
        Self::new(LabelType::FEATURE, value)
    }

    pub fn story(value: impl Into<String>) -> Self {
        Self::new(LabelType::STORY, value)
    }

    pub fn tag(value: impl Into<String>) -> Self {
        Self::new(LabelType::TAG, value)
    }
}

/// How a parameter is displayed by the reporting service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterMode {
    Default,
    Masked,
    Hidden,
}

impl Default for ParameterMode {
    fn default() -> Self {
        Self::Default
    }
}

/// Placeholder shown instead of a masked parameter value
pub const MASKED_VALUE: &str = "***";

/// A step or test parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "is_default_mode")]
    pub mode: ParameterMode,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub excluded: bool,
}

fn is_default_mode(mode: &ParameterMode) -> bool {
    *mode == ParameterMode::Default
}

impl Parameter {
    /// Create a parameter in the given display mode.
    ///
    /// `Masked` replaces the value with [`MASKED_VALUE`]. `Hidden` keeps the
    /// real value but marks the entry excluded from display.
    pub fn new(name: impl Into<String>, value: impl ToString, mode: ParameterMode) -> Self {
        let value = match mode {
            ParameterMode::Masked => MASKED_VALUE.to_string(),
            _ => value.to_string(),
        };
        Self {
            name: name.into(),
            value,
            mode,
            excluded: mode == ParameterMode::Hidden,
        }
    }

    /// A plainly displayed parameter
    pub fn visible(name: impl Into<String>, value: impl ToString) -> Self {
        Self::new(name, value, ParameterMode::Default)
    }
}

/// Descriptor of an attachment body stored by the sink under `source`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub source: String,
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// A finished step in the external model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub uuid: String,
    pub name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<StatusDetails>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    pub start: i64,
    pub stop: i64,
}

impl StepResult {
    /// Depth-first count of this step and all nested steps
    pub fn count(&self) -> usize {
        1 + self.steps.iter().map(StepResult::count).sum::<usize>()
    }
}

/// A finished scenario in the external model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub uuid: String,
    pub history_id: String,
    pub test_case_id: String,
    pub name: String,
    pub full_name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<StatusDetails>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    pub start: i64,
    pub stop: i64,
}

impl TestResult {
    /// Values of all labels with the given name, in order
    pub fn label_values(&self, name: &str) -> Vec<&str> {
        self.labels
            .iter()
            .filter(|l| l.name == name)
            .map(|l| l.value.as_str())
            .collect()
    }
}
