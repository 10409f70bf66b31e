//! Reporter and rerunner configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::types::Label;
use crate::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Result reporter settings
    pub reporter: ReporterConfig,

    /// Rerun settings
    pub rerun: RerunConfig,
}

impl Config {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            debug!("Loading configuration from {}", path.display());
            Self::from_toml_str(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.reporter.validate()?;
        self.rerun.validate()
    }
}

/// Where ad-hoc steps go when no framework-step grouping was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UngroupedSteps {
    /// Nest them under the first framework step
    FirstStep,
    /// Append them to the scenario's own step list
    Scenario,
    /// Leave them out of the report
    Drop,
}

impl Default for UngroupedSteps {
    fn default() -> Self {
        Self::FirstStep
    }
}

/// Result reporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Adds a `project_name` label and prefixes scenario identities
    pub project_name: String,

    /// Value of the fixed framework label
    pub framework: String,

    /// Value of the fixed suite label
    pub suite: String,

    /// Attach the scenario scope to non-skipped results
    pub attach_scope: bool,

    /// Attach scenario and step artifacts
    pub attach_artifacts: bool,

    /// Emit scenario tags as tag labels
    pub attach_tags: bool,

    /// Labels added to every result
    pub labels: Vec<Label>,

    /// `name=value` label filters applied at startup
    pub label_filter: Vec<String>,

    pub ungrouped_steps: UngroupedSteps,

    /// Guess the enclosing framework step from the call stack when a step opens.
    ///
    /// Each probe captures and symbolizes a backtrace. It is skipped while a
    /// framework step announced by a `StepRun` event is current.
    pub detect_framework_steps: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            framework: "vedro".to_string(),
            suite: "scenarios".to_string(),
            attach_scope: false,
            attach_artifacts: true,
            attach_tags: true,
            labels: Vec::new(),
            label_filter: Vec::new(),
            ungrouped_steps: UngroupedSteps::default(),
            detect_framework_steps: true,
        }
    }
}

impl ReporterConfig {
    pub fn validate(&self) -> Result<()> {
        self.parsed_label_filter().map(|_| ())
    }

    /// Label filters as `(lowercased name, value)` pairs
    pub fn parsed_label_filter(&self) -> Result<Vec<(String, String)>> {
        self.label_filter
            .iter()
            .map(|raw| match raw.split_once('=') {
                Some((name, value)) if !name.is_empty() && !value.contains('=') => {
                    Ok((name.to_lowercase(), value.to_string()))
                }
                _ => Err(Error::invalid_config(format!(
                    "label filter '{}' must have the form name=value",
                    raw
                ))),
            })
            .collect()
    }
}

/// Rerun configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerunConfig {
    /// Additional executions scheduled for a failed scenario
    pub reruns: u32,

    /// Delay in seconds before each rerun execution
    pub delay_secs: f64,
}

impl RerunConfig {
    pub fn new(reruns: u32, delay_secs: f64) -> Result<Self> {
        let config = Self { reruns, delay_secs };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.delay_secs.is_finite() || self.delay_secs < 0.0 {
            return Err(Error::invalid_config("rerun delay must be >= 0.0"));
        }
        if self.delay_secs > 0.0 && self.reruns < 1 {
            return Err(Error::invalid_config(
                "rerun delay must be used with reruns > 0",
            ));
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.reruns > 0
    }

    pub fn delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.delay_secs)
    }
}
