//! Live step records
//!
//! A `StepRecord` is the mutable, in-progress form of a step. It is shared
//! between the step context stack, its parent's child list and the step unit
//! that will close it, so it lives behind [`StepRef`]. Once the scenario is
//! reported the tree is frozen into [`StepResult`]s.

use std::sync::Arc;

use parking_lot::Mutex;
use stepwise_common::{
    now_millis, Attachment, Failure, Parameter, Status, StatusDetails, StepResult,
};

/// Lifecycle of a step record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Running,
    Passed,
    Failed,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepState::Running)
    }
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: String,
    pub title: String,
    pub parameters: Vec<Parameter>,
    pub attachments: Vec<Attachment>,
    pub children: Vec<StepRef>,
    pub state: StepState,
    pub status_details: Option<StatusDetails>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

pub type StepRef = Arc<Mutex<StepRecord>>;

impl StepRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>, parameters: Vec<Parameter>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            parameters,
            attachments: Vec::new(),
            children: Vec::new(),
            state: StepState::Running,
            status_details: None,
            started_at: now_millis(),
            ended_at: None,
        }
    }

    pub fn into_ref(self) -> StepRef {
        Arc::new(Mutex::new(self))
    }

    /// Move the record to its terminal state.
    ///
    /// Returns `false` without touching the record if it was already closed.
    pub fn close(&mut self, failure: Option<&Failure>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.ended_at = Some(now_millis());
        match failure {
            Some(f) => {
                self.state = StepState::Failed;
                self.status_details = Some(StatusDetails::new(f.display_message(), f.trace.clone()));
            }
            None => self.state = StepState::Passed,
        }
        true
    }

    /// Freeze this record and its children into the report model
    pub fn snapshot(&self) -> StepResult {
        let status = match self.state {
            StepState::Passed => Status::Passed,
            StepState::Failed => Status::Failed,
            // Still open when the scenario was reported
            StepState::Running => Status::Broken,
        };
        StepResult {
            uuid: self.id.clone(),
            name: self.title.clone(),
            status,
            status_details: self.status_details.clone(),
            parameters: self.parameters.clone(),
            attachments: self.attachments.clone(),
            steps: self.children.iter().map(|c| c.lock().snapshot()).collect(),
            start: self.started_at,
            stop: self.ended_at.unwrap_or_else(now_millis),
        }
    }
}
