//! Scenario scheduler interface
//!
//! The framework owns the real scheduler. Listeners use it to request extra
//! executions (reruns) and to drop scenarios before the run starts (label
//! filtering).

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::events::ScenarioInfo;

pub trait Scheduler: Send + Sync {
    /// Queue one more execution of `scenario`
    fn schedule(&self, scenario: &ScenarioInfo);

    /// Exclude `scenario` from the run
    fn ignore(&self, scenario: &ScenarioInfo);

    /// Every discovered scenario, in discovery order
    fn scenarios(&self) -> BoxStream<'static, ScenarioInfo>;
}

pub type SharedScheduler = Arc<dyn Scheduler>;

/// Scheduler over a fixed list of scenarios
#[derive(Debug, Default)]
pub struct MemoryScheduler {
    discovered: Vec<ScenarioInfo>,
    scheduled: Mutex<Vec<ScenarioInfo>>,
    ignored: Mutex<HashSet<String>>,
}

impl MemoryScheduler {
    pub fn new(discovered: Vec<ScenarioInfo>) -> Self {
        Self {
            discovered,
            ..Default::default()
        }
    }

    /// Extra executions requested so far, in request order
    pub fn scheduled(&self) -> Vec<ScenarioInfo> {
        self.scheduled.lock().clone()
    }

    pub fn is_ignored(&self, unique_id: &str) -> bool {
        self.ignored.lock().contains(unique_id)
    }

    /// Discovered scenarios that were not ignored
    pub fn selected(&self) -> Vec<ScenarioInfo> {
        let ignored = self.ignored.lock();
        self.discovered
            .iter()
            .filter(|s| !ignored.contains(&s.unique_id))
            .cloned()
            .collect()
    }
}

impl Scheduler for MemoryScheduler {
    fn schedule(&self, scenario: &ScenarioInfo) {
        debug!("Scheduled another execution of {}", scenario.unique_id);
        self.scheduled.lock().push(scenario.clone());
    }

    fn ignore(&self, scenario: &ScenarioInfo) {
        debug!("Ignoring {}", scenario.unique_id);
        self.ignored.lock().insert(scenario.unique_id.clone());
    }

    fn scenarios(&self) -> BoxStream<'static, ScenarioInfo> {
        stream::iter(self.discovered.clone()).boxed()
    }
}
