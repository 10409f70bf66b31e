//! Rerun aggregator
//!
//! Schedules extra executions of a failed scenario and folds all attempts of
//! a scenario into one [`AggregateOutcome`]: passed if any attempt passed,
//! failed if every attempt failed.

use std::collections::HashSet;

use async_trait::async_trait;
use stepwise_common::{RerunConfig, Result};
use tracing::{debug, info};

use crate::events::{AggregateOutcome, Event, Listener, RunReport, ScenarioOutcome};
use crate::scheduler::SharedScheduler;

/// Pick the representative attempt.
///
/// The last passed attempt wins; otherwise the last failed one; when nothing
/// passed or failed (all skipped), the last attempt as-is. `None` for no
/// attempts.
pub fn aggregate(attempts: &[ScenarioOutcome]) -> Option<AggregateOutcome> {
    let last = attempts.last()?;
    let representative = attempts
        .iter()
        .rev()
        .find(|a| a.is_passed())
        .or_else(|| attempts.iter().rev().find(|a| a.is_failed()))
        .unwrap_or(last);
    Some(AggregateOutcome {
        representative: representative.clone(),
        attempts: attempts.to_vec(),
    })
}

/// Group attempts by scenario identity (first-seen order) and aggregate each group
pub fn aggregate_all(attempts: &[ScenarioOutcome]) -> Vec<AggregateOutcome> {
    let mut order: Vec<&str> = Vec::new();
    for attempt in attempts {
        if !order.contains(&attempt.unique_id()) {
            order.push(attempt.unique_id());
        }
    }
    order
        .into_iter()
        .filter_map(|id| {
            let group: Vec<ScenarioOutcome> = attempts
                .iter()
                .filter(|a| a.unique_id() == id)
                .cloned()
                .collect();
            aggregate(&group)
        })
        .collect()
}

pub struct RerunAggregator {
    config: RerunConfig,
    scheduler: Option<SharedScheduler>,
    rescheduled: HashSet<String>,
    reran: usize,
    times: usize,
}

impl RerunAggregator {
    /// Create an aggregator; invalid rerun settings are rejected here
    pub fn new(config: RerunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            scheduler: None,
            rescheduled: HashSet::new(),
            reran: 0,
            times: 0,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Distinct scenarios rerun so far
    pub fn reran(&self) -> usize {
        self.reran
    }

    /// Rerun executions scheduled so far
    pub fn times(&self) -> usize {
        self.times
    }

    pub fn set_scheduler(&mut self, scheduler: SharedScheduler) {
        self.scheduler = Some(scheduler);
    }

    /// Wait out the configured delay before a rerun execution starts
    pub async fn on_scenario_execute(&self, outcome: &ScenarioOutcome) {
        if !self.is_enabled() || self.config.delay_secs <= 0.0 {
            return;
        }
        if self.rescheduled.contains(outcome.unique_id()) {
            debug!("Delaying rerun of {} by {:?}", outcome.unique_id(), self.config.delay());
            tokio::time::sleep(self.config.delay()).await;
        }
    }

    /// Schedule reruns for the first failure of each scenario
    pub fn on_scenario_end(&mut self, outcome: &ScenarioOutcome) {
        if !self.is_enabled() || !outcome.is_failed() {
            return;
        }
        if self.rescheduled.contains(outcome.unique_id()) {
            return;
        }
        let Some(scheduler) = &self.scheduler else {
            debug!("No scheduler registered, not rerunning {}", outcome.unique_id());
            return;
        };

        self.rescheduled.insert(outcome.unique_id().to_string());
        self.reran += 1;
        for _ in 0..self.config.reruns {
            scheduler.schedule(&outcome.scenario);
            self.times += 1;
        }
        debug!("Scheduled {} rerun(s) of {}", self.config.reruns, outcome.unique_id());
    }

    /// `rerun N scenario(s), M time(s)` plus the delay when one is configured
    pub fn summary(&self) -> String {
        let ss = if self.reran == 1 { "" } else { "s" };
        let ts = if self.times == 1 { "" } else { "s" };
        let mut message = format!("rerun {} scenario{}, {} time{}", self.reran, ss, self.times, ts);
        if self.config.delay_secs > 0.0 {
            message.push_str(&format!(", with delay {:?}s", self.config.delay_secs));
        }
        message
    }

    fn on_cleanup(&self, report: &RunReport) {
        if !self.is_enabled() {
            return;
        }
        let summary = self.summary();
        info!("{}", summary);
        report.add_summary(summary);
    }
}

#[async_trait]
impl Listener for RerunAggregator {
    async fn on_event(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::Startup { scheduler } => self.set_scheduler(scheduler.clone()),
            Event::ScenarioRun(outcome) | Event::ScenarioSkipped(outcome) => {
                self.on_scenario_execute(outcome).await
            }
            Event::ScenarioPassed(outcome) | Event::ScenarioFailed(outcome) => {
                self.on_scenario_end(outcome)
            }
            Event::Cleanup { report } => self.on_cleanup(report),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ExecutionDescription, ScenarioInfo, ScenarioStatus};
    use crate::scheduler::MemoryScheduler;
    use std::sync::Arc;
    use test_case::test_case;

    fn attempt(id: &str, status: ScenarioStatus, marker: &str) -> ScenarioOutcome {
        let mut outcome = ScenarioOutcome::new(ScenarioInfo::new(id, marker, format!("{}.py", id)));
        outcome.status = status;
        outcome
    }

    use ScenarioStatus::{Failed, Passed, Skipped};

    #[test_case(&[Failed, Failed, Passed], Passed, 2 ; "late pass")]
    #[test_case(&[Failed, Failed, Failed], Failed, 2 ; "all failed")]
    #[test_case(&[Passed, Failed], Passed, 0 ; "last passed wins over later failure")]
    #[test_case(&[Skipped, Skipped], Skipped, 1 ; "all skipped falls back to last")]
    #[test_case(&[Skipped, Failed, Skipped], Failed, 1 ; "failure beats skip")]
    fn test_aggregate(statuses: &[ScenarioStatus], expected: ScenarioStatus, index: usize) {
        let attempts: Vec<ScenarioOutcome> = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| attempt("a", *s, &format!("attempt {}", i)))
            .collect();
        let aggregated = aggregate(&attempts).unwrap();
        assert_eq!(aggregated.status(), expected);
        assert_eq!(aggregated.representative.scenario.subject, format!("attempt {}", index));
        assert_eq!(aggregated.attempts.len(), statuses.len());
    }

    #[test]
    fn test_aggregate_empty() {
        assert!(aggregate(&[]).is_none());
    }

    #[test]
    fn test_aggregate_all_groups_by_identity() {
        let attempts = vec![
            attempt("a", Failed, "a0"),
            attempt("b", Passed, "b0"),
            attempt("a", Passed, "a1"),
        ];
        let aggregated = aggregate_all(&attempts);
        assert_eq!(aggregated.len(), 2);
        assert_eq!(aggregated[0].representative.scenario.subject, "a1");
        assert_eq!(aggregated[0].describe(), ExecutionDescription::Flaky);
        assert_eq!(aggregated[1].describe(), ExecutionDescription::Passed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(RerunAggregator::new(RerunConfig { reruns: 0, delay_secs: 1.0 }).is_err());
        assert!(RerunAggregator::new(RerunConfig { reruns: 1, delay_secs: -1.0 }).is_err());
        assert!(RerunAggregator::new(RerunConfig { reruns: 0, delay_secs: 0.0 }).is_ok());
    }

    #[test]
    fn test_reschedules_once_per_scenario() {
        let scheduler = Arc::new(MemoryScheduler::default());
        let mut aggregator = RerunAggregator::new(RerunConfig { reruns: 2, delay_secs: 0.0 }).unwrap();
        aggregator.set_scheduler(scheduler.clone());

        aggregator.on_scenario_end(&attempt("a", Failed, "a"));
        aggregator.on_scenario_end(&attempt("a", Failed, "a"));
        aggregator.on_scenario_end(&attempt("b", Passed, "b"));
        aggregator.on_scenario_end(&attempt("c", Failed, "c"));

        assert_eq!(scheduler.scheduled().len(), 4);
        assert_eq!(aggregator.reran(), 2);
        assert_eq!(aggregator.times(), 4);
        assert_eq!(aggregator.summary(), "rerun 2 scenarios, 4 times");
    }

    #[test]
    fn test_disabled_does_nothing() {
        let scheduler = Arc::new(MemoryScheduler::default());
        let mut aggregator = RerunAggregator::new(RerunConfig::default()).unwrap();
        aggregator.set_scheduler(scheduler.clone());
        aggregator.on_scenario_end(&attempt("a", Failed, "a"));
        assert!(scheduler.scheduled().is_empty());
    }

    #[test]
    fn test_summary_wording() {
        let mut aggregator = RerunAggregator::new(RerunConfig { reruns: 1, delay_secs: 0.5 }).unwrap();
        aggregator.set_scheduler(Arc::new(MemoryScheduler::default()));
        aggregator.on_scenario_end(&attempt("a", Failed, "a"));
        assert_eq!(aggregator.summary(), "rerun 1 scenario, 1 time, with delay 0.5s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_only_before_reruns() {
        let mut aggregator = RerunAggregator::new(RerunConfig { reruns: 1, delay_secs: 2.0 }).unwrap();
        aggregator.set_scheduler(Arc::new(MemoryScheduler::default()));
        let first = attempt("a", Failed, "a");

        let start = tokio::time::Instant::now();
        aggregator.on_scenario_execute(&first).await;
        assert!(start.elapsed() < std::time::Duration::from_secs(1));

        aggregator.on_scenario_end(&first);
        aggregator.on_scenario_execute(&first).await;
        assert!(start.elapsed() >= std::time::Duration::from_secs(2));
    }
}
