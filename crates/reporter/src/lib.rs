//! stepwise reporter
//!
//! Adapts test-framework lifecycle events to the result model of an external
//! test-reporting service:
//! - Records nested ad-hoc steps per thread, with parameters and attachments
//! - Splices those steps into the framework's own steps when a scenario is reported
//! - Reruns failed scenarios and reconciles the attempts into one outcome
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Framework events (Dispatcher)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ResultReporter (Listener)                                  │
//! │    ├── ScenarioRun      -> StepContext::clear_all()         │
//! │    ├── StepRun/Passed   -> current framework step           │
//! │    └── ScenarioReported -> report_result() -> ResultSink    │
//! │  RerunAggregator (Listener)                                 │
//! │    ├── ScenarioFailed   -> Scheduler::schedule() x reruns   │
//! │    └── aggregate(attempts) -> AggregateOutcome              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Step (user code)                                           │
//! │    ├── open() / run() / run_async() / scope()               │
//! │    ├── decorate*() -> StepFn                                │
//! │    └── StepContext (thread-local stack of StepRecords)      │
//! │          └── AttachmentFactory -> ResultSink                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod annotate;
pub mod attachments;
pub mod context;
pub mod events;
pub mod record;
pub mod reporter;
pub mod rerun;
pub mod scheduler;
pub mod sink;
pub mod step;
pub mod title;

pub use annotate::{add_link, add_step_parameter, attach_file, attach_json, attach_screenshot, attach_text};
pub use attachments::AttachmentFactory;
pub use context::{RecordedSteps, StepContext};
pub use events::{
    AggregateOutcome, Artifact, Dispatcher, Event, ExecutionDescription, FrameworkStepOutcome,
    FrameworkStepStatus, Listener, RunReport, ScenarioInfo, ScenarioOutcome, ScenarioStatus,
    ScopeValue,
};
pub use record::{StepRecord, StepRef, StepState};
pub use reporter::ResultReporter;
pub use rerun::{aggregate, aggregate_all, RerunAggregator};
pub use scheduler::{MemoryScheduler, Scheduler, SharedScheduler};
pub use sink::{MemorySink, ResultSink, SharedSink};
pub use step::{step, ActiveScope, ScopedResource, Step, StepFn, StepGuard, StepKind, StepOutcome, StepScope};
pub use title::{format_title, Args, StepArgs};
