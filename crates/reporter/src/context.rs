//! Thread-local step context
//!
//! Tracks the stack of open steps on each thread, the root steps recorded
//! during the current scenario, and which framework step each root step was
//! opened under.
//!
//! A [`StepContext`] is a cheap, cloneable handle. State is keyed by the
//! handle's identity inside a thread-local table, so every thread sees its own
//! independent stack and two distinct contexts never share state. Isolation
//! comes from the thread-local storage, not from locking.
//!
//! A step guard may be closed on a thread other than the one that opened it
//! (an async task resumed on another worker). That thread cannot reach the
//! opener's stack, so entries whose record is already closed are dropped the
//! next time the opener's thread touches its state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::attachments::AttachmentFactory;
use crate::record::{StepRef, StepState};
use crate::sink::SharedSink;

/// Function-name prefixes that mark a framework step
pub const FRAMEWORK_STEP_PREFIXES: [&str; 4] = ["given_", "when_", "then_", "and_"];

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL: Lazy<StepContext> = Lazy::new(StepContext::new);

thread_local! {
    static STATES: RefCell<HashMap<u64, ThreadState>> = RefCell::new(HashMap::new());
}

#[derive(Default)]
struct ThreadState {
    stack: Vec<String>,
    objects: Vec<StepRef>,
    top_level: Vec<StepRef>,
    by_framework_step: HashMap<String, Vec<StepRef>>,
    current_framework_step: Option<String>,
    framework_step_from_event: bool,
}

impl ThreadState {
    /// Drop stack entries whose record was closed from another thread
    fn prune_closed(&mut self) {
        if self
            .objects
            .iter()
            .all(|record| record.lock().state == StepState::Running)
        {
            return;
        }
        let (stack, objects): (Vec<_>, Vec<_>) = self
            .stack
            .drain(..)
            .zip(self.objects.drain(..))
            .filter(|(id, record)| {
                let running = record.lock().state == StepState::Running;
                if !running {
                    debug!("Dropping step {} closed on another thread", id);
                }
                running
            })
            .unzip();
        self.stack = stack;
        self.objects = objects;
    }
}

struct Inner {
    id: u64,
    attachments: RwLock<Option<AttachmentFactory>>,
    detect_framework_steps: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Other threads' entries are released when those threads exit
        let _ = STATES.try_with(|states| {
            if let Ok(mut states) = states.try_borrow_mut() {
                states.remove(&self.id);
            }
        });
    }
}

/// Handle to a thread-local step context
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("id", &self.inner.id)
            .field("depth", &self.depth())
            .finish()
    }
}

impl Default for StepContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Root steps recorded on one thread during a scenario
#[derive(Debug, Clone, Default)]
pub struct RecordedSteps {
    /// Root steps in open order
    pub top_level: Vec<StepRef>,

    /// Root steps grouped by the framework step that was current when they opened
    pub by_framework_step: HashMap<String, Vec<StepRef>>,
}

impl RecordedSteps {
    pub fn is_empty(&self) -> bool {
        self.top_level.is_empty()
    }

    /// Whether any root step was tagged with a framework step
    pub fn is_grouped(&self) -> bool {
        !self.by_framework_step.is_empty()
    }

    /// Root steps that were not tagged with any framework step, in open order
    pub fn ungrouped(&self) -> Vec<StepRef> {
        self.top_level
            .iter()
            .filter(|step| {
                !self
                    .by_framework_step
                    .values()
                    .flatten()
                    .any(|grouped| Arc::ptr_eq(grouped, *step))
            })
            .cloned()
            .collect()
    }
}

impl StepContext {
    /// Create an independent context
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                attachments: RwLock::new(None),
                detect_framework_steps: AtomicBool::new(true),
            }),
        }
    }

    /// The process-wide context used by the free-standing step helpers
    pub fn global() -> &'static StepContext {
        &GLOBAL
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ThreadState) -> R) -> R {
        STATES.with(|states| {
            let mut states = states.borrow_mut();
            let state = states.entry(self.inner.id).or_default();
            state.prune_closed();
            f(state)
        })
    }

    /// Route attachment bodies created through this context to `sink`
    pub fn set_sink(&self, sink: SharedSink) {
        *self.inner.attachments.write() = Some(AttachmentFactory::new(sink));
    }

    pub fn attachments(&self) -> Option<AttachmentFactory> {
        self.inner.attachments.read().clone()
    }

    pub fn set_detect_framework_steps(&self, enabled: bool) {
        self.inner
            .detect_framework_steps
            .store(enabled, Ordering::Relaxed);
    }

    pub fn detects_framework_steps(&self) -> bool {
        self.inner.detect_framework_steps.load(Ordering::Relaxed)
    }

    /// Id of the innermost open step on this thread
    pub fn current_step_id(&self) -> Option<String> {
        self.with_state(|s| s.stack.last().cloned())
    }

    /// Record of the innermost open step on this thread
    pub fn current_step_object(&self) -> Option<StepRef> {
        self.with_state(|s| s.objects.last().cloned())
    }

    /// Number of open steps on this thread
    pub fn depth(&self) -> usize {
        self.with_state(|s| s.stack.len())
    }

    pub fn push(&self, id: impl Into<String>, record: StepRef) {
        let id = id.into();
        self.with_state(|s| {
            trace!(depth = s.stack.len() + 1, "push step {}", id);
            s.stack.push(id);
            s.objects.push(record);
        });
    }

    /// Remove the innermost open step; `None` when nothing is open
    pub fn pop(&self) -> Option<StepRef> {
        self.with_state(|s| {
            let id = s.stack.pop()?;
            trace!(depth = s.stack.len(), "pop step {}", id);
            s.objects.pop()
        })
    }

    /// Remove the open step `id` from this thread's stack, wherever it sits.
    ///
    /// Returns the removed record and whether it was the innermost step, or
    /// `None` when `id` is not open on this thread.
    pub fn remove(&self, id: &str) -> Option<(StepRef, bool)> {
        self.with_state(|s| {
            let index = s.stack.iter().rposition(|open| open == id)?;
            let innermost = index + 1 == s.stack.len();
            s.stack.remove(index);
            trace!(depth = s.stack.len(), "remove step {}", id);
            Some((s.objects.remove(index), innermost))
        })
    }

    /// Record a root step, grouping it under the current framework step if one is set
    pub fn record_top_level(&self, record: StepRef) {
        self.with_state(|s| {
            if let Some(name) = &s.current_framework_step {
                s.by_framework_step
                    .entry(name.clone())
                    .or_default()
                    .push(record.clone());
            }
            s.top_level.push(record);
        });
    }

    /// Set the current framework step as announced by a framework event.
    ///
    /// While an announced step is current, opening a step skips the
    /// call-stack probe.
    pub fn set_current_framework_step(&self, name: impl Into<String>) {
        let name = name.into();
        self.with_state(|s| {
            s.current_framework_step = Some(name);
            s.framework_step_from_event = true;
        });
    }

    /// Set the current framework step as found on the call stack
    pub fn set_detected_framework_step(&self, name: impl Into<String>) {
        let name = name.into();
        self.with_state(|s| {
            s.current_framework_step = Some(name);
            s.framework_step_from_event = false;
        });
    }

    pub fn clear_current_framework_step(&self) {
        self.with_state(|s| {
            s.current_framework_step = None;
            s.framework_step_from_event = false;
        });
    }

    /// Whether the current framework step came from a framework event
    pub fn framework_step_announced(&self) -> bool {
        self.with_state(|s| s.framework_step_from_event)
    }

    pub fn current_framework_step(&self) -> Option<String> {
        self.with_state(|s| s.current_framework_step.clone())
    }

    /// Root steps recorded on this thread, in open order
    pub fn top_level_records(&self) -> Vec<StepRef> {
        self.with_state(|s| s.top_level.clone())
    }

    pub fn records_by_framework_step(&self) -> HashMap<String, Vec<StepRef>> {
        self.with_state(|s| s.by_framework_step.clone())
    }

    /// Snapshot of everything recorded on this thread
    pub fn recorded_steps(&self) -> RecordedSteps {
        self.with_state(|s| RecordedSteps {
            top_level: s.top_level.clone(),
            by_framework_step: s.by_framework_step.clone(),
        })
    }

    /// Reset this thread's state. Call once per scenario before its steps run.
    pub fn clear_all(&self) {
        self.with_state(|s| {
            if !s.stack.is_empty() {
                debug!("Clearing step context with {} open step(s)", s.stack.len());
            }
            *s = ThreadState::default();
        });
    }
}

/// Guess the framework step currently executing by walking the call stack.
///
/// Looks for the innermost frame whose function name starts with one of
/// [`FRAMEWORK_STEP_PREFIXES`] and returns it with underscores turned into
/// spaces. Returns `None` when no such frame is found or symbols are
/// unavailable.
pub fn probe_framework_step() -> Option<String> {
    let backtrace = std::backtrace::Backtrace::force_capture();
    if backtrace.status() != std::backtrace::BacktraceStatus::Captured {
        debug!("Call stack unavailable, skipping framework step detection");
        return None;
    }
    framework_step_from_backtrace(&backtrace.to_string())
}

/// Parse a rendered backtrace for the innermost framework-step frame
pub fn framework_step_from_backtrace(rendered: &str) -> Option<String> {
    rendered
        .lines()
        .filter_map(frame_symbol)
        .filter(|symbol| !is_runtime_symbol(symbol))
        .filter_map(function_name)
        .find(|name| FRAMEWORK_STEP_PREFIXES.iter().any(|p| name.starts_with(p)))
        .map(|name| name.replace('_', " "))
}

/// `"  12: some::path::func"` -> `"some::path::func"`
fn frame_symbol(line: &str) -> Option<&str> {
    let (index, symbol) = line.trim_start().split_once(": ")?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(symbol.trim())
}

fn is_runtime_symbol(symbol: &str) -> bool {
    const RUNTIME: [&str; 5] = ["core::", "std::", "alloc::", "stepwise_reporter::", "tokio::"];
    let path = symbol.trim_start_matches('<');
    RUNTIME.iter().any(|prefix| path.starts_with(prefix))
}

/// Last path segment that names a function, skipping closures and hashes
fn function_name(symbol: &str) -> Option<String> {
    symbol
        .rsplit("::")
        .find(|segment| {
            !segment.starts_with("{{")
                && !(segment.len() == 17
                    && segment.starts_with('h')
                    && segment[1..].chars().all(|c| c.is_ascii_hexdigit()))
        })
        .map(|segment| segment.trim_end_matches('>').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StepRecord;

    fn record(title: &str) -> StepRef {
        StepRecord::new(format!("id-{}", title), title, Vec::new()).into_ref()
    }

    #[test]
    fn test_initial_state() {
        let ctx = StepContext::new();
        assert_eq!(ctx.current_step_id(), None);
        assert!(ctx.current_step_object().is_none());
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_push_pop_restores_parent() {
        let ctx = StepContext::new();
        ctx.push("outer", record("outer"));
        ctx.push("inner", record("inner"));
        assert_eq!(ctx.depth(), 2);
        assert_eq!(ctx.current_step_id().as_deref(), Some("inner"));

        let popped = ctx.pop().unwrap();
        assert_eq!(popped.lock().title, "inner");
        assert_eq!(ctx.current_step_id().as_deref(), Some("outer"));

        ctx.pop();
        assert_eq!(ctx.current_step_id(), None);
        assert!(ctx.pop().is_none());
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_record_top_level_groups_by_framework_step() {
        let ctx = StepContext::new();
        ctx.record_top_level(record("before"));
        ctx.set_current_framework_step("given user");
        ctx.record_top_level(record("create user"));
        ctx.set_current_framework_step("when login");
        ctx.record_top_level(record("submit form"));

        let recorded = ctx.recorded_steps();
        assert_eq!(recorded.top_level.len(), 3);
        assert_eq!(recorded.by_framework_step["given user"].len(), 1);
        assert_eq!(recorded.by_framework_step["when login"][0].lock().title, "submit form");

        let ungrouped = recorded.ungrouped();
        assert_eq!(ungrouped.len(), 1);
        assert_eq!(ungrouped[0].lock().title, "before");
    }

    #[test]
    fn test_clear_all_resets_everything() {
        let ctx = StepContext::new();
        ctx.set_current_framework_step("given user");
        ctx.push("a", record("a"));
        ctx.record_top_level(record("a"));
        ctx.clear_all();

        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.current_step_id(), None);
        assert_eq!(ctx.current_framework_step(), None);
        assert!(ctx.top_level_records().is_empty());
        assert!(ctx.records_by_framework_step().is_empty());
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = StepContext::new();
        let b = StepContext::new();
        a.push("a", record("a"));
        assert_eq!(b.depth(), 0);
        assert_eq!(a.clone().depth(), 1);
    }

    #[test]
    fn test_thread_isolation() {
        let ctx = StepContext::new();
        ctx.push("main", record("main"));
        ctx.record_top_level(record("main"));

        let other = ctx.clone();
        std::thread::spawn(move || {
            assert_eq!(other.depth(), 0);
            assert!(other.current_step_object().is_none());
            assert!(other.top_level_records().is_empty());
        })
        .join()
        .unwrap();

        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn test_remove_by_id() {
        let ctx = StepContext::new();
        ctx.push("outer", record("outer"));
        ctx.push("inner", record("inner"));

        let (removed, innermost) = ctx.remove("outer").unwrap();
        assert_eq!(removed.lock().title, "outer");
        assert!(!innermost);
        assert_eq!(ctx.depth(), 1);
        assert_eq!(ctx.current_step_id().as_deref(), Some("inner"));

        assert!(ctx.remove("outer").is_none());
        let (_, innermost) = ctx.remove("inner").unwrap();
        assert!(innermost);
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_records_closed_elsewhere_are_pruned() {
        let ctx = StepContext::new();
        let outer = record("outer");
        let inner = record("inner");
        ctx.push("outer", outer.clone());
        ctx.push("inner", inner.clone());

        inner.lock().close(None);
        assert_eq!(ctx.depth(), 1);
        assert_eq!(ctx.current_step_id().as_deref(), Some("outer"));

        outer.lock().close(None);
        assert_eq!(ctx.depth(), 0);
        assert!(ctx.current_step_object().is_none());
    }

    #[test]
    fn test_framework_step_from_backtrace() {
        let rendered = "\
   0: std::backtrace::Backtrace::force_capture
             at /rustc/library/std/src/backtrace.rs:312:13
   1: stepwise_reporter::context::probe_framework_step
   2: core::option::Option<T>::and_then
   3: shop_tests::login::Scenario::when_user_logs_in::{{closure}}
   4: shop_tests::login::Scenario::given_user::h0123456789abcdef
   5: main";
        assert_eq!(
            framework_step_from_backtrace(rendered).as_deref(),
            Some("when user logs in")
        );
    }

    #[test]
    fn test_framework_step_absent() {
        let rendered = "   0: app::run\n   1: main";
        assert_eq!(framework_step_from_backtrace(rendered), None);
    }
}
