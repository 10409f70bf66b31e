//! Step unit
//!
//! A [`Step`] opens a [`StepRecord`] on the thread's step context, nests it
//! under the innermost open step (or records it as a root step), and closes it
//! as passed or failed when the wrapped work finishes. It can be used as a
//! scoped block ([`Step::open`]), around a closure or future ([`Step::run`],
//! [`Step::run_async`]), around a scoped resource ([`Step::scope`]), or turned
//! into a reusable wrapper around a function ([`Step::decorate`] and friends).
//!
//! Failures of the wrapped work are recorded and then handed back unchanged:
//! errors are returned as-is and panics are resumed with the original payload.

use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use futures::FutureExt;
use stepwise_common::{digest, Failure, Parameter};
use tracing::{debug, warn};

use crate::context::{probe_framework_step, StepContext};
use crate::record::{StepRecord, StepRef};
use crate::title::{format_title, Args, StepArgs};

/// Start building a step on the global context
pub fn step(title: impl Into<String>) -> Step {
    Step::new(title)
}

/// Values that tell whether the wrapped work failed
pub trait StepOutcome {
    fn failure(&self) -> Option<Failure>;
}

impl<T, E: Display> StepOutcome for Result<T, E> {
    fn failure(&self) -> Option<Failure> {
        self.as_ref().err().map(|e| Failure::from_error(e))
    }
}

impl StepOutcome for () {
    fn failure(&self) -> Option<Failure> {
        None
    }
}

/// What kind of function a [`StepFn`] wraps; fixed when the wrapper is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Plain synchronous function
    Function,
    /// Function returning a future; the step stays open until it resolves
    Async,
    /// Function returning a [`ScopedResource`]
    Scope,
    /// Function returning an iterator; only the call itself is bracketed
    Generator,
}

/// A step that has not been opened yet
#[derive(Debug, Clone)]
pub struct Step {
    title: String,
    parameters: Vec<Parameter>,
    context: StepContext,
}

impl Step {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            parameters: Vec::new(),
            context: StepContext::global().clone(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    /// Render the title from `args` and add one parameter per call argument
    pub fn with_args(mut self, args: &Args) -> Self {
        self.title = format_title(&self.title, args);
        self.parameters.extend(args.parameters());
        self
    }

    /// Record into `context` instead of the global one
    pub fn in_context(mut self, context: &StepContext) -> Self {
        self.context = context.clone();
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Open the step and return a guard that closes it.
    pub fn open(self) -> StepGuard {
        let Step {
            title,
            parameters,
            context,
        } = self;

        let id = digest::new_uuid();
        let record = StepRecord::new(id.clone(), title, parameters).into_ref();

        if context.detects_framework_steps() && !context.framework_step_announced() {
            if let Some(name) = probe_framework_step() {
                context.set_detected_framework_step(name);
            }
        }

        // Parent must be read before the push
        let parent = context.current_step_object();
        context.push(id.clone(), record.clone());
        match parent {
            Some(parent) => parent.lock().children.push(record.clone()),
            None => context.record_top_level(record.clone()),
        }

        let depth = context.depth();
        debug!(depth, "Opened step '{}'", record.lock().title);

        StepGuard {
            id,
            record,
            context,
            opener: thread::current().id(),
            finished: false,
        }
    }

    /// Run `f` inside the step
    pub fn run<R, F>(self, f: F) -> R
    where
        F: FnOnce() -> R,
        R: StepOutcome,
    {
        self.bracket(f, StepOutcome::failure)
    }

    /// Await `fut` inside the step; the step stays open across every suspension
    pub async fn run_async<Fut>(self, fut: Fut) -> Fut::Output
    where
        Fut: Future,
        Fut::Output: StepOutcome,
    {
        let guard = self.open();
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(output) => {
                guard.finish(output.failure().as_ref());
                output
            }
            Err(payload) => {
                guard.fail(&Failure::from_panic(payload.as_ref()));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Wrap an existing scoped resource
    pub fn scope<S: ScopedResource>(self, resource: S) -> StepScope<S> {
        StepScope {
            step: self,
            resource,
        }
    }

    pub fn decorate<F>(self, func: F) -> StepFn<F> {
        StepFn::new(self, StepKind::Function, func)
    }

    pub fn decorate_async<F>(self, func: F) -> StepFn<F> {
        StepFn::new(self, StepKind::Async, func)
    }

    pub fn decorate_scope<F>(self, func: F) -> StepFn<F> {
        StepFn::new(self, StepKind::Scope, func)
    }

    pub fn decorate_generator<F>(self, func: F) -> StepFn<F> {
        StepFn::new(self, StepKind::Generator, func)
    }

    fn bracket<R, F>(self, f: F, failure_of: impl FnOnce(&R) -> Option<Failure>) -> R
    where
        F: FnOnce() -> R,
    {
        let guard = self.open();
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(output) => {
                guard.finish(failure_of(&output).as_ref());
                output
            }
            Err(payload) => {
                guard.fail(&Failure::from_panic(payload.as_ref()));
                panic::resume_unwind(payload)
            }
        }
    }
}

/// An open step. Closing it removes it from the opening thread's context.
///
/// Dropping an unfinished guard closes the step: as failed while the thread
/// is panicking, as passed otherwise. A guard closed on another thread only
/// closes the record; the opening thread drops the stale entry itself.
#[derive(Debug)]
pub struct StepGuard {
    id: String,
    record: StepRef,
    context: StepContext,
    opener: ThreadId,
    finished: bool,
}

impl StepGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn record(&self) -> &StepRef {
        &self.record
    }

    pub fn pass(self) {
        self.finish(None)
    }

    pub fn fail(self, failure: &Failure) {
        self.finish(Some(failure))
    }

    pub fn finish(mut self, failure: Option<&Failure>) {
        self.close(failure);
    }

    fn close(&mut self, failure: Option<&Failure>) {
        if self.finished {
            return;
        }
        self.finished = true;

        if thread::current().id() != self.opener {
            debug!("Step {} closed away from the thread that opened it", self.id);
        } else {
            match self.context.remove(&self.id) {
                Some((_, true)) => {}
                Some((_, false)) => {
                    warn!("Step {} closed while it was not the innermost open step", self.id)
                }
                None => debug!("Step {} was no longer on the step stack", self.id),
            }
        }

        self.record.lock().close(failure);

        debug!(
            depth = self.context.depth(),
            failed = failure.is_some(),
            "Closed step {}",
            self.id
        );
    }
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if std::thread::panicking() {
            self.close(Some(&Failure::new("panic", "step unwound by a panic")));
        } else {
            self.close(None);
        }
    }
}

/// A resource with explicit enter and exit, like a guard-returning factory
pub trait ScopedResource {
    type Value;
    type Error: Display;

    fn enter(&mut self) -> Result<Self::Value, Self::Error>;

    /// `failure` describes how the body ended, if it failed
    fn exit(&mut self, failure: Option<&Failure>) -> Result<(), Self::Error>;
}

/// A scoped resource bracketed by a step that has not been entered yet
pub struct StepScope<S> {
    step: Step,
    resource: S,
}

impl<S: ScopedResource> StepScope<S> {
    /// Open the step, then enter the resource.
    ///
    /// If entering fails the step is closed as failed and the error returned.
    pub fn enter(self) -> Result<(ActiveScope<S>, S::Value), S::Error> {
        let StepScope { step, mut resource } = self;
        let guard = step.open();
        match resource.enter() {
            Ok(value) => Ok((
                ActiveScope {
                    guard: Some(guard),
                    resource,
                },
                value,
            )),
            Err(e) => {
                guard.fail(&Failure::from_error(&e));
                Err(e)
            }
        }
    }

    /// Enter, run `body` with the entered value, then exit.
    ///
    /// The body's failure is passed to the resource's exit and recorded on the
    /// step. A panicking body still exits the resource before the panic is
    /// resumed.
    pub fn run<R, F>(self, body: F) -> Result<R, S::Error>
    where
        F: FnOnce(&mut S::Value) -> R,
        R: StepOutcome,
    {
        let (active, mut value) = self.enter()?;
        match panic::catch_unwind(AssertUnwindSafe(|| body(&mut value))) {
            Ok(output) => {
                active.exit(output.failure().as_ref())?;
                Ok(output)
            }
            Err(payload) => {
                let failure = Failure::from_panic(payload.as_ref());
                if let Err(e) = active.exit(Some(&failure)) {
                    warn!("Scope exit failed while unwinding: {}", e);
                }
                panic::resume_unwind(payload)
            }
        }
    }
}

/// An entered scope; exit it to close the resource and then the step
pub struct ActiveScope<S: ScopedResource> {
    guard: Option<StepGuard>,
    resource: S,
}

impl<S: ScopedResource> ActiveScope<S> {
    pub fn step_id(&self) -> Option<&str> {
        self.guard.as_ref().map(StepGuard::id)
    }

    /// Exit the resource, then close the step.
    ///
    /// An exit error closes the step as failed and is returned.
    pub fn exit(mut self, failure: Option<&Failure>) -> Result<(), S::Error> {
        let guard = self.guard.take();
        match self.resource.exit(failure) {
            Ok(()) => {
                if let Some(guard) = guard {
                    guard.finish(failure);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(guard) = guard {
                    guard.fail(&Failure::from_error(&e));
                }
                Err(e)
            }
        }
    }
}

impl<S: ScopedResource> Drop for ActiveScope<S> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let failure = std::thread::panicking()
            .then(|| Failure::new("panic", "scope unwound by a panic"));
        match self.resource.exit(failure.as_ref()) {
            Ok(()) => guard.finish(failure.as_ref()),
            Err(e) => {
                warn!("Scope exit failed on drop: {}", e);
                guard.fail(&Failure::from_error(&e));
            }
        }
    }
}

/// A function wrapped in a step, with the title rendered per call
#[derive(Debug, Clone)]
pub struct StepFn<F> {
    template: Step,
    kind: StepKind,
    func: F,
}

impl<F> StepFn<F> {
    fn new(template: Step, kind: StepKind, func: F) -> Self {
        Self {
            template,
            kind,
            func,
        }
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    fn instantiate<A: StepArgs>(&self, args: &A) -> Step {
        self.template.clone().with_args(&args.step_args())
    }

    fn expect_kind(&self, expected: StepKind) {
        if self.kind != expected {
            warn!(
                "Step '{}' built as {:?} but invoked as {:?}",
                self.template.title, self.kind, expected
            );
        }
    }

    /// Call a [`StepKind::Function`] wrapper
    pub fn call<A, R>(&self, args: A) -> R
    where
        F: Fn(A) -> R,
        A: StepArgs,
        R: StepOutcome,
    {
        self.expect_kind(StepKind::Function);
        let step = self.instantiate(&args);
        step.run(|| (self.func)(args))
    }

    /// Call a [`StepKind::Async`] wrapper
    pub async fn call_async<A, Fut>(&self, args: A) -> Fut::Output
    where
        F: Fn(A) -> Fut,
        A: StepArgs,
        Fut: Future,
        Fut::Output: StepOutcome,
    {
        self.expect_kind(StepKind::Async);
        let step = self.instantiate(&args);
        step.run_async((self.func)(args)).await
    }

    /// Build the resource of a [`StepKind::Scope`] wrapper, bracketed by the step
    pub fn scope<A, S>(&self, args: A) -> StepScope<S>
    where
        F: Fn(A) -> S,
        A: StepArgs,
        S: ScopedResource,
    {
        self.expect_kind(StepKind::Scope);
        let step = self.instantiate(&args);
        step.scope((self.func)(args))
    }

    /// Call a [`StepKind::Generator`] wrapper; iteration happens outside the step
    pub fn call_generator<A, I>(&self, args: A) -> I
    where
        F: Fn(A) -> I,
        A: StepArgs,
        I: Iterator,
    {
        self.expect_kind(StepKind::Generator);
        let step = self.instantiate(&args);
        step.bracket(|| (self.func)(args), |_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StepState;
    use stepwise_common::Status;

    fn ctx() -> StepContext {
        let ctx = StepContext::new();
        ctx.set_detect_framework_steps(false);
        ctx
    }

    #[test]
    fn test_open_returns_id_and_pushes() {
        let ctx = ctx();
        let guard = Step::new("Verify user").in_context(&ctx).open();
        assert_eq!(ctx.current_step_id().as_deref(), Some(guard.id()));
        assert_eq!(ctx.depth(), 1);

        guard.pass();
        assert_eq!(ctx.depth(), 0);
        let recorded = ctx.top_level_records();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].lock().state, StepState::Passed);
    }

    #[test]
    fn test_nested_child_attaches_to_parent() {
        let ctx = ctx();
        let parent = Step::new("parent").in_context(&ctx).open();
        Step::new("child")
            .in_context(&ctx)
            .run(|| Ok::<_, String>(()))
            .unwrap();
        parent.pass();

        let roots = ctx.top_level_records();
        assert_eq!(roots.len(), 1);
        let root = roots[0].lock();
        assert_eq!(root.title, "parent");
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].lock().title, "child");
    }

    #[test]
    fn test_run_error_marks_failed_and_returns_error() {
        let ctx = ctx();
        let result: Result<(), String> = Step::new("Failing step")
            .in_context(&ctx)
            .run(|| Err("Test error".to_string()));
        assert_eq!(result, Err("Test error".to_string()));

        let record = ctx.top_level_records()[0].lock().snapshot();
        assert_eq!(record.status, Status::Failed);
        assert_eq!(record.status_details.unwrap().message, "Test error");
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_run_panic_is_recorded_and_resumed() {
        let ctx = ctx();
        let inner = ctx.clone();
        let caught = panic::catch_unwind::<_, ()>(AssertUnwindSafe(|| {
            Step::new("outer").in_context(&inner).run(|| {
                Step::new("inner").in_context(&inner).run(|| {
                    panic!("deep failure");
                })
            })
        }));

        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"deep failure"));
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.current_step_id(), None);

        let outer = ctx.top_level_records()[0].lock().snapshot();
        assert_eq!(outer.status, Status::Failed);
        assert_eq!(outer.steps[0].status, Status::Failed);
        assert_eq!(outer.steps[0].status_details.as_ref().unwrap().message, "deep failure");
    }

    #[test]
    fn test_dropped_guard_closes_as_passed() {
        let ctx = ctx();
        {
            let _guard = Step::new("scoped").in_context(&ctx).open();
            assert_eq!(ctx.depth(), 1);
        }
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.top_level_records()[0].lock().state, StepState::Passed);
    }

    #[test]
    fn test_with_args_renders_title_and_parameters() {
        let step = Step::new("Process {count} items with method {method}")
            .with_args(&Args::new().arg("count", 5).arg("method", "batch"));
        assert_eq!(step.title(), "Process 5 items with method batch");
        assert_eq!(step.parameters().len(), 2);
    }

    #[test]
    fn test_decorated_function() {
        let ctx = ctx();
        let login = Step::new("Login as {username}")
            .in_context(&ctx)
            .decorate(|args: Args| -> Result<String, String> {
                Ok(args.lookup("username").unwrap_or_default().to_uppercase())
            });
        assert_eq!(login.kind(), StepKind::Function);

        let out = login.call(Args::new().arg("username", "alice")).unwrap();
        assert_eq!(out, "ALICE");
        login.call(Args::new().arg("username", "bob")).unwrap();

        let titles: Vec<String> = ctx
            .top_level_records()
            .iter()
            .map(|r| r.lock().title.clone())
            .collect();
        assert_eq!(titles, vec!["Login as alice", "Login as bob"]);
    }

    #[test]
    fn test_generator_brackets_only_the_call() {
        let ctx = ctx();
        let numbers = Step::new("Produce {arg0} numbers")
            .in_context(&ctx)
            .decorate_generator(|args: Args| {
                let n: usize = args.lookup("arg0").and_then(|v| v.parse().ok()).unwrap_or(0);
                0..n
            });

        let iter = numbers.call_generator(Args::new().positional(3));
        assert_eq!(ctx.depth(), 0);
        assert_eq!(iter.sum::<usize>(), 3);
        assert_eq!(ctx.top_level_records()[0].lock().title, "Produce 3 numbers");
    }

    struct Session {
        log: Vec<&'static str>,
        fail_enter: bool,
        fail_exit: bool,
    }

    impl Session {
        fn new() -> Self {
            Self { log: Vec::new(), fail_enter: false, fail_exit: false }
        }
    }

    impl ScopedResource for Session {
        type Value = u32;
        type Error = String;

        fn enter(&mut self) -> Result<u32, String> {
            self.log.push("enter");
            if self.fail_enter {
                Err("cannot connect".to_string())
            } else {
                Ok(7)
            }
        }

        fn exit(&mut self, _failure: Option<&Failure>) -> Result<(), String> {
            self.log.push("exit");
            if self.fail_exit {
                Err("cannot disconnect".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_scope_brackets_enter_and_exit() {
        let ctx = ctx();
        let result = Step::new("session")
            .in_context(&ctx)
            .scope(Session::new())
            .run(|value| {
                assert_eq!(*value, 7);
                Ok::<_, String>(())
            });
        assert!(result.is_ok());
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.top_level_records()[0].lock().state, StepState::Passed);
    }

    #[test]
    fn test_scope_enter_failure_closes_step() {
        let ctx = ctx();
        let mut session = Session::new();
        session.fail_enter = true;
        let err = Step::new("session").in_context(&ctx).scope(session).enter().err();
        assert_eq!(err.as_deref(), Some("cannot connect"));
        assert_eq!(ctx.depth(), 0);

        let record = ctx.top_level_records()[0].lock().snapshot();
        assert_eq!(record.status, Status::Failed);
        assert_eq!(record.status_details.unwrap().message, "cannot connect");
    }

    #[test]
    fn test_scope_exit_failure_closes_step() {
        let ctx = ctx();
        let mut session = Session::new();
        session.fail_exit = true;
        let (active, _value) = Step::new("session").in_context(&ctx).scope(session).enter().unwrap();
        assert!(active.step_id().is_some());
        assert_eq!(active.exit(None).unwrap_err(), "cannot disconnect");

        let record = ctx.top_level_records()[0].lock().snapshot();
        assert_eq!(record.status, Status::Failed);
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_decorated_scope_factory() {
        let ctx = ctx();
        let connect = Step::new("Connect to {host}")
            .in_context(&ctx)
            .decorate_scope(|_args: Args| Session::new());
        let (active, value) = connect.scope(Args::new().arg("host", "db")).enter().unwrap();
        assert_eq!(value, 7);
        assert_eq!(ctx.depth(), 1);
        active.exit(None).unwrap();

        assert_eq!(ctx.top_level_records()[0].lock().title, "Connect to db");
    }

    #[tokio::test]
    async fn test_async_step_stays_open_across_await() {
        let ctx = ctx();
        let inner = ctx.clone();
        let out = Step::new("async work")
            .in_context(&ctx)
            .run_async(async move {
                tokio::task::yield_now().await;
                assert_eq!(inner.depth(), 1);
                Ok::<_, String>(42)
            })
            .await;
        assert_eq!(out, Ok(42));
        assert_eq!(ctx.depth(), 0);
    }

    #[tokio::test]
    async fn test_decorated_async_failure() {
        let ctx = ctx();
        let fetch = Step::new("Fetch {id}")
            .in_context(&ctx)
            .decorate_async(|_args: Args| async { Err::<(), _>("not found") });
        let result = fetch.call_async(Args::new().arg("id", 9)).await;
        assert_eq!(result, Err("not found"));

        let record = ctx.top_level_records()[0].lock().snapshot();
        assert_eq!(record.name, "Fetch 9");
        assert_eq!(record.status, Status::Failed);
    }
}
