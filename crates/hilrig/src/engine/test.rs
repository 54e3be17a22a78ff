//! Tests: single, expect and interact variants with retry and result checks.
//!
//! `run` makes up to `max_retry` attempts. An attempt that errors marks the
//! test BROKEN, fires `TestFatal` and is retried after `retry_delay`; the
//! first clean attempt ends the loop. Action failures (nonzero exit status,
//! out-of-window readings) are results, not errors, and are never retried.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::action::Action;
use super::error::error_chain;
use super::sink::ResultRecord;
use super::spec::{ActionSpec, TestKindSpec, TestSpec};
use super::status::Status;
use super::{Bench, EngineError, NodeCore, Recipient, lock_or_recover};
use crate::bridge::protocol::{Address, CommandResponse, RecipientType};
use crate::event::EventKind;
use crate::router::{self, CommandTable, Commandable};

/// Variant-specific execution plan, fixed at load.
#[derive(Debug, Clone)]
pub enum TestKind {
    Single,
    Expect(ExpectPlan),
    Interact(InteractPrompt),
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Single => "single",
            TestKind::Expect(_) => "expect",
            TestKind::Interact(_) => "interact",
        }
    }
}

/// Indices point into the test's action list.
#[derive(Debug, Clone)]
pub struct ExpectPlan {
    changers: Vec<(usize, Vec<Value>)>,
    checkers: Vec<(usize, Vec<Value>)>,
    iterations: usize,
    tolerance: f64,
    settle: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct InteractPrompt {
    prompt: String,
    pass_label: String,
    fail_label: String,
}

/// One checker reading against its expected value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub action: String,
    pub iteration: usize,
    pub expected: Value,
    pub actual: Value,
    pub tolerance: f64,
    pub passed: bool,
}

#[derive(Debug)]
pub struct Test {
    name: String,
    index: usize,
    shortdesc: String,
    refdes: String,
    valid: bool,
    max_retry: u32,
    retry_delay: Duration,
    kind: TestKind,
    core: NodeCore,
    actions: Mutex<Vec<Arc<Action>>>,
    comparisons: Mutex<Vec<Comparison>>,
    attempts: AtomicU32,
}

impl Test {
    /// Factory: the declared `type` picks the variant once, here.
    pub(crate) fn new(
        bench: &Bench,
        uut: &Address,
        index: usize,
        spec: &TestSpec,
    ) -> Result<Arc<Self>, EngineError> {
        let address = uut.clone().test(index);
        let (kind, action_specs): (TestKind, Vec<&ActionSpec>) = match &spec.kind {
            TestKindSpec::Single { actions } => (TestKind::Single, actions.iter().collect()),
            TestKindSpec::Expect {
                statechangers,
                statecheckers,
                tolerance,
                timeout,
            } => {
                let changers = statechangers
                    .iter()
                    .enumerate()
                    .map(|(i, a)| (i, a.values.clone()))
                    .collect();
                let checkers = statecheckers
                    .iter()
                    .enumerate()
                    .map(|(i, a)| (statechangers.len() + i, a.values.clone()))
                    .collect();
                let plan = ExpectPlan {
                    changers,
                    checkers,
                    iterations: statecheckers.first().map(|a| a.values.len()).unwrap_or(0),
                    tolerance: *tolerance,
                    settle: timeout
                        .filter(|t| *t > 0.0)
                        .map(Duration::from_secs_f64),
                };
                (
                    TestKind::Expect(plan),
                    statechangers.iter().chain(statecheckers).collect(),
                )
            }
            TestKindSpec::Interact {
                prompt,
                pass_label,
                fail_label,
            } => (
                TestKind::Interact(InteractPrompt {
                    prompt: prompt.clone(),
                    pass_label: pass_label.clone(),
                    fail_label: fail_label.clone(),
                }),
                Vec::new(),
            ),
        };

        let test = Arc::new(Self {
            name: spec.name.clone(),
            index,
            shortdesc: spec.shortdesc.clone(),
            refdes: spec.refdes.clone(),
            valid: spec.valid,
            max_retry: spec.max_retry.max(1),
            retry_delay: spec.retry_delay(),
            kind,
            core: NodeCore::new(address, bench.events().clone()),
            actions: Mutex::new(Vec::with_capacity(action_specs.len())),
            comparisons: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
        });
        bench
            .registry()
            .insert(test.address().clone(), Recipient::Test(Arc::clone(&test)))?;
        test.core.fire(
            test.core
                .event(EventKind::TestInit)
                .with("name", test.name.as_str())
                .with("type", test.kind.as_str())
                .with("shortdesc", test.shortdesc.as_str())
                .with("refdes", test.refdes.as_str()),
        );

        for (i, action_spec) in action_specs.into_iter().enumerate() {
            match Action::new(bench, test.address(), i, action_spec) {
                Ok(action) => lock_or_recover(&test.actions, "test actions").push(action),
                Err(e) => {
                    test.destroy(bench);
                    return Err(e);
                }
            }
        }

        let valid = if test.valid { Status::VALID } else { Status::NONE };
        test.core.fire_status(Status::READY | valid, Status::INIT);
        test.core.fire(test.core.event(EventKind::TestReady));
        Ok(test)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> &TestKind {
        &self.kind
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn address(&self) -> &Address {
        self.core.address()
    }

    pub fn status(&self) -> Status {
        self.core.status()
    }

    pub fn actions(&self) -> Vec<Arc<Action>> {
        lock_or_recover(&self.actions, "test actions").clone()
    }

    pub fn comparisons(&self) -> Vec<Comparison> {
        lock_or_recover(&self.comparisons, "test comparisons").clone()
    }

    /// Attempts made by the most recent run.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Run with retries, then fold action results into this test's status.
    ///
    /// Interact tests return with PENDING set; `set_pass`/`set_fail` finish them.
    pub fn run(&self, bench: &Bench) -> Status {
        self.core.fire(
            self.core
                .event(EventKind::TestStart)
                .with("name", self.name.as_str())
                .with("max_retry", self.max_retry),
        );
        self.core.fire_status(
            Status::RUNNING,
            Status::HAS_RUN
                | Status::FAIL
                | Status::BROKEN
                | Status::INVALID_INTERFACE
                | Status::PENDING,
        );

        let mut attempts = 0;
        for attempt in 1..=self.max_retry {
            attempts = attempt;
            lock_or_recover(&self.comparisons, "test comparisons").clear();
            match self.run_once(bench) {
                Ok(()) => {
                    self.core.fire_status(Status::NONE, Status::BROKEN);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "hilrig::test",
                        test = %self.name,
                        attempt,
                        max_retry = self.max_retry,
                        error = %e,
                        "Test attempt broke"
                    );
                    self.core.fire_status(Status::BROKEN, Status::NONE);
                    self.core.fire(
                        self.core
                            .event(EventKind::TestFatal)
                            .with("attempt", attempt)
                            .with("error", e.to_string())
                            .with("traceback", error_chain(&e)),
                    );
                    if attempt < self.max_retry && !self.retry_delay.is_zero() {
                        std::thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        self.attempts.store(attempts, Ordering::SeqCst);

        if self.core.status().contains(Status::PENDING) {
            let status = self.core.fire_status(Status::NONE, Status::RUNNING);
            tracing::info!(target: "hilrig::test", test = %self.name, "Waiting for operator");
            return status;
        }

        self.check();
        let status = self.core.fire_status(Status::HAS_RUN, Status::RUNNING);
        self.finish(bench, status);
        status
    }

    fn run_once(&self, bench: &Bench) -> Result<(), EngineError> {
        let actions = self.actions();
        match &self.kind {
            TestKind::Single => {
                for action in &actions {
                    let _guard = action.core().lock().acquire();
                    action.call(bench, None)?;
                    bench.sink().record(&action.record(None));
                }
                Ok(())
            }
            TestKind::Expect(plan) => self.run_expect(bench, plan, &actions),
            TestKind::Interact(prompt) => {
                self.core.fire_status(Status::PENDING, Status::NONE);
                self.core.fire(
                    self.core
                        .event(EventKind::TestInteract)
                        .with("name", self.name.as_str())
                        .with("prompt", prompt.prompt.as_str())
                        .with("pass_label", prompt.pass_label.as_str())
                        .with("fail_label", prompt.fail_label.as_str()),
                );
                Ok(())
            }
        }
    }

    fn run_expect(
        &self,
        bench: &Bench,
        plan: &ExpectPlan,
        actions: &[Arc<Action>],
    ) -> Result<(), EngineError> {
        let action_at = |i: usize| {
            actions
                .get(i)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("action {i} of test {}", self.name)))
        };

        for iteration in 0..plan.iterations {
            for (i, values) in &plan.changers {
                let action = action_at(*i)?;
                let _guard = action.core().lock().acquire();
                action.call(bench, values.get(iteration).cloned())?;
                bench.sink().record(&action.record(None));
            }

            if let Some(settle) = plan.settle {
                std::thread::sleep(settle);
            }

            for (i, values) in &plan.checkers {
                let action = action_at(*i)?;
                let _guard = action.core().lock().acquire();
                let reading = action.call(bench, None)?.ok_or_else(|| EngineError::Reading {
                    action: action.name().to_string(),
                    reason: "checker returned nothing".to_string(),
                })?;

                let expected = values.get(iteration).cloned().unwrap_or(Value::Null);
                let passed = within_tolerance(&expected, &reading.output, plan.tolerance)
                    .map_err(|reason| EngineError::Reading {
                        action: action.name().to_string(),
                        reason,
                    })?;
                let comparison = Comparison {
                    action: action.name().to_string(),
                    iteration,
                    expected,
                    actual: reading.output,
                    tolerance: plan.tolerance,
                    passed,
                };
                if passed {
                    action.core().fire_status(Status::NONE, Status::FAIL);
                } else {
                    action.core().fire_status(Status::FAIL, Status::NONE);
                    tracing::debug!(
                        target: "hilrig::test",
                        action = %comparison.action,
                        iteration,
                        expected = %comparison.expected,
                        actual = %comparison.actual,
                        tolerance = comparison.tolerance,
                        "Reading outside tolerance"
                    );
                }
                bench.sink().record(&action.record(Some(&comparison)));
                lock_or_recover(&self.comparisons, "test comparisons").push(comparison);
            }
        }
        Ok(())
    }

    /// Fold the actions' final FAIL bits into this test's FAIL, or into
    /// INVALID_INTERFACE when this hardware variant does not support the check.
    ///
    /// In an expect sweep each reading overwrites its checker's FAIL bit, so
    /// the last iteration decides.
    fn check(&self) -> Status {
        let action_failed = self
            .actions()
            .iter()
            .any(|a| a.status().contains(Status::FAIL));
        self.resolve(!action_failed)
    }

    fn resolve(&self, passed: bool) -> Status {
        if passed {
            self.core
                .fire_status(Status::NONE, Status::FAIL | Status::INVALID_INTERFACE)
        } else if self.valid {
            self.core.fire_status(Status::FAIL, Status::INVALID_INTERFACE)
        } else {
            self.core.fire_status(Status::INVALID_INTERFACE, Status::FAIL)
        }
    }

    fn finish(&self, bench: &Bench, status: Status) {
        self.core.fire(
            self.core
                .event(EventKind::TestFinish)
                .with("name", self.name.as_str())
                .with("status", status.bits())
                .with("flags", status.names())
                .with("attempts", self.attempts()),
        );
        tracing::info!(
            target: "hilrig::test",
            test = %self.name,
            address = %self.address(),
            status = %status,
            attempts = self.attempts(),
            "Test finished"
        );
        bench.sink().record(&self.record());
    }

    /// Operator verdict for a pending interact test.
    pub fn set_result(&self, bench: &Bench, passed: bool) -> Result<Status, EngineError> {
        if !matches!(self.kind, TestKind::Interact(_)) {
            return Err(EngineError::Unsupported(format!(
                "test '{}' is a {} test and takes no operator verdict",
                self.name,
                self.kind.as_str()
            )));
        }
        if !self.core.status().contains(Status::PENDING) {
            return Err(EngineError::Unsupported(format!(
                "test '{}' is not waiting for operator input",
                self.name
            )));
        }

        self.resolve(passed);
        let status = self
            .core
            .fire_status(Status::HAS_RUN, Status::PENDING | Status::RUNNING);
        self.finish(bench, status);
        Ok(status)
    }

    pub fn record(&self) -> ResultRecord {
        let mut record =
            ResultRecord::new(RecipientType::Test, &self.name, self.address(), self.status());
        record.attempts = Some(self.attempts());
        if let Some(c) = self.comparisons().last() {
            record.expected = Some(c.expected.clone());
            record.actual = Some(c.actual.clone());
            record.tolerance = Some(c.tolerance);
        }
        record
    }

    /// Destroy actions, last-created first.
    pub(crate) fn destroy_actions(&self, bench: &Bench) {
        let actions: Vec<Arc<Action>> = lock_or_recover(&self.actions, "test actions")
            .drain(..)
            .collect();
        for action in actions.into_iter().rev() {
            let _guard = action.core().lock().acquire();
            action.destroy(bench);
        }
    }

    pub(crate) fn destroy(&self, bench: &Bench) {
        self.destroy_actions(bench);
        bench.registry().remove(self.address());
        self.core.fire(self.core.event(EventKind::Destroy));
    }
}

/// Inclusive window `[expected - tolerance, expected + tolerance]` for numbers,
/// plain equality otherwise. String readings are parsed when a number is expected.
fn within_tolerance(expected: &Value, actual: &Value, tolerance: f64) -> Result<bool, String> {
    let Some(want) = expected.as_f64() else {
        return Ok(expected == actual);
    };
    let got = match actual {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .ok_or_else(|| format!("expected a number, got {actual}"))?;
    Ok((got - want).abs() <= tolerance)
}

fn set_pass(test: &Arc<Test>, bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    let status = test.set_result(bench, true)?;
    Ok(CommandResponse::ok(Value::from(status.bits())))
}

fn set_fail(test: &Arc<Test>, bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    let status = test.set_result(bench, false)?;
    Ok(CommandResponse::ok(Value::from(status.bits())))
}

fn comparisons(test: &Arc<Test>, _bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    Ok(CommandResponse::ok(serde_json::to_value(test.comparisons())?))
}

fn run(test: &Arc<Test>, bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    let status = test.run(bench);
    Ok(CommandResponse::ok(Value::from(status.bits())))
}

static COMMANDS: CommandTable<Test> = CommandTable {
    sync: &[
        ("acknowledge", router::acknowledge::<Test>),
        ("status", router::status::<Test>),
        ("set_pass", set_pass),
        ("set_fail", set_fail),
        ("comparisons", comparisons),
    ],
    asynchronous: &[
        ("acknowledge", router::acknowledge_async::<Test>),
        ("run", run),
    ],
};

impl Commandable for Test {
    const KIND: RecipientType = RecipientType::Test;

    fn commands() -> &'static CommandTable<Self> {
        &COMMANDS
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::engine::spec::InsertUut;
    use crate::engine::testing::{bench_with, collect, scripted_catalog};
    use crate::engine::{ActionReturn, DeviceCatalog, DeviceError, PlatformLayout, Uut};

    fn seat(bench: &Bench, suite: serde_json::Value) -> Arc<Uut> {
        let suite: Vec<TestSpec> = serde_json::from_value(suite).unwrap();
        bench
            .platform()
            .slot(0)
            .unwrap()
            .insert_uut(
                bench,
                InsertUut {
                    serial: "SN1".to_string(),
                    suite,
                },
            )
            .unwrap()
            .unwrap()
    }

    fn builtin_bench() -> Arc<Bench> {
        Bench::builder("bench")
            .with_layout(PlatformLayout::with_slots(1))
            .build()
            .unwrap()
    }

    fn single(max_retry: u32) -> serde_json::Value {
        json!([{
            "name": "flaky", "type": "single", "max_retry": max_retry, "retry_delay_ms": 0,
            "actions": [{"name": "probe", "class": "scripted", "method": "call"}]
        }])
    }

    #[test]
    fn always_broken_runs_max_retry_times() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bench = bench_with(
            scripted_catalog(Arc::clone(&calls), |_, _| {
                Err(DeviceError::Failed("bus fault".to_string()))
            }),
            1,
        );
        let uut = seat(&bench, single(5));
        let test = uut.test(0).unwrap();

        let (_id, mut rx) = bench.events().subscribe();
        let status = test.run(&bench);

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(test.attempts(), 5);
        assert!(status.contains(Status::BROKEN | Status::HAS_RUN));
        let fatals = collect(&mut rx)
            .iter()
            .filter(|e| e.kind == EventKind::TestFatal)
            .count();
        assert_eq!(fatals, 5);
    }

    #[test]
    fn success_on_attempt_k_stops_retrying() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bench = bench_with(
            scripted_catalog(Arc::clone(&calls), |n, _| {
                if n < 3 {
                    Err(DeviceError::Failed("not yet".to_string()))
                } else {
                    Ok(Some(ActionReturn::new(0, "ok")))
                }
            }),
            1,
        );
        let test = seat(&bench, single(5)).test(0).unwrap();

        let status = test.run(&bench);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(test.attempts(), 3);
        assert!(!status.contains(Status::BROKEN));
        assert!(!status.contains(Status::FAIL));
    }

    #[test]
    fn nonzero_exit_fails_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bench = bench_with(
            scripted_catalog(Arc::clone(&calls), |_, _| Ok(Some(ActionReturn::new("2", "")))),
            1,
        );
        let test = seat(&bench, single(5)).test(0).unwrap();
        let status = test.run(&bench);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(status.contains(Status::FAIL));
    }

    #[test]
    fn allow_fail_suppresses_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bench = bench_with(
            scripted_catalog(Arc::clone(&calls), |_, _| Ok(Some(ActionReturn::new(32, "already mounted")))),
            1,
        );
        let test = seat(
            &bench,
            json!([{
                "name": "mount", "type": "single",
                "actions": [{"name": "mnt", "class": "scripted", "method": "call", "allow_fail": true}]
            }]),
        )
        .test(0)
        .unwrap();

        let status = test.run(&bench);
        assert!(!status.contains(Status::FAIL));
        assert!(!test.actions()[0].status().contains(Status::FAIL));
        assert!(test.actions()[0].status().contains(Status::HAS_RUN));
    }

    #[test]
    fn invalid_interface_replaces_fail() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bench = bench_with(
            scripted_catalog(calls, |_, _| Ok(Some(ActionReturn::new(1, "")))),
            1,
        );
        let test = seat(
            &bench,
            json!([{
                "name": "hdmi", "type": "single", "valid": false,
                "actions": [{"name": "edid", "class": "scripted", "method": "call"}]
            }]),
        )
        .test(0)
        .unwrap();

        assert!(!test.status().contains(Status::VALID));
        let status = test.run(&bench);
        assert!(status.contains(Status::INVALID_INTERFACE));
        assert!(!status.contains(Status::FAIL));
    }

    fn expect_suite(written: f64) -> serde_json::Value {
        json!([{
            "name": "vout", "type": "expect", "tolerance": 0.5,
            "statechangers": [
                {"name": "dac", "class": "analog_loopback", "method": "write", "values": [written]}
            ],
            "statecheckers": [
                {"name": "adc", "class": "analog_loopback", "method": "read", "values": [5.0],
                 "constructor_args": {"source": "dac"}}
            ]
        }])
    }

    #[test]
    fn expect_reading_inside_window_passes() {
        let bench = builtin_bench();
        let test = seat(&bench, expect_suite(5.3)).test(0).unwrap();
        let status = test.run(&bench);
        assert!(!status.contains(Status::FAIL), "status {status}");
        let comparisons = test.comparisons();
        assert_eq!(comparisons.len(), 1);
        assert!(comparisons[0].passed);
        assert_eq!(comparisons[0].actual, json!(5.3));
    }

    #[test]
    fn expect_reading_outside_window_fails() {
        let bench = builtin_bench();
        let test = seat(&bench, expect_suite(5.6)).test(0).unwrap();
        let status = test.run(&bench);
        assert!(status.contains(Status::FAIL));
        assert!(test.actions()[1].status().contains(Status::FAIL));

        let record = test.record();
        assert_eq!(record.expected, Some(json!(5.0)));
        assert_eq!(record.actual, Some(json!(5.6)));
        assert_eq!(record.tolerance, Some(0.5));
    }

    fn sweep_suite(written: [f64; 3]) -> serde_json::Value {
        json!([{
            "name": "sweep", "type": "expect",
            "statechangers": [
                {"name": "dac", "class": "analog_loopback", "method": "write", "values": written}
            ],
            "statecheckers": [
                {"name": "adc", "class": "analog_loopback", "method": "read", "values": [1.0, 2.0, 3.0],
                 "constructor_args": {"source": "dac"}}
            ]
        }])
    }

    #[test]
    fn last_iteration_decides_the_sweep() {
        let bench = builtin_bench();
        let test = seat(&bench, sweep_suite([1.0, 9.0, 3.0])).test(0).unwrap();

        let status = test.run(&bench);
        assert!(!status.contains(Status::FAIL), "status {status}");
        assert!(!test.actions()[1].status().contains(Status::FAIL));
        let passed: Vec<bool> = test.comparisons().iter().map(|c| c.passed).collect();
        assert_eq!(passed, vec![true, false, true]);

        let record = test.record();
        assert_eq!(record.expected, Some(json!(3.0)));
        assert_eq!(record.actual, Some(json!(3.0)));
    }

    #[test]
    fn bad_final_reading_fails_the_sweep() {
        let bench = builtin_bench();
        let test = seat(&bench, sweep_suite([1.0, 2.0, 7.0])).test(0).unwrap();

        let status = test.run(&bench);
        assert!(status.contains(Status::FAIL));
        assert!(test.actions()[1].status().contains(Status::FAIL));
        let passed: Vec<bool> = test.comparisons().iter().map(|c| c.passed).collect();
        assert_eq!(passed, vec![true, true, false]);
    }

    #[test]
    fn interact_waits_for_operator() {
        let bench = builtin_bench();
        let test = seat(
            &bench,
            json!([{"name": "led", "type": "interact", "prompt": "Is the LED green?",
                    "pass_label": "Green", "fail_label": "Off"}]),
        )
        .test(0)
        .unwrap();

        assert!(test.set_result(&bench, true).is_err());

        let (_id, mut rx) = bench.events().subscribe();
        let status = test.run(&bench);
        assert!(status.contains(Status::PENDING));
        assert!(!status.contains(Status::HAS_RUN));

        let events = collect(&mut rx);
        let prompt = events
            .iter()
            .find(|e| e.kind == EventKind::TestInteract)
            .unwrap();
        assert_eq!(prompt.field("prompt"), Some(&json!("Is the LED green?")));
        assert_eq!(prompt.field("pass_label"), Some(&json!("Green")));
        assert!(!events.iter().any(|e| e.kind == EventKind::TestFinish));

        let status = test.set_result(&bench, false).unwrap();
        assert!(status.contains(Status::FAIL | Status::HAS_RUN));
        assert!(!status.contains(Status::PENDING));
        assert!(
            collect(&mut rx)
                .iter()
                .any(|e| e.kind == EventKind::TestFinish)
        );
        assert!(test.set_result(&bench, true).is_err());
    }

    #[test]
    fn verdict_rejected_for_automated_tests() {
        let bench = bench_with(
            scripted_catalog(Arc::new(AtomicUsize::new(0)), |_, _| Ok(None)),
            1,
        );
        let test = seat(&bench, single(1)).test(0).unwrap();
        assert!(matches!(
            test.set_result(&bench, true),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn tolerance_window_is_inclusive() {
        assert!(within_tolerance(&json!(5.0), &json!(5.5), 0.5).unwrap());
        assert!(within_tolerance(&json!(5.0), &json!(4.5), 0.5).unwrap());
        assert!(!within_tolerance(&json!(5.0), &json!(5.6), 0.5).unwrap());
        assert!(within_tolerance(&json!(3), &json!("3.0\n"), 0.0).unwrap());
        assert!(!within_tolerance(&json!(3), &json!(3.1), 0.0).unwrap());
        assert!(within_tolerance(&json!(true), &json!(true), 0.0).unwrap());
        assert!(within_tolerance(&json!(5.0), &json!("volts"), 0.5).is_err());
    }

    #[test]
    fn load_time_catalog_is_used() {
        // scripted class is not in the builtin catalog
        let bench = Bench::builder("bench")
            .with_layout(PlatformLayout::with_slots(1))
            .with_catalog(DeviceCatalog::with_builtins())
            .build()
            .unwrap();
        let suite: Vec<TestSpec> = serde_json::from_value(single(1)).unwrap();
        let err = bench
            .platform()
            .slot(0)
            .unwrap()
            .insert_uut(
                &bench,
                InsertUut {
                    serial: "SN1".to_string(),
                    suite,
                },
            )
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Spec(_)));
    }
}
