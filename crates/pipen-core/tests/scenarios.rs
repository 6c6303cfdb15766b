//! End-to-end scenario tests from spec §8 (S1-S6), driven against
//! `Process::materialize_jobs`/`Process::run` with an in-process scripted
//! back-end standing in for `pipen-scheduler`'s concrete ones (this crate
//! does not depend on `pipen-scheduler`, which depends on it). S5 (SGE
//! directive rendering) is covered directly in `pipen-scheduler`'s
//! `directive.rs` tests, since it's a back-end-local concern.

use async_trait::async_trait;
use pipen_core::channel::Channel;
use pipen_core::job::{Job, JobStatus};
use pipen_core::plugin::{Plugin, PluginRegistry, ProcOutcome};
use pipen_core::process::{ProcessBuilder, ValueKind};
use pipen_core::scheduler::{BackendJobId, JobHandle, PollStatus, SchedulerBackend};
use pipen_core::shutdown::ShutdownSignal;
use pipen_core::template::SimpleRenderer;
use pipen_core::PipenError;
use pipen_util::config::{CachePolicy, ErrorStrategy};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A scheduler back-end that never touches a real shell: `wrap` is a no-op,
/// `submit` hands back a monotonically increasing per-job attempt counter as
/// the backend id, and `poll` looks that counter up in a scripted table to
/// decide success or failure. Good enough to drive `Process::run_job`'s
/// state machine without forking a process.
struct ScriptedBackend {
    attempts: Mutex<HashMap<(String, String, usize), usize>>,
    fail_first_n_attempts: usize,
}

impl ScriptedBackend {
    fn new(fail_first_n_attempts: usize) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            fail_first_n_attempts,
        }
    }
}

#[async_trait]
impl SchedulerBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn wrap(&self, handle: &JobHandle) -> Result<PathBuf, PipenError> {
        Ok(handle.wrapper_path.clone())
    }

    async fn submit(&self, handle: &JobHandle) -> Result<BackendJobId, PipenError> {
        let key = (handle.proc_name.clone(), handle.tag.clone(), handle.index);
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(key).or_insert(0);
        *count += 1;
        Ok(BackendJobId(count.to_string()))
    }

    async fn poll(&self, _handle: &JobHandle, backend_id: &BackendJobId) -> Result<PollStatus, PipenError> {
        let attempt: usize = backend_id.0.parse().unwrap_or(1);
        if attempt <= self.fail_first_n_attempts {
            Ok(PollStatus::Failed)
        } else {
            Ok(PollStatus::Succeeded)
        }
    }

    async fn kill(&self, _handle: &JobHandle, _backend_id: &BackendJobId) -> Result<(), PipenError> {
        Ok(())
    }

    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(1)
    }
}

/// Records which broadcast hooks fired, in order, for assertions that care
/// about sequence rather than just final state.
struct RecordingPlugin {
    name: &'static str,
    events: Mutex<Vec<String>>,
}

impl RecordingPlugin {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        self.name
    }

    async fn on_complete(&self, succeeded: bool) {
        self.events.lock().unwrap().push(format!("complete:{succeeded}"));
    }

    async fn on_job_submitted(&self, _job: &Job) {
        self.events.lock().unwrap().push("submitted".into());
    }

    async fn on_job_started(&self, _job: &Job) {
        self.events.lock().unwrap().push("started".into());
    }

    async fn on_job_succeeded(&self, _job: &Job) {
        self.events.lock().unwrap().push("succeeded".into());
    }

    async fn on_job_cached(&self, _job: &Job) {
        self.events.lock().unwrap().push("cached".into());
    }

    async fn on_job_failed(&self, _job: &Job) {
        self.events.lock().unwrap().push("failed".into());
    }

    async fn on_job_killed(&self, _job: &Job) {
        self.events.lock().unwrap().push("killed".into());
    }
}

/// A back-end whose first `poll` call confirms a shutdown already in
/// progress, as if `Pipeline::run`'s `on_proc_shutdown` veto had just
/// permitted cancellation. Deterministic (no real race): the confirmation
/// happens synchronously inside `poll`, before `run_job`'s follow-up
/// `select!` ever looks at `wait_confirmed`. Reports `Succeeded` once
/// `succeed_after_polls` calls have been made, `Running` until then, so a
/// job whose kill gets vetoed can still be driven to completion.
struct KillAndConfirmBackend {
    shutdown: ShutdownSignal,
    succeed_after_polls: usize,
    polls: std::sync::atomic::AtomicUsize,
    killed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl SchedulerBackend for KillAndConfirmBackend {
    fn name(&self) -> &str {
        "kill-and-confirm"
    }

    async fn wrap(&self, handle: &JobHandle) -> Result<PathBuf, PipenError> {
        Ok(handle.wrapper_path.clone())
    }

    async fn submit(&self, _handle: &JobHandle) -> Result<BackendJobId, PipenError> {
        Ok(BackendJobId("1".into()))
    }

    async fn poll(&self, _handle: &JobHandle, _backend_id: &BackendJobId) -> Result<PollStatus, PipenError> {
        let count = self.polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if count == 1 {
            self.shutdown.confirm();
        }
        if count >= self.succeed_after_polls {
            Ok(PollStatus::Succeeded)
        } else {
            Ok(PollStatus::Running)
        }
    }

    async fn kill(&self, _handle: &JobHandle, _backend_id: &BackendJobId) -> Result<(), PipenError> {
        self.killed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(1)
    }
}

#[tokio::test]
async fn s1_cache_hit_emits_only_on_job_cached_on_second_run() {
    let proc = ProcessBuilder::new("P")
        .input("a", ValueKind::Var)
        .output("out", ValueKind::Var, "{{in.a}}")
        .script("echo ok")
        .cache(CachePolicy::True)
        .build();
    let input = Channel::from_scalars(vec![json!(1)]);
    let tmp = tempfile::tempdir().unwrap();
    let renderer = SimpleRenderer;
    let backend = Arc::new(ScriptedBackend::new(0));
    let log = pipen_util::log::discard_logger();

    let recorder = Arc::new(RecordingPlugin::new("recorder"));
    let mut registry = PluginRegistry::new();
    registry.register(0, recorder.clone());
    let snapshot = registry.snapshot(&[]);

    let first_jobs = proc.materialize_jobs(&input, tmp.path(), &snapshot, &renderer).await.unwrap();
    let (first_jobs, outcome) = proc.run(first_jobs, &snapshot, backend.clone(), &log, &ShutdownSignal::new()).await.unwrap();
    assert_eq!(outcome, ProcOutcome::Succeeded);
    assert_eq!(first_jobs[0].status, JobStatus::Finished);

    let events_before_second_run = recorder.events().len();

    let second_jobs = proc.materialize_jobs(&input, tmp.path(), &snapshot, &renderer).await.unwrap();
    let (second_jobs, outcome) = proc.run(second_jobs, &snapshot, backend.clone(), &log, &ShutdownSignal::new()).await.unwrap();
    assert_eq!(outcome, ProcOutcome::Cached);
    assert_eq!(second_jobs[0].status, JobStatus::Cached);

    // The second run must emit exactly `on_job_cached` and nothing else.
    let events = recorder.events();
    assert_eq!(events[events_before_second_run..].to_vec(), vec!["cached".to_string()]);

    // Only the first run actually called `submit`.
    assert_eq!(backend.attempts.lock().unwrap().len(), 1);
    assert_eq!(*backend.attempts.lock().unwrap().values().next().unwrap(), 1);
}

#[tokio::test]
async fn s2_missing_output_fails_with_exact_message() {
    let proc = ProcessBuilder::new("P")
        .input("a", ValueKind::Var)
        .output("outfile", ValueKind::File, "{{in.a}}.txt")
        .script("echo ok")
        .cache(CachePolicy::False)
        .build();
    let input = Channel::from_scalars(vec![json!(1)]);
    let tmp = tempfile::tempdir().unwrap();
    let renderer = SimpleRenderer;
    let backend = Arc::new(ScriptedBackend::new(0));
    let log = pipen_util::log::discard_logger();

    let registry = PluginRegistry::new();
    let snapshot = registry.snapshot(&[]);

    let jobs = proc.materialize_jobs(&input, tmp.path(), &snapshot, &renderer).await.unwrap();
    let (jobs, outcome) = proc.run(jobs, &snapshot, backend, &log, &ShutdownSignal::new()).await.unwrap();

    assert_eq!(outcome, ProcOutcome::Failed);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Failed);

    let stderr = tokio::fs::read_to_string(job.stderr_path()).await.unwrap();
    assert!(stderr.contains("Output file 'outfile' is not generated."), "stderr was: {stderr:?}");
}

#[tokio::test]
async fn s3_retry_then_succeed() {
    let proc = ProcessBuilder::new("P")
        .input("a", ValueKind::Var)
        .output("out", ValueKind::Var, "{{in.a}}")
        .script("echo ok")
        .cache(CachePolicy::False)
        .error_strategy(ErrorStrategy::Retry)
        .num_retries(2)
        .build();
    let input = Channel::from_scalars(vec![json!(1)]);
    let tmp = tempfile::tempdir().unwrap();
    let renderer = SimpleRenderer;
    // Fails the first submission attempt, succeeds the second.
    let backend = Arc::new(ScriptedBackend::new(1));
    let log = pipen_util::log::discard_logger();

    let recorder = Arc::new(RecordingPlugin::new("recorder"));
    let mut registry = PluginRegistry::new();
    registry.register(0, recorder.clone());
    let snapshot = registry.snapshot(&[]);

    let jobs = proc.materialize_jobs(&input, tmp.path(), &snapshot, &renderer).await.unwrap();
    let (jobs, outcome) = proc.run(jobs, &snapshot, backend, &log, &ShutdownSignal::new()).await.unwrap();

    assert_eq!(outcome, ProcOutcome::Succeeded);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.trial_count, 1);

    let events = recorder.events();
    let failed_at = events.iter().position(|e| e == "failed").expect("a failed event");
    let submitted_positions: Vec<_> = events.iter().enumerate().filter(|(_, e)| e.as_str() == "submitted").map(|(i, _)| i).collect();
    assert_eq!(submitted_positions.len(), 2, "events were: {events:?}");
    assert!(submitted_positions[1] > failed_at);
    assert_eq!(events.last().unwrap().as_str(), "succeeded");
}

#[tokio::test]
async fn s4_plugin_selector_restricts_then_mutates() {
    let p1 = Arc::new(RecordingPlugin::new("p1"));
    let p2 = Arc::new(RecordingPlugin::new("p2"));
    let p3 = Arc::new(RecordingPlugin::new("p3"));
    let p4 = Arc::new(RecordingPlugin::new("p4"));

    let mut registry = PluginRegistry::new();
    registry.register(1, p1.clone());
    registry.register(2, p2.clone());
    registry.register(3, p3.clone());
    registry.register(4, p4.clone());

    let selectors: Vec<String> = ["p1", "p2", "+p3", "-p2"].iter().map(|s| s.to_string()).collect();
    let snapshot = registry.snapshot(&selectors);

    snapshot.broadcast_on_complete(true).await;

    assert_eq!(p1.events(), vec!["complete:true".to_string()]);
    assert!(p2.events().is_empty(), "p2 was excluded by the trailing -p2 selector");
    assert_eq!(p3.events(), vec!["complete:true".to_string()]);
    assert!(p4.events().is_empty(), "p4 was never named by a selector");
}

#[tokio::test]
async fn s6_unsupported_uri_names_the_scheme() {
    let proc = ProcessBuilder::new("P").input("a", ValueKind::File).script("echo ok").build();
    let input = Channel::from_scalars(vec![json!("s3://bkt/x")]);
    let tmp = tempfile::tempdir().unwrap();
    let renderer = SimpleRenderer;
    let registry = PluginRegistry::new();
    let snapshot = registry.snapshot(&[]);

    let err = proc.materialize_jobs(&input, tmp.path(), &snapshot, &renderer).await.unwrap_err();
    match err {
        PipenError::ProcInputValue { proc, message } => {
            assert_eq!(proc, "P");
            assert!(message.contains("s3://"), "message was: {message:?}");
        }
        other => panic!("expected ProcInputValue, got {other:?}"),
    }
}

#[tokio::test]
async fn confirmed_shutdown_kills_a_running_job_and_fires_on_job_killed() {
    let proc = ProcessBuilder::new("P")
        .input("a", ValueKind::Var)
        .output("out", ValueKind::Var, "{{in.a}}")
        .script("echo ok")
        .cache(CachePolicy::False)
        .build();
    let input = Channel::from_scalars(vec![json!(1)]);
    let tmp = tempfile::tempdir().unwrap();
    let renderer = SimpleRenderer;
    let log = pipen_util::log::discard_logger();

    let recorder = Arc::new(RecordingPlugin::new("recorder"));
    let mut registry = PluginRegistry::new();
    registry.register(0, recorder.clone());
    let snapshot = registry.snapshot(&[]);

    let shutdown = ShutdownSignal::new();
    let backend = Arc::new(KillAndConfirmBackend {
        shutdown: shutdown.clone(),
        succeed_after_polls: usize::MAX,
        polls: std::sync::atomic::AtomicUsize::new(0),
        killed: std::sync::atomic::AtomicBool::new(false),
    });

    let jobs = proc.materialize_jobs(&input, tmp.path(), &snapshot, &renderer).await.unwrap();
    let (jobs, outcome) = proc.run(jobs, &snapshot, backend.clone(), &log, &shutdown).await.unwrap();

    assert_eq!(outcome, ProcOutcome::Failed);
    assert_eq!(jobs[0].status, JobStatus::Killed);
    assert!(backend.killed.load(std::sync::atomic::Ordering::SeqCst), "backend.kill was never called");
    assert!(recorder.events().contains(&"killed".to_string()), "events were: {:?}", recorder.events());
}

#[tokio::test]
async fn job_killing_veto_keeps_a_job_running_past_a_confirmed_shutdown() {
    struct DenyKilling;

    #[async_trait]
    impl Plugin for DenyKilling {
        fn name(&self) -> &str {
            "deny-killing"
        }

        async fn on_job_killing(&self, _job: &Job) -> Option<bool> {
            Some(false)
        }
    }

    let proc = ProcessBuilder::new("P")
        .input("a", ValueKind::Var)
        .output("out", ValueKind::Var, "{{in.a}}")
        .script("echo ok")
        .cache(CachePolicy::False)
        .build();
    let input = Channel::from_scalars(vec![json!(1)]);
    let tmp = tempfile::tempdir().unwrap();
    let renderer = SimpleRenderer;
    let log = pipen_util::log::discard_logger();

    let mut registry = PluginRegistry::new();
    registry.register(0, Arc::new(DenyKilling));
    let snapshot = registry.snapshot(&[]);

    let shutdown = ShutdownSignal::new();
    // The backend confirms the shutdown from inside its first `poll`, once
    // the job has already submitted, then reports success on its second
    // poll so the vetoed kill doesn't stall the job forever.
    let backend = Arc::new(KillAndConfirmBackend {
        shutdown: shutdown.clone(),
        succeed_after_polls: 2,
        polls: std::sync::atomic::AtomicUsize::new(0),
        killed: std::sync::atomic::AtomicBool::new(false),
    });

    let jobs = proc.materialize_jobs(&input, tmp.path(), &snapshot, &renderer).await.unwrap();
    let (jobs, outcome) = proc.run(jobs, &snapshot, backend.clone(), &log, &shutdown).await.unwrap();

    assert_eq!(outcome, ProcOutcome::Succeeded);
    assert_eq!(jobs[0].status, JobStatus::Finished);
    assert!(!backend.killed.load(std::sync::atomic::Ordering::SeqCst), "backend.kill should not have been called");
}
