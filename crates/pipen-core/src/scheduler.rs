//! The abstract back-end interface (C4, spec §4.3). Concrete back-ends
//! (`local`, `dry`, `ssh`, `sge`, `slurm`) live in the `pipen-scheduler`
//! crate, which depends on this trait rather than the reverse so the
//! process/pipeline drivers never depend on a specific back-end.

use async_trait::async_trait;
use pipen_util::error::PipenError;
use std::path::PathBuf;

/// Non-blocking status probe result for a submitted job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Everything a back-end needs to wrap/submit/poll/kill one job, decoupled
/// from `crate::job::Job` so `pipen-scheduler` doesn't need to depend on
/// the rest of `pipen-core`'s job/process machinery.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub proc_name: String,
    pub tag: String,
    pub index: usize,
    pub script_path: PathBuf,
    pub wrapper_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub rc_path: PathBuf,
    pub workdir: PathBuf,
    /// Scheduler-prefixed option keys for this job (e.g. `sge_q`, `sge_M`),
    /// already filtered to this back-end's prefix. Directive rendering is
    /// data-driven per spec §4.3: sort keys, strip the prefix, one header
    /// line per entry; boolean `true` is a bare flag.
    pub scheduler_opts: Vec<(String, SchedulerOptValue)>,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerOptValue {
    Flag(bool),
    Value(String),
}

/// An opaque back-end-assigned identifier (a PID for `local`, a job ID for
/// `sge`/`slurm`, a marker string for `dry`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendJobId(pub String);

#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a back-end-specific wrapper script on disk that runs the
    /// job's script, traps signals to write `job.rc`, and for cluster
    /// back-ends emits the correct directive header. Returns the wrapper's
    /// path (== `handle.wrapper_path` by convention).
    async fn wrap(&self, handle: &JobHandle) -> Result<PathBuf, PipenError>;

    /// Launch or enqueue the wrapped job; return a back-end job id.
    async fn submit(&self, handle: &JobHandle) -> Result<BackendJobId, PipenError>;

    /// Non-blocking status probe.
    async fn poll(&self, handle: &JobHandle, backend_id: &BackendJobId) -> Result<PollStatus, PipenError>;

    /// Best-effort termination.
    async fn kill(&self, handle: &JobHandle, backend_id: &BackendJobId) -> Result<(), PipenError>;

    /// Polling cadence; back-end constant, default five seconds per §4.5.
    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(5)
    }
}
