//! Concrete execution back-ends (C4, spec §4.3) implementing
//! `pipen_core::scheduler::SchedulerBackend`.
//!
//! `local` and `dry` are fully self-contained; `ssh`/`sge`/`slurm` assume a
//! shared filesystem between the submitting host and the job (an NFS-style
//! `workdir`, matching the original's runner family), so every back-end
//! observes completion the same way: poll for `job.rc`, written by the
//! wrapper's signal trap, rather than trusting the submission command's own
//! exit status.

pub mod directive;
pub mod dry;
pub mod local;
pub mod sge;
pub mod slurm;
pub mod ssh;

use pipen_core::scheduler::{JobHandle, PollStatus};
use pipen_util::error::PipenError;
use std::path::Path;

/// Shared poll strategy: a terminal `job.rc` file means the job is done,
/// its contents giving the exit code; an absent file means still running.
pub(crate) async fn poll_via_rc_file(rc_path: &Path) -> Result<PollStatus, PipenError> {
    match tokio::fs::read_to_string(rc_path).await {
        Ok(contents) => {
            let rc: i32 = contents.trim().parse().unwrap_or(1);
            Ok(if rc == 0 { PollStatus::Succeeded } else { PollStatus::Failed })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PollStatus::Running),
        Err(e) => Err(PipenError::Io(e)),
    }
}

pub(crate) async fn make_executable(path: &Path) -> Result<(), PipenError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path).await.map_err(PipenError::Io)?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms).await.map_err(PipenError::Io)?;
    }
    let _ = path;
    Ok(())
}

pub(crate) async fn write_wrapper(handle: &JobHandle, header: &[String]) -> Result<(), PipenError> {
    let script_body = tokio::fs::read_to_string(&handle.script_path).await.map_err(PipenError::Io)?;
    let wrapper = directive::render_wrapper(header, handle, &script_body);
    tokio::fs::write(&handle.wrapper_path, wrapper).await.map_err(PipenError::Io)?;
    make_executable(&handle.wrapper_path).await
}
