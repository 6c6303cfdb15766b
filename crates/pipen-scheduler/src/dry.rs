//! `dry`: write the wrapper script, synthesize success immediately, never
//! spawn anything — for validating DAG wiring without a real back-end.

use crate::write_wrapper;
use async_trait::async_trait;
use pipen_core::scheduler::{BackendJobId, JobHandle, PollStatus, SchedulerBackend};
use pipen_util::error::PipenError;
use std::path::PathBuf;

pub struct DryBackend;

#[async_trait]
impl SchedulerBackend for DryBackend {
    fn name(&self) -> &str {
        "dry"
    }

    async fn wrap(&self, handle: &JobHandle) -> Result<PathBuf, PipenError> {
        write_wrapper(handle, &[]).await?;
        Ok(handle.wrapper_path.clone())
    }

    async fn submit(&self, handle: &JobHandle) -> Result<BackendJobId, PipenError> {
        tokio::fs::write(&handle.stdout_path, b"").await.map_err(PipenError::Io)?;
        tokio::fs::write(&handle.stderr_path, b"").await.map_err(PipenError::Io)?;
        tokio::fs::write(&handle.rc_path, b"0").await.map_err(PipenError::Io)?;
        Ok(BackendJobId("dry".to_owned()))
    }

    async fn poll(&self, _handle: &JobHandle, _backend_id: &BackendJobId) -> Result<PollStatus, PipenError> {
        Ok(PollStatus::Succeeded)
    }

    async fn kill(&self, _handle: &JobHandle, _backend_id: &BackendJobId) -> Result<(), PipenError> {
        Ok(())
    }

    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn dry_run_synthesizes_success_without_spawning() {
        let tmp = tempdir().unwrap();
        let handle = JobHandle {
            proc_name: "P".into(),
            tag: "".into(),
            index: 0,
            script_path: tmp.path().join("job.script"),
            wrapper_path: tmp.path().join("job.wrapper"),
            stdout_path: tmp.path().join("job.stdout"),
            stderr_path: tmp.path().join("job.stderr"),
            rc_path: tmp.path().join("job.rc"),
            workdir: tmp.path().to_path_buf(),
            scheduler_opts: Vec::new(),
            pre_script: None,
            post_script: None,
        };
        tokio::fs::write(&handle.script_path, "echo hi\n").await.unwrap();
        let backend = DryBackend;
        backend.wrap(&handle).await.unwrap();
        let id = backend.submit(&handle).await.unwrap();
        assert_eq!(backend.poll(&handle, &id).await.unwrap(), PollStatus::Succeeded);
        assert!(handle.wrapper_path.exists());
    }
}
