//! `local`: fork/exec, rc read back from `job.rc` rather than trusted from
//! the child process's own exit status (spec §4.3's local back-end note).

use crate::{make_executable, poll_via_rc_file, write_wrapper};
use async_trait::async_trait;
use pipen_core::scheduler::{BackendJobId, JobHandle, PollStatus, SchedulerBackend};
use pipen_util::error::PipenError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::sync::Mutex;

pub struct LocalBackend {
    children: Mutex<HashMap<String, tokio::process::Child>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulerBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn wrap(&self, handle: &JobHandle) -> Result<PathBuf, PipenError> {
        write_wrapper(handle, &[]).await?;
        Ok(handle.wrapper_path.clone())
    }

    async fn submit(&self, handle: &JobHandle) -> Result<BackendJobId, PipenError> {
        let _ = tokio::fs::remove_file(&handle.rc_path).await;
        make_executable(&handle.wrapper_path).await?;

        let stdout = std::fs::File::create(&handle.stdout_path).map_err(PipenError::Io)?;
        let stderr = std::fs::File::create(&handle.stderr_path).map_err(PipenError::Io)?;

        let child = tokio::process::Command::new("bash")
            .arg(&handle.wrapper_path)
            .current_dir(&handle.workdir)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| PipenError::Scheduler {
                scheduler: "local".into(),
                message: e.to_string(),
            })?;

        let id = child.id().map(|pid| pid.to_string()).unwrap_or_else(|| "unknown".to_owned());
        self.children.lock().await.insert(id.clone(), child);
        Ok(BackendJobId(id))
    }

    async fn poll(&self, handle: &JobHandle, backend_id: &BackendJobId) -> Result<PollStatus, PipenError> {
        let status = poll_via_rc_file(&handle.rc_path).await?;
        if status != PollStatus::Running {
            if let Some(mut child) = self.children.lock().await.remove(&backend_id.0) {
                let _ = child.wait().await;
            }
        }
        Ok(status)
    }

    async fn kill(&self, _handle: &JobHandle, backend_id: &BackendJobId) -> Result<(), PipenError> {
        if let Some(mut child) = self.children.lock().await.remove(&backend_id.0) {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn handle_in(dir: &std::path::Path) -> JobHandle {
        JobHandle {
            proc_name: "P".into(),
            tag: "".into(),
            index: 0,
            script_path: dir.join("job.script"),
            wrapper_path: dir.join("job.wrapper"),
            stdout_path: dir.join("job.stdout"),
            stderr_path: dir.join("job.stderr"),
            rc_path: dir.join("job.rc"),
            workdir: dir.to_path_buf(),
            scheduler_opts: Vec::new(),
            pre_script: None,
            post_script: None,
        }
    }

    #[tokio::test]
    async fn local_job_runs_and_reports_rc() {
        let tmp = tempdir().unwrap();
        let handle = handle_in(tmp.path());
        tokio::fs::write(&handle.script_path, "echo hi\n").await.unwrap();

        let backend = LocalBackend::new();
        backend.wrap(&handle).await.unwrap();
        let id = backend.submit(&handle).await.unwrap();

        let mut status = PollStatus::Running;
        for _ in 0..100 {
            status = backend.poll(&handle, &id).await.unwrap();
            if status != PollStatus::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(status, PollStatus::Succeeded);
    }
}
