//! `ssh`: wrap + ship + remote exec, rc observed through a shared
//! filesystem (spec §4.3). Assumes `workdir` is mounted identically on the
//! submitting host and the remote host, so "ship" is a no-op and the
//! wrapper is simply invoked remotely by path.

use crate::{make_executable, poll_via_rc_file, write_wrapper};
use async_trait::async_trait;
use pipen_core::scheduler::{BackendJobId, JobHandle, PollStatus, SchedulerBackend};
use pipen_util::error::PipenError;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

pub struct SshBackend {
    host: String,
    children: Mutex<HashMap<String, tokio::process::Child>>,
}

impl SshBackend {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SchedulerBackend for SshBackend {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn wrap(&self, handle: &JobHandle) -> Result<PathBuf, PipenError> {
        write_wrapper(handle, &[]).await?;
        Ok(handle.wrapper_path.clone())
    }

    async fn submit(&self, handle: &JobHandle) -> Result<BackendJobId, PipenError> {
        let _ = tokio::fs::remove_file(&handle.rc_path).await;
        make_executable(&handle.wrapper_path).await?;

        let child = tokio::process::Command::new("ssh")
            .arg(&self.host)
            .arg("bash")
            .arg(&handle.wrapper_path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| PipenError::Scheduler {
                scheduler: "ssh".into(),
                message: format!("connecting to {}: {e}", self.host),
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
