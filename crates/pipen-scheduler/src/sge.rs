//! `sge`: `qsub` submission with `#$` directives, rc observed through the
//! shared filesystem like every other back-end (spec §4.3).

use crate::directive::sge_header;
use crate::{poll_via_rc_file, write_wrapper};
use async_trait::async_trait;
use pipen_core::scheduler::{BackendJobId, JobHandle, PollStatus, SchedulerBackend};
use pipen_util::error::PipenError;
use std::path::PathBuf;

pub struct SgeBackend;

/// `qsub` prints e.g. `Your job 12345 ("P_T.0") has been submitted.`;
/// extract the numeric id.
fn parse_qsub_job_id(stdout: &str) -> Option<String> {
    stdout.split_whitespace().find(|tok| tok.chars().all(|c| c.is_ascii_digit())).map(str::to_owned)
}

#[async_trait]
impl SchedulerBackend for SgeBackend {
    fn name(&self) -> &str {
        "sge"
    }

    async fn wrap(&self, handle: &JobHandle) -> Result<PathBuf, PipenError> {
        let header = sge_header(handle);
        write_wrapper(handle, &header).await?;
        Ok(handle.wrapper_path.clone())
    }

    async fn submit(&self, handle: &JobHandle) -> Result<BackendJobId, PipenError> {
        let _ = tokio::fs::remove_file(&handle.rc_path).await;
        let output = tokio::process::Command::new("qsub")
            .arg(&handle.wrapper_path)
            .output()
            .await
            .map_err(|e| PipenError::Scheduler {
                scheduler: "sge".into(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(PipenError::Scheduler {
                scheduler: "sge".into(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = parse_qsub_job_id(&stdout).unwrap_or_else(|| stdout.trim().to_owned());
        Ok(BackendJobId(id))
    }

    async fn poll(&self, handle: &JobHandle, _backend_id: &BackendJobId) -> Result<PollStatus, PipenError> {
        poll_via_rc_file(&handle.rc_path).await
    }

    async fn kill(&self, _handle: &JobHandle, backend_id: &BackendJobId) -> Result<(), PipenError> {
        let _ = tokio::process::Command::new("qdel").arg(&backend_id.0).status().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_id_out_of_qsub_banner() {
        let stdout = "Your job 12345 (\"P_T.0\") has been submitted.";
        assert_eq!(parse_qsub_job_id(stdout), Some("12345".to_owned()));
    }
}
