//! `slurm`: `sbatch` submission with `#SBATCH` directives, rc observed
//! through the shared filesystem like every other back-end (spec §4.3).

use crate::directive::slurm_header;
use crate::{poll_via_rc_file, write_wrapper};
use async_trait::async_trait;
use pipen_core::scheduler::{BackendJobId, JobHandle, PollStatus, SchedulerBackend};
use pipen_util::error::PipenError;
use std::path::PathBuf;

pub struct SlurmBackend;

/// `sbatch` prints e.g. `Submitted batch job 12345`.
fn parse_sbatch_job_id(stdout: &str) -> Option<String> {
    stdout.split_whitespace().last().filter(|tok| tok.chars().all(|c| c.is_ascii_digit())).map(str::to_owned)
}

#[async_trait]
impl SchedulerBackend for SlurmBackend {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn wrap(&self, handle: &JobHandle) -> Result<PathBuf, PipenError> {
        let header = slurm_header(handle);
        write_wrapper(handle, &header).await?;
        Ok(handle.wrapper_path.clone())
    }

    async fn submit(&self, handle: &JobHandle) -> Result<BackendJobId, PipenError> {
        let _ = tokio::fs::remove_file(&handle.rc_path).await;
        let output = tokio::process::Command::new("sbatch")
            .arg(&handle.wrapper_path)
            .output()
            .await
            .map_err(|e| PipenError::Scheduler {
                scheduler: "slurm".into(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(PipenError::Scheduler {
                scheduler: "slurm".into(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = parse_sbatch_job_id(&stdout).unwrap_or_else(|| stdout.trim().to_owned());
        Ok(BackendJobId(id))
    }

    async fn poll(&self, handle: &JobHandle, _backend_id: &BackendJobId) -> Result<PollStatus, PipenError> {
        poll_via_rc_file(&handle.rc_path).await
    }

    async fn kill(&self, _handle: &JobHandle, backend_id: &BackendJobId) -> Result<(), PipenError> {
        let _ = tokio::process::Command::new("scancel").arg(&backend_id.0).status().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_id_out_of_sbatch_banner() {
        assert_eq!(parse_sbatch_job_id("Submitted batch job 12345"), Some("12345".to_owned()));
    }
}
