//! Job state machine and cache engine (C4.4/C4.5, spec §4.4/§4.5).
//!
//! `Job` is the per-input-row unit of work; `Signature`/`compute_signature`/
//! `cache_decision` implement the caching algorithm from spec §4.4, resolved
//! against `original_source/pipen/channel.py`'s companion job module only for
//! the on-disk layout (`workdir/<pipeline>/<proc>/<index>/`) named in §6 —
//! the comparison algorithm itself is pinned directly by spec text since the
//! distillation's source didn't carry a single canonical signature format.

use crate::plugin::PluginSnapshot;
use pipen_util::error::PipenError;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum JobStatus {
    Init,
    Queued,
    Submitting,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cached,
    Retrying,
    Killed,
    Finished,
}

impl JobStatus {
    /// `KILLED` is terminal and treated as `FAILED` by the driver to force
    /// pipeline halt, per spec §4.5's pinned open question (killed jobs do
    /// not retry).
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Killed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Killed)
    }
}

/// A rendered input value, already normalized through the plugin chain for
/// path-like kinds.
#[derive(Debug, Clone)]
pub enum InputValue {
    Var(Json),
    File(PathBuf),
    Files(Vec<PathBuf>),
    Dir(PathBuf),
}

/// A rendered output value: the on-disk (or logical, for `var`) location a
/// job's output will live at once it succeeds.
#[derive(Debug, Clone)]
pub enum OutputValue {
    Var(Json),
    File(PathBuf),
    Dir(PathBuf),
}

impl OutputValue {
    fn path_and_is_dir(&self) -> Option<(&Path, bool)> {
        match self {
            Self::Var(_) => None,
            Self::File(p) => Some((p, false)),
            Self::Dir(p) => Some((p, true)),
        }
    }
}

/// One invocation of a process on one input row.
#[derive(Debug, Clone)]
pub struct Job {
    pub proc_name: String,
    pub tag: String,
    pub index: usize,
    pub status: JobStatus,
    pub trial_count: u32,
    pub input: BTreeMap<String, InputValue>,
    pub output: BTreeMap<String, OutputValue>,
    pub output_templates: BTreeMap<String, String>,
    pub script: String,
    pub workdir: PathBuf,
    pub rc: Option<i32>,
}

impl Job {
    pub fn new(proc_name: impl Into<String>, tag: impl Into<String>, index: usize, proc_workdir: &Path) -> Self {
        let proc_name = proc_name.into();
        Self {
            tag: tag.into(),
            workdir: proc_workdir.join(index.to_string()),
            proc_name,
            index,
            status: JobStatus::Init,
            trial_count: 0,
            input: BTreeMap::new(),
            output: BTreeMap::new(),
            output_templates: BTreeMap::new(),
            script: String::new(),
            rc: None,
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.workdir.join("job.script")
    }

    pub fn rc_path(&self) -> PathBuf {
        self.workdir.join("job.rc")
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.workdir.join("job.stdout")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.workdir.join("job.stderr")
    }

    /// Scheduler-qualified so re-running the same job directory under a
    /// different scheduler doesn't collide with a stale wrapper.
    pub fn wrapper_path(&self, scheduler: &str) -> PathBuf {
        self.workdir.join(format!("job.wrapped.{scheduler}"))
    }

    pub fn signature_path(&self) -> PathBuf {
        self.workdir.join("job.signature.json")
    }

    async fn append_stderr(&self, message: &str) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.stderr_path())
            .await?;
        file.write_all(message.as_bytes()).await?;
        file.write_all(b"\n").await
    }

    /// Verify every declared non-`var` output exists, per invariant 4
    /// (output existence contract). On failure, appends a diagnostic to
    /// `job.stderr` naming the missing output, matching S2's expected
    /// message shape.
    pub async fn verify_outputs(&self, plugins: &PluginSnapshot) -> Result<bool, PipenError> {
        for (name, value) in &self.output {
            let Some((path, is_dir)) = value.path_and_is_dir() else {
                continue;
            };
            let exists = plugins.output_exists(path, is_dir).await?;
            if !exists {
                let kind = if is_dir { "dir" } else { "file" };
                let message = format!("Output {kind} '{name}' is not generated.");
                let _ = self.append_stderr(&message).await;
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// One field of a job's cache signature: variable fields carry the raw
/// rendered value, path-like fields carry the normalized path plus the
/// mtime observed through the plugin chain (`dirsig` controls directory
/// recursion depth), per spec §4.4.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum SignatureField {
    Var { value: Json },
    Path { path: String, mtime: i64 },
    Paths { entries: Vec<(String, i64)> },
}

/// A job's cache key: hashed script body, per-input signature fields,
/// *templates* (not rendered values) for declared outputs, and the
/// scheduler name. Outputs are compared by template rather than rendered
/// path so an output directory rename alone (same template, different
/// workdir) doesn't force a cache miss across otherwise-identical runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signature {
    pub script_hash: String,
    pub inputs: BTreeMap<String, SignatureField>,
    pub output_templates: BTreeMap<String, String>,
    pub scheduler: String,
}

fn hash_script(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    hex::encode(hasher.finalize())
}

async fn signature_field(value: &InputValue, dirsig: usize, plugins: &PluginSnapshot) -> Result<SignatureField, PipenError> {
    match value {
        InputValue::Var(v) => Ok(SignatureField::Var { value: v.clone() }),
        InputValue::File(path) | InputValue::Dir(path) => {
            let is_dir = matches!(value, InputValue::Dir(_));
            let mtime = if is_dir {
                plugins.get_mtime(path, dirsig).await?
            } else {
                plugins.get_mtime(path, 0).await?
            };
            Ok(SignatureField::Path {
                path: path.to_string_lossy().into_owned(),
                mtime,
            })
        }
        InputValue::Files(paths) => {
            let mut entries = Vec::with_capacity(paths.len());
            for path in paths {
                let mtime = plugins.get_mtime(path, 0).await?;
                entries.push((path.to_string_lossy().into_owned(), mtime));
            }
            Ok(SignatureField::Paths { entries })
        }
    }
}

/// Build the proposed signature for a job about to run, per spec §4.4 step 1.
pub async fn compute_signature(
    job: &Job,
    dirsig: usize,
    scheduler: &str,
    plugins: &PluginSnapshot,
) -> Result<Signature, PipenError> {
    let mut inputs = BTreeMap::new();
    for (name, value) in &job.input {
        inputs.insert(name.clone(), signature_field(value, dirsig, plugins).await?);
    }
    Ok(Signature {
        script_hash: hash_script(&job.script),
        inputs,
        output_templates: job.output_templates.clone(),
        scheduler: scheduler.to_owned(),
    })
}

pub async fn load_stored_signature(path: &Path) -> Option<Signature> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&contents).ok()
}

pub async fn store_signature(path: &Path, signature: &Signature) -> Result<(), PipenError> {
    let contents = serde_json::to_vec_pretty(signature).map_err(|e| PipenError::Config(e.to_string()))?;
    pipen_util::fs::Fs
        .write_atomic(path, &contents)
        .await
        .map_err(|e| PipenError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheDecision {
    Hit,
    Miss,
}

/// The cache algorithm from spec §4.4 steps 2-4: no stored signature is a
/// miss; a field mismatch is a miss; otherwise every declared output must
/// still exist (directory outputs must be non-empty) or it's a miss.
pub async fn cache_decision(job: &Job, proposed: &Signature, plugins: &PluginSnapshot) -> Result<CacheDecision, PipenError> {
    let Some(stored) = load_stored_signature(&job.signature_path()).await else {
        return Ok(CacheDecision::Miss);
    };
    if stored != *proposed {
        return Ok(CacheDecision::Miss);
    }
    for value in job.output.values() {
        let Some((path, is_dir)) = value.path_and_is_dir() else {
            continue;
        };
        if !plugins.output_exists(path, is_dir).await? {
            return Ok(CacheDecision::Miss);
        }
    }
    Ok(CacheDecision::Hit)
}

/// Clear every declared `file`/`dir` output before a cache-miss rerun, per
/// spec §4.4 ("outputs must be cleared before execution").
pub async fn clear_outputs(job: &Job, plugins: &PluginSnapshot) -> Result<(), PipenError> {
    for value in job.output.values() {
        if let Some((path, is_dir)) = value.path_and_is_dir() {
            plugins.clear_path(path, is_dir).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::plugin::{Plugin, PluginRegistry};

    struct FixedMtime(i64);

    #[async_trait]
    impl Plugin for FixedMtime {
        fn name(&self) -> &str {
            "fixed-mtime"
        }

        async fn get_mtime(&self, _path: &Path, _dirsig: usize) -> Option<Result<i64, PipenError>> {
            Some(Ok(self.0))
        }

        async fn output_exists(&self, _path: &Path, _is_dir: bool) -> Option<Result<bool, PipenError>> {
            Some(Ok(true))
        }
    }

    fn snapshot_with_mtime(mtime: i64) -> PluginSnapshot {
        let mut registry = PluginRegistry::new();
        registry.register(10, std::sync::Arc::new(FixedMtime(mtime)));
        registry.snapshot(&[])
    }

    fn sample_job() -> Job {
        let mut job = Job::new("P", "", 0, Path::new("/tmp/pipen-test/P"));
        job.input.insert("a".into(), InputValue::File(PathBuf::from("/tmp/in.txt")));
        job.script = "echo ok".into();
        job.output_templates.insert("out".into(), "{{in.a}}.out".into());
        job
    }

    #[tokio::test]
    async fn identical_signatures_with_existing_outputs_are_a_hit() {
        let job = sample_job();
        let plugins = snapshot_with_mtime(100);
        let sig = compute_signature(&job, 0, "local", &plugins).await.unwrap();

        let mut hit_job = job.clone();
        hit_job.output.insert("out".into(), OutputValue::File(PathBuf::from("/tmp/out.txt")));
        tokio::fs::create_dir_all(&hit_job.workdir).await.unwrap();
        store_signature(&hit_job.signature_path(), &sig).await.unwrap();

        let decision = cache_decision(&hit_job, &sig, &plugins).await.unwrap();
        assert_eq!(decision, CacheDecision::Hit);
        tokio::fs::remove_dir_all(&hit_job.workdir).await.ok();
    }

    #[tokio::test]
    async fn advancing_mtime_forces_a_miss() {
        let job = sample_job();
        tokio::fs::create_dir_all(&job.workdir).await.unwrap();

        let plugins_old = snapshot_with_mtime(100);
        let old_sig = compute_signature(&job, 0, "local", &plugins_old).await.unwrap();
        store_signature(&job.signature_path(), &old_sig).await.unwrap();

        let plugins_new = snapshot_with_mtime(200);
        let new_sig = compute_signature(&job, 0, "local", &plugins_new).await.unwrap();
        let decision = cache_decision(&job, &new_sig, &plugins_new).await.unwrap();
        assert_eq!(decision, CacheDecision::Miss);
        tokio::fs::remove_dir_all(&job.workdir).await.ok();
    }

    #[tokio::test]
    async fn missing_signature_file_is_a_miss() {
        let job = sample_job();
        let plugins = snapshot_with_mtime(1);
        let sig = compute_signature(&job, 0, "local", &plugins).await.unwrap();
        let decision = cache_decision(&job, &sig, &plugins).await.unwrap();
        assert_eq!(decision, CacheDecision::Miss);
    }

    #[test]
    fn killed_is_treated_as_failure_not_retried() {
        assert!(JobStatus::Killed.is_failure());
        assert!(JobStatus::Killed.is_terminal());
    }

}
