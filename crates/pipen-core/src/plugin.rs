//! Plugin registry and hook dispatcher (C2, spec §4.1).
//!
//! Grounded in `original_source/pipen/pluginmgr.py`: hook names, the
//! core plugin's priority (`-1000`) and its value-hook implementations for
//! local paths, and the plugin selector grammar (`"name"` restricts,
//! `"+name"`/`"-name"` mutate) are all pinned from there. The builder +
//! immutable snapshot split follows §9's design note ("use a builder +
//! immutable snapshot per pipeline rather than a live global"), in the same
//! spirit as the `PluginManager::load` -> frozen-`Vec` split in
//! `other_examples/318cb830_RootCauseScan-Scanner__crates-engine-src-plugin-manager.rs.rs`.

use crate::job::{Job, JobStatus};
use crate::process::Process;
use async_trait::async_trait;
use pipen_util::error::PipenError;
use slog::{debug, Logger};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The three reducer classes named in spec §4.1.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// Every enabled impl is invoked; return values are ignored.
    Broadcast,
    /// Impls called in priority order; first non-null wins. `false` cancels
    /// the action, `true`/absence (null) permits it.
    FirstVeto,
    /// Impls called in priority order; first non-null wins. All-null is an
    /// error (unsupported protocol).
    FirstValue,
}

/// Extension point implemented by plugins. Every method defaults to
/// abstaining (broadcast hooks: no-op; veto hooks: `Ok(None)`; value hooks:
/// `Ok(None)`) so a plugin only overrides the hooks it cares about.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    // ---- broadcast lifecycle hooks ----
    async fn on_init(&self) {}
    async fn on_start(&self) {}
    async fn on_complete(&self, _succeeded: bool) {}
    async fn on_proc_create(&self, _proc: &Process) {}
    async fn on_proc_init(&self, _proc: &Process) {}
    async fn on_proc_input_computed(&self, _proc: &Process) {}
    async fn on_proc_script_computed(&self, _job: &Job) {}
    async fn on_proc_start(&self, _proc: &Process) {}
    async fn on_proc_done(&self, _proc: &Process, _succeeded: ProcOutcome) {}
    async fn on_job_init(&self, _job: &Job) {}
    async fn on_job_queued(&self, _job: &Job) {}
    async fn on_job_submitted(&self, _job: &Job) {}
    async fn on_job_started(&self, _job: &Job) {}
    async fn on_job_polling(&self, _job: &Job) {}
    async fn on_job_killed(&self, _job: &Job) {}
    async fn on_job_succeeded(&self, _job: &Job) {}
    async fn on_job_cached(&self, _job: &Job) {}
    async fn on_job_failed(&self, _job: &Job) {}

    // ---- first-available veto hooks ----
    async fn on_job_submitting(&self, _job: &Job) -> Option<bool> {
        None
    }
    async fn on_job_killing(&self, _job: &Job) -> Option<bool> {
        None
    }
    async fn on_proc_shutdown(&self, _proc: &Process) -> Option<bool> {
        None
    }

    // ---- first-available value hooks ----
    async fn norm_inpath(&self, _path: &str) -> Option<Result<PathBuf, PipenError>> {
        None
    }
    async fn norm_outpath(&self, _path: &str, _job_outdir: &Path) -> Option<Result<PathBuf, PipenError>> {
        None
    }
    async fn get_mtime(&self, _path: &Path, _dirsig: usize) -> Option<Result<i64, PipenError>> {
        None
    }
    async fn clear_path(&self, _path: &Path, _is_dir: bool) -> Option<Result<(), PipenError>> {
        None
    }
    async fn output_exists(&self, _path: &Path, _is_dir: bool) -> Option<Result<bool, PipenError>> {
        None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcOutcome {
    Succeeded,
    Failed,
    Cached,
}

/// Priority of the built-in core plugin; lowest, so it runs (and abstains)
/// first for value hooks, letting user plugins claim a scheme before the
/// core plugin's local-path fallback is tried.
pub const CORE_PLUGIN_PRIORITY: i32 = -1000;

/// Mutable builder: plugins register here during setup.
pub struct PluginRegistry {
    core: Arc<CorePlugin>,
    entries: Vec<(i32, Arc<dyn Plugin>)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let core = Arc::new(CorePlugin::new());
        let entries = vec![(CORE_PLUGIN_PRIORITY, Arc::clone(&core) as Arc<dyn Plugin>)];
        Self { core, entries }
    }

    pub fn register(&mut self, priority: i32, plugin: Arc<dyn Plugin>) {
        self.entries.push((priority, plugin));
    }

    pub fn core_plugin(&self) -> Arc<CorePlugin> {
        Arc::clone(&self.core)
    }

    /// Apply the pipeline's plugin selector strings and freeze into a
    /// snapshot sorted by ascending priority. A bare name restricts the
    /// enabled set to exactly the named plugins (plus the always-on core
    /// plugin); `+name`/`-name` mutate whatever set came before them.
    /// Parsing order matters, per spec §4.1.
    pub fn snapshot(&self, selectors: &[String]) -> PluginSnapshot {
        let all_names: Vec<&str> = self.entries.iter().map(|(_, p)| p.name()).collect();
        let mut enabled: std::collections::HashSet<String> = all_names.iter().map(|s| s.to_string()).collect();

        let mut restricted = false;
        for sel in selectors {
            if let Some(name) = sel.strip_prefix('+') {
                enabled.insert(name.to_owned());
            } else if let Some(name) = sel.strip_prefix('-') {
                enabled.remove(name);
            } else {
                if !restricted {
                    enabled.clear();
                    restricted = true;
                }
                enabled.insert(sel.clone());
            }
        }
        enabled.insert("core".to_owned());

        let mut entries: Vec<(i32, Arc<dyn Plugin>)> = self
            .entries
            .iter()
            .filter(|(_, p)| enabled.contains(p.name()))
            .cloned()
            .collect();
        entries.sort_by_key(|(priority, _)| *priority);
        PluginSnapshot { entries }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen, priority-ordered plugin set for one pipeline run.
#[derive(Clone)]
pub struct PluginSnapshot {
    entries: Vec<(i32, Arc<dyn Plugin>)>,
}

impl PluginSnapshot {
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.entries.iter().map(|(_, p)| p)
    }

    pub async fn broadcast_on_init(&self) {
        for p in self.plugins() {
            p.on_init().await;
        }
    }

    pub async fn broadcast_on_start(&self) {
        for p in self.plugins() {
            p.on_start().await;
        }
    }

    pub async fn broadcast_on_complete(&self, succeeded: bool) {
        for p in self.plugins() {
            p.on_complete(succeeded).await;
        }
    }

    pub async fn broadcast_on_proc_done(&self, proc: &Process, outcome: ProcOutcome) {
        for p in self.plugins() {
            p.on_proc_done(proc, outcome).await;
        }
    }

    pub async fn broadcast_on_proc_create(&self, proc: &Process) {
        for p in self.plugins() {
            p.on_proc_create(proc).await;
        }
    }

    pub async fn broadcast_on_proc_init(&self, proc: &Process) {
        for p in self.plugins() {
            p.on_proc_init(proc).await;
        }
    }

    pub async fn broadcast_on_proc_input_computed(&self, proc: &Process) {
        for p in self.plugins() {
            p.on_proc_input_computed(proc).await;
        }
    }

    pub async fn broadcast_on_proc_script_computed(&self, job: &Job) {
        for p in self.plugins() {
            p.on_proc_script_computed(job).await;
        }
    }

    pub async fn broadcast_on_proc_start(&self, proc: &Process) {
        for p in self.plugins() {
            p.on_proc_start(proc).await;
        }
    }

    pub async fn broadcast_on_job(&self, job: &Job, log: &Logger) {
        for p in self.plugins() {
            match job.status {
                JobStatus::Init => p.on_job_init(job).await,
                JobStatus::Queued => p.on_job_queued(job).await,
                JobStatus::Submitted => p.on_job_submitted(job).await,
                JobStatus::Running => p.on_job_started(job).await,
                JobStatus::Succeeded => p.on_job_succeeded(job).await,
                JobStatus::Cached => p.on_job_cached(job).await,
                JobStatus::Failed => p.on_job_failed(job).await,
                JobStatus::Killed => p.on_job_killed(job).await,
                _ => {}
            }
        }
        debug!(log, "job hook dispatched"; "proc" => &job.proc_name, "tag" => &job.tag, "jid" => job.index, "status" => ?job.status);
    }

    /// First-available veto dispatch. `false` cancels; `true`/no opinion
    /// (every plugin returns `None`) permits.
    pub async fn veto_job_submitting(&self, job: &Job) -> bool {
        for p in self.plugins() {
            if let Some(v) = p.on_job_submitting(job).await {
                return v;
            }
        }
        true
    }

    pub async fn veto_job_killing(&self, job: &Job) -> bool {
        for p in self.plugins() {
            if let Some(v) = p.on_job_killing(job).await {
                return v;
            }
        }
        true
    }

    pub async fn veto_proc_shutdown(&self, proc: &Process) -> bool {
        for p in self.plugins() {
            if let Some(v) = p.on_proc_shutdown(proc).await {
                return v;
            }
        }
        true
    }

    /// First-available value dispatch for `norm_inpath`. All-abstain raises
    /// `UnsupportedProtocol` naming the scheme, per spec §4.1/§7.
    pub async fn norm_inpath(&self, path: &str) -> Result<PathBuf, PipenError> {
        for p in self.plugins() {
            if let Some(r) = p.norm_inpath(path).await {
                return r;
            }
        }
        Err(PipenError::unsupported_protocol(path))
    }

    pub async fn norm_outpath(&self, path: &str, job_outdir: &Path) -> Result<PathBuf, PipenError> {
        for p in self.plugins() {
            if let Some(r) = p.norm_outpath(path, job_outdir).await {
                return r;
            }
        }
        Err(PipenError::unsupported_protocol(path))
    }

    pub async fn get_mtime(&self, path: &Path, dirsig: usize) -> Result<i64, PipenError> {
        for p in self.plugins() {
            if let Some(r) = p.get_mtime(path, dirsig).await {
                return r;
            }
        }
        Err(PipenError::unsupported_protocol(&path.to_string_lossy()))
    }

    pub async fn clear_path(&self, path: &Path, is_dir: bool) -> Result<(), PipenError> {
        for p in self.plugins() {
            if let Some(r) = p.clear_path(path, is_dir).await {
                return r;
            }
        }
        Err(PipenError::unsupported_protocol(&path.to_string_lossy()))
    }

    pub async fn output_exists(&self, path: &Path, is_dir: bool) -> Result<bool, PipenError> {
        for p in self.plugins() {
            if let Some(r) = p.output_exists(path, is_dir).await {
                return r;
            }
        }
        Err(PipenError::unsupported_protocol(&path.to_string_lossy()))
    }
}

/// Progress counters updated only from hook callbacks running on the same
/// task, per §5 ("no lock required"). Plain `AtomicU64`s are still used so
/// the counters can be read from a separate rendering task (e.g. a progress
/// bar) without synchronization on the read side.
#[derive(Default)]
pub struct ProgressCounters {
    pub submitted: AtomicU64,
    pub running: AtomicU64,
    pub succeeded: AtomicU64,
    pub cached: AtomicU64,
    pub failed: AtomicU64,
}

impl ProgressCounters {
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.submitted.load(Ordering::Relaxed),
            self.running.load(Ordering::Relaxed),
            self.succeeded.load(Ordering::Relaxed),
            self.cached.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

fn to_pipen_io(err: anyhow::Error) -> PipenError {
    PipenError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}

/// The built-in `"core"` plugin (priority `-1000`): implements the
/// value hooks for local filesystem paths and maintains progress counters.
/// A bare `"://"` substring in the path is treated as a foreign URI scheme
/// this plugin abstains on, letting a later-registered plugin claim it.
pub struct CorePlugin {
    pub progress: ProgressCounters,
}

impl CorePlugin {
    pub fn new() -> Self {
        Self {
            progress: ProgressCounters::default(),
        }
    }

    fn is_uri(path: &str) -> bool {
        path.contains("://")
    }
}

impl Default for CorePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for CorePlugin {
    fn name(&self) -> &str {
        "core"
    }

    async fn on_job_submitted(&self, _job: &Job) {
        self.progress.submitted.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_job_started(&self, _job: &Job) {
        self.progress.running.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_job_succeeded(&self, _job: &Job) {
        self.progress.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_job_cached(&self, _job: &Job) {
        self.progress.cached.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_job_failed(&self, _job: &Job) {
        self.progress.failed.fetch_add(1, Ordering::Relaxed);
    }

    async fn norm_inpath(&self, path: &str) -> Option<Result<PathBuf, PipenError>> {
        if Self::is_uri(path) {
            return None;
        }
        Some(pipen_util::fs::Fs.resolve(path).map_err(to_pipen_io))
    }

    async fn norm_outpath(&self, path: &str, job_outdir: &Path) -> Option<Result<PathBuf, PipenError>> {
        if Self::is_uri(path) {
            return None;
        }
        if Path::new(path).is_absolute() {
            return Some(Err(PipenError::proc_output(
                "",
                format!("output path must be relative to the job directory, got {path:?}"),
            )));
        }
        Some(Ok(job_outdir.join(path)))
    }

    /// Walks the tree with `walkdir` (no async variant), so it runs off the
    /// cooperative runtime via `spawn_blocking` per `Fs::mtime_recursive`'s
    /// own doc comment.
    async fn get_mtime(&self, path: &Path, dirsig: usize) -> Option<Result<i64, PipenError>> {
        if Self::is_uri(&path.to_string_lossy()) {
            return None;
        }
        let path = path.to_owned();
        let result = tokio::task::spawn_blocking(move || pipen_util::fs::Fs.mtime_recursive(&path, dirsig))
            .await
            .map_err(|e| PipenError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
            .and_then(|r| r.map_err(to_pipen_io))
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            });
        Some(result)
    }

    async fn clear_path(&self, path: &Path, is_dir: bool) -> Option<Result<(), PipenError>> {
        if Self::is_uri(&path.to_string_lossy()) {
            return None;
        }
        let path = path.to_owned();
        let result = tokio::task::spawn_blocking(move || {
            if !path.exists() && !pipen_util::fs::Fs.is_symlink(&path) {
                Ok(())
            } else if is_dir && !pipen_util::fs::Fs.is_symlink(&path) {
                std::fs::remove_dir_all(&path).and_then(|_| std::fs::create_dir_all(&path))
            } else {
                std::fs::remove_file(&path)
            }
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        .and_then(|r| r);
        Some(result.map_err(PipenError::Io))
    }

    async fn output_exists(&self, path: &Path, is_dir: bool) -> Option<Result<bool, PipenError>> {
        if Self::is_uri(&path.to_string_lossy()) {
            return None;
        }
        let path = path.to_owned();
        let result = tokio::task::spawn_blocking(move || {
            if is_dir {
                path.is_dir()
                    && std::fs::read_dir(&path)
                        .map(|mut entries| entries.next().is_some())
                        .unwrap_or(false)
            } else {
                path.is_file() || pipen_util::fs::Fs.is_symlink(&path)
            }
        })
        .await
        .map_err(|e| PipenError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedPlugin(&'static str);

    #[async_trait]
    impl Plugin for NamedPlugin {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn registry_with(names: &[&'static str]) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        for (i, name) in names.iter().enumerate() {
            registry.register(i as i32, Arc::new(NamedPlugin(name)));
        }
        registry
    }

    #[test]
    fn bare_name_restricts_then_plus_minus_mutate() {
        let registry = registry_with(&["p1", "p2", "p3", "p4"]);
        let selectors: Vec<String> = ["p1", "p2", "+p3", "-p2"].iter().map(|s| s.to_string()).collect();
        let snapshot = registry.snapshot(&selectors);
        let names: Vec<&str> = snapshot.plugins().map(|p| p.name()).collect();
        assert!(names.contains(&"p1"));
        assert!(names.contains(&"p3"));
        assert!(!names.contains(&"p2"));
        assert!(!names.contains(&"p4"));
    }

    #[test]
    fn no_selectors_enables_everything() {
        let registry = registry_with(&["p1", "p2"]);
        let snapshot = registry.snapshot(&[]);
        assert_eq!(snapshot.plugins().count(), 3);
    }

    #[test]
    fn snapshot_is_priority_sorted() {
        let mut registry = PluginRegistry::new();
        registry.register(5, Arc::new(NamedPlugin("late")));
        registry.register(-5, Arc::new(NamedPlugin("early")));
        let snapshot = registry.snapshot(&[]);
        let names: Vec<&str> = snapshot.plugins().map(|p| p.name()).collect();
        let early_idx = names.iter().position(|n| *n == "early").unwrap();
        let core_idx = names.iter().position(|n| *n == "core").unwrap();
        let late_idx = names.iter().position(|n| *n == "late").unwrap();
        assert!(core_idx < early_idx);
        assert!(early_idx < late_idx);
    }

    #[tokio::test]
    async fn core_plugin_resolves_local_paths() {
        let plugin = CorePlugin::new();
        let result = plugin.norm_inpath("./foo").await.unwrap().unwrap();
        assert!(result.is_absolute());
    }

    #[tokio::test]
    async fn core_plugin_abstains_on_uri_scheme() {
        let plugin = CorePlugin::new();
        assert!(plugin.norm_inpath("s3://bucket/key").await.is_none());
    }
}
