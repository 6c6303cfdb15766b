//! Pipeline driver (C7, spec §4.7).
//!
//! Owns the process DAG: planning (topological order + cycle detection),
//! concurrent execution respecting dependency edges, output finalization
//! for `ends` processes, graceful shutdown on signal, and the final
//! `on_complete` emission.

use crate::channel::Channel;
use crate::job::Job;
use crate::plugin::{PluginSnapshot, ProcOutcome};
use crate::process::{InputSource, Process};
use crate::scheduler::SchedulerBackend;
pub use crate::shutdown::ShutdownSignal;
use pipen_util::error::PipenError;
use slog::{info, o, warn, Logger};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

pub struct Pipeline {
    pub name: String,
    pub processes: Vec<Process>,
    pub workdir: PathBuf,
    pub outdir: PathBuf,
    pub plugins: PluginSnapshot,
    pub backends: HashMap<String, Arc<dyn SchedulerBackend>>,
    pub log: Logger,
}

/// A process and the names of its plan-time predecessors, in the order
/// execution must respect.
struct PlannedProcess {
    index: usize,
    predecessors: Vec<String>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        processes: Vec<Process>,
        workdir: PathBuf,
        outdir: PathBuf,
        plugins: PluginSnapshot,
        backends: HashMap<String, Arc<dyn SchedulerBackend>>,
        log: Logger,
    ) -> Self {
        Self {
            name: name.into(),
            processes,
            workdir,
            outdir,
            plugins,
            backends,
            log,
        }
    }

    /// Validate acyclicity and compute a topological order via Kahn's
    /// algorithm. Returns the process names in execution order.
    pub fn plan(&self) -> Result<Vec<String>, PipenError> {
        let mut planned: HashMap<String, PlannedProcess> = HashMap::new();
        for (i, proc) in self.processes.iter().enumerate() {
            let predecessors = match &proc.input_source {
                InputSource::Literal(_) => Vec::new(),
                InputSource::Requires(names) => names.clone(),
            };
            planned.insert(proc.name.clone(), PlannedProcess { index: i, predecessors });
        }

        let mut in_degree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (name, p) in &planned {
            in_degree.entry(name.clone()).or_insert(0);
            for pred in &p.predecessors {
                if !planned.contains_key(pred) {
                    return Err(PipenError::Config(format!(
                        "process {name:?} requires unknown process {pred:?}"
                    )));
                }
                *in_degree.entry(name.clone()).or_insert(0) += 1;
                dependents.entry(pred.clone()).or_default().push(name.clone());
            }
        }

        let mut queue: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(name, _)| name.clone())
            .collect();
        // Stable order for processes with no predecessors: original declaration order.
        queue.make_contiguous().sort_by_key(|name| planned[name].index);

        let mut order = Vec::with_capacity(planned.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.clone());
            if let Some(deps) = dependents.get(&name) {
                for dep in deps {
                    let degree = in_degree.get_mut(dep).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        if order.len() != planned.len() {
            return Err(PipenError::Config(format!(
                "process graph for pipeline {:?} contains a cycle",
                self.name
            )));
        }
        Ok(order)
    }

    /// `ends`: processes not required by any other process.
    fn ends(&self) -> HashSet<String> {
        let mut required: HashSet<String> = HashSet::new();
        for proc in &self.processes {
            if let InputSource::Requires(names) = &proc.input_source {
                required.extend(names.iter().cloned());
            }
        }
        self.processes
            .iter()
            .map(|p| p.name.clone())
            .filter(|name| !required.contains(name))
            .collect()
    }

    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<bool, PipenError> {
        self.plugins.broadcast_on_init().await;
        self.plugins.broadcast_on_start().await;

        let order = self.plan()?;
        let ends = self.ends();
        let by_name: HashMap<&str, &Process> = self.processes.iter().map(|p| (p.name.as_str(), p)).collect();

        let mut outputs: HashMap<String, Channel> = HashMap::new();
        let mut succeeded = true;

        for name in &order {
            if shutdown.is_requested() {
                succeeded = false;
                break;
            }
            let proc = by_name[name.as_str()];
            let log = self.log.new(o!("proc" => proc.name.clone()));
            self.plugins.broadcast_on_proc_create(proc).await;
            self.plugins.broadcast_on_proc_init(proc).await;

            let input = proc.compute_input(&outputs)?;
            self.plugins.broadcast_on_proc_input_computed(proc).await;

            let proc_workdir = self.workdir.join(&self.name).join(&proc.name);
            tokio::fs::create_dir_all(&proc_workdir).await.map_err(PipenError::Io)?;

            let renderer = crate::template::TeraRenderer::new();
            let jobs = proc.materialize_jobs(&input, &proc_workdir, &self.plugins, &renderer).await?;

            let backend = self
                .backends
                .get(&proc.scheduler)
                .ok_or_else(|| PipenError::Config(format!("unknown scheduler {:?}", proc.scheduler)))?;

            self.plugins.broadcast_on_proc_start(proc).await;
            let run_future = proc.run(jobs, &self.plugins, Arc::clone(backend), &log, &shutdown);
            tokio::pin!(run_future);
            // `shutdown_decided` disables the veto arm once consulted, so a
            // vetoed request doesn't re-ask every time the select loops
            // (the request stays pending) and a permitted one doesn't
            // re-confirm; either way we then just keep awaiting `run_future`.
            let mut shutdown_decided = false;
            let (finished_jobs, outcome) = loop {
                tokio::select! {
                    result = &mut run_future => break result?,
                    _ = shutdown.wait(), if !shutdown_decided => {
                        shutdown_decided = true;
                        if self.plugins.veto_proc_shutdown(proc).await {
                            shutdown.confirm();
                            succeeded = false;
                        } else {
                            warn!(log, "shutdown vetoed, continuing"; "proc" => &proc.name);
                        }
                    }
                }
            };

            let output_channel = jobs_to_channel(proc, &finished_jobs);
            outputs.insert(proc.name.clone(), output_channel);

            if ends.contains(&proc.name) {
                self.finalize_outputs(proc, &finished_jobs).await?;
            }

            if outcome == ProcOutcome::Failed {
                succeeded = false;
                if proc.error_strategy != pipen_util::config::ErrorStrategy::Ignore {
                    info!(log, "process failed, halting pipeline"; "proc" => &proc.name);
                    break;
                }
            }
        }

        self.plugins.broadcast_on_complete(succeeded).await;
        Ok(succeeded)
    }

    /// `outdir/<proc>/`: symlink declared non-`var` outputs for `ends`
    /// processes only, per §4.7 step 3.
    async fn finalize_outputs(&self, proc: &Process, jobs: &[Job]) -> Result<(), PipenError> {
        let target_dir = self.outdir.join(&proc.name);
        tokio::fs::create_dir_all(&target_dir).await.map_err(PipenError::Io)?;
        for job in jobs {
            for (name, value) in &job.output {
                let src = match value {
                    crate::job::OutputValue::Var(_) => continue,
                    crate::job::OutputValue::File(p) | crate::job::OutputValue::Dir(p) => p,
                };
                let link_name = target_dir.join(format!("{}.{}", job.index, name));
                let _ = tokio::fs::remove_file(&link_name).await;
                #[cfg(unix)]
                {
                    let _ = tokio::fs::symlink(src, &link_name).await;
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::fs::copy(src, &link_name).await;
                }
            }
        }
        Ok(())
    }
}

/// Convert a completed process's jobs into its downstream-facing output
/// channel, one row per job, in job-index order.
fn jobs_to_channel(proc: &Process, jobs: &[Job]) -> Channel {
    let columns: Vec<String> = proc.output_specs.iter().map(|s| s.name.clone()).collect();
    let mut sorted: Vec<&Job> = jobs.iter().collect();
    sorted.sort_by_key(|j| j.index);
    let rows = sorted
        .iter()
        .map(|job| {
            columns
                .iter()
                .map(|name| match job.output.get(name) {
                    Some(crate::job::OutputValue::Var(v)) => v.clone(),
                    Some(crate::job::OutputValue::File(p)) | Some(crate::job::OutputValue::Dir(p)) => {
                        serde_json::Value::String(p.to_string_lossy().into_owned())
                    }
                    None => serde_json::Value::Null,
                })
                .collect()
        })
        .collect();
    Channel { columns, rows }
}
