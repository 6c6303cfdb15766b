//! Process definition and driver (C6, spec §4.6).
//!
//! A `Process` is a plain record built through `ProcessBuilder`, not a
//! subclassed type, per §9's "dynamic attribute dispatch becomes a plain
//! record plus a loader" design note. `run` drives the four steps named in
//! §4.6: input computation, job materialization, bounded-concurrency
//! dispatch, and completion.

use crate::channel::{Cell, Channel};
use crate::job::{cache_decision, clear_outputs, compute_signature, store_signature, CacheDecision, InputValue, Job, JobStatus, OutputValue};
use crate::plugin::{PluginSnapshot, ProcOutcome};
use crate::scheduler::{JobHandle, PollStatus, SchedulerBackend, SchedulerOptValue};
use crate::shutdown::ShutdownSignal;
use crate::template::Renderer;
use futures::stream::{self, StreamExt};
use pipen_util::config::{CachePolicy, ErrorStrategy};
use pipen_util::error::PipenError;
use serde_json::{Map as JsonMap, Value as Json};
use slog::{debug, error, info, Logger};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Var,
    File,
    Files,
    Dir,
}

impl std::str::FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "var" => Ok(Self::Var),
            "file" => Ok(Self::File),
            "files" => Ok(Self::Files),
            "dir" => Ok(Self::Dir),
            other => Err(format!("unknown input/output kind {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputSpec {
    pub name: String,
    pub kind: ValueKind,
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    pub kind: ValueKind,
    pub template: String,
}

/// Where a process's `input_data` table comes from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// A start process: a literal table supplied by the pipeline file.
    Literal(Channel),
    /// A non-start process: horizontally concatenate these upstream
    /// processes' output channels, in this order (spec §4.6 step 1 /
    /// §4.7 tie-breaks).
    Requires(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Process {
    pub name: String,
    pub tag: String,
    pub input_source: InputSource,
    pub input_specs: Vec<InputSpec>,
    pub output_specs: Vec<OutputSpec>,
    pub script_template: String,
    pub scheduler: String,
    pub scheduler_opts: JsonMap<String, Json>,
    pub forks: usize,
    pub cache: CachePolicy,
    pub error_strategy: ErrorStrategy,
    pub num_retries: u32,
    pub dirsig: usize,
    pub is_end: bool,
}

pub struct ProcessBuilder {
    process: Process,
}

impl ProcessBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            process: Process {
                name: name.into(),
                tag: String::new(),
                input_source: InputSource::Requires(Vec::new()),
                input_specs: Vec::new(),
                output_specs: Vec::new(),
                script_template: String::new(),
                scheduler: "local".to_owned(),
                scheduler_opts: JsonMap::new(),
                forks: 1,
                cache: CachePolicy::True,
                error_strategy: ErrorStrategy::Halt,
                num_retries: 0,
                dirsig: 0,
                is_end: false,
            },
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.process.tag = tag.into();
        self
    }

    pub fn input_literal(mut self, channel: Channel) -> Self {
        self.process.input_source = InputSource::Literal(channel);
        self
    }

    pub fn requires(mut self, upstream: Vec<String>) -> Self {
        self.process.input_source = InputSource::Requires(upstream);
        self
    }

    pub fn input(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.process.input_specs.push(InputSpec { name: name.into(), kind });
        self
    }

    pub fn output(mut self, name: impl Into<String>, kind: ValueKind, template: impl Into<String>) -> Self {
        self.process.output_specs.push(OutputSpec {
            name: name.into(),
            kind,
            template: template.into(),
        });
        self
    }

    pub fn script(mut self, template: impl Into<String>) -> Self {
        self.process.script_template = template.into();
        self
    }

    pub fn scheduler(mut self, name: impl Into<String>) -> Self {
        self.process.scheduler = name.into();
        self
    }

    pub fn scheduler_opts(mut self, opts: JsonMap<String, Json>) -> Self {
        self.process.scheduler_opts = opts;
        self
    }

    pub fn forks(mut self, n: usize) -> Self {
        self.process.forks = n.max(1);
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.process.cache = policy;
        self
    }

    pub fn error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.process.error_strategy = strategy;
        self
    }

    pub fn num_retries(mut self, n: u32) -> Self {
        self.process.num_retries = n;
        self
    }

    pub fn dirsig(mut self, depth: usize) -> Self {
        self.process.dirsig = depth;
        self
    }

    pub fn is_end(mut self, end: bool) -> Self {
        self.process.is_end = end;
        self
    }

    pub fn build(self) -> Process {
        self.process
    }
}

impl Process {
    /// Step 1: resolve `input_data`. A start process's channel is returned
    /// as-is; otherwise, upstream channels are looked up by name and
    /// concatenated horizontally in `requires` order. Row counts across
    /// concatenated upstreams must match exactly (§4.7 tie-break).
    pub fn compute_input(&self, upstream_outputs: &HashMap<String, Channel>) -> Result<Channel, PipenError> {
        match &self.input_source {
            InputSource::Literal(channel) => Ok(channel.clone()),
            InputSource::Requires(names) => {
                let mut channels = Vec::with_capacity(names.len());
                for name in names {
                    let channel = upstream_outputs
                        .get(name)
                        .ok_or_else(|| PipenError::proc_input(&self.name, format!("unresolved upstream process {name:?}")))?;
                    channels.push(channel.clone());
                }
                Channel::concat_horizontal(&channels).map_err(|e| PipenError::proc_input(&self.name, e.to_string()))
            }
        }
    }

    /// Step 2: for each input row, build a job: render input values
    /// (normalizing file/dir/files paths through the plugin chain), render
    /// output templates (rewriting file/dir outputs under the job's output
    /// directory via `norm_outpath`), then render the script.
    pub async fn materialize_jobs(
        &self,
        input: &Channel,
        proc_workdir: &Path,
        plugins: &PluginSnapshot,
        renderer: &dyn Renderer,
    ) -> Result<Vec<Job>, PipenError> {
        let mut jobs = Vec::with_capacity(input.nrow());
        for (index, row) in input.rows.iter().enumerate() {
            let mut job = Job::new(&self.name, &self.tag, index, proc_workdir);
            tokio::fs::create_dir_all(&job.workdir)
                .await
                .map_err(PipenError::Io)?;

            let mut in_vars = JsonMap::new();
            for (spec, cell) in self.input_specs.iter().zip(row.iter()) {
                let value = self.normalize_input(spec, cell, plugins).await?;
                in_vars.insert(spec.name.clone(), input_value_to_json(&value));
                job.input.insert(spec.name.clone(), value);
            }

            let mut vars = JsonMap::new();
            vars.insert("in".into(), Json::Object(in_vars));
            vars.insert(
                "proc".into(),
                serde_json::json!({ "name": self.name, "tag": self.tag }),
            );
            vars.insert("job".into(), serde_json::json!({ "index": index }));

            let mut out_vars = JsonMap::new();
            for spec in &self.output_specs {
                let vars_map: HashMap<String, Json> = vars.clone().into_iter().collect();
                let rendered = renderer.render(&spec.template, &vars_map)?;
                job.output_templates.insert(spec.name.clone(), spec.template.clone());
                let value = self.normalize_output(spec, &rendered, &job.workdir, plugins).await?;
                out_vars.insert(spec.name.clone(), output_value_to_json(&value));
                job.output.insert(spec.name.clone(), value);
            }
            vars.insert("out".into(), Json::Object(out_vars));

            let vars_map: HashMap<String, Json> = vars.into_iter().collect();
            job.script = renderer.render(&self.script_template, &vars_map)?;

            plugins.broadcast_on_proc_script_computed(&job).await;
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Normalize a raw path-like input value through the plugin chain. An
    /// all-abstain `norm_inpath` surfaces as `UnsupportedProtocol`; re-wrap it
    /// as a `ProcInputValue` naming both the offending input and the scheme,
    /// per spec §4.6/§8 S6 ("unsupported URI" is a proc-input error, not a
    /// bare protocol error).
    async fn norm_input_path(&self, spec: &InputSpec, raw: &str, plugins: &PluginSnapshot) -> Result<PathBuf, PipenError> {
        plugins.norm_inpath(raw).await.map_err(|e| match e {
            PipenError::UnsupportedProtocol { scheme } => {
                PipenError::proc_input(&self.name, format!("input {:?}: unsupported protocol {scheme}://", spec.name))
            }
            other => other,
        })
    }

    async fn normalize_input(&self, spec: &InputSpec, cell: &Cell, plugins: &PluginSnapshot) -> Result<InputValue, PipenError> {
        match spec.kind {
            ValueKind::Var => Ok(InputValue::Var(cell.clone())),
            ValueKind::File => {
                let raw = cell
                    .as_str()
                    .ok_or_else(|| PipenError::proc_input(&self.name, format!("input {:?} is not a path", spec.name)))?;
                Ok(InputValue::File(self.norm_input_path(spec, raw, plugins).await?))
            }
            ValueKind::Dir => {
                let raw = cell
                    .as_str()
                    .ok_or_else(|| PipenError::proc_input(&self.name, format!("input {:?} is not a path", spec.name)))?;
                Ok(InputValue::Dir(self.norm_input_path(spec, raw, plugins).await?))
            }
            ValueKind::Files => {
                let items = cell
                    .as_array()
                    .ok_or_else(|| PipenError::proc_input(&self.name, format!("input {:?} is not a list", spec.name)))?;
                let mut paths = Vec::with_capacity(items.len());
                for item in items {
                    let raw = item
                        .as_str()
                        .ok_or_else(|| PipenError::proc_input(&self.name, format!("input {:?} entry is not a path", spec.name)))?;
                    paths.push(self.norm_input_path(spec, raw, plugins).await?);
                }
                Ok(InputValue::Files(paths))
            }
        }
    }

    async fn normalize_output(&self, spec: &OutputSpec, rendered: &str, job_outdir: &Path, plugins: &PluginSnapshot) -> Result<OutputValue, PipenError> {
        match spec.kind {
            ValueKind::Var => Ok(OutputValue::Var(Json::String(rendered.to_owned()))),
            ValueKind::File => Ok(OutputValue::File(plugins.norm_outpath(rendered, job_outdir).await?)),
            ValueKind::Dir => Ok(OutputValue::Dir(plugins.norm_outpath(rendered, job_outdir).await?)),
            ValueKind::Files => Err(PipenError::proc_output(&self.name, format!("output {:?} cannot declare kind 'files'", spec.name))),
        }
    }

    /// Steps 3-4: dispatch every job through a bounded-concurrency pool of
    /// size `forks`, then report whether the process as a whole succeeded,
    /// failed, or was entirely served from cache.
    pub async fn run(
        &self,
        jobs: Vec<Job>,
        plugins: &PluginSnapshot,
        backend: Arc<dyn SchedulerBackend>,
        log: &Logger,
        shutdown: &ShutdownSignal,
    ) -> Result<(Vec<Job>, ProcOutcome), PipenError> {
        let forks = self.forks;
        let results: Vec<Result<Job, PipenError>> = stream::iter(jobs.into_iter().map(|job| {
            let backend = Arc::clone(&backend);
            let process = self.clone();
            let shutdown = shutdown.clone();
            async move { process.run_job(job, plugins, backend, log, &shutdown).await }
        }))
        .buffer_unordered(forks)
        .collect()
        .await;

        let mut finished = Vec::with_capacity(results.len());
        let mut any_failed = false;
        let mut any_ran = false;
        for result in results {
            let job = result?;
            if job.status.is_failure() {
                any_failed = true;
            } else if job.status != JobStatus::Cached {
                any_ran = true;
            }
            finished.push(job);
        }

        let outcome = if any_failed {
            ProcOutcome::Failed
        } else if any_ran {
            ProcOutcome::Succeeded
        } else {
            ProcOutcome::Cached
        };
        plugins.broadcast_on_proc_done(self, outcome).await;
        Ok((finished, outcome))
    }

    async fn run_job(
        &self,
        mut job: Job,
        plugins: &PluginSnapshot,
        backend: Arc<dyn SchedulerBackend>,
        log: &Logger,
        shutdown: &ShutdownSignal,
    ) -> Result<Job, PipenError> {
        loop {
            // A confirmed shutdown means the process-level veto already
            // permitted cancellation; a job that hasn't submitted yet has
            // nothing to kill, so it just fails outright (spec §4.7/§5).
            if shutdown.is_confirmed() {
                job.status = JobStatus::Failed;
                plugins.broadcast_on_job(&job, log).await;
                return Ok(job);
            }

            let signature = compute_signature(&job, self.dirsig, &self.scheduler, plugins).await?;

            if self.cache != CachePolicy::Force {
                let decision = cache_decision(&job, &signature, plugins).await?;
                if self.cache == CachePolicy::True && decision == CacheDecision::Hit {
                    job.status = JobStatus::Cached;
                    plugins.broadcast_on_job(&job, log).await;
                    return Ok(job);
                }
            }

            job.status = JobStatus::Queued;
            plugins.broadcast_on_job(&job, log).await;

            clear_outputs(&job, plugins).await?;

            if !plugins.veto_job_submitting(&job).await {
                job.status = JobStatus::Failed;
                plugins.broadcast_on_job(&job, log).await;
                return Ok(job);
            }

            job.status = JobStatus::Submitting;
            let handle = self.job_handle(&job);
            backend.wrap(&handle).await?;
            let backend_id = match backend.submit(&handle).await {
                Ok(id) => id,
                Err(e) => {
                    error!(log, "submission failed"; "proc" => &job.proc_name, "jid" => job.index, "error" => %e);
                    job.status = JobStatus::Failed;
                    plugins.broadcast_on_job(&job, log).await;
                    return Ok(job);
                }
            };
            job.status = JobStatus::Submitted;
            plugins.broadcast_on_job(&job, log).await;

            let mut seen_running = false;
            let mut kill_vetoed = false;
            let terminal = loop {
                tokio::select! {
                    _ = tokio::time::sleep(backend.poll_interval()) => {
                        for p in plugins.plugins() {
                            p.on_job_polling(&job).await;
                        }
                        match backend.poll(&handle, &backend_id).await? {
                            PollStatus::Queued => continue,
                            PollStatus::Running => {
                                if !seen_running {
                                    seen_running = true;
                                    job.status = JobStatus::Running;
                                    plugins.broadcast_on_job(&job, log).await;
                                }
                            }
                            PollStatus::Succeeded => break true,
                            PollStatus::Failed => break false,
                            PollStatus::Unknown => continue,
                        }
                    }
                    // Per-job kill veto, separate from the process-level
                    // `on_proc_shutdown` check that already confirmed. Once
                    // vetoed, stop re-asking so a denied kill doesn't spin
                    // this branch instead of sleeping out the poll interval.
                    _ = shutdown.wait_confirmed(), if !kill_vetoed => {
                        if !plugins.veto_job_killing(&job).await {
                            kill_vetoed = true;
                            continue;
                        }
                        let _ = backend.kill(&handle, &backend_id).await;
                        job.status = JobStatus::Killed;
                        plugins.broadcast_on_job(&job, log).await;
                        return Ok(job);
                    }
                }
            };

            job.rc = Some(if terminal { 0 } else { 1 });

            let succeeded = terminal && job.verify_outputs(plugins).await?;
            if succeeded {
                job.status = JobStatus::Succeeded;
                plugins.broadcast_on_job(&job, log).await;
                store_signature(&job.signature_path(), &signature).await?;
                job.status = JobStatus::Finished;
                debug!(log, "job finished"; "proc" => &job.proc_name, "jid" => job.index);
                return Ok(job);
            }

            job.status = JobStatus::Failed;
            plugins.broadcast_on_job(&job, log).await;

            if self.error_strategy == ErrorStrategy::Retry && job.trial_count < self.num_retries {
                job.trial_count += 1;
                job.status = JobStatus::Retrying;
                info!(log, "retrying job"; "proc" => &job.proc_name, "jid" => job.index, "trial" => job.trial_count);
                continue;
            }

            return Ok(job);
        }
    }

    fn job_handle(&self, job: &Job) -> JobHandle {
        let prefix = format!("{}_", self.scheduler);
        let mut scheduler_opts: Vec<(String, SchedulerOptValue)> = self
            .scheduler_opts
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix).map(|stripped| {
                    let value = match v {
                        Json::Bool(b) => SchedulerOptValue::Flag(*b),
                        other => SchedulerOptValue::Value(json_to_plain_string(other)),
                    };
                    (stripped.to_owned(), value)
                })
            })
            .collect();
        scheduler_opts.sort_by(|a, b| a.0.cmp(&b.0));

        JobHandle {
            proc_name: job.proc_name.clone(),
            tag: job.tag.clone(),
            index: job.index,
            script_path: job.script_path(),
            wrapper_path: job.wrapper_path(&self.scheduler),
            stdout_path: job.stdout_path(),
            stderr_path: job.stderr_path(),
            rc_path: job.rc_path(),
            workdir: job.workdir.clone(),
            scheduler_opts,
            pre_script: None,
            post_script: None,
        }
    }
}

fn json_to_plain_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn input_value_to_json(value: &InputValue) -> Json {
    match value {
        InputValue::Var(v) => v.clone(),
        InputValue::File(p) | InputValue::Dir(p) => Json::String(p.to_string_lossy().into_owned()),
        InputValue::Files(paths) => Json::Array(paths.iter().map(|p| Json::String(p.to_string_lossy().into_owned())).collect()),
    }
}

fn output_value_to_json(value: &OutputValue) -> Json {
    match value {
        OutputValue::Var(v) => v.clone(),
        OutputValue::File(p) | OutputValue::Dir(p) => Json::String(p.to_string_lossy().into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginRegistry;
    use crate::template::SimpleRenderer;
    use serde_json::json;

    #[test]
    fn builder_defaults_forks_to_at_least_one() {
        let proc = ProcessBuilder::new("P").forks(0).build();
        assert_eq!(proc.forks, 1);
    }

    #[test]
    fn compute_input_requires_matching_row_counts() {
        let proc = ProcessBuilder::new("P").requires(vec!["A".into(), "B".into()]).build();
        let mut upstream = HashMap::new();
        upstream.insert("A".to_owned(), Channel::from_scalars(vec![json!(1), json!(2)]));
        upstream.insert("B".to_owned(), Channel::from_scalars(vec![json!(1)]));
        assert!(proc.compute_input(&upstream).is_err());
    }

    #[test]
    fn compute_input_errors_on_unresolved_upstream() {
        let proc = ProcessBuilder::new("P").requires(vec!["missing".into()]).build();
        let upstream = HashMap::new();
        let err = proc.compute_input(&upstream).unwrap_err();
        assert!(matches!(err, PipenError::ProcInputValue { .. }));
    }

    #[tokio::test]
    async fn materialize_jobs_renders_script_per_row() {
        let proc = ProcessBuilder::new("P")
            .input("a", ValueKind::Var)
            .output("out", ValueKind::Var, "{{in.a}}")
            .script("echo {{in.a}}")
            .build();
        let input = Channel::from_scalars(vec![json!(1), json!(2)]);
        let registry = PluginRegistry::new();
        let snapshot = registry.snapshot(&[]);
        let renderer = SimpleRenderer;
        let tmp = tempfile::tempdir().unwrap();
        let jobs = proc.materialize_jobs(&input, tmp.path(), &snapshot, &renderer).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].script, "echo 1");
        assert_eq!(jobs[1].script, "echo 2");
    }
}
