//! Data-driven cluster directive rendering (spec §4.3), grounded in
//! `original_source/pyppl/runners/runner_sge.py`: reserved keys (job name,
//! stdout/stderr paths, working directory) are defaulted unless the user
//! supplied an override; everything else is stripped of its scheduler
//! prefix, sorted, and turned into one header line per entry. Boolean
//! `true` renders as a bare flag.

use pipen_core::scheduler::{JobHandle, SchedulerOptValue};

fn has_opt(handle: &JobHandle, key: &str) -> bool {
    handle.scheduler_opts.iter().any(|(k, _)| k == key)
}

fn default_job_name(handle: &JobHandle) -> String {
    let tag = if handle.tag.is_empty() { "notag" } else { &handle.tag };
    format!("{}_{}.{}", handle.proc_name, tag, handle.index)
}

/// Render one SGE `#$ ...` header line for a scheduler opt entry.
fn sge_opt_line(key: &str, value: &SchedulerOptValue) -> Option<String> {
    match value {
        SchedulerOptValue::Flag(false) => None,
        SchedulerOptValue::Flag(true) => Some(format!("#$ -{key}")),
        SchedulerOptValue::Value(v) => Some(format!("#$ -{key} {v}")),
    }
}

/// Build the full `#$` header block for an SGE wrapper script, in
/// deterministic order: job name, every user-supplied opt (already sorted
/// by the caller), then stdout/stderr/cwd defaults unless overridden.
pub fn sge_header(handle: &JobHandle) -> Vec<String> {
    let mut lines = Vec::new();
    if !has_opt(handle, "N") {
        lines.push(format!("#$ -N {}", default_job_name(handle)));
    }
    for (key, value) in &handle.scheduler_opts {
        if let Some(line) = sge_opt_line(key, value) {
            lines.push(line);
        }
    }
    if !has_opt(handle, "o") {
        lines.push(format!("#$ -o {}", handle.stdout_path.display()));
    }
    if !has_opt(handle, "e") {
        lines.push(format!("#$ -e {}", handle.stderr_path.display()));
    }
    if !has_opt(handle, "cwd") {
        lines.push("#$ -cwd".to_owned());
    }
    lines
}

/// Render one SLURM `#SBATCH ...` header line for a scheduler opt entry.
fn slurm_opt_line(key: &str, value: &SchedulerOptValue) -> Option<String> {
    match value {
        SchedulerOptValue::Flag(false) => None,
        SchedulerOptValue::Flag(true) => Some(format!("#SBATCH --{key}")),
        SchedulerOptValue::Value(v) => Some(format!("#SBATCH --{key}={v}")),
    }
}

pub fn slurm_header(handle: &JobHandle) -> Vec<String> {
    let mut lines = Vec::new();
    if !has_opt(handle, "job-name") {
        lines.push(format!("#SBATCH --job-name={}", default_job_name(handle)));
    }
    for (key, value) in &handle.scheduler_opts {
        if let Some(line) = slurm_opt_line(key, value) {
            lines.push(line);
        }
    }
    if !has_opt(handle, "output") {
        lines.push(format!("#SBATCH --output={}", handle.stdout_path.display()));
    }
    if !has_opt(handle, "error") {
        lines.push(format!("#SBATCH --error={}", handle.stderr_path.display()));
    }
    if !has_opt(handle, "chdir") {
        lines.push(format!("#SBATCH --chdir={}", handle.workdir.display()));
    }
    lines
}

/// Signals trapped to guarantee `job.rc` is always written, matching the
/// original's trap list.
pub const TRAP_SIGNALS: &str = "1 2 3 6 7 8 9 10 11 12 15 16 17 EXIT";

/// Assemble a full wrapper script body: shebang, optional directive
/// header, the rc-capturing trap, optional pre-script, the job script
/// itself, optional post-script. Byte-identical for identical inputs
/// (invariant 8), modulo the user-provided pre/post script text itself.
pub fn render_wrapper(header: &[String], handle: &JobHandle, script_body: &str) -> String {
    let mut out = String::from("#!/usr/bin/env bash\n");
    for line in header {
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&format!(
        "trap 'status=$?; echo $status > {:?}; exit $status' {}\n\n",
        handle.rc_path.display(),
        TRAP_SIGNALS
    ));
    if let Some(pre) = &handle.pre_script {
        out.push_str(pre);
        out.push('\n');
    }
    out.push_str(script_body);
    if !script_body.ends_with('\n') {
        out.push('\n');
    }
    if let Some(post) = &handle.post_script {
        out.push_str(post);
        out.push('\n');
    }
    out
}
