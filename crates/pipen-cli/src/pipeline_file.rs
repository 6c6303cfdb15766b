//! TOML pipeline-definition format consumed by the `pipen run` binary.
//! Not part of the engine's public contract (spec.md §1 treats the
//! pipeline-file format as an external-collaborator concern); the engine
//! itself only ever sees `pipen_core::process::Process` values.

use anyhow::{Context as _, Result};
use pipen_core::channel::Channel;
use pipen_core::process::{Process, ProcessBuilder, ValueKind};
use pipen_util::config::{CachePolicy, ErrorStrategy};
use serde::Deserialize;
use serde_json::Value as Json;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
struct PipelineFile {
    name: String,
    #[serde(default)]
    process: Vec<ProcessFile>,
}

#[derive(Debug, Deserialize)]
struct FieldFile {
    name: String,
    kind: String,
}

#[derive(Debug, Deserialize)]
struct OutputFieldFile {
    name: String,
    kind: String,
    template: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum InputDataFile {
    Literal { rows: Vec<Vec<Json>> },
    Requires { upstream: Vec<String> },
}

#[derive(Debug, Deserialize)]
struct ProcessFile {
    name: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    input: Vec<FieldFile>,
    #[serde(default)]
    output: Vec<OutputFieldFile>,
    script: String,
    input_data: InputDataFile,
    #[serde(default = "default_scheduler")]
    scheduler: String,
    #[serde(default)]
    scheduler_opts: serde_json::Map<String, Json>,
    #[serde(default = "default_forks")]
    forks: usize,
    #[serde(default)]
    cache: Option<String>,
    #[serde(default)]
    error_strategy: Option<String>,
    #[serde(default)]
    num_retries: u32,
    #[serde(default)]
    dirsig: usize,
    #[serde(default)]
    is_end: bool,
}

fn default_scheduler() -> String {
    "local".to_owned()
}

fn default_forks() -> usize {
    1
}

/// Parse a pipeline file into its declared name and process list, in
/// declaration order. Errors are wrapped with the offending process name
/// so a malformed field is easy to locate in a large file.
pub fn load(path: &Path) -> Result<(String, Vec<Process>)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading pipeline file {}", path.display()))?;
    let file: PipelineFile = toml::from_str(&text).with_context(|| format!("parsing pipeline file {}", path.display()))?;

    let mut processes = Vec::with_capacity(file.process.len());
    for proc_file in file.process {
        let name = proc_file.name.clone();
        let proc = build_process(proc_file).with_context(|| format!("building process {name:?}"))?;
        processes.push(proc);
    }
    Ok((file.name, processes))
}

fn build_process(proc_file: ProcessFile) -> Result<Process> {
    let name = proc_file.name.clone();
    let mut builder = ProcessBuilder::new(&name).tag(proc_file.tag).script(proc_file.script);

    for field in &proc_file.input {
        let kind = ValueKind::from_str(&field.kind).map_err(anyhow::Error::msg)?;
        builder = builder.input(field.name.clone(), kind);
    }
    for field in &proc_file.output {
        let kind = ValueKind::from_str(&field.kind).map_err(anyhow::Error::msg)?;
        builder = builder.output(field.name.clone(), kind, field.template.clone());
    }

    builder = match proc_file.input_data {
        InputDataFile::Literal { rows } => {
            let columns: Vec<String> = proc_file.input.iter().map(|f| f.name.clone()).collect();
            builder.input_literal(Channel { columns, rows })
        }
        InputDataFile::Requires { upstream } => builder.requires(upstream),
    };

    builder = builder
        .scheduler(proc_file.scheduler)
        .scheduler_opts(proc_file.scheduler_opts)
        .forks(proc_file.forks)
        .num_retries(proc_file.num_retries)
        .dirsig(proc_file.dirsig)
        .is_end(proc_file.is_end);

    if let Some(cache) = proc_file.cache {
        builder = builder.cache(CachePolicy::from_str(&cache).map_err(anyhow::Error::msg)?);
    }
    if let Some(strategy) = proc_file.error_strategy {
        builder = builder.error_strategy(ErrorStrategy::from_str(&strategy).map_err(anyhow::Error::msg)?);
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipen_core::process::InputSource;

    #[test]
    fn parses_a_minimal_single_process_pipeline() {
        let toml_src = r#"
            name = "demo"

            [[process]]
            name = "greet"
            script = "echo {{in.name}}"
            is_end = true

            [[process.input]]
            name = "name"
            kind = "var"

            [[process.output]]
            name = "out"
            kind = "var"
            template = "{{in.name}}"

            [process.input_data]
            kind = "literal"
            rows = [["alice"], ["bob"]]
        "#;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), toml_src).unwrap();
        let (name, processes) = load(tmp.path()).unwrap();
        assert_eq!(name, "demo");
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].name, "greet");
        assert!(processes[0].is_end);
    }

    #[test]
    fn parses_a_requires_edge_between_two_processes() {
        let toml_src = r#"
            name = "demo"

            [[process]]
            name = "A"
            script = "echo {{in.x}}"

            [[process.input]]
            name = "x"
            kind = "var"

            [[process.output]]
            name = "out"
            kind = "var"
            template = "{{in.x}}"

            [process.input_data]
            kind = "literal"
            rows = [[1]]

            [[process]]
            name = "B"
            script = "echo {{in.out}}"
            is_end = true

            [[process.input]]
            name = "out"
            kind = "var"

            [[process.output]]
            name = "final"
            kind = "var"
            template = "{{in.out}}"

            [process.input_data]
            kind = "requires"
            upstream = ["A"]
        "#;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), toml_src).unwrap();
        let (_, processes) = load(tmp.path()).unwrap();
        assert_eq!(processes.len(), 2);
        assert!(matches!(processes[1].input_source, InputSource::Requires(ref names) if names == &vec!["A".to_string()]));
    }
}
