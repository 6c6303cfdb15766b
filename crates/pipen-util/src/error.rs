//! The error taxonomy shared across the engine, scheduler back-ends and
//! CLI so callers can match on a single enum rather than threading
//! crate-specific error types everywhere.

use thiserror::Error;

/// Errors surfaced to users of a pipen pipeline.
#[derive(Error, Debug)]
pub enum PipenError {
    /// Bad profile, unknown scheduler, or other configuration problem
    /// caught before any process starts.
    #[error("config error: {0}")]
    Config(String),

    /// A process's declared input could not be resolved: an upstream
    /// process reference that doesn't exist, mismatched row counts across
    /// concatenated upstream channels, or an input path whose URI scheme
    /// no plugin normalizes.
    #[error("[{proc}] {message}")]
    ProcInputValue { proc: String, message: String },

    /// A process's declared output is invalid: an absolute output path, an
    /// output missing after a job claims success, or an unsupported output
    /// URI scheme.
    #[error("[{proc}] {message}")]
    ProcOutputValue { proc: String, message: String },

    /// The template engine failed to compile or render a script/output
    /// template.
    #[error("template render error: {0}")]
    TemplateRender(String),

    /// A scheduler back-end's submit/poll/kill transport failed.
    #[error("scheduler error ({scheduler}): {message}")]
    Scheduler { scheduler: String, message: String },

    /// A job finished with a non-zero return code or a missing declared
    /// output, after any configured retries were exhausted.
    #[error("[{proc}] job {index} failed: {message}")]
    JobFailed {
        proc: String,
        index: usize,
        message: String,
    },

    /// No plugin implementation handled a value hook for this URI scheme.
    /// Always names the scheme.
    #[error("unsupported protocol: {scheme}://")]
    UnsupportedProtocol { scheme: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipenError {
    pub fn proc_input(proc: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcInputValue {
            proc: proc.into(),
            message: message.into(),
        }
    }

    pub fn proc_output(proc: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcOutputValue {
            proc: proc.into(),
            message: message.into(),
        }
    }

    pub fn unsupported_protocol(uri: &str) -> Self {
        let scheme = uri.split("://").next().unwrap_or(uri).to_owned();
        Self::UnsupportedProtocol { scheme }
    }
}
