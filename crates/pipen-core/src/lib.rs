//! Process/job expansion, scheduling, caching and plugin dispatch for the
//! pipen pipeline engine (C2, C3, C4's abstract interface, C5, C6, C7).
//! Concrete scheduler back-ends live in `pipen-scheduler`; the CLI
//! entrypoint lives in `pipen-cli`.

pub mod channel;
pub mod job;
pub mod pipeline;
pub mod plugin;
pub mod process;
pub mod scheduler;
pub mod shutdown;
pub mod template;

pub use pipen_util::error::PipenError;
