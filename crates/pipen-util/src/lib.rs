//! Shared, non-essential-but-convenient functionality used by the engine, the
//! scheduler back-ends and the CLI: a filesystem façade, config merging,
//! logging setup, and the error taxonomy.

pub mod config;
pub mod error;
pub mod fs;
pub mod log;
pub mod process;

pub use error::PipenError;
