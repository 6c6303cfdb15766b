//! A small process-exit-code wrapper: a typed newtype rather than a bare
//! `i32` at the CLI boundary.

/// The process's exit code, per §6: `0` on `on_complete(true)`, `1` on
/// `on_complete(false)`, `2` on a fatal config/planning error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: Self = Self(0);
    pub const FAILURE: Self = Self(1);
    pub const CONFIG_ERROR: Self = Self(2);

    pub fn as_i32(self) -> i32 {
        self.0
    }

    pub fn from_succeeded(succeeded: bool) -> Self {
        if succeeded {
            Self::SUCCESS
        } else {
            Self::FAILURE
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.0.clamp(0, 255) as u8)
    }
}
