use nix::sys::wait::WaitStatus;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// Exit code a child uses when it could not replace its process image.
///
/// Same value a POSIX shell reports for a command it could not run.
pub const EXEC_FAILURE_CODE: ExitCode = 127;

/// How one pipeline stage terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// The process called `exit` with this code.
    Exited(ExitCode),
    /// The process was killed by this signal number.
    Signaled(i32),
    /// The process could not be waited on; its status is lost.
    Unknown,
}

impl StageStatus {
    /// Exit code in the shell convention: signals map to `128 + signal`.
    pub fn code(&self) -> ExitCode {
        match self {
            StageStatus::Exited(code) => *code,
            StageStatus::Signaled(signal) => 128 + signal,
            StageStatus::Unknown => -1,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, StageStatus::Exited(0))
    }

    /// True when the child reported that `exec` itself failed.
    pub fn is_exec_failure(&self) -> bool {
        matches!(self, StageStatus::Exited(EXEC_FAILURE_CODE))
    }

    /// Translate a terminal [`WaitStatus`]. Returns `None` for stop/continue events.
    pub(crate) fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(StageStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(StageStatus::Signaled(signal as i32)),
            _ => None,
        }
    }
}
