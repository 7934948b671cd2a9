use std::error::Error;
use std::fmt;

/// Fatal error kinds that abort a session. Per-sample conditions
/// (`TableFull`, `NoHostState`) are not represented here: they are folded
/// into the returned profile as synthetic traces instead of propagated.
#[derive(Debug)]
pub enum ProfilerError {
    /// Unable to install the periodic interval timer.
    TimerArmFailed { errno: i32 },
    /// Unable to install the profiling signal's handler.
    SignalInstallFailed { errno: i32 },
    /// Materialization aborted: the host lock or a resolution call failed,
    /// or the result container could not be built.
    MaterializeFailed { reason: String },
    /// A second session was requested while one was already running.
    SessionAlreadyActive,
}

impl fmt::Display for ProfilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimerArmFailed { errno } => {
                write!(f, "failed to arm the profiling interval timer (errno {errno})")
            }
            Self::SignalInstallFailed { errno } => {
                write!(f, "failed to install the profiling signal handler (errno {errno})")
            }
            Self::MaterializeFailed { reason } => {
                write!(f, "failed to materialize profile: {reason}")
            }
            Self::SessionAlreadyActive => {
                write!(f, "a profiling session is already running in this process")
            }
        }
    }
}

impl Error for ProfilerError {}
