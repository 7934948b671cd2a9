//! Signal-driven sampling CPU profiler core.
//!
//! [`profile_cpu`] is the single public operation: it samples whichever
//! host threads the profiling signal lands on for a fixed wall-clock
//! duration, then returns every distinct call trace observed mapped to
//! its sample count.

mod clock;
mod code_death;
mod config;
mod error;
mod growable;
mod harvester;
mod host;
mod multiset;

#[cfg(unix)]
mod session;
#[cfg(unix)]
mod signal;

pub use config::CollectorConfig;
pub use error::ProfilerError;
pub use host::{set_host_runtime, set_host_state_getter, HostFrameNode, HostRuntime, HostStateGetter};

#[cfg(unix)]
pub use session::{profile_cpu, profile_cpu_with_config, Profile};
