use std::time::Duration;

/// Tunables a session is parameterized by.
///
/// Production code should use [`CollectorConfig::default`], which reproduces
/// the literal constants the design calls for. Tests and the integration
/// suite use [`CollectorConfig::shrunk`] to shrink `max_stack_traces` so
/// boundary scenarios — filling the multiset, observing a harvest cadence —
/// run in milliseconds instead of requiring thousands of real samples.
#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    /// Capacity of the [`crate::multiset::AsyncSafeTraceMultiset`].
    pub max_stack_traces: usize,
    /// Maximum frames captured per sample (`kMaxFramesToCapture`).
    pub max_frames: usize,
    /// How often the driver thread drains the multiset while a session runs.
    pub flush_interval: Duration,
    /// How long to wait after disarming the timer before the final harvest,
    /// to let in-flight handlers complete. Defaults to `flush_interval`.
    pub settle_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        let flush_interval = Duration::from_millis(100);
        CollectorConfig {
            max_stack_traces: 2048,
            max_frames: 128,
            flush_interval,
            settle_interval: flush_interval,
        }
    }
}

impl CollectorConfig {
    /// A config with a small table, for tests and benchmarks that want to
    /// force overflow or exercise many interleaved adds without spinning up
    /// thousands of threads.
    pub fn shrunk(max_stack_traces: usize) -> Self {
        CollectorConfig {
            max_stack_traces,
            ..CollectorConfig::default()
        }
    }
}
