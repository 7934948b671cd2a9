//! The collector session: `Idle → Armed → Running → Draining →
//! Materializing → Idle`. Orchestrates reset, start, periodic harvest,
//! stop, final harvest, and materialization into a resolved profile.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tracing::{debug, error, info_span, warn};

use profsig_types::{CodeId, Frame, FuncLoc, ResolvedFrame, LINE_NO_HOST_STATE};

use crate::code_death::{CdhGuard, CodeDeathMap};
use crate::clock;
use crate::config::CollectorConfig;
use crate::error::ProfilerError;
use crate::growable::GrowableTraceMultiset;
use crate::harvester::harvest;
use crate::host::host_runtime;
use crate::multiset::AsyncSafeTraceMultiset;
use crate::signal;

/// A resolved profile: every distinct trace observed, as an ordered
/// sequence of `(name, filename, line)` triples, mapped to its sample
/// count.
pub type Profile = std::collections::HashMap<Vec<(String, String, i32)>, u64>;

/// Guards against double-arming the timer from programming error. The
/// caller is still responsible for not running two sessions at once; this
/// is a backstop, not the primary enforcement.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// The process-lifetime multiset: allocated on first use, never freed.
static ASM_SINGLETON: OnceLock<AsyncSafeTraceMultiset> = OnceLock::new();

fn asm_singleton(capacity: usize) -> &'static AsyncSafeTraceMultiset {
    let asm = ASM_SINGLETON.get_or_init(|| AsyncSafeTraceMultiset::new(capacity));
    signal::publish_asm(asm);
    asm
}

/// Sample CPU usage on whichever threads the profiling signal lands on for
/// `duration_nanos`, firing roughly every `period_micros` of consumed CPU
/// time, and return the resolved profile.
pub fn profile_cpu(duration_nanos: u64, period_micros: u64) -> Result<Profile, ProfilerError> {
    collect(Duration::from_nanos(duration_nanos), period_micros, CollectorConfig::default())
}

/// As [`profile_cpu`], parameterized by a [`CollectorConfig`] instead of
/// always using [`CollectorConfig::default`]. Exists so callers (and the
/// integration test suite) can shrink the table or the harvest cadence
/// without spinning up thousands of threads.
pub fn profile_cpu_with_config(
    duration: Duration,
    period_micros: u64,
    config: CollectorConfig,
) -> Result<Profile, ProfilerError> {
    collect(duration, period_micros, config)
}

pub(crate) fn collect(
    duration: Duration,
    period_micros: u64,
    config: CollectorConfig,
) -> Result<Profile, ProfilerError> {
    if SESSION_ACTIVE
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(ProfilerError::SessionAlreadyActive);
    }
    let result = run_session(duration, period_micros, config);
    SESSION_ACTIVE.store(false, Ordering::Release);
    result
}

fn run_session(
    duration: Duration,
    period_micros: u64,
    config: CollectorConfig,
) -> Result<Profile, ProfilerError> {
    let span = info_span!("profiler.session");
    let _enter = span.enter();

    // Step 1: reset.
    let asm = asm_singleton(config.max_stack_traces);
    asm.clear();
    signal::set_max_frames(config.max_frames);
    let _ = signal::take_unknown_stack_count();

    signal::ensure_fork_safety_registered();
    if let Err(errno) = signal::install_signal_action() {
        error!(errno, "failed to install profiling signal handler");
        return Err(ProfilerError::SignalInstallFailed { errno });
    }

    let runtime = host_runtime();
    let death_map = std::sync::Arc::new(CodeDeathMap::new());

    // Step 2: install CDH for the session's lifetime.
    let _cdh = CdhGuard::install(runtime.clone(), std::sync::Arc::clone(&death_map));

    // Step 3: arm the timer.
    if let Err(errno) = signal::set_interval(period_micros as i64) {
        error!(errno, "failed to arm profiling interval timer");
        return Err(ProfilerError::TimerArmFailed { errno });
    }

    // Step 4: release the host's global lock so other host threads run
    // (the lock is not held across the harvest loop; nothing to release
    // here beyond not holding it, which `with_host_lock` scoping already
    // guarantees).

    let mut gm = GrowableTraceMultiset::new();

    // Step 5: harvest loop.
    let deadline = clock::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(clock::now());
        if remaining < 2 * config.flush_interval {
            break;
        }
        clock::sleep_for(config.flush_interval);
        let moved = harvest(asm, &mut gm);
        debug!(moved, gm_size = gm.len(), "harvest tick");
    }
    clock::sleep_until(deadline);

    // Step 6: stop.
    let _ = signal::set_interval(0);
    signal::install_ignore_action();

    // Step 7: settle.
    clock::sleep_for(config.settle_interval);
    let moved = harvest(asm, &mut gm);
    debug!(moved, gm_size = gm.len(), "final harvest");

    let unknown = signal::take_unknown_stack_count();
    if unknown > 0 {
        warn!(unknown, "samples recorded with table full or no host state");
    }

    // Step 8 + 9: reacquire host lock, materialize.
    materialize(gm, unknown, &death_map, &runtime)
}

/// Resolve every frame of every entry in `gm` under the host lock, append
/// the synthetic `[Unknown]` trace if any samples overflowed the table, and
/// return the result. Aborts with [`ProfilerError::MaterializeFailed`] if
/// the host lock cannot be acquired, discarding `gm`.
fn materialize(
    mut gm: GrowableTraceMultiset,
    unknown: u64,
    death_map: &CodeDeathMap,
    runtime: &std::sync::Arc<dyn crate::host::HostRuntime>,
) -> Result<Profile, ProfilerError> {
    let mut profile = Profile::new();
    let lock_result = runtime.with_host_lock(&mut || {
        for (trace, count) in std::mem::take(&mut gm).into_entries() {
            let mut resolved = Vec::with_capacity(trace.len());
            for frame in trace.frames() {
                resolved.push(resolve_frame(death_map, runtime, *frame).into_tuple());
            }
            profile.insert(resolved, count);
        }
    });

    if let Err(reason) = lock_result {
        error!(%reason, "materialization aborted: host lock unavailable");
        return Err(ProfilerError::MaterializeFailed { reason });
    }

    if unknown > 0 {
        let unknown_trace = vec![ResolvedFrame::new(FuncLoc::unknown(), 0).into_tuple()];
        profile.insert(unknown_trace, unknown);
    }

    Ok(profile)
}

fn resolve_frame(
    death_map: &CodeDeathMap,
    runtime: &std::sync::Arc<dyn crate::host::HostRuntime>,
    frame: Frame,
) -> ResolvedFrame {
    if frame.line == LINE_NO_HOST_STATE {
        return ResolvedFrame::new(FuncLoc::no_host_state(), frame.line);
    }
    let loc = death_map
        .resolve(frame.code)
        .or_else(|| runtime.resolve_live(frame.code))
        .unwrap_or_else(FuncLoc::unknown);
    ResolvedFrame::new(loc, frame.line)
}
