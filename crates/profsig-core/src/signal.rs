//! Signal handler & timer driver: installs the profiling signal's handler,
//! arms the CPU-time interval timer that delivers it, and keeps the process
//! fork-safe around it. Unix-only — the profiling signal and interval
//! timers are a POSIX mechanism.

use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Once;

use libc::{c_int, c_void, siginfo_t};

use profsig_types::{CodeId, Frame, MAX_TRACE_FRAMES};

use crate::host::{current_host_state, HostFrameNode};
use crate::multiset::AsyncSafeTraceMultiset;

/// The OS signal used to deliver CPU-time interval-timer expirations.
pub const PROFILING_SIGNAL: c_int = libc::SIGPROF;

static ASM_PTR: AtomicPtr<AsyncSafeTraceMultiset> = AtomicPtr::new(std::ptr::null_mut());
static MAX_FRAMES_TO_CAPTURE: AtomicUsize = AtomicUsize::new(MAX_TRACE_FRAMES);
static UNKNOWN_STACK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Publish the process-lifetime multiset singleton so the signal handler
/// can reach it with a simple atomic load, published once and never
/// republished. Safe to call repeatedly with the same pointer; callers in
/// session.rs only ever publish the first-ever allocation.
pub(crate) fn publish_asm(asm: &'static AsyncSafeTraceMultiset) {
    ASM_PTR.store(asm as *const _ as *mut _, Ordering::Release);
}

fn asm() -> Option<&'static AsyncSafeTraceMultiset> {
    let p = ASM_PTR.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        // SAFETY: only ever set to a `'static` reference by `publish_asm`.
        Some(unsafe { &*p })
    }
}

pub(crate) fn set_max_frames(n: usize) {
    MAX_FRAMES_TO_CAPTURE.store(n.clamp(1, MAX_TRACE_FRAMES), Ordering::Relaxed);
}

pub(crate) fn take_unknown_stack_count() -> u64 {
    UNKNOWN_STACK_COUNT.swap(0, Ordering::AcqRel)
}

#[cfg(target_os = "linux")]
unsafe fn errno_ptr() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(target_os = "macos")]
unsafe fn errno_ptr() -> *mut c_int {
    unsafe { libc::__error() }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
unsafe fn errno_ptr() -> *mut c_int {
    static mut FALLBACK: c_int = 0;
    unsafe { std::ptr::addr_of_mut!(FALLBACK) }
}

fn save_errno() -> c_int {
    unsafe { *errno_ptr() }
}

fn restore_errno(value: c_int) {
    unsafe { *errno_ptr() = value };
}

/// The profiling signal handler. Async-signal-safe: no allocation, no locks
/// beyond `AsyncSafeTraceMultiset`'s own atomics, no non-reentrant library
/// calls.
extern "C" fn profiling_signal_handler(_sig: c_int, _info: *mut siginfo_t, _ucontext: *mut c_void) {
    let saved_errno = save_errno();

    if let Some(asm) = asm() {
        let max_frames = MAX_FRAMES_TO_CAPTURE.load(Ordering::Relaxed).min(MAX_TRACE_FRAMES);
        let mut buffer = [Frame::default(); MAX_TRACE_FRAMES];
        let mut n = 0usize;

        let head = current_host_state();
        if head.is_null() {
            buffer[0] = Frame::NO_HOST_STATE;
            n = 1;
        } else {
            let mut node = head;
            while !node.is_null() && n < max_frames {
                // SAFETY: the host-state getter contract guarantees a
                // readable chain of `(code, line, next)` triples, walkable
                // without mutating reference counts.
                let current = unsafe { std::ptr::read(node) };
                buffer[n] = Frame::new(CodeId::from_raw(current.code), current.line);
                n += 1;
                node = current.next;
            }
        }

        if !asm.add(&buffer[..n]) {
            UNKNOWN_STACK_COUNT.fetch_add(1, Ordering::Relaxed);
        }
    }

    restore_errno(saved_errno);
}

fn empty_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        set
    }
}

fn signal_only_sigset(sig: c_int) -> libc::sigset_t {
    let mut set = empty_sigset();
    unsafe { libc::sigaddset(&mut set, sig) };
    set
}

/// Install the profiling signal's handler with `restart` and `siginfo`
/// semantics and an empty mask.
pub fn install_signal_action() -> Result<(), c_int> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = profiling_signal_handler as usize;
        sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        sa.sa_mask = empty_sigset();
        if libc::sigaction(PROFILING_SIGNAL, &sa, std::ptr::null_mut()) != 0 {
            return Err(save_errno());
        }
    }
    Ok(())
}

/// Install an ignore-action for the profiling signal — belt-and-braces
/// against a timer-delivered signal still in flight after `set_interval(0)`.
pub fn install_ignore_action() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_IGN;
        sa.sa_mask = empty_sigset();
        libc::sigaction(PROFILING_SIGNAL, &sa, std::ptr::null_mut());
    }
}

/// Arm (or, with `period_usec == 0`, disarm) the CPU-time interval timer
/// that delivers the profiling signal.
pub fn set_interval(period_usec: i64) -> Result<(), c_int> {
    let (sec, usec) = (period_usec / 1_000_000, period_usec % 1_000_000);
    let interval = libc::timeval {
        tv_sec: sec as libc::time_t,
        tv_usec: usec as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    unsafe {
        if libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) != 0 {
            return Err(save_errno());
        }
    }
    Ok(())
}

/// Block the profiling signal in the calling thread.
pub fn block() {
    unsafe {
        let set = signal_only_sigset(PROFILING_SIGNAL);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Unblock the profiling signal in the calling thread.
pub fn unblock() {
    unsafe {
        let set = signal_only_sigset(PROFILING_SIGNAL);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

extern "C" fn atfork_prepare() {
    block();
}

extern "C" fn atfork_parent() {
    unblock();
}

extern "C" fn atfork_child() {
    unblock();
}

static FORK_SAFETY_ONCE: Once = Once::new();

/// Register the pre-fork/post-fork handlers exactly once per process; they
/// are never unregistered. Blocks the profiling signal in the
/// parent around `fork()` and unblocks it in both parent and child
/// afterward, so a forked child is never interrupted while holding an
/// allocator lock inherited from the parent. Forks are deliberately not
/// sampled.
pub fn ensure_fork_safety_registered() {
    FORK_SAFETY_ONCE.call_once(|| unsafe {
        libc::pthread_atfork(Some(atfork_prepare), Some(atfork_parent), Some(atfork_child));
    });
}
