//! The host-runtime contract: everything the core requires of its
//! managed-runtime collaborator, split into two seams because they have
//! different safety requirements:
//!
//! - [`HostRuntime`]: the global lock, live resolution, and code-death-hook
//!   registration. These run on ordinary threads and may allocate and lock.
//! - the host-state getter: a raw `extern "C"` function pointer stored in an
//!   atomic `static`, because it is called from *inside* the signal handler,
//!   where trait-object dispatch and closure captures are not guaranteed
//!   async-signal-safe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use profsig_types::{CodeId, FuncLoc};

/// One node of the host's frame chain: a `(code-record, line)` pair plus a
/// link to the caller's frame. Walkable by reading fields only — no
/// refcount touches, so it stays safe to walk from a signal handler.
#[repr(C)]
pub struct HostFrameNode {
    pub code: usize,
    pub line: i32,
    pub next: *const HostFrameNode,
}

/// Signature of the current-thread host-state getter: returns null if the
/// calling thread has no host state.
pub type HostStateGetter = extern "C" fn() -> *const HostFrameNode;

extern "C" fn no_host_state() -> *const HostFrameNode {
    std::ptr::null()
}

static HOST_STATE_GETTER: AtomicUsize = AtomicUsize::new(no_host_state as usize);

/// Install the current-thread host-state getter. Safe to call any number of
/// times; the most recent call wins. Production wires this once at process
/// startup to the host's real thread-local lookup.
pub fn set_host_state_getter(getter: HostStateGetter) {
    HOST_STATE_GETTER.store(getter as usize, Ordering::Release);
}

/// Reset to the default getter (always "no host state"), used between tests.
pub fn reset_host_state_getter() {
    HOST_STATE_GETTER.store(no_host_state as usize, Ordering::Release);
}

/// Fetch and call the currently installed getter. Async-signal-safe: an
/// atomic load plus a single indirect call through a raw function pointer.
pub(crate) fn current_host_state() -> *const HostFrameNode {
    let raw = HOST_STATE_GETTER.load(Ordering::Acquire);
    // SAFETY: `raw` was produced by casting a `HostStateGetter` in
    // `set_host_state_getter` or from `no_host_state` itself.
    let getter: HostStateGetter = unsafe { std::mem::transmute::<usize, HostStateGetter>(raw) };
    getter()
}

/// Everything the core needs from the host outside of signal context:
/// the global serialization lock, live code-record resolution, and
/// registering the code-death wrapper.
pub trait HostRuntime: Send + Sync {
    /// Run `f` with the host's global serialization lock held. Returns
    /// `Err` with a human-readable reason if the lock could not be
    /// acquired; `f` is not called in that case.
    fn with_host_lock(&self, f: &mut dyn FnMut()) -> Result<(), String>;

    /// Resolve a `CodeId` that has not (yet) been freed.
    fn resolve_live(&self, code: CodeId) -> Option<FuncLoc>;

    /// Replace the host's code-record destructor with a wrapper that calls
    /// `on_death(code, loc)` before delegating to the original destructor.
    /// Must be called with the host lock held; idempotent.
    fn install_code_death_hook(&self, on_death: Arc<dyn Fn(CodeId, FuncLoc) + Send + Sync>);

    /// Restore the original destructor. Must be called with the host lock held.
    fn uninstall_code_death_hook(&self);
}

static HOST_RUNTIME: OnceLock<Arc<dyn HostRuntime>> = OnceLock::new();

/// Publish the process-wide host runtime. First call wins; the runtime is
/// a process-lifetime singleton, published once and never replaced.
pub fn set_host_runtime(runtime: Arc<dyn HostRuntime>) {
    let _ = HOST_RUNTIME.set(runtime);
}

pub fn host_runtime() -> Arc<dyn HostRuntime> {
    HOST_RUNTIME
        .get()
        .cloned()
        .expect("no HostRuntime installed; call profsig_core::host::set_host_runtime first")
}
