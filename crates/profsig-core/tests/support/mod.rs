//! Shared fixtures for the integration suite, built entirely from
//! `profsig_core`'s public surface — deliberately not reusing the
//! crate-internal `host::fake` module, which is `#[cfg(test)] pub(crate)`
//! and unreachable from here.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};

use profsig_core::{set_host_runtime, set_host_state_getter, HostFrameNode, HostRuntime};
use profsig_types::{CodeId, FuncLoc};

/// Serializes every test in a binary that touches the crate's process-wide
/// statics: the installed `HostRuntime`, the host-state getter, the ASM
/// singleton, and the signal disposition.
pub fn test_guard() -> &'static Mutex<()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(()))
}

pub struct TestHostRuntime {
    live: Mutex<HashMap<CodeId, FuncLoc>>,
    death_hook: Mutex<Option<Arc<dyn Fn(CodeId, FuncLoc) + Send + Sync>>>,
    fail_next_lock: AtomicBool,
}

impl TestHostRuntime {
    fn new() -> Arc<Self> {
        Arc::new(TestHostRuntime {
            live: Mutex::new(HashMap::new()),
            death_hook: Mutex::new(None),
            fail_next_lock: AtomicBool::new(false),
        })
    }

    pub fn register_live(&self, code: CodeId, loc: FuncLoc) {
        self.live.lock().unwrap().insert(code, loc);
    }

    /// Simulate the host freeing a code record: invoke the installed death
    /// hook exactly like the real destructor wrapper would, then drop the
    /// live entry.
    pub fn free_code(&self, code: CodeId) {
        let loc = self.live.lock().unwrap().remove(&code);
        if let (Some(loc), Some(hook)) = (loc, self.death_hook.lock().unwrap().clone()) {
            hook(code, loc);
        }
    }

    fn reset(&self) {
        self.live.lock().unwrap().clear();
        *self.death_hook.lock().unwrap() = None;
        self.fail_next_lock.store(false, Ordering::Release);
    }
}

impl HostRuntime for TestHostRuntime {
    fn with_host_lock(&self, f: &mut dyn FnMut()) -> Result<(), String> {
        if self.fail_next_lock.swap(false, Ordering::AcqRel) {
            return Err("test host lock unavailable".to_string());
        }
        f();
        Ok(())
    }

    fn resolve_live(&self, code: CodeId) -> Option<FuncLoc> {
        self.live.lock().unwrap().get(&code).cloned()
    }

    fn install_code_death_hook(&self, on_death: Arc<dyn Fn(CodeId, FuncLoc) + Send + Sync>) {
        *self.death_hook.lock().unwrap() = Some(on_death);
    }

    fn uninstall_code_death_hook(&self) {
        *self.death_hook.lock().unwrap() = None;
    }
}

static RUNTIME: OnceLock<Arc<TestHostRuntime>> = OnceLock::new();
static INSTALL: Once = Once::new();

/// The shared fake host runtime for this test binary, installed exactly
/// once and reset (live map, death hook, lock-failure flag) on every call.
pub fn shared_runtime() -> Arc<TestHostRuntime> {
    let runtime = RUNTIME.get_or_init(TestHostRuntime::new).clone();
    INSTALL.call_once(|| {
        set_host_runtime(runtime.clone());
    });
    runtime.reset();
    runtime
}

thread_local! {
    static CHAIN_HEAD: Cell<*const HostFrameNode> = const { Cell::new(std::ptr::null()) };
}

extern "C" fn test_getter() -> *const HostFrameNode {
    CHAIN_HEAD.with(|c| c.get())
}

/// Install a single `(code, line)` frame as this thread's host state for
/// the rest of the thread's life. Intended for a short-lived worker thread
/// spun up for the duration of one sample window; the leaked node is never
/// freed, which is fine for a process that exits at the end of the test.
pub fn install_chain_leaked(code: CodeId, line: i32) {
    let node: &'static HostFrameNode =
        Box::leak(Box::new(HostFrameNode { code: code.0, line, next: std::ptr::null() }));
    CHAIN_HEAD.with(|c| c.set(node as *const _));
    set_host_state_getter(test_getter);
}
