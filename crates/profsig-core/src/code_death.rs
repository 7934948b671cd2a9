//! Code-record death hook: snapshots `(name, filename)` for a code record
//! at the moment the host destroys it, so a sampled frame that references
//! a since-freed record can still be resolved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use profsig_types::{CodeId, FuncLoc};

use crate::host::HostRuntime;

/// `CodeId -> FuncLoc` for records the host destroyed during the session.
/// Lifetime equals the session's; access is serialized by the host's
/// global lock in production, which both the destructor wrapper and
/// materialization hold while touching it. Still backed by a `Mutex` here
/// so the type remains sound to use even if a caller's `HostRuntime`
/// happens not to fully serialize access.
pub struct CodeDeathMap {
    entries: Mutex<HashMap<CodeId, FuncLoc>>,
}

impl CodeDeathMap {
    pub fn new() -> Self {
        CodeDeathMap {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, code: CodeId) -> Option<FuncLoc> {
        self.entries.lock().unwrap().get(&code).cloned()
    }

    fn record_death(&self, code: CodeId, loc: FuncLoc) {
        // Known imperfection: if two distinct records share an address
        // within one session, the first record's entry shadows the
        // second. Not fixed here; `insert` intentionally clobbers.
        self.entries.lock().unwrap().insert(code, loc);
    }

    /// Clear all entries between sessions.
    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for CodeDeathMap {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that installs the code-death wrapper on construction and
/// uninstalls it on drop, so every exit path from a session — including an
/// early return on timer-arm failure — uninstalls exactly once.
pub struct CdhGuard {
    runtime: Arc<dyn HostRuntime>,
}

impl CdhGuard {
    pub fn install(runtime: Arc<dyn HostRuntime>, map: Arc<CodeDeathMap>) -> Self {
        let map_for_hook = Arc::clone(&map);
        runtime.install_code_death_hook(Arc::new(move |code, loc| {
            map_for_hook.record_death(code, loc);
        }));
        CdhGuard { runtime }
    }
}

impl Drop for CdhGuard {
    fn drop(&mut self) {
        self.runtime.uninstall_code_death_hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHostRuntime;

    #[test]
    fn resolve_finds_nothing_before_any_death() {
        let map = CodeDeathMap::new();
        assert!(map.resolve(CodeId::from_raw(42)).is_none());
    }

    #[test]
    fn installed_hook_records_deaths_reported_by_the_host() {
        let host = FakeHostRuntime::new();
        let map = Arc::new(CodeDeathMap::new());
        let guard = CdhGuard::install(host.clone(), Arc::clone(&map));

        let code = CodeId::from_raw(7);
        host.register_live(code, FuncLoc::new("f", "f.rb"));
        host.free_code(code);

        assert_eq!(map.resolve(code), Some(FuncLoc::new("f", "f.rb")));
        drop(guard);
    }

    #[test]
    fn reset_clears_entries_between_sessions() {
        let map = CodeDeathMap::new();
        map.record_death(CodeId::from_raw(1), FuncLoc::new("a", "a.rb"));
        map.reset();
        assert!(map.resolve(CodeId::from_raw(1)).is_none());
    }

    #[test]
    fn uninstall_on_drop_stops_recording_further_deaths() {
        let host = FakeHostRuntime::new();
        let map = Arc::new(CodeDeathMap::new());
        let guard = CdhGuard::install(host.clone(), Arc::clone(&map));
        drop(guard);

        let code = CodeId::from_raw(9);
        host.register_live(code, FuncLoc::new("g", "g.rb"));
        host.free_code(code);

        assert!(map.resolve(code).is_none());
    }
}
