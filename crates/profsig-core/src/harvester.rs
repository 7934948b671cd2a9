//! Moves every live entry from the async-safe multiset into the growable
//! aggregate. Runs on the driver thread only, never concurrently with
//! itself; concurrent with signal-handler `add`s on the same multiset.

use profsig_types::CallTrace;

use crate::growable::GrowableTraceMultiset;
use crate::multiset::AsyncSafeTraceMultiset;

/// Drain every populated slot of `asm` into `gm`. Returns the number of
/// slots that were non-empty (used to drive harvest-cadence logging).
pub fn harvest(asm: &AsyncSafeTraceMultiset, gm: &mut GrowableTraceMultiset) -> usize {
    let mut harvested = 0;
    for i in 0..asm.capacity() {
        let Some(extracted) = asm.extract(i) else {
            continue;
        };
        // A trace that failed `CallTrace`'s length invariant cannot occur:
        // the handler and `add` both uphold `[1, 128]` before it ever
        // reaches the table. Treat a violation as a bug, not a data error.
        let trace = CallTrace::try_from_frames(extracted.frames)
            .expect("ASM entries satisfy the CallTrace length invariant by construction");
        gm.record(trace, extracted.count as u64);
        harvested += 1;
    }
    harvested
}
