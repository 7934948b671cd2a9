//! The async-signal-safe, fixed-capacity trace multiset.
//!
//! `add` is called from the profiling signal handler: no allocation, no
//! locking beyond the slot's own atomics, no non-reentrant calls. `extract`
//! is called from the driver thread only, one slot at a time, concurrently
//! with signal-handler `add`s landing on other slots (or, transiently, the
//! same slot).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

use profsig_types::{hash_trace, Frame, MAX_TRACE_FRAMES};

/// Sentinel `count` value meaning "a writer or the drainer is mid-transition;
/// do not read the frame buffer".
const LOCKED: i64 = -1;
const UNUSED: i64 = 0;

struct Slot {
    count: AtomicI64,
    active_updates: AtomicU32,
    num_frames: AtomicUsize,
    // SAFETY seam: only ever written by the single writer that won the
    // `UNUSED -> LOCKED` CAS, and only ever read by `extract` after it has
    // observed `active_updates == 0` following its own `LOCKED` exchange.
    // Those two facts are exactly the happens-before edges this relies on.
    frames: UnsafeCell<[Frame; MAX_TRACE_FRAMES]>,
}

// SAFETY: `Slot` is shared across threads by design; the invariants above
// are what make concurrent access to `frames` sound without a lock.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Slot {
            count: AtomicI64::new(UNUSED),
            active_updates: AtomicU32::new(0),
            num_frames: AtomicUsize::new(0),
            frames: UnsafeCell::new([Frame::default(); MAX_TRACE_FRAMES]),
        }
    }
}

/// A harvested (or peeked) entry: the frames most recently published to a
/// slot, and the aggregated count it had accrued.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub frames: Vec<Frame>,
    pub count: i64,
}

pub struct AsyncSafeTraceMultiset {
    slots: Box<[Slot]>,
}

impl AsyncSafeTraceMultiset {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>().into_boxed_slice();
        AsyncSafeTraceMultiset { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Clear every slot back to `UNUSED`. Only safe to call when no signal
    /// handler is concurrently writing (i.e. the timer is disarmed) — used
    /// by session reset, never while sampling is live.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.count.store(UNUSED, Ordering::Relaxed);
            slot.active_updates.store(0, Ordering::Relaxed);
        }
    }

    /// Insert or merge `frames` into the table. Async-signal-safe: no
    /// allocation, no locks beyond the per-slot atomics, no non-reentrant
    /// calls. Returns `false` if every probe slot was contended or occupied
    /// by a different trace after `N` probes (the table is effectively full).
    pub fn add(&self, frames: &[Frame]) -> bool {
        let n = self.slots.len();
        if n == 0 {
            return false;
        }
        let h = hash_trace(frames);

        for j in 0..n {
            let i = (h as usize).wrapping_add(j) % n;
            let slot = &self.slots[i];

            slot.active_updates.fetch_add(1, Ordering::Acquire);
            let observed = slot.count.load(Ordering::Acquire);

            if observed == UNUSED {
                if slot
                    .count
                    .compare_exchange(UNUSED, LOCKED, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    slot.active_updates.fetch_sub(1, Ordering::Release);
                    // SAFETY: we are the sole writer — we just won the CAS
                    // that transitioned this slot from UNUSED to LOCKED.
                    let buf = unsafe { &mut *slot.frames.get() };
                    let len = frames.len().min(MAX_TRACE_FRAMES);
                    for (dst, src) in buf.iter_mut().zip(frames[..len].iter()) {
                        *dst = *src;
                    }
                    slot.num_frames.store(len, Ordering::Relaxed);
                    slot.count.store(1, Ordering::Release);
                    return true;
                }
                slot.active_updates.fetch_sub(1, Ordering::Release);
                continue;
            }

            if observed == LOCKED {
                slot.active_updates.fetch_sub(1, Ordering::Release);
                continue;
            }

            // observed > 0: published entry. Compare against the stored trace.
            let stored_len = slot.num_frames.load(Ordering::Relaxed);
            // SAFETY: count > 0 means no concurrent writer is mid-transition
            // on this slot (only extract can move a published slot away from
            // `count > 0`, and extract alone never mutates the frame buffer
            // before setting LOCKED). Reading here races benignly with a
            // concurrent extract's LOCKED exchange; we re-check `count`
            // below before committing the merge.
            let buf = unsafe { &*slot.frames.get() };
            let matches = &buf[..stored_len.min(MAX_TRACE_FRAMES)] == frames_truncated(frames);

            if matches {
                let reloaded = slot.count.load(Ordering::Acquire);
                if reloaded > 0
                    && slot
                        .count
                        .compare_exchange(reloaded, reloaded + 1, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                {
                    slot.active_updates.fetch_sub(1, Ordering::Release);
                    return true;
                }
            }

            slot.active_updates.fetch_sub(1, Ordering::Release);
        }

        false
    }

    /// Harvest slot `i` if it holds a published entry, resetting it to
    /// `UNUSED`. Only one thread may call `extract` at a time; it runs
    /// concurrently with `add`.
    pub fn extract(&self, i: usize) -> Option<Extracted> {
        let slot = self.slots.get(i)?;

        let observed = slot.count.load(Ordering::Acquire);
        if observed <= 0 {
            return None;
        }

        let prev = slot.count.swap(LOCKED, Ordering::Acquire);
        if prev <= 0 {
            // Someone else (only possible misuse: concurrent extract) beat
            // us here, or the slot emptied between the load and the swap.
            // Restore LOCKED back to UNUSED only if we actually own it.
            if prev == LOCKED {
                slot.count.store(UNUSED, Ordering::Release);
            } else {
                slot.count.store(prev, Ordering::Release);
            }
            return None;
        }

        let len = slot.num_frames.load(Ordering::Relaxed).min(MAX_TRACE_FRAMES);
        // SAFETY: we just exchanged count to LOCKED, so no `add` can be
        // mid-transition into "publish" on this slot; we still must wait
        // for any writer that already incremented `active_updates` before
        // observing our LOCKED before reading the buffer.
        while slot.active_updates.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        let frames = {
            let buf = unsafe { &*slot.frames.get() };
            buf[..len].to_vec()
        };

        slot.count.store(UNUSED, Ordering::Release);

        Some(Extracted { frames, count: prev })
    }
}

fn frames_truncated(frames: &[Frame]) -> &[Frame] {
    let len = frames.len().min(MAX_TRACE_FRAMES);
    &frames[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use profsig_types::CodeId;
    use std::sync::Arc;
    use std::thread;

    fn trace(tag: usize) -> Vec<Frame> {
        vec![Frame::new(CodeId::from_raw(tag), 1)]
    }

    #[test]
    fn add_then_extract_round_trips_one_sample() {
        let asm = AsyncSafeTraceMultiset::new(64);
        assert!(asm.add(&trace(1)));

        let harvested = (0..asm.capacity()).find_map(|i| asm.extract(i));
        let harvested = harvested.expect("one slot must hold the published entry");
        assert_eq!(harvested.count, 1);
        assert_eq!(harvested.frames, trace(1));
    }

    #[test]
    fn repeated_add_of_same_trace_accumulates_count() {
        let asm = AsyncSafeTraceMultiset::new(64);
        for _ in 0..5 {
            assert!(asm.add(&trace(7)));
        }
        let harvested = (0..asm.capacity()).find_map(|i| asm.extract(i)).unwrap();
        assert_eq!(harvested.count, 5);
    }

    #[test]
    fn extract_empties_the_slot() {
        let asm = AsyncSafeTraceMultiset::new(64);
        assert!(asm.add(&trace(3)));
        let idx = (0..asm.capacity()).find(|&i| asm.extract_peek(i)).unwrap();
        let _ = asm.extract(idx);
        assert!(asm.extract(idx).is_none());
    }

    impl AsyncSafeTraceMultiset {
        fn extract_peek(&self, i: usize) -> bool {
            self.slots[i].count.load(Ordering::Acquire) > 0
        }
    }

    #[test]
    fn filling_to_capacity_then_one_more_distinct_trace_fails_exactly_once() {
        let asm = AsyncSafeTraceMultiset::new(8);
        for tag in 0..8 {
            assert!(asm.add(&trace(tag)), "trace {tag} must fit in an empty 8-slot table");
        }
        assert!(!asm.add(&trace(8)), "the 9th distinct trace must not fit in a full 8-slot table");
    }

    #[test]
    fn concurrent_adds_from_multiple_threads_are_all_harvested() {
        let asm = Arc::new(AsyncSafeTraceMultiset::new(256));
        let mut handles = Vec::new();
        for t in 0..4 {
            let asm = Arc::clone(&asm);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    assert!(asm.add(&trace(t)));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut total = 0i64;
        for i in 0..asm.capacity() {
            if let Some(e) = asm.extract(i) {
                total += e.count;
            }
        }
        assert_eq!(total, 100);
    }
}
