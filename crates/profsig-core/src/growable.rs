//! The unbounded, single-threaded aggregate. Owned by the collector
//! session; never touched from signal context.

use std::collections::HashMap;

use profsig_types::CallTrace;

#[derive(Default)]
pub struct GrowableTraceMultiset {
    counts: HashMap<CallTrace, u64>,
}

impl GrowableTraceMultiset {
    pub fn new() -> Self {
        GrowableTraceMultiset::default()
    }

    pub fn record(&mut self, trace: CallTrace, count: u64) {
        *self.counts.entry(trace).or_insert(0) += count;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn into_entries(self) -> impl Iterator<Item = (CallTrace, u64)> {
        self.counts.into_iter()
    }
}
