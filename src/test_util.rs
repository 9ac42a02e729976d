//! Helpers shared by the unit tests: integer tuple functors and generators.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::fifo::FifoReader;
use crate::functors::{KeyCompare, KeyExtractor, TupleAggregate};
use crate::stage::{Stage, StageFactory};

/// Ascending key over little-endian u64 tuples.
pub struct IntExtract;

impl KeyExtractor for IntExtract {
    fn extract_hint(&self, tuple: &[u8]) -> i64 {
        u64::from_le_bytes(tuple[..8].try_into().unwrap()) as i64
    }

    fn clone_box(&self) -> Box<dyn KeyExtractor> {
        Box::new(IntExtract)
    }
}

pub struct IntCompare;

impl KeyCompare for IntCompare {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a = u64::from_le_bytes(a[..8].try_into().unwrap());
        let b = u64::from_le_bytes(b[..8].try_into().unwrap());
        a.cmp(&b)
    }

    fn clone_box(&self) -> Box<dyn KeyCompare> {
        Box::new(IntCompare)
    }
}

/// Global count over any input: one u64 output tuple.
pub struct CountAggregate;

impl TupleAggregate for CountAggregate {
    fn key_size(&self) -> usize {
        0
    }

    fn key<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
        &tuple[..0]
    }

    fn state_size(&self) -> usize {
        8
    }

    fn output_size(&self) -> usize {
        8
    }

    fn init(&self, state: &mut [u8]) {
        state.fill(0);
    }

    fn accumulate(&self, state: &mut [u8], _tuple: &[u8]) {
        let count = u64::from_le_bytes(state[..8].try_into().unwrap());
        state[..8].copy_from_slice(&(count + 1).to_le_bytes());
    }

    fn finish(&self, dst: &mut [u8], state: &[u8], _key: &[u8]) {
        dst.copy_from_slice(&state[..8]);
    }

    fn signature(&self) -> String {
        "count".to_string()
    }

    fn clone_box(&self) -> Box<dyn TupleAggregate> {
        Box::new(CountAggregate)
    }
}

pub fn u64_tuples(values: impl IntoIterator<Item = u64>) -> Vec<u8> {
    let mut data = Vec::new();
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    data
}

/// Drain a reader of u64 tuples until clean EOF.
pub fn read_u64s(reader: &mut FifoReader) -> Vec<u64> {
    let mut out = Vec::new();
    while let Some(t) = reader.get_tuple().expect("stream aborted") {
        out.push(u64::from_le_bytes(t[..8].try_into().unwrap()));
    }
    out
}

/// Deterministic shuffle of 0..n.
pub fn shuffled(n: u64) -> Vec<u64> {
    let mut values: Vec<u64> = (0..n).collect();
    let mut state = 0x2545f4914f6cdd1du64;
    for i in (1..values.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        values.swap(i, (state % (i as u64 + 1)) as usize);
    }
    values
}

/// Wraps a factory and counts how many stage executions it produced.
pub struct CountingFactory {
    inner: Box<dyn StageFactory>,
    count: Arc<AtomicUsize>,
}

impl CountingFactory {
    pub fn new(inner: Box<dyn StageFactory>) -> (Self, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (
            CountingFactory {
                inner,
                count: count.clone(),
            },
            count,
        )
    }
}

impl StageFactory for CountingFactory {
    fn create(&self) -> Box<dyn Stage> {
        self.count.fetch_add(1, AtomicOrdering::SeqCst);
        self.inner.create()
    }
}
