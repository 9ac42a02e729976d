use std::cmp::Ordering;

/// Per-packet output filter: selection plus projection applied to every
/// tuple a stage produces for that packet. Implementations must be cheap to
/// clone since merged packets each carry their own instance.
pub trait TupleFilter: Send {
    /// Size of the tuples the stage produces.
    fn input_size(&self) -> usize;

    /// Size of the tuples written to the packet's output buffer.
    fn output_size(&self) -> usize;

    fn select(&self, _tuple: &[u8]) -> bool {
        true
    }

    /// Project `src` into `dst`. `dst` is exactly `output_size` bytes.
    fn project(&self, dst: &mut [u8], src: &[u8]);

    /// String form used in work-sharing signatures: two filters with equal
    /// signatures must make identical select/project decisions.
    fn signature(&self) -> String;

    fn clone_box(&self) -> Box<dyn TupleFilter>;
}

/// Pass-through filter: selects everything, projects by copy.
pub struct TrivialFilter {
    tuple_size: usize,
}

impl TrivialFilter {
    pub fn new(tuple_size: usize) -> Self {
        TrivialFilter { tuple_size }
    }
}

impl TupleFilter for TrivialFilter {
    fn input_size(&self) -> usize {
        self.tuple_size
    }

    fn output_size(&self) -> usize {
        self.tuple_size
    }

    fn project(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }

    fn signature(&self) -> String {
        format!("trivial({})", self.tuple_size)
    }

    fn clone_box(&self) -> Box<dyn TupleFilter> {
        Box::new(TrivialFilter {
            tuple_size: self.tuple_size,
        })
    }
}

/// Cheap sortable proxy key. The hint orders most pairs without touching the
/// full comparator; ties fall through to `KeyCompare`.
pub trait KeyExtractor: Send {
    fn extract_hint(&self, tuple: &[u8]) -> i64;
    fn clone_box(&self) -> Box<dyn KeyExtractor>;
}

/// Full three-way comparison, consulted only when hints tie.
pub trait KeyCompare: Send {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
    fn clone_box(&self) -> Box<dyn KeyCompare>;
}

/// Compare two tuples by hint first, then by the full comparator.
pub fn compare_hinted(
    extract: &dyn KeyExtractor,
    compare: &dyn KeyCompare,
    a: &[u8],
    b: &[u8],
) -> Ordering {
    extract
        .extract_hint(a)
        .cmp(&extract.extract_hint(b))
        .then_with(|| compare.compare(a, b))
}

/// Aggregation functor. The stage owns a scratch state of `state_size` bytes
/// per group; groups break when the extracted key changes, so the input is
/// expected grouped (typically sorted) on that key.
pub trait TupleAggregate: Send {
    /// Size of the grouping key, in bytes. Zero means a single global group.
    fn key_size(&self) -> usize;

    /// The grouping key bytes of an input tuple.
    fn key<'a>(&self, tuple: &'a [u8]) -> &'a [u8];

    fn state_size(&self) -> usize;

    /// Size of the emitted per-group tuples.
    fn output_size(&self) -> usize;

    fn init(&self, state: &mut [u8]);

    fn accumulate(&self, state: &mut [u8], tuple: &[u8]);

    /// Fold the finished state into an output tuple of `output_size` bytes.
    fn finish(&self, dst: &mut [u8], state: &[u8], key: &[u8]);

    /// String form used in work-sharing signatures.
    fn signature(&self) -> String;

    fn clone_box(&self) -> Box<dyn TupleAggregate>;
}

/// Join functor: key extraction on both sides plus output assembly.
pub trait TupleJoin: Send {
    fn left_size(&self) -> usize;
    fn right_size(&self) -> usize;
    fn output_size(&self) -> usize;

    fn left_key<'a>(&self, tuple: &'a [u8]) -> &'a [u8];
    fn right_key<'a>(&self, tuple: &'a [u8]) -> &'a [u8];

    /// Assemble the joined tuple into `dst` (`output_size` bytes).
    fn join(&self, dst: &mut [u8], left: &[u8], right: &[u8]);

    /// String form used in work-sharing signatures.
    fn signature(&self) -> String;

    fn clone_box(&self) -> Box<dyn TupleJoin>;
}
