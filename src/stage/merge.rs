use std::any::Any;
use std::cmp::Ordering;

use crate::dispatcher::Dispatcher;
use crate::error::ExecError;
use crate::fifo::{FifoReader, FifoWriter};
use crate::functors::{KeyCompare, KeyExtractor, TupleFilter};
use crate::log_debug;
use crate::packet::{Packet, PacketCore};
use crate::stage::{Stage, StageAdaptor, StageError, StageResult};

pub const MERGE_PACKET_TYPE: &str = "MERGE";

/// Requests an N-way ordered merge of already-sorted input buffers.
pub struct MergePacket {
    core: PacketCore,
    pub(crate) inputs: Vec<FifoReader>,
    pub(crate) extract: Option<Box<dyn KeyExtractor>>,
    pub(crate) compare: Option<Box<dyn KeyCompare>>,
}

impl MergePacket {
    pub fn new(
        id: impl Into<String>,
        output: FifoWriter,
        filter: Box<dyn TupleFilter>,
        inputs: Vec<FifoReader>,
        extract: Box<dyn KeyExtractor>,
        compare: Box<dyn KeyCompare>,
    ) -> Self {
        MergePacket {
            core: PacketCore::new(id, MERGE_PACKET_TYPE, output, filter, None, false),
            inputs,
            extract: Some(extract),
            compare: Some(compare),
        }
    }
}

impl Packet for MergePacket {
    fn core(&self) -> &PacketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PacketCore {
        &mut self.core
    }

    fn terminate_inputs(&mut self) {
        for input in self.inputs.drain(..) {
            input.terminate();
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// The merge keeps its inputs in a list ordered by next key rather than in a
// heap. At the fan-ins used here (around 7 to 15) the list wins: a 7-way
// merge costs about 3.5 comparisons and at most one move per tuple, where a
// heap costs about 3.7 comparisons and 1.4 swaps; at 15-way the list needs
// 7.5 comparisons but still one move, against the heap's 5.0 comparisons and
// ~2.3 swaps, and the heap's swaps are the expensive part.
struct BufferHead {
    reader: FifoReader,
    tuple: Vec<u8>,
    hint: i64,
}

impl BufferHead {
    /// Pull the next tuple out of the reader into this head. Returns false
    /// once the reader is exhausted.
    fn refill(&mut self) -> Result<bool, StageError> {
        match self.reader.get_tuple()? {
            Some(tuple) => {
                self.tuple.clear();
                self.tuple.extend_from_slice(tuple);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn rekey(&mut self, extract: &dyn KeyExtractor) {
        self.hint = extract.extract_hint(&self.tuple);
    }
}

#[derive(Default)]
pub struct MergeStage;

impl MergeStage {
    fn head_cmp(compare: &dyn KeyCompare, a: &BufferHead, b: &BufferHead) -> Ordering {
        a.hint
            .cmp(&b.hint)
            .then_with(|| compare.compare(&a.tuple, &b.tuple))
    }

    /// Walk the ascending list and splice the head in before the first
    /// larger entry.
    fn insert_sorted(heads: &mut Vec<BufferHead>, head: BufferHead, compare: &dyn KeyCompare) {
        let pos = heads
            .iter()
            .position(|h| Self::head_cmp(compare, &head, h) == Ordering::Less)
            .unwrap_or(heads.len());
        heads.insert(pos, head);
    }
}

impl Stage for MergeStage {
    fn process(&mut self, adaptor: &StageAdaptor, _dispatcher: &Dispatcher) -> StageResult {
        let (inputs, extract, compare) = adaptor.with_primary(|p| {
            let p = p
                .as_any_mut()
                .downcast_mut::<MergePacket>()
                .expect("merge container got a foreign packet");
            (
                std::mem::take(&mut p.inputs),
                p.extract.take(),
                p.compare.take(),
            )
        });
        let extract = extract.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("merge packet has no extractor".to_string()))
        })?;
        let compare = compare.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("merge packet has no comparator".to_string()))
        })?;
        log_debug!("MergeStage::process over {} inputs", inputs.len());

        let mut heads: Vec<BufferHead> = Vec::with_capacity(inputs.len());
        for reader in inputs {
            let mut head = BufferHead {
                reader,
                tuple: Vec::new(),
                hint: 0,
            };
            if head.refill()? {
                head.rekey(extract.as_ref());
                Self::insert_sorted(&mut heads, head, compare.as_ref());
            }
            // an exhausted input contributes nothing; dropping the reader
            // closes it
        }

        while !heads.is_empty() {
            let mut head = heads.remove(0);
            adaptor.output(&head.tuple)?;
            if head.refill()? {
                head.rekey(extract.as_ref());
                Self::insert_sorted(&mut heads, head, compare.as_ref());
            }
        }
        Ok(())
    }
}
