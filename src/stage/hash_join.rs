use std::any::Any;
use std::collections::HashMap;

use crate::dispatcher::Dispatcher;
use crate::error::ExecError;
use crate::fifo::{FifoReader, FifoWriter};
use crate::functors::{TupleFilter, TupleJoin};
use crate::log_debug;
use crate::packet::{Packet, PacketCore, QueryPlan};
use crate::stage::{Stage, StageAdaptor, StageError, StageResult};

pub const HASH_JOIN_PACKET_TYPE: &str = "HASH_JOIN";

/// Requests an equi-join: the left input is read whole into an in-memory
/// table keyed by its join key, then the right input streams through it.
pub struct HashJoinPacket {
    core: PacketCore,
    pub(crate) left: Option<Box<dyn Packet>>,
    pub(crate) left_buffer: Option<FifoReader>,
    pub(crate) right: Option<Box<dyn Packet>>,
    pub(crate) right_buffer: Option<FifoReader>,
    pub(crate) join: Option<Box<dyn TupleJoin>>,
}

impl HashJoinPacket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        output: FifoWriter,
        filter: Box<dyn TupleFilter>,
        join: Box<dyn TupleJoin>,
        left: Box<dyn Packet>,
        left_buffer: FifoReader,
        right: Box<dyn Packet>,
        right_buffer: FifoReader,
        merge_enabled: bool,
    ) -> Self {
        let plan = match (left.core().plan(), right.core().plan()) {
            (Some(l), Some(r)) => Some(QueryPlan::node(
                format!("HASH_JOIN({})", join.signature()),
                filter.signature(),
                vec![l.clone(), r.clone()],
            )),
            _ => None,
        };
        HashJoinPacket {
            core: PacketCore::new(id, HASH_JOIN_PACKET_TYPE, output, filter, plan, merge_enabled),
            left: Some(left),
            left_buffer: Some(left_buffer),
            right: Some(right),
            right_buffer: Some(right_buffer),
            join: Some(join),
        }
    }
}

impl Packet for HashJoinPacket {
    fn core(&self) -> &PacketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PacketCore {
        &mut self.core
    }

    fn terminate_inputs(&mut self) {
        if let Some(buffer) = self.left_buffer.take() {
            buffer.terminate();
        }
        if let Some(buffer) = self.right_buffer.take() {
            buffer.terminate();
        }
        self.left.take();
        self.right.take();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct HashJoinStage;

impl Stage for HashJoinStage {
    fn process(&mut self, adaptor: &StageAdaptor, dispatcher: &Dispatcher) -> StageResult {
        let (left, left_buffer, right, right_buffer, join) = adaptor.with_primary(|p| {
            let p = p
                .as_any_mut()
                .downcast_mut::<HashJoinPacket>()
                .expect("hash join container got a foreign packet");
            (
                p.left.take(),
                p.left_buffer.take(),
                p.right.take(),
                p.right_buffer.take(),
                p.join.take(),
            )
        });
        let join = join.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("join packet has no join functor".to_string()))
        })?;
        let mut left_buffer = left_buffer.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("join packet has no build input".to_string()))
        })?;
        let mut right_buffer = right_buffer.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("join packet has no probe input".to_string()))
        })?;

        // build side first
        if let Some(left) = left {
            dispatcher.dispatch(left)?;
        }
        log_debug!("HashJoinStage::process building");
        let mut table: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
        while let Some(tuple) = left_buffer.get_tuple()? {
            table
                .entry(join.left_key(tuple).to_vec())
                .or_default()
                .push(tuple.to_vec());
        }

        // probe side streams
        if let Some(right) = right {
            dispatcher.dispatch(right)?;
        }
        log_debug!("HashJoinStage::process probing {} keys", table.len());
        let mut out = vec![0u8; join.output_size()];
        while let Some(tuple) = right_buffer.get_tuple()? {
            if let Some(matches) = table.get(join.right_key(tuple)) {
                for left_tuple in matches {
                    join.join(&mut out, left_tuple, tuple);
                    adaptor.output(&out)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::fifo;
    use crate::functors::TrivialFilter;
    use crate::stage::{TScanPacket, VecSource};

    /// Joins 16-byte (key, payload) rows on the leading u64 key, emitting
    /// (key, left payload, right payload).
    struct PairJoin;

    impl TupleJoin for PairJoin {
        fn left_size(&self) -> usize {
            16
        }
        fn right_size(&self) -> usize {
            16
        }
        fn output_size(&self) -> usize {
            24
        }
        fn left_key<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
            &tuple[..8]
        }
        fn right_key<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
            &tuple[..8]
        }
        fn join(&self, dst: &mut [u8], left: &[u8], right: &[u8]) {
            dst[..8].copy_from_slice(&left[..8]);
            dst[8..16].copy_from_slice(&left[8..16]);
            dst[16..24].copy_from_slice(&right[8..16]);
        }
        fn signature(&self) -> String {
            "pair-join".to_string()
        }
        fn clone_box(&self) -> Box<dyn TupleJoin> {
            Box::new(PairJoin)
        }
    }

    fn rows(tuples: &[(u64, u64)]) -> Vec<u8> {
        let mut data = Vec::new();
        for (k, v) in tuples {
            data.extend_from_slice(&k.to_le_bytes());
            data.extend_from_slice(&v.to_le_bytes());
        }
        data
    }

    fn scan(id: &str, table: &str, data: Vec<u8>, output: fifo::FifoWriter) -> Box<TScanPacket> {
        Box::new(TScanPacket::new(
            id,
            output,
            Box::new(TrivialFilter::new(16)),
            Box::new(VecSource::new(table, 16, data)),
            false,
        ))
    }

    #[test]
    fn test_inner_join_matches_keys() {
        let engine = Engine::new();
        let left = rows(&[(1, 100), (2, 200), (2, 201), (4, 400)]);
        let right = rows(&[(2, 20), (3, 30), (4, 40)]);

        let (lw, lr) = fifo::pair(16);
        let (rw, rr) = fifo::pair(16);
        let (out_w, mut out_r) = fifo::pair(24);
        let packet = HashJoinPacket::new(
            "join-test",
            out_w,
            Box::new(TrivialFilter::new(24)),
            Box::new(PairJoin),
            scan("join-left", "l", left, lw),
            lr,
            scan("join-right", "r", right, rw),
            rr,
            false,
        );
        engine.dispatch(Box::new(packet)).unwrap();

        let mut joined = Vec::new();
        while let Some(t) = out_r.get_tuple().unwrap() {
            joined.push((
                u64::from_le_bytes(t[..8].try_into().unwrap()),
                u64::from_le_bytes(t[8..16].try_into().unwrap()),
                u64::from_le_bytes(t[16..24].try_into().unwrap()),
            ));
        }
        joined.sort_unstable();
        assert_eq!(joined, vec![(2, 200, 20), (2, 201, 20), (4, 400, 40)]);
    }
}
