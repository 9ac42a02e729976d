use std::any::Any;

use crate::dispatcher::Dispatcher;
use crate::error::ExecError;
use crate::fifo::{FifoReader, FifoWriter};
use crate::functors::{TupleAggregate, TupleFilter};
use crate::log_debug;
use crate::packet::{Packet, PacketCore, QueryPlan};
use crate::stage::{Stage, StageAdaptor, StageError, StageResult};

pub const AGGREGATE_PACKET_TYPE: &str = "AGGREGATE";

/// Requests aggregation of an upstream packet's output. Groups break when
/// the extracted key changes, so inputs are expected grouped (typically
/// sorted) on the aggregation key; a zero-sized key aggregates everything
/// into one group.
pub struct AggregatePacket {
    core: PacketCore,
    pub(crate) input: Option<Box<dyn Packet>>,
    pub(crate) input_buffer: Option<FifoReader>,
    pub(crate) aggregate: Option<Box<dyn TupleAggregate>>,
}

impl AggregatePacket {
    pub fn new(
        id: impl Into<String>,
        output: FifoWriter,
        filter: Box<dyn TupleFilter>,
        aggregate: Box<dyn TupleAggregate>,
        input: Box<dyn Packet>,
        input_buffer: FifoReader,
        merge_enabled: bool,
    ) -> Self {
        let plan = input.core().plan().map(|child| {
            QueryPlan::node(
                format!("AGGREGATE({})", aggregate.signature()),
                filter.signature(),
                vec![child.clone()],
            )
        });
        AggregatePacket {
            core: PacketCore::new(id, AGGREGATE_PACKET_TYPE, output, filter, plan, merge_enabled),
            input: Some(input),
            input_buffer: Some(input_buffer),
            aggregate: Some(aggregate),
        }
    }
}

impl Packet for AggregatePacket {
    fn core(&self) -> &PacketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PacketCore {
        &mut self.core
    }

    fn terminate_inputs(&mut self) {
        if let Some(input_buffer) = self.input_buffer.take() {
            input_buffer.terminate();
        }
        // a never-dispatched input packet tears its own subtree down on drop
        self.input.take();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct AggregateStage;

impl Stage for AggregateStage {
    fn process(&mut self, adaptor: &StageAdaptor, dispatcher: &Dispatcher) -> StageResult {
        let (input, input_buffer, aggregate) = adaptor.with_primary(|p| {
            let p = p
                .as_any_mut()
                .downcast_mut::<AggregatePacket>()
                .expect("aggregate container got a foreign packet");
            (p.input.take(), p.input_buffer.take(), p.aggregate.take())
        });
        let mut reader = input_buffer.ok_or_else(|| {
            StageError::Exec(ExecError::Stage(
                "aggregate packet has no input buffer".to_string(),
            ))
        })?;
        let aggregate = aggregate.ok_or_else(|| {
            StageError::Exec(ExecError::Stage(
                "aggregate packet has no aggregator".to_string(),
            ))
        })?;
        if let Some(input) = input {
            dispatcher.dispatch(input)?;
        }
        log_debug!("AggregateStage::process");

        let mut state = vec![0u8; aggregate.state_size()];
        let mut out = vec![0u8; aggregate.output_size()];
        let mut group_key: Vec<u8> = Vec::new();
        let mut in_group = false;

        while let Some(tuple) = reader.get_tuple()? {
            let key = aggregate.key(tuple);
            if !in_group {
                aggregate.init(&mut state);
                group_key = key.to_vec();
                in_group = true;
            } else if key != group_key.as_slice() {
                aggregate.finish(&mut out, &state, &group_key);
                adaptor.output(&out)?;
                aggregate.init(&mut state);
                group_key = key.to_vec();
            }
            aggregate.accumulate(&mut state, tuple);
        }
        if in_group {
            aggregate.finish(&mut out, &state, &group_key);
            adaptor.output(&out)?;
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
    use crate::test_util::CountAggregate;

    /// Count per leading-u64 key over 16-byte tuples.
    struct GroupedCount;

    impl TupleAggregate for GroupedCount {
        fn key_size(&self) -> usize {
            8
        }
        fn key<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
            &tuple[..8]
        }
        fn state_size(&self) -> usize {
            8
        }
        fn output_size(&self) -> usize {
            16
        }
        fn init(&self, state: &mut [u8]) {
            state.fill(0);
        }
        fn accumulate(&self, state: &mut [u8], _tuple: &[u8]) {
            let count = u64::from_le_bytes(state[..8].try_into().unwrap());
            state[..8].copy_from_slice(&(count + 1).to_le_bytes());
        }
        fn finish(&self, dst: &mut [u8], state: &[u8], key: &[u8]) {
            dst[..8].copy_from_slice(key);
            dst[8..].copy_from_slice(&state[..8]);
        }
        fn signature(&self) -> String {
            "grouped-count".to_string()
        }
        fn clone_box(&self) -> Box<dyn TupleAggregate> {
            Box::new(GroupedCount)
        }
    }

    fn pairs(tuples: &[(u64, u64)]) -> Vec<u8> {
        let mut data = Vec::new();
        for (k, v) in tuples {
            data.extend_from_slice(&k.to_le_bytes());
            data.extend_from_slice(&v.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_grouped_count_breaks_on_key_change() {
        let engine = Engine::new();
        let rows = [(1u64, 0u64), (1, 0), (1, 0), (2, 0), (3, 0), (3, 0)];
        let (in_w, in_r) = fifo::pair(16);
        let scan = Box::new(TScanPacket::new(
            "agg-scan",
            in_w,
            Box::new(TrivialFilter::new(16)),
            Box::new(VecSource::new("grouped", 16, pairs(&rows))),
            false,
        ));
        let (out_w, mut out_r) = fifo::pair(16);
        let packet = AggregatePacket::new(
            "agg-grouped",
            out_w,
            Box::new(TrivialFilter::new(16)),
            Box::new(GroupedCount),
            scan,
            in_r,
            false,
        );
        engine.dispatch(Box::new(packet)).unwrap();

        let mut groups = Vec::new();
        while let Some(t) = out_r.get_tuple().unwrap() {
            groups.push((
                u64::from_le_bytes(t[..8].try_into().unwrap()),
                u64::from_le_bytes(t[8..].try_into().unwrap()),
            ));
        }
        assert_eq!(groups, vec![(1, 3), (2, 1), (3, 2)]);
    }

    #[test]
    fn test_count_over_empty_input_emits_nothing() {
        let engine = Engine::new();
        let (in_w, in_r) = fifo::pair(8);
        let scan = Box::new(TScanPacket::new(
            "agg-empty-scan",
            in_w,
            Box::new(TrivialFilter::new(8)),
            Box::new(VecSource::new("empty", 8, Vec::new())),
            false,
        ));
        let (out_w, mut out_r) = fifo::pair(8);
        let packet = AggregatePacket::new(
            "agg-empty",
            out_w,
            Box::new(TrivialFilter::new(8)),
            Box::new(CountAggregate),
            scan,
            in_r,
            false,
        );
        engine.dispatch(Box::new(packet)).unwrap();
        assert_eq!(out_r.get_tuple().unwrap(), None);
    }
}
