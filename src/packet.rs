use std::any::Any;

use core_affinity::CoreId;

use crate::dispatcher::QueryState;
use crate::fifo::FifoWriter;
use crate::functors::TupleFilter;

pub type PacketId = String;

/// Counter value meaning "not currently part of a merge group".
pub const NEXT_TUPLE_UNINITIALIZED: u64 = 0;
/// Counter value stamped on every packet when its group starts running.
pub const NEXT_TUPLE_INITIAL_VALUE: u64 = 1;

/// Structural signature of the computation a packet requests, used to detect
/// work-sharing opportunities. Two packets whose plans are compatible will
/// produce identical pre-filter tuple streams, so one execution can serve
/// both. The root filter is deliberately not part of the signature: each
/// packet applies its own output filter at fan-out time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPlan {
    pub action: String,
    pub filter: String,
    pub children: Vec<QueryPlan>,
}

impl QueryPlan {
    pub fn leaf(action: impl Into<String>, filter: impl Into<String>) -> Self {
        QueryPlan {
            action: action.into(),
            filter: filter.into(),
            children: Vec::new(),
        }
    }

    pub fn node(
        action: impl Into<String>,
        filter: impl Into<String>,
        children: Vec<QueryPlan>,
    ) -> Self {
        QueryPlan {
            action: action.into(),
            filter: filter.into(),
            children,
        }
    }

    pub fn compatible(a: &QueryPlan, b: &QueryPlan) -> bool {
        if a.action != b.action || a.children.len() != b.children.len() {
            return false;
        }
        a.children
            .iter()
            .zip(&b.children)
            .all(|(ca, cb)| ca.filter == cb.filter && QueryPlan::compatible(ca, cb))
    }
}

/// State common to every packet: identity, the output half, work-sharing
/// bookkeeping, and CPU-binding assignment.
pub struct PacketCore {
    pub id: PacketId,
    packet_type: &'static str,
    output: Option<FifoWriter>,
    filter: Box<dyn TupleFilter>,
    plan: Option<QueryPlan>,
    merge_enabled: bool,

    /// The group's tuple index at the moment this packet joined it.
    pub next_tuple_on_merge: u64,
    /// For a requeued packet: the tuple index at which it becomes complete.
    /// Zero means the packet needs the whole stream.
    pub next_tuple_needed: u64,

    query_state: QueryState,
    bind_cpu: Option<CoreId>,
}

impl PacketCore {
    pub fn new(
        id: impl Into<PacketId>,
        packet_type: &'static str,
        output: FifoWriter,
        filter: Box<dyn TupleFilter>,
        plan: Option<QueryPlan>,
        merge_enabled: bool,
    ) -> Self {
        PacketCore {
            id: id.into(),
            packet_type,
            output: Some(output),
            filter,
            plan,
            merge_enabled,
            next_tuple_on_merge: NEXT_TUPLE_UNINITIALIZED,
            next_tuple_needed: NEXT_TUPLE_UNINITIALIZED,
            query_state: QueryState::Unbound,
            bind_cpu: None,
        }
    }

    pub fn packet_type(&self) -> &'static str {
        self.packet_type
    }

    pub fn filter(&self) -> &dyn TupleFilter {
        self.filter.as_ref()
    }

    pub fn output_mut(&mut self) -> Option<&mut FifoWriter> {
        self.output.as_mut()
    }

    /// Split borrow used by the fan-out path: the filter is consulted while
    /// the output buffer is written.
    pub fn filter_and_output(&mut self) -> (&dyn TupleFilter, Option<&mut FifoWriter>) {
        (self.filter.as_ref(), self.output.as_mut())
    }

    pub fn take_output(&mut self) -> Option<FifoWriter> {
        self.output.take()
    }

    pub fn plan(&self) -> Option<&QueryPlan> {
        self.plan.as_ref()
    }

    pub fn is_merge_enabled(&self) -> bool {
        self.merge_enabled && self.plan.is_some()
    }

    pub fn disable_merging(&mut self) {
        self.merge_enabled = false;
    }

    pub fn assign_query_state(&mut self, state: QueryState) {
        self.query_state = state;
    }

    pub fn query_state(&self) -> QueryState {
        self.query_state
    }

    pub fn set_bind_cpu(&mut self, cpu: Option<CoreId>) {
        self.bind_cpu = cpu;
    }

    pub fn bind_cpu(&self) -> Option<CoreId> {
        self.bind_cpu
    }
}

/// A unit of dispatchable work: the output half lives in the core, the
/// type-specific input half (upstream packet, input reader, functors) lives
/// in the implementing struct and is taken by the stage when it runs.
///
/// Dropping a packet tears its subtree down: never-dispatched input packets
/// drop recursively and fifo handles close themselves as aborted/terminated.
pub trait Packet: Any + Send {
    fn core(&self) -> &PacketCore;
    fn core_mut(&mut self) -> &mut PacketCore;

    /// Close this packet's upstream input buffers and drop never-dispatched
    /// input packets. Safe to call more than once; later calls are no-ops.
    fn terminate_inputs(&mut self);

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn is_mergeable(&self, other: &dyn Packet) -> bool {
        if !self.core().is_merge_enabled() || !other.core().is_merge_enabled() {
            return false;
        }
        if self.core().packet_type() != other.core().packet_type() {
            return false;
        }
        match (self.core().plan(), other.core().plan()) {
            (Some(a), Some(b)) => QueryPlan::compatible(a, b),
            _ => false,
        }
    }
}
