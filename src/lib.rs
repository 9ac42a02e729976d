mod engine;
mod error;
mod fifo;
mod functors;
mod packet;
mod tuple;

#[cfg(test)]
pub(crate) mod test_util;

pub mod dispatcher;
pub mod logger;
pub mod stage;

pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::ExecError;
pub use fifo::{pair, pair_with, Aborted, EndMarker, FifoReader, FifoWriter, PeerClosed};
pub use functors::{
    KeyCompare, KeyExtractor, TrivialFilter, TupleAggregate, TupleFilter, TupleJoin,
};
pub use packet::{Packet, PacketCore, PacketId, QueryPlan};
pub use tuple::{Page, DEFAULT_FIFO_PAGES, DEFAULT_PAGE_SIZE};

pub mod prelude {
    pub use super::dispatcher::{
        CpuSet, DispatchPolicy, Dispatcher, OsPolicy, QueryCpuPolicy, QueryState, RrCpuPolicy,
        RrModulePolicy,
    };
    pub use super::stage::{
        AggregatePacket, DefaultFactory, DumpNotify, FdumpPacket, FileSource, FscanPacket,
        HashJoinPacket, MergePacket, SortPacket, SortParams, Stage, StageAdaptor, StageContainer,
        StageError, StageFactory, StageResult, TScanPacket, TupleSource, VecSource,
        AGGREGATE_PACKET_TYPE, FDUMP_PACKET_TYPE, FSCAN_PACKET_TYPE, HASH_JOIN_PACKET_TYPE,
        MERGE_PACKET_TYPE, SORT_PACKET_TYPE, TSCAN_PACKET_TYPE,
    };
    pub use super::{
        pair, pair_with, Engine, EngineBuilder, EngineConfig, ExecError, FifoReader, FifoWriter,
        KeyCompare, KeyExtractor, Packet, PacketCore, PacketId, Page, QueryPlan, TrivialFilter,
        TupleAggregate, TupleFilter, TupleJoin,
    };
}
