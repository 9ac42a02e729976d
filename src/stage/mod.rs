mod aggregate;
mod container;
mod fdump;
mod fscan;
mod hash_join;
mod merge;
mod queue;
mod sort;
mod tscan;

pub use aggregate::{AggregatePacket, AggregateStage, AGGREGATE_PACKET_TYPE};
pub use container::{StageAdaptor, StageContainer};
pub use fdump::{DumpNotify, FdumpPacket, FdumpStage, FDUMP_PACKET_TYPE};
pub use fscan::{FscanPacket, FscanStage, FSCAN_PACKET_TYPE};
pub use hash_join::{HashJoinPacket, HashJoinStage, HASH_JOIN_PACKET_TYPE};
pub use merge::{MergePacket, MergeStage, MERGE_PACKET_TYPE};
pub use queue::BlockingDeque;
pub use sort::{SortPacket, SortParams, SortStage, SORT_PACKET_TYPE};
pub use tscan::{FileSource, TScanPacket, TScanStage, TupleSource, VecSource, TSCAN_PACKET_TYPE};

use std::marker::PhantomData;

use crate::dispatcher::Dispatcher;
use crate::error::ExecError;
use crate::fifo::Aborted;

/// How a stage execution ended, beyond plain success. `Stopped` is not an
/// error: every packet in the group is satisfied or gone, so producing more
/// tuples would be wasted work.
#[derive(Debug)]
pub enum StageError {
    Stopped,
    Exec(ExecError),
}

pub type StageResult = Result<(), StageError>;

impl From<ExecError> for StageError {
    fn from(err: ExecError) -> StageError {
        StageError::Exec(err)
    }
}

impl From<Aborted> for StageError {
    fn from(err: Aborted) -> StageError {
        StageError::Exec(err.into())
    }
}

/// One stage execution: stateless across invocations, bound to a single
/// packet group through the adaptor, discarded afterwards.
pub trait Stage: Send {
    fn process(&mut self, adaptor: &StageAdaptor, dispatcher: &Dispatcher) -> StageResult;
}

pub trait StageFactory: Send + Sync {
    fn create(&self) -> Box<dyn Stage>;
}

/// Factory for stages constructible with `Default`.
pub struct DefaultFactory<S>(PhantomData<fn() -> S>);

impl<S> DefaultFactory<S> {
    pub fn new() -> Self {
        DefaultFactory(PhantomData)
    }
}

impl<S> Default for DefaultFactory<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> StageFactory for DefaultFactory<S>
where
    S: Stage + Default + 'static,
{
    fn create(&self) -> Box<dyn Stage> {
        Box::<S>::default()
    }
}
