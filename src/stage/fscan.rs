use std::any::Any;
use std::fs::File;
use std::path::PathBuf;

use crate::dispatcher::Dispatcher;
use crate::fifo::FifoWriter;
use crate::functors::TupleFilter;
use crate::log_debug;
use crate::packet::{Packet, PacketCore, QueryPlan};
use crate::stage::{Stage, StageAdaptor, StageResult};
use crate::tuple::{Page, DEFAULT_PAGE_SIZE};

pub const FSCAN_PACKET_TYPE: &str = "FSCAN";

/// Requests a scan of a file of packed fixed-size records, page at a time.
/// The sort stage uses these to read its run files back.
pub struct FscanPacket {
    core: PacketCore,
    pub(crate) path: PathBuf,
}

impl FscanPacket {
    pub fn new(
        id: impl Into<String>,
        output: FifoWriter,
        filter: Box<dyn TupleFilter>,
        path: impl Into<PathBuf>,
    ) -> Self {
        let path = path.into();
        let plan = QueryPlan::leaf(
            format!("FSCAN({})", path.display()),
            filter.signature(),
        );
        FscanPacket {
            core: PacketCore::new(id, FSCAN_PACKET_TYPE, output, filter, Some(plan), false),
            path,
        }
    }
}

impl Packet for FscanPacket {
    fn core(&self) -> &PacketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PacketCore {
        &mut self.core
    }

    fn terminate_inputs(&mut self) {
        // the file belongs to whoever created it
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct FscanStage;

impl Stage for FscanStage {
    fn process(&mut self, adaptor: &StageAdaptor, _dispatcher: &Dispatcher) -> StageResult {
        let path = adaptor.with_primary(|p| {
            p.as_any_mut()
                .downcast_mut::<FscanPacket>()
                .expect("fscan container got a foreign packet")
                .path
                .clone()
        });
        log_debug!("FscanStage::process {}", path.display());
        let mut file = File::open(&path).map_err(crate::error::ExecError::from)?;
        let mut page = Page::alloc(adaptor.tuple_size(), DEFAULT_PAGE_SIZE);
        while page.read_from(&mut file)? {
            for tuple in page.iter() {
                adaptor.output(tuple)?;
            }
        }
        Ok(())
    }
}
