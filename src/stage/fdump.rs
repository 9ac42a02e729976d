use std::any::Any;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crossbeam::channel::Sender;

use crate::dispatcher::Dispatcher;
use crate::error::ExecError;
use crate::fifo::{FifoReader, FifoWriter};
use crate::functors::TupleFilter;
use crate::log_debug;
use crate::packet::{Packet, PacketCore};
use crate::stage::{Stage, StageAdaptor, StageError, StageResult};

pub const FDUMP_PACKET_TYPE: &str = "FDUMP";

/// Completion signal handed to whoever is waiting on a dump (the sort
/// stage's merge monitor). Fired when the packet is settled, after its
/// output buffer has been closed, so a woken waiter sees the final state.
pub type DumpNotify = Sender<()>;

/// Requests that an input buffer be drained to a file of packed records.
/// The output buffer carries no tuples; its end-of-stream is the signal
/// that the file is complete.
pub struct FdumpPacket {
    core: PacketCore,
    pub(crate) input: Option<FifoReader>,
    pub(crate) path: PathBuf,
    notify: Option<DumpNotify>,
}

impl FdumpPacket {
    pub fn new(
        id: impl Into<String>,
        output: FifoWriter,
        filter: Box<dyn TupleFilter>,
        input: FifoReader,
        path: impl Into<PathBuf>,
        notify: Option<DumpNotify>,
    ) -> Self {
        FdumpPacket {
            core: PacketCore::new(id, FDUMP_PACKET_TYPE, output, filter, None, false),
            input: Some(input),
            path: path.into(),
            notify,
        }
    }
}

impl Packet for FdumpPacket {
    fn core(&self) -> &PacketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PacketCore {
        &mut self.core
    }

    fn terminate_inputs(&mut self) {
        if let Some(input) = self.input.take() {
            input.terminate();
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for FdumpPacket {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(());
        }
    }
}

#[derive(Default)]
pub struct FdumpStage;

impl Stage for FdumpStage {
    fn process(&mut self, adaptor: &StageAdaptor, _dispatcher: &Dispatcher) -> StageResult {
        let (input, path) = adaptor.with_primary(|p| {
            let p = p
                .as_any_mut()
                .downcast_mut::<FdumpPacket>()
                .expect("fdump container got a foreign packet");
            (p.input.take(), p.path.clone())
        });
        let mut input = input.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("fdump packet has no input".to_string()))
        })?;
        log_debug!("FdumpStage::process {}", path.display());
        let mut writer = BufWriter::new(File::create(&path).map_err(ExecError::from)?);
        while let Some(page) = input.get_page()? {
            page.write_to(&mut writer)?;
        }
        writer.flush().map_err(ExecError::from)?;
        Ok(())
    }
}
