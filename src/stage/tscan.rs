use std::any::Any;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use crate::dispatcher::Dispatcher;
use crate::error::ExecError;
use crate::fifo::FifoWriter;
use crate::functors::TupleFilter;
use crate::log_debug;
use crate::packet::{Packet, PacketCore, QueryPlan};
use crate::stage::{Stage, StageAdaptor, StageError, StageResult};

pub const TSCAN_PACKET_TYPE: &str = "TSCAN";

/// Sequential cursor over fixed-size binary records. The engine treats the
/// actual storage behind it as a black box.
pub trait TupleSource: Send {
    fn tuple_size(&self) -> usize;

    /// Identity of the underlying table/file; scans with equal signatures
    /// read identical streams and may share one execution.
    fn signature(&self) -> String;

    fn open(&mut self) -> Result<(), ExecError>;

    fn next(&mut self) -> Result<Option<&[u8]>, ExecError>;
}

/// In-memory source over a flat byte buffer of packed tuples.
pub struct VecSource {
    name: String,
    tuple_size: usize,
    data: Vec<u8>,
    pos: usize,
}

impl VecSource {
    pub fn new(name: impl Into<String>, tuple_size: usize, data: Vec<u8>) -> Self {
        assert!(tuple_size > 0 && data.len() % tuple_size == 0);
        VecSource {
            name: name.into(),
            tuple_size,
            data,
            pos: 0,
        }
    }
}

impl TupleSource for VecSource {
    fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    fn signature(&self) -> String {
        format!("vec:{}", self.name)
    }

    fn open(&mut self) -> Result<(), ExecError> {
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<&[u8]>, ExecError> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let start = self.pos;
        self.pos += self.tuple_size;
        Ok(Some(&self.data[start..self.pos]))
    }
}

/// Source over a file of packed fixed-size records.
pub struct FileSource {
    path: PathBuf,
    tuple_size: usize,
    file: Option<BufReader<File>>,
    buf: Vec<u8>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, tuple_size: usize) -> Self {
        assert!(tuple_size > 0);
        FileSource {
            path: path.into(),
            tuple_size,
            file: None,
            buf: vec![0u8; tuple_size],
        }
    }
}

impl TupleSource for FileSource {
    fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    fn signature(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn open(&mut self) -> Result<(), ExecError> {
        self.file = Some(BufReader::new(File::open(&self.path)?));
        Ok(())
    }

    fn next(&mut self) -> Result<Option<&[u8]>, ExecError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ExecError::Stage("file source used before open".to_string()))?;
        let mut filled = 0;
        while filled < self.tuple_size {
            let n = file.read(&mut self.buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ExecError::Io(format!(
                    "truncated record in {}",
                    self.path.display()
                )));
            }
            filled += n;
        }
        Ok(Some(&self.buf))
    }
}

/// Requests a full scan of one tuple source.
pub struct TScanPacket {
    core: PacketCore,
    pub(crate) source: Option<Box<dyn TupleSource>>,
}

impl TScanPacket {
    pub fn new(
        id: impl Into<String>,
        output: FifoWriter,
        filter: Box<dyn TupleFilter>,
        source: Box<dyn TupleSource>,
        merge_enabled: bool,
    ) -> Self {
        let plan = QueryPlan::leaf(format!("TSCAN({})", source.signature()), filter.signature());
        TScanPacket {
            core: PacketCore::new(
                id,
                TSCAN_PACKET_TYPE,
                output,
                filter,
                Some(plan),
                merge_enabled,
            ),
            source: Some(source),
        }
    }
}

impl Packet for TScanPacket {
    fn core(&self) -> &PacketCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PacketCore {
        &mut self.core
    }

    fn terminate_inputs(&mut self) {
        self.source.take();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct TScanStage;

impl Stage for TScanStage {
    fn process(&mut self, adaptor: &StageAdaptor, _dispatcher: &Dispatcher) -> StageResult {
        log_debug!("TScanStage::process");
        let mut source = adaptor
            .with_primary(|p| {
                let p = p
                    .as_any_mut()
                    .downcast_mut::<TScanPacket>()
                    .expect("tscan container got a foreign packet");
                p.source.take()
            })
            .ok_or_else(|| {
                StageError::Exec(ExecError::Stage("tscan packet has no source".to_string()))
            })?;
        source.open()?;
        while let Some(tuple) = source.next()? {
            adaptor.output(tuple)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_source_yields_all_tuples() {
        let mut data = Vec::new();
        for i in 0u64..5 {
            data.extend_from_slice(&i.to_le_bytes());
        }
        let mut source = VecSource::new("t", 8, data);
        source.open().unwrap();
        let mut seen = Vec::new();
        while let Some(t) = source.next().unwrap() {
            seen.push(u64::from_le_bytes(t.try_into().unwrap()));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_file_source_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.dat");
        let mut bytes = Vec::new();
        for i in 0u32..100 {
            bytes.extend_from_slice(&i.to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();

        let mut source = FileSource::new(&path, 4);
        source.open().unwrap();
        let mut count = 0u32;
        while let Some(t) = source.next().unwrap() {
            assert_eq!(u32::from_le_bytes(t.try_into().unwrap()), count);
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn test_file_source_rejects_truncated_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        std::fs::write(&path, [0u8; 6]).unwrap();
        let mut source = FileSource::new(&path, 4);
        source.open().unwrap();
        assert!(source.next().unwrap().is_some());
        assert!(source.next().is_err());
    }
}
