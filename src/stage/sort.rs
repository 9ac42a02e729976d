use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use tempfile::TempDir;

use crate::dispatcher::{Dispatcher, QueryState};
use crate::error::ExecError;
use crate::fifo::{self, EndMarker, FifoReader, FifoWriter};
use crate::functors::{KeyCompare, KeyExtractor, TrivialFilter, TupleFilter};
use crate::packet::{Packet, PacketCore};
use crate::stage::{
    FdumpPacket, FscanPacket, MergePacket, Stage, StageAdaptor, StageError, StageResult,
};
use crate::tuple::Page;
use crate::{log_debug, log_info, log_warn};

pub const SORT_PACKET_TYPE: &str = "SORT";

/// Level key of the merge whose output feeds the sort output directly.
const FINAL_MERGE_LEVEL: i32 = -1;

#[derive(Clone, Debug)]
pub struct SortParams {
    /// Input pages consumed per initial sorted run.
    pub pages_per_run: usize,
    /// Fan-in of the background merges. Must not exceed the engine's scan
    /// worker pool, or a merge can starve waiting for its own run scans.
    pub merge_factor: usize,
    /// Where to put the per-sort temp directory; system default if `None`.
    pub temp_root: Option<PathBuf>,
}

impl Default for SortParams {
    fn default() -> Self {
        SortParams {
            pages_per_run: 64,
            merge_factor: 8,
            temp_root: None,
        }
    }
}

/// Requests a full sort of an upstream packet's output.
pub struct SortPacket {
    core: PacketCore,
    pub(crate) input: Option<Box<dyn Packet>>,
    pub(crate) input_buffer: Option<FifoReader>,
    pub(crate) extract: Option<Box<dyn KeyExtractor>>,
    pub(crate) compare: Option<Box<dyn KeyCompare>>,
    pub(crate) params: SortParams,
}

impl SortPacket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        output: FifoWriter,
        filter: Box<dyn TupleFilter>,
        extract: Box<dyn KeyExtractor>,
        compare: Box<dyn KeyCompare>,
        input: Box<dyn Packet>,
        input_buffer: FifoReader,
        params: SortParams,
    ) -> Self {
        SortPacket {
            core: PacketCore::new(id, SORT_PACKET_TYPE, output, filter, None, false),
            input: Some(input),
            input_buffer: Some(input_buffer),
            extract: Some(extract),
            compare: Some(compare),
            params,
        }
    }
}

impl Packet for SortPacket {
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
        self.input.take();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

enum RunEvent {
    Run { file: PathBuf, finished: bool },
}

enum RunOutcome {
    /// The whole input fit in one chunk and was emitted directly.
    InMemory,
    /// Runs went to disk; the final merge supplies the output.
    Spilled,
}

struct MergeEntry {
    output: PathBuf,
    inputs: Vec<PathBuf>,
    /// Output of the merge's file dump. Carries no tuples; its end marker is
    /// how the monitor learns the merge finished (or died).
    signal: FifoReader,
}

/// Bookkeeping run on the sort's monitor thread: collects finished runs per
/// level, fires background merges once enough accumulate, and decides when
/// the final merge can start. Mostly blocked; wakes on run arrivals and dump
/// completions.
struct MergeMonitor {
    dispatcher: Dispatcher,
    temp_dir: Arc<TempDir>,
    tuple_size: usize,
    merge_factor: usize,
    /// Sub-packets run on behalf of the sort's query and inherit its
    /// dispatch state.
    query_state: QueryState,
    extract: Box<dyn KeyExtractor>,
    compare: Box<dyn KeyCompare>,
    run_rx: Receiver<RunEvent>,
    done_rx: Receiver<()>,
    done_tx: Sender<()>,
    run_map: BTreeMap<i32, Vec<PathBuf>>,
    merge_map: BTreeMap<i32, Vec<MergeEntry>>,
    sorting_finished: bool,
    final_output: Option<FifoReader>,
    merge_seq: usize,
}

impl MergeMonitor {
    fn run(mut self) -> Result<Option<FifoReader>, ExecError> {
        let mut runs_open = true;
        loop {
            if runs_open {
                crossbeam::select! {
                    recv(self.run_rx) -> msg => match msg {
                        Ok(RunEvent::Run { file, finished }) => {
                            log_debug!("run {} ready (finished={})", file.display(), finished);
                            self.run_map.entry(0).or_default().push(file);
                            if finished {
                                self.sorting_finished = true;
                            }
                        }
                        Err(_) => {
                            if !self.sorting_finished {
                                // cancelled: the input fit in memory or the
                                // run generator failed; in-flight sub-work
                                // unwinds through its terminated buffers
                                return Ok(None);
                            }
                            runs_open = false;
                        }
                    },
                    recv(self.done_rx) -> msg => {
                        let _ = msg;
                    }
                }
            } else {
                // run generation is over; only dump completions move things
                if self.done_rx.recv().is_err() {
                    return Ok(None);
                }
            }
            self.check_finished_merges()?;
            self.start_new_merges()?;
            if let Some(reader) = self.final_output.take() {
                return Ok(Some(reader));
            }
        }
    }

    /// Move completed merges into the run map one level up and delete the
    /// run files they consumed.
    fn check_finished_merges(&mut self) -> Result<(), ExecError> {
        let levels: Vec<i32> = self.merge_map.keys().copied().collect();
        for level in levels {
            let entries = self.merge_map.remove(&level).unwrap();
            let mut remaining = Vec::new();
            for entry in entries {
                match entry.signal.poll_end() {
                    Some(EndMarker::Eof) => {
                        log_debug!("merge finished: {}", entry.output.display());
                        self.run_map.entry(level).or_default().push(entry.output);
                        remove_input_files(&entry.inputs);
                    }
                    Some(EndMarker::Aborted) => {
                        return Err(ExecError::Sort(
                            "background merge aborted".to_string(),
                        ));
                    }
                    None | Some(EndMarker::Open) => remaining.push(entry),
                }
            }
            if !remaining.is_empty() {
                self.merge_map.insert(level, remaining);
            }
        }
        Ok(())
    }

    /// Fire a merge wherever a level has accumulated a full fan-in. Once run
    /// generation has finished, leftover runs below the fan-in are promoted,
    /// partially merged, or fed to the final merge, whichever keeps the
    /// total merge count lowest.
    fn start_new_merges(&mut self) -> Result<(), ExecError> {
        let levels: Vec<i32> = self.run_map.keys().copied().collect();
        for level in levels {
            let mut runs = match self.run_map.remove(&level) {
                Some(runs) => runs,
                None => continue,
            };
            let mut started_merges = false;
            while runs.len() >= self.merge_factor {
                self.start_merge(level + 1, &mut runs, self.merge_factor)?;
                started_merges = true;
            }
            if runs.is_empty() {
                continue;
            }
            if !self.sorting_finished || started_merges {
                self.run_map.insert(level, runs);
                continue;
            }

            let next_run = self
                .run_map
                .range(level + 1..)
                .next()
                .map(|(l, r)| (*l, r.len()));
            let lowest_merge = self.merge_map.iter().next().map(|(l, m)| (*l, m.len()));

            if let Some((merge_level, _)) = lowest_merge {
                if merge_level <= level {
                    // merges are still running at or below this level; wait
                    // for their results before moving anything upward
                    self.run_map.insert(level, runs);
                    continue;
                }
            }

            let (next_level, next_size) = match (lowest_merge, next_run) {
                (None, None) => {
                    // nothing else in flight anywhere: this is the last merge
                    let fan_in = runs.len();
                    self.start_merge(FINAL_MERGE_LEVEL, &mut runs, fan_in)?;
                    continue;
                }
                (Some((ml, mn)), None) => (ml, mn),
                (None, Some((rl, rn))) => (rl, rn),
                (Some((ml, mn)), Some((rl, rn))) => {
                    if ml < rl {
                        (ml, mn)
                    } else if ml > rl {
                        (rl, rn)
                    } else {
                        (ml, mn + rn)
                    }
                }
            };

            // merge these runs together now only if promoting them as-is
            // would increase the number of merges needed at the next level
            let required = (next_size + self.merge_factor - 1) / self.merge_factor;
            let potential = (next_size + runs.len() + self.merge_factor - 1) / self.merge_factor;
            if potential > required {
                let fan_in = runs.len();
                self.start_merge(next_level, &mut runs, fan_in)?;
            } else {
                self.run_map.entry(next_level).or_default().append(&mut runs);
            }
        }
        Ok(())
    }

    /// Wire up one background merge: a file scan per input run feeding an
    /// N-way merge, whose output is dumped into a next-level run file. A
    /// negative level is the final merge, whose output is kept for the sort
    /// worker instead of being dumped.
    fn start_merge(
        &mut self,
        new_level: i32,
        runs: &mut Vec<PathBuf>,
        fan_in: usize,
    ) -> Result<(), ExecError> {
        assert!(fan_in > 0 && runs.len() >= fan_in);
        let seq = self.merge_seq;
        self.merge_seq += 1;
        let inputs: Vec<PathBuf> = runs.drain(..fan_in).collect();
        log_info!("starting {}-way merge into level {}", fan_in, new_level);

        let mut scan_outputs = Vec::with_capacity(fan_in);
        for (i, file) in inputs.iter().enumerate() {
            let (writer, reader) = fifo::pair(self.tuple_size);
            let mut packet = FscanPacket::new(
                format!("sort-fscan-{}-{}", seq, i),
                writer,
                Box::new(TrivialFilter::new(self.tuple_size)),
                file.clone(),
            );
            packet.core_mut().assign_query_state(self.query_state);
            self.dispatcher.dispatch(Box::new(packet))?;
            scan_outputs.push(reader);
        }

        let (merge_writer, merge_reader) = fifo::pair(self.tuple_size);
        let mut packet = MergePacket::new(
            format!("sort-merge-{}", seq),
            merge_writer,
            Box::new(TrivialFilter::new(self.tuple_size)),
            scan_outputs,
            self.extract.clone_box(),
            self.compare.clone_box(),
        );
        packet.core_mut().assign_query_state(self.query_state);
        self.dispatcher.dispatch(Box::new(packet))?;

        if new_level < 0 {
            self.final_output = Some(merge_reader);
            return Ok(());
        }

        let output = self
            .temp_dir
            .path()
            .join(format!("merged-{}-{}.tmp", new_level, seq));
        let (dump_writer, dump_reader) = fifo::pair(self.tuple_size);
        let mut packet = FdumpPacket::new(
            format!("sort-fdump-{}", seq),
            dump_writer,
            Box::new(TrivialFilter::new(self.tuple_size)),
            merge_reader,
            output.clone(),
            Some(self.done_tx.clone()),
        );
        packet.core_mut().assign_query_state(self.query_state);
        self.dispatcher.dispatch(Box::new(packet))?;

        self.merge_map.entry(new_level).or_default().push(MergeEntry {
            output,
            inputs,
            signal: dump_reader,
        });
        Ok(())
    }
}

fn remove_input_files(files: &[PathBuf]) {
    for file in files {
        if std::fs::remove_file(file).is_err() {
            log_warn!("unable to remove temp file {}", file.display());
        }
    }
}

/// External merge sort: consumes the input in fixed-size chunks, sorts each
/// in memory and spills it as a run, while a monitor thread merges finished
/// runs in the background. The final merge streams into the stage output.
#[derive(Default)]
pub struct SortStage {
    monitor: Option<JoinHandle<Result<Option<FifoReader>, ExecError>>>,
}

impl SortStage {
    #[allow(clippy::too_many_arguments)]
    fn generate_runs(
        adaptor: &StageAdaptor,
        input: &mut FifoReader,
        extract: &dyn KeyExtractor,
        compare: &dyn KeyCompare,
        params: &SortParams,
        temp_dir: &TempDir,
        run_tx: Sender<RunEvent>,
        first_page: Page,
    ) -> Result<RunOutcome, StageError> {
        let pages_per_run = params.pages_per_run.max(1);
        let mut pending = Some(first_page);
        let mut input_done = false;
        let mut first_chunk = true;
        let mut run_seq = 0usize;

        loop {
            let mut pages: Vec<Page> = Vec::new();
            if let Some(page) = pending.take() {
                pages.push(page);
            }
            while pages.len() < pages_per_run && !input_done {
                match input.get_page()? {
                    Some(page) => pages.push(page),
                    None => input_done = true,
                }
            }
            // look one page ahead so the last run knows it is last
            if !input_done {
                match input.get_page()? {
                    Some(page) => pending = Some(page),
                    None => input_done = true,
                }
            }

            // sort the chunk: cheap hints first, full comparator on ties
            let mut entries: Vec<(i64, u32, u32)> = Vec::new();
            for (pi, page) in pages.iter().enumerate() {
                for (ti, tuple) in page.iter().enumerate() {
                    entries.push((extract.extract_hint(tuple), pi as u32, ti as u32));
                }
            }
            entries.sort_unstable_by(|a, b| {
                a.0.cmp(&b.0).then_with(|| {
                    compare.compare(
                        pages[a.1 as usize].tuple(a.2 as usize),
                        pages[b.1 as usize].tuple(b.2 as usize),
                    )
                })
            });

            if first_chunk && input_done {
                // the whole input fit in one chunk: skip the merge
                // hierarchy and emit straight from memory
                drop(run_tx);
                for (_, pi, ti) in entries {
                    adaptor.output(pages[pi as usize].tuple(ti as usize))?;
                }
                return Ok(RunOutcome::InMemory);
            }
            first_chunk = false;

            let file = temp_dir.path().join(format!("run-{}.tmp", run_seq));
            run_seq += 1;
            let mut writer = BufWriter::new(File::create(&file).map_err(ExecError::from)?);
            for (_, pi, ti) in &entries {
                writer
                    .write_all(pages[*pi as usize].tuple(*ti as usize))
                    .map_err(ExecError::from)?;
            }
            writer.flush().map_err(ExecError::from)?;
            log_debug!("spilled {} ({} tuples)", file.display(), entries.len());
            let _ = run_tx.send(RunEvent::Run {
                file,
                finished: input_done,
            });

            if input_done {
                return Ok(RunOutcome::Spilled);
            }
        }
    }
}

impl Stage for SortStage {
    fn process(&mut self, adaptor: &StageAdaptor, dispatcher: &Dispatcher) -> StageResult {
        let (input, input_buffer, extract, compare, params, query_state) =
            adaptor.with_primary(|p| {
                let state = p.core().query_state();
                let p = p
                    .as_any_mut()
                    .downcast_mut::<SortPacket>()
                    .expect("sort container got a foreign packet");
                (
                    p.input.take(),
                    p.input_buffer.take(),
                    p.extract.take(),
                    p.compare.take(),
                    p.params.clone(),
                    state,
                )
            });
        let mut input_buffer = input_buffer.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("sort packet has no input buffer".to_string()))
        })?;
        let extract = extract.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("sort packet has no extractor".to_string()))
        })?;
        let compare = compare.ok_or_else(|| {
            StageError::Exec(ExecError::Stage("sort packet has no comparator".to_string()))
        })?;
        let tuple_size = input_buffer.tuple_size();
        if let Some(input) = input {
            dispatcher.dispatch(input)?;
        }
        log_debug!("SortStage::process");

        // quick exit on an empty input
        let first_page = match input_buffer.get_page()? {
            Some(page) => page,
            None => return Ok(()),
        };

        // every run and merge output lives under this directory, so nothing
        // can outlive the stage even when it dies mid-merge
        let temp_dir = match &params.temp_root {
            Some(root) => TempDir::new_in(root),
            None => TempDir::new(),
        }
        .map_err(ExecError::from)?;
        let temp_dir = Arc::new(temp_dir);

        let (run_tx, run_rx) = channel::unbounded();
        let (done_tx, done_rx) = channel::unbounded();
        let monitor = MergeMonitor {
            dispatcher: dispatcher.clone(),
            temp_dir: temp_dir.clone(),
            tuple_size,
            merge_factor: params.merge_factor.max(2),
            query_state,
            extract: extract.clone_box(),
            compare: compare.clone_box(),
            run_rx,
            done_rx,
            done_tx,
            run_map: BTreeMap::new(),
            merge_map: BTreeMap::new(),
            sorting_finished: false,
            final_output: None,
            merge_seq: 0,
        };
        self.monitor = Some(
            std::thread::Builder::new()
                .name("sort-merge-monitor".to_string())
                .spawn(move || monitor.run())
                .map_err(ExecError::from)?,
        );

        let outcome = Self::generate_runs(
            adaptor,
            &mut input_buffer,
            extract.as_ref(),
            compare.as_ref(),
            &params,
            &temp_dir,
            run_tx,
            first_page,
        );

        // the monitor exits once the run channel closes or the final merge
        // starts; join it before looking at anything it produced
        let monitor_result = match self.monitor.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(ExecError::Sort("merge monitor panicked".to_string()))),
            None => Ok(None),
        };

        match outcome? {
            RunOutcome::InMemory => Ok(()),
            RunOutcome::Spilled => {
                let mut merge_output = monitor_result?.ok_or_else(|| {
                    ExecError::Sort("merge monitor exited before the final merge".to_string())
                })?;
                while let Some(tuple) = merge_output.get_tuple()? {
                    adaptor.output(tuple)?;
                }
                Ok(())
            }
        }
    }
}

impl Drop for SortStage {
    fn drop(&mut self) {
        // never leave the monitor running past the stage
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::stage::{TScanPacket, VecSource};
    use crate::test_util::{read_u64s, shuffled, u64_tuples, IntCompare, IntExtract};

    fn sort_query(
        engine: &Engine,
        values: &[u64],
        input_page_size: usize,
        params: SortParams,
    ) -> fifo::FifoReader {
        let (in_w, in_r) = fifo::pair_with(8, crate::tuple::DEFAULT_FIFO_PAGES, input_page_size);
        let scan = Box::new(TScanPacket::new(
            "sort-test-scan",
            in_w,
            Box::new(TrivialFilter::new(8)),
            Box::new(VecSource::new("ints", 8, u64_tuples(values.iter().copied()))),
            false,
        ));
        let (out_w, out_r) = fifo::pair(8);
        let sort = SortPacket::new(
            "sort-test",
            out_w,
            Box::new(TrivialFilter::new(8)),
            Box::new(IntExtract),
            Box::new(IntCompare),
            scan,
            in_r,
            params,
        );
        engine.dispatch(Box::new(sort)).unwrap();
        out_r
    }

    #[test]
    fn test_sort_fits_in_memory() {
        let engine = Engine::new();
        let values = shuffled(1000);
        let mut out = sort_query(&engine, &values, crate::tuple::DEFAULT_PAGE_SIZE, SortParams::default());
        assert_eq!(read_u64s(&mut out), (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_external_sort_with_background_merges() {
        let engine = Engine::new();
        let values = shuffled(500);
        // 8 tuples per input page and 2 pages per run forces ~32 runs, which
        // a fan-in of 4 reduces over several background merge levels
        let params = SortParams {
            pages_per_run: 2,
            merge_factor: 4,
            temp_root: None,
        };
        let mut out = sort_query(&engine, &values, 64, params);
        assert_eq!(read_u64s(&mut out), (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_sort_empty_input() {
        let engine = Engine::new();
        let mut out = sort_query(&engine, &[], 64, SortParams::default());
        assert_eq!(read_u64s(&mut out), Vec::<u64>::new());
    }

    #[test]
    fn test_sort_preserves_duplicates() {
        let engine = Engine::new();
        let mut values = Vec::new();
        for i in 0..300u64 {
            values.push(i % 10);
        }
        let params = SortParams {
            pages_per_run: 2,
            merge_factor: 4,
            temp_root: None,
        };
        let mut out = sort_query(&engine, &values, 64, params);
        let got = read_u64s(&mut out);
        let mut expected = values.clone();
        expected.sort_unstable();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_run_files_are_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        {
            let engine = Engine::new();
            let values = shuffled(500);
            let params = SortParams {
                pages_per_run: 2,
                merge_factor: 4,
                temp_root: Some(root.path().to_path_buf()),
            };
            let mut out = sort_query(&engine, &values, 64, params);
            assert_eq!(read_u64s(&mut out).len(), 500);
            // the stage (and its temp directory) is torn down shortly after
            // the output reaches EOF
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            loop {
                let leftover = std::fs::read_dir(root.path()).unwrap().count();
                if leftover == 0 {
                    break;
                }
                assert!(
                    std::time::Instant::now() < deadline,
                    "temp files left behind: {}",
                    leftover
                );
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
        }
    }

    #[test]
    fn test_aborted_input_aborts_the_sort() {
        let engine = Engine::new();
        let (in_w, in_r) = fifo::pair_with(8, 4, 64);
        let (out_w, mut out_r) = fifo::pair(8);
        let sort = SortPacket::new(
            "sort-abort",
            out_w,
            Box::new(TrivialFilter::new(8)),
            Box::new(IntExtract),
            Box::new(IntCompare),
            Box::new(TScanPacket::new(
                "unused-scan",
                fifo::pair(8).0,
                Box::new(TrivialFilter::new(8)),
                Box::new(VecSource::new("empty", 8, Vec::new())),
                false,
            )),
            in_r,
            SortParams::default(),
        );
        // replace the wired input: feed some tuples, then vanish without EOF
        engine.dispatch(Box::new(sort)).unwrap();
        let mut in_w = in_w;
        for i in 0u64..100 {
            let _ = in_w.put_tuple(&i.to_le_bytes());
        }
        drop(in_w);
        assert!(out_r.get_tuple().is_err());
    }
}
