use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::log_trace;
use crate::tuple::{Page, DEFAULT_FIFO_PAGES, DEFAULT_PAGE_SIZE};

/// Producer-side status: the consumer has terminated the channel and no
/// further tuples will be accepted. Expected during cancellation, not fatal.
#[derive(Debug, PartialEq, Eq)]
pub struct PeerClosed;

/// Consumer-side status: the producer went away without sending EOF, so the
/// stream is incomplete. Distinct from a clean end of stream.
#[derive(Debug, PartialEq, Eq)]
pub struct Aborted;

/// How the producing side ended the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndMarker {
    Open,
    Eof,
    Aborted,
}

struct Shared {
    pages: VecDeque<Page>,
    end: EndMarker,
    terminated: bool,
}

/// Bounded single-producer / single-consumer channel of tuple pages.
///
/// The producer fills a page before handing it over; the consumer drains one
/// page at a time. Both ends close independently: `send_eof` marks a clean end
/// of stream, `terminate` is the consumer walking away early. The boolean each
/// returns reports whether the peer was still attached at that moment, so
/// exactly one side learns it closed second.
pub struct TupleFifo {
    tuple_size: usize,
    page_size: usize,
    capacity_pages: usize,
    state: Mutex<Shared>,
    reader_notify: Condvar,
    writer_notify: Condvar,
}

/// Create a connected writer/reader pair with default capacity.
pub fn pair(tuple_size: usize) -> (FifoWriter, FifoReader) {
    pair_with(tuple_size, DEFAULT_FIFO_PAGES, DEFAULT_PAGE_SIZE)
}

/// Create a connected writer/reader pair. `capacity_pages` bounds how many
/// full pages may sit in the channel before the producer blocks.
pub fn pair_with(
    tuple_size: usize,
    capacity_pages: usize,
    page_size: usize,
) -> (FifoWriter, FifoReader) {
    assert!(capacity_pages > 0);
    let fifo = Arc::new(TupleFifo {
        tuple_size,
        page_size,
        capacity_pages,
        state: Mutex::new(Shared {
            pages: VecDeque::new(),
            end: EndMarker::Open,
            terminated: false,
        }),
        reader_notify: Condvar::new(),
        writer_notify: Condvar::new(),
    });
    let writer = FifoWriter {
        fifo: fifo.clone(),
        page: Page::alloc(tuple_size, page_size),
        closed: false,
    };
    let reader = FifoReader {
        fifo,
        page: None,
        pos: 0,
        closed: false,
    };
    (writer, reader)
}

/// Producing end. Dropping a writer that never sent EOF closes the channel
/// as `Aborted`, which the reader observes as an error rather than a clean
/// empty result.
pub struct FifoWriter {
    fifo: Arc<TupleFifo>,
    page: Page,
    closed: bool,
}

impl FifoWriter {
    pub fn tuple_size(&self) -> usize {
        self.fifo.tuple_size
    }

    /// Copy one tuple into the channel. Blocks while the channel is full.
    /// Fails fast, without blocking, once the consumer has terminated.
    pub fn put_tuple(&mut self, tuple: &[u8]) -> Result<(), PeerClosed> {
        self.ensure_write_ready()?;
        let ok = self.page.append(tuple);
        debug_assert!(ok);
        Ok(())
    }

    /// Allocate space for one tuple and return it for in-place assembly.
    pub fn alloc_tuple(&mut self) -> Result<&mut [u8], PeerClosed> {
        self.ensure_write_ready()?;
        Ok(self.page.allocate().unwrap())
    }

    fn ensure_write_ready(&mut self) -> Result<(), PeerClosed> {
        if self.page.is_full() {
            self.flush_full_page()?;
        }
        Ok(())
    }

    fn flush_full_page(&mut self) -> Result<(), PeerClosed> {
        let full = std::mem::replace(
            &mut self.page,
            Page::alloc(self.fifo.tuple_size, self.fifo.page_size),
        );
        let mut st = self.fifo.state.lock().unwrap();
        loop {
            if st.terminated {
                return Err(PeerClosed);
            }
            if st.pages.len() < self.fifo.capacity_pages {
                break;
            }
            st = self.fifo.writer_notify.wait(st).unwrap();
        }
        st.pages.push_back(full);
        self.fifo.reader_notify.notify_one();
        Ok(())
    }

    /// Close the channel with a clean end of stream, draining any partial
    /// page first. Returns whether the consumer was still attached; if not,
    /// the stream was discarded unread.
    pub fn send_eof(mut self) -> bool {
        self.closed = true;
        let partial = std::mem::replace(&mut self.page, Page::alloc(self.fifo.tuple_size, 1));
        let mut st = self.fifo.state.lock().unwrap();
        loop {
            if st.terminated {
                log_trace!("send_eof: consumer already terminated");
                return false;
            }
            if partial.is_empty() || st.pages.len() < self.fifo.capacity_pages {
                break;
            }
            st = self.fifo.writer_notify.wait(st).unwrap();
        }
        if !partial.is_empty() {
            st.pages.push_back(partial);
        }
        st.end = EndMarker::Eof;
        self.fifo.reader_notify.notify_one();
        true
    }
}

impl Drop for FifoWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut st = self.fifo.state.lock().unwrap();
        if st.end == EndMarker::Open {
            st.end = EndMarker::Aborted;
        }
        self.fifo.reader_notify.notify_one();
    }
}

/// Consuming end. Constructing the reader is the consumer attach step; a
/// channel cannot exist without its consumer half.
pub struct FifoReader {
    fifo: Arc<TupleFifo>,
    page: Option<Page>,
    pos: usize,
    closed: bool,
}

impl FifoReader {
    pub fn tuple_size(&self) -> usize {
        self.fifo.tuple_size
    }

    /// Next tuple in producer insertion order. Blocks while the channel is
    /// empty and still open. `Ok(None)` is a clean end of stream; `Err` means
    /// the producer went away without finishing.
    pub fn get_tuple(&mut self) -> Result<Option<&[u8]>, Aborted> {
        if let Some(page) = &self.page {
            if self.pos == page.tuple_count() {
                self.page = None;
            }
        }
        if self.page.is_none() {
            match self.fetch_page()? {
                Some(page) => {
                    self.page = Some(page);
                    self.pos = 0;
                }
                None => return Ok(None),
            }
        }
        let idx = self.pos;
        self.pos += 1;
        Ok(Some(self.page.as_ref().unwrap().tuple(idx)))
    }

    /// Next full page in producer insertion order. Must not be mixed with
    /// `get_tuple` on the same reader.
    pub fn get_page(&mut self) -> Result<Option<Page>, Aborted> {
        debug_assert!(self.page.is_none(), "mixing page and tuple reads");
        self.fetch_page()
    }

    fn fetch_page(&mut self) -> Result<Option<Page>, Aborted> {
        let mut st = self.fifo.state.lock().unwrap();
        loop {
            if st.end == EndMarker::Aborted {
                return Err(Aborted);
            }
            if let Some(page) = st.pages.pop_front() {
                self.fifo.writer_notify.notify_one();
                return Ok(Some(page));
            }
            match st.end {
                EndMarker::Eof => return Ok(None),
                EndMarker::Open => {
                    st = self.fifo.reader_notify.wait(st).unwrap();
                }
                EndMarker::Aborted => unreachable!(),
            }
        }
    }

    /// Non-blocking end-of-stream check: `None` while the stream is open or
    /// tuples remain unread, otherwise how the producer ended it.
    pub fn poll_end(&self) -> Option<EndMarker> {
        if let Some(page) = &self.page {
            if self.pos < page.tuple_count() {
                return None;
            }
        }
        let st = self.fifo.state.lock().unwrap();
        if st.end == EndMarker::Aborted {
            return Some(EndMarker::Aborted);
        }
        if !st.pages.is_empty() {
            return None;
        }
        match st.end {
            EndMarker::Eof => Some(EndMarker::Eof),
            _ => None,
        }
    }

    /// Close the consuming end early. Returns whether the producer was still
    /// attached; if not, this reader closed second.
    pub fn terminate(mut self) -> bool {
        self.closed = true;
        let mut st = self.fifo.state.lock().unwrap();
        if st.end != EndMarker::Open {
            return false;
        }
        st.terminated = true;
        self.fifo.writer_notify.notify_one();
        true
    }
}

impl Drop for FifoReader {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut st = self.fifo.state.lock().unwrap();
        st.terminated = true;
        self.fifo.writer_notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::thread;

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(100)]
    fn test_fifo_preserves_insertion_order(#[case] capacity_pages: usize) {
        let (mut writer, mut reader) = pair_with(8, capacity_pages, 64);
        let producer = thread::spawn(move || {
            for i in 0u64..1000 {
                writer.put_tuple(&i.to_le_bytes()).unwrap();
            }
            assert!(writer.send_eof());
        });
        let mut seen = Vec::new();
        while let Some(t) = reader.get_tuple().unwrap() {
            seen.push(u64::from_le_bytes(t.try_into().unwrap()));
        }
        producer.join().unwrap();
        assert_eq!(seen, (0u64..1000).collect::<Vec<_>>());
        // second read still reports a clean end
        assert_eq!(reader.get_tuple().unwrap(), None);
    }

    #[test]
    fn test_eof_then_terminate() {
        let (writer, reader) = pair(8);
        assert!(writer.send_eof());
        assert!(!reader.terminate());
    }

    #[test]
    fn test_terminate_then_eof() {
        let (writer, reader) = pair(8);
        assert!(reader.terminate());
        assert!(!writer.send_eof());
    }

    #[test]
    fn test_termination_race_has_exactly_one_loser() {
        for _ in 0..200 {
            let (writer, reader) = pair(8);
            let t1 = thread::spawn(move || writer.send_eof());
            let t2 = thread::spawn(move || reader.terminate());
            let eof_saw_peer = t1.join().unwrap();
            let term_saw_peer = t2.join().unwrap();
            // whichever side closed second observed the peer already gone
            assert_ne!(eof_saw_peer, term_saw_peer);
        }
    }

    #[test]
    fn test_put_fails_fast_after_terminate() {
        let (mut writer, reader) = pair_with(4, 2, 8);
        assert!(reader.terminate());
        // the local page buffers two tuples; the flush on the third notices
        writer.put_tuple(&[0; 4]).unwrap();
        writer.put_tuple(&[0; 4]).unwrap();
        assert_eq!(writer.put_tuple(&[0; 4]), Err(PeerClosed));
    }

    #[test]
    fn test_writer_drop_without_eof_aborts_reader() {
        let (mut writer, mut reader) = pair_with(8, 4, 16);
        for i in 0u64..4 {
            writer.put_tuple(&i.to_le_bytes()).unwrap();
        }
        drop(writer);
        assert_eq!(reader.get_tuple(), Err(Aborted));
    }

    #[test]
    fn test_reader_drop_unblocks_producer() {
        let (mut writer, reader) = pair_with(8, 1, 8);
        let consumer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            drop(reader);
        });
        // fill well past capacity; the producer must not block forever
        let mut result = Ok(());
        for i in 0u64..100 {
            result = writer.put_tuple(&i.to_le_bytes());
            if result.is_err() {
                break;
            }
        }
        consumer.join().unwrap();
        assert_eq!(result, Err(PeerClosed));
    }

    #[test]
    fn test_poll_end() {
        let (mut writer, mut reader) = pair_with(8, 4, 16);
        assert_eq!(reader.poll_end(), None);
        writer.put_tuple(&1u64.to_le_bytes()).unwrap();
        assert!(writer.send_eof());
        // a page is still queued
        assert_eq!(reader.poll_end(), None);
        assert!(reader.get_tuple().unwrap().is_some());
        assert_eq!(reader.get_tuple().unwrap(), None);
        assert_eq!(reader.poll_end(), Some(EndMarker::Eof));
    }

    #[test]
    fn test_poll_end_reports_abort() {
        let (writer, reader) = pair(8);
        drop(writer);
        assert_eq!(reader.poll_end(), Some(EndMarker::Aborted));
    }

    #[test]
    fn test_page_reads() {
        let (mut writer, mut reader) = pair_with(8, 4, 32);
        for i in 0u64..10 {
            writer.put_tuple(&i.to_le_bytes()).unwrap();
        }
        assert!(writer.send_eof());
        let mut count = 0;
        while let Some(page) = reader.get_page().unwrap() {
            count += page.tuple_count();
        }
        assert_eq!(count, 10);
    }
}
