use std::sync::{Arc, Mutex};

use crate::dispatcher::Dispatcher;
use crate::error::ExecError;
use crate::fifo::PeerClosed;
use crate::packet::{Packet, QueryPlan, NEXT_TUPLE_INITIAL_VALUE, NEXT_TUPLE_UNINITIALIZED};
use crate::stage::queue::BlockingDeque;
use crate::stage::{Stage, StageError, StageFactory, StageResult};
use crate::tuple::{Page, DEFAULT_PAGE_SIZE};
use crate::{log_debug, log_error, log_info, log_trace, log_warn};

type PacketGroup = Vec<Box<dyn Packet>>;

/// Per-stage-type scheduler: owns the pending queue of packet groups,
/// decides work sharing, and turns dequeued groups into stage executions.
pub struct StageContainer {
    name: &'static str,
    queue: BlockingDeque<PacketGroup>,
    running: Mutex<Vec<Arc<StageAdaptor>>>,
    factory: Box<dyn StageFactory>,
}

impl StageContainer {
    pub fn new(name: &'static str, factory: Box<dyn StageFactory>) -> Arc<Self> {
        Arc::new(StageContainer {
            name,
            queue: BlockingDeque::new(),
            running: Mutex::new(Vec::new()),
            factory,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Send a packet to this container. Merge order: currently running
    /// groups first, then groups still waiting in the queue, else the packet
    /// becomes a new singleton group.
    pub fn enqueue(&self, packet: Box<dyn Packet>) {
        let mut packet = packet;
        if packet.core().is_merge_enabled() {
            // try the running stages before they stop accepting
            {
                let running = self.running.lock().unwrap();
                for adaptor in running.iter() {
                    match adaptor.try_merge(packet) {
                        Ok(()) => {
                            log_debug!("{}: packet merged into a running stage", self.name);
                            return;
                        }
                        Err(rejected) => packet = rejected,
                    }
                }
            }

            // then packets already waiting in the queue
            let mut slot = Some(packet);
            let merged = self.queue.scan_mut(|group| {
                let candidate = slot.as_ref().unwrap();
                if group[0].is_mergeable(candidate.as_ref()) {
                    group.push(slot.take().unwrap());
                    true
                } else {
                    false
                }
            });
            if merged {
                log_debug!("{}: packet merged into a queued group", self.name);
                return;
            }
            packet = slot.take().unwrap();
        } else {
            log_trace!("{}: merging disabled for {}", self.name, packet.core().id);
        }

        // no work sharing detected
        self.push_group(vec![packet]);
    }

    /// Re-enqueue a group without attempting any merge.
    pub(crate) fn requeue(&self, group: PacketGroup) {
        self.push_group(group);
    }

    fn push_group(&self, group: PacketGroup) {
        if !self.queue.push(group) {
            // container shut down; dropping the packets aborts their clients
            log_warn!("{}: enqueue after shutdown, aborting packets", self.name);
        }
    }

    pub(crate) fn close(&self) {
        self.queue.close();
    }

    /// Worker thread entry point: process groups until the container shuts
    /// down and the queue drains.
    pub fn run(&self, dispatcher: &Dispatcher) {
        while self.run_one(dispatcher) {}
    }

    /// Process a single pending group on the calling thread. Returns false
    /// once the container is shut down and empty.
    pub fn run_one(&self, dispatcher: &Dispatcher) -> bool {
        let group = match self.queue.pop_blocking() {
            Some(group) => group,
            None => return false,
        };
        self.process_group(group, dispatcher);
        true
    }

    fn process_group(&self, group: PacketGroup, dispatcher: &Dispatcher) {
        assert!(!group.is_empty(), "dequeued an empty packet group");

        // bind this worker where the primary packet was assigned
        if let Some(cpu) = group[0].core().bind_cpu() {
            if core_affinity::set_for_current(cpu) {
                log_debug!("{}: worker bound to cpu {}", self.name, cpu.id);
            } else {
                log_warn!("{}: failed to bind worker to cpu {}", self.name, cpu.id);
            }
        }

        let tuple_size = group[0].core().filter().input_size();
        let adaptor = Arc::new(StageAdaptor::new(group, tuple_size));

        self.running.lock().unwrap().push(adaptor.clone());

        let mut stage = self.factory.create();
        adaptor.run_stage(stage.as_mut(), dispatcher, self);

        let mut running = self.running.lock().unwrap();
        running.retain(|a| !Arc::ptr_eq(a, &adaptor));
    }
}

struct AdaptorState {
    packets: Vec<Box<dyn Packet>>,
    /// Packets that merged in while a page was being fanned out; they join
    /// the group for the next page.
    incoming: Vec<Box<dyn Packet>>,
    out_page: Page,
    next_tuple: u64,
    accepting: bool,
    draining: bool,
}

/// Runtime binding between one stage execution and the (possibly growing)
/// group of packets it serves. Collects the stage's output, fans each page
/// out through every packet's filter, and tracks the tuple index that lets
/// late joiners be cut off or requeued correctly.
pub struct StageAdaptor {
    packet_type: &'static str,
    merge_enabled: bool,
    plan: Option<QueryPlan>,
    tuple_size: usize,
    state: Mutex<AdaptorState>,
}

impl StageAdaptor {
    fn new(group: PacketGroup, tuple_size: usize) -> Self {
        let mut group = group;
        // every packet in the group is served from the first tuple on
        for packet in group.iter_mut() {
            packet.core_mut().next_tuple_on_merge = NEXT_TUPLE_INITIAL_VALUE;
        }
        let (packet_type, merge_enabled, plan) = {
            let primary = group[0].core();
            (
                primary.packet_type(),
                primary.is_merge_enabled(),
                primary.plan().cloned(),
            )
        };
        StageAdaptor {
            packet_type,
            merge_enabled,
            plan,
            tuple_size,
            state: Mutex::new(AdaptorState {
                packets: group,
                incoming: Vec::new(),
                out_page: Page::alloc(tuple_size, DEFAULT_PAGE_SIZE),
                next_tuple: NEXT_TUPLE_INITIAL_VALUE,
                accepting: true,
                draining: false,
            }),
        }
    }

    /// Size of the tuples the stage is expected to produce.
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    /// Borrow the group's primary packet, typically to downcast it and take
    /// its inputs. Stages do this once, before producing any output.
    pub fn with_primary<R>(&self, f: impl FnOnce(&mut dyn Packet) -> R) -> R {
        let mut st = self.state.lock().unwrap();
        debug_assert!(!st.draining);
        f(st.packets[0].as_mut())
    }

    /// Try to splice `packet` into this running group. On success the packet
    /// inherits the group's current tuple index, so it only receives tuples
    /// produced from here on; anything earlier is made up later by a requeue.
    pub(crate) fn try_merge(&self, packet: Box<dyn Packet>) -> Result<(), Box<dyn Packet>> {
        if !self.merge_enabled || !packet.core().is_merge_enabled() {
            return Err(packet);
        }
        if packet.core().packet_type() != self.packet_type {
            return Err(packet);
        }
        let compatible = match (&self.plan, packet.core().plan()) {
            (Some(a), Some(b)) => QueryPlan::compatible(a, b),
            _ => false,
        };
        if !compatible {
            return Err(packet);
        }

        let mut packet = packet;
        let mut st = self.state.lock().unwrap();
        if !st.accepting {
            return Err(packet);
        }
        packet.core_mut().next_tuple_on_merge = st.next_tuple;
        if st.next_tuple == NEXT_TUPLE_INITIAL_VALUE {
            // nothing has been produced yet: this packet will see the whole
            // stream, so its own upstream inputs will never be needed
            packet.terminate_inputs();
        }
        log_debug!(
            "{} merged into running group at tuple {}",
            packet.core().id,
            st.next_tuple
        );
        if st.draining {
            st.incoming.push(packet);
        } else {
            st.packets.push(packet);
        }
        Ok(())
    }

    /// Emit one tuple from the stage. Buffers a page, then fans it out to
    /// every packet in the group.
    pub fn output(&self, tuple: &[u8]) -> StageResult {
        debug_assert_eq!(tuple.len(), self.tuple_size);
        let full = {
            let mut st = self.state.lock().unwrap();
            if st.out_page.append(tuple) {
                None
            } else {
                let fresh = Page::alloc(self.tuple_size, DEFAULT_PAGE_SIZE);
                let full = std::mem::replace(&mut st.out_page, fresh);
                let appended = st.out_page.append(tuple);
                debug_assert!(appended);
                Some(full)
            }
        };
        match full {
            Some(page) => self.output_page(page),
            None => Ok(()),
        }
    }

    fn flush(&self) -> StageResult {
        let partial = {
            let mut st = self.state.lock().unwrap();
            if st.out_page.is_empty() {
                None
            } else {
                Some(std::mem::replace(
                    &mut st.out_page,
                    Page::alloc(self.tuple_size, 1),
                ))
            }
        };
        match partial {
            Some(page) => self.output_page(page),
            None => Ok(()),
        }
    }

    /// Deliver a page of stage output to every packet in the group. Packets
    /// whose consumer went away, or that have now received everything they
    /// still needed, are finished and removed. `Stopped` once nobody is left.
    fn output_page(&self, page: Page) -> StageResult {
        let (packets, next_tuple) = {
            let mut st = self.state.lock().unwrap();
            st.next_tuple += page.tuple_count() as u64;
            st.draining = true;
            (std::mem::take(&mut st.packets), st.next_tuple)
        };
        // packets merging from here on inherit the advanced counter and must
        // not receive this page

        // fan out without holding the group lock: output buffers may block
        // on back-pressure and filters are user code
        let mut kept = Vec::with_capacity(packets.len());
        for mut packet in packets {
            let mut peer_gone = false;
            {
                let (filter, writer) = packet.core_mut().filter_and_output();
                match writer {
                    Some(writer) => {
                        for tuple in page.iter() {
                            if !filter.select(tuple) {
                                continue;
                            }
                            match writer.alloc_tuple() {
                                Ok(dst) => filter.project(dst, tuple),
                                Err(PeerClosed) => {
                                    peer_gone = true;
                                    break;
                                }
                            }
                        }
                    }
                    None => peer_gone = true,
                }
            }
            let needed = packet.core().next_tuple_needed;
            let satisfied = needed != NEXT_TUPLE_UNINITIALIZED && next_tuple >= needed;
            if peer_gone || satisfied {
                log_debug!(
                    "finishing {} (peer_gone={}, satisfied={})",
                    packet.core().id,
                    peer_gone,
                    satisfied
                );
                Self::finish_packet(packet);
            } else {
                kept.push(packet);
            }
        }

        let mut st = self.state.lock().unwrap();
        st.draining = false;
        let incoming = std::mem::take(&mut st.incoming);
        kept.extend(incoming);
        st.packets = kept;
        if st.packets.is_empty() {
            // nobody needs more tuples; refuse further merges so latecomers
            // start a fresh execution instead of joining a dead group
            st.accepting = false;
            return Err(StageError::Stopped);
        }
        Ok(())
    }

    /// Close out one packet: clean EOF on its output, inputs torn down.
    fn finish_packet(mut packet: Box<dyn Packet>) {
        if let Some(writer) = packet.core_mut().take_output() {
            if !writer.send_eof() {
                log_trace!("consumer of {} had already terminated", packet.core().id);
            }
        }
        packet.terminate_inputs();
    }

    fn stop_accepting(&self) {
        self.state.lock().unwrap().accepting = false;
    }

    /// Drive one stage execution to completion and settle every packet in
    /// the group afterwards.
    pub(crate) fn run_stage(
        &self,
        stage: &mut dyn Stage,
        dispatcher: &Dispatcher,
        container: &StageContainer,
    ) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            stage.process(self, dispatcher).and_then(|()| self.flush())
        }))
        .unwrap_or_else(|_| {
            Err(StageError::Exec(ExecError::Stage(format!(
                "{} stage panicked",
                container.name()
            ))))
        });

        self.stop_accepting();
        match result {
            Ok(()) | Err(StageError::Stopped) => self.cleanup(container),
            Err(StageError::Exec(err)) => {
                log_error!("{} stage failed: {}", container.name(), err);
                self.abort_group();
            }
        }
    }

    /// After a successful run: packets that were with the group from the
    /// first tuple are complete; late joiners are stamped with the tuple
    /// index they still need and handed back to the container for a fresh
    /// execution that replays the missing prefix.
    fn cleanup(&self, container: &StageContainer) {
        let packets = {
            let mut st = self.state.lock().unwrap();
            let mut packets = std::mem::take(&mut st.packets);
            packets.extend(std::mem::take(&mut st.incoming));
            packets
        };
        let mut requeue = Vec::new();
        for mut packet in packets {
            if packet.core().next_tuple_on_merge == NEXT_TUPLE_INITIAL_VALUE {
                Self::finish_packet(packet);
            } else {
                let core = packet.core_mut();
                core.next_tuple_needed = core.next_tuple_on_merge;
                core.next_tuple_on_merge = NEXT_TUPLE_UNINITIALIZED;
                log_info!(
                    "requeueing {} for tuples up to {}",
                    core.id,
                    core.next_tuple_needed
                );
                requeue.push(packet);
            }
        }
        if !requeue.is_empty() {
            container.requeue(requeue);
        }
    }

    /// After a failed run: every packet's client is notified by closing its
    /// output as aborted, and all inputs are torn down. The worker itself
    /// survives and returns to the pool.
    fn abort_group(&self) {
        let packets = {
            let mut st = self.state.lock().unwrap();
            let mut packets = std::mem::take(&mut st.packets);
            packets.extend(std::mem::take(&mut st.incoming));
            packets
        };
        for mut packet in packets {
            if let Some(writer) = packet.core_mut().take_output() {
                // dropping without EOF closes the buffer as aborted, which
                // is what the blocked client observes
                drop(writer);
            }
            packet.terminate_inputs();
        }
    }
}
