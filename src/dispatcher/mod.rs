mod cpu_set;

pub use cpu_set::CpuSet;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use core_affinity::CoreId;

use crate::error::ExecError;
use crate::log_debug;
use crate::packet::{Packet, PacketCore};
use crate::stage::StageContainer;

/// Per-query dispatch state, created once per submitted query and shared by
/// every packet that query generates. A closed set of shapes: no state, a
/// sticky CPU, or a sticky module index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryState {
    Unbound,
    Cpu(CoreId),
    Module(usize),
}

/// Strategy for binding stage executions to CPUs. Consulted by the dispatch
/// layer, never by stages. All implementations must tolerate concurrent
/// callers; shared counters sit behind narrow mutexes held only across the
/// increment.
pub trait DispatchPolicy: Send + Sync {
    /// Called once per submitted query.
    fn query_state(&self) -> QueryState;

    /// Called once per packet; reads the packet's query state and records a
    /// CPU binding on it (or none).
    fn assign_packet(&self, core: &mut PacketCore);
}

/// Baseline: no binding, the OS scheduler decides.
pub struct OsPolicy;

impl DispatchPolicy for OsPolicy {
    fn query_state(&self) -> QueryState {
        QueryState::Unbound
    }

    fn assign_packet(&self, core: &mut PacketCore) {
        core.set_bind_cpu(None);
    }
}

/// Round-robin over the whole machine, advancing once per packet.
pub struct RrCpuPolicy {
    cpus: CpuSet,
    next_cpu: Mutex<usize>,
}

impl RrCpuPolicy {
    pub fn new(cpus: CpuSet) -> Self {
        RrCpuPolicy {
            cpus,
            next_cpu: Mutex::new(0),
        }
    }
}

impl DispatchPolicy for RrCpuPolicy {
    fn query_state(&self) -> QueryState {
        QueryState::Unbound
    }

    fn assign_packet(&self, core: &mut PacketCore) {
        let cpu = {
            let mut next = self.next_cpu.lock().unwrap();
            let cpu = *next;
            *next = (*next + 1) % self.cpus.len();
            cpu
        };
        core.set_bind_cpu(Some(self.cpus.core(cpu)));
    }
}

/// Sticky per-query CPU: the round-robin counter advances once per query and
/// every packet of that query reuses the same CPU. Trades load balancing for
/// cache locality within one query.
pub struct QueryCpuPolicy {
    cpus: CpuSet,
    next_cpu: Mutex<usize>,
}

impl QueryCpuPolicy {
    pub fn new(cpus: CpuSet) -> Self {
        QueryCpuPolicy {
            cpus,
            next_cpu: Mutex::new(0),
        }
    }
}

impl DispatchPolicy for QueryCpuPolicy {
    fn query_state(&self) -> QueryState {
        let mut next = self.next_cpu.lock().unwrap();
        let cpu = *next;
        *next = (*next + 1) % self.cpus.len();
        QueryState::Cpu(self.cpus.core(cpu))
    }

    fn assign_packet(&self, core: &mut PacketCore) {
        match core.query_state() {
            QueryState::Cpu(cpu) => core.set_bind_cpu(Some(cpu)),
            // packets submitted without going through query setup run
            // unbound rather than on a stolen slot
            QueryState::Unbound => core.set_bind_cpu(None),
            state @ QueryState::Module(_) => {
                debug_assert!(false, "query-cpu policy got state {:?}", state);
                core.set_bind_cpu(None);
            }
        }
    }
}

struct Module {
    next_cpu: Mutex<usize>,
}

/// Two-level round robin: a module (NUMA node) is picked per query, a CPU
/// within that module per packet. Assumes cores of the same module are
/// adjacent in the cpu set.
pub struct RrModulePolicy {
    cpus: CpuSet,
    modules: Vec<Module>,
    next_module: Mutex<usize>,
    cpus_per_module: usize,
}

impl RrModulePolicy {
    pub fn new(cpus: CpuSet, num_modules: usize) -> Self {
        assert!(num_modules > 0 && cpus.len() >= num_modules);
        let cpus_per_module = cpus.len() / num_modules;
        let modules = (0..num_modules)
            .map(|_| Module {
                next_cpu: Mutex::new(0),
            })
            .collect();
        RrModulePolicy {
            cpus,
            modules,
            next_module: Mutex::new(0),
            cpus_per_module,
        }
    }
}

impl DispatchPolicy for RrModulePolicy {
    fn query_state(&self) -> QueryState {
        let mut next = self.next_module.lock().unwrap();
        let module = *next;
        *next = (*next + 1) % self.modules.len();
        QueryState::Module(module)
    }

    fn assign_packet(&self, core: &mut PacketCore) {
        let module_index = match core.query_state() {
            QueryState::Module(m) => m,
            QueryState::Unbound => return core.set_bind_cpu(None),
            state @ QueryState::Cpu(_) => {
                debug_assert!(false, "rr-module policy got state {:?}", state);
                return core.set_bind_cpu(None);
            }
        };
        assert!(module_index < self.modules.len(), "module index out of range");
        let cpu = {
            let mut next = self.modules[module_index].next_cpu.lock().unwrap();
            let cpu = *next;
            *next = (*next + 1) % self.cpus_per_module;
            cpu
        };
        core.set_bind_cpu(Some(
            self.cpus.core(module_index * self.cpus_per_module + cpu),
        ));
    }
}

/// Routes packets to the container registered for their type tag, applying
/// the engine's dispatch policy on the way. Cheap to clone; worker threads
/// carry one so stages can dispatch sub-packets.
#[derive(Clone)]
pub struct Dispatcher {
    containers: Arc<HashMap<&'static str, Arc<StageContainer>>>,
    policy: Arc<dyn DispatchPolicy>,
}

impl Dispatcher {
    pub(crate) fn new(
        containers: Arc<HashMap<&'static str, Arc<StageContainer>>>,
        policy: Arc<dyn DispatchPolicy>,
    ) -> Self {
        Dispatcher { containers, policy }
    }

    /// Create the dispatch state for a newly submitted query. Assign the
    /// result to every packet built for that query before dispatching.
    pub fn new_query(&self) -> QueryState {
        self.policy.query_state()
    }

    pub fn container(&self, packet_type: &str) -> Option<&Arc<StageContainer>> {
        self.containers.get(packet_type)
    }

    /// Hand a packet to its stage's container, binding it to a CPU first.
    pub fn dispatch(&self, mut packet: Box<dyn Packet>) -> Result<(), ExecError> {
        self.policy.assign_packet(packet.core_mut());
        let packet_type = packet.core().packet_type();
        log_debug!("dispatching {} ({})", packet.core().id, packet_type);
        match self.containers.get(packet_type) {
            Some(container) => {
                container.enqueue(packet);
                Ok(())
            }
            None => Err(ExecError::Stage(format!(
                "no container registered for packet type {}",
                packet_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo;
    use crate::functors::TrivialFilter;
    use rstest::rstest;
    use std::thread;

    fn synthetic_cpus(n: usize) -> CpuSet {
        CpuSet::from_cores((0..n).map(|id| CoreId { id }).collect())
    }

    fn test_core() -> PacketCore {
        let (writer, _reader) = fifo::pair(8);
        PacketCore::new(
            "test-packet",
            "TEST",
            writer,
            Box::new(TrivialFilter::new(8)),
            None,
            false,
        )
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(7)]
    fn test_rr_cpu_cycles_in_order(#[case] num_cpus: usize) {
        let policy = RrCpuPolicy::new(synthetic_cpus(num_cpus));
        let mut core = test_core();
        for i in 0..3 * num_cpus {
            policy.assign_packet(&mut core);
            assert_eq!(core.bind_cpu(), Some(CoreId { id: i % num_cpus }));
        }
    }

    #[test]
    fn test_rr_cpu_is_fair_under_concurrency() {
        let num_cpus = 4;
        let per_thread = 100;
        let policy = Arc::new(RrCpuPolicy::new(synthetic_cpus(num_cpus)));
        let mut handles = Vec::new();
        for _ in 0..num_cpus {
            let policy = policy.clone();
            handles.push(thread::spawn(move || {
                let mut core = test_core();
                let mut assigned = Vec::with_capacity(per_thread);
                for _ in 0..per_thread {
                    policy.assign_packet(&mut core);
                    assigned.push(core.bind_cpu().unwrap().id);
                }
                assigned
            }));
        }
        let mut counts = vec![0usize; num_cpus];
        for handle in handles {
            for id in handle.join().unwrap() {
                counts[id] += 1;
            }
        }
        // total is a multiple of the cpu count, so a serialized round robin
        // lands the same number of assignments on every cpu
        assert!(counts.iter().all(|&c| c == per_thread));
    }

    #[test]
    fn test_query_cpu_is_sticky_within_a_query() {
        let policy = QueryCpuPolicy::new(synthetic_cpus(4));
        let q0 = policy.query_state();
        let q1 = policy.query_state();
        assert_eq!(q0, QueryState::Cpu(CoreId { id: 0 }));
        assert_eq!(q1, QueryState::Cpu(CoreId { id: 1 }));

        let mut core = test_core();
        core.assign_query_state(q0);
        for _ in 0..5 {
            policy.assign_packet(&mut core);
            assert_eq!(core.bind_cpu(), Some(CoreId { id: 0 }));
        }
        core.assign_query_state(q1);
        policy.assign_packet(&mut core);
        assert_eq!(core.bind_cpu(), Some(CoreId { id: 1 }));
    }

    #[test]
    fn test_rr_module_two_level_round_robin() {
        // 6 cpus, 2 modules: module 0 owns cpus 0..3, module 1 owns 3..6
        let policy = RrModulePolicy::new(synthetic_cpus(6), 2);
        let q0 = policy.query_state();
        let q1 = policy.query_state();
        let q2 = policy.query_state();
        assert_eq!(q0, QueryState::Module(0));
        assert_eq!(q1, QueryState::Module(1));
        assert_eq!(q2, QueryState::Module(0));

        let mut core = test_core();
        core.assign_query_state(q1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            policy.assign_packet(&mut core);
            seen.push(core.bind_cpu().unwrap().id);
        }
        assert_eq!(seen, vec![3, 4, 5, 3, 4, 5]);
    }

    #[test]
    fn test_os_policy_leaves_packets_unbound() {
        let policy = OsPolicy;
        assert_eq!(policy.query_state(), QueryState::Unbound);
        let mut core = test_core();
        policy.assign_packet(&mut core);
        assert_eq!(core.bind_cpu(), None);
    }
}
