use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::dispatcher::{DispatchPolicy, Dispatcher, OsPolicy, QueryState};
use crate::error::ExecError;
use crate::log_info;
use crate::packet::Packet;
use crate::stage::{
    AggregateStage, DefaultFactory, FdumpStage, FscanStage, HashJoinStage, MergeStage, SortStage,
    StageContainer, StageFactory, TScanStage,
};

/// Sizing knobs for an engine instance.
///
/// `scan_workers` must be at least the largest sort fan-in in use: a running
/// merge holds one file-scan per input run, and starving the oldest merge's
/// scans behind younger ones stalls the whole cascade.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub workers_per_stage: usize,
    pub scan_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers_per_stage: 2,
            scan_workers: 8,
        }
    }
}

struct Registration {
    name: &'static str,
    factory: Box<dyn StageFactory>,
    workers: usize,
}

/// Builds an engine: which stages exist, how many workers each gets, and
/// which dispatch policy binds their executions to CPUs.
pub struct EngineBuilder {
    config: EngineConfig,
    policy: Arc<dyn DispatchPolicy>,
    registrations: Vec<Registration>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            config: EngineConfig::default(),
            policy: Arc::new(OsPolicy),
            registrations: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn DispatchPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Register a stage container. Registering a name twice replaces the
    /// earlier entry.
    pub fn register(
        mut self,
        name: &'static str,
        factory: Box<dyn StageFactory>,
        workers: usize,
    ) -> Self {
        self.registrations.retain(|r| r.name != name);
        self.registrations.push(Registration {
            name,
            factory,
            workers,
        });
        self
    }

    /// Register the built-in stage set with worker counts from the config.
    pub fn with_builtin_stages(self) -> Self {
        let workers = self.config.workers_per_stage;
        let scan_workers = self.config.scan_workers;
        self.register(
            crate::stage::TSCAN_PACKET_TYPE,
            Box::new(DefaultFactory::<TScanStage>::new()),
            workers,
        )
        .register(
            crate::stage::FSCAN_PACKET_TYPE,
            Box::new(DefaultFactory::<FscanStage>::new()),
            scan_workers,
        )
        .register(
            crate::stage::FDUMP_PACKET_TYPE,
            Box::new(DefaultFactory::<FdumpStage>::new()),
            workers,
        )
        .register(
            crate::stage::MERGE_PACKET_TYPE,
            Box::new(DefaultFactory::<MergeStage>::new()),
            workers,
        )
        .register(
            crate::stage::SORT_PACKET_TYPE,
            Box::new(DefaultFactory::<SortStage>::new()),
            workers,
        )
        .register(
            crate::stage::AGGREGATE_PACKET_TYPE,
            Box::new(DefaultFactory::<AggregateStage>::new()),
            workers,
        )
        .register(
            crate::stage::HASH_JOIN_PACKET_TYPE,
            Box::new(DefaultFactory::<HashJoinStage>::new()),
            workers,
        )
    }

    pub fn build(self) -> Engine {
        let mut containers = HashMap::new();
        let mut worker_plan = Vec::new();
        for reg in self.registrations {
            let container = StageContainer::new(reg.name, reg.factory);
            containers.insert(reg.name, container.clone());
            worker_plan.push((container, reg.workers));
        }
        let containers = Arc::new(containers);
        let dispatcher = Dispatcher::new(containers.clone(), self.policy);

        let mut workers = Vec::new();
        for (container, count) in worker_plan {
            for i in 0..count {
                let container = container.clone();
                let dispatcher = dispatcher.clone();
                let name = format!("{}-worker-{}", container.name().to_lowercase(), i);
                let handle = std::thread::Builder::new()
                    .name(name)
                    .spawn(move || container.run(&dispatcher))
                    .expect("failed to spawn stage worker");
                workers.push(handle);
            }
        }
        log_info!("engine started with {} workers", workers.len());

        Engine {
            containers,
            dispatcher,
            workers: Some(workers),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An explicitly constructed execution context: every container, worker
/// thread and the dispatch policy hang off this object, and shutting it down
/// joins everything it started.
pub struct Engine {
    containers: Arc<HashMap<&'static str, Arc<StageContainer>>>,
    dispatcher: Dispatcher,
    workers: Option<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Default engine: built-in stages, default config, OS dispatch policy.
    pub fn new() -> Engine {
        EngineBuilder::new().with_builtin_stages().build()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Create the dispatch state for a new query; assign it to every packet
    /// of that query.
    pub fn new_query(&self) -> QueryState {
        self.dispatcher.new_query()
    }

    pub fn dispatch(&self, packet: Box<dyn Packet>) -> Result<(), ExecError> {
        self.dispatcher.dispatch(packet)
    }

    pub fn container(&self, packet_type: &str) -> Option<&Arc<StageContainer>> {
        self.containers.get(packet_type)
    }

    /// Stop accepting work, drain pending groups, and join every worker.
    pub fn shutdown(&mut self) {
        let Some(workers) = self.workers.take() else {
            return;
        };
        for container in self.containers.values() {
            container.close();
        }
        for handle in workers {
            if handle.join().is_err() {
                log_info!("a stage worker exited by panic");
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
