use core_affinity::CoreId;

/// The set of CPUs dispatch policies hand assignments out of.
///
/// Discovery goes through the OS; tests and callers that want deterministic
/// layouts can build one from explicit core ids. Policies that reason about
/// modules assume cores of the same module are adjacent in this set.
#[derive(Clone, Debug)]
pub struct CpuSet {
    cores: Vec<CoreId>,
}

impl CpuSet {
    /// Enumerate the CPUs of this machine. Falls back to a single logical
    /// CPU when the platform cannot report core ids.
    pub fn discover() -> Self {
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        if cores.is_empty() {
            return CpuSet {
                cores: vec![CoreId { id: 0 }],
            };
        }
        CpuSet { cores }
    }

    pub fn from_cores(cores: Vec<CoreId>) -> Self {
        assert!(!cores.is_empty(), "empty cpu set");
        CpuSet { cores }
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    pub fn core(&self, index: usize) -> CoreId {
        self.cores[index]
    }
}
