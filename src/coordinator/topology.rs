//! Processor topology
//!
//! Round-robin affinity needs the set of active processors. Detection goes
//! through `num_cpus`, which respects cgroup and affinity restrictions, so
//! a containerized run only pins onto processors it can actually use.

/// The processors available to this process
#[derive(Debug, Clone)]
pub struct Topology {
    processors: Vec<usize>,
}

impl Topology {
    pub fn detect() -> Self {
        Self {
            processors: (0..num_cpus::get()).collect(),
        }
    }

    /// A fixed processor set, for tests and explicit overrides
    pub fn with_processors(processors: Vec<usize>) -> Self {
        Self { processors }
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Processor for `thread_index` under round-robin assignment over
    /// `explicit` when non-empty, otherwise over all active processors
    pub fn processor_for(&self, thread_index: usize, explicit: &[usize]) -> usize {
        if !explicit.is_empty() {
            explicit[thread_index % explicit.len()]
        } else {
            self.processors[thread_index % self.processors.len()]
        }
    }
}
