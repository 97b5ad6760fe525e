/// Configuration for a dispatcher pool.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads. 0 = one per online CPU.
    pub workers: usize,
    /// Maximum events a worker drains from one task before requeueing it,
    /// so a busy task cannot starve its siblings.
    pub quantum: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 0,
            quantum: 32,
        }
    }
}
