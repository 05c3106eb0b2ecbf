//! Tuning knobs for the POSIX environment.

/// Overrides for the environment's resource caps. Fields left `None` take
/// the platform defaults: 1000 concurrent maps on 64-bit targets (none on
/// smaller pointers) and 20% of the soft descriptor limit for long-lived
/// read-only files.
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Maximum concurrent memory-mapped files.
    pub mmap_limit: Option<usize>,

    /// Maximum long-lived read-only descriptors.
    pub read_only_fd_limit: Option<usize>,
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrent memory-map cap.
    pub fn mmap_limit(mut self, limit: usize) -> Self {
        self.mmap_limit = Some(limit);
        self
    }

    /// Set the long-lived read-only descriptor cap.
    pub fn read_only_fd_limit(mut self, limit: usize) -> Self {
        self.read_only_fd_limit = Some(limit);
        self
    }
}
