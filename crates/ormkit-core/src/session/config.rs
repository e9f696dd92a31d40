//! Session configuration.

/// Default limit on how many levels a removal may cascade through.
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 100;

/// Configuration for a unit of work.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum cascade depth before a removal is rejected.
    pub max_cascade_depth: usize,

    /// Whether flush also emits updates for modified managed entities that
    /// were never passed to `persist`.
    pub dirty_check_managed: bool,

    /// Relation paths populated by every `find`, in addition to the ones
    /// passed in `FindOptions`.
    pub default_populate: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
            dirty_check_managed: true,
            default_populate: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum cascade depth.
    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    /// Only flush entities that were explicitly staged.
    pub fn without_dirty_check(mut self) -> Self {
        self.dirty_check_managed = false;
        self
    }

    /// Add a relation path populated by every `find`.
    pub fn with_default_populate(mut self, path: impl Into<String>) -> Self {
        self.default_populate.push(path.into());
        self
    }
}
