//! Database configuration.

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to error if the database already exists.
    pub error_if_exists: bool,

    /// Maximum number of row ids held by one block of an index list.
    pub index_block_size: usize,

    /// Number of cells cached per table (0 = no cache).
    pub cell_cache_capacity: usize,

    /// Whether reading a table that a concurrent transaction committed
    /// changes to makes the reader's commit fail.
    pub error_on_dirty_select: bool,

    /// Whether every successful commit ends with a store checkpoint.
    pub checkpoint_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            index_block_size: 512,
            cell_cache_capacity: 4096,
            error_on_dirty_select: true,
            checkpoint_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if database exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the index list block size. Values below 16 are raised to 16.
    #[must_use]
    pub const fn index_block_size(mut self, size: usize) -> Self {
        self.index_block_size = if size < 16 { 16 } else { size };
        self
    }

    /// Sets the per-table cell cache capacity.
    #[must_use]
    pub const fn cell_cache_capacity(mut self, capacity: usize) -> Self {
        self.cell_cache_capacity = capacity;
        self
    }

    /// Sets whether dirty selects abort the commit.
    #[must_use]
    pub const fn error_on_dirty_select(mut self, value: bool) -> Self {
        self.error_on_dirty_select = value;
        self
    }

    /// Sets whether to checkpoint the store after each commit.
    #[must_use]
    pub const fn checkpoint_on_commit(mut self, value: bool) -> Self {
        self.checkpoint_on_commit = value;
        self
    }
}
