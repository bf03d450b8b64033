/// Options for a [crate::Tree]
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct TreeOptions {
    /// Maximum number of times a single search retries from the root after
    /// the page cache reports a concurrent structural change, before failing
    /// with [crate::Error::SearchRestartLimit].
    ///
    /// `None` retries indefinitely, which matches the behavior of searches
    /// racing ordinary, finite reorganization: every restart observes a fresh
    /// tree shape and the race is expected to stop recurring.
    ///
    /// Default: `None`
    pub max_restart_attempts: Option<u32>,
}

impl TreeOptions {
    /// New `TreeOptions` with default values.
    pub fn new() -> Self {
        Self {
            max_restart_attempts: None,
        }
    }
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for a [crate::PageCache]
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct CacheOptions {
    /// Whether to verify page checksums when a page is requested from the
    /// cache. Pages written without checksums (checksum field zero) are
    /// never verified.
    ///
    /// Default: `false`
    pub verify_checksums: bool,
}

impl CacheOptions {
    /// New `CacheOptions` with default values.
    pub fn new() -> Self {
        Self {
            verify_checksums: false,
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::new()
    }
}
