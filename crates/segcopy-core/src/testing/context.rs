//! TestContext - owns the temporary directory of one test
//!
//! Shard stores, commit points and staged files of a test all live below
//! [`TestContext::path`]; everything is removed when the context is dropped.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Per-test temporary directory
///
/// # Example
///
/// ```rust,no_run
/// use segcopy_core::store::ShardStore;
/// use segcopy_core::testing::TestContext;
///
/// let ctx = TestContext::new();
/// let store = ShardStore::open(ctx.shard_dir("primary")).unwrap();
/// // `ctx` must outlive the store
/// ```
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a fresh temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Root of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Directory for the shard store of one simulated node
    pub fn shard_dir(&self, node_id: &str) -> PathBuf {
        self.temp_dir.path().join(node_id)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
