//! Testing infrastructure for the segment copy core
//!
//! Shared helpers for unit tests and the integration tests under `tests/`.
//!
//! # Key Features
//!
//! - **TestContext**: per-test temporary directory, removed on drop
//! - **TestCluster**: several nodes with source and target services on one
//!   in-process network
//! - **Fixtures**: loopback nodes, started segment shards, committed files,
//!   snapshots that record their release
//!
//! # Usage
//!
//! ```rust,no_run
//! use segcopy_core::store::ShardStore;
//! use segcopy_core::testing::{TestContext, commit_files};
//!
//! let ctx = TestContext::new();
//! let store = ShardStore::open(ctx.shard_dir("primary")).unwrap();
//! let info = commit_files(&store, 1, &[("_0.cfs", b"segment")]).unwrap();
//! assert_eq!(info.version, 1);
//! ```

mod cluster;
mod context;
mod fixtures;

pub use cluster::{TestCluster, TestNode};
pub use context::TestContext;
pub use fixtures::{CountingDeleter, commit_files, segment_shard, test_node};
