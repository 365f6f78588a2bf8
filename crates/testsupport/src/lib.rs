//! Test support utilities for the Raft workspace.
//!
//! Provides:
//! - An in-memory transport and cluster harness for multi-node scenarios,
//!   with partition injection and node restarts
//! - A key/value state machine with an inspection handle
//! - Property-based generators for core types
//!
//! # Example
//!
//! ```no_run
//! use testsupport::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::test]
//! async fn replicate() {
//!     let cluster = TestCluster::spawn(3, 0).unwrap();
//!     let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
//!     cluster.submit_set(leader, "foo", "1").await.unwrap();
//! }
//! ```

pub mod cluster;
pub mod fixtures;
pub mod kv;
pub mod proptest_generators;

/// Convenient re-exports for common testing patterns.
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::fixtures::*;
    pub use crate::kv::*;
}
