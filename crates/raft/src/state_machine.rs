//! The seam between the replicated log and user state.

use common::Result;
use storage::Entry;

/// User-supplied state machine fed by the commit pipeline.
///
/// `apply` is invoked exactly once per committed command entry, in strict
/// index order, on every member. The returned bytes answer the submit that
/// produced the entry. An `Err` becomes an application error on the wire but
/// never stops the log.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command entry.
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>>;

    /// Serve a read-only query against applied state.
    fn query(&self, payload: &[u8]) -> Result<Vec<u8>>;
}
