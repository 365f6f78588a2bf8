//! Shared fixtures for tests across the workspace.

use common::{Config, Member, MemberType};
use std::path::Path;
use std::time::Duration;

/// Initialize env_logger once; safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default())
        .is_test(true)
        .try_init();
}

/// A single-member configuration over `dir`, sized small enough that tests
/// exercise segment rotation.
pub fn single_node_config(dir: &Path) -> Config {
    Config::builder()
        .directory(dir.to_path_buf())
        .name("single".to_string())
        .max_entry_size(64 * 1024)
        .max_segment_size(256 * 1024)
        .max_entries_per_segment(64)
        .election_timeout(Duration::from_millis(150))
        .heartbeat_interval(Duration::from_millis(50))
        .members(vec![Member::new(1, "mem://1", MemberType::Active)])
        .member_type(MemberType::Active)
        .build()
}
