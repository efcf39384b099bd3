use std::path::{Path, PathBuf};

use cody_core::config::cody_root;

pub const DAEMON_SOCKET: &str = "daemon.sock";

/// Capacity of the ingest job channel; socket clients wait when it is full.
pub const INGEST_QUEUE_CAPACITY: usize = 64;

pub fn socket_path(home: &Path) -> PathBuf {
    cody_root(home).join(DAEMON_SOCKET)
}
