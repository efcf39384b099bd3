//! Cody daemon: ingest processor + drain trampoline + redelivery tick +
//! socket server.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_commit, request_drain, request_status, request_stop, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{
    init_tracing, run, run_with_state, start_blocking, target_summary, ChannelNotifier,
    CommitRequest, CommitSummary, DaemonState, DrainStats, DEFAULT_BRANCH,
};
