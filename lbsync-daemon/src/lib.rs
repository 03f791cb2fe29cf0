//! lbsync daemon runtime: manifest watcher + pass processor + socket server.

mod error;
pub mod manifests;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use manifests::ManifestIndex;
pub use protocol::{
    request_config, request_status, request_stop, request_sync, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, start_blocking, PassSummary};
