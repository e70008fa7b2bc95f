//! kubeterm session relay.
//!
//! Relays exec, attach and log streams of cluster workloads to viewers that
//! may come and go. Each session keeps running while detached and replays its
//! buffered output to the next viewer.

pub mod backend;
pub mod channel;
pub mod console;
pub mod history;
pub mod reaper;
pub mod registry;
pub mod resize;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
#[allow(clippy::expect_used)]
pub mod test_helpers;

pub use backend::{Backend, KubeBackend, OpenRequest};
pub use history::HistoryBuffer;
pub use reaper::IdleReaper;
pub use registry::SessionRegistry;
pub use session::{
    Connection, ConnectionMode, ConnectionState, RelayError, SessionId, Target, Viewer, ViewerGone,
};
pub use transport::{Transport, TransportError};
