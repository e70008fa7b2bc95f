//! Session relay: connections, their reader tasks and the viewer contract.

mod connection;
mod reader;
mod types;
mod viewer;

pub use connection::Connection;
pub use reader::ReaderExit;
pub use types::{ConnectionMode, ConnectionState, RelayError, SessionId, Target, UnknownMode};
pub use viewer::{Viewer, ViewerGone};
