//! driftsync library
//!
//! One side of a cross-host file-tree mirror: a push client that uploads
//! local change events to a remote file server, and a monitor client that
//! applies a remote change stream locally. Both share a framed control
//! channel (connect → auth → info → stream) and the action vocabulary
//! Create / Write / Remove / Rename / Chmod / Symlink.

pub mod auth;
pub mod checksum;
pub mod cli;
pub mod contract;
pub mod eventlog;
pub mod file_list;
pub mod http;
pub mod ignore;
pub mod logging;
pub mod monitor;
pub mod protocol;
pub mod push;
pub mod queue;
pub mod retry;
pub mod session;
pub mod syncer;
pub mod tls;
pub mod transport;
pub mod vfs;
