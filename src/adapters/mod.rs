//! Concrete collaborators
//!
//! - [`http`]: protocol messages and control plane callbacks over HTTP (reqwest)
//! - [`embedded`]: both planes in one process, calling each other directly
//! - [`file`]: push transfers between local files

pub mod embedded;
pub mod file;
pub mod http;

pub use embedded::{EmbeddedControlPlaneClient, EmbeddedDataFlowController};
pub use file::FileTransferService;
pub use http::{HttpControlPlaneClient, HttpRemoteMessageDispatcher, classify_status};
