//! QuickShare node: the collaborator API over discovery and transfer.
//!
//! - [`api::discover`]: peers heard within a wait window
//! - [`api::send`]: offer a file and stream it in the background
//! - [`api::receive`]: accept offers into a directory

pub mod api;
pub mod config;

pub use api::{ReceiveHandle, SendHandle, discover, receive, receive_with, send};
pub use config::{DEFAULT_CONTROL_PORT, NodeConfig};
