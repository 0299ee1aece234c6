//! Peer event loop: per-peer protocol state machines, header/block sync
//! coordination and gossip, driven by a single worker thread.

#[macro_use]
pub mod logging;

pub mod api;
pub mod block_download;
pub mod config;
pub mod error;
pub mod eventloop;
pub mod header_download;
pub mod interfaces;
pub mod mempool;
pub mod peer;
pub mod registry;
pub mod sender;
pub mod sync_state;
pub mod timer;
pub mod transport;
pub mod wire;

pub use config::NodeConfig;
pub use error::{ErrorCode, Offender};
pub use eventloop::{Event, Eventloop, Handle, Inspector};
pub use transport::{Conn, Link, Sndbuffer};
