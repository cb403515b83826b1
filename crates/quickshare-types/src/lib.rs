//! Shared data types for QuickShare nodes.
//!
//! `models` holds the in-process records (peers, chunks, chunk results),
//! `events` the progress stream handed to the presentation layer, and `wire`
//! the JSON messages exchanged over discovery and control sockets.

pub mod events;
pub mod models;
pub mod wire;

pub use events::{ProgressEvent, ProgressPhase};
pub use models::{Chunk, ChunkErrorKind, ChunkResult, Peer};
pub use wire::{
    ControlMessage, DiscoveryAnnouncement, HASH_ALGORITHM_SHA256, TransferAccept, TransferOffer,
};
