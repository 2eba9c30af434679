//! # parley-shared
//!
//! Types shared between the server, the store, and clients of the wire
//! protocol: id newtypes, the real-time command/event enums, and the
//! hydrated payload structs returned by both the WebSocket channel and the
//! REST surface.

pub mod protocol;
pub mod types;

pub use protocol::*;
pub use types::*;
