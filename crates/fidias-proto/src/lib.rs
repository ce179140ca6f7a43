//! Fidias wire protocol
//!
//! Every RPC is one request frame answered by one response frame with the
//! same request id. Frames are self-checking (CRC32C over the body) and
//! versioned so the layout can evolve without breaking older peers.

pub mod frame;
pub mod message;

pub use frame::{FrameHeader, FrameKind, decode_frame, encode_frame, read_frame, write_frame};
pub use message::{RelocatePreamble, Request, Response, decode_body, encode_body};
