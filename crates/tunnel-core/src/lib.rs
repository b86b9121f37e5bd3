//! tunnel-core: shared protocol library for the reverse-tunnel broker.
//!
//! Provides the `Packet` control message, the two wire codecs (streaming
//! JSON for A⇄B, `key=value` lines for C⇄B), and the `Tunnel` primitive
//! that copies bytes between a pair of connected sockets.

pub mod codec;
pub mod error;
pub mod packet;
pub mod tunnel;

pub use codec::{JsonStream, LineStream};
pub use error::{TunnelError, TunnelResult};
pub use packet::Packet;
pub use tunnel::{Status, Tunnel};
