//! Wire codecs for the two control planes.
//!
//! [`json_stream`] carries A⇄B Packets as a bare concatenation of JSON
//! objects (no length prefix — the JSON parser itself is the framing).
//! [`line`] carries C⇄B Packets as one `key=value&...` line per message.

pub mod json_stream;
pub mod line;

pub use json_stream::JsonStream;
pub use line::LineStream;
