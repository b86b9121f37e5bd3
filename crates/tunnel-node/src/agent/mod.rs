//! Node A: the agent that dials B and serves its command loop.

mod client;

pub use client::NodeA;
