//! Client side of the Tether RPC fabric.
//!
//! Two pools satisfy the same dispatch contract: [`Client`] multiplexes
//! pipelined requests over a deque of connections and correlates responses
//! by sequence number, while [`BlockingClient`] serializes one request per
//! pooled connection using plain blocking sockets. Both retry transport
//! failures up to `max_retry` times and never retry application errors.

mod blocking;
mod client;
mod config;
mod pool;
mod request;

pub use blocking::BlockingPool;
pub use client::{BlockingClient, Client};
pub use config::ClientConfig;
pub use pool::AsyncPool;
pub use request::{next_sequence_id, Request};
