//! Streaming side of the chat client.
//!
//! - `sse` - incremental decoder for the proxy's event stream
//! - `aggregator` - running text of the reply being streamed
//! - `client` - proxy transport, error types and turn events
mod aggregator;
mod client;
pub mod sse;


pub use aggregator::DeltaAggregator;
pub use client::{ChatError, ChatResult, FragmentStream, ProxyClient, TurnEvent, TurnEvents};
pub use sse::{StreamDecoder, StreamEvent, decode_stream};
