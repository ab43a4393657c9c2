//! Data Change Protocol: the engine's ordered change stream.
//!
//! Every mutation, deletion, expiration and durable commit/abort a
//! partition accepts is replayed to consumers in strictly increasing
//! per-partition seqno order. A consumer opens one stream per partition,
//! negotiates where to resume via the failover table, and receives items
//! bracketed by snapshot markers: first from disk (backfill), then from the
//! checkpoint (in-memory phase). Consumers grant byte budgets for flow
//! control; producers suspend when the budget is exhausted.

pub mod message;
pub mod producer;
pub mod stream;

pub use message::{DcpMessage, StreamEndReason};
pub use producer::{DcpProducer, StreamRequest};
pub use stream::ActiveStream;

#[cfg(test)]
mod tests;
