//! Persistence: durable history plus a latest-value cache, fed through a
//! batching writer task.

pub mod store;
pub mod writer;

pub use store::{HistoryStore, RedisValueCache, SqliteHistoryStore, ValueCache};
pub use writer::{BatchWriter, FlushObserver};
