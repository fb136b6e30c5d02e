//! kvtsdb Core - OpenTSDB-compatible time-series storage over a transactional KV store
//!
//! The core turns points into bucketed rows of an ordered key-value store and
//! reads them back as series:
//!
//! - **UID registry**: stable fixed-width hex ids for metric names, tag keys
//!   and tag values, assigned under optimistic transactions
//! - **Row key codec**: `metric ++ bucket ++ sorted tag pairs`, one row per
//!   series per day
//! - **Writers**: points and annotations upserted into their rows
//! - **Queries**: window scans regrouped into series, annotation windows and
//!   tag-predicate lookup
//!
//! Everything runs against the [`store::KvStore`] contract; [`store::MemoryStore`]
//! is the bundled implementation, optionally backed by a commit journal.

pub mod codec;
pub mod config;
pub mod query;
pub mod row;
pub mod store;
pub mod uid;
pub mod writer;

mod engine;
mod error;
mod retry;
mod types;

pub use engine::Tsdb;
pub use error::{Result, TsdbError};
pub use types::*;

/// kvtsdb version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
