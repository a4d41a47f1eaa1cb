#![cfg_attr(not(test), warn(clippy::unwrap_used))]

//! Embedded storage engine for a feed reader.
//!
//! [`Storage`] is the public entry point: open a database file (or an
//! in-memory/private one for tests), then use its methods to manage feeds,
//! entries and per-feed metadata. Everything underneath — connection
//! lifecycle, schema migrations, pagination — is reachable for advanced
//! callers but not required for the common case.

pub mod connection;
pub mod error;
pub mod migration;
pub mod pagination;
pub mod sql_util;
pub mod storage;
pub mod types;

pub use connection::ConnectionFactory;
pub use error::{Error, Result};
pub use storage::{
    EntriesIter, FeedUpdate, FeedUpdateFields, OpenParams, Storage, APPLICATION_ID,
};
pub use types::{
    Content, Enclosure, Entry, EntryFilter, EntryForUpdate, EntriesCursor, Feed, FeedForUpdate,
    FeedMetadata,
};

#[cfg(feature = "test")]
pub use storage::FetchQueryMode;
