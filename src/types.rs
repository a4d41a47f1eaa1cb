//! Domain types persisted by the storage engine.
//!
//! These are plain data carriers; producing them (feed fetching/parsing) is
//! an external collaborator's responsibility (see crate-level docs).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A subscribable feed, identified by `url`.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub url: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub updated_at: Option<NaiveDateTime>,
    pub user_title: Option<String>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub stale: bool,
    pub last_updated: Option<NaiveDateTime>,
    pub added_at: NaiveDateTime,
}

/// One piece of entry content, e.g. a summary or the full body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A file attached to an entry (podcast audio, PDFs, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enclosure {
    pub href: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub enclosure_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
}

/// A single item within a feed, identified by `(feed_url, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub updated_at: NaiveDateTime,
    pub published_at: Option<NaiveDateTime>,
    pub summary: Option<String>,
    pub content: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
    pub read: bool,
    pub important: bool,
    pub last_updated: NaiveDateTime,
    pub first_updated_epoch: Option<NaiveDateTime>,
    pub feed_order: i64,
}

/// A projection of an [`Entry`] used during fetch reconciliation: just
/// enough to decide whether a freshly-parsed entry is new or changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryForUpdate {
    pub updated_at: NaiveDateTime,
}

/// A projection of a [`Feed`] used during fetch reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForUpdate {
    pub url: String,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub stale: bool,
    pub last_updated: Option<NaiveDateTime>,
}

/// A `(feed_url, key) -> value` metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMetadata {
    pub feed_url: String,
    pub key: String,
    pub value: Json,
}

/// Ordering cursor for `get_entries`: the tuple of ordering-key values of
/// the last row yielded, used to resume paged iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct EntriesCursor {
    /// `coalesce(published, updated)`, as whole seconds + nanoseconds.
    pub sort_key: NaiveDateTime,
    pub feed_url: String,
    pub entry_id: String,
}

/// Filters accepted by `get_entries`.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub read: Option<bool>,
    pub important: Option<bool>,
    pub feed_url: Option<String>,
    pub entry_id: Option<String>,
    pub has_enclosures: Option<bool>,
}
