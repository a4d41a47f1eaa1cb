//! Typed CRUD over feeds, entries, and feed metadata.
//!
//! `Storage` is the single entry point callers use; it owns a
//! [`ConnectionFactory`] and funnels every SQLite error through
//! [`Error::from_sqlite`]. The method shapes (read-only helpers returning
//! iterators that borrow `&self`, mutations returning `Result<(), Error>`
//! and checking `change_count()`) follow `radicle`'s
//! `node::policy::store::Store` closely.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde_json::Value as Json;
use sqlite::{Connection, Value};

use crate::connection::ConnectionFactory;
use crate::error::Error;
use crate::migration::HeavyMigration;
use crate::pagination::Paginated;
use crate::sql_util::transaction;
use crate::types::{
    Content, Enclosure, Entry, EntryForUpdate, EntryFilter, EntriesCursor, Feed, FeedForUpdate,
    FeedMetadata,
};

/// Magic constant stamped into `PRAGMA application_id` by every database
/// this crate creates.
pub const APPLICATION_ID: i64 = 0x5246_4B50; // "RFKP", arbitrary.

/// Schema version this build knows how to create and migrate to.
const SCHEMA_VERSION: u32 = 1;

const INITIAL_SCHEMA: &str = include_str!("migrations/1.sql");

/// The number of bound parameters above which a single VALUES-list query
/// risks exceeding SQLite's default `SQLITE_LIMIT_VARIABLE_NUMBER`,
/// forcing the batched fallback in [`Storage::get_entries_for_update`].
const SQLITE_MAX_VARIABLE_NUMBER: usize = 999;

fn migrations() -> HeavyMigration {
    HeavyMigration {
        create: |db| {
            db.execute(INITIAL_SCHEMA)?;
            Ok(())
        },
        version: SCHEMA_VERSION,
        migrations: Vec::new(),
        id: APPLICATION_ID,
        minimum_sqlite_version: (3, 24, 0),
        required_functions: &["json_array_length"],
    }
}

/// Construction-time configuration for [`Storage::open`].
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub timeout: Duration,
    pub wal_enabled: Option<bool>,
}

impl Default for OpenParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            wal_enabled: None,
        }
    }
}

/// Test-only knob controlling whether `get_entries_for_update` uses the
/// single-query path or the batched fallback unconditionally.
#[cfg(feature = "test")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchQueryMode {
    Auto,
    ForceSingleQuery,
    ForceFallback,
}

#[cfg(feature = "test")]
impl Default for FetchQueryMode {
    fn default() -> Self {
        FetchQueryMode::Auto
    }
}

const MODE_AUTO: u8 = 0;
const MODE_SINGLE: u8 = 1;
const MODE_FALLBACK: u8 = 2;

/// Partial update accepted by [`Storage::update_feed`]. An outer `None`
/// preserves the stored field; `Some(_)` overwrites it (possibly with
/// `None`, clearing it to SQL `NULL`).
#[derive(Debug, Clone, Default)]
pub struct FeedUpdate {
    pub feed: Option<FeedUpdateFields>,
    pub http_etag: Option<Option<String>>,
    pub http_last_modified: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedUpdateFields {
    pub title: Option<String>,
    pub link: Option<String>,
    pub updated_at: Option<NaiveDateTime>,
}

pub struct Storage {
    factory: Arc<ConnectionFactory>,
    fetch_query_mode: Arc<AtomicU8>,
}

impl Storage {
    /// Open (creating if needed) a database at `path`, running schema
    /// creation/migration exactly once.
    pub fn open(path: impl AsRef<Path>, params: OpenParams) -> Result<Self, Error> {
        let timeout_ms = params.timeout.as_millis() as i64;
        let wal_enabled = params.wal_enabled;

        let factory = ConnectionFactory::with_hooks(
            path,
            None,
            move |db: &Connection| -> Result<(), Error> {
                db.execute(format!("PRAGMA busy_timeout = {timeout_ms};"))?;
                db.execute("PRAGMA foreign_keys = ON;")?;
                if let Some(wal) = wal_enabled {
                    db.execute(if wal {
                        "PRAGMA journal_mode = WAL;"
                    } else {
                        "PRAGMA journal_mode = DELETE;"
                    })?;
                }
                Ok(())
            },
            |_db| {},
        )?;

        let migration = migrations();
        factory.get(|db| migration.migrate(db))?;

        Ok(Self {
            factory: Arc::new(factory),
            fetch_query_mode: Arc::new(AtomicU8::new(MODE_AUTO)),
        })
    }

    /// Close the storage's connection. Only valid from the creating thread
    /// (see [`ConnectionFactory::close`]); dropping `Storage` does the same
    /// implicitly.
    pub fn close(self) -> Result<(), Error> {
        self.factory.close()
    }

    #[cfg(feature = "test")]
    pub fn set_fetch_query_mode(&self, mode: FetchQueryMode) {
        let raw = match mode {
            FetchQueryMode::Auto => MODE_AUTO,
            FetchQueryMode::ForceSingleQuery => MODE_SINGLE,
            FetchQueryMode::ForceFallback => MODE_FALLBACK,
        };
        self.fetch_query_mode.store(raw, Ordering::SeqCst);
    }

    // ---- feeds ---------------------------------------------------------

    pub fn add_feed(&self, url: &str, added_at: NaiveDateTime) -> Result<(), Error> {
        self.factory.get(|db| {
            let mut stmt =
                db.prepare("INSERT INTO feeds (url, stale, added) VALUES (?1, 0, ?2);")?;
            stmt.bind((1, url))?;
            stmt.bind((2, added_at.to_string().as_str()))?;
            stmt.next()?;
            Ok(())
        })
    }

    pub fn remove_feed(&self, url: &str) -> Result<(), Error> {
        self.factory.get(|db| {
            let mut stmt = db.prepare("DELETE FROM feeds WHERE url = ?1;")?;
            stmt.bind((1, url))?;
            stmt.next()?;
            rowcount_exactly_one(db, || Error::FeedNotFound { url: url.to_string() })
        })
    }

    pub fn set_feed_user_title(&self, url: &str, title: Option<&str>) -> Result<(), Error> {
        self.factory.get(|db| {
            let mut stmt = db.prepare("UPDATE feeds SET user_title = ?1 WHERE url = ?2;")?;
            stmt.bind((1, opt_str_value(title)))?;
            stmt.bind((2, url))?;
            stmt.next()?;
            rowcount_exactly_one(db, || Error::FeedNotFound { url: url.to_string() })
        })
    }

    pub fn mark_as_stale(&self, url: &str) -> Result<(), Error> {
        self.factory.get(|db| {
            let mut stmt = db.prepare("UPDATE feeds SET stale = 1 WHERE url = ?1;")?;
            stmt.bind((1, url))?;
            stmt.next()?;
            rowcount_exactly_one(db, || Error::FeedNotFound { url: url.to_string() })
        })
    }

    pub fn update_feed(
        &self,
        url: &str,
        update: FeedUpdate,
        last_updated: NaiveDateTime,
    ) -> Result<(), Error> {
        self.factory.get(|db| {
            let mut sets = vec!["last_updated = ?".to_string()];
            let mut values = vec![Value::String(last_updated.to_string())];

            if let Some(fields) = &update.feed {
                sets.push("title = ?".into());
                values.push(opt_str_value(fields.title.as_deref()));
                sets.push("link = ?".into());
                values.push(opt_str_value(fields.link.as_deref()));
                sets.push("updated = ?".into());
                values.push(opt_dt_value(fields.updated_at));
            }
            if let Some(etag) = &update.http_etag {
                sets.push("http_etag = ?".into());
                values.push(opt_str_value(etag.as_deref()));
            }
            if let Some(modified) = &update.http_last_modified {
                sets.push("http_last_modified = ?".into());
                values.push(opt_str_value(modified.as_deref()));
            }

            values.push(Value::String(url.to_string()));
            let sql = format!(
                "UPDATE feeds SET {} WHERE url = ?{};",
                sets.join(", "),
                values.len()
            );

            let mut stmt = db.prepare(sql)?;
            for (i, v) in values.into_iter().enumerate() {
                stmt.bind((i + 1, v))?;
            }
            stmt.next()?;
            rowcount_exactly_one(db, || Error::FeedNotFound { url: url.to_string() })
        })
    }

    pub fn get_feeds(&self) -> Result<Vec<Feed>, Error> {
        self.factory.get(|db| {
            let mut stmt = db.prepare(
                "SELECT url, title, link, updated, user_title, http_etag,
                        http_last_modified, stale, last_updated, added
                 FROM feeds ORDER BY url;",
            )?;
            let mut out = Vec::new();
            while let sqlite::State::Row = stmt.next()? {
                out.push(read_feed(&stmt)?);
            }
            Ok(out)
        })
    }

    pub fn get_feeds_for_update(&self) -> Result<Vec<FeedForUpdate>, Error> {
        self.factory.get(|db| {
            let mut stmt = db.prepare(
                "SELECT url, http_etag, http_last_modified, stale, last_updated
                 FROM feeds ORDER BY url;",
            )?;
            let mut out = Vec::new();
            while let sqlite::State::Row = stmt.next()? {
                out.push(FeedForUpdate {
                    url: stmt.read::<String, _>("url")?,
                    http_etag: stmt.read::<Option<String>, _>("http_etag")?,
                    http_last_modified: stmt.read::<Option<String>, _>("http_last_modified")?,
                    stale: stmt.read::<i64, _>("stale")? != 0,
                    last_updated: parse_opt_dt(stmt.read::<Option<String>, _>("last_updated")?)?,
                });
            }
            Ok(out)
        })
    }

    // ---- entries --------------------------------------------------------

    pub fn add_or_update_entry(
        &self,
        feed_url: &str,
        entry: &Entry,
        last_updated: NaiveDateTime,
        first_updated_epoch: Option<NaiveDateTime>,
        feed_order: i64,
    ) -> Result<(), Error> {
        self.factory.get(|db| {
            add_or_update_entry_locked(db, feed_url, entry, last_updated, first_updated_epoch, feed_order)
        })
    }

    pub fn add_or_update_entries<'a>(
        &self,
        entries: impl IntoIterator<
            Item = (&'a str, &'a Entry, NaiveDateTime, Option<NaiveDateTime>, i64),
        >,
    ) -> Result<(), Error> {
        self.factory.get(|db| {
            transaction(db, |db| {
                for (feed_url, entry, last_updated, first_updated_epoch, feed_order) in entries {
                    add_or_update_entry_locked(
                        db,
                        feed_url,
                        entry,
                        last_updated,
                        first_updated_epoch,
                        feed_order,
                    )?;
                }
                Ok(())
            })
        })
    }

    pub fn mark_as_read_unread(&self, feed_url: &str, entry_id: &str, flag: bool) -> Result<(), Error> {
        self.factory.get(|db| {
            let mut stmt =
                db.prepare("UPDATE entries SET read = ?1 WHERE feed = ?2 AND id = ?3;")?;
            stmt.bind((1, flag as i64))?;
            stmt.bind((2, feed_url))?;
            stmt.bind((3, entry_id))?;
            stmt.next()?;
            rowcount_exactly_one(db, || Error::EntryNotFound {
                feed_url: feed_url.to_string(),
                entry_id: entry_id.to_string(),
            })
        })
    }

    pub fn mark_as_important_unimportant(
        &self,
        feed_url: &str,
        entry_id: &str,
        flag: bool,
    ) -> Result<(), Error> {
        self.factory.get(|db| {
            let mut stmt =
                db.prepare("UPDATE entries SET important = ?1 WHERE feed = ?2 AND id = ?3;")?;
            stmt.bind((1, flag as i64))?;
            stmt.bind((2, feed_url))?;
            stmt.bind((3, entry_id))?;
            stmt.next()?;
            rowcount_exactly_one(db, || Error::EntryNotFound {
                feed_url: feed_url.to_string(),
                entry_id: entry_id.to_string(),
            })
        })
    }

    /// Resolve `(feed_url, entry_id)` pairs against stored entries,
    /// preserving input order and length; missing entries are `None`.
    ///
    /// Prefers a single query built from a `VALUES` list joined back to the
    /// keys; falls back to batched per-pair queries when the engine rejects
    /// the statement for having too many bound parameters. Both paths
    /// produce identical results.
    pub fn get_entries_for_update(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<Option<EntryForUpdate>>, Error> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let mode = self.fetch_query_mode.load(Ordering::SeqCst);

        self.factory.get(|db| {
            if mode == MODE_FALLBACK {
                return get_entries_for_update_fallback(db, pairs);
            }
            if mode == MODE_SINGLE {
                return get_entries_for_update_single(db, pairs);
            }

            if pairs.len() * 2 > SQLITE_MAX_VARIABLE_NUMBER {
                return get_entries_for_update_fallback(db, pairs);
            }
            match get_entries_for_update_single(db, pairs) {
                Ok(result) => Ok(result),
                Err(err) if err.to_string().contains("too many SQL variables") => {
                    log::warn!(
                        target: "db",
                        "get_entries_for_update: falling back to batched queries for {} pairs",
                        pairs.len()
                    );
                    get_entries_for_update_fallback(db, pairs)
                }
                Err(err) => Err(err),
            }
        })
    }

    // ---- feed metadata ---------------------------------------------------

    pub fn iter_feed_metadata(
        &self,
        feed_url: &str,
        key: Option<&str>,
    ) -> Result<Vec<FeedMetadata>, Error> {
        self.factory.get(|db| {
            let sql = match key {
                Some(_) => {
                    "SELECT feed, key, value FROM feed_metadata \
                     WHERE feed = ?1 AND key = ?2 ORDER BY key;"
                }
                None => "SELECT feed, key, value FROM feed_metadata WHERE feed = ?1 ORDER BY key;",
            };
            let mut stmt = db.prepare(sql)?;
            stmt.bind((1, feed_url))?;
            if let Some(key) = key {
                stmt.bind((2, key))?;
            }
            let mut out = Vec::new();
            while let sqlite::State::Row = stmt.next()? {
                let raw: Option<String> = stmt.read::<Option<String>, _>("value")?;
                let value: Json = match raw {
                    Some(s) => serde_json::from_str(&s)
                        .map_err(|e| Error::storage_with_cause("malformed feed metadata JSON", &e))?,
                    None => Json::Null,
                };
                out.push(FeedMetadata {
                    feed_url: stmt.read::<String, _>("feed")?,
                    key: stmt.read::<String, _>("key")?,
                    value,
                });
            }
            Ok(out)
        })
    }

    pub fn set_feed_metadata(&self, feed_url: &str, key: &str, value: &Json) -> Result<(), Error> {
        self.factory.get(|db| {
            let serialized = serde_json::to_string(value)
                .map_err(|e| Error::storage_with_cause("malformed feed metadata JSON", &e))?;

            if !feed_exists(db, feed_url)? {
                return Err(Error::FeedNotFound { url: feed_url.to_string() });
            }

            let mut stmt = db.prepare(
                "INSERT INTO feed_metadata (feed, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (feed, key) DO UPDATE SET value = excluded.value;",
            )?;
            stmt.bind((1, feed_url))?;
            stmt.bind((2, key))?;
            stmt.bind((3, serialized.as_str()))?;
            stmt.next()?;
            Ok(())
        })
    }

    pub fn delete_feed_metadata(&self, feed_url: &str, key: &str) -> Result<(), Error> {
        self.factory.get(|db| {
            let mut stmt = db.prepare("DELETE FROM feed_metadata WHERE feed = ?1 AND key = ?2;")?;
            stmt.bind((1, feed_url))?;
            stmt.bind((2, key))?;
            stmt.next()?;
            rowcount_exactly_one(db, || Error::MetadataNotFound {
                feed_url: feed_url.to_string(),
                key: key.to_string(),
            })
        })
    }

    /// Lazily iterate entries ordered by `(coalesce(published, updated)
    /// DESC, feed, id DESC)`. `chunk_size == 0` disables pagination (one
    /// statement, whole result set, borrowing the connection for the
    /// iterator's lifetime); `chunk_size > 0` fetches one page of at most
    /// `chunk_size` rows per statement, re-acquiring a scoped connection
    /// between pages so a paged reader never blocks a writer for longer
    /// than a single page fetch.
    pub fn get_entries<'a>(&'a self, chunk_size: usize, filter: EntryFilter) -> EntriesIter<'a> {
        let page_fn: Box<
            dyn FnMut(usize, Option<&EntriesCursor>) -> Result<Vec<(Entry, EntriesCursor)>, Error> + 'a,
        > = Box::new(move |n, cursor: Option<&EntriesCursor>| fetch_page(self, n, &filter, cursor));
        EntriesIter {
            inner: Paginated::new(chunk_size, page_fn),
        }
    }
}

/// Iterator returned by [`Storage::get_entries`].
///
/// Borrows `&'a Storage` for its lifetime — the Rust encoding of "holds a
/// read cursor for the iterator's lifetime" for the `chunk_size == 0` case;
/// for `chunk_size > 0` no connection is held between `next()` calls, only
/// the borrow of `self` used to re-acquire one per page.
pub struct EntriesIter<'a> {
    inner: Paginated<
        Entry,
        EntriesCursor,
        Box<dyn FnMut(usize, Option<&EntriesCursor>) -> Result<Vec<(Entry, EntriesCursor)>, Error> + 'a>,
    >,
}

impl<'a> Iterator for EntriesIter<'a> {
    type Item = Result<Entry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(entry) => Some(Ok(entry)),
            None => self.inner.take_error().map(Err),
        }
    }
}

fn fetch_page(
    storage: &Storage,
    chunk_size: usize,
    filter: &EntryFilter,
    cursor: Option<&EntriesCursor>,
) -> Result<Vec<(Entry, EntriesCursor)>, Error> {
    storage.factory.scoped(|db| {
        let mut conditions = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(read) = filter.read {
            conditions.push("read = ?".to_string());
            values.push(Value::Integer(read as i64));
        }
        if let Some(important) = filter.important {
            conditions.push("important = ?".to_string());
            values.push(Value::Integer(important as i64));
        }
        if let Some(feed_url) = &filter.feed_url {
            conditions.push("feed = ?".to_string());
            values.push(Value::String(feed_url.clone()));
        }
        if let Some(entry_id) = &filter.entry_id {
            conditions.push("id = ?".to_string());
            values.push(Value::String(entry_id.clone()));
        }
        if let Some(has_enclosures) = filter.has_enclosures {
            conditions.push(
                if has_enclosures {
                    "(enclosures IS NOT NULL AND json_array_length(enclosures) > 0)"
                } else {
                    "(enclosures IS NULL OR json_array_length(enclosures) = 0)"
                }
                .to_string(),
            );
        }
        if let Some(cursor) = cursor {
            conditions
                .push("(coalesce(published, updated), feed, id) < (?, ?, ?)".to_string());
            values.push(Value::String(cursor.sort_key.to_string()));
            values.push(Value::String(cursor.feed_url.clone()));
            values.push(Value::String(cursor.entry_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit_clause = if chunk_size > 0 {
            format!(" LIMIT {chunk_size}")
        } else {
            String::new()
        };

        let sql = format!(
            "SELECT id, feed, title, link, updated, published, summary, content,
                    enclosures, read, important, last_updated, first_updated_epoch,
                    feed_order, coalesce(published, updated) AS sort_key
             FROM entries
             {where_clause}
             ORDER BY coalesce(published, updated) DESC, feed DESC, id DESC
             {limit_clause};"
        );

        log::trace!(target: "db", "fetching entries page (chunk_size={chunk_size}, has_cursor={})", cursor.is_some());

        let mut stmt = db.prepare(sql)?;
        for (i, v) in values.into_iter().enumerate() {
            stmt.bind((i + 1, v))?;
        }

        let mut out = Vec::new();
        while let sqlite::State::Row = stmt.next()? {
            let entry = read_entry(&stmt)?;
            let sort_key = parse_dt(&stmt.read::<String, _>("sort_key")?)?;
            let cursor = EntriesCursor {
                sort_key,
                feed_url: stmt.read::<String, _>("feed")?,
                entry_id: entry.id.clone(),
            };
            out.push((entry, cursor));
        }
        Ok(out)
    })
}

fn add_or_update_entry_locked(
    db: &Connection,
    feed_url: &str,
    entry: &Entry,
    last_updated: NaiveDateTime,
    first_updated_epoch: Option<NaiveDateTime>,
    feed_order: i64,
) -> Result<(), Error> {
    if !feed_exists(db, feed_url)? {
        return Err(Error::FeedNotFound { url: feed_url.to_string() });
    }

    let content = serde_json::to_string(&entry.content)
        .map_err(|e| Error::storage_with_cause("malformed entry content", &e))?;
    let enclosures = serde_json::to_string(&entry.enclosures)
        .map_err(|e| Error::storage_with_cause("malformed entry enclosures", &e))?;

    let mut stmt = db.prepare(
        "INSERT INTO entries
            (id, feed, title, link, updated, published, summary, content,
             enclosures, read, important, last_updated, first_updated_epoch, feed_order)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?11, ?12)
         ON CONFLICT (id, feed) DO UPDATE SET
            title = excluded.title,
            link = excluded.link,
            updated = excluded.updated,
            published = excluded.published,
            summary = excluded.summary,
            content = excluded.content,
            enclosures = excluded.enclosures,
            last_updated = excluded.last_updated,
            first_updated_epoch = coalesce(entries.first_updated_epoch, excluded.first_updated_epoch),
            feed_order = excluded.feed_order;",
    )?;

    stmt.bind((1, entry.id.as_str()))?;
    stmt.bind((2, feed_url))?;
    stmt.bind((3, opt_str_value(entry.title.as_deref())))?;
    stmt.bind((4, opt_str_value(entry.link.as_deref())))?;
    stmt.bind((5, entry.updated_at.to_string().as_str()))?;
    stmt.bind((6, opt_dt_value(entry.published_at)))?;
    stmt.bind((7, opt_str_value(entry.summary.as_deref())))?;
    stmt.bind((8, content.as_str()))?;
    stmt.bind((9, enclosures.as_str()))?;
    stmt.bind((10, last_updated.to_string().as_str()))?;
    stmt.bind((11, opt_dt_value(first_updated_epoch)))?;
    stmt.bind((12, feed_order))?;
    stmt.next()?;
    Ok(())
}

fn get_entries_for_update_single(
    db: &Connection,
    pairs: &[(String, String)],
) -> Result<Vec<Option<EntryForUpdate>>, Error> {
    let placeholders: Vec<String> = (0..pairs.len())
        .map(|i| format!("(?{}, ?{})", i * 2 + 1, i * 2 + 2))
        .collect();

    let sql = format!(
        "WITH keys (feed, id) AS (VALUES {})
         SELECT keys.feed AS feed, keys.id AS id, entries.updated AS updated
         FROM keys LEFT JOIN entries ON entries.feed = keys.feed AND entries.id = keys.id;",
        placeholders.join(", ")
    );

    let mut stmt = db.prepare(sql)?;
    for (i, (feed_url, entry_id)) in pairs.iter().enumerate() {
        stmt.bind((i * 2 + 1, feed_url.as_str()))?;
        stmt.bind((i * 2 + 2, entry_id.as_str()))?;
    }

    let mut found: std::collections::HashMap<(String, String), NaiveDateTime> =
        std::collections::HashMap::new();
    while let sqlite::State::Row = stmt.next()? {
        let feed: String = stmt.read::<String, _>("feed")?;
        let id: String = stmt.read::<String, _>("id")?;
        if let Some(updated) = stmt.read::<Option<String>, _>("updated")? {
            found.insert((feed, id), parse_dt(&updated)?);
        }
    }

    Ok(pairs
        .iter()
        .map(|key| found.get(key).map(|&updated_at| EntryForUpdate { updated_at }))
        .collect())
}

fn get_entries_for_update_fallback(
    db: &Connection,
    pairs: &[(String, String)],
) -> Result<Vec<Option<EntryForUpdate>>, Error> {
    let mut out = Vec::with_capacity(pairs.len());
    for (feed_url, entry_id) in pairs {
        let mut stmt = db.prepare("SELECT updated FROM entries WHERE feed = ?1 AND id = ?2;")?;
        stmt.bind((1, feed_url.as_str()))?;
        stmt.bind((2, entry_id.as_str()))?;
        let mut result = None;
        if let sqlite::State::Row = stmt.next()? {
            let updated = stmt.read::<String, _>("updated")?;
            result = Some(EntryForUpdate { updated_at: parse_dt(&updated)? });
        }
        out.push(result);
    }
    Ok(out)
}

fn feed_exists(db: &Connection, url: &str) -> Result<bool, Error> {
    let mut stmt = db.prepare("SELECT 1 FROM feeds WHERE url = ?1;")?;
    stmt.bind((1, url))?;
    Ok(matches!(stmt.next()?, sqlite::State::Row))
}

fn rowcount_exactly_one(db: &Connection, make_err: impl FnOnce() -> Error) -> Result<(), Error> {
    if db.change_count() == 0 {
        return Err(make_err());
    }
    Ok(())
}

fn opt_str_value(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::String(s.to_string()),
        None => Value::Null,
    }
}

fn opt_dt_value(value: Option<NaiveDateTime>) -> Value {
    match value {
        Some(dt) => Value::String(dt.to_string()),
        None => Value::Null,
    }
}

fn parse_dt(s: &str) -> Result<NaiveDateTime, Error> {
    s.parse()
        .map_err(|_| Error::storage(format!("malformed timestamp: {s:?}")))
}

fn parse_opt_dt(s: Option<String>) -> Result<Option<NaiveDateTime>, Error> {
    s.map(|s| parse_dt(&s)).transpose()
}

fn read_feed(stmt: &sqlite::Statement<'_>) -> Result<Feed, Error> {
    Ok(Feed {
        url: stmt.read::<String, _>("url")?,
        title: stmt.read::<Option<String>, _>("title")?,
        link: stmt.read::<Option<String>, _>("link")?,
        updated_at: parse_opt_dt(stmt.read::<Option<String>, _>("updated")?)?,
        user_title: stmt.read::<Option<String>, _>("user_title")?,
        http_etag: stmt.read::<Option<String>, _>("http_etag")?,
        http_last_modified: stmt.read::<Option<String>, _>("http_last_modified")?,
        stale: stmt.read::<i64, _>("stale")? != 0,
        last_updated: parse_opt_dt(stmt.read::<Option<String>, _>("last_updated")?)?,
        added_at: parse_dt(&stmt.read::<String, _>("added")?)?,
    })
}

fn read_entry(stmt: &sqlite::Statement<'_>) -> Result<Entry, Error> {
    let content: Vec<Content> = match stmt.read::<Option<String>, _>("content")? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| Error::storage_with_cause("malformed entry content", &e))?,
        None => Vec::new(),
    };
    let enclosures: Vec<Enclosure> = match stmt.read::<Option<String>, _>("enclosures")? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| Error::storage_with_cause("malformed entry enclosures", &e))?,
        None => Vec::new(),
    };

    Ok(Entry {
        id: stmt.read::<String, _>("id")?,
        title: stmt.read::<Option<String>, _>("title")?,
        link: stmt.read::<Option<String>, _>("link")?,
        updated_at: parse_dt(&stmt.read::<String, _>("updated")?)?,
        published_at: parse_opt_dt(stmt.read::<Option<String>, _>("published")?)?,
        summary: stmt.read::<Option<String>, _>("summary")?,
        content,
        enclosures,
        read: stmt.read::<i64, _>("read")? != 0,
        important: stmt.read::<i64, _>("important")? != 0,
        last_updated: parse_dt(&stmt.read::<String, _>("last_updated")?)?,
        first_updated_epoch: parse_opt_dt(stmt.read::<Option<String>, _>("first_updated_epoch")?)?,
        feed_order: stmt.read::<i64, _>("feed_order")?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn open() -> Storage {
        Storage::open(":memory:", OpenParams::default()).unwrap()
    }

    fn now() -> NaiveDateTime {
        "2024-01-01 00:00:00".parse().unwrap()
    }

    fn entry(id: &str) -> Entry {
        Entry {
            id: id.to_string(),
            title: Some("title".into()),
            link: None,
            updated_at: now(),
            published_at: Some(now()),
            summary: None,
            content: Vec::new(),
            enclosures: Vec::new(),
            read: false,
            important: false,
            last_updated: now(),
            first_updated_epoch: Some(now()),
            feed_order: 0,
        }
    }

    #[test]
    fn add_feed_and_get_feeds_round_trips() {
        let storage = open();
        storage.add_feed("https://example.com/feed", now()).unwrap();
        let feeds = storage.get_feeds().unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].url, "https://example.com/feed");
        assert!(!feeds[0].stale);
    }

    #[test]
    fn remove_missing_feed_is_not_found() {
        let storage = open();
        let err = storage.remove_feed("missing").unwrap_err();
        assert!(matches!(err, Error::FeedNotFound { .. }));
    }

    #[test]
    fn add_or_update_entry_requires_existing_feed() {
        let storage = open();
        let err = storage
            .add_or_update_entry("missing", &entry("e1"), now(), None, 0)
            .unwrap_err();
        assert!(matches!(err, Error::FeedNotFound { .. }));
    }

    #[test]
    fn re_adding_entry_preserves_read_and_important_flags() {
        let storage = open();
        storage.add_feed("f", now()).unwrap();
        storage.add_or_update_entry("f", &entry("e1"), now(), None, 0).unwrap();
        storage.mark_as_read_unread("f", "e1", true).unwrap();
        storage.mark_as_important_unimportant("f", "e1", true).unwrap();

        storage.add_or_update_entry("f", &entry("e1"), now(), None, 0).unwrap();

        let rows = storage
            .get_entries(0, EntryFilter::default())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].read);
        assert!(rows[0].important);
    }

    #[test]
    fn first_updated_epoch_is_preserved_across_updates() {
        let storage = open();
        storage.add_feed("f", now()).unwrap();
        let first_epoch: NaiveDateTime = "2020-01-01 00:00:00".parse().unwrap();
        storage
            .add_or_update_entry("f", &entry("e1"), now(), Some(first_epoch), 0)
            .unwrap();

        let later_epoch: NaiveDateTime = "2030-01-01 00:00:00".parse().unwrap();
        storage
            .add_or_update_entry("f", &entry("e1"), now(), Some(later_epoch), 0)
            .unwrap();

        let rows = storage
            .get_entries(0, EntryFilter::default())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(rows[0].first_updated_epoch, Some(first_epoch));
    }

    #[test]
    fn get_entries_for_update_reports_missing_and_found() {
        let storage = open();
        storage.add_feed("f", now()).unwrap();
        storage.add_or_update_entry("f", &entry("e1"), now(), None, 0).unwrap();

        let results = storage
            .get_entries_for_update(&[("f".into(), "e1".into()), ("f".into(), "missing".into())])
            .unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[test]
    fn get_entries_for_update_empty_input_returns_empty() {
        let storage = open();
        assert_eq!(storage.get_entries_for_update(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn feed_metadata_round_trips_and_rejects_missing_feed() {
        let storage = open();
        let err = storage
            .set_feed_metadata("missing", "k", &Json::Bool(true))
            .unwrap_err();
        assert!(matches!(err, Error::FeedNotFound { .. }));

        storage.add_feed("f", now()).unwrap();
        storage.set_feed_metadata("f", "k", &Json::String("v".into())).unwrap();
        let values = storage.iter_feed_metadata("f", None).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, Json::String("v".into()));

        storage.delete_feed_metadata("f", "k").unwrap();
        let err = storage.delete_feed_metadata("f", "k").unwrap_err();
        assert!(matches!(err, Error::MetadataNotFound { .. }));
    }

    #[test]
    fn chunked_iteration_matches_unchunked() {
        let storage = open();
        storage.add_feed("f", now()).unwrap();
        for i in 0..5 {
            storage
                .add_or_update_entry("f", &entry(&format!("e{i}")), now(), None, i)
                .unwrap();
        }

        let unchunked: Vec<_> = storage
            .get_entries(0, EntryFilter::default())
            .collect::<Result<_, _>>()
            .unwrap();
        let chunked: Vec<_> = storage
            .get_entries(2, EntryFilter::default())
            .collect::<Result<_, _>>()
            .unwrap();

        let unchunked_ids: Vec<_> = unchunked.iter().map(|e| &e.id).collect();
        let chunked_ids: Vec<_> = chunked.iter().map(|e| &e.id).collect();
        assert_eq!(unchunked_ids, chunked_ids);
        assert_eq!(unchunked.len(), 5);
    }
}
