//! Structured error taxonomy for the storage engine.
//!
//! Every public operation returns [`Error`]. Engine-level faults are wrapped
//! at the storage boundary (see [`Error::from_sqlite`]) rather than
//! propagated as raw `sqlite::Error` values, so callers never need to
//! depend on the `sqlite` crate themselves.

use std::any::type_name;
use std::fmt;

use thiserror::Error as DeriveError;

/// A captured snapshot of a source error: its type name and rendered
/// message, taken eagerly at the point the error is wrapped.
///
/// Capturing eagerly (instead of keeping a `Box<dyn Error>`) means the cause
/// survives being logged, sent across a thread boundary, or held past the
/// lifetime of whatever produced the original error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cause {
    type_name: &'static str,
    message: String,
}

impl Cause {
    pub fn capture<E: std::error::Error>(err: &E) -> Self {
        Self {
            type_name: type_name::<E>(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Renders the `": <cause>"` suffix shared by every variant that carries
/// one, or an empty string for variants that don't.
fn cause_suffix(cause: &Option<Cause>) -> String {
    cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default()
}

/// The storage engine's error taxonomy.
///
/// Display follows `"<display-name>: <message>[: <cause>]"`, mirroring the
/// cause-chaining string contract this crate's operations commit to.
#[derive(Debug, Clone, DeriveError)]
pub enum Error {
    /// Wraps engine-level faults: disk errors, locked database, corrupt
    /// file, closed connection.
    #[error("storage error: {message}{}", cause_suffix(cause))]
    Storage { message: String, cause: Option<Cause> },
    /// Stored schema version is newer than this build supports, or there is
    /// a gap in the migration chain.
    #[error("schema version error: {0}")]
    SchemaVersion(String),
    /// A foreign-key violation was found after a migration ran.
    #[error("integrity error: {0}")]
    Integrity(String),
    /// The linked SQLite build is missing a required version or function.
    #[error("database requirement error: {0}")]
    Requirement(String),
    /// `application_id` stamp mismatch.
    #[error("application id error: {0}")]
    Id(String),
    /// A feed referenced by an operation does not exist.
    #[error("feed not found: no feed with url {url:?}")]
    FeedNotFound { url: String },
    /// An entry referenced by an operation does not exist.
    #[error("entry not found: no entry with id {entry_id:?} in feed {feed_url:?}")]
    EntryNotFound { feed_url: String, entry_id: String },
    /// A feed-metadata key referenced by an operation does not exist.
    #[error("feed metadata not found: no metadata {key:?} for feed {feed_url:?}")]
    MetadataNotFound { feed_url: String, key: String },
    /// Misuse of the connection factory (cross-thread access, double close,
    /// reentrant scope, private-database access from a non-creating
    /// thread).
    #[error("usage error: {0}")]
    Usage(String),
    /// A SQLite result code indicating a bug in this crate's own SQL
    /// construction (misuse of the API, an internal driver fault) rather
    /// than a legitimate runtime storage condition such as a lock or
    /// corruption. Kept distinct from [`Error::Storage`] instead of being
    /// laundered into it.
    #[error("engine error: {message}{}", cause_suffix(cause))]
    Internal { message: String, cause: Option<Cause> },
}

/// Primary SQLite result codes that indicate a bug in this crate's own SQL
/// construction rather than a legitimate runtime storage condition. See
/// <https://www.sqlite.org/rescode.html>; extended codes encode the primary
/// code in their low byte, so masking handles both forms.
const SQLITE_INTERNAL: isize = 2;
const SQLITE_MISUSE: isize = 21;

impl Error {
    /// Build an [`Error`] from a raw SQLite error, applying the
    /// reclassification rules of the error handling design:
    ///
    /// - `"cannot operate on a closed database"` becomes a short,
    ///   user-actionable [`Error::Storage`] rather than the raw driver text.
    /// - `"file is not a database"` is treated the same way (corruption is
    ///   user-actionable, not a bug in this crate).
    /// - `SQLITE_MISUSE`/`SQLITE_INTERNAL` result codes become
    ///   [`Error::Internal`] instead: they indicate a bug in this crate's
    ///   own SQL, not a locked/corrupt/busy database, so they are not
    ///   laundered into the same variant as those.
    /// - anything else is a legitimate runtime storage condition: keeps the
    ///   original message and records the cause in [`Error::Storage`].
    pub fn from_sqlite(err: sqlite::Error) -> Self {
        let lower = err.message.as_deref().unwrap_or_default().to_lowercase();
        if lower.contains("cannot operate on a closed database") {
            return Error::Storage {
                message: "operation on closed database".into(),
                cause: None,
            };
        }
        if lower.contains("file is not a database") {
            return Error::Storage {
                message: "database is corrupt".into(),
                cause: Some(Cause::capture(&err)),
            };
        }

        let primary_code = err.code.map(|code| code & 0xff);
        if matches!(primary_code, Some(SQLITE_INTERNAL) | Some(SQLITE_MISUSE)) {
            return Error::Internal {
                message: "engine misuse".into(),
                cause: Some(Cause::capture(&err)),
            };
        }

        Error::Storage {
            message: "unexpected error".into(),
            cause: Some(Cause::capture(&err)),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            cause: None,
        }
    }

    pub fn storage_with_cause<E: std::error::Error>(message: impl Into<String>, cause: &E) -> Self {
        Error::Storage {
            message: message.into(),
            cause: Some(Cause::capture(cause)),
        }
    }
}

impl From<sqlite::Error> for Error {
    fn from(err: sqlite::Error) -> Self {
        Error::from_sqlite(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_without_cause() {
        let err = Error::FeedNotFound { url: "u".into() };
        assert_eq!(err.to_string(), "feed not found: no feed with url \"u\"");
    }

    #[test]
    fn display_with_cause() {
        let sqlite_err = sqlite::Error {
            code: Some(5),
            message: Some("database is locked".into()),
        };
        let err = Error::from_sqlite(sqlite_err);
        let rendered = err.to_string();
        assert!(rendered.starts_with("storage error: unexpected error: sqlite::Error:"));
        assert!(rendered.contains("database is locked"));
    }

    #[test]
    fn closed_database_is_reclassified() {
        let sqlite_err = sqlite::Error {
            code: None,
            message: Some("cannot operate on a closed database".into()),
        };
        let err = Error::from_sqlite(sqlite_err);
        assert_eq!(err.to_string(), "storage error: operation on closed database");
    }

    #[test]
    fn misuse_code_is_kept_distinct_from_storage() {
        let sqlite_err = sqlite::Error {
            code: Some(21), // SQLITE_MISUSE
            message: Some("bad parameter or other API misuse".into()),
        };
        let err = Error::from_sqlite(sqlite_err);
        assert!(matches!(err, Error::Internal { .. }));
        assert!(err.to_string().starts_with("engine error: engine misuse:"));
    }

    #[test]
    fn internal_code_is_kept_distinct_from_storage() {
        let sqlite_err = sqlite::Error {
            code: Some(2), // SQLITE_INTERNAL
            message: Some("internal logic error".into()),
        };
        let err = Error::from_sqlite(sqlite_err);
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[test]
    fn extended_misuse_code_is_masked_to_primary() {
        // Extended codes encode the primary code in the low byte.
        let sqlite_err = sqlite::Error {
            code: Some(21 | (1 << 8)),
            message: Some("bad parameter or other API misuse".into()),
        };
        let err = Error::from_sqlite(sqlite_err);
        assert!(matches!(err, Error::Internal { .. }));
    }
}
