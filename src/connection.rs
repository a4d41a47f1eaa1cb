//! Per-thread connection lifecycle.
//!
//! SQLite connection handles are not thread-safe: an object created on one
//! thread may only be used from that thread. [`ConnectionFactory`] enforces
//! a "one connection per thread" discipline that is otherwise easy to get
//! wrong, while keeping the common case — one creator thread, short-lived
//! worker scopes — ergonomic.
//!
//! Ported from the Python `LocalConnectionFactory` (`_sqlite_utils.py`),
//! reworked around Rust's `thread_local!` instead of `contextvars.ContextVar`
//! since a `ContextVar` is itself a per-factory dynamic slot: here each
//! factory is given a unique id and the thread-local storage is a map keyed
//! by that id, so multiple factories can coexist without colliding.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use sqlite::{Connection, OpenFlags};

use crate::error::Error;

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCAL: RefCell<HashMap<u64, Connection>> = RefCell::new(HashMap::new());
    /// Tracks whether the current thread is inside a non-reentrant scoped
    /// acquisition, per factory id.
    static SCOPED: RefCell<HashMap<u64, bool>> = RefCell::new(HashMap::new());
}

/// Does `connect(path)` from another thread address a distinct database?
///
/// With `uri=false` (the only mode this crate opens connections in), only
/// `":memory:"` and `""` are private.
fn is_private(path: &str) -> bool {
    path == ":memory:" || path.is_empty()
}

fn open_raw(path: &str, flags: Option<OpenFlags>) -> Result<Connection, Error> {
    let db = match flags {
        Some(flags) => Connection::open_with_flags(path, flags)?,
        None => Connection::open(path)?,
    };
    Ok(db)
}

/// Maintains one connection per thread to the same database path.
///
/// * The creating thread may call [`ConnectionFactory::get`] directly, use
///   [`ConnectionFactory::scoped`], or [`ConnectionFactory::close`].
/// * Any other thread must use [`ConnectionFactory::scoped`]; [`get`] and
///   [`close`] fail with [`Error::Usage`] from a non-creating thread.
/// * [`scoped`] is not reentrant.
/// * Private databases (`""`/`":memory:"`) reject acquisition from any
///   thread other than the creator, since each thread would otherwise see
///   an isolated database.
pub struct ConnectionFactory {
    id: u64,
    path: String,
    flags: Option<OpenFlags>,
    private: bool,
    creator: ThreadId,
    /// Run once against every newly-opened connection (creator's initial
    /// connection and every worker's scoped connection alike), to apply
    /// per-connection pragmas such as `busy_timeout` and `foreign_keys`.
    on_open: Box<dyn Fn(&Connection) -> Result<(), Error> + Send + Sync>,
    before_close: Box<dyn Fn(&Connection) + Send + Sync>,
}

impl ConnectionFactory {
    pub fn new(path: impl AsRef<Path>, flags: Option<OpenFlags>) -> Result<Self, Error> {
        Self::with_hooks(path, flags, |_| Ok(()), |_| {})
    }

    pub fn with_hooks(
        path: impl AsRef<Path>,
        flags: Option<OpenFlags>,
        on_open: impl Fn(&Connection) -> Result<(), Error> + Send + Sync + 'static,
        before_close: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let factory = Self {
            id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
            private: is_private(&path),
            path,
            flags,
            creator: thread::current().id(),
            on_open: Box::new(on_open),
            before_close: Box::new(before_close),
        };
        // Eagerly open the creating thread's connection, mirroring
        // `self._main = self.__enter__()` in the Python implementation.
        factory.ensure_local()?;
        Ok(factory)
    }

    fn ensure_local(&self) -> Result<(), Error> {
        LOCAL.with(|local| -> Result<(), Error> {
            let mut local = local.borrow_mut();
            if !local.contains_key(&self.id) {
                let conn = open_raw(&self.path, self.flags)?;
                (self.on_open)(&conn)?;
                local.insert(self.id, conn);
            }
            Ok(())
        })
    }

    fn has_local(&self) -> bool {
        LOCAL.with(|local| local.borrow().contains_key(&self.id))
    }

    fn is_creator(&self) -> bool {
        thread::current().id() == self.creator
    }

    /// Run `f` with the current thread's connection, requiring that it was
    /// either opened by this thread as the creator, or acquired via
    /// [`scoped`] earlier in the current scope.
    ///
    /// From the creating thread, this works unconditionally. From any other
    /// thread, calling this outside of [`scoped`] fails with
    /// [`Error::Usage`].
    pub fn get<T>(&self, f: impl FnOnce(&Connection) -> Result<T, Error>) -> Result<T, Error> {
        if !self.is_creator() && !self.has_local() {
            return Err(Error::Usage(
                "must be used as a scoped acquisition when using from threads \
                 other than the creating thread"
                    .into(),
            ));
        }
        if self.is_creator() {
            self.ensure_local()?;
        }
        if self.private && !self.is_creator() {
            return Err(Error::Usage(
                "cannot use a private database from threads other than the creating thread"
                    .into(),
            ));
        }
        LOCAL.with(|local| {
            let local = local.borrow();
            let conn = local.get(&self.id).expect("connection present");
            f(conn)
        })
    }

    /// Acquire a connection for the duration of `f`, opening one for the
    /// current thread if necessary and guaranteeing release on every exit
    /// path (including panics unwinding through `f`).
    ///
    /// Not reentrant: calling `scoped` again from within `f` on the same
    /// thread panics, matching the Python implementation's non-reentrant
    /// context manager.
    pub fn scoped<T>(&self, f: impl FnOnce(&Connection) -> Result<T, Error>) -> Result<T, Error> {
        if self.private && !self.is_creator() {
            return Err(Error::Usage(
                "cannot use a private database from threads other than the creating thread"
                    .into(),
            ));
        }

        let already_scoped = SCOPED.with(|s| *s.borrow().get(&self.id).unwrap_or(&false));
        assert!(!already_scoped, "scoped acquisition is not reentrant");
        SCOPED.with(|s| s.borrow_mut().insert(self.id, true));

        // Resets the `SCOPED` flag and, for worker threads, releases the
        // connection on every exit path out of this function — normal
        // return, early `?` return, or a panic unwinding through `f`. The
        // creating thread keeps its connection open across scopes, matching
        // the "one long-lived connection, many short worker scopes" usage
        // pattern.
        struct ScopeGuard<'a>(&'a ConnectionFactory);

        impl Drop for ScopeGuard<'_> {
            fn drop(&mut self) {
                SCOPED.with(|s| s.borrow_mut().insert(self.0.id, false));
                if !self.0.is_creator() {
                    self.0.close_local();
                }
            }
        }

        let _guard = ScopeGuard(self);

        self.ensure_local()?;
        self.get(f)
    }

    fn close_local(&self) {
        LOCAL.with(|local| {
            if let Some(conn) = local.borrow_mut().remove(&self.id) {
                self.run_before_close(&conn);
            }
        });
    }

    fn run_before_close(&self, conn: &Connection) {
        // `before_close` hooks may legitimately observe a connection that
        // was already implicitly closed (e.g. via `VACUUM INTO` on some
        // driver versions); treat that as a no-op rather than propagating.
        (self.before_close)(conn);
    }

    /// Close the creating thread's connection. Fails with [`Error::Usage`]
    /// from any other thread — those must rely on [`scoped`] releasing
    /// their connection automatically.
    pub fn close(&self) -> Result<(), Error> {
        if !self.is_creator() {
            return Err(Error::Usage(
                "cannot close() from threads other than the creating thread, \
                 use scoped acquisition instead"
                    .into(),
            ));
        }
        self.close_local();
        Ok(())
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        if self.is_creator() {
            self.close_local();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn creator_can_get_directly() {
        let factory = ConnectionFactory::new(":memory:", None).unwrap();
        factory.get(|db| {
            db.execute("CREATE TABLE t (a);")?;
            Ok(())
        }).unwrap();
    }

    #[test]
    fn non_creator_must_use_scoped_acquisition() {
        let factory = ConnectionFactory::new("", None).unwrap();
        let handle = thread::spawn(move || factory.get(|_| Ok(())));
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn non_creator_scoped_rejected_for_private_database() {
        let factory = ConnectionFactory::new(":memory:", None).unwrap();
        let handle = thread::spawn(move || factory.scoped(|_| Ok(())));
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn scoped_works_on_shared_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");
        let factory = ConnectionFactory::new(&path, None).unwrap();
        factory
            .get(|db| {
                db.execute("CREATE TABLE t (a);")?;
                Ok(())
            })
            .unwrap();

        let path2 = path.clone();
        let handle = thread::spawn(move || {
            let factory = ConnectionFactory::new(&path2, None).unwrap();
            factory.scoped(|db| {
                db.execute("INSERT INTO t VALUES (1);")?;
                Ok(())
            })
        });
        handle.join().unwrap().unwrap();
    }
}
