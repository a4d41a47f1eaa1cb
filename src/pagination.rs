//! Cursor-based iteration over large result sets without holding a long
//! transaction open.
//!
//! Ported from `join_paginated_iter` in `_utils.py`: repeatedly calls a
//! `page_fn` that fetches at most `chunk_size` rows starting after the last
//! cursor, stopping once a page comes back short. `chunk_size == 0`
//! delegates to a single unbounded call instead of chunking.

use std::collections::VecDeque;

use crate::error::Error;

/// Sourced by [`Paginated::new`]: fetch one page of up to `chunk_size` rows
/// after `cursor` (`None` for the first page).
pub trait PageSource<T, C> {
    fn page(&mut self, chunk_size: usize, cursor: Option<&C>) -> Result<Vec<(T, C)>, Error>;
}

impl<T, C, F> PageSource<T, C> for F
where
    F: FnMut(usize, Option<&C>) -> Result<Vec<(T, C)>, Error>,
{
    fn page(&mut self, chunk_size: usize, cursor: Option<&C>) -> Result<Vec<(T, C)>, Error> {
        self(chunk_size, cursor)
    }
}

/// Flattens a paged source into a single lazy sequence of items.
///
/// `next()` calls `page_fn` at most once per page boundary and always in
/// the thread that drives the iterator — there is no hidden background
/// fetch, which is what lets paged [`crate::storage::Storage::get_entries`]
/// release its connection between pages (see the crate's concurrency
/// notes).
pub struct Paginated<T, C, S> {
    chunk_size: usize,
    last_cursor: Option<C>,
    buffer: VecDeque<T>,
    exhausted: bool,
    page_fn: S,
    error: Option<Error>,
}

impl<T, C, S> Paginated<T, C, S>
where
    S: PageSource<T, C>,
{
    pub fn new(chunk_size: usize, page_fn: S) -> Self {
        Self {
            chunk_size,
            last_cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            page_fn,
            error: None,
        }
    }

    /// Take a previously stored error, if `next()` has already surfaced one.
    /// After an error, the iterator always returns `None`.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    fn refill(&mut self) {
        if self.exhausted || self.error.is_some() {
            return;
        }

        match self.page_fn.page(self.chunk_size, self.last_cursor.as_ref()) {
            Ok(rows) => {
                if self.chunk_size == 0 {
                    self.buffer.extend(rows.into_iter().map(|(item, _)| item));
                    self.exhausted = true;
                    return;
                }

                let short_page = rows.len() < self.chunk_size;
                if let Some((_, cursor)) = rows.last() {
                    self.last_cursor = Some(clone_cursor(cursor));
                }
                self.buffer.extend(rows.into_iter().map(|(item, _)| item));
                if short_page {
                    self.exhausted = true;
                }
            }
            Err(err) => {
                self.error = Some(err);
                self.exhausted = true;
            }
        }
    }
}

// `C` (the cursor type) is always owned plain data in this crate
// (`EntriesCursor` etc.), so a manual clone-via-move-and-rebuild would be
// wasteful; require `Clone` instead.
fn clone_cursor<C: Clone>(c: &C) -> C {
    c.clone()
}

impl<T, C, S> Iterator for Paginated<T, C, S>
where
    S: PageSource<T, C>,
    C: Clone,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill();
        }
        self.buffer.pop_front()
    }
}

/// Wraps `page_fn` so that, when fetches are multiplexed through a worker
/// pool, callers have an explicit seam to hang the "call `page_fn` in the
/// worker's own thread" guarantee on.
///
/// In Python, `multiprocessing.dummy.Pool.imap_unordered` hands the
/// generator to a pool-internal thread, which then calls `next()` (and
/// therefore `page_fn`) on a thread that never created the underlying
/// SQLite connection — `wrap_map` patches around that by pre-seeding a
/// queue from the calling thread. Rust iterators always advance on whatever
/// thread calls `next()`, so there is no equivalent bug to patch around;
/// this function exists purely so worker-pool code has a named place to
/// call `page_fn`, rather than inlining the call and risking it migrating
/// onto a pool thread during a future refactor.
pub fn dispatch_in_thread<T, C>(
    mut page_fn: impl FnMut(usize, Option<&C>) -> Result<Vec<(T, C)>, Error>,
    chunk_size: usize,
    cursor: Option<&C>,
) -> Result<Vec<(T, C)>, Error> {
    page_fn(chunk_size, cursor)
}
