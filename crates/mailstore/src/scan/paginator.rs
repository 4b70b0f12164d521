//! Cursor-driven pagination shared by every scan
//!
//! Each page is requested with an exclusive cursor (`key > cursor`) set to
//! the key of the last row of the previous page. A page shorter than its
//! requested size is the last one. When the rows end exactly on a page
//! boundary one more (empty) page is fetched before the scan concludes.

use log::debug;

use crate::error::Result;
use crate::models::Limit;

type FetchPage<'a, T, C> = Box<dyn FnMut(Option<C>, usize) -> Result<Vec<T>> + 'a>;

/// A lazy, finite sequence of rows fetched page by page
///
/// Iterating yields `Result<T>`: a failed page fetch is yielded once and ends
/// the sequence.
pub struct Paginated<'a, T, C> {
    fetch: FetchPage<'a, T, C>,
    key: fn(&T) -> C,
    batch_size: usize,
    /// Rows the caller still wants, `None` when unlimited
    remaining: Option<usize>,
    cursor: Option<C>,
    buffer: std::vec::IntoIter<T>,
    finished: bool,
    pages_fetched: usize,
}

impl<'a, T, C: Copy> Paginated<'a, T, C> {
    /// - `batch_size`: rows per page
    /// - `limit`: total rows to yield
    /// - `key`: ordering key of a row, used as the next cursor
    /// - `fetch`: reads at most `n` rows whose key is after the cursor
    pub fn new(
        batch_size: usize,
        limit: Limit,
        key: fn(&T) -> C,
        fetch: impl FnMut(Option<C>, usize) -> Result<Vec<T>> + 'a,
    ) -> Self {
        let remaining = limit.as_option();
        Self {
            fetch: Box::new(fetch),
            key,
            batch_size: batch_size.max(1),
            remaining,
            cursor: None,
            buffer: Vec::new().into_iter(),
            finished: remaining == Some(0),
            pages_fetched: 0,
        }
    }

    /// Number of round trips made so far
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Fetch the next page, bypassing the row buffer
    ///
    /// Returns `None` once the scan is complete.
    pub fn next_page(&mut self) -> Option<Result<Vec<T>>> {
        if self.finished {
            return None;
        }

        let page_size = match self.remaining {
            Some(remaining) => remaining.min(self.batch_size),
            None => self.batch_size,
        };

        let mut rows = match (self.fetch)(self.cursor, page_size) {
            Ok(rows) => rows,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        self.pages_fetched += 1;
        rows.truncate(page_size);

        debug!(
            "[SCAN] Page {} returned {} of {} requested rows",
            self.pages_fetched,
            rows.len(),
            page_size
        );

        if rows.len() < page_size {
            self.finished = true;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= rows.len();
            if *remaining == 0 {
                self.finished = true;
            }
        }
        if let Some(last) = rows.last() {
            self.cursor = Some((self.key)(last));
        }

        Some(Ok(rows))
    }

    /// Fetch the first page now if nothing was fetched yet
    pub fn prime(&mut self) -> Result<()> {
        if self.pages_fetched == 0 {
            if let Some(page) = self.next_page() {
                self.buffer = page?.into_iter();
            }
        }
        Ok(())
    }

    /// Rows fetched but not yet yielded
    pub fn buffered(&self) -> &[T] {
        self.buffer.as_slice()
    }
}

impl<T, C: Copy> Iterator for Paginated<'_, T, C> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffer.next() {
                return Some(Ok(row));
            }
            match self.next_page()? {
                Ok(rows) => self.buffer = rows.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
