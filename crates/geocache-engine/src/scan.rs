//! Lazy, restartable scan over the entries of one term type.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use geocache_core::{CacheBackend, IndexEntry, Result};

/// Cursor over every index entry with a given term type, ordered by term.
///
/// Entries are fetched a page at a time using the last term seen as the
/// key, so a scan never holds a lock or transaction between pages. Writes
/// that land between pages are seen or not depending on where they sort
/// relative to the cursor.
pub struct TermScan {
    backend: Arc<dyn CacheBackend>,
    term_type: String,
    page_size: usize,
    buffer: VecDeque<IndexEntry>,
    cursor: Option<String>,
    exhausted: bool,
}

impl TermScan {
    pub(crate) fn new(backend: Arc<dyn CacheBackend>, term_type: String, page_size: usize) -> Self {
        Self {
            backend,
            term_type,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    /// Term type being scanned.
    pub fn term_type(&self) -> &str {
        &self.term_type
    }

    /// Next entry, or `None` once the scan is complete.
    pub async fn next(&mut self) -> Result<Option<IndexEntry>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Start again from the first term.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.cursor = None;
        self.exhausted = false;
    }

    /// Drain the rest of the scan into a vector.
    pub async fn collect_remaining(&mut self) -> Result<Vec<IndexEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }

    async fn fill(&mut self) -> Result<()> {
        let page = self
            .backend
            .scan_term_type(&self.term_type, self.cursor.as_deref(), self.page_size)
            .await?;

        debug!(
            "Fetched {} {:?} entries after {:?}",
            page.len(),
            self.term_type,
            self.cursor
        );

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.term.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}
