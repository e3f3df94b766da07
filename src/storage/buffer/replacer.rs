use crate::storage::page::PageId;
use std::fmt::Debug;

/// Chooses which cached page gives up its frame when the pool is full.
///
/// The pool reports every access and flips pages between evictable (pin count 0) and
/// pinned. Only evictable pages may be returned by `evict`.
pub trait Replacer: Send + Sync + Debug {
    /// Record that `page_id` was just accessed.
    fn record_access(&mut self, page_id: PageId);

    /// Mark a page as evictable or pinned.
    fn set_evictable(&mut self, page_id: PageId, evictable: bool);

    /// Select and forget a victim. Returns None if no page can be evicted.
    fn evict(&mut self) -> Option<PageId>;

    /// Forget a page entirely, e.g. after it was deleted.
    fn remove(&mut self, page_id: PageId);

    /// Number of evictable pages.
    fn size(&self) -> usize;
}
