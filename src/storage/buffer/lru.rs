use super::replacer::Replacer;
use crate::storage::page::PageId;
use std::collections::{HashSet, VecDeque};

/// Least-recently-used replacement among evictable pages.
#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Every tracked page, least recently used at the front.
    order: VecDeque<PageId>,
    evictable: HashSet<PageId>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            evictable: HashSet::with_capacity(capacity),
        }
    }

    fn detach(&mut self, page_id: PageId) {
        if let Some(pos) = self.order.iter().position(|&id| id == page_id) {
            self.order.remove(pos);
        }
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, page_id: PageId) {
        self.detach(page_id);
        self.order.push_back(page_id);
    }

    fn set_evictable(&mut self, page_id: PageId, evictable: bool) {
        if evictable {
            if !self.order.contains(&page_id) {
                self.order.push_back(page_id);
            }
            self.evictable.insert(page_id);
        } else {
            self.evictable.remove(&page_id);
        }
    }

    fn evict(&mut self) -> Option<PageId> {
        let pos = self
            .order
            .iter()
            .position(|id| self.evictable.contains(id))?;
        let victim = self.order.remove(pos)?;
        self.evictable.remove(&victim);
        Some(victim)
    }

    fn remove(&mut self, page_id: PageId) {
        self.detach(page_id);
        self.evictable.remove(&page_id);
    }

    fn size(&self) -> usize {
        self.evictable.len()
    }
}
