use parking_lot::Mutex;
use triomphe::Arc;

use crate::{
    error::{error_corruption, io_invalid_data, Error},
    options::CacheOptions,
    page::Page,
    repr::PageId,
};

/// Owns and arbitrates the pages of a tree.
///
/// The cache tracks a pin count per page; pinned pages cannot be evicted.
/// Searches request pages with [PageCache::page_in] and release them by
/// dropping the returned [PinnedPage] guard, so every exit path unpins.
#[derive(Debug, Default)]
pub struct PageCache {
    opts: CacheOptions,
    table: Mutex<hashbrown::HashMap<PageId, CacheEntry>>,
}

#[derive(Debug)]
struct CacheEntry {
    page: Arc<Page>,
    pins: u32,
    evicting: bool,
    #[cfg(any(fuzzing, test))]
    inject_restarts: u32,
}

impl CacheEntry {
    fn new(page: Arc<Page>) -> Self {
        Self {
            page,
            pins: 0,
            evicting: false,
            #[cfg(any(fuzzing, test))]
            inject_restarts: 0,
        }
    }
}

/// Outcome of a page request that didn't fail.
pub enum PageIn {
    /// The pinned page.
    Page(PinnedPage),
    /// A concurrent structural change invalidated the request; the search
    /// must retry from the root.
    Restart,
}

impl PageCache {
    /// New cache with default options.
    pub fn new() -> Arc<Self> {
        Self::with_options(CacheOptions::default())
    }

    /// New cache with the given options.
    pub fn with_options(opts: CacheOptions) -> Arc<Self> {
        Arc::new(Self {
            opts,
            table: Mutex::default(),
        })
    }

    /// Adds a page to the cache. Replacing a present page is an error, the
    /// old image must be evicted first.
    pub fn insert(&self, page: Page) -> Result<(), Error> {
        let pid = page.id();
        trace!("insert page {pid} span {}", page.span());
        let mut table = self.table.lock();
        if table.contains_key(&pid) {
            return Err(io_invalid_data!("Page {pid} is already present"));
        }
        table.insert(pid, CacheEntry::new(Arc::new(page)));
        Ok(())
    }

    /// Pins a page that is expected to be resident, regardless of eviction
    /// state. Used for the root, which stays pinned for the lifetime of a
    /// [crate::Tree].
    pub fn pin(this: &Arc<Self>, pid: PageId) -> Result<PinnedPage, Error> {
        let mut table = this.table.lock();
        let entry = table
            .get_mut(&pid)
            .ok_or_else(|| io_invalid_data!("Page {pid} is not resident"))?;
        entry.pins += 1;
        Ok(PinnedPage {
            cache: this.clone(),
            page: entry.page.clone(),
        })
    }

    /// Requests the child page at `pid` during a descent.
    ///
    /// Returns [PageIn::Restart] when the page is being concurrently
    /// evicted/rewritten; the descent retries from the root. `span` is the
    /// size recorded in the parent's child reference and must match the
    /// resident image.
    pub fn page_in(this: &Arc<Self>, pid: PageId, span: PageId) -> Result<PageIn, Error> {
        fail::fail_point!("page_in", |_| Ok(PageIn::Restart));
        let mut table = this.table.lock();
        let entry = table
            .get_mut(&pid)
            .ok_or_else(|| io_invalid_data!("Page {pid} is not resident"))?;
        #[cfg(any(fuzzing, test))]
        if entry.inject_restarts > 0 {
            entry.inject_restarts -= 1;
            trace!("page_in {pid} injected restart");
            return Ok(PageIn::Restart);
        }
        if entry.evicting {
            trace!("page_in {pid} racing eviction, restart");
            return Ok(PageIn::Restart);
        }
        if entry.page.span() != span {
            return Err(error_corruption!(
                "Page {pid} span {} doesn't match the parent reference {span}",
                entry.page.span()
            ));
        }
        if this.opts.verify_checksums && entry.page.check_checksum() == Some(false) {
            return Err(error_corruption!("Page {pid} failed checksum verification"));
        }
        entry.pins += 1;
        trace!("page_in {pid} pins {}", entry.pins);
        Ok(PageIn::Page(PinnedPage {
            cache: this.clone(),
            page: entry.page.clone(),
        }))
    }

    fn page_out(&self, pid: PageId) {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(&pid) else {
            debug_assert!(false, "page_out of non-resident page {pid}");
            return;
        };
        debug_assert_ne!(entry.pins, 0);
        entry.pins -= 1;
        trace!("page_out {pid} pins {}", entry.pins);
    }

    /// Marks a page as being evicted. While set, requests for the page
    /// report [PageIn::Restart]. Refused if the page is pinned.
    pub fn begin_evict(&self, pid: PageId) -> bool {
        let mut table = self.table.lock();
        match table.get_mut(&pid) {
            Some(entry) if entry.pins == 0 && !entry.evicting => {
                trace!("begin_evict {pid}");
                entry.evicting = true;
                true
            }
            _ => false,
        }
    }

    /// Completes an eviction started with [PageCache::begin_evict],
    /// removing the old image and installing `replacement` if the page was
    /// rewritten rather than dropped.
    pub fn finish_evict(&self, pid: PageId, replacement: Option<Page>) {
        let mut table = self.table.lock();
        let removed = table.remove(&pid);
        debug_assert!(removed.is_some_and(|e| e.evicting));
        trace!("finish_evict {pid}");
        if let Some(page) = replacement {
            table.insert(page.id(), CacheEntry::new(Arc::new(page)));
        }
    }

    #[cfg(any(fuzzing, test))]
    pub(crate) fn pinned_pages(&self) -> usize {
        self.table.lock().values().filter(|e| e.pins != 0).count()
    }

    /// Makes the next `count` requests for `pid` report a structural race.
    #[cfg(any(fuzzing, test))]
    pub(crate) fn inject_restarts(&self, pid: PageId, count: u32) {
        self.table.lock().get_mut(&pid).unwrap().inject_restarts = count;
    }
}

/// A pinned page. Dropping the guard releases the pin.
#[derive(Debug, Deref)]
pub struct PinnedPage {
    cache: Arc<PageCache>,
    #[deref]
    page: Arc<Page>,
}

impl PinnedPage {
    /// Takes an additional pin on the same page.
    pub fn repin(&self) -> PinnedPage {
        let mut table = self.cache.table.lock();
        if let Some(entry) = table.get_mut(&self.page.id()) {
            entry.pins += 1;
        } else {
            debug_assert!(false, "repin of non-resident page {}", self.page.id());
        }
        drop(table);
        PinnedPage {
            cache: self.cache.clone(),
            page: self.page.clone(),
        }
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.cache.page_out(self.page.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixLeafBuilder;

    fn fix_page(id: PageId) -> Page {
        let mut b = FixLeafBuilder::new(id, 1, 1);
        b.cell(b"x");
        b.build().unwrap()
    }

    #[test]
    fn test_pin_accounting() {
        let cache = PageCache::new();
        cache.insert(fix_page(1)).unwrap();
        assert_eq!(cache.pinned_pages(), 0);
        let pin = PageCache::pin(&cache, 1).unwrap();
        let pin2 = pin.repin();
        assert_eq!(cache.pinned_pages(), 1);
        assert!(!cache.begin_evict(1));
        drop(pin);
        assert!(!cache.begin_evict(1));
        drop(pin2);
        assert_eq!(cache.pinned_pages(), 0);
        assert!(cache.begin_evict(1));
    }

    #[test]
    fn test_page_in_restart_while_evicting() {
        let cache = PageCache::new();
        cache.insert(fix_page(1)).unwrap();
        assert!(cache.begin_evict(1));
        assert!(matches!(PageCache::page_in(&cache, 1, 1), Ok(PageIn::Restart)));
        cache.finish_evict(1, Some(fix_page(1)));
        assert!(matches!(PageCache::page_in(&cache, 1, 1), Ok(PageIn::Page(_))));
    }

    #[test]
    fn test_page_in_errors() {
        let cache = PageCache::new();
        cache.insert(fix_page(1)).unwrap();
        assert!(PageCache::page_in(&cache, 2, 1).is_err());
        // span mismatch against the parent reference
        assert!(matches!(
            PageCache::page_in(&cache, 1, 1000),
            Err(Error::Corruption(_))
        ));
        assert!(cache.insert(fix_page(1)).is_err());
    }

    #[test]
    fn test_verify_checksums() {
        let mut opts = CacheOptions::default();
        opts.verify_checksums = true;
        let cache = PageCache::with_options(opts);
        let page = fix_page(1);
        // corrupt one value byte past the header
        let mut data = page.data().to_vec();
        let len = data.len();
        data[len - 1] ^= 0xFF;
        drop(page);
        let corrupt = Page::from_bytes(crate::Bytes::from_vec(data)).unwrap();
        cache.insert(corrupt).unwrap();
        assert!(matches!(PageCache::page_in(&cache, 1, 1), Err(Error::Corruption(_))));
    }
}
