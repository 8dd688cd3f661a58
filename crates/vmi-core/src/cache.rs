use std::{cell::RefCell, num::NonZeroUsize};

use lru::LruCache;

use crate::{AccessContext, Gfn, Pa, VmiError, VmiMappedPage};

/// Page and translation caches in front of the driver.
///
/// Both are flushed together. A breakpoint write changes page content and
/// may race a translation change, so keeping one without the other buys
/// nothing.
pub(crate) struct GuestCache {
    pages: RefCell<LruCache<Gfn, VmiMappedPage>>,
    translations: RefCell<LruCache<AccessContext, Pa>>,
}

impl GuestCache {
    pub const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::new(8192).unwrap();

    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            pages: RefCell::new(LruCache::new(capacity)),
            translations: RefCell::new(LruCache::new(capacity)),
        }
    }

    pub fn page(
        &self,
        gfn: Gfn,
        read: impl FnOnce() -> Result<VmiMappedPage, VmiError>,
    ) -> Result<VmiMappedPage, VmiError> {
        let mut pages = self.pages.borrow_mut();
        pages.try_get_or_insert(gfn, read).cloned()
    }

    pub fn translation(
        &self,
        ctx: AccessContext,
        translate: impl FnOnce() -> Result<Pa, VmiError>,
    ) -> Result<Pa, VmiError> {
        let mut translations = self.translations.borrow_mut();
        translations.try_get_or_insert(ctx, translate).copied()
    }

    pub fn flush(&self) {
        self.translations.borrow_mut().clear();
        self.pages.borrow_mut().clear();
    }
}
