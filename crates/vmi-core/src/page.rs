use std::{ops::Deref, rc::Rc};

/// A snapshot of one guest page.
///
/// Clones share the same buffer. The content does not follow later writes
/// to the guest; re-read the page to observe them.
#[derive(Clone)]
pub struct VmiMappedPage(Rc<[u8]>);

impl VmiMappedPage {
    /// Wraps page content produced by a driver.
    pub fn new(content: impl Into<Rc<[u8]>>) -> Self {
        Self(content.into())
    }
}

impl Deref for VmiMappedPage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for VmiMappedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VmiMappedPage")
            .field("len", &self.0.len())
            .finish()
    }
}
