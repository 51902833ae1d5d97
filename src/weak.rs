use crate::control_block::{BlockHeader, BlockState, RawRef};
use crate::error::ExpiredError;
use crate::shared::SharedPtr;
use core::fmt;

/// Non-owning observer of a `SharedPtr`'s object.
///
/// A weak handle never keeps the object alive, only the control block, so
/// it can always answer whether the object still exists. Promotion comes
/// in two flavors: [`WeakPtr::lock`] returns an empty `SharedPtr` on expiry,
/// [`WeakPtr::upgrade`] returns [`ExpiredError`].
pub struct WeakPtr<T> {
    raw: Option<RawRef<T>>,
}

impl<T> WeakPtr<T> {
    /// An empty handle; always expired.
    pub const fn new() -> Self {
        Self { raw: None }
    }

    pub(crate) fn raw(&self) -> Option<RawRef<T>> {
        self.raw
    }

    fn header(&self) -> Option<&BlockHeader> {
        // Safety: the weak reference keeps the block storage alive.
        self.raw.map(|raw| unsafe { &*raw.block.as_ptr() })
    }

    /// True when empty or when the last strong handle is gone.
    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// Strong handles sharing the observed block.
    pub fn use_count(&self) -> usize {
        self.header().map_or(0, BlockHeader::strong_count)
    }

    /// Weak handles observing the block, this one included.
    pub fn weak_count(&self) -> usize {
        self.header().map_or(0, BlockHeader::weak_count)
    }

    /// Block lifecycle as seen from this handle; `None` when empty.
    pub fn block_state(&self) -> Option<BlockState> {
        self.header().map(BlockHeader::state)
    }

    /// A new strong handle, or an empty one if the object is gone.
    pub fn lock(&self) -> SharedPtr<T> {
        SharedPtr::promote(self).unwrap_or_default()
    }

    /// A new strong handle, or `ExpiredError` if the object is gone.
    pub fn upgrade(&self) -> Result<SharedPtr<T>, ExpiredError> {
        SharedPtr::from_weak(self)
    }

    /// Release this handle's weak reference and leave it empty.
    pub fn reset(&mut self) {
        if let Some(raw) = self.raw.take() {
            unsafe { BlockHeader::dec_weak(raw.block) };
        }
    }

    /// Move out of this handle, leaving it empty. Counts are unchanged.
    pub fn take(&mut self) -> Self {
        core::mem::replace(self, Self::new())
    }

    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(&mut self.raw, &mut other.raw);
    }

    /// Cached access pointer; null when empty. Not dereferenceable once
    /// the handle has expired.
    pub fn as_ptr(&self) -> *const T {
        self.raw
            .map_or(core::ptr::null(), |raw| raw.ptr.as_ptr() as *const T)
    }

    /// Whether this handle observes the same control block as `other`.
    pub fn owner_eq<U>(&self, other: &SharedPtr<U>) -> bool {
        match (self.raw, other.raw()) {
            (Some(a), Some(b)) => a.block == b.block,
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T> From<&SharedPtr<T>> for WeakPtr<T> {
    fn from(shared: &SharedPtr<T>) -> Self {
        let raw = shared.raw();
        if let Some(raw) = raw {
            unsafe { BlockHeader::inc_weak(raw.block) };
        }
        Self { raw }
    }
}

impl<T> Clone for WeakPtr<T> {
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            unsafe { BlockHeader::inc_weak(raw.block) };
        }
        Self { raw: self.raw }
    }
}

impl<T> Drop for WeakPtr<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> Default for WeakPtr<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for WeakPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.header() {
            Some(header) => f
                .debug_struct("WeakPtr")
                .field("ptr", &self.as_ptr())
                .field("strong", &header.strong_count())
                .field("weak", &header.weak_count())
                .finish(),
            None => f.write_str("WeakPtr(null)"),
        }
    }
}
