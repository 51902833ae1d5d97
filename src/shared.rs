use crate::control_block::{BlockHeader, BlockKind, ControlBlock, ExternalBlock, RawRef};
use crate::error::ExpiredError;
use crate::weak::WeakPtr;
use core::convert::Infallible;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;

/// Shared-ownership handle. Cloning adds a strong reference; dropping the
/// last one destroys the managed object even if `WeakPtr`s remain.
///
/// A handle is either empty or refers to a control block plus an access
/// pointer. The access pointer is usually the block's own object, but an
/// aliased handle (see [`SharedPtr::map`]) exposes some other address while
/// sharing the block's ownership.
pub struct SharedPtr<T> {
    raw: Option<RawRef<T>>,
    // Owns a T for drop-check purposes, like Rc.
    _owns: PhantomData<T>,
}

impl<T> SharedPtr<T> {
    /// An empty handle.
    pub const fn null() -> Self {
        Self {
            raw: None,
            _owns: PhantomData,
        }
    }

    fn from_raw_ref(raw: RawRef<T>) -> Self {
        Self {
            raw: Some(raw),
            _owns: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> Option<RawRef<T>> {
        self.raw
    }

    fn header(&self) -> Option<&BlockHeader> {
        // Safety: a non-empty handle holds a strong reference, so the block is live.
        self.raw.map(|raw| unsafe { &*raw.block.as_ptr() })
    }

    /// Same as [`SharedPtr::make_shared`].
    pub fn new(value: T) -> Self {
        Self::make_shared(value)
    }

    /// Allocate the object and its control block in a single allocation.
    pub fn make_shared(value: T) -> Self {
        Self::make_shared_with(move || value)
    }

    /// Allocate a combined block, then construct the object in place with
    /// `init`. If `init` panics the block is freed before unwinding
    /// continues.
    pub fn make_shared_with<F>(init: F) -> Self
    where
        F: FnOnce() -> T,
    {
        match Self::try_make_shared_with(|| Ok::<T, Infallible>(init())) {
            Ok(ptr) => ptr,
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`SharedPtr::make_shared_with`]: on `Err` the block
    /// is freed and the error is returned unchanged.
    pub fn try_make_shared_with<E, F>(init: F) -> Result<Self, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        ControlBlock::new_co_allocated(init).map(Self::from_raw_ref)
    }

    /// Take ownership of a boxed object; the control block is allocated
    /// separately.
    pub fn from_box(value: Box<T>) -> Self {
        // Safety: the pointer comes straight from Box::into_raw.
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(value)) };
        Self::from_raw_ref(unsafe { ExternalBlock::new_external(ptr) })
    }

    /// Take ownership of a heap object given by raw pointer. A null pointer
    /// yields an empty handle.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::<T>::into_raw` and must not be owned by
    /// anything else. Building two handles from the same address this way
    /// frees the object twice.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        match NonNull::new(ptr) {
            Some(ptr) => Self::from_raw_ref(unsafe { ExternalBlock::new_external(ptr) }),
            None => Self::null(),
        }
    }

    /// Promote a weak handle, failing when the object is already gone.
    pub fn from_weak(weak: &WeakPtr<T>) -> Result<Self, ExpiredError> {
        Self::promote(weak).ok_or_else(|| {
            log::debug!("refusing to promote expired weak pointer");
            ExpiredError
        })
    }

    pub(crate) fn promote(weak: &WeakPtr<T>) -> Option<Self> {
        let raw = weak.raw()?;
        // Safety: the weak handle keeps the block itself alive.
        if unsafe { BlockHeader::try_inc_strong(raw.block) } {
            Some(Self::from_raw_ref(raw))
        } else {
            None
        }
    }

    /// Share this handle's ownership while exposing `ptr` instead of the
    /// managed object. Aliasing an empty handle, or passing a null `ptr`,
    /// gives an empty handle.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads for as long as the managed object is
    /// alive, typically because it points into that object.
    pub unsafe fn alias<U>(&self, ptr: *const U) -> SharedPtr<U> {
        match (self.raw, NonNull::new(ptr as *mut U)) {
            (Some(raw), Some(ptr)) => {
                unsafe { BlockHeader::inc_strong(raw.block) };
                SharedPtr::from_raw_ref(RawRef {
                    block: raw.block,
                    ptr,
                    aliased: true,
                })
            }
            _ => SharedPtr::null(),
        }
    }

    /// Aliasing projection: a handle to a part of the managed object that
    /// keeps the whole object alive. The projected handle is read-only:
    /// `get_mut` on it always returns `None`.
    pub fn map<U, F>(&self, f: F) -> SharedPtr<U>
    where
        T: 'static,
        F: FnOnce(&T) -> &U,
    {
        match self.get() {
            // Safety: with T: 'static the projected reference points either
            // into the object or at static data.
            Some(value) => unsafe { self.alias(f(value) as *const U) },
            None => SharedPtr::null(),
        }
    }

    /// A weak handle observing the same block.
    pub fn downgrade(&self) -> WeakPtr<T> {
        WeakPtr::from(self)
    }

    /// Release this handle's strong reference and leave it empty.
    pub fn reset(&mut self) {
        if let Some(raw) = self.raw.take() {
            unsafe { BlockHeader::dec_strong(raw.block) };
        }
    }

    /// Release the current reference and take ownership of `value` in a
    /// fresh external block.
    pub fn reset_with(&mut self, value: Box<T>) {
        self.reset();
        *self = Self::from_box(value);
    }

    /// Move out of this handle, leaving it empty. Counts are unchanged.
    pub fn take(&mut self) -> Self {
        core::mem::replace(self, Self::null())
    }

    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(&mut self.raw, &mut other.raw);
    }

    pub fn get(&self) -> Option<&T> {
        // Safety: the strong reference keeps the pointee alive.
        self.raw.map(|raw| unsafe { &*raw.ptr.as_ptr() })
    }

    /// # Safety
    ///
    /// The handle must not be empty.
    pub unsafe fn get_unchecked(&self) -> &T {
        match self.raw {
            Some(raw) => unsafe { &*raw.ptr.as_ptr() },
            None => unsafe { core::hint::unreachable_unchecked() },
        }
    }

    /// Mutable access, only when no other strong or weak handle exists and
    /// the handle points at its block's own object. Aliased handles (from
    /// `alias`/`map`, or promoted from a weak copy of one) never qualify.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let raw = self.raw?;
        if raw.aliased || !self.unique() || self.weak_count() != 0 {
            return None;
        }
        // Safety: sole owner, and ptr is the block's own object.
        Some(unsafe { &mut *raw.ptr.as_ptr() })
    }

    /// Raw access pointer; null when empty.
    pub fn as_ptr(&self) -> *const T {
        self.raw
            .map_or(core::ptr::null(), |raw| raw.ptr.as_ptr() as *const T)
    }

    /// Number of strong handles sharing the block, 0 when empty.
    pub fn use_count(&self) -> usize {
        self.header().map_or(0, BlockHeader::strong_count)
    }

    /// Number of weak handles observing the block, 0 when empty.
    pub fn weak_count(&self) -> usize {
        self.header().map_or(0, BlockHeader::weak_count)
    }

    pub fn unique(&self) -> bool {
        self.use_count() == 1
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_none()
    }

    pub fn block_kind(&self) -> Option<BlockKind> {
        self.header().map(BlockHeader::kind)
    }

    /// Whether both handles expose the same address.
    ///
    /// Zero-sized objects have no distinct address, so for them the control
    /// block is compared as well; two separately created `SharedPtr<()>`s
    /// are unequal while clones of one are equal.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.as_ptr() == other.as_ptr()
            && (!Self::IS_ZST || this.block_addr() == other.block_addr())
    }

    const IS_ZST: bool = core::mem::size_of::<T>() == 0;

    fn block_addr(&self) -> *const BlockHeader {
        self.raw
            .map_or(core::ptr::null(), |raw| raw.block.as_ptr() as *const BlockHeader)
    }

    /// Whether both handles share one control block, regardless of what
    /// they point at.
    pub fn owner_eq<U>(&self, other: &SharedPtr<U>) -> bool {
        match (self.raw, other.raw()) {
            (Some(a), Some(b)) => a.block == b.block,
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T> Clone for SharedPtr<T> {
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            unsafe { BlockHeader::inc_strong(raw.block) };
        }
        Self {
            raw: self.raw,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for SharedPtr<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> Default for SharedPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Deref for SharedPtr<T> {
    type Target = T;

    /// Panics on an empty handle.
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced an empty SharedPtr"),
        }
    }
}

impl<T> From<Box<T>> for SharedPtr<T> {
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T> TryFrom<&WeakPtr<T>> for SharedPtr<T> {
    type Error = ExpiredError;

    fn try_from(weak: &WeakPtr<T>) -> Result<Self, ExpiredError> {
        Self::from_weak(weak)
    }
}

impl<T> PartialEq for SharedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T> Eq for SharedPtr<T> {}

impl<T> Hash for SharedPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.as_ptr() as usize).hash(state);
        if Self::IS_ZST {
            (self.block_addr() as usize).hash(state);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f
                .debug_struct("SharedPtr")
                .field("data", value)
                .field("strong", &self.use_count())
                .field("weak", &self.weak_count())
                .finish(),
            None => f.write_str("SharedPtr(null)"),
        }
    }
}

impl<T> fmt::Pointer for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.as_ptr(), f)
    }
}
