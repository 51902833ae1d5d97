//! Control block: the heap record shared by every `SharedPtr`/`WeakPtr`
//! that refers to one managed object.
//!
//! A block is a type-erased `BlockHeader` (both counters, the variant tag
//! and two monomorphized destruction entry points) followed by the
//! variant's own storage: the object itself for `ControlBlock<T>`, a
//! pointer to a boxed object for `ExternalBlock<T>`. Handles only ever
//! hold `NonNull<BlockHeader>`, which is what lets an aliased
//! `SharedPtr<U>` keep a `ControlBlock<T>` alive.
//!
//! All raw-pointer handling of the crate lives here; the handle types are
//! plain bookkeeping on top of the counter operations below.

use allocator_api2::alloc::{Allocator, Global};
use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use std::alloc::Layout;

/// Which storage strategy a block uses for its managed object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlockKind {
    /// Object lives inside the block allocation (`make_shared`).
    CoAllocated,
    /// Object lives in its own heap allocation (`from_box`/`from_raw`).
    External,
}

/// Lifecycle of a block, derived from its two counters.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlockState {
    /// At least one strong handle; the object is alive.
    Alive,
    /// Object destroyed, block kept for outstanding weak handles.
    WeaklyReachable,
    /// Both counts reached zero and the block storage was freed.
    Dead,
}

impl BlockState {
    fn from_counts(strong: usize, weak: usize) -> Self {
        match (strong, weak) {
            (0, 0) => BlockState::Dead,
            (0, _) => BlockState::WeaklyReachable,
            _ => BlockState::Alive,
        }
    }
}

#[derive(Copy, Clone)]
struct BlockOps {
    destroy_object: unsafe fn(NonNull<BlockHeader>),
    deallocate: unsafe fn(NonNull<BlockHeader>),
}

/// Type-erased prefix of every control block.
pub struct BlockHeader {
    strong: Cell<usize>,
    weak: Cell<usize>,
    kind: BlockKind,
    ops: BlockOps,
}

#[inline]
fn increment(counter: &Cell<usize>) {
    let n = counter.get().wrapping_add(1);
    counter.set(n);
    if n == 0 {
        // Follow Rc semantics: abort on overflow rather than continue unsafely.
        std::process::abort();
    }
}

// Releases the internal weak reference taken while the object is destroyed,
// also when its destructor unwinds.
struct DestroyGuard {
    block: NonNull<BlockHeader>,
}

impl Drop for DestroyGuard {
    fn drop(&mut self) {
        unsafe { BlockHeader::dec_weak(self.block) };
    }
}

impl BlockHeader {
    fn new(kind: BlockKind, ops: BlockOps) -> Self {
        Self {
            strong: Cell::new(1),
            weak: Cell::new(0),
            kind,
            ops,
        }
    }

    pub fn strong_count(&self) -> usize {
        self.strong.get()
    }

    pub fn weak_count(&self) -> usize {
        self.weak.get()
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn state(&self) -> BlockState {
        BlockState::from_counts(self.strong.get(), self.weak.get())
    }

    /// Add one strong reference.
    ///
    /// Safety: `block` must be live and its object not yet destroyed.
    #[inline]
    pub unsafe fn inc_strong(block: NonNull<Self>) {
        let header = unsafe { block.as_ref() };
        debug_assert!(header.strong.get() > 0, "inc_strong on a destroyed object");
        increment(&header.strong);
    }

    /// Add one strong reference unless the object is already gone.
    /// Returns whether the reference was taken.
    ///
    /// Safety: `block` must be live.
    #[inline]
    pub unsafe fn try_inc_strong(block: NonNull<Self>) -> bool {
        let header = unsafe { block.as_ref() };
        if header.strong.get() == 0 {
            return false;
        }
        increment(&header.strong);
        true
    }

    /// Drop one strong reference. On the 1 -> 0 transition the managed
    /// object is destroyed, then the block is freed if no weak reference
    /// remains. Returns the state after the call; on `Dead` the pointer
    /// is dangling.
    ///
    /// Safety: the caller must own one strong reference on a live block.
    pub unsafe fn dec_strong(block: NonNull<Self>) -> BlockState {
        let header = unsafe { block.as_ref() };
        let strong = header.strong.get();
        debug_assert!(strong > 0, "strong count underflow");
        header.strong.set(strong - 1);
        if strong != 1 {
            return BlockState::Alive;
        }

        let destroy_object = header.ops.destroy_object;
        // The object's destructor may drop weak handles to this very block;
        // hold one internally so the block survives until it returns.
        increment(&header.weak);
        let guard = DestroyGuard { block };
        log::trace!("control block {:p}: destroying managed object", block);
        unsafe { destroy_object(block) };
        core::mem::forget(guard);
        unsafe { Self::dec_weak(block) }
    }

    /// Add one weak reference.
    ///
    /// Safety: `block` must be live.
    #[inline]
    pub unsafe fn inc_weak(block: NonNull<Self>) {
        increment(&unsafe { block.as_ref() }.weak);
    }

    /// Drop one weak reference, freeing the block when both counts are
    /// zero. Returns the state after the call; on `Dead` the pointer is
    /// dangling.
    ///
    /// Safety: the caller must own one weak reference on a live block.
    pub unsafe fn dec_weak(block: NonNull<Self>) -> BlockState {
        let header = unsafe { block.as_ref() };
        let weak = header.weak.get();
        debug_assert!(weak > 0, "weak count underflow");
        header.weak.set(weak - 1);
        let state = BlockState::from_counts(header.strong.get(), weak - 1);
        if state == BlockState::Dead {
            let deallocate = header.ops.deallocate;
            log::trace!("control block {:p}: freeing block storage", block);
            unsafe { deallocate(block) };
        }
        state
    }
}

/// A block reference paired with the access pointer a handle exposes.
/// The access pointer differs from the block's own object for aliased
/// handles.
pub struct RawRef<T> {
    pub block: NonNull<BlockHeader>,
    pub ptr: NonNull<T>,
    /// `ptr` came from an aliasing constructor, not from the block itself.
    /// Such a pointer was derived from a shared borrow (or points at
    /// unrelated data), so it never grants mutable access.
    pub aliased: bool,
}

impl<T> Clone for RawRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawRef<T> {}

fn allocate_block<B>(block: B) -> NonNull<B> {
    let layout = Layout::new::<B>();
    let ptr = match Global.allocate(layout) {
        Ok(ptr) => ptr.cast::<B>(),
        Err(_) => std::alloc::handle_alloc_error(layout),
    };
    unsafe { ptr.as_ptr().write(block) };
    ptr
}

unsafe fn deallocate_block<B>(block: NonNull<BlockHeader>) {
    // No live object remains and block types have no drop glue of their own.
    unsafe { Global.deallocate(block.cast::<u8>(), Layout::new::<B>()) };
}

/// Co-allocated block: the object is stored inline after the header.
/// `header` must stay the first field so a block pointer can be viewed as
/// a `BlockHeader` pointer.
#[repr(C)]
pub struct ControlBlock<T> {
    header: BlockHeader,
    slot: UnsafeCell<MaybeUninit<T>>,
}

/// External block: only a pointer to a separately boxed object.
#[repr(C)]
pub struct ExternalBlock<T> {
    header: BlockHeader,
    ptr: NonNull<T>,
}

// Frees the storage of a block whose object never got constructed.
struct AllocGuard<T> {
    block: NonNull<ControlBlock<T>>,
}

impl<T> Drop for AllocGuard<T> {
    fn drop(&mut self) {
        log::trace!("control block {:p}: construction failed, rolling back", self.block);
        unsafe { deallocate_block::<ControlBlock<T>>(self.block.cast()) };
    }
}

impl<T> ControlBlock<T> {
    /// Allocate a block with room for the object, then construct the
    /// object in place. If `init` fails or unwinds the block is freed
    /// before the error propagates.
    pub fn new_co_allocated<E, F>(init: F) -> Result<RawRef<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let ops = BlockOps {
            destroy_object: Self::destroy_object,
            deallocate: deallocate_block::<Self>,
        };
        let block = allocate_block(ControlBlock {
            header: BlockHeader::new(BlockKind::CoAllocated, ops),
            slot: UnsafeCell::new(MaybeUninit::<T>::uninit()),
        });
        log::trace!("control block {:p}: allocated (CoAllocated)", block);
        let guard = AllocGuard { block };
        let ptr = unsafe { NonNull::new_unchecked((*block.as_ptr()).slot.get().cast::<T>()) };
        let value = init()?;
        unsafe { ptr.as_ptr().write(value) };
        core::mem::forget(guard);
        Ok(RawRef {
            block: block.cast(),
            ptr,
            aliased: false,
        })
    }

    unsafe fn destroy_object(block: NonNull<BlockHeader>) {
        let block = block.cast::<Self>();
        // In place: the surrounding storage stays allocated.
        unsafe { core::ptr::drop_in_place((*block.as_ptr()).slot.get().cast::<T>()) };
    }
}

impl<T> ExternalBlock<T> {
    /// Allocate a block that takes ownership of a separately boxed object.
    ///
    /// Safety: `ptr` must come from `Box::into_raw` and must not be owned
    /// by anything else.
    pub unsafe fn new_external(ptr: NonNull<T>) -> RawRef<T> {
        let ops = BlockOps {
            destroy_object: Self::destroy_object,
            deallocate: deallocate_block::<Self>,
        };
        let block = allocate_block(ExternalBlock {
            header: BlockHeader::new(BlockKind::External, ops),
            ptr,
        });
        log::trace!("control block {:p}: allocated (External)", block);
        RawRef {
            block: block.cast(),
            ptr,
            aliased: false,
        }
    }

    unsafe fn destroy_object(block: NonNull<BlockHeader>) {
        let ptr = unsafe { (*block.cast::<Self>().as_ptr()).ptr };
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockHeader, BlockKind, BlockState, ControlBlock, ExternalBlock};
    use core::ptr::NonNull;
    use std::alloc::Layout;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Tracked {
        drops: Rc<Cell<usize>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn tracked(drops: &Rc<Cell<usize>>) -> Tracked {
        Tracked {
            drops: drops.clone(),
        }
    }

    #[test]
    fn co_allocated_object_lives_inside_block() {
        let raw = ControlBlock::new_co_allocated(|| Ok::<_, ()>(7u64)).unwrap();
        let header = unsafe { raw.block.as_ref() };
        assert_eq!(header.kind(), BlockKind::CoAllocated);
        assert_eq!(header.strong_count(), 1);
        assert_eq!(header.weak_count(), 0);

        let start = raw.block.as_ptr() as usize;
        let end = start + core::mem::size_of::<ControlBlock<u64>>();
        let obj = raw.ptr.as_ptr() as usize;
        assert!(obj >= start && obj < end);
        assert_eq!(unsafe { *raw.ptr.as_ref() }, 7);

        assert_eq!(unsafe { BlockHeader::dec_strong(raw.block) }, BlockState::Dead);
    }

    #[test]
    fn external_block_points_at_box() {
        let boxed = Box::new(String::from("ext"));
        let ptr = NonNull::new(Box::into_raw(boxed)).unwrap();
        let raw = unsafe { ExternalBlock::new_external(ptr) };
        assert_eq!(raw.ptr, ptr);
        assert!(!raw.aliased);
        assert_eq!(unsafe { raw.block.as_ref() }.kind(), BlockKind::External);
        assert_eq!(unsafe { BlockHeader::dec_strong(raw.block) }, BlockState::Dead);
    }

    // External blocks must not reserve room for the object they point at.
    #[test]
    fn external_block_size_ignores_object_size() {
        let external = Layout::new::<ExternalBlock<[u8; 65536]>>();
        let header = Layout::new::<BlockHeader>();
        assert!(external.size() <= header.size() + core::mem::size_of::<usize>() * 2);
        assert!(Layout::new::<ControlBlock<[u8; 65536]>>().size() >= 65536);

        let boxed = Box::into_raw(Box::new([7u8; 65536]));
        let raw = unsafe { ExternalBlock::new_external(NonNull::new_unchecked(boxed)) };
        assert_eq!(unsafe { raw.ptr.as_ref() }[65535], 7);
        assert_eq!(unsafe { BlockHeader::dec_strong(raw.block) }, BlockState::Dead);
    }

    #[test]
    fn strong_then_weak_release_walks_states() {
        let drops = Rc::new(Cell::new(0));
        let raw = ControlBlock::new_co_allocated(|| Ok::<_, ()>(tracked(&drops))).unwrap();
        unsafe {
            BlockHeader::inc_strong(raw.block);
            BlockHeader::inc_weak(raw.block);
            assert_eq!(raw.block.as_ref().state(), BlockState::Alive);

            assert_eq!(BlockHeader::dec_strong(raw.block), BlockState::Alive);
            assert_eq!(drops.get(), 0);

            assert_eq!(BlockHeader::dec_strong(raw.block), BlockState::WeaklyReachable);
            assert_eq!(drops.get(), 1);
            assert_eq!(raw.block.as_ref().weak_count(), 1);
            assert!(!BlockHeader::try_inc_strong(raw.block));

            assert_eq!(BlockHeader::dec_weak(raw.block), BlockState::Dead);
        }
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn weak_release_while_alive_keeps_block() {
        let drops = Rc::new(Cell::new(0));
        let boxed = Box::new(tracked(&drops));
        let raw = unsafe { ExternalBlock::new_external(NonNull::new_unchecked(Box::into_raw(boxed))) };
        unsafe {
            BlockHeader::inc_weak(raw.block);
            assert_eq!(BlockHeader::dec_weak(raw.block), BlockState::Alive);
            assert!(BlockHeader::try_inc_strong(raw.block));
            assert_eq!(raw.block.as_ref().strong_count(), 2);
            assert_eq!(BlockHeader::dec_strong(raw.block), BlockState::Alive);
            assert_eq!(BlockHeader::dec_strong(raw.block), BlockState::Dead);
        }
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn failed_construction_returns_error() {
        let res = ControlBlock::<String>::new_co_allocated(|| Err::<String, _>("nope"));
        assert!(matches!(res, Err("nope")));
    }

    #[test]
    fn panicking_construction_unwinds() {
        let res = std::panic::catch_unwind(|| {
            ControlBlock::<String>::new_co_allocated(|| -> Result<String, ()> {
                panic!("constructor failure")
            })
            .map(|raw| unsafe { BlockHeader::dec_strong(raw.block) })
        });
        assert!(res.is_err());
    }
}
