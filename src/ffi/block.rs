//! Block literal used as the activity-stream callback.
//!
//! `os_activity_stream_for_pid` takes an Objective-C block, not a function
//! pointer. The layout below follows the Clang block ABI: a stack block whose
//! single captured variable is a non-owning `Weak<TrampolineContext>` pointer.
//! The native side copies the block to the heap (`_Block_copy`), which runs
//! [`copy_helper`] to take its own weak count, and releases it with
//! [`dispose_helper`] once the stream is cancelled or stopped.

use std::mem::{self, ManuallyDrop};
use std::os::raw::{c_int, c_ulong, c_void};
use std::ptr;
use std::sync::{Arc, Weak};

use super::types::OsActivityStreamEntry;
use crate::stream::trampoline::TrampolineContext;

const BLOCK_HAS_COPY_DISPOSE: c_int = 1 << 25;

/// `invoke` slot of the stream block.
pub type StreamBlockInvoke =
    unsafe extern "C" fn(*mut StreamBlock, *mut OsActivityStreamEntry, c_int) -> bool;

#[repr(C)]
struct BlockDescriptor {
    reserved: c_ulong,
    size: c_ulong,
    copy_helper: unsafe extern "C" fn(*mut c_void, *const c_void),
    dispose_helper: unsafe extern "C" fn(*const c_void),
}

static STREAM_BLOCK_DESCRIPTOR: BlockDescriptor = BlockDescriptor {
    reserved: 0,
    size: mem::size_of::<StreamBlock>() as c_ulong,
    copy_helper,
    dispose_helper,
};

#[cfg(target_os = "macos")]
extern "C" {
    static _NSConcreteStackBlock: [*const c_void; 32];
}

#[cfg(target_os = "macos")]
fn stack_block_isa() -> *const c_void {
    // SAFETY: only the address of the libSystem class object is taken.
    unsafe { ptr::addr_of!(_NSConcreteStackBlock).cast() }
}

#[cfg(not(target_os = "macos"))]
fn stack_block_isa() -> *const c_void {
    ptr::null()
}

/// Stack-allocated block passed to `os_activity_stream_for_pid`.
///
/// Owns one weak reference to the trampoline context, released on drop.
#[repr(C)]
pub struct StreamBlock {
    isa: *const c_void,
    flags: c_int,
    reserved: c_int,
    invoke: StreamBlockInvoke,
    descriptor: *const BlockDescriptor,
    context: *const TrampolineContext,
}

impl StreamBlock {
    pub(crate) fn new(context: Weak<TrampolineContext>, invoke: StreamBlockInvoke) -> Self {
        Self {
            isa: stack_block_isa(),
            flags: BLOCK_HAS_COPY_DISPOSE,
            reserved: 0,
            invoke,
            descriptor: &STREAM_BLOCK_DESCRIPTOR,
            context: Weak::into_raw(context),
        }
    }

    /// Upgrades the captured context, if its owner is still alive.
    ///
    /// # Safety
    /// `block` must point to a live stream block (stack block or heap copy).
    pub(crate) unsafe fn upgrade_context(block: *const Self) -> Option<Arc<TrampolineContext>> {
        let weak = ManuallyDrop::new(Weak::from_raw((*block).context));
        weak.upgrade()
    }

    /// Calls the block the way the native runtime does.
    ///
    /// # Safety
    /// `block` must point to a live stream block; `entry` must be null or
    /// valid for the duration of the call.
    pub unsafe fn invoke(
        block: *mut Self,
        entry: *mut OsActivityStreamEntry,
        error: c_int,
    ) -> bool {
        ((*block).invoke)(block, entry, error)
    }

    /// Copies a block to the heap, the way `_Block_copy` does.
    ///
    /// Used by in-process stand-ins for the native stream API.
    ///
    /// # Safety
    /// `src` must point to a live stream block. The copy must be released
    /// with [`StreamBlock::release_heap`].
    pub unsafe fn copy_to_heap(src: *const Self) -> *mut Self {
        let copy = Box::into_raw(Box::new(ManuallyDrop::new(ptr::read(src)))).cast::<Self>();
        if (*src).flags & BLOCK_HAS_COPY_DISPOSE != 0 {
            ((*(*src).descriptor).copy_helper)(copy.cast(), src.cast());
        }
        copy
    }

    /// Releases a heap copy made by [`StreamBlock::copy_to_heap`].
    ///
    /// # Safety
    /// `block` must come from `copy_to_heap` and not have been released.
    pub unsafe fn release_heap(block: *mut Self) {
        if (*block).flags & BLOCK_HAS_COPY_DISPOSE != 0 {
            ((*(*block).descriptor).dispose_helper)(block.cast());
        }
        drop(Box::from_raw(block.cast::<ManuallyDrop<Self>>()));
    }
}

impl Drop for StreamBlock {
    fn drop(&mut self) {
        // SAFETY: `context` came from `Weak::into_raw` in `new`.
        drop(unsafe { Weak::from_raw(self.context) });
    }
}

/// Bitwise copy already happened; take a weak count for the destination.
unsafe extern "C" fn copy_helper(dst: *mut c_void, src: *const c_void) {
    let src = src.cast::<StreamBlock>();
    let dst = dst.cast::<StreamBlock>();
    let weak = ManuallyDrop::new(Weak::from_raw((*src).context));
    (*dst).context = Weak::into_raw(Weak::clone(&weak));
}

unsafe extern "C" fn dispose_helper(block: *const c_void) {
    let block = block.cast::<StreamBlock>();
    drop(Weak::from_raw((*block).context));
}
