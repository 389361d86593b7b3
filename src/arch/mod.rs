use crate::stack::StackPointer;
use core::fmt;
use core::marker::PhantomData;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", unix))] {
        mod x86_64;
        use x86_64 as imp;
        pub use x86_64::STACK_ALIGNMENT;
    } else if #[cfg(all(target_arch = "aarch64", unix))] {
        mod aarch64;
        use aarch64 as imp;
        pub use aarch64::STACK_ALIGNMENT;
    } else {
        compile_error!("Unsupported target architecture");
    }
}

/// Entry point of a fresh context. Receives the payload of the first switch
/// into the context and must never return: a context that has nothing left to
/// do switches away and is abandoned.
pub(crate) type Entry = unsafe extern "C" fn(usize) -> !;

/// A suspended stack, ready to be switched into exactly once.
///
/// The wrapped pointer addresses the frame that [`switch`] wrote when the
/// stack was suspended (or that [`init_context`] seeded for a stack that has
/// never run). Resuming consumes the handle; the suspended frame is invalid
/// the moment control transfers into it.
pub(crate) struct Context {
    sp: StackPointer,
    /// Tied to one thread's stacks; never send a suspended stack elsewhere.
    _not_send: PhantomData<*mut ()>,
}

impl Context {
    /// # Safety
    ///
    /// `sp` must be a stack pointer previously published by [`switch`]
    /// through its save slot, or returned by [`init_context`], and must not
    /// have been resumed since.
    pub(crate) unsafe fn from_sp(sp: StackPointer) -> Self {
        Context {
            sp,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({:#x})", self.sp.get())
    }
}

/// Seeds the stack ending at `top` so that the first switch into the returned
/// context enters `entry` with that switch's payload as its argument.
///
/// # Safety
///
/// `top` must be the writable, [`STACK_ALIGNMENT`]-aligned upper end of a
/// stack that stays allocated for as long as the context (or anything later
/// suspended on it) exists.
pub(crate) unsafe fn init_context(top: StackPointer, entry: Entry) -> Context {
    // Safety: forwarded to the caller.
    unsafe { Context::from_sp(imp::init_context(top, entry)) }
}

/// Saves the current CPU state into `*save`, switches to `resume` and hands
/// it `payload`. Returns the payload of whatever switch later targets the
/// context published through `*save`.
///
/// `preserve_fp` additionally carries the floating-point control state
/// (rounding mode and friends) across the suspension. The floating-point
/// *data* registers are already covered by the clobber lists on every
/// supported ABI.
///
/// # Safety
///
/// `resume` must be live (see [`Context::from_sp`]) and `save` must point to
/// writable memory that outlives the suspension.
pub(crate) unsafe fn switch(
    payload: usize,
    save: *mut usize,
    resume: Context,
    preserve_fp: bool,
) -> usize {
    // Safety: forwarded to the caller.
    unsafe {
        if preserve_fp {
            imp::switch_fp(payload, save, resume.sp)
        } else {
            imp::switch(payload, save, resume.sp)
        }
    }
}

/// Helper function to push a value onto a stack.
#[inline]
pub(crate) unsafe fn push(sp: &mut usize, val: usize) {
    // Safety: ensured by caller
    unsafe {
        *sp -= size_of::<usize>();
        *(*sp as *mut usize) = val;
    }
}
