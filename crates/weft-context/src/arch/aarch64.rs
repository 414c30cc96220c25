//! aarch64 (AAPCS64) context switching.
//!
//! The saved set is sp, x19-x28, the frame pointer (x29), the link
//! register (x30), the callee-saved low halves of v8-v15 (d8-d15) and
//! fpcr. x30 doubles as the resume address: `ret` after the restore half
//! jumps wherever the target context left off.

use std::arch::naked_asm;
use std::mem::offset_of;
use std::ptr;

/// Saved register set for one suspended execution context.
///
/// Field order is ABI: the switch code addresses fields by fixed offsets.
#[repr(C)]
pub struct Context {
    sp: u64,
    /// x19..x28 in order.
    regs: [u64; 10],
    fp: u64,
    lr: u64,
    /// d8..d15 in order.
    vregs: [u64; 8],
    fpcr: u64,
    /// Context resumed when this context's entry function returns. Read at
    /// return time, so it may be re-pointed between runs.
    link: *const Context,
}

const _: () = {
    assert!(offset_of!(Context, sp) == 0x00);
    assert!(offset_of!(Context, regs) == 0x08);
    assert!(offset_of!(Context, fp) == 0x58);
    assert!(offset_of!(Context, lr) == 0x60);
    assert!(offset_of!(Context, vregs) == 0x68);
    assert!(offset_of!(Context, fpcr) == 0xa8);
    assert!(offset_of!(Context, link) == 0xb0);
};

impl Context {
    /// An empty save slot. Switching *out* into it is valid only after it
    /// has been saved into or initialized with [`Context::init`].
    pub const fn new() -> Self {
        Context {
            sp: 0,
            regs: [0; 10],
            fp: 0,
            lr: 0,
            vregs: [0; 8],
            fpcr: 0,
            link: ptr::null(),
        }
    }

    /// Arrange for this context, when first switched into, to run
    /// `entry(arg)` on the stack ending at `stack_top`. When `entry`
    /// returns, execution resumes whatever `self.link` holds at that
    /// moment.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the upper end of a live allocation large enough
    /// for `entry`'s frames, and `self` must stay at a stable address for
    /// as long as the context can run (the entry trampoline keeps a raw
    /// pointer to it).
    pub unsafe fn init(
        &mut self,
        entry: extern "C" fn(usize),
        arg: usize,
        stack_top: *mut u8,
        link: *const Context,
    ) {
        // AAPCS64 requires sp 16-aligned at all times; the first switch-in
        // `ret`s straight to the trampoline through x30.
        self.sp = (stack_top as usize & !0xf) as u64;
        self.regs = [0; 10];
        self.regs[0] = entry as usize as u64; // x19
        self.regs[1] = arg as u64; // x20
        self.regs[2] = self as *mut Context as u64; // x21
        self.fp = 0;
        self.lr = context_entry as usize as u64;
        self.vregs = [0; 8];
        self.fpcr = 0;
        self.link = link;
    }

    /// Re-point where this context falls through to when its entry
    /// function returns.
    pub fn set_link(&mut self, link: *const Context) {
        self.link = link;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the current context into `from` and resume `to`.
///
/// Returns when some other context switches back into `from`; execution
/// then continues after this call.
///
/// # Safety
///
/// Both pointers must be valid. `to` must have been initialized by
/// [`Context::init`] or previously saved into by a switch, and its backing
/// stack must still be live.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // Save callee-saved state into `from` (x0). x30 already holds the
        // caller's resume address.
        "mov x2, sp",
        "str x2, [x0, 0x00]",
        "stp x19, x20, [x0, 0x08]",
        "stp x21, x22, [x0, 0x18]",
        "stp x23, x24, [x0, 0x28]",
        "stp x25, x26, [x0, 0x38]",
        "stp x27, x28, [x0, 0x48]",
        "stp x29, x30, [x0, 0x58]",
        "stp d8, d9, [x0, 0x68]",
        "stp d10, d11, [x0, 0x78]",
        "stp d12, d13, [x0, 0x88]",
        "stp d14, d15, [x0, 0x98]",
        "mrs x3, fpcr",
        "str x3, [x0, 0xa8]",
        // Restore from `to` (x1).
        "ldr x2, [x1, 0x00]",
        "mov sp, x2",
        "ldp x19, x20, [x1, 0x08]",
        "ldp x21, x22, [x1, 0x18]",
        "ldp x23, x24, [x1, 0x28]",
        "ldp x25, x26, [x1, 0x38]",
        "ldp x27, x28, [x1, 0x48]",
        "ldp x29, x30, [x1, 0x58]",
        "ldp d8, d9, [x1, 0x68]",
        "ldp d10, d11, [x1, 0x78]",
        "ldp d12, d13, [x1, 0x88]",
        "ldp d14, d15, [x1, 0x98]",
        "ldr x3, [x1, 0xa8]",
        "msr fpcr, x3",
        // Fresh context: x30 is the trampoline. Suspended context: x30 is
        // the instruction after its `bl context_switch`.
        "ret",
    );
}

/// First-entry trampoline. `Context::init` parks the entry function in
/// x19, its argument in x20 and the owning context's address in x21 (all
/// callee-saved, so they survive the call). On return from the entry
/// function the link cell is re-read and resumed; the save half of the
/// switch targets the now-dead context, which is harmless.
#[unsafe(naked)]
extern "C" fn context_entry() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "mov x0, x21",
        "ldr x1, [x21, 0xb0]",
        "b {switch}",
        switch = sym context_switch,
    );
}
