//! x86_64 System V context switching.
//!
//! The saved set is the callee-saved registers of the System V ABI (rsp,
//! rbp, rbx, r12-r15) plus the two floating-point control registers
//! (mxcsr and the x87 control word). Everything else is caller-saved and
//! therefore dead across the `context_switch` call boundary.

use std::arch::naked_asm;
use std::mem::offset_of;
use std::ptr;

/// Saved register set for one suspended execution context.
///
/// Field order is ABI: the switch code addresses fields by fixed offsets.
#[repr(C)]
pub struct Context {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    mxcsr: u32,
    fcw: u16,
    _pad: u16,
    /// Context resumed when this context's entry function returns. Read at
    /// return time, so it may be re-pointed between runs.
    link: *const Context,
}

const _: () = {
    assert!(offset_of!(Context, rsp) == 0x00);
    assert!(offset_of!(Context, mxcsr) == 0x38);
    assert!(offset_of!(Context, fcw) == 0x3c);
    assert!(offset_of!(Context, link) == 0x40);
};

// x87 control word and mxcsr power-on defaults: round-to-nearest, all
// exceptions masked, 64-bit x87 precision.
const FCW_INIT: u16 = 0x037f;
const MXCSR_INIT: u32 = 0x1f80;

impl Context {
    /// An empty save slot. Switching *out* into it is valid only after it
    /// has been saved into or initialized with [`Context::init`].
    pub const fn new() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: MXCSR_INIT,
            fcw: FCW_INIT,
            _pad: 0,
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
        // 16-align the top, then seed the slot `ret` will pop: the first
        // switch-in "returns" into the trampoline with a 16-aligned rsp.
        let top = (stack_top as usize) & !0xf;
        let slot = (top - 8) as *mut u64;
        *slot = context_entry as usize as u64;

        self.rsp = slot as u64;
        self.rbp = 0;
        self.rbx = entry as usize as u64;
        self.r12 = arg as u64;
        self.r13 = self as *mut Context as u64;
        self.r14 = 0;
        self.r15 = 0;
        self.mxcsr = MXCSR_INIT;
        self.fcw = FCW_INIT;
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
        // Save callee-saved state into `from` (rdi). The return address
        // is at [rsp], so saving rsp as-is is enough to resume after the
        // call site.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr [rdi + 0x38]",
        "fnstcw [rdi + 0x3c]",
        // Restore from `to` (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr [rsi + 0x38]",
        "fldcw [rsi + 0x3c]",
        // Fresh context: jumps to the trampoline. Suspended context:
        // returns to just after its `call context_switch`.
        "ret",
    );
}

/// First-entry trampoline. `Context::init` parks the entry function in
/// rbx, its argument in r12 and the owning context's address in r13 (all
/// callee-saved, so they survive the call). On return from the entry
/// function the link cell is re-read and resumed; the save half of the
/// switch targets the now-dead context, which is harmless.
#[unsafe(naked)]
extern "C" fn context_entry() {
    naked_asm!(
        "mov rdi, r12",
        "call rbx",
        "mov rdi, r13",
        "mov rsi, [r13 + 0x40]",
        "jmp {switch}",
        switch = sym context_switch,
    );
}
