//! Saved CPU state for threads.

/// User code/stack selectors (ring 3, as installed by the boot glue's GDT).
pub const USER_CS: u64 = 0x1b;
pub const USER_SS: u64 = 0x23;

/// RFLAGS for a fresh user context: interrupts enabled, reserved bit set.
pub const USER_RFLAGS: u64 = 0x202;

/// The full register file as saved at trap entry. Syscall arguments arrive
/// in `rdi`, `rsi`, `rdx`, `r10`, `r8`, `r9`; the result is returned in
/// `rax`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

impl RegisterContext {
    pub fn new_user(entry: u64, stack: u64) -> RegisterContext {
        RegisterContext {
            rip: entry,
            rsp: stack,
            rflags: USER_RFLAGS,
            cs: USER_CS,
            ss: USER_SS,
            ..Default::default()
        }
    }

    pub fn arg0(&self) -> u64 {
        self.rdi
    }

    pub fn arg1(&self) -> u64 {
        self.rsi
    }

    pub fn arg2(&self) -> u64 {
        self.rdx
    }

    pub fn arg3(&self) -> u64 {
        self.r10
    }

    pub fn arg4(&self) -> u64 {
        self.r8
    }

    pub fn arg5(&self) -> u64 {
        self.r9
    }
}

/// The 512-byte FXSAVE area for a thread's FP/SSE state.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FxState(pub [u8; 512]);

impl FxState {
    /// The architectural default: FCW 0x33f, MXCSR 0x1f80 with the usual
    /// mask. Applied on exec and to fresh threads.
    pub fn reset(&mut self) {
        self.0 = [0; 512];
        self.0[0..2].copy_from_slice(&0x033fu16.to_le_bytes());
        self.0[24..28].copy_from_slice(&0x1f80u32.to_le_bytes());
        self.0[28..32].copy_from_slice(&0xffbfu32.to_le_bytes());
    }
}

impl Default for FxState {
    fn default() -> Self {
        let mut state = FxState([0; 512]);
        state.reset();
        state
    }
}
