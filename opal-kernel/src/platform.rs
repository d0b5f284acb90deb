//! Platform hooks supplied by the embedding kernel.
//!
//! The trap glue, SMP bring-up, and interrupt controller live outside this
//! crate. The hooks here are the few call-outs the core needs in the other
//! direction.

use spinning_top::RwSpinlock;

pub trait Platform: Send + Sync {
    /// Index of the CPU the caller is running on.
    fn cpu_id(&self) -> usize {
        0
    }

    /// Number of CPUs dispatching threads.
    fn cpu_count(&self) -> usize {
        1
    }

    /// Enable external interrupts. Called by the syscall dispatcher before a
    /// handler runs so syscalls are preemptible.
    fn enable_interrupts(&self) {}

    fn disable_interrupts(&self) {}

    /// A seed for the entropy pool, mixed with the clock.
    fn entropy_seed(&self) -> u64 {
        0
    }
}

struct NullPlatform;

impl Platform for NullPlatform {}

static NULL: NullPlatform = NullPlatform;

static PLATFORM: RwSpinlock<Option<&'static dyn Platform>> = RwSpinlock::new(None);

pub fn init(platform: &'static dyn Platform) {
    *PLATFORM.write() = Some(platform);
}

pub(crate) fn get() -> &'static dyn Platform {
    (*PLATFORM.read()).unwrap_or(&NULL)
}

pub(crate) fn cpu_id() -> usize {
    get().cpu_id()
}

pub(crate) fn cpu_count() -> usize {
    get().cpu_count()
}
