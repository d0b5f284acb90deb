//! The syscall dispatcher.
//!
//! A single entry point dispatches on the syscall number in `rax` through a
//! fixed table. Handlers return a future: most complete immediately, and a
//! `Pending` future is stored on the calling thread, which blocks until a
//! blocker fires and [`crate::sched::service_thread`] re-polls it. The
//! signed result lands back in the saved `rax`.

mod file;
mod info;
mod ipc;
mod memory;
mod process;
mod socket;
pub(crate) mod user_ptr;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use log::{debug, error};

use opal_abi::errno::ENOSYS;
use opal_abi::syscalls::NUM_SYSCALLS;

use crate::platform;
use crate::process::RegisterContext;
use crate::sched;

/// A boxed syscall future. The output is the signed usermode result.
pub type SyscallFuture = Pin<Box<dyn Future<Output = isize> + Send>>;

type SyscallFn = fn(&RegisterContext) -> SyscallFuture;

/// What the trap glue should do after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The result is in the saved `rax`; resume the caller.
    Completed(isize),
    /// The thread blocked; switch to another thread.
    Parked,
}

/// An immediately ready result.
pub(crate) fn done(result: isize) -> SyscallFuture {
    Box::pin(core::future::ready(result))
}

/// The calling process. Only valid within a syscall.
pub(crate) fn current() -> Arc<crate::process::Process> {
    // Invariant: the glue installs a current thread before dispatching.
    sched::current_process().expect("syscall with no current process")
}

/// The caller's address space, or `-EFAULT` once the process has ended.
pub(crate) fn current_space(
    proc: &Arc<crate::process::Process>,
) -> Result<Arc<crate::memory::AddressSpace>, isize> {
    proc.space().ok_or(-opal_abi::errno::EFAULT)
}

macro_rules! try_sys {
    ($e:expr) => {
        match $e {
            Ok(value) => value,
            Err(errno) => return $crate::syscall::done(errno),
        }
    };
}
pub(crate) use try_sys;

fn sys_unimplemented(_regs: &RegisterContext) -> SyscallFuture {
    done(-ENOSYS)
}

/// Syscall numbers 1–98 are assigned and stable; 0 is the debug log.
/// Slots for facilities owned by external collaborators (framebuffer, PTY,
/// device manager, kernel modules) are wired to stubs so the numbering
/// never shifts.
static SYSCALL_TABLE: [Option<SyscallFn>; NUM_SYSCALLS] = [
    Some(info::sys_debug),
    Some(process::sys_exit),                 // 1
    Some(process::sys_exec),
    Some(file::sys_read),
    Some(file::sys_write),
    Some(file::sys_open),                    // 5
    Some(file::sys_close),
    Some(process::sys_sleep),
    Some(sys_unimplemented),                 // create
    Some(file::sys_link),
    Some(file::sys_unlink),                  // 10
    Some(process::sys_execve),
    Some(process::sys_chdir),
    Some(info::sys_time),
    Some(sys_unimplemented),                 // map_fb
    None,                                    // 15
    Some(file::sys_chmod),
    Some(file::sys_fstat),
    Some(file::sys_stat),
    Some(file::sys_lseek),
    Some(process::sys_getpid),               // 20
    Some(file::sys_mount),
    Some(file::sys_mkdir),
    Some(file::sys_rmdir),
    Some(file::sys_rename),
    Some(process::sys_yield),                // 25
    Some(file::sys_readdir_next),
    Some(sys_unimplemented),                 // rename_at
    Some(sys_unimplemented),                 // send_message
    Some(sys_unimplemented),                 // receive_message
    Some(info::sys_uptime),                  // 30
    Some(sys_unimplemented),                 // get_video_mode
    Some(info::sys_uname),
    Some(file::sys_readdir),
    Some(process::sys_set_fs_base),
    Some(memory::sys_mmap),                  // 35
    Some(sys_unimplemented),                 // grant_pty
    Some(process::sys_get_cwd),
    Some(process::sys_waitpid),
    Some(process::sys_nanosleep),
    Some(file::sys_pread),                   // 40
    Some(file::sys_pwrite),
    Some(file::sys_ioctl),
    Some(info::sys_info),
    Some(memory::sys_munmap),
    Some(memory::sys_create_shared_memory),  // 45
    Some(memory::sys_map_shared_memory),
    Some(memory::sys_unmap_shared_memory),
    Some(memory::sys_destroy_shared_memory),
    Some(socket::sys_socket),
    Some(socket::sys_bind),                  // 50
    Some(socket::sys_listen),
    Some(socket::sys_accept),
    Some(socket::sys_connect),
    Some(socket::sys_send),
    Some(socket::sys_sendto),                // 55
    Some(socket::sys_recv),
    Some(socket::sys_recvfrom),
    Some(process::sys_getuid),
    Some(process::sys_setuid),
    Some(file::sys_poll),                    // 60
    Some(socket::sys_sendmsg),
    Some(socket::sys_recvmsg),
    Some(process::sys_geteuid),
    Some(process::sys_seteuid),
    Some(process::sys_get_process_info),     // 65
    Some(process::sys_get_next_process_info),
    Some(file::sys_readlink),
    Some(process::sys_spawn_thread),
    Some(process::sys_exit_thread),
    Some(process::sys_futex_wake),           // 70
    Some(process::sys_futex_wait),
    Some(file::sys_dup),
    Some(file::sys_get_file_status_flags),
    Some(file::sys_set_file_status_flags),
    Some(file::sys_select),                  // 75
    Some(ipc::sys_create_service),
    Some(ipc::sys_create_interface),
    Some(ipc::sys_interface_accept),
    Some(ipc::sys_interface_connect),
    Some(ipc::sys_endpoint_queue),           // 80
    Some(ipc::sys_endpoint_dequeue),
    Some(ipc::sys_endpoint_call),
    Some(ipc::sys_endpoint_info),
    Some(ipc::sys_kernel_object_wait_one),
    Some(ipc::sys_kernel_object_wait),       // 85
    Some(ipc::sys_kernel_object_destroy),
    Some(socket::sys_set_socket_options),
    Some(socket::sys_get_socket_options),
    Some(sys_unimplemented),                 // device_management
    Some(process::sys_interrupt_thread),     // 90
    Some(process::sys_load_kernel_module),
    Some(process::sys_unload_kernel_module),
    Some(process::sys_fork),
    Some(process::sys_getgid),
    Some(process::sys_getegid),              // 95
    Some(process::sys_getppid),
    Some(file::sys_pipe),
    Some(info::sys_get_entropy),
];

/// Dispatch the syscall described by the saved register context.
///
/// Unknown numbers fail with `ENOSYS`. External interrupts are re-enabled
/// before the handler runs, so a thread in a syscall can be preempted. The
/// handler's future is polled once; if it is not ready the thread parks and
/// the caller must switch away.
pub fn dispatch(regs: &mut RegisterContext) -> Disposition {
    let number = regs.rax as usize;
    let handler = match SYSCALL_TABLE.get(number).copied().flatten() {
        Some(handler) => handler,
        None => {
            error!("syscall: unknown number {number}");
            regs.rax = (-ENOSYS) as u64;
            return Disposition::Completed(-ENOSYS);
        }
    };

    platform::get().enable_interrupts();

    debug!(
        "syscall {number}: args {:#x} {:#x} {:#x} {:#x}",
        regs.arg0(),
        regs.arg1(),
        regs.arg2(),
        regs.arg3()
    );

    let thread = sched::current_thread().expect("syscall with no current thread");
    thread.set_context(*regs);

    let mut future = handler(regs);
    let waker = sched::noop_waker();
    let mut cx = Context::from_waker(&waker);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(result) => {
            thread.with_context(|ctx| ctx.rax = result as u64);
            *regs = thread.context();
            Disposition::Completed(result)
        }
        Poll::Pending => {
            thread.set_pending_syscall(future);
            sched::mark_current_blocked();
            Disposition::Parked
        }
    }
}
