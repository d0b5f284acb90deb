//! IPC and kernel-object syscalls.

use alloc::boxed::Box;
use alloc::sync::Arc;

use log::warn;

use opal_abi::errno::{EINTR, EINVAL, ENOTCONN};
use opal_abi::ipc::EndpointInfo;

use crate::handle::HandleId;
use crate::ipc::{
    self, IpcError, EP_EVENT_DISCONNECT, EP_EVENT_MESSAGE, EP_EVENT_SPACE,
};
use crate::object::{KernelObject, Watcher};
use crate::sched::{park_until, Blocker, WaitOutcome};
use crate::time;

use super::user_ptr::{read_bytes, read_string, read_struct, write_bytes, write_struct};
use super::{current, current_space, done, try_sys, RegisterContext, SyscallFuture};

/// Bound on a single multi-object wait.
const MAX_WAIT_OBJECTS: usize = 128;

fn handle_arg(arg: u64) -> Result<HandleId, isize> {
    let value = arg as i64;
    if value <= 0 || value > u32::MAX as i64 {
        return Err(-EINVAL);
    }
    Ok(value as HandleId)
}

fn object_of(
    proc: &Arc<crate::process::Process>,
    arg: u64,
) -> Result<Arc<dyn KernelObject>, isize> {
    let id = handle_arg(arg)?;
    proc.handles().find(id).ok_or(-EINVAL)
}

pub(super) fn sys_create_service(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let name = try_sys!(read_string(&space, regs.arg0()));
    let service = match ipc::create_service(&name) {
        Ok(service) => service,
        Err(e) => return done(-e.errno()),
    };
    let id = proc.handles().register(service);
    done(id as isize)
}

pub(super) fn sys_create_interface(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let object = match object_of(&proc, regs.arg0()) {
        Ok(object) => object,
        Err(e) => {
            warn!("create_interface: invalid handle id {}", regs.arg0());
            return done(e);
        }
    };
    let Some(service) = object.as_service() else {
        warn!("create_interface: handle {} is not a service", regs.arg0());
        return done(-EINVAL);
    };
    let name = try_sys!(read_string(&space, regs.arg1()));
    if regs.arg2() > u16::MAX as u64 {
        return done(-EINVAL);
    }
    let interface = match service.create_interface(&name, regs.arg2() as u16) {
        Ok(interface) => interface,
        Err(e) => return done(-e.errno()),
    };
    let id = proc.handles().register(interface);
    done(id as isize)
}

/// Pop one pending connection. Zero (not an error) when none are pending;
/// blocking is the caller's business via the wait syscalls.
pub(super) fn sys_interface_accept(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let object = match object_of(&proc, regs.arg0()) {
        Ok(object) => object,
        Err(e) => {
            warn!("interface_accept: invalid handle id {}", regs.arg0());
            return done(e);
        }
    };
    let Some(interface) = object.as_interface() else {
        warn!("interface_accept: handle {} is not an interface", regs.arg0());
        return done(-EINVAL);
    };
    match interface.accept() {
        Some(endpoint) => done(proc.handles().register(endpoint) as isize),
        None => done(0),
    }
}

pub(super) fn sys_interface_connect(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    if !path.contains('/') {
        warn!("interface_connect: no interface name in {path}");
        return done(-EINVAL);
    }
    let endpoint = match ipc::connect(&path) {
        Ok(endpoint) => endpoint,
        Err(e) => return done(-e.errno()),
    };
    let handle = proc.handles().register(endpoint);
    done(handle as isize)
}

/// Queue a message on the endpoint's peer, parking while the peer's queue
/// is full.
async fn endpoint_write_blocking(
    object: Arc<dyn KernelObject>,
    id: u64,
    data: alloc::vec::Vec<u8>,
) -> isize {
    loop {
        let Some(endpoint) = object.as_endpoint() else {
            return -EINVAL;
        };
        match endpoint.write(id, &data) {
            Ok(()) => return 0,
            Err(IpcError::WouldBlock) => {
                let Some(peer_list) = endpoint.peer_watch_list() else {
                    return -ENOTCONN;
                };
                let blocker = Blocker::new();
                peer_list.add(&blocker, EP_EVENT_SPACE | EP_EVENT_DISCONNECT);
                let probe = object.clone();
                let outcome = park_until(blocker.clone(), None, move || {
                    let endpoint = probe.as_endpoint()?;
                    match endpoint.peer_has_space() {
                        Ok(true) => Some(Ok(())),
                        Ok(false) => None,
                        Err(e) => Some(Err(-e.errno())),
                    }
                })
                .await;
                peer_list.remove(&blocker);
                match outcome {
                    WaitOutcome::Complete(Ok(())) => continue,
                    WaitOutcome::Complete(Err(e)) => return e,
                    WaitOutcome::Interrupted | WaitOutcome::TimedOut => return -EINTR,
                }
            }
            Err(e) => return -e.errno(),
        }
    }
}

pub(super) fn sys_endpoint_queue(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let object = match object_of(&proc, regs.arg0()) {
        Ok(object) => object,
        Err(e) => {
            warn!(
                "({}): endpoint_queue: invalid handle id {}",
                proc.name(),
                regs.arg0()
            );
            return done(e);
        }
    };
    if object.as_endpoint().is_none() {
        warn!("endpoint_queue: handle {} is not an endpoint", regs.arg0());
        return done(-EINVAL);
    }
    let id = regs.arg1();
    let size = regs.arg2() as usize;
    let data = if size > 0 {
        try_sys!(read_bytes(&space, regs.arg3(), size))
    } else {
        alloc::vec::Vec::new()
    };
    Box::pin(endpoint_write_blocking(object, id, data))
}

/// Dequeue one message: 1 on success, 0 when the queue is empty.
pub(super) fn sys_endpoint_dequeue(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let object = match object_of(&proc, regs.arg0()) {
        Ok(object) => object,
        Err(e) => {
            warn!(
                "({}): endpoint_dequeue: invalid handle id {}",
                proc.name(),
                regs.arg0()
            );
            return done(e);
        }
    };
    let Some(endpoint) = object.as_endpoint() else {
        warn!("endpoint_dequeue: handle {} is not an endpoint", regs.arg0());
        return done(-EINVAL);
    };

    match endpoint.read() {
        Some(message) => {
            try_sys!(write_struct(&space, regs.arg1(), &message.id));
            try_sys!(write_struct(&space, regs.arg2(), &(message.data.len() as u16)));
            try_sys!(write_bytes(&space, regs.arg3(), &message.data));
            done(1)
        }
        None => done(0),
    }
}

/// Synchronous call: queue the request, then wait for the reply message id
/// on the same endpoint. Other messages stay queued in arrival order.
pub(super) fn sys_endpoint_call(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let object = match object_of(&proc, regs.arg0()) {
        Ok(object) => object,
        Err(e) => {
            warn!("endpoint_call: invalid handle id {}", regs.arg0());
            return done(e);
        }
    };
    if object.as_endpoint().is_none() {
        warn!("endpoint_call: handle {} is not an endpoint", regs.arg0());
        return done(-EINVAL);
    }

    let id = regs.arg1();
    let reply_id = regs.arg3();
    let reply_ptr = regs.arg4();
    let size_ptr = regs.arg5();
    let send_size: u16 = try_sys!(read_struct(&space, size_ptr));
    let data = if send_size > 0 {
        try_sys!(read_bytes(&space, regs.arg2(), send_size as usize))
    } else {
        alloc::vec::Vec::new()
    };

    Box::pin(async move {
        let sent = endpoint_write_blocking(object.clone(), id, data).await;
        if sent < 0 {
            return sent;
        }

        let Some(endpoint) = object.as_endpoint() else {
            return -EINVAL;
        };
        let blocker = Blocker::new();
        endpoint
            .watch_list()
            .add(&blocker, EP_EVENT_MESSAGE | EP_EVENT_DISCONNECT);
        let probe = object.clone();
        let outcome = park_until(blocker.clone(), None, move || {
            let endpoint = probe.as_endpoint()?;
            if let Some(message) = endpoint.read_matching(reply_id) {
                return Some(Ok(message));
            }
            if endpoint.is_disconnected() {
                return Some(Err(-ENOTCONN));
            }
            None
        })
        .await;
        if let Some(endpoint) = object.as_endpoint() {
            endpoint.watch_list().remove(&blocker);
        }

        match outcome {
            WaitOutcome::Complete(Ok(message)) => {
                if let Err(e) = write_bytes(&space, reply_ptr, &message.data) {
                    return e;
                }
                if let Err(e) =
                    write_struct(&space, size_ptr, &(message.data.len() as u16))
                {
                    return e;
                }
                0
            }
            WaitOutcome::Complete(Err(e)) => e,
            WaitOutcome::Interrupted | WaitOutcome::TimedOut => -EINTR,
        }
    })
}

pub(super) fn sys_endpoint_info(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let object = match object_of(&proc, regs.arg0()) {
        Ok(object) => object,
        Err(e) => {
            warn!("endpoint_info: invalid handle id {}", regs.arg0());
            return done(e);
        }
    };
    let Some(endpoint) = object.as_endpoint() else {
        warn!("endpoint_info: handle {} is not an endpoint", regs.arg0());
        return done(-EINVAL);
    };
    let info = EndpointInfo {
        msg_size: endpoint.max_message_size(),
    };
    try_sys!(write_struct(&space, regs.arg1(), &info));
    done(0)
}

async fn wait_on_watcher(watcher: Watcher, timeout_us: i64) -> isize {
    let deadline = if timeout_us > 0 {
        Some(time::uptime_us() + timeout_us as u64)
    } else {
        None
    };
    let blocker = watcher.blocker().clone();
    let probe = blocker.clone();
    let outcome = park_until(blocker, deadline, move || probe.has_fired().then_some(())).await;
    match outcome {
        WaitOutcome::Complete(()) | WaitOutcome::TimedOut => 0,
        WaitOutcome::Interrupted => -EINTR,
    }
}

pub(super) fn sys_kernel_object_wait_one(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let object = match object_of(&proc, regs.arg0()) {
        Ok(object) => object,
        Err(e) => {
            warn!("kernel_object_wait_one: invalid handle id {}", regs.arg0());
            return done(e);
        }
    };
    let timeout = regs.arg1() as i64;
    let watcher = Watcher::new();
    watcher.watch_object(&object, 0);
    Box::pin(wait_on_watcher(watcher, timeout))
}

pub(super) fn sys_kernel_object_wait(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let count = regs.arg1() as usize;
    if count > MAX_WAIT_OBJECTS {
        return done(-EINVAL);
    }
    let timeout = regs.arg2() as i64;

    let watcher = Watcher::new();
    for index in 0..count {
        let id: opal_abi::HandleId =
            try_sys!(read_struct(&space, regs.arg0() + (index * 8) as u64));
        let object = match object_of(&proc, id as u64) {
            Ok(object) => object,
            Err(e) => {
                warn!("kernel_object_wait: invalid handle id {id}");
                return done(e);
            }
        };
        watcher.watch_object(&object, 0);
    }
    Box::pin(wait_on_watcher(watcher, timeout))
}

pub(super) fn sys_kernel_object_destroy(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let id = match handle_arg(regs.arg0()) {
        Ok(id) => id,
        Err(e) => return done(e),
    };
    let Some(object) = proc.handles().find(id) else {
        warn!("kernel_object_destroy: invalid handle id {}", regs.arg0());
        return done(-EINVAL);
    };
    object.destroy();
    proc.handles().destroy(id);
    done(0)
}
