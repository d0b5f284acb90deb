//! Socket syscalls.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::warn;

use opal_abi::errno::{EBADF, EINVAL, ENOPROTOOPT, ENOTSOCK};
use opal_abi::fcntl::OpenFlags;
use opal_abi::socket::{
    IoVec, MsgHdr, SockAddrIn, IPPROTO_IP, IP_PKTINFO, MSG_DONTWAIT, SOCK_NONBLOCK, SOL_SOCKET,
    SO_ERROR, SO_TYPE,
};
use zerocopy::byteorder::network_endian::{U16, U32};

use crate::fs::FsNode;
use crate::net::{Ipv4Address, Socket, SocketError};
use crate::process::FileDescriptor;

use super::file::wait_socket_event;
use super::user_ptr::{read_bytes, read_struct, write_bytes, write_struct};
use super::{current, current_space, done, try_sys, RegisterContext, SyscallFuture};

/// Largest socket address record we copy in.
const MAX_ADDR_LEN: usize = 110;

fn socket_of(
    proc: &Arc<crate::process::Process>,
    fd: usize,
) -> Result<(Arc<Socket>, bool), isize> {
    let descriptor = proc.fds().get(fd).cloned().ok_or(-EBADF)?;
    let socket = descriptor.node.as_socket().ok_or(-ENOTSOCK)?.arc();
    Ok((socket, descriptor.is_nonblocking()))
}

pub(super) fn sys_socket(regs: &RegisterContext) -> SyscallFuture {
    let domain = regs.arg0() as i32;
    let sock_type = regs.arg1() as i32;
    let protocol = regs.arg2() as i32;

    let socket = match Socket::create(domain, sock_type, protocol) {
        Ok(socket) => socket,
        Err(e) => return done(-e.errno()),
    };
    let mut mode = 0;
    if sock_type & SOCK_NONBLOCK != 0 {
        mode |= OpenFlags::NONBLOCK.bits();
    }
    let proc = current();
    let fd = proc.fds().allocate(FileDescriptor::open(socket, mode));
    done(fd as isize)
}

pub(super) fn sys_bind(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let (socket, _) = match socket_of(&proc, regs.arg0() as usize) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("bind: descriptor {} is not a socket", regs.arg0());
            return done(e);
        }
    };
    let len = (regs.arg2() as usize).min(MAX_ADDR_LEN);
    let addr = try_sys!(read_bytes(&space, regs.arg1(), len));
    match socket.bind(&addr) {
        Ok(()) => done(0),
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_listen(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let (socket, _) = match socket_of(&proc, regs.arg0() as usize) {
        Ok(pair) => pair,
        Err(e) => return done(e),
    };
    match socket.listen(regs.arg1() as i32) {
        Ok(()) => done(0),
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_accept(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    Box::pin(async move {
        let proc = current();
        let (socket, nonblock) = match socket_of(&proc, fd) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        loop {
            match socket.accept() {
                Ok(Some(child)) => {
                    let descriptor = FileDescriptor::open(child, 0);
                    return proc.fds().allocate(descriptor) as isize;
                }
                Ok(None) => {
                    if nonblock {
                        return -opal_abi::errno::EAGAIN;
                    }
                    let probe = socket.clone();
                    if let Err(e) =
                        wait_socket_event(&socket, 0, move || probe.pending_connections() > 0)
                            .await
                    {
                        return e;
                    }
                }
                Err(e) => return -e.errno(),
            }
        }
    })
}

pub(super) fn sys_connect(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let (socket, _) = match socket_of(&proc, regs.arg0() as usize) {
        Ok(pair) => pair,
        Err(e) => return done(e),
    };
    let len = (regs.arg2() as usize).min(MAX_ADDR_LEN);
    let addr = try_sys!(read_bytes(&space, regs.arg1(), len));
    match socket.connect(&addr) {
        Ok(()) => done(0),
        Err(e) => done(-e.errno()),
    }
}

/// Shared send path; parks on backpressure unless the caller asked not to
/// wait.
async fn send_blocking(
    socket: Arc<Socket>,
    data: Vec<u8>,
    flags: i32,
    nonblock: bool,
    addr: Option<Vec<u8>>,
) -> isize {
    let dontwait = nonblock || flags & MSG_DONTWAIT != 0;
    loop {
        let result = match &addr {
            Some(addr) => socket.sendto(&data, flags, Some(addr)),
            None => socket.send(&data, flags),
        };
        match result {
            Ok(n) => return n as isize,
            Err(SocketError::WouldBlock) if !dontwait => {
                let probe = socket.clone();
                if let Err(e) = wait_socket_event(&socket, 0, move || {
                    probe.can_write() || !probe.is_connected()
                })
                .await
                {
                    return e;
                }
            }
            Err(e) => return -e.errno(),
        }
    }
}

/// Shared receive path; parks while the queue is empty.
async fn recv_blocking(
    socket: Arc<Socket>,
    len: usize,
    flags: i32,
    nonblock: bool,
) -> Result<(Vec<u8>, Option<(Ipv4Address, u16)>), isize> {
    let dontwait = nonblock || flags & MSG_DONTWAIT != 0;
    loop {
        let mut buf = alloc::vec![0u8; len];
        match socket.recvfrom(&mut buf, flags) {
            Ok((n, source)) => {
                buf.truncate(n);
                return Ok((buf, source));
            }
            Err(SocketError::WouldBlock) if !dontwait => {
                let probe = socket.clone();
                wait_socket_event(&socket, 0, move || probe.can_read()).await?;
            }
            Err(e) => return Err(-e.errno()),
        }
    }
}

fn write_source_addr(
    space: &crate::memory::AddressSpace,
    addr_ptr: u64,
    addrlen_ptr: u64,
    source: (Ipv4Address, u16),
) -> Result<(), isize> {
    if addr_ptr == 0 || addrlen_ptr == 0 {
        return Ok(());
    }
    let addrlen: u32 = read_struct(space, addrlen_ptr)?;
    let record = SockAddrIn {
        sin_family: opal_abi::socket::AF_INET as u16,
        sin_port: U16::new(source.1),
        sin_addr: U32::new(source.0.to_u32()),
        sin_zero: [0; 8],
    };
    let bytes = zerocopy::IntoBytes::as_bytes(&record);
    let n = bytes.len().min(addrlen as usize);
    write_bytes(space, addr_ptr, &bytes[..n])?;
    write_struct(space, addrlen_ptr, &(bytes.len() as u32))?;
    Ok(())
}

pub(super) fn sys_send(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    let buf = regs.arg1();
    let len = regs.arg2() as usize;
    let flags = regs.arg3() as i32;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let (socket, nonblock) = match socket_of(&proc, fd) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        let data = match read_bytes(&space, buf, len) {
            Ok(data) => data,
            Err(e) => return e,
        };
        send_blocking(socket, data, flags, nonblock, None).await
    })
}

pub(super) fn sys_sendto(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    let buf = regs.arg1();
    let len = regs.arg2() as usize;
    let flags = regs.arg3() as i32;
    let addr_ptr = regs.arg4();
    let addr_len = regs.arg5() as usize;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let (socket, nonblock) = match socket_of(&proc, fd) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        let data = match read_bytes(&space, buf, len) {
            Ok(data) => data,
            Err(e) => return e,
        };
        let addr = if addr_ptr != 0 {
            if addr_len < core::mem::size_of::<SockAddrIn>()
                && socket.domain() == opal_abi::socket::AF_INET
            {
                warn!("sendto: address record too short");
                return -EINVAL;
            }
            match read_bytes(&space, addr_ptr, addr_len.min(MAX_ADDR_LEN)) {
                Ok(addr) => Some(addr),
                Err(e) => return e,
            }
        } else {
            None
        };
        send_blocking(socket, data, flags, nonblock, addr).await
    })
}

pub(super) fn sys_recv(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    let buf = regs.arg1();
    let len = regs.arg2() as usize;
    let flags = regs.arg3() as i32;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let (socket, nonblock) = match socket_of(&proc, fd) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        match recv_blocking(socket, len, flags, nonblock).await {
            Ok((data, _)) => {
                if let Err(e) = write_bytes(&space, buf, &data) {
                    return e;
                }
                data.len() as isize
            }
            Err(e) => e,
        }
    })
}

pub(super) fn sys_recvfrom(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    let buf = regs.arg1();
    let len = regs.arg2() as usize;
    let flags = regs.arg3() as i32;
    let addr_ptr = regs.arg4();
    let addrlen_ptr = regs.arg5();
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let (socket, nonblock) = match socket_of(&proc, fd) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        match recv_blocking(socket, len, flags, nonblock).await {
            Ok((data, source)) => {
                if let Err(e) = write_bytes(&space, buf, &data) {
                    return e;
                }
                if let Some(source) = source {
                    if let Err(e) = write_source_addr(&space, addr_ptr, addrlen_ptr, source) {
                        return e;
                    }
                }
                data.len() as isize
            }
            Err(e) => e,
        }
    })
}

/// `sendmsg` iterates the iovec; a negative element result aborts the call
/// with that value, never a partial count.
pub(super) fn sys_sendmsg(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    let msg_ptr = regs.arg1();
    let flags = regs.arg3() as i32;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let (socket, nonblock) = match socket_of(&proc, fd) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        let msg: MsgHdr = match read_struct(&space, msg_ptr) {
            Ok(msg) => msg,
            Err(e) => return e,
        };
        let addr = if msg.msg_name != 0 && msg.msg_namelen != 0 {
            match read_bytes(
                &space,
                msg.msg_name,
                (msg.msg_namelen as usize).min(MAX_ADDR_LEN),
            ) {
                Ok(addr) => Some(addr),
                Err(e) => return e,
            }
        } else {
            None
        };

        let mut sent = 0isize;
        for index in 0..msg.msg_iovlen {
            let entry: IoVec = match read_struct(&space, msg.msg_iov + index * 16) {
                Ok(entry) => entry,
                Err(e) => return e,
            };
            let data = match read_bytes(&space, entry.iov_base, entry.iov_len as usize) {
                Ok(data) => data,
                Err(e) => return e,
            };
            let result =
                send_blocking(socket.clone(), data, flags, nonblock, addr.clone()).await;
            if result < 0 {
                return result;
            }
            sent += result;
        }
        sent
    })
}

pub(super) fn sys_recvmsg(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    let msg_ptr = regs.arg1();
    let flags = regs.arg3() as i32;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let (socket, nonblock) = match socket_of(&proc, fd) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        let mut msg: MsgHdr = match read_struct(&space, msg_ptr) {
            Ok(msg) => msg,
            Err(e) => return e,
        };

        let mut received = 0isize;
        for index in 0..msg.msg_iovlen {
            let entry: IoVec = match read_struct(&space, msg.msg_iov + index * 16) {
                Ok(entry) => entry,
                Err(e) => return e,
            };
            let (data, source) =
                match recv_blocking(socket.clone(), entry.iov_len as usize, flags, nonblock)
                    .await
                {
                    Ok(result) => result,
                    Err(e) => return e,
                };
            if let Err(e) = write_bytes(&space, entry.iov_base, &data) {
                return e;
            }
            if let Some(source) = source {
                if msg.msg_name != 0 {
                    if let Err(e) =
                        write_source_addr(&space, msg.msg_name, msg_ptr + 8, source)
                    {
                        return e;
                    }
                    msg.msg_namelen = core::mem::size_of::<SockAddrIn>() as u32;
                }
            }
            received += data.len() as isize;
        }
        if let Err(e) = write_struct(&space, msg_ptr, &msg) {
            return e;
        }
        received
    })
}

pub(super) fn sys_set_socket_options(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let (_, _) = match socket_of(&proc, regs.arg0() as usize) {
        Ok(pair) => pair,
        Err(e) => return done(e),
    };
    let level = regs.arg1() as i32;
    let opt = regs.arg2() as i32;
    match (level, opt) {
        (IPPROTO_IP, IP_PKTINFO) => done(0),
        _ => done(-ENOPROTOOPT),
    }
}

pub(super) fn sys_get_socket_options(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let (socket, _) = match socket_of(&proc, regs.arg0() as usize) {
        Ok(pair) => pair,
        Err(e) => return done(e),
    };
    let level = regs.arg1() as i32;
    let opt = regs.arg2() as i32;
    let optval = regs.arg3();
    let optlen_ptr = regs.arg4();

    let value: i32 = match (level, opt) {
        (SOL_SOCKET, SO_TYPE) => socket.sock_type(),
        (SOL_SOCKET, SO_ERROR) => 0,
        _ => return done(-ENOPROTOOPT),
    };
    try_sys!(write_struct(&space, optval, &value));
    if optlen_ptr != 0 {
        try_sys!(write_struct(&space, optlen_ptr, &4u32));
    }
    done(0)
}
