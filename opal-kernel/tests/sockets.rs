//! Socket scenarios: UDP over the loopback transport and local stream
//! sockets.

mod common;

use common::{inet_addr, unix_addr};

use opal_abi::errno::{EADDRINUSE, EAGAIN, EPIPE};
use opal_abi::socket::{AF_INET, AF_UNIX, SOCK_DGRAM, SOCK_NONBLOCK, SOCK_STREAM, SOL_SOCKET, SO_TYPE};
use opal_abi::syscalls::*;

use opal_kernel::fs::FsNode;
use opal_kernel::net::SocketKind;
use opal_kernel::syscall::Disposition;
use opal_kernel::testing::{
    fixture, resume, spawn_process, sys, sys_ok, ualloc, uread, ustr, uwrite,
};

fn udp_socket(proc: &std::sync::Arc<opal_kernel::process::Process>, thread: &std::sync::Arc<opal_kernel::process::Thread>) -> u64 {
    sys_ok(proc, thread, SYS_SOCKET, [AF_INET as u64, SOCK_DGRAM as u64, 0, 0, 0, 0]) as u64
}

/// The local port a UDP socket fd ended up with.
fn local_port(proc: &std::sync::Arc<opal_kernel::process::Process>, fd: u64) -> u16 {
    let node = proc.fds().get(fd as usize).expect("socket fd").node.clone();
    let socket = node.as_socket().expect("socket node");
    match socket.kind() {
        SocketKind::Udp(udp) => udp.local_port(),
        _ => panic!("not a UDP socket"),
    }
}

#[test]
fn ephemeral_udp_echo_reports_the_allocated_source_port() {
    let _fx = fixture();
    let (a, at) = spawn_process("a");
    let (b, bt) = spawn_process("b");

    // B binds an explicit port; A stays unbound until its first send.
    let b_fd = udp_socket(&b, &bt);
    let b_addr = ualloc(&b, 16);
    uwrite(&b, b_addr, &inet_addr(7777));
    assert_eq!(sys_ok(&b, &bt, SYS_BIND, [b_fd, b_addr, 16, 0, 0, 0]), 0);

    let a_fd = udp_socket(&a, &at);
    let dest = ualloc(&a, 16);
    uwrite(&a, dest, &inet_addr(7777));
    let payload = ustr(&a, "hi");
    assert_eq!(
        sys_ok(&a, &at, SYS_SENDTO, [a_fd, payload, 2, 0, dest, 16]),
        2
    );
    let a_port = local_port(&a, a_fd);
    assert!(a_port >= 49152);

    // B receives the datagram with A's source address and port.
    let buf = ualloc(&b, 16);
    let src = ualloc(&b, 16);
    let srclen = ualloc(&b, 4);
    uwrite(&b, srclen, &16u32.to_le_bytes());
    let n = sys_ok(&b, &bt, SYS_RECVFROM, [b_fd, buf, 16, 0, src, srclen]);
    assert_eq!(n, 2);
    assert_eq!(uread(&b, buf, 2), b"hi");

    let addr = uread(&b, src, 8);
    assert_eq!(u16::from_ne_bytes(addr[0..2].try_into().unwrap()), AF_INET as u16);
    assert_eq!(u16::from_be_bytes(addr[2..4].try_into().unwrap()), a_port);
    assert_eq!(&addr[4..8], &[127, 0, 0, 1]);
}

#[test]
fn udp_ports_are_exclusive() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    let first = udp_socket(&proc, &thread);
    let second = udp_socket(&proc, &thread);
    let addr = ualloc(&proc, 16);
    uwrite(&proc, addr, &inet_addr(9000));
    assert_eq!(sys_ok(&proc, &thread, SYS_BIND, [first, addr, 16, 0, 0, 0]), 0);
    assert_eq!(
        sys_ok(&proc, &thread, SYS_BIND, [second, addr, 16, 0, 0, 0]),
        -EADDRINUSE
    );
}

#[test]
fn udp_recvfrom_blocks_until_a_packet_arrives() {
    let _fx = fixture();
    let (a, at) = spawn_process("a");
    let (b, bt) = spawn_process("b");

    let b_fd = udp_socket(&b, &bt);
    let b_addr = ualloc(&b, 16);
    uwrite(&b, b_addr, &inet_addr(5555));
    assert_eq!(sys_ok(&b, &bt, SYS_BIND, [b_fd, b_addr, 16, 0, 0, 0]), 0);

    let buf = ualloc(&b, 16);
    let disposition = sys(&b, &bt, SYS_RECVFROM, [b_fd, buf, 16, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);

    let a_fd = udp_socket(&a, &at);
    let dest = ualloc(&a, 16);
    uwrite(&a, dest, &inet_addr(5555));
    let payload = ustr(&a, "wake");
    assert_eq!(
        sys_ok(&a, &at, SYS_SENDTO, [a_fd, payload, 4, 0, dest, 16]),
        4
    );

    assert_eq!(resume(&b, &bt), Some(4));
    assert_eq!(uread(&b, buf, 4), b"wake");
}

#[test]
fn local_stream_sockets_connect_and_exchange_data() {
    let _fx = fixture();
    let (server, st) = spawn_process("server");
    let (client, ct) = spawn_process("client");

    let listen_fd = sys_ok(
        &server,
        &st,
        SYS_SOCKET,
        [AF_UNIX as u64, SOCK_STREAM as u64, 0, 0, 0, 0],
    ) as u64;
    let addr = ualloc(&server, 110);
    uwrite(&server, addr, &unix_addr("/tmp/sock"));
    assert_eq!(sys_ok(&server, &st, SYS_BIND, [listen_fd, addr, 110, 0, 0, 0]), 0);
    assert_eq!(sys_ok(&server, &st, SYS_LISTEN, [listen_fd, 8, 0, 0, 0, 0]), 0);

    let client_fd = sys_ok(
        &client,
        &ct,
        SYS_SOCKET,
        [AF_UNIX as u64, SOCK_STREAM as u64, 0, 0, 0, 0],
    ) as u64;
    let caddr = ualloc(&client, 110);
    uwrite(&client, caddr, &unix_addr("/tmp/sock"));
    assert_eq!(sys_ok(&client, &ct, SYS_CONNECT, [client_fd, caddr, 110, 0, 0, 0]), 0);

    let conn_fd = sys_ok(&server, &st, SYS_ACCEPT, [listen_fd, 0, 0, 0, 0, 0]) as u64;

    // Client sends; server receives.
    let hello = ustr(&client, "hello");
    assert_eq!(sys_ok(&client, &ct, SYS_SEND, [client_fd, hello, 5, 0, 0, 0]), 5);
    let buf = ualloc(&server, 16);
    assert_eq!(sys_ok(&server, &st, SYS_RECV, [conn_fd, buf, 16, 0, 0, 0]), 5);
    assert_eq!(uread(&server, buf, 5), b"hello");

    // A blocked receive wakes when the peer writes.
    let disposition = sys(&server, &st, SYS_RECV, [conn_fd, buf, 16, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);
    let more = ustr(&client, "more");
    assert_eq!(sys_ok(&client, &ct, SYS_SEND, [client_fd, more, 4, 0, 0, 0]), 4);
    assert_eq!(resume(&server, &st), Some(4));

    // Closing the client side: reads drain to EOF, writes break.
    assert_eq!(sys_ok(&client, &ct, SYS_CLOSE, [client_fd, 0, 0, 0, 0, 0]), 0);
    assert_eq!(sys_ok(&server, &st, SYS_RECV, [conn_fd, buf, 16, 0, 0, 0]), 0);
    let bye = ustr(&server, "bye");
    assert_eq!(
        sys_ok(&server, &st, SYS_SEND, [conn_fd, bye, 3, 0, 0, 0]),
        -EPIPE
    );
}

#[test]
fn nonblocking_accept_reports_eagain() {
    let _fx = fixture();
    let (server, st) = spawn_process("server");

    let fd = sys_ok(
        &server,
        &st,
        SYS_SOCKET,
        [AF_UNIX as u64, (SOCK_STREAM | SOCK_NONBLOCK) as u64, 0, 0, 0, 0],
    ) as u64;
    let addr = ualloc(&server, 110);
    uwrite(&server, addr, &unix_addr("/tmp/nb"));
    assert_eq!(sys_ok(&server, &st, SYS_BIND, [fd, addr, 110, 0, 0, 0]), 0);
    assert_eq!(sys_ok(&server, &st, SYS_LISTEN, [fd, 8, 0, 0, 0, 0]), 0);
    assert_eq!(sys_ok(&server, &st, SYS_ACCEPT, [fd, 0, 0, 0, 0, 0]), -EAGAIN);
}

#[test]
fn getsockopt_reports_the_socket_type() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");
    let fd = udp_socket(&proc, &thread);

    let value = ualloc(&proc, 4);
    let len = ualloc(&proc, 4);
    assert_eq!(
        sys_ok(
            &proc,
            &thread,
            SYS_GET_SOCKET_OPTIONS,
            [fd, SOL_SOCKET as u64, SO_TYPE as u64, value, len, 0],
        ),
        0
    );
    assert_eq!(
        i32::from_le_bytes(uread(&proc, value, 4).try_into().unwrap()),
        SOCK_DGRAM
    );
}
