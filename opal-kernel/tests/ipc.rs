//! IPC scenarios: services, interfaces, endpoints, and kernel-object waits.

mod common;

use opal_abi::errno::{EEXIST, EINTR, EINVAL, EMSGSIZE, ENOENT, ENOTCONN};
use opal_abi::syscalls::*;

use opal_kernel::syscall::Disposition;
use opal_kernel::testing::{
    self, fixture, resume, spawn_process, sys, sys_ok, ualloc, uread, ustr, uwrite,
};

#[test]
fn accept_after_connect_round_trips_a_call() {
    let _fx = fixture();
    let (server, sthread) = spawn_process("server");
    let (client, cthread) = spawn_process("client");

    // Server: create service "svc" with interface "if", max message 64.
    let name = ustr(&server, "svc");
    let svc = sys_ok(&server, &sthread, SYS_CREATE_SERVICE, [name, 0, 0, 0, 0, 0]);
    assert!(svc > 0);
    let ifname = ustr(&server, "if");
    let interface = sys_ok(
        &server,
        &sthread,
        SYS_CREATE_INTERFACE,
        [svc as u64, ifname, 64, 0, 0, 0],
    );
    assert!(interface > 0);

    // Accept with nothing pending returns zero, not an error.
    assert_eq!(
        sys_ok(&server, &sthread, SYS_INTERFACE_ACCEPT, [interface as u64, 0, 0, 0, 0, 0]),
        0
    );

    // Client connects by path.
    let path = ustr(&client, "svc/if");
    let client_ep = sys_ok(&client, &cthread, SYS_INTERFACE_CONNECT, [path, 0, 0, 0, 0, 0]);
    assert!(client_ep > 0);

    // Now the server accepts the pending connection.
    let server_ep = sys_ok(
        &server,
        &sthread,
        SYS_INTERFACE_ACCEPT,
        [interface as u64, 0, 0, 0, 0, 0],
    );
    assert!(server_ep > 0);

    // endpoint_info reports the interface's message size.
    let info = ualloc(&client, 8);
    assert_eq!(
        sys_ok(&client, &cthread, SYS_ENDPOINT_INFO, [client_ep as u64, info, 0, 0, 0, 0]),
        0
    );
    assert_eq!(
        u16::from_le_bytes(uread(&client, info, 2).try_into().unwrap()),
        64
    );

    // Client calls: send id 7, expect a reply with id 8.
    let request = ustr(&client, "req");
    let reply_buf = ualloc(&client, 64);
    let size_ptr = ualloc(&client, 2);
    uwrite(&client, size_ptr, &3u16.to_le_bytes());
    let disposition = sys(
        &client,
        &cthread,
        SYS_ENDPOINT_CALL,
        [client_ep as u64, 7, request, 8, reply_buf, size_ptr],
    );
    assert_eq!(disposition, Disposition::Parked);

    // Server dequeues the request.
    let id_ptr = ualloc(&server, 8);
    let len_ptr = ualloc(&server, 2);
    let data_buf = ualloc(&server, 64);
    assert_eq!(
        sys_ok(
            &server,
            &sthread,
            SYS_ENDPOINT_DEQUEUE,
            [server_ep as u64, id_ptr, len_ptr, data_buf, 0, 0],
        ),
        1
    );
    assert_eq!(
        u64::from_le_bytes(uread(&server, id_ptr, 8).try_into().unwrap()),
        7
    );
    assert_eq!(uread(&server, data_buf, 3), b"req");

    // Server replies with id 8; the parked call completes.
    let reply = ustr(&server, "pong");
    assert_eq!(
        sys_ok(
            &server,
            &sthread,
            SYS_ENDPOINT_QUEUE,
            [server_ep as u64, 8, 4, reply, 0, 0],
        ),
        0
    );
    assert_eq!(resume(&client, &cthread), Some(0));
    assert_eq!(uread(&client, reply_buf, 4), b"pong");
    assert_eq!(
        u16::from_le_bytes(uread(&client, size_ptr, 2).try_into().unwrap()),
        4
    );
}

#[test]
fn messages_stay_fifo_and_calls_do_not_reorder_them() {
    let _fx = fixture();
    let (server, sthread) = spawn_process("server");
    let (client, cthread) = spawn_process("client");

    let name = ustr(&server, "svc");
    let svc = sys_ok(&server, &sthread, SYS_CREATE_SERVICE, [name, 0, 0, 0, 0, 0]);
    let ifname = ustr(&server, "if");
    let interface = sys_ok(
        &server,
        &sthread,
        SYS_CREATE_INTERFACE,
        [svc as u64, ifname, 32, 0, 0, 0],
    );
    let path = ustr(&client, "svc/if");
    let client_ep = sys_ok(&client, &cthread, SYS_INTERFACE_CONNECT, [path, 0, 0, 0, 0, 0]);
    let server_ep = sys_ok(
        &server,
        &sthread,
        SYS_INTERFACE_ACCEPT,
        [interface as u64, 0, 0, 0, 0, 0],
    );

    // Server pushes 1, 2, then the reply 8, then 3.
    let payload = ustr(&server, "m");
    for id in [1u64, 2, 8, 3] {
        assert_eq!(
            sys_ok(
                &server,
                &sthread,
                SYS_ENDPOINT_QUEUE,
                [server_ep as u64, id, 1, payload, 0, 0],
            ),
            0
        );
    }

    // A call expecting id 8 takes only that message.
    let request = ustr(&client, "q");
    let reply_buf = ualloc(&client, 32);
    let size_ptr = ualloc(&client, 2);
    uwrite(&client, size_ptr, &1u16.to_le_bytes());
    assert_eq!(
        sys_ok(
            &client,
            &cthread,
            SYS_ENDPOINT_CALL,
            [client_ep as u64, 9, request, 8, reply_buf, size_ptr],
        ),
        0
    );

    // The remaining messages dequeue in arrival order.
    let id_ptr = ualloc(&client, 8);
    let len_ptr = ualloc(&client, 2);
    let data_buf = ualloc(&client, 32);
    let mut order = Vec::new();
    loop {
        let got = sys_ok(
            &client,
            &cthread,
            SYS_ENDPOINT_DEQUEUE,
            [client_ep as u64, id_ptr, len_ptr, data_buf, 0, 0],
        );
        if got == 0 {
            break;
        }
        order.push(u64::from_le_bytes(uread(&client, id_ptr, 8).try_into().unwrap()));
    }
    assert_eq!(order, [1, 2, 3]);
}

#[test]
fn oversized_messages_and_dead_peers_fail() {
    let _fx = fixture();
    let (server, sthread) = spawn_process("server");
    let (client, cthread) = spawn_process("client");

    let name = ustr(&server, "svc");
    let svc = sys_ok(&server, &sthread, SYS_CREATE_SERVICE, [name, 0, 0, 0, 0, 0]);
    let ifname = ustr(&server, "if");
    let interface = sys_ok(
        &server,
        &sthread,
        SYS_CREATE_INTERFACE,
        [svc as u64, ifname, 8, 0, 0, 0],
    );
    let path = ustr(&client, "svc/if");
    let client_ep = sys_ok(&client, &cthread, SYS_INTERFACE_CONNECT, [path, 0, 0, 0, 0, 0]);
    let server_ep = sys_ok(
        &server,
        &sthread,
        SYS_INTERFACE_ACCEPT,
        [interface as u64, 0, 0, 0, 0, 0],
    );

    let big = ustr(&client, "0123456789");
    assert_eq!(
        sys_ok(
            &client,
            &cthread,
            SYS_ENDPOINT_QUEUE,
            [client_ep as u64, 1, 10, big, 0, 0],
        ),
        -EMSGSIZE
    );

    // Destroying the server end disconnects the client.
    assert_eq!(
        sys_ok(
            &server,
            &sthread,
            SYS_KERNEL_OBJECT_DESTROY,
            [server_ep as u64, 0, 0, 0, 0, 0],
        ),
        0
    );
    let small = ustr(&client, "hi");
    assert_eq!(
        sys_ok(
            &client,
            &cthread,
            SYS_ENDPOINT_QUEUE,
            [client_ep as u64, 1, 2, small, 0, 0],
        ),
        -ENOTCONN
    );
}

#[test]
fn service_names_are_unique_and_paths_need_a_slash() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    let name = ustr(&proc, "svc");
    assert!(sys_ok(&proc, &thread, SYS_CREATE_SERVICE, [name, 0, 0, 0, 0, 0]) > 0);
    assert_eq!(
        sys_ok(&proc, &thread, SYS_CREATE_SERVICE, [name, 0, 0, 0, 0, 0]),
        -EEXIST
    );

    let no_slash = ustr(&proc, "svc");
    assert_eq!(
        sys_ok(&proc, &thread, SYS_INTERFACE_CONNECT, [no_slash, 0, 0, 0, 0, 0]),
        -EINVAL
    );
    let missing = ustr(&proc, "svc/nope");
    assert_eq!(
        sys_ok(&proc, &thread, SYS_INTERFACE_CONNECT, [missing, 0, 0, 0, 0, 0]),
        -ENOENT
    );
}

#[test]
fn destroyed_handles_stop_resolving() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    let name = ustr(&proc, "svc");
    let handle = sys_ok(&proc, &thread, SYS_CREATE_SERVICE, [name, 0, 0, 0, 0, 0]);
    assert_eq!(
        sys_ok(&proc, &thread, SYS_KERNEL_OBJECT_DESTROY, [handle as u64, 0, 0, 0, 0, 0]),
        0
    );
    // Destroying an already-destroyed handle is EINVAL.
    assert_eq!(
        sys_ok(&proc, &thread, SYS_KERNEL_OBJECT_DESTROY, [handle as u64, 0, 0, 0, 0, 0]),
        -EINVAL
    );
    // The id is recycled densely.
    let name2 = ustr(&proc, "svc2");
    assert_eq!(
        sys_ok(&proc, &thread, SYS_CREATE_SERVICE, [name2, 0, 0, 0, 0, 0]),
        handle
    );
}

#[test]
fn wait_one_is_interruptible_by_a_sibling_thread() {
    let _fx = fixture();
    let (server, sthread) = spawn_process("server");
    let (client, cthread) = spawn_process("client");

    let name = ustr(&server, "svc");
    let svc = sys_ok(&server, &sthread, SYS_CREATE_SERVICE, [name, 0, 0, 0, 0, 0]);
    let ifname = ustr(&server, "if");
    let interface = sys_ok(
        &server,
        &sthread,
        SYS_CREATE_INTERFACE,
        [svc as u64, ifname, 64, 0, 0, 0],
    );
    let path = ustr(&client, "svc/if");
    let client_ep = sys_ok(&client, &cthread, SYS_INTERFACE_CONNECT, [path, 0, 0, 0, 0, 0]);
    let _ = interface;

    // T1 parks waiting on the endpoint with no timeout.
    let disposition = sys(
        &client,
        &cthread,
        SYS_KERNEL_OBJECT_WAIT_ONE,
        [client_ep as u64, 0, 0, 0, 0, 0],
    );
    assert_eq!(disposition, Disposition::Parked);

    // T2 interrupts T1; the wait returns EINTR.
    let sibling = testing::add_main_thread(&client);
    assert_eq!(
        sys_ok(&client, &sibling, SYS_INTERRUPT_THREAD, [0, 0, 0, 0, 0, 0]),
        0
    );
    assert_eq!(resume(&client, &cthread), Some(-EINTR));
}

#[test]
fn wait_one_fires_when_a_message_arrives_and_on_timeout() {
    let fx = fixture();
    let (server, sthread) = spawn_process("server");
    let (client, cthread) = spawn_process("client");

    let name = ustr(&server, "svc");
    let svc = sys_ok(&server, &sthread, SYS_CREATE_SERVICE, [name, 0, 0, 0, 0, 0]);
    let ifname = ustr(&server, "if");
    let interface = sys_ok(
        &server,
        &sthread,
        SYS_CREATE_INTERFACE,
        [svc as u64, ifname, 64, 0, 0, 0],
    );
    let path = ustr(&client, "svc/if");
    let client_ep = sys_ok(&client, &cthread, SYS_INTERFACE_CONNECT, [path, 0, 0, 0, 0, 0]);
    let server_ep = sys_ok(
        &server,
        &sthread,
        SYS_INTERFACE_ACCEPT,
        [interface as u64, 0, 0, 0, 0, 0],
    );

    // Timed wait expires with 0.
    let disposition = sys(
        &client,
        &cthread,
        SYS_KERNEL_OBJECT_WAIT_ONE,
        [client_ep as u64, 1_000, 0, 0, 0, 0],
    );
    assert_eq!(disposition, Disposition::Parked);
    fx.clock().advance(2_000);
    assert_eq!(resume(&client, &cthread), Some(0));

    // An infinite wait completes when the peer queues a message.
    let disposition = sys(
        &client,
        &cthread,
        SYS_KERNEL_OBJECT_WAIT_ONE,
        [client_ep as u64, 0, 0, 0, 0, 0],
    );
    assert_eq!(disposition, Disposition::Parked);
    let payload = ustr(&server, "x");
    assert_eq!(
        sys_ok(
            &server,
            &sthread,
            SYS_ENDPOINT_QUEUE,
            [server_ep as u64, 1, 1, payload, 0, 0],
        ),
        0
    );
    assert_eq!(resume(&client, &cthread), Some(0));
}
