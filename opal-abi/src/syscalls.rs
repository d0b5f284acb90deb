//! Syscall numbers.
//!
//! Numbers 1–98 are assigned and stable; 0 is the debug log. Unassigned or
//! retired slots keep their numbers and fail with `ENOSYS`.

pub const SYS_DEBUG: usize = 0;
pub const SYS_EXIT: usize = 1;
pub const SYS_EXEC: usize = 2;
pub const SYS_READ: usize = 3;
pub const SYS_WRITE: usize = 4;
pub const SYS_OPEN: usize = 5;
pub const SYS_CLOSE: usize = 6;
pub const SYS_SLEEP: usize = 7;
pub const SYS_CREATE: usize = 8;
pub const SYS_LINK: usize = 9;
pub const SYS_UNLINK: usize = 10;
pub const SYS_EXECVE: usize = 11;
pub const SYS_CHDIR: usize = 12;
pub const SYS_TIME: usize = 13;
pub const SYS_MAP_FB: usize = 14;
pub const SYS_CHMOD: usize = 16;
pub const SYS_FSTAT: usize = 17;
pub const SYS_STAT: usize = 18;
pub const SYS_LSEEK: usize = 19;
pub const SYS_GETPID: usize = 20;
pub const SYS_MOUNT: usize = 21;
pub const SYS_MKDIR: usize = 22;
pub const SYS_RMDIR: usize = 23;
pub const SYS_RENAME: usize = 24;
pub const SYS_YIELD: usize = 25;
pub const SYS_READDIR_NEXT: usize = 26;
pub const SYS_RENAME_AT: usize = 27;
pub const SYS_SEND_MESSAGE: usize = 28;
pub const SYS_RECEIVE_MESSAGE: usize = 29;
pub const SYS_UPTIME: usize = 30;
pub const SYS_GET_VIDEO_MODE: usize = 31;
pub const SYS_UNAME: usize = 32;
pub const SYS_READDIR: usize = 33;
pub const SYS_SET_FS_BASE: usize = 34;
pub const SYS_MMAP: usize = 35;
pub const SYS_GRANT_PTY: usize = 36;
pub const SYS_GET_CWD: usize = 37;
pub const SYS_WAITPID: usize = 38;
pub const SYS_NANOSLEEP: usize = 39;
pub const SYS_PREAD: usize = 40;
pub const SYS_PWRITE: usize = 41;
pub const SYS_IOCTL: usize = 42;
pub const SYS_INFO: usize = 43;
pub const SYS_MUNMAP: usize = 44;
pub const SYS_CREATE_SHARED_MEMORY: usize = 45;
pub const SYS_MAP_SHARED_MEMORY: usize = 46;
pub const SYS_UNMAP_SHARED_MEMORY: usize = 47;
pub const SYS_DESTROY_SHARED_MEMORY: usize = 48;
pub const SYS_SOCKET: usize = 49;
pub const SYS_BIND: usize = 50;
pub const SYS_LISTEN: usize = 51;
pub const SYS_ACCEPT: usize = 52;
pub const SYS_CONNECT: usize = 53;
pub const SYS_SEND: usize = 54;
pub const SYS_SENDTO: usize = 55;
pub const SYS_RECV: usize = 56;
pub const SYS_RECVFROM: usize = 57;
pub const SYS_GETUID: usize = 58;
pub const SYS_SETUID: usize = 59;
pub const SYS_POLL: usize = 60;
pub const SYS_SENDMSG: usize = 61;
pub const SYS_RECVMSG: usize = 62;
pub const SYS_GETEUID: usize = 63;
pub const SYS_SETEUID: usize = 64;
pub const SYS_GET_PROCESS_INFO: usize = 65;
pub const SYS_GET_NEXT_PROCESS_INFO: usize = 66;
pub const SYS_READLINK: usize = 67;
pub const SYS_SPAWN_THREAD: usize = 68;
pub const SYS_EXIT_THREAD: usize = 69;
pub const SYS_FUTEX_WAKE: usize = 70;
pub const SYS_FUTEX_WAIT: usize = 71;
pub const SYS_DUP: usize = 72;
pub const SYS_GET_FILE_STATUS_FLAGS: usize = 73;
pub const SYS_SET_FILE_STATUS_FLAGS: usize = 74;
pub const SYS_SELECT: usize = 75;
pub const SYS_CREATE_SERVICE: usize = 76;
pub const SYS_CREATE_INTERFACE: usize = 77;
pub const SYS_INTERFACE_ACCEPT: usize = 78;
pub const SYS_INTERFACE_CONNECT: usize = 79;
pub const SYS_ENDPOINT_QUEUE: usize = 80;
pub const SYS_ENDPOINT_DEQUEUE: usize = 81;
pub const SYS_ENDPOINT_CALL: usize = 82;
pub const SYS_ENDPOINT_INFO: usize = 83;
pub const SYS_KERNEL_OBJECT_WAIT_ONE: usize = 84;
pub const SYS_KERNEL_OBJECT_WAIT: usize = 85;
pub const SYS_KERNEL_OBJECT_DESTROY: usize = 86;
pub const SYS_SET_SOCKET_OPTIONS: usize = 87;
pub const SYS_GET_SOCKET_OPTIONS: usize = 88;
pub const SYS_DEVICE_MANAGEMENT: usize = 89;
pub const SYS_INTERRUPT_THREAD: usize = 90;
pub const SYS_LOAD_KERNEL_MODULE: usize = 91;
pub const SYS_UNLOAD_KERNEL_MODULE: usize = 92;
pub const SYS_FORK: usize = 93;
pub const SYS_GETGID: usize = 94;
pub const SYS_GETEGID: usize = 95;
pub const SYS_GETPPID: usize = 96;
pub const SYS_PIPE: usize = 97;
pub const SYS_GET_ENTROPY: usize = 98;

pub const NUM_SYSCALLS: usize = 99;
