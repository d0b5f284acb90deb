//! Building process images: exec-into-new-process and exec-in-place.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::info;

use crate::fs::{self, FsNode, NodeType};
use crate::memory::{AccessKind, AddressSpace, PAGE_SIZE, RegionFlags};
use crate::sched;
use crate::time;

use super::context::RegisterContext;
use super::{elf, Process, Thread};

/// User stack size: 2 MiB, demand-paged with the two trailing pages
/// pre-populated.
pub const USER_STACK_SIZE: usize = 0x20_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    NotFound,
    /// The path does not name a regular file.
    NotFile,
    NotExecutable,
    NoMemory,
    Fault,
    Io,
}

impl ExecError {
    pub fn errno(self) -> isize {
        use opal_abi::errno;
        match self {
            ExecError::NotFound => errno::ENOENT,
            ExecError::NotFile => errno::EACCES,
            ExecError::NotExecutable => errno::ENOEXEC,
            ExecError::NoMemory => errno::ENOMEM,
            ExecError::Fault => errno::EFAULT,
            ExecError::Io => errno::EIO,
        }
    }
}

/// Read the whole executable into a kernel buffer.
fn read_node(node: &Arc<dyn FsNode>) -> Result<Vec<u8>, ExecError> {
    let size = node.size() as usize;
    let mut data = vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = node
            .read(done as u64, &mut data[done..])
            .map_err(|_| ExecError::Io)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    data.truncate(done);
    if data.is_empty() {
        return Err(ExecError::Io);
    }
    Ok(data)
}

/// The initial register state of a loaded image.
struct Image {
    entry: u64,
    rsp: u64,
    argc: u64,
    argv_ptr: u64,
    envp_ptr: u64,
}

/// Load the executable and construct the stack with the argv/envp image.
fn load_image(
    space: &Arc<AddressSpace>,
    data: &[u8],
    argv: &[String],
    envp: &[String],
) -> Result<Image, ExecError> {
    let started = time::uptime_us();
    let entry = elf::load(space, data)?;
    info!("exec: image loaded (took {} us)", time::uptime_us() - started);

    let stack_base = space
        .map_anonymous(
            USER_STACK_SIZE,
            0,
            false,
            RegionFlags::READ | RegionFlags::WRITE,
        )
        .map_err(|_| ExecError::NoMemory)?
        .as_u64();
    let stack_top = stack_base + USER_STACK_SIZE as u64;
    space
        .fault(stack_top - PAGE_SIZE as u64, AccessKind::Write)
        .map_err(|_| ExecError::NoMemory)?;
    space
        .fault(stack_top - 2 * PAGE_SIZE as u64, AccessKind::Write)
        .map_err(|_| ExecError::NoMemory)?;

    // String contents go at the top of the stack, vectors beneath them.
    let mut sp = stack_top;
    let mut write_string = |sp: &mut u64, s: &String| -> Result<u64, ExecError> {
        let bytes = s.as_bytes();
        *sp -= bytes.len() as u64 + 1;
        let mut with_nul = Vec::with_capacity(bytes.len() + 1);
        with_nul.extend_from_slice(bytes);
        with_nul.push(0);
        space
            .copy_to_user(*sp, &with_nul)
            .map_err(|_| ExecError::Fault)?;
        Ok(*sp)
    };

    let mut argv_addrs = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_addrs.push(write_string(&mut sp, arg)?);
    }
    let mut envp_addrs = Vec::with_capacity(envp.len());
    for env in envp {
        envp_addrs.push(write_string(&mut sp, env)?);
    }

    let slots = 1 + argv_addrs.len() + 1 + envp_addrs.len() + 1;
    let mut vectors = Vec::with_capacity(slots);
    vectors.push(argv.len() as u64);
    vectors.extend_from_slice(&argv_addrs);
    vectors.push(0);
    vectors.extend_from_slice(&envp_addrs);
    vectors.push(0);

    let rsp = (sp - (slots * 8) as u64) & !0xf;
    let mut bytes = Vec::with_capacity(slots * 8);
    for value in &vectors {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    space.copy_to_user(rsp, &bytes).map_err(|_| ExecError::Fault)?;

    Ok(Image {
        entry,
        rsp,
        argc: argv.len() as u64,
        argv_ptr: rsp + 8,
        envp_ptr: rsp + 8 + (argv_addrs.len() as u64 + 1) * 8,
    })
}

fn initial_context(image: &Image) -> RegisterContext {
    let mut ctx = RegisterContext::new_user(image.entry, image.rsp);
    ctx.rbp = image.rsp;
    ctx.rdi = image.argc;
    ctx.rsi = image.argv_ptr;
    ctx.rdx = image.envp_ptr;
    ctx
}

/// Load `path` into a fresh process. The process is registered but not
/// started; the caller links parentage, descriptors, and starts it.
pub fn spawn_from_path(
    path: &str,
    cwd: &str,
    argv: &[String],
    envp: &[String],
) -> Result<Arc<Process>, ExecError> {
    let node = fs::resolve_path(path, cwd, true).ok_or(ExecError::NotFound)?;
    if node.node_type() != NodeType::Regular {
        return Err(ExecError::NotFile);
    }
    let data = read_node(&node)?;

    let name = argv
        .first()
        .map(|arg| fs::base_name(arg))
        .unwrap_or_else(|| fs::base_name(path));
    let process = sched::create_process(name, None);
    let space = process.space().ok_or(ExecError::Fault)?;

    match load_image(&space, &data, argv, envp) {
        Ok(image) => {
            process.add_thread(initial_context(&image));
            process.set_working_dir(cwd);
            Ok(process)
        }
        Err(e) => {
            sched::discard_process(process.pid());
            Err(e)
        }
    }
}

/// Replace `process`'s image in place: unmap everything, load the new
/// executable, rebuild the stack, reset the thread's register and FP state,
/// and close `O_CLOEXEC` descriptors.
///
/// After the old image is unmapped a failure leaves nothing to return to;
/// the caller must end the process on error.
pub fn exec_replace(
    process: &Arc<Process>,
    thread: &Arc<Thread>,
    data: &[u8],
    argv: &[String],
    envp: &[String],
) -> Result<(), ExecError> {
    let space = process.space().ok_or(ExecError::Fault)?;
    space.unmap_all();

    let image = load_image(&space, data, argv, envp)?;
    thread.set_context(initial_context(&image));
    thread.reset_fx_state();
    process.fds().close_cloexec();
    Ok(())
}

/// Resolve and read an executable for [`exec_replace`].
pub fn read_executable(path: &str, cwd: &str) -> Result<Vec<u8>, ExecError> {
    let node = fs::resolve_path(path, cwd, true).ok_or(ExecError::NotFound)?;
    if node.node_type() != NodeType::Regular {
        return Err(ExecError::NotFile);
    }
    read_node(&node)
}
