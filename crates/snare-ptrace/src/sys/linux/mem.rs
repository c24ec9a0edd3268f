use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::libc::{iovec, process_vm_readv};
use nix::sys::ptrace;
use nix::unistd::Pid;

use super::{Error, Result};

/// Reads memory from the process with the given ID.
pub fn read_process_memory(process_id: u64, addr: u64, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }

    let local_iov = iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let remote_iov = iovec {
        iov_base: addr as *mut _,
        iov_len: buf.len(),
    };

    let len = unsafe {
        Errno::result(process_vm_readv(
            process_id as i32,
            &local_iov as *const _,
            1,
            &remote_iov as *const _,
            1,
            0,
        ))
        .inspect_err(
            |e| tracing::debug!(error = %e, addr = format_args!("{addr:#x}"), "process_vm_readv"),
        )
        .map(|len| len as usize)?
    };

    if len != buf.len() {
        Err(Error::PartialMemOp(len, buf.len()))
    } else {
        Ok(())
    }
}

/// Writes memory into the address space of a stopped thread.
pub fn write_thread_memory(tid: Pid, addr: u64, buf: &[u8]) -> Result<()> {
    let mut data_to_write = buf.chunks_exact(std::mem::size_of::<u64>());

    let mut write_addr = addr;

    for chunk in &mut data_to_write {
        let Ok(data) = chunk.try_into().map(i64::from_le_bytes) else {
            unreachable!("chunk should be 8 bytes long");
        };

        ptrace::write(tid, write_addr as *mut _, data)
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_POKE_DATA)"))?;

        write_addr += chunk.len() as u64;
    }

    let remainder = data_to_write.remainder();

    if !remainder.is_empty() {
        let mut old_data = ptrace::read(tid, write_addr as *mut _)
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_PEEK_DATA)"))?
            .to_le_bytes();

        for (old, new) in old_data.iter_mut().zip(remainder) {
            *old = *new;
        }

        let new_data = i64::from_le_bytes(old_data);

        ptrace::write(tid, write_addr as *mut _, new_data)
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_POKE_DATA)"))?;
    }

    Ok(())
}

/// Handle over `/proc/<pid>/mem`.
///
/// Unlike `PTRACE_POKEDATA`, writes go through without stopping any thread
/// of the process, and ignore page protections.
#[derive(Debug)]
pub struct ProcessMemory {
    path: PathBuf,
    file: File,
}

impl ProcessMemory {
    /// Opens the memory of the process with the given ID.
    pub fn open(process_id: u64) -> Result<Self> {
        let path = PathBuf::from(format!("/proc/{process_id}/mem"));

        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::File(path.clone(), e))?;

        Ok(Self { path, file })
    }

    /// Reads memory at the given address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, addr)
            .map_err(|e| Error::File(self.path.clone(), e))
    }

    /// Writes memory at the given address.
    pub fn write(&self, addr: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, addr)
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{addr:#x}"), "pwrite"))
            .map_err(|e| Error::File(self.path.clone(), e))
    }
}
