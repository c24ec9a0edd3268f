use byteorder::{ByteOrder, LittleEndian};
use nix::libc::user_regs_struct;
use nix::unistd::Pid;
use snare_engine::backend::CallFrame;
use snare_engine::{Address, FrameError};

use super::mem;

/// Number of integer arguments passed through registers (System V AMD64).
const REGISTER_ARGS: usize = 6;

/// Call frame of a thread stopped on a function entry trap.
pub struct PtraceFrame<'a> {
    pid: u64,
    tid: Pid,
    regs: &'a mut user_regs_struct,
    dirty: bool,
}

impl<'a> PtraceFrame<'a> {
    pub fn new(pid: u64, tid: Pid, regs: &'a mut user_regs_struct) -> Self {
        Self {
            pid,
            tid,
            regs,
            dirty: false,
        }
    }

    /// Returns whether the registers were modified.
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn register(&mut self, index: usize) -> Option<&mut u64> {
        let regs = &mut *self.regs;

        match index {
            0 => Some(&mut regs.rdi),
            1 => Some(&mut regs.rsi),
            2 => Some(&mut regs.rdx),
            3 => Some(&mut regs.rcx),
            4 => Some(&mut regs.r8),
            5 => Some(&mut regs.r9),
            _ => None,
        }
    }

    /// Address of the stack slot holding the argument at `index`.
    ///
    /// On function entry, the return address sits at the top of the stack.
    fn stack_slot(&self, index: usize) -> Option<u64> {
        let slot = u64::try_from(index.checked_sub(REGISTER_ARGS)?).ok()?;

        slot.checked_add(1)?
            .checked_mul(8)?
            .checked_add(self.regs.rsp)
    }
}

impl CallFrame for PtraceFrame<'_> {
    fn thread_id(&self) -> u64 {
        self.tid.as_raw() as u64
    }

    fn argument(&self, index: usize) -> Result<u64, FrameError> {
        let regs = &*self.regs;

        let value = match index {
            0 => regs.rdi,
            1 => regs.rsi,
            2 => regs.rdx,
            3 => regs.rcx,
            4 => regs.r8,
            5 => regs.r9,
            _ => {
                let addr = self
                    .stack_slot(index)
                    .ok_or(FrameError::ArgumentUnavailable(index))?;

                let mut buf = [0u8; 8];
                self.read_memory(Address::new(addr), &mut buf)?;

                LittleEndian::read_u64(&buf)
            }
        };

        Ok(value)
    }

    fn set_argument(&mut self, index: usize, value: u64) -> Result<(), FrameError> {
        if let Some(reg) = self.register(index) {
            *reg = value;
            self.dirty = true;
            return Ok(());
        }

        let addr = self
            .stack_slot(index)
            .ok_or(FrameError::ArgumentUnavailable(index))?;

        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);

        self.write_memory(Address::new(addr), &buf)
    }

    fn read_memory(&self, addr: Address, buf: &mut [u8]) -> Result<(), FrameError> {
        mem::read_process_memory(self.pid, addr.get(), buf).map_err(|e| FrameError::Memory {
            address: addr,
            len: buf.len(),
            source: Some(Box::new(e)),
        })
    }

    fn write_memory(&mut self, addr: Address, buf: &[u8]) -> Result<(), FrameError> {
        mem::write_thread_memory(self.tid, addr.get(), buf).map_err(|e| FrameError::Memory {
            address: addr,
            len: buf.len(),
            source: Some(Box::new(e)),
        })
    }
}
