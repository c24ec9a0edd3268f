use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use snare_engine::backend::Interceptor;

use super::mem::ProcessMemory;
use super::{Error, Result};

/// `int3`
pub const TRAP_OPCODE: u8 = 0xcc;

/// Code memory of the traced process.
pub trait CodeMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&self, addr: u64, buf: &[u8]) -> Result<()>;
}

impl CodeMemory for ProcessMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        ProcessMemory::read(self, addr, buf)
    }

    fn write(&self, addr: u64, buf: &[u8]) -> Result<()> {
        ProcessMemory::write(self, addr, buf)
    }
}

struct Trap {
    orig_opcode: u8,
    enabled: bool,
    interceptor: Arc<dyn Interceptor>,
}

/// Software traps placed within the traced process.
pub struct TrapTable<M = ProcessMemory> {
    memory: M,

    traps: HashMap<u64, Trap>,

    /// Addresses of removed traps, which threads may still report for a
    /// while.
    retired: HashSet<u64>,
}

impl<M: CodeMemory> TrapTable<M> {
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            traps: HashMap::new(),
            retired: HashSet::new(),
        }
    }

    /// Places a trap at `addr`.
    pub fn insert(&mut self, addr: u64, interceptor: Arc<dyn Interceptor>) -> Result<()> {
        let Entry::Vacant(entry) = self.traps.entry(addr) else {
            return Err(Error::TrapExists(addr));
        };

        let mut orig_opcode = [0u8];
        self.memory.read(addr, &mut orig_opcode)?;
        self.memory.write(addr, &[TRAP_OPCODE])?;

        entry.insert(Trap {
            orig_opcode: orig_opcode[0],
            enabled: true,
            interceptor,
        });

        self.retired.remove(&addr);

        tracing::trace!(addr = format_args!("{addr:#x}"), "trap inserted");

        Ok(())
    }

    /// Removes the trap at `addr`, restoring the original code.
    pub fn remove(&mut self, addr: u64) -> Result<()> {
        let Some(trap) = self.traps.remove(&addr) else {
            return Err(Error::NoTrap(addr));
        };

        self.retired.insert(addr);

        if trap.enabled {
            self.memory.write(addr, &[trap.orig_opcode])?;
        }

        tracing::trace!(addr = format_args!("{addr:#x}"), "trap removed");

        Ok(())
    }

    /// Removes every trap.
    ///
    /// All the traps are attempted, the first error is returned.
    pub fn remove_all(&mut self) -> Result<()> {
        let addrs: Vec<u64> = self.traps.keys().copied().collect();

        addrs
            .into_iter()
            .map(|addr| self.remove(addr))
            .fold(Ok(()), |res, next| res.and(next))
    }

    /// Returns the interceptor of the trap at `addr`.
    ///
    /// A disabled trap still has its interceptor, since threads may have
    /// reached it before it got disabled.
    pub fn interceptor(&self, addr: u64) -> Option<Arc<dyn Interceptor>> {
        self.traps.get(&addr).map(|trap| trap.interceptor.clone())
    }

    /// Returns whether a trap used to be at `addr`.
    pub fn is_retired(&self, addr: u64) -> bool {
        self.retired.contains(&addr)
    }

    /// Temporarily restores the original code at `addr`, so that a thread can
    /// step over it.
    pub fn disable(&mut self, addr: u64) -> Result<()> {
        match self.traps.get_mut(&addr) {
            Some(trap) if trap.enabled => {
                self.memory.write(addr, &[trap.orig_opcode])?;
                trap.enabled = false;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Puts back the trap at `addr` after [Self::disable].
    ///
    /// Traps removed in the meantime stay removed.
    pub fn enable(&mut self, addr: u64) -> Result<()> {
        match self.traps.get_mut(&addr) {
            Some(trap) if !trap.enabled => {
                self.memory.write(addr, &[TRAP_OPCODE])?;
                trap.enabled = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Replaces the trap opcodes read within `buf` (read at `addr`) with the
    /// original code.
    pub fn hide(&self, addr: u64, buf: &mut [u8]) {
        let end = addr.saturating_add(buf.len() as u64);

        for (&trap_addr, trap) in &self.traps {
            if trap.enabled && (addr..end).contains(&trap_addr) {
                buf[(trap_addr - addr) as usize] = trap.orig_opcode;
            }
        }
    }

    /// Drops every trap without touching the process memory, once the code
    /// they were placed in is gone (e.g., after `execve`).
    pub fn forget_all(&mut self) {
        self.traps.clear();
        self.retired.clear();
    }
}
