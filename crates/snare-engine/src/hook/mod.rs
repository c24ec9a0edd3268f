mod dispatch;
mod invocation;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) use self::dispatch::{Gate, HookDispatch};
pub use self::invocation::{Argument, InterceptionEvent, Invocation};
use crate::address::{Offset, ResolvedAddress};
use crate::pattern::Pattern;

/// Callback invoked whenever a hooked function is entered.
pub type OnEnter = dyn Fn(&mut Invocation<'_>) + Send + Sync;

/// Description of a function to hook, relative to its module.
///
/// The absolute address is never part of the descriptor: it is derived by
/// the session from the module base address at installation time.
#[derive(Debug, Clone)]
pub struct HookDescriptor {
    /// Human-readable name.
    name: Option<String>,

    /// Offset of the function within its module.
    offset: Offset,

    /// Arguments to capture.
    layout: Vec<ArgumentSpec>,

    /// Allow-listed function prologues.
    prologues: Vec<Pattern>,
}

impl HookDescriptor {
    /// Creates a descriptor for the function at `offset` within the module.
    pub fn new(offset: Offset) -> Self {
        Self {
            name: None,
            offset,
            layout: Vec::new(),
            prologues: Vec::new(),
        }
    }

    /// Names the hooked function.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds an argument to capture.
    pub fn argument(mut self, index: usize, interpretation: Interpretation) -> Self {
        self.layout.push(ArgumentSpec {
            index,
            interpretation,
        });
        self
    }

    /// Adds an allow-listed prologue.
    pub fn prologue(mut self, pattern: Pattern) -> Self {
        self.prologues.push(pattern);
        self
    }

    /// Returns the hook name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the hook name, or its offset if unnamed.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.offset.to_string(),
        }
    }

    /// Returns the offset of the function within its module.
    pub const fn offset(&self) -> Offset {
        self.offset
    }

    /// Returns the arguments to capture, in capture order.
    pub fn layout(&self) -> &[ArgumentSpec] {
        &self.layout
    }

    /// Returns the allow-listed prologues.
    pub fn prologues(&self) -> &[Pattern] {
        &self.prologues
    }

    /// Returns the number of bytes to read for prologue validation.
    pub(crate) fn prologue_len(&self) -> usize {
        self.prologues.iter().map(Pattern::len).max().unwrap_or(0)
    }
}

/// Argument to capture on every interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentSpec {
    /// Index of the argument (calling convention order).
    pub index: usize,

    /// How to interpret the raw value.
    pub interpretation: Interpretation,
}

/// Type hint of a captured argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpretation {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Boolean (any non-zero low byte is true).
    Bool,
    /// Pointer into the target's address space.
    Pointer,
}

impl Interpretation {
    /// Returns the size of the value, in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 | Self::Bool => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 => 4,
            Self::U64 | Self::I64 | Self::Pointer => 8,
        }
    }

    /// Returns whether the value is a signed integer.
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// Truncates a raw register/stack value to the width of this type.
    pub const fn narrow(self, raw: u64) -> u64 {
        match self.size() {
            8 => raw,
            size => raw & ((1u64 << (size * 8)) - 1),
        }
    }

    /// Sign-extends (or zero-extends) a raw value of this type to 64 bits.
    pub const fn widen(self, raw: u64) -> i64 {
        let narrowed = self.narrow(raw);

        if !self.is_signed() {
            return narrowed as i64;
        }

        let shift = 64 - self.size() as u32 * 8;
        ((narrowed << shift) as i64) >> shift
    }
}

impl fmt::Display for Interpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
            Self::Pointer => "pointer",
        };

        f.write_str(s)
    }
}

/// Error returned when parsing an [Interpretation].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown argument type {0:?}")]
pub struct ParseInterpretationError(String);

impl FromStr for Interpretation {
    type Err = ParseInterpretationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let interpretation = match s.to_ascii_lowercase().as_str() {
            "u8" => Self::U8,
            "u16" => Self::U16,
            "u32" => Self::U32,
            "u64" => Self::U64,
            "i8" => Self::I8,
            "i16" => Self::I16,
            "i32" => Self::I32,
            "i64" => Self::I64,
            "bool" => Self::Bool,
            "pointer" | "ptr" => Self::Pointer,
            _ => return Err(ParseInterpretationError(s.to_owned())),
        };

        Ok(interpretation)
    }
}

/// Handle over an installed hook, returned by
/// [Session::install](crate::Session::install).
#[derive(Debug, Clone)]
pub struct InstallHandle {
    /// ID of the session which installed the hook.
    session_id: u64,

    /// Absolute address of the hook.
    address: ResolvedAddress,

    /// Number of interceptions so far.
    hits: Arc<AtomicU64>,
}

impl InstallHandle {
    pub(crate) fn new(session_id: u64, address: ResolvedAddress, hits: Arc<AtomicU64>) -> Self {
        Self {
            session_id,
            address,
            hits,
        }
    }

    /// Returns the ID of the session which installed the hook.
    pub const fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Returns the absolute address of the hook.
    pub const fn address(&self) -> ResolvedAddress {
        self.address
    }

    /// Returns the number of interceptions so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}
