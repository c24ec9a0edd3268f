use std::fmt;
use std::str::FromStr;

/// Opaque pointer-sized address within the target's address space.
///
/// There is no arithmetic with plain integers: the only way to move an
/// address is to add an [Offset] to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    /// Null address.
    pub const NULL: Self = Self(0);

    /// Wraps a raw address reported by a backend.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of the address.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns whether this is the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `self + offset`, or `None` on overflow.
    pub const fn checked_add(self, offset: Offset) -> Option<Self> {
        match self.0.checked_add(offset.0) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the offset of `self` relative to `base`, or `None` if `self`
    /// lies below `base`.
    pub const fn offset_from(self, base: Self) -> Option<Offset> {
        match self.0.checked_sub(base.0) {
            Some(raw) => Some(Offset(raw)),
            None => None,
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Offset relative to the base address of a module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Offset(u64);

impl Offset {
    /// Creates a new offset.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of the offset.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({:#x})", self.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Error returned when parsing an [Offset].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid offset {0:?} (expected hexadecimal `0x...` or decimal)")]
pub struct ParseOffsetError(String);

impl FromStr for Offset {
    type Err = ParseOffsetError;

    /// Parses an offset, either hexadecimal (`0x1a2b`) or decimal (`6699`).
    ///
    /// `_` separators are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits: String = trimmed.chars().filter(|&c| c != '_').collect();

        let parsed = match digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => digits.parse(),
        };

        parsed
            .map(Self)
            .map_err(|_| ParseOffsetError(s.to_owned()))
    }
}

/// Absolute address of a hooked function.
///
/// It can only be obtained from [ModuleInfo::resolve](crate::ModuleInfo::resolve),
/// which derives it from the module base address and a relative offset, so
/// it cannot outlive the module mapping it was computed against without the
/// session noticing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ResolvedAddress {
    address: Address,
    offset: Offset,
}

impl ResolvedAddress {
    pub(crate) const fn new(address: Address, offset: Offset) -> Self {
        Self { address, offset }
    }

    /// Returns the absolute address.
    pub const fn address(self) -> Address {
        self.address
    }

    /// Returns the module-relative offset it was derived from.
    pub const fn offset(self) -> Offset {
        self.offset
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.address, f)
    }
}
