use std::fmt;
use std::str::FromStr;

/// Byte pattern describing a plausible function prologue.
///
/// Patterns use the usual array-of-bytes notation: space-separated
/// hexadecimal bytes, with `??` (or `?`) standing for any byte.
///
/// ```
/// use snare_engine::Pattern;
///
/// let pattern: Pattern = "55 48 89 E5 ?? 83".parse().unwrap();
///
/// assert!(pattern.matches_prefix(&[0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec]));
/// assert!(!pattern.matches_prefix(&[0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc]));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<u8>,
    mask: Vec<bool>,
}

/// Error returned when parsing a [Pattern].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern has no byte.
    #[error("empty pattern")]
    Empty,

    /// A token is neither a hexadecimal byte nor a wildcard.
    #[error("invalid pattern token {0:?}")]
    InvalidToken(String),

    /// The pattern only consists of wildcards.
    #[error("pattern {0:?} only consists of wildcards")]
    OnlyWildcards(String),
}

impl Pattern {
    /// Returns the number of bytes covered by the pattern.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns whether the pattern is empty (never true for a parsed
    /// pattern).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns whether `data` starts with bytes matching this pattern.
    pub fn matches_prefix(&self, data: &[u8]) -> bool {
        data.len() >= self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(&self.mask)
                .zip(data)
                .all(|((expected, &significant), actual)| !significant || expected == actual)
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        for token in s.split_whitespace() {
            match token {
                "?" | "??" => {
                    bytes.push(0);
                    mask.push(false);
                }
                _ if token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit()) => {
                    let byte = u8::from_str_radix(token, 16)
                        .map_err(|_| PatternError::InvalidToken(token.to_owned()))?;
                    bytes.push(byte);
                    mask.push(true);
                }
                _ => return Err(PatternError::InvalidToken(token.to_owned())),
            }
        }

        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }

        if !mask.iter().any(|&significant| significant) {
            return Err(PatternError::OnlyWildcards(s.to_owned()));
        }

        Ok(Self { bytes, mask })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (byte, significant)) in self.bytes.iter().zip(&self.mask).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            if *significant {
                write!(f, "{byte:02X}")?;
            } else {
                f.write_str("??")?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({self})")
    }
}
