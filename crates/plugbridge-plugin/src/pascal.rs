//! Fixed-capacity inline strings.
//!
//! Parameter displays and program names are passed around on real-time paths,
//! so they are stored inline with a length byte instead of on the heap.

use std::fmt;

/// A UTF-8 string of at most `N` bytes stored inline
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PascalString<const N: usize> {
    len: u8,
    data: [u8; N],
}

/// Parameter display string (16 bytes in total)
pub type ParamDisplay = PascalString<15>;

/// Program name (32 bytes in total)
pub type ProgramName = PascalString<31>;

impl<const N: usize> PascalString<N> {
    pub const CAPACITY: usize = {
        assert!(N <= u8::MAX as usize);
        N
    };

    /// Create from a string, truncating at a character boundary if needed
    pub fn new(s: &str) -> Self {
        let mut len = s.len().min(Self::CAPACITY);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        let mut data = [0u8; N];
        data[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self {
            len: len as u8,
            data,
        }
    }

    /// Create from a string only if it fits without truncation
    pub fn try_new(s: &str) -> Option<Self> {
        Self::fits(s).then(|| Self::new(s))
    }

    /// Whether `s` can be stored without truncation
    pub fn fits(s: &str) -> bool {
        s.len() <= Self::CAPACITY
    }

    pub fn as_str(&self) -> &str {
        // always valid UTF-8, see `new`
        std::str::from_utf8(&self.data[..self.len as usize]).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for PascalString<N> {
    fn default() -> Self {
        Self {
            len: 0,
            data: [0u8; N],
        }
    }
}

impl<const N: usize> fmt::Display for PascalString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> fmt::Debug for PascalString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> From<&str> for PascalString<N> {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<const N: usize> PartialEq<str> for PascalString<N> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<const N: usize> PartialEq<&str> for PascalString<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_string() {
        let s = ParamDisplay::new("-6.0 dB");
        assert_eq!(s, "-6.0 dB");
        assert_eq!(s.len(), 7);
        assert!(!s.is_empty());
        assert_eq!(std::mem::size_of::<ParamDisplay>(), 16);
    }

    #[test]
    fn test_truncation_at_char_boundary() {
        // 14 ASCII bytes followed by a 2-byte character
        let s = ParamDisplay::new("abcdefghijklmnä");
        assert_eq!(s.as_str(), "abcdefghijklmn");

        let s = PascalString::<4>::new("hello");
        assert_eq!(s.as_str(), "hell");
    }

    #[test]
    fn test_try_new() {
        assert!(PascalString::<11>::try_new("short").is_some());
        assert!(PascalString::<11>::try_new("much too long for it").is_none());
        assert!(PascalString::<11>::fits("exactly 11!"));
    }
}
