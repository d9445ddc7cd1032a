//! Attribute flags and comparison syntaxes
//!
//! Flags come from the tokens stored in @ATTRIBUTES. The syntax an attribute
//! compares with is resolved from its flags once, at load time.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Set of attribute flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AttributeFlags(u8);

impl AttributeFlags {
    pub const CASE_INSENSITIVE: Self = Self(1 << 0);
    pub const INTEGER: Self = Self(1 << 1);
    pub const HIDDEN: Self = Self(1 << 2);
    /// Never stored; applied to the object class attribute at lookup time
    pub const OBJECTCLASS: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse one @ATTRIBUTES token. `NONE` is the empty set.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "CASE_INSENSITIVE" => Some(Self::CASE_INSENSITIVE),
            "INTEGER" => Some(Self::INTEGER),
            "HIDDEN" => Some(Self::HIDDEN),
            "NONE" => Some(Self::empty()),
            _ => None,
        }
    }
}

impl BitOr for AttributeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AttributeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for AttributeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names = [
            (Self::CASE_INSENSITIVE, "CASE_INSENSITIVE"),
            (Self::INTEGER, "INTEGER"),
            (Self::HIDDEN, "HIDDEN"),
            (Self::OBJECTCLASS, "OBJECTCLASS"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// How values of an attribute are canonicalised and compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeSyntax {
    /// Bytewise
    OctetString,
    /// ASCII case-insensitive with runs of spaces collapsed
    DirectoryString,
    /// Signed decimal integers, compared numerically
    Integer,
}

impl AttributeSyntax {
    /// Syntax for a flag set. `HIDDEN` and `OBJECTCLASS` don't affect it;
    /// returns None for combinations no syntax handles.
    pub fn from_flags(flags: AttributeFlags) -> Option<Self> {
        let ci = flags.contains(AttributeFlags::CASE_INSENSITIVE);
        let int = flags.contains(AttributeFlags::INTEGER);
        match (ci, int) {
            (false, false) => Some(AttributeSyntax::OctetString),
            (true, false) => Some(AttributeSyntax::DirectoryString),
            (false, true) => Some(AttributeSyntax::Integer),
            (true, true) => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AttributeSyntax::OctetString => "OctetString",
            AttributeSyntax::DirectoryString => "DirectoryString",
            AttributeSyntax::Integer => "Integer",
        }
    }

    /// Canonical form of `value`; two values compare equal iff their
    /// canonical forms are equal.
    pub fn canonicalise(self, value: &[u8]) -> Vec<u8> {
        match self {
            AttributeSyntax::OctetString => value.to_vec(),
            AttributeSyntax::DirectoryString => fold_directory_string(value),
            AttributeSyntax::Integer => match parse_integer(value) {
                Some(n) => n.to_string().into_bytes(),
                None => value.to_vec(),
            },
        }
    }

    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            AttributeSyntax::OctetString => a.cmp(b),
            AttributeSyntax::DirectoryString => fold_directory_string(a).cmp(&fold_directory_string(b)),
            AttributeSyntax::Integer => match (parse_integer(a), parse_integer(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a.cmp(b),
            },
        }
    }
}

impl fmt::Display for AttributeSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn fold_directory_string(value: &[u8]) -> Vec<u8> {
    let start = value.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    let mut out = Vec::with_capacity(end - start);
    for &b in &value[start..end] {
        if b == b' ' && out.last() == Some(&b' ') {
            continue;
        }
        out.push(b.to_ascii_uppercase());
    }
    out
}

fn parse_integer(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        assert_eq!(AttributeFlags::from_token("CASE_INSENSITIVE"), Some(AttributeFlags::CASE_INSENSITIVE));
        assert_eq!(AttributeFlags::from_token("NONE"), Some(AttributeFlags::empty()));
        assert_eq!(AttributeFlags::from_token("BOGUS"), None);
        // Tokens are exact.
        assert_eq!(AttributeFlags::from_token("integer"), None);
        // OBJECTCLASS cannot be stored.
        assert_eq!(AttributeFlags::from_token("OBJECTCLASS"), None);
    }

    #[test]
    fn test_flag_ops_and_display() {
        let flags = AttributeFlags::CASE_INSENSITIVE | AttributeFlags::HIDDEN;
        assert!(flags.contains(AttributeFlags::HIDDEN));
        assert!(!flags.contains(AttributeFlags::INTEGER));
        assert_eq!(flags.to_string(), "CASE_INSENSITIVE|HIDDEN");
        assert_eq!(AttributeFlags::empty().to_string(), "NONE");
    }

    #[test]
    fn test_syntax_from_flags() {
        use AttributeFlags as F;
        assert_eq!(AttributeSyntax::from_flags(F::empty()), Some(AttributeSyntax::OctetString));
        assert_eq!(AttributeSyntax::from_flags(F::HIDDEN), Some(AttributeSyntax::OctetString));
        assert_eq!(
            AttributeSyntax::from_flags(F::CASE_INSENSITIVE | F::HIDDEN),
            Some(AttributeSyntax::DirectoryString)
        );
        assert_eq!(AttributeSyntax::from_flags(F::INTEGER), Some(AttributeSyntax::Integer));
        assert_eq!(AttributeSyntax::from_flags(F::CASE_INSENSITIVE | F::INTEGER), None);
    }

    #[test]
    fn test_directory_string_compare() {
        let s = AttributeSyntax::DirectoryString;
        assert_eq!(s.compare(b"  Foo   Bar ", b"foo bar"), Ordering::Equal);
        assert_eq!(s.canonicalise(b"a  b"), b"A B".to_vec());
        assert_eq!(s.compare(b"abc", b"ABD"), Ordering::Less);
    }

    #[test]
    fn test_integer_compare() {
        let s = AttributeSyntax::Integer;
        assert_eq!(s.compare(b"9", b"10"), Ordering::Less);
        assert_eq!(s.compare(b"-5", b"3"), Ordering::Less);
        assert_eq!(s.compare(b" 007", b"7"), Ordering::Equal);
        // Malformed values sort after valid ones.
        assert_eq!(s.compare(b"x", b"10"), Ordering::Greater);
        assert_eq!(s.canonicalise(b"007"), b"7".to_vec());
    }

    #[test]
    fn test_octet_string_is_bytewise() {
        let s = AttributeSyntax::OctetString;
        assert_eq!(s.compare(b"a", b"A"), Ordering::Greater);
    }
}
