//! # Phases
//!
//! The nine lifecycle points of a proxied HTTP exchange, as a bitmask.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::str::FromStr;

use crate::errors::{Error, Result};

/// A set of lifecycle phases.
///
/// Single phases are the associated constants; unions are built with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Phase(u16);

impl Phase {
    pub const NONE: Phase = Phase(0);
    pub const DECODE_HEADERS: Phase = Phase(0x01);
    pub const DECODE_DATA: Phase = Phase(0x02);
    pub const DECODE_TRAILERS: Phase = Phase(0x04);
    pub const DECODE_REQUEST: Phase = Phase(0x08);
    pub const ENCODE_HEADERS: Phase = Phase(0x10);
    pub const ENCODE_DATA: Phase = Phase(0x20);
    pub const ENCODE_TRAILERS: Phase = Phase(0x40);
    pub const ENCODE_RESPONSE: Phase = Phase(0x80);
    pub const ON_LOG: Phase = Phase(0x100);

    pub const ALL: Phase = Phase(0x1ff);

    const NAMES: [(Phase, &'static str); 9] = [
        (Phase::DECODE_HEADERS, "DecodeHeaders"),
        (Phase::DECODE_DATA, "DecodeData"),
        (Phase::DECODE_TRAILERS, "DecodeTrailers"),
        (Phase::DECODE_REQUEST, "DecodeRequest"),
        (Phase::ENCODE_HEADERS, "EncodeHeaders"),
        (Phase::ENCODE_DATA, "EncodeData"),
        (Phase::ENCODE_TRAILERS, "EncodeTrailers"),
        (Phase::ENCODE_RESPONSE, "EncodeResponse"),
        (Phase::ON_LOG, "OnLog"),
    ];

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Build a set from raw bits, dropping unknown ones.
    pub const fn from_bits_truncate(bits: u16) -> Phase {
        Phase(bits & Phase::ALL.0)
    }

    /// True when every phase in `other` is also in `self`.
    pub const fn contains(self, other: Phase) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Phase) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: Phase) -> Phase {
        Phase(self.0 | other.0)
    }

    /// Look up the phase implemented by a filter method, e.g. `"DecodeHeaders"`.
    pub fn from_method_name(name: &str) -> Option<Phase> {
        Self::NAMES.iter().find(|(_, n)| *n == name).map(|(p, _)| *p)
    }

    /// The single phases contained in this set, in lifecycle order.
    pub fn iter(self) -> impl Iterator<Item = Phase> {
        Self::NAMES.into_iter().map(|(p, _)| p).filter(move |p| self.contains(*p))
    }

    /// The method name of a single phase.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMES.iter().find(|(p, _)| *p == self).map(|(_, n)| *n)
    }
}

impl BitOr for Phase {
    type Output = Phase;

    fn bitor(self, rhs: Phase) -> Phase {
        Phase(self.0 | rhs.0)
    }
}

impl BitOrAssign for Phase {
    fn bitor_assign(&mut self, rhs: Phase) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Phase {
    type Output = Phase;

    fn bitand(self, rhs: Phase) -> Phase {
        Phase(self.0 & rhs.0)
    }
}

impl BitAndAssign for Phase {
    fn bitand_assign(&mut self, rhs: Phase) {
        self.0 &= rhs.0;
    }
}

impl Not for Phase {
    type Output = Phase;

    fn not(self) -> Phase {
        Phase(!self.0 & Phase::ALL.0)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Phase({})", self.0);
        }
        let mut first = true;
        for (_, name) in Self::NAMES.iter().filter(|(p, _)| self.contains(*p)) {
            if !first {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Phase {
    type Err = Error;

    /// Parses `"DecodeHeaders | OnLog"` style lists.
    fn from_str(s: &str) -> Result<Self> {
        s.split('|')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .try_fold(Phase::NONE, |acc, name| {
                Phase::from_method_name(name)
                    .map(|p| acc | p)
                    .ok_or_else(|| Error::config(format!("unknown phase: {}", name)))
            })
    }
}
