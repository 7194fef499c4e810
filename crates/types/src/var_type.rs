//! Variable type tags
//!
//! A type tag combines the value kind (text, bar, graph), an optional
//! argument kind and the CRON flag into one bit set. The numeric form is
//! what clients see in push lines, so the bit values are part of the wire
//! protocol and must never change.

use std::fmt;

/// Bit set describing how a variable is called and what it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VarType(u32);

impl VarType {
    /// Text value (the absence of BAR/GRAPH)
    pub const VARIABLE_STR: VarType = VarType(0);
    /// Percentage value rendered as a bar
    pub const VARIABLE_BAR: VarType = VarType(1);
    /// Takes a string argument
    pub const ARG_STR: VarType = VarType(2);
    /// Takes an integer argument
    pub const ARG_INT: VarType = VarType(4);
    /// Takes a floating point argument
    pub const ARG_DBL: VarType = VarType(8);
    /// Percentage value rendered as a graph
    pub const VARIABLE_GRAPH: VarType = VarType(16);
    /// Evaluated on every scheduler tick, subscribed or not
    pub const VARIABLE_CRON: VarType = VarType(32);

    const KNOWN_BITS: u32 = 1 | 2 | 4 | 8 | 16 | 32;

    /// Build a tag from raw bits, dropping bits this version does not know
    pub const fn from_bits(bits: u32) -> Self {
        VarType(bits & Self::KNOWN_BITS)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: VarType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn kind(self) -> VarKind {
        if self.contains(Self::VARIABLE_BAR) {
            VarKind::Bar
        } else if self.contains(Self::VARIABLE_GRAPH) {
            VarKind::Graph
        } else {
            VarKind::Text
        }
    }

    /// Argument kind; when several argument flags are set the first of
    /// STR, INT, DBL wins
    pub fn arg_kind(self) -> ArgKind {
        if self.contains(Self::ARG_STR) {
            ArgKind::Str
        } else if self.contains(Self::ARG_INT) {
            ArgKind::Int
        } else if self.contains(Self::ARG_DBL) {
            ArgKind::Double
        } else {
            ArgKind::None
        }
    }

    pub fn is_cron(self) -> bool {
        self.contains(Self::VARIABLE_CRON)
    }
}

impl std::ops::BitOr for VarType {
    type Output = VarType;

    fn bitor(self, rhs: VarType) -> VarType {
        VarType(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for VarType {
    fn bitor_assign(&mut self, rhs: VarType) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a variable evaluates to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Text,
    Bar,
    Graph,
}

impl VarKind {
    /// Bar and graph variables return a percentage instead of text
    pub fn is_level(self) -> bool {
        !matches!(self, VarKind::Text)
    }
}

/// What a variable's callable expects as its argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    None,
    Str,
    Int,
    Double,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_with_string_arg_is_two() {
        let ty = VarType::VARIABLE_STR | VarType::ARG_STR;
        assert_eq!(ty.bits(), 2);
        assert_eq!(ty.kind(), VarKind::Text);
        assert_eq!(ty.arg_kind(), ArgKind::Str);
        assert!(!ty.is_cron());
    }

    #[test]
    fn test_kind_and_arg_decoding() {
        let ty = VarType::VARIABLE_GRAPH | VarType::ARG_DBL | VarType::VARIABLE_CRON;
        assert_eq!(ty.kind(), VarKind::Graph);
        assert_eq!(ty.arg_kind(), ArgKind::Double);
        assert!(ty.is_cron());
        assert!(ty.kind().is_level());

        assert_eq!(VarType::VARIABLE_BAR.arg_kind(), ArgKind::None);
        assert_eq!(VarType::VARIABLE_BAR.kind(), VarKind::Bar);
    }

    #[test]
    fn test_first_argument_flag_wins() {
        let ty = VarType::ARG_INT | VarType::ARG_DBL;
        assert_eq!(ty.arg_kind(), ArgKind::Int);
    }

    #[test]
    fn test_unknown_bits_are_dropped() {
        let ty = VarType::from_bits(0x100 | 1);
        assert_eq!(ty, VarType::VARIABLE_BAR);
        assert_eq!(ty.to_string(), "1");
    }
}
