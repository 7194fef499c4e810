//! Evaluated variable values

use std::fmt;

/// Result of evaluating a variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Owned text returned by STRING variables
    Text(String),
    /// Percentage returned by BAR/GRAPH variables, always within 0..=100
    Level(u8),
}

impl Value {
    /// Create a level value, clamping to the 0..=100 range
    pub fn level(percent: i64) -> Self {
        Value::Level(percent.clamp(0, 100) as u8)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Value::Text(text.into())
    }

    /// Change-detection checksum
    ///
    /// Text values sum their byte values, levels are their own checksum.
    pub fn checksum(&self) -> u64 {
        match self {
            Value::Text(text) => text.bytes().map(u64::from).sum(),
            Value::Level(level) => u64::from(*level),
        }
    }

    /// Render for a single protocol line, flattening embedded line breaks
    pub fn to_wire(&self) -> String {
        match self {
            Value::Text(text) => text.replace(['\r', '\n'], " "),
            Value::Level(level) => level.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => f.write_str(text),
            Value::Level(level) => write!(f, "{}", level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_checksum_sums_bytes() {
        // '4' = 52, '2' = 50
        assert_eq!(Value::text("42").checksum(), 102);
        assert_eq!(Value::text("").checksum(), 0);
    }

    #[test]
    fn test_level_checksum_is_value() {
        assert_eq!(Value::Level(73).checksum(), 73);
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(Value::level(150), Value::Level(100));
        assert_eq!(Value::level(-3), Value::Level(0));
    }

    #[test]
    fn test_wire_form_has_no_line_breaks() {
        assert_eq!(Value::text("a\r\nb").to_wire(), "a  b");
        assert_eq!(Value::Level(5).to_wire(), "5");
    }
}
