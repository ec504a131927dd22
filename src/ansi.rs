//! Terminal background colors used to tag each command's output.
//!
//! The palette is a closed set: a color name either maps to one of these
//! variants or the spec it came from is rejected.

use std::fmt;
use std::str::FromStr;

use crate::errors::SpecError;

/// Escape sequence that restores the default terminal attributes.
pub const RESET: &str = "\x1b[0m";

/// Background colors a prefix can be painted with. `Reset` leaves the
/// terminal default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackgroundColor {
    Reset,
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

impl BackgroundColor {
    pub const ALL: [BackgroundColor; 9] = [
        BackgroundColor::Reset,
        BackgroundColor::Black,
        BackgroundColor::Red,
        BackgroundColor::Green,
        BackgroundColor::Yellow,
        BackgroundColor::Blue,
        BackgroundColor::Magenta,
        BackgroundColor::Cyan,
        BackgroundColor::White,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackgroundColor::Reset => "RESET",
            BackgroundColor::Black => "BLACK",
            BackgroundColor::Red => "RED",
            BackgroundColor::Green => "GREEN",
            BackgroundColor::Yellow => "YELLOW",
            BackgroundColor::Blue => "BLUE",
            BackgroundColor::Magenta => "MAGENTA",
            BackgroundColor::Cyan => "CYAN",
            BackgroundColor::White => "WHITE",
        }
    }

    pub fn escape(self) -> &'static str {
        match self {
            BackgroundColor::Reset => RESET,
            BackgroundColor::Black => "\x1b[40m",
            BackgroundColor::Red => "\x1b[41m",
            BackgroundColor::Green => "\x1b[42m",
            BackgroundColor::Yellow => "\x1b[43m",
            BackgroundColor::Blue => "\x1b[44m",
            BackgroundColor::Magenta => "\x1b[45m",
            BackgroundColor::Cyan => "\x1b[46m",
            BackgroundColor::White => "\x1b[47m",
        }
    }

    pub fn names() -> [&'static str; 9] {
        Self::ALL.map(BackgroundColor::name)
    }
}

impl fmt::Display for BackgroundColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackgroundColor {
    type Err = SpecError;

    /// Color names are matched case-insensitively.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|color| color.name().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| SpecError::InvalidColor {
                value: value.to_string(),
            })
    }
}

/// Renders every color name painted in its own background, for help output.
pub fn palette() -> String {
    BackgroundColor::ALL
        .iter()
        .map(|color| format!("{}{}{}", color.escape(), color.name(), RESET))
        .collect::<Vec<_>>()
        .join(" ")
}
