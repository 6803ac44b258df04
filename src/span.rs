use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of a token inside a Python source file.
///
/// `line` is 1-based, `column` is the 0-based byte offset into that line,
/// matching the coordinates coverage tools and the Python compiler report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    /// Line number (1-based).
    pub line: u32,

    /// Byte column within the line (0-based).
    pub column: u32,
}

impl Position {
    #[cfg(test)]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    /// Start of a file.
    pub fn start() -> Self {
        Self { line: 1, column: 0 }
    }

    /// Advance past `text`, treating `\r\n`, `\r` and `\n` as line breaks.
    pub fn advance(self, text: &str) -> Self {
        let mut pos = self;
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    pos.line += 1;
                    pos.column = 0;
                }
                '\n' => {
                    pos.line += 1;
                    pos.column = 0;
                }
                other => pos.column += other.len_utf8() as u32,
            }
        }

        pos
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}
