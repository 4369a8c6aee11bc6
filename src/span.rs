use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start_line: usize,
    pub start_column: usize,
    pub end_line: usize,
    pub end_column: usize,
}

impl Span {
    pub fn new(line: usize, start_column: usize, end_column: usize) -> Self {
        Span {
            start_line: line,
            start_column,
            end_line: line,
            end_column,
        }
    }

    /// Nodes built without source information carry the default span.
    pub fn is_unknown(&self) -> bool {
        self.start_line == 0
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start_line == self.end_line {
            write!(
                f,
                "{}.{}-{}",
                self.start_line, self.start_column, self.end_column
            )
        } else {
            write!(
                f,
                "{}.{}-{}.{}",
                self.start_line, self.start_column, self.end_line, self.end_column
            )
        }
    }
}
