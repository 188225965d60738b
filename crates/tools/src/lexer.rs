//! Script Tokenizer
//!
//! A small state machine over Python source that classifies every byte as
//! code, string literal or comment and records the bracket depth in effect
//! at that byte. The source rewrites use it to stay out of string literals
//! and to find matching brackets across lines.
//!
//! Only the lexical structure matters here: quotes (single, double, triple),
//! backslash escapes, `#` comments and `()[]{}` nesting. String prefixes
//! (`r`, `b`, `f`) are ordinary identifier bytes in front of the quote.

use std::ops::Range;

use thiserror::Error;

/// Lexical class of a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Code,
    String,
    Comment,
}

/// Structural problem found while tokenizing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated string literal starting on line {line}")]
    UnterminatedString { line: usize },

    #[error("unmatched '{found}' on line {line}")]
    UnmatchedClose { found: char, line: usize },

    #[error("'{found}' on line {line} does not match '{open}' opened on line {open_line}")]
    Mismatched {
        open: char,
        found: char,
        line: usize,
        open_line: usize,
    },

    #[error("'{open}' opened on line {line} is never closed")]
    Unclosed { open: char, line: usize },
}

/// Tokenized source.
#[derive(Debug, Clone)]
pub struct Lexed<'a> {
    source: &'a str,
    regions: Vec<Region>,
    depths: Vec<u32>,
}

/// Tokenize `source`.
pub fn lex(source: &str) -> Result<Lexed<'_>, LexError> {
    let bytes = source.as_bytes();
    let n = bytes.len();
    let mut regions = vec![Region::Code; n];
    let mut depths = vec![0u32; n];
    let mut stack: Vec<(u8, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < n {
        let b = bytes[i];
        let depth = stack.len() as u32;
        depths[i] = depth;

        match b {
            b'#' => {
                while i < n && bytes[i] != b'\n' {
                    regions[i] = Region::Comment;
                    depths[i] = depth;
                    i += 1;
                }
                continue;
            }
            b'\'' | b'"' => {
                let end = scan_string(bytes, i).ok_or(LexError::UnterminatedString { line })?;
                for k in i..end {
                    regions[k] = Region::String;
                    depths[k] = depth;
                    if bytes[k] == b'\n' {
                        line += 1;
                    }
                }
                i = end;
                continue;
            }
            b'(' | b'[' | b'{' => stack.push((b, line)),
            b')' | b']' | b'}' => {
                let (open, open_line) = stack.pop().ok_or(LexError::UnmatchedClose {
                    found: b as char,
                    line,
                })?;
                if closer_for(open) != b {
                    return Err(LexError::Mismatched {
                        open: open as char,
                        found: b as char,
                        line,
                        open_line,
                    });
                }
            }
            b'\n' => line += 1,
            _ => {}
        }
        i += 1;
    }

    if let Some((open, line)) = stack.pop() {
        return Err(LexError::Unclosed {
            open: open as char,
            line,
        });
    }

    Ok(Lexed {
        source,
        regions,
        depths,
    })
}

/// Verify quotes and brackets are balanced.
pub fn check_balance(source: &str) -> Result<(), LexError> {
    lex(source).map(|_| ())
}

/// Returns the index one past the closing quote of the literal starting at
/// `start`, or `None` if it never closes.
fn scan_string(bytes: &[u8], start: usize) -> Option<usize> {
    let quote = bytes[start];
    let n = bytes.len();
    let triple = start + 2 < n && bytes[start + 1] == quote && bytes[start + 2] == quote;
    let width = if triple { 3 } else { 1 };

    let mut j = start + width;
    while j < n {
        let c = bytes[j];
        if c == b'\\' {
            j += 2;
            continue;
        }
        if c == b'\n' && !triple {
            return None;
        }
        if c == quote && (!triple || (j + 2 < n && bytes[j + 1] == quote && bytes[j + 2] == quote)) {
            return Some(j + width);
        }
        j += 1;
    }
    None
}

fn closer_for(open: u8) -> u8 {
    match open {
        b'(' => b')',
        b'[' => b']',
        _ => b'}',
    }
}

pub(crate) fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

impl<'a> Lexed<'a> {
    pub fn source(&self) -> &'a str {
        self.source
    }

    pub fn region_at(&self, pos: usize) -> Region {
        self.regions.get(pos).copied().unwrap_or(Region::Code)
    }

    pub fn is_code(&self, pos: usize) -> bool {
        self.region_at(pos) == Region::Code
    }

    /// Bracket depth in effect at `pos`. A closing bracket reports the depth
    /// of the content it closes.
    pub fn depth_at(&self, pos: usize) -> u32 {
        self.depths.get(pos).copied().unwrap_or(0)
    }

    /// True when the byte before `pos` is inside a string literal, i.e. a
    /// line starting at `pos` continues a multi-line string.
    pub fn starts_inside_string(&self, pos: usize) -> bool {
        pos > 0 && pos <= self.regions.len() && self.regions[pos - 1] == Region::String
    }

    /// Index of the bracket closing the one at `open`.
    pub fn matching_close(&self, open: usize) -> Option<usize> {
        let bytes = self.source.as_bytes();
        let inner = self.depth_at(open) + 1;
        (open + 1..bytes.len()).find(|&j| {
            matches!(bytes[j], b')' | b']' | b'}') && self.is_code(j) && self.depths[j] == inner
        })
    }

    /// Last non-whitespace code byte in `range`, skipping comments.
    pub fn last_code_byte(&self, range: Range<usize>) -> Option<usize> {
        let bytes = self.source.as_bytes();
        range
            .rev()
            .find(|&k| self.region_at(k) != Region::Comment && !bytes[k].is_ascii_whitespace())
    }

    /// Whether `name=` appears as a keyword argument directly inside the
    /// bracket pair `open..close`.
    pub fn has_keyword_arg(&self, open: usize, close: usize, name: &str) -> bool {
        let bytes = self.source.as_bytes();
        let inner = self.depth_at(open) + 1;
        for k in open + 1..close {
            if !self.is_code(k) || self.depths[k] != inner {
                continue;
            }
            if !bytes[k..].starts_with(name.as_bytes()) || (k > 0 && is_ident_byte(bytes[k - 1])) {
                continue;
            }
            let mut j = k + name.len();
            while j < close && (bytes[j] == b' ' || bytes[j] == b'\t') {
                j += 1;
            }
            if j < close && bytes[j] == b'=' && bytes.get(j + 1) != Some(&b'=') {
                return true;
            }
        }
        false
    }

    /// Byte ranges of logical lines, each including its terminating newline.
    ///
    /// A logical line ends at a newline that is outside strings and
    /// brackets and not escaped by a trailing backslash.
    pub fn logical_lines(&self) -> Vec<Range<usize>> {
        let bytes = self.source.as_bytes();
        let mut lines = Vec::new();
        let mut start = 0;
        for (i, &b) in bytes.iter().enumerate() {
            if b != b'\n' || self.regions[i] == Region::String || self.depths[i] != 0 {
                continue;
            }
            let escaped = i > 0 && bytes[i - 1] == b'\\' && self.regions[i - 1] == Region::Code;
            if escaped {
                continue;
            }
            lines.push(start..i + 1);
            start = i + 1;
        }
        if start < bytes.len() {
            lines.push(start..bytes.len());
        }
        lines
    }
}
