//! Terminal interpreter for the friendly REPL.
//!
//! Decodes the small VT100 subset MicroPython's line editor emits into a
//! cursor-addressed text buffer:
//!
//! | Input          | Effect                                        |
//! |----------------|-----------------------------------------------|
//! | `BS`           | cursor left (nothing is deleted)              |
//! | `CR`           | ignored                                       |
//! | `LF`           | cursor to document end, start a new line      |
//! | `ESC [ n A/B`  | cursor up / down `n` lines                    |
//! | `ESC [ n C/D`  | cursor right / left `n` columns               |
//! | `ESC [ K`      | erase from cursor to end of line              |
//! | anything else  | overwrite the character at the cursor         |
//!
//! `n` defaults to 1. `ESC [ n K` and unknown final letters are ignored.
//! Escape sequences and UTF-8 characters split across chunks are completed
//! on the next [`Terminal::feed`].

use std::collections::VecDeque;

/// Default number of lines kept before the oldest are discarded.
pub const DEFAULT_SCROLLBACK: usize = 10_000;

const ESC: u8 = 0x1B;
const BS: u8 = 0x08;
const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

/// Drain buffered bytes into displayable UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('\u{FFFD}');
                        let drain_to = valid_up_to
                            .saturating_add(invalid_len)
                            .min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Cursor position inside the terminal buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalCursor {
    /// Zero-based line index.
    pub line: usize,
    /// Zero-based column (in characters).
    pub column: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ParseState {
    #[default]
    Ground,
    Escape,
    Csi {
        count: Option<usize>,
        /// Set once a parameter or intermediate byte outside plain digits shows up.
        foreign: bool,
    },
}

/// Cursor-addressed text buffer fed with friendly-mode output.
#[derive(Debug, Clone)]
pub struct Terminal {
    lines: VecDeque<Vec<char>>,
    cursor: TerminalCursor,
    state: ParseState,
    utf8: Vec<u8>,
    scrollback: usize,
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminal {
    /// Empty terminal with [`DEFAULT_SCROLLBACK`] lines of history.
    pub fn new() -> Self {
        Self::with_scrollback(DEFAULT_SCROLLBACK)
    }

    /// Empty terminal keeping at most `lines` lines.
    pub fn with_scrollback(lines: usize) -> Self {
        Self {
            lines: VecDeque::from([Vec::new()]),
            cursor: TerminalCursor::default(),
            state: ParseState::Ground,
            utf8: Vec::new(),
            scrollback: lines.max(1),
        }
    }

    /// Decode one inbound chunk.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.step(byte);
        }
    }

    /// Current cursor position.
    pub fn cursor(&self) -> TerminalCursor {
        self.cursor
    }

    /// Number of lines in the buffer (always at least one).
    pub fn line_count(&self) -> usize {
        self.lines
            .len()
    }

    /// Text of line `index`, if it exists.
    pub fn line(&self, index: usize) -> Option<String> {
        self.lines
            .get(index)
            .map(|line| line.iter().collect())
    }

    /// The whole buffer, lines joined with `\n`.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for (i, line) in self
            .lines
            .iter()
            .enumerate()
        {
            if i > 0 {
                out.push('\n');
            }
            out.extend(line.iter());
        }
        out
    }

    /// Reset to an empty buffer.
    pub fn clear(&mut self) {
        self.lines = VecDeque::from([Vec::new()]);
        self.cursor = TerminalCursor::default();
        self.state = ParseState::Ground;
        self.utf8
            .clear();
    }

    fn step(&mut self, byte: u8) {
        match self.state {
            ParseState::Ground => self.ground(byte),
            ParseState::Escape => {
                self.state = ParseState::Ground;
                if byte == b'[' {
                    self.state = ParseState::Csi {
                        count: None,
                        foreign: false,
                    };
                } else {
                    // Lone ESC: drop it and treat the byte as ordinary input.
                    self.ground(byte);
                }
            },
            ParseState::Csi { count, foreign } => self.csi(byte, count, foreign),
        }
    }

    fn ground(&mut self, byte: u8) {
        if byte.is_ascii() {
            self.flush_incomplete_utf8();
        }
        match byte {
            ESC => self.state = ParseState::Escape,
            BS => {
                self.cursor.column = self
                    .cursor
                    .column
                    .saturating_sub(1);
            },
            CR => {},
            LF => self.newline(),
            _ if byte.is_ascii() => self.put(char::from(byte)),
            _ => {
                self.utf8
                    .push(byte);
                for c in drain_utf8_lossy(&mut self.utf8).chars() {
                    self.put(c);
                }
            },
        }
    }

    fn csi(&mut self, byte: u8, count: Option<usize>, foreign: bool) {
        match byte {
            b'0'..=b'9' => {
                let digit = usize::from(byte - b'0');
                let count = count
                    .unwrap_or(0)
                    .saturating_mul(10)
                    .saturating_add(digit);
                self.state = ParseState::Csi {
                    count: Some(count),
                    foreign,
                };
            },
            // Parameter and intermediate bytes we don't interpret; the whole
            // sequence is then consumed without effect.
            0x20..=0x2F | b':'..=b'?' => {
                self.state = ParseState::Csi {
                    count,
                    foreign: true,
                };
            },
            0x40..=0x7E => {
                self.state = ParseState::Ground;
                if !foreign {
                    self.dispatch(byte, count);
                }
            },
            _ => {
                // Malformed: abandon the sequence and reprocess the byte.
                self.state = ParseState::Ground;
                self.ground(byte);
            },
        }
    }

    fn dispatch(&mut self, action: u8, count: Option<usize>) {
        let n = count
            .unwrap_or(1)
            .max(1);
        let last_line = self.lines.len() - 1;
        match action {
            b'A' => {
                self.cursor.line = self
                    .cursor
                    .line
                    .saturating_sub(n);
                self.clamp_column();
            },
            b'B' => {
                self.cursor.line = self
                    .cursor
                    .line
                    .saturating_add(n)
                    .min(last_line);
                self.clamp_column();
            },
            b'C' => {
                self.cursor.column = self
                    .cursor
                    .column
                    .saturating_add(n)
                    .min(self.current_len());
            },
            b'D' => {
                self.cursor.column = self
                    .cursor
                    .column
                    .saturating_sub(n);
            },
            b'K' if count.is_none() => {
                let column = self.cursor.column;
                self.current_line()
                    .truncate(column);
            },
            _ => {},
        }
    }

    /// Bytes of a UTF-8 sequence cut short by an ASCII byte are invalid.
    fn flush_incomplete_utf8(&mut self) {
        if !self
            .utf8
            .is_empty()
        {
            self.utf8
                .clear();
            self.put('\u{FFFD}');
        }
    }

    fn put(&mut self, c: char) {
        let column = self.cursor.column;
        let line = self.current_line();
        if column < line.len() {
            line[column] = c;
        } else {
            line.push(c);
        }
        let len = line.len();
        self.cursor.column = column.min(len - 1) + 1;
    }

    fn newline(&mut self) {
        self.lines
            .push_back(Vec::new());
        if self.lines.len() > self.scrollback {
            self.lines
                .pop_front();
        }
        self.cursor = TerminalCursor {
            line: self.lines.len() - 1,
            column: 0,
        };
    }

    fn current_line(&mut self) -> &mut Vec<char> {
        let index = self
            .cursor
            .line
            .min(self.lines.len() - 1);
        &mut self.lines[index]
    }

    fn current_len(&self) -> usize {
        self.lines
            .get(self.cursor.line)
            .map_or(0, Vec::len)
    }

    fn clamp_column(&mut self) {
        self.cursor.column = self
            .cursor
            .column
            .min(self.current_len());
    }
}
