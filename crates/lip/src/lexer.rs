//! Lexer: byte stream to tokens.
//!
//! The lexer pulls bytes one at a time from an [`Input`], tracks the current
//! source location, and accumulates the bytes of the token in flight in a
//! capture buffer. Separators are whitespace, parentheses, `;`, `"`, `'`,
//! backtick and `,`. `;` starts a comment running to the next CR/LF. CR, LF
//! and CR-LF each advance to the next line and reset the column to 1.

use std::fmt;

use crate::io::Input;
use crate::loc::{Loc, LocRange};

/// What a token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// Any run of non-separator characters that is not a number.
    Symbol,
    /// `"…"`; the lexeme is the raw content with escapes unresolved.
    String,
    /// Optional leading `-`, digits, at most one `.`.
    Number,
    /// `'`
    Quote,
    /// `` ` ``
    Quasiquote,
    /// `,`
    Unquote,
    /// `,@`
    UnquoteSplicing,
}

/// A token with its raw text and source range.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Token classification.
    pub kind: TokenKind,
    /// Raw text. For strings this excludes the surrounding quotes and keeps
    /// escape sequences undecoded.
    pub lexeme: String,
    /// Source range covered by the token.
    pub location: LocRange,
}

/// Lexer failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexErrorKind {
    /// Unterminated string, or a raw newline inside one.
    BadString,
    /// Garbage after the digits of a number, or a second decimal point.
    BadNumber,
}

/// A lexer error with the range of the offending text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    /// What went wrong.
    pub kind: LexErrorKind,
    /// Where it went wrong.
    pub location: LocRange,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LexErrorKind::BadString => write!(f, "Malformed string"),
            LexErrorKind::BadNumber => write!(f, "Malformed number"),
        }
    }
}

/// Streaming lexer over an [`Input`].
pub struct Lexer<I> {
    input: I,
    location: Loc,
    buffered: Option<u8>,
    eos: bool,
    capture: Vec<u8>,
    capturing: bool,
    token_start: Loc,
}

impl<I: Input> Lexer<I> {
    /// Creates a lexer at line 1, column 1.
    pub fn new(input: I) -> Self {
        Self {
            input,
            location: Loc::new(1, 1),
            buffered: None,
            eos: false,
            capture: Vec::new(),
            capturing: false,
            token_start: Loc::new(1, 1),
        }
    }

    /// Produces the next token, `None` at end of stream.
    pub fn next_token(&mut self) -> Result<Option<Token>, LexError> {
        if self.eos && self.buffered.is_none() {
            return Ok(None);
        }

        while let Some(ch) = self.peek() {
            self.token_start = self.location;
            self.begin_capture();
            self.consume();

            match ch {
                b' ' | b'\t' => {
                    self.reset_capture();
                }
                b'\r' => {
                    self.reset_capture();
                    if self.peek() == Some(b'\n') {
                        self.consume();
                    }
                    self.newline();
                }
                b'\n' => {
                    self.reset_capture();
                    self.newline();
                }
                b'(' => return Ok(Some(self.make_token(TokenKind::LParen))),
                b')' => return Ok(Some(self.make_token(TokenKind::RParen))),
                b'\'' => return Ok(Some(self.make_token(TokenKind::Quote))),
                b'`' => return Ok(Some(self.make_token(TokenKind::Quasiquote))),
                b',' => {
                    if self.peek() == Some(b'@') {
                        self.consume();
                        return Ok(Some(self.make_token(TokenKind::UnquoteSplicing)));
                    }
                    return Ok(Some(self.make_token(TokenKind::Unquote)));
                }
                b';' => {
                    while let Some(ch) = self.peek() {
                        if ch == b'\r' || ch == b'\n' {
                            break;
                        }
                        self.consume();
                    }
                    self.reset_capture();
                }
                b'"' => return self.scan_string().map(Some),
                b'-' => match self.peek() {
                    Some(ch) if ch.is_ascii_digit() => return self.scan_number().map(Some),
                    Some(ch) if !is_separator(ch) => return Ok(Some(self.scan_symbol())),
                    _ => return Ok(Some(self.make_token(TokenKind::Symbol))),
                },
                ch if ch.is_ascii_digit() => return self.scan_number().map(Some),
                _ => return Ok(Some(self.scan_symbol())),
            }
        }

        Ok(None)
    }

    fn scan_number(&mut self) -> Result<Token, LexError> {
        let mut found_point = false;
        while let Some(ch) = self.peek() {
            if ch == b'.' {
                self.consume();
                if found_point {
                    return Err(self.error(LexErrorKind::BadNumber));
                }
                found_point = true;
            } else if ch.is_ascii_digit() {
                self.consume();
            } else if !is_separator(ch) {
                self.consume();
                return Err(self.error(LexErrorKind::BadNumber));
            } else {
                break;
            }
        }
        Ok(self.make_token(TokenKind::Number))
    }

    fn scan_symbol(&mut self) -> Token {
        while let Some(ch) = self.peek() {
            if is_separator(ch) {
                break;
            }
            self.consume();
        }
        self.make_token(TokenKind::Symbol)
    }

    fn scan_string(&mut self) -> Result<Token, LexError> {
        // The opening quote is not part of the lexeme.
        self.reset_capture();
        self.begin_capture();

        let mut previous = b'"';
        while let Some(ch) = self.peek() {
            if ch == b'"' && previous != b'\\' {
                let mut token = self.make_token(TokenKind::String);
                token.location.end.column += 1; // include the closing quote
                self.consume();
                return Ok(token);
            }
            if ch == b'\n' || ch == b'\r' {
                return Err(self.error(LexErrorKind::BadString));
            }
            self.consume();
            // A backslash that was itself escaped does not escape the
            // character after it.
            if ch == b'\\' && previous == b'\\' {
                previous = 0;
            } else {
                previous = ch;
            }
        }

        Err(self.error(LexErrorKind::BadString))
    }

    fn make_token(&mut self, kind: TokenKind) -> Token {
        let lexeme = String::from_utf8_lossy(&self.capture).into_owned();
        self.capture.clear();
        self.capturing = false;
        let mut end = self.location;
        end.column -= 1;
        Token {
            kind,
            lexeme,
            location: LocRange::new(self.token_start, end),
        }
    }

    fn error(&mut self, kind: LexErrorKind) -> LexError {
        self.reset_capture();
        let mut end = self.location;
        end.column -= 1;
        LexError {
            kind,
            location: LocRange::new(self.token_start, end),
        }
    }

    fn begin_capture(&mut self) {
        self.capture.clear();
        self.capturing = true;
    }

    fn reset_capture(&mut self) {
        self.capture.clear();
        self.capturing = false;
    }

    fn newline(&mut self) {
        self.location.line += 1;
        self.location.column = 1;
    }

    fn peek(&mut self) -> Option<u8> {
        if let Some(ch) = self.buffered {
            return Some(ch);
        }
        let mut buf = [0u8; 1];
        if self.input.read(&mut buf) == 1 {
            self.buffered = Some(buf[0]);
            Some(buf[0])
        } else {
            self.eos = true;
            None
        }
    }

    fn consume(&mut self) {
        if let Some(ch) = self.buffered.take() {
            if self.capturing {
                self.capture.push(ch);
            }
            self.location.column += 1;
        }
    }
}

fn is_separator(ch: u8) -> bool {
    ch.is_ascii_whitespace()
        || matches!(ch, b'(' | b')' | b';' | b'"' | b'\'' | b'`' | b',')
}
