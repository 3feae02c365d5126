//! Parser: tokens to S-expressions.
//!
//! Reader macros expand here: `'x`, `` `x ``, `,x` and `,@x` parse as
//! `(quote x)`, `(quasiquote x)`, `(unquote x)` and `(unquote-splicing x)`,
//! with the outer range spanning from the reader character through `x`.

use std::fmt;

use crate::io::Input;
use crate::lexer::{LexError, Lexer, Token, TokenKind};
use crate::loc::LocRange;
use crate::sexp::Sexp;

/// Parser failure classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseErrorKind {
    /// The lexer failed; the underlying error is preserved.
    Lex(LexError),
    /// A token that cannot start or continue a form, e.g. a stray `)`.
    UnexpectedToken,
    /// End of stream inside a list; reported at the opening `(`.
    UnterminatedList,
}

/// A parse error with its source range.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    /// What went wrong.
    pub kind: ParseErrorKind,
    /// Where it went wrong.
    pub location: LocRange,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ParseErrorKind::Lex(err) => write!(f, "{err}"),
            ParseErrorKind::UnexpectedToken => write!(f, "Unexpected token"),
            ParseErrorKind::UnterminatedList => write!(f, "Unterminated list"),
        }
    }
}

/// Streaming parser over an [`Input`].
pub struct Parser<I> {
    lexer: Lexer<I>,
}

impl<I: Input> Parser<I> {
    /// Creates a parser reading from `input`.
    pub fn new(input: I) -> Self {
        Self {
            lexer: Lexer::new(input),
        }
    }

    /// Produces the next top-level S-expression, `None` at end of stream.
    pub fn next_sexp(&mut self) -> Result<Option<Sexp>, ParseError> {
        match self.next_token()? {
            Some(token) => self.parse(token).map(Some),
            None => Ok(None),
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, ParseError> {
        self.lexer.next_token().map_err(|err| ParseError {
            location: err.location,
            kind: ParseErrorKind::Lex(err),
        })
    }

    fn parse(&mut self, token: Token) -> Result<Sexp, ParseError> {
        match token.kind {
            TokenKind::LParen => self.parse_list(&token),
            TokenKind::RParen => Err(ParseError {
                kind: ParseErrorKind::UnexpectedToken,
                location: token.location,
            }),
            TokenKind::Number => Ok(Sexp::Number {
                // The lexer only emits digits with at most one point and an
                // optional leading minus, all of which parse as f64.
                value: token.lexeme.parse().unwrap_or_default(),
                location: token.location,
            }),
            TokenKind::String => Ok(Sexp::String {
                value: token.lexeme,
                location: token.location,
            }),
            TokenKind::Symbol => Ok(Sexp::Symbol {
                name: token.lexeme,
                location: token.location,
            }),
            TokenKind::Quote => self.parse_reader_macro(&token, "quote"),
            TokenKind::Quasiquote => self.parse_reader_macro(&token, "quasiquote"),
            TokenKind::Unquote => self.parse_reader_macro(&token, "unquote"),
            TokenKind::UnquoteSplicing => self.parse_reader_macro(&token, "unquote-splicing"),
        }
    }

    fn parse_list(&mut self, open: &Token) -> Result<Sexp, ParseError> {
        let mut items = Vec::new();
        loop {
            let Some(token) = self.next_token()? else {
                return Err(ParseError {
                    kind: ParseErrorKind::UnterminatedList,
                    location: open.location,
                });
            };
            if token.kind == TokenKind::RParen {
                return Ok(Sexp::List {
                    items,
                    location: LocRange::new(open.location.start, token.location.end),
                });
            }
            items.push(self.parse(token)?);
        }
    }

    fn parse_reader_macro(&mut self, token: &Token, symbol: &str) -> Result<Sexp, ParseError> {
        let Some(quoted) = self.next_sexp()? else {
            return Err(ParseError {
                kind: ParseErrorKind::UnexpectedToken,
                location: token.location,
            });
        };
        let location = LocRange::new(token.location.start, quoted.location().end);
        Ok(Sexp::List {
            items: vec![Sexp::symbol(symbol, token.location), quoted],
            location,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::io::SliceInput;
    use crate::loc::Loc;

    use super::*;

    fn parse_one(src: &str) -> Sexp {
        let mut parser = Parser::new(SliceInput::new(src.as_bytes()));
        parser
            .next_sexp()
            .expect("parses cleanly")
            .expect("has a form")
    }

    fn parse_error(src: &str) -> ParseError {
        let mut parser = Parser::new(SliceInput::new(src.as_bytes()));
        loop {
            match parser.next_sexp() {
                Ok(Some(_)) => {}
                Ok(None) => panic!("expected a parse error in {src:?}"),
                Err(err) => return err,
            }
        }
    }

    #[test]
    fn parses_nested_lists() {
        let sexp = parse_one("(a (b 1) \"s\")");
        assert_eq!(sexp.to_string(), "(a (b 1) \"s\")");
    }

    #[test]
    fn stray_rparen_is_unexpected() {
        let err = parse_error(")");
        assert_eq!(err.kind, ParseErrorKind::UnexpectedToken);
        assert_eq!(err.location.start, Loc::new(1, 1));
    }

    #[test]
    fn unterminated_list_reports_the_open_paren() {
        let err = parse_error("(a (b c)");
        assert_eq!(err.kind, ParseErrorKind::UnterminatedList);
        assert_eq!(err.location.start, Loc::new(1, 1));
    }

    #[test]
    fn lex_errors_surface_as_parse_errors() {
        let err = parse_error("(1x)");
        assert!(matches!(err.kind, ParseErrorKind::Lex(_)));
        assert_eq!(err.to_string(), "Malformed number");
    }

    #[test]
    fn reader_macros_expand() {
        assert_eq!(parse_one("'x").to_string(), "(quote x)");
        assert_eq!(parse_one("`x").to_string(), "(quasiquote x)");
        assert_eq!(parse_one(",x").to_string(), "(unquote x)");
        assert_eq!(parse_one(",@x").to_string(), "(unquote-splicing x)");
    }

    #[test]
    fn reader_macro_location_spans_through_the_operand() {
        let sexp = parse_one("'(a b)");
        assert_eq!(
            sexp.location(),
            LocRange::new(Loc::new(1, 1), Loc::new(1, 6))
        );
    }

    #[test]
    fn print_reparse_round_trip() {
        let src = "(letrec ((f (fn (x) (if (> x 0) '(1 2) `(a ,b ,@c))))) (f 10))";
        let first = parse_one(src);
        let second = parse_one(&first.to_string());
        assert!(first.structural_eq(&second));
    }
}
