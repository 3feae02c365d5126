//! AST translation.
//!
//! Turns preprocessed S-expressions into a typed AST, validating the shape
//! of every special form. String escape sequences are decoded here, not in
//! the lexer, so that syntax errors carry column-accurate ranges.

use std::fmt;

use crate::loc::{Loc, LocRange};
use crate::preprocess::quote_datum;
use crate::sexp::Sexp;

/// A compile-time syntax error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    /// What is malformed.
    pub message: String,
    /// The exact range of the offending form.
    pub location: LocRange,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn fail<T>(message: impl Into<String>, location: LocRange) -> Result<T, SyntaxError> {
    Err(SyntaxError {
        message: message.into(),
        location,
    })
}

/// One `let`/`letrec` binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Bound name.
    pub name: String,
    /// Bound expression.
    pub value: Ast,
    /// Range of the `(name expr)` pair.
    pub location: LocRange,
}

/// A typed AST node. Every node carries its source range.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    /// Numeric literal.
    Number {
        /// Value.
        value: f64,
        /// Source range.
        location: LocRange,
    },
    /// String literal with escapes decoded.
    String {
        /// Decoded contents.
        value: String,
        /// Source range.
        location: LocRange,
    },
    /// Quoted symbol literal.
    Symbol {
        /// Symbol text.
        name: String,
        /// Source range.
        location: LocRange,
    },
    /// Variable reference.
    Identifier {
        /// Referenced name.
        name: String,
        /// Source range.
        location: LocRange,
    },
    /// Function application.
    Application {
        /// Callee expression.
        function: Box<Ast>,
        /// Argument expressions, in order.
        arguments: Vec<Ast>,
        /// Source range.
        location: LocRange,
    },
    /// Two- or three-armed conditional.
    If {
        /// Condition.
        condition: Box<Ast>,
        /// Taken when the condition is truthy.
        then: Box<Ast>,
        /// Taken otherwise; `nil` when absent.
        else_: Option<Box<Ast>>,
        /// Source range.
        location: LocRange,
    },
    /// Sequential bindings.
    Let {
        /// Bindings, in order.
        bindings: Vec<Binding>,
        /// Body (at least one expression).
        body: Vec<Ast>,
        /// Source range.
        location: LocRange,
    },
    /// Mutually recursive bindings.
    LetRec {
        /// Bindings, in order.
        bindings: Vec<Binding>,
        /// Body (at least one expression).
        body: Vec<Ast>,
        /// Source range.
        location: LocRange,
    },
    /// Anonymous function.
    Lambda {
        /// Parameter names; a trailing `&name` arrives here stripped.
        parameters: Vec<String>,
        /// Whether the last parameter was declared with `&`.
        is_vararg: bool,
        /// Body (at least one expression).
        body: Vec<Ast>,
        /// Source range.
        location: LocRange,
    },
    /// Expression sequence; empty compiles to `nil`.
    Do {
        /// Body expressions.
        body: Vec<Ast>,
        /// Source range.
        location: LocRange,
    },
}

impl Ast {
    /// Returns this node's source range.
    #[must_use]
    pub fn location(&self) -> LocRange {
        match self {
            Self::Number { location, .. }
            | Self::String { location, .. }
            | Self::Symbol { location, .. }
            | Self::Identifier { location, .. }
            | Self::Application { location, .. }
            | Self::If { location, .. }
            | Self::Let { location, .. }
            | Self::LetRec { location, .. }
            | Self::Lambda { location, .. }
            | Self::Do { location, .. } => *location,
        }
    }
}

/// Translates a (preprocessed) S-expression into an AST.
pub fn translate(sexp: &Sexp) -> Result<Ast, SyntaxError> {
    match sexp {
        Sexp::List { items, location } => {
            if items.is_empty() {
                return fail("Empty list is invalid", *location);
            }
            match items[0].as_symbol() {
                Some("if") => translate_if(items, *location),
                Some("let") => translate_let(items, *location, false),
                Some("letrec") => translate_let(items, *location, true),
                Some("fn") => translate_lambda(items, *location),
                Some("do") => translate_do(items, *location),
                Some("quote") => translate_quote(items, *location),
                Some("unquote" | "unquote-splicing") => {
                    fail("Cannot unquote outside of quote", *location)
                }
                _ => translate_application(items, *location),
            }
        }
        Sexp::Symbol { name, location } => Ok(Ast::Identifier {
            name: name.clone(),
            location: *location,
        }),
        Sexp::String { value, location } => translate_string(value, *location),
        Sexp::Number { value, location } => Ok(Ast::Number {
            value: *value,
            location: *location,
        }),
    }
}

fn translate_block(items: &[Sexp]) -> Result<Vec<Ast>, SyntaxError> {
    items.iter().map(translate).collect()
}

fn translate_if(items: &[Sexp], location: LocRange) -> Result<Ast, SyntaxError> {
    let arity = items.len() - 1;
    if arity != 2 && arity != 3 {
        return fail(
            "'if' must have the form: (if <condition> <then> [else])",
            location,
        );
    }
    let condition = Box::new(translate(&items[1])?);
    let then = Box::new(translate(&items[2])?);
    let else_ = if arity == 3 {
        Some(Box::new(translate(&items[3])?))
    } else {
        None
    };
    Ok(Ast::If {
        condition,
        then,
        else_,
        location,
    })
}

fn translate_let(items: &[Sexp], location: LocRange, recursive: bool) -> Result<Ast, SyntaxError> {
    let arity = items.len() - 1;
    if arity < 2 || items[1].as_list().is_none() {
        return fail(
            if recursive {
                "'letrec' must have the form: (letrec (<bindings...>) <exp...>)"
            } else {
                "'let' must have the form: (let (<bindings...>) <exp...>)"
            },
            location,
        );
    }

    let mut bindings = Vec::new();
    for binding in items[1].as_list().unwrap_or(&[]) {
        let pair = binding.as_list();
        let valid = pair.is_some_and(|pair| pair.len() == 2 && pair[0].as_symbol().is_some());
        if !valid {
            return fail(
                "a binding must have the form: (<symbol> <expr>)",
                binding.location(),
            );
        }
        let pair = pair.unwrap_or(&[]);
        bindings.push(Binding {
            name: pair[0].as_symbol().unwrap_or_default().to_owned(),
            value: translate(&pair[1])?,
            location: binding.location(),
        });
    }

    let body = translate_block(&items[2..])?;
    Ok(if recursive {
        Ast::LetRec {
            bindings,
            body,
            location,
        }
    } else {
        Ast::Let {
            bindings,
            body,
            location,
        }
    })
}

fn translate_lambda(items: &[Sexp], location: LocRange) -> Result<Ast, SyntaxError> {
    let arity = items.len() - 1;
    if arity < 2 || items[1].as_list().is_none() {
        return fail("'fn' must have the form: (fn (<arguments>) <exp...>)", location);
    }

    let params = items[1].as_list().unwrap_or(&[]);
    let mut parameters = Vec::with_capacity(params.len());
    let mut is_vararg = false;
    for (pos, param) in params.iter().enumerate() {
        let Some(mut name) = param.as_symbol() else {
            return fail("argument name must be a symbol", param.location());
        };
        if let Some(stripped) = name.strip_prefix('&') {
            if pos + 1 != params.len() {
                return fail("Only last argument can be prefixed with '&'", param.location());
            }
            if stripped.is_empty() {
                return fail("A lone '&' is not a valid argument name", param.location());
            }
            name = stripped;
            is_vararg = true;
        }
        if parameters.iter().any(|p| p == name) {
            return fail("Duplicated argument name", param.location());
        }
        parameters.push(name.to_owned());
    }

    let body = translate_block(&items[2..])?;
    Ok(Ast::Lambda {
        parameters,
        is_vararg,
        body,
        location,
    })
}

fn translate_do(items: &[Sexp], location: LocRange) -> Result<Ast, SyntaxError> {
    Ok(Ast::Do {
        body: translate_block(&items[1..])?,
        location,
    })
}

fn translate_application(items: &[Sexp], location: LocRange) -> Result<Ast, SyntaxError> {
    let function = Box::new(translate(&items[0])?);
    let arguments = translate_block(&items[1..])?;
    Ok(Ast::Application {
        function,
        arguments,
        location,
    })
}

fn translate_quote(items: &[Sexp], location: LocRange) -> Result<Ast, SyntaxError> {
    if items.len() != 2 {
        return fail("'quote' must have the form: (quote <exp>)", location);
    }
    match &items[1] {
        Sexp::Symbol { name, location } => Ok(Ast::Symbol {
            name: name.clone(),
            location: *location,
        }),
        Sexp::String { value, location } => translate_string(value, *location),
        Sexp::Number { value, location } => Ok(Ast::Number {
            value: *value,
            location: *location,
        }),
        list @ Sexp::List { .. } => {
            let expanded = quote_datum(list.clone()).map_err(|err| SyntaxError {
                message: err.message.to_owned(),
                location: err.location,
            })?;
            translate(&expanded)
        }
    }
}

/// Decodes the escape sequences of a raw string lexeme.
///
/// Recognized: `\a \b \f \n \r \t \v`, `\xHH` (1-2 hex digits) and `\NNN`
/// (1-3 octal digits, value <= 255). Any other `\X` decodes to `X`.
fn translate_string(raw: &str, location: LocRange) -> Result<Ast, SyntaxError> {
    let bytes = raw.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        // Column of the backslash; the lexeme starts one past the quote.
        let escape_start = Loc::new(location.start.line, location.start.column + i as u32 + 1);
        i += 1;
        if i >= bytes.len() {
            break;
        }

        match bytes[i] {
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0B),
            b'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                let mut trailing = None;
                while digits < 2 {
                    i += 1;
                    if i >= bytes.len() {
                        break;
                    }
                    if bytes[i].is_ascii_hexdigit() {
                        value = value * 16 + u32::from((bytes[i] as char).to_digit(16).unwrap_or(0));
                        digits += 1;
                    } else {
                        trailing = Some(bytes[i]);
                        break;
                    }
                }
                if digits == 0 {
                    let end_col = location.start.column + (i.min(bytes.len() - 1)) as u32;
                    return fail(
                        "Invalid hex escape sequence",
                        LocRange::new(
                            escape_start,
                            Loc::new(location.start.line, end_col),
                        ),
                    );
                }
                out.push(value as u8);
                if let Some(ch) = trailing {
                    out.push(ch);
                }
            }
            ch if ch.is_ascii_digit() => {
                let mut text = vec![ch];
                let mut trailing = None;
                while text.len() < 3 {
                    i += 1;
                    if i >= bytes.len() {
                        break;
                    }
                    if (b'0'..=b'7').contains(&bytes[i]) {
                        text.push(bytes[i]);
                    } else {
                        trailing = Some(bytes[i]);
                        break;
                    }
                }
                let valid = text.iter().all(|d| (b'0'..=b'7').contains(d));
                let value = if valid {
                    text.iter()
                        .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'))
                } else {
                    256
                };
                if !valid || value > 255 {
                    let end_col = location.start.column + (i.min(bytes.len() - 1)) as u32;
                    return fail(
                        "Invalid octal escape sequence",
                        LocRange::new(
                            escape_start,
                            Loc::new(location.start.line, end_col),
                        ),
                    );
                }
                out.push(value as u8);
                if let Some(ch) = trailing {
                    out.push(ch);
                }
            }
            other => out.push(other),
        }
        i += 1;
    }

    Ok(Ast::String {
        value: String::from_utf8_lossy(&out).into_owned(),
        location,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::io::SliceInput;
    use crate::parser::Parser;
    use crate::preprocess::preprocess;

    use super::*;

    fn translate_src(src: &str) -> Result<Ast, SyntaxError> {
        let mut parser = Parser::new(SliceInput::new(src.as_bytes()));
        let sexp = parser
            .next_sexp()
            .expect("parses cleanly")
            .expect("has a form");
        let sexp = preprocess(sexp).expect("preprocesses cleanly");
        translate(&sexp)
    }

    fn translate_ok(src: &str) -> Ast {
        translate_src(src).expect("translates cleanly")
    }

    fn syntax_error(src: &str) -> String {
        translate_src(src).expect_err("must fail").message
    }

    fn decoded(src: &str) -> String {
        match translate_ok(src) {
            Ast::String { value, .. } => value,
            other => panic!("expected a string literal, got {other:?}"),
        }
    }

    #[test]
    fn atoms_translate() {
        assert!(matches!(translate_ok("2"), Ast::Number { value, .. } if value == 2.0));
        assert!(matches!(translate_ok("x"), Ast::Identifier { .. }));
        assert!(matches!(translate_ok("'x"), Ast::Symbol { .. }));
    }

    #[test]
    fn if_shapes() {
        assert!(matches!(
            translate_ok("(if a b)"),
            Ast::If { else_: None, .. }
        ));
        assert!(matches!(
            translate_ok("(if a b c)"),
            Ast::If { else_: Some(_), .. }
        ));
        assert_eq!(
            syntax_error("(if a)"),
            "'if' must have the form: (if <condition> <then> [else])"
        );
    }

    #[test]
    fn let_shapes() {
        let Ast::Let { bindings, body, .. } = translate_ok("(let ((x 1) (y 2)) x y)") else {
            panic!("expected a let");
        };
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].name, "x");
        assert_eq!(body.len(), 2);

        assert_eq!(
            syntax_error("(let x 1)"),
            "'let' must have the form: (let (<bindings...>) <exp...>)"
        );
        assert_eq!(
            syntax_error("(letrec (x) 1)"),
            "a binding must have the form: (<symbol> <expr>)"
        );
        assert_eq!(
            syntax_error("(let ((1 2)) 3)"),
            "a binding must have the form: (<symbol> <expr>)"
        );
    }

    #[test]
    fn lambda_shapes() {
        let Ast::Lambda {
            parameters,
            is_vararg,
            ..
        } = translate_ok("(fn (x y) x)")
        else {
            panic!("expected a lambda");
        };
        assert_eq!(parameters, vec!["x", "y"]);
        assert!(!is_vararg);

        assert_eq!(
            syntax_error("(fn x 1)"),
            "'fn' must have the form: (fn (<arguments>) <exp...>)"
        );
        assert_eq!(syntax_error("(fn (1) 2)"), "argument name must be a symbol");
        assert_eq!(syntax_error("(fn (x x) x)"), "Duplicated argument name");
    }

    #[test]
    fn vararg_marks_the_last_parameter() {
        let Ast::Lambda {
            parameters,
            is_vararg,
            ..
        } = translate_ok("(fn (x &rest) rest)")
        else {
            panic!("expected a lambda");
        };
        assert_eq!(parameters, vec!["x", "rest"]);
        assert!(is_vararg);

        assert_eq!(
            syntax_error("(fn (&x y) y)"),
            "Only last argument can be prefixed with '&'"
        );
        assert_eq!(
            syntax_error("(fn (& x))"),
            "Only last argument can be prefixed with '&'"
        );
        assert_eq!(
            syntax_error("(fn (&))"),
            "A lone '&' is not a valid argument name"
        );
    }

    #[test]
    fn do_may_be_empty() {
        assert!(matches!(translate_ok("(do)"), Ast::Do { body, .. } if body.is_empty()));
    }

    #[test]
    fn empty_list_is_invalid() {
        assert_eq!(syntax_error("()"), "Empty list is invalid");
    }

    #[test]
    fn unquote_is_rejected_outside_quotes() {
        let mut parser = Parser::new(SliceInput::new(b"(unquote x)".as_slice()));
        let sexp = parser.next_sexp().expect("parses").expect("has a form");
        // Bypass the preprocessor to exercise the translator's own check.
        let err = translate(&sexp).expect_err("must fail");
        assert_eq!(err.message, "Cannot unquote outside of quote");
    }

    #[test]
    fn named_escapes_decode() {
        assert_eq!(decoded(r#""a\nb\tc""#), "a\nb\tc");
        assert_eq!(decoded(r#""\a\b\f\v""#), "\u{7}\u{8}\u{c}\u{b}");
        assert_eq!(decoded(r#""q\"q""#), "q\"q");
        assert_eq!(decoded(r#""s\\s""#), "s\\s");
    }

    #[test]
    fn unknown_escape_decodes_to_the_character() {
        assert_eq!(decoded(r#""\z""#), "z");
        assert_eq!(decoded(r#""\'""#), "'");
    }

    #[test]
    fn hex_escapes_decode() {
        assert_eq!(decoded(r#""\x41""#), "A");
        assert_eq!(decoded(r#""\x7A""#), "z");
        // One digit followed by a non-hex character keeps the character.
        assert_eq!(decoded(r#""\x4z""#), "\u{4}z");
    }

    #[test]
    fn octal_escapes_decode() {
        assert_eq!(decoded(r#""\101""#), "A");
        assert_eq!(decoded(r#""\60""#), "0");
        assert_eq!(decoded(r#""\0617""#), "17");
    }

    #[test]
    fn malformed_escapes_are_syntax_errors() {
        assert_eq!(syntax_error(r#""\xg""#), "Invalid hex escape sequence");
        assert_eq!(syntax_error(r#""\8""#), "Invalid octal escape sequence");
        assert_eq!(syntax_error(r#""\777""#), "Invalid octal escape sequence");
    }

    #[test]
    fn escape_error_location_is_column_accurate() {
        // The string token starts at column 1 (the quote); the backslash is
        // the third content byte, at column 4.
        let err = translate_src(r#""ab\xq""#).expect_err("must fail");
        assert_eq!(err.location.start.column, 4);
    }

    #[test]
    fn decoding_is_idempotent_without_backslashes() {
        for text in ["", "plain", "a b c", "already\ndecoded"] {
            let src = format!("\"{text}\"");
            assert_eq!(decoded(&src), text);
        }
    }
}
