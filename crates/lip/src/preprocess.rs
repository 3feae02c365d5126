//! Quote expansion.
//!
//! Rewrites `quote`, `quasiquote`, `unquote` and `unquote-splicing` forms
//! into calls to `/list` and `list/concat` before AST translation. `(quote
//! <symbol>)` is left intact for the translator, which turns it into a
//! symbol literal.

use crate::loc::LocRange;
use crate::sexp::Sexp;

/// A quote-expansion error; always a compile-time syntax failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessError {
    /// What is malformed.
    pub message: &'static str,
    /// The exact range of the offending form.
    pub location: LocRange,
}

fn fail<T>(message: &'static str, location: LocRange) -> Result<T, PreprocessError> {
    Err(PreprocessError { message, location })
}

/// Expands quoting forms in `sexp`, recursively.
pub fn preprocess(sexp: Sexp) -> Result<Sexp, PreprocessError> {
    let Sexp::List { mut items, location } = sexp else {
        return Ok(sexp);
    };
    if items.is_empty() {
        return Ok(Sexp::List { items, location });
    }

    let head = items[0].as_symbol().map(str::to_owned);
    match head.as_deref() {
        Some("quote") => {
            if items.len() != 2 {
                return fail("'quote' must have the form: (quote <sexp>)", location);
            }
            if matches!(items[1], Sexp::Symbol { .. }) {
                return Ok(Sexp::List { items, location });
            }
            let quoted = quote(items.remove(1))?;
            preprocess(quoted)
        }
        Some("quasiquote") => {
            if items.len() != 2 {
                return fail(
                    "'quasiquote' must have the form: (quasiquote <sexp>)",
                    location,
                );
            }
            let expanded = quasiquote(items.remove(1))?;
            preprocess(expanded)
        }
        Some("unquote") => fail("Cannot unquote outside of quasiquote", location),
        Some("unquote-splicing") => fail(
            "Cannot unquote-splicing outside of quasiquoted list",
            location,
        ),
        _ => {
            let items = items
                .into_iter()
                .map(preprocess)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Sexp::List { items, location })
        }
    }
}

/// Expands a quoted datum the way `quote` does; used by the AST translator
/// when it meets a `(quote <list>)` that bypassed preprocessing.
pub(crate) fn quote_datum(sexp: Sexp) -> Result<Sexp, PreprocessError> {
    quote(sexp)
}

/// `quote` expansion: atoms stay literal, symbols become `(quote sym)`,
/// lists become `(/list …)` applications.
fn quote(sexp: Sexp) -> Result<Sexp, PreprocessError> {
    match sexp {
        Sexp::Number { .. } | Sexp::String { .. } => Ok(sexp),
        Sexp::Symbol { .. } => {
            let location = sexp.location();
            Ok(Sexp::list(
                vec![Sexp::symbol("quote", location), sexp],
                location,
            ))
        }
        Sexp::List { items, location } => {
            let mut new_items = Vec::with_capacity(items.len() + 1);
            new_items.push(Sexp::symbol("/list", location));
            for item in items {
                new_items.push(quote(item)?);
            }
            Ok(Sexp::list(new_items, location))
        }
    }
}

/// `quasiquote` expansion. Atoms behave like `quote`; lists become
/// `(list/concat …)` with unquote-splicing elements contributing their
/// expression directly and every other element contributing a one-element
/// `/list`.
fn quasiquote(sexp: Sexp) -> Result<Sexp, PreprocessError> {
    match sexp {
        Sexp::Number { .. } | Sexp::String { .. } | Sexp::Symbol { .. } => quote(sexp),
        Sexp::List { mut items, location } => {
            let is_unquote = items.first().and_then(Sexp::as_symbol) == Some("unquote");
            let is_splice =
                items.first().and_then(Sexp::as_symbol) == Some("unquote-splicing");
            if is_unquote {
                if items.len() != 2 {
                    return fail("'unquote' must have the form: (unquote <sexp>)", location);
                }
                Ok(items.remove(1))
            } else if is_splice {
                fail(
                    "Cannot unquote-splicing outside of quasiquoted list",
                    location,
                )
            } else {
                quasiquote_list(items, location)
            }
        }
    }
}

fn quasiquote_list(items: Vec<Sexp>, location: LocRange) -> Result<Sexp, PreprocessError> {
    let mut new_items = Vec::with_capacity(items.len() + 1);
    new_items.push(Sexp::symbol("list/concat", location));

    for item in items {
        let item_location = item.location();
        let is_splice = item.head_symbol() == Some("unquote-splicing");
        if is_splice {
            let Sexp::List { mut items, .. } = item else {
                unreachable!("head_symbol implies a list");
            };
            if items.len() != 2 {
                return fail(
                    "'unquote-splicing' must have the form: (unquote-splicing <sexp>)",
                    item_location,
                );
            }
            let spliced = items.remove(1);
            if matches!(spliced, Sexp::Number { .. } | Sexp::String { .. }) {
                return fail(
                    "The expression passed to unquote-splicing must evaluate to a list",
                    spliced.location(),
                );
            }
            new_items.push(spliced);
        } else {
            let expanded = quasiquote(item)?;
            new_items.push(Sexp::list(
                vec![Sexp::symbol("/list", item_location), expanded],
                item_location,
            ));
        }
    }

    Ok(Sexp::list(new_items, location))
}
