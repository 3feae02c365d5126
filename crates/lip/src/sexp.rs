//! S-expressions.

use std::fmt;

use crate::loc::LocRange;

/// A parsed S-expression.
///
/// Strings keep their raw lexeme (escape sequences unresolved); decoding
/// happens in the AST translator.
#[derive(Debug, Clone, PartialEq)]
pub enum Sexp {
    /// A numeric literal.
    Number {
        /// Parsed value.
        value: f64,
        /// Source range.
        location: LocRange,
    },
    /// A string literal, escapes unresolved, quotes stripped.
    String {
        /// Raw contents.
        value: String,
        /// Source range (includes the quotes).
        location: LocRange,
    },
    /// A symbol.
    Symbol {
        /// Symbol text.
        name: String,
        /// Source range.
        location: LocRange,
    },
    /// A parenthesized list.
    List {
        /// Elements, in order.
        items: Vec<Sexp>,
        /// Source range (includes the parentheses).
        location: LocRange,
    },
}

impl Sexp {
    /// Creates a synthesized symbol.
    #[must_use]
    pub fn symbol(name: impl Into<String>, location: LocRange) -> Self {
        Self::Symbol {
            name: name.into(),
            location,
        }
    }

    /// Creates a synthesized list.
    #[must_use]
    pub fn list(items: Vec<Self>, location: LocRange) -> Self {
        Self::List { items, location }
    }

    /// Returns this expression's source range.
    #[must_use]
    pub fn location(&self) -> LocRange {
        match self {
            Self::Number { location, .. }
            | Self::String { location, .. }
            | Self::Symbol { location, .. }
            | Self::List { location, .. } => *location,
        }
    }

    /// Returns the symbol text if this is a symbol.
    #[must_use]
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns the elements if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List { items, .. } => Some(items),
            _ => None,
        }
    }

    /// Returns the head symbol if this is a non-empty list whose first
    /// element is a symbol.
    #[must_use]
    pub fn head_symbol(&self) -> Option<&str> {
        self.as_list().and_then(|items| items.first()).and_then(Self::as_symbol)
    }

    /// Structural equality, ignoring source locations.
    #[must_use]
    pub fn structural_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number { value: a, .. }, Self::Number { value: b, .. }) => a == b,
            (Self::String { value: a, .. }, Self::String { value: b, .. }) => a == b,
            (Self::Symbol { name: a, .. }, Self::Symbol { name: b, .. }) => a == b,
            (Self::List { items: a, .. }, Self::List { items: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structural_eq(y))
            }
            _ => false,
        }
    }
}

/// Prints in a canonical single-line form that reparses to a structurally
/// identical tree.
impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number { value, .. } => write!(f, "{value}"),
            Self::String { value, .. } => write!(f, "\"{value}\""),
            Self::Symbol { name, .. } => f.write_str(name),
            Self::List { items, .. } => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}
