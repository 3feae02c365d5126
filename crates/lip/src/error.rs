//! Structured error records.
//!
//! Every public entry point reports failure through [`Error`]: a kind, a
//! message, zero or more location records (compile-time context or a runtime
//! traceback), and an optional causing error. `Display` renders the record
//! in the same shape the CLI printer uses:
//!
//! ```text
//! Error: Undefined symbol: foo/bar.
//!   main.lip:3:1 - 3:12: ?.
//! caused by: Cannot find module: foo.
//! ```

use std::fmt;

use crate::loc::LocRange;

/// Classification of an error, per stage of the pipeline that produced it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::IntoStaticStr,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum ErrorKind {
    /// Malformed number or string in the lexer.
    Lex,
    /// Unexpected token or unterminated list in the parser.
    Parse,
    /// Special-form shape or escape-sequence error in the AST translator.
    Syntax,
    /// Unresolved import at load time.
    Link,
    /// Type mismatch, arity error, user `throw`, or stack overflow.
    Runtime,
    /// Bytecode header mismatch.
    Format,
    /// Filesystem or stream failure.
    Io,
    /// Module cycle, module not found, or misuse of `declare`.
    Module,
}

/// One traceback or context record: where something happened.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorRecord {
    /// File the record points into.
    pub filename: String,
    /// Location in the file; [`crate::NOWHERE`](crate::loc::NOWHERE) when unknown.
    pub location: LocRange,
    /// Record detail; for traceback records, the function name.
    pub message: String,
}

/// The last error of a context.
#[derive(Debug, Clone)]
pub struct Error {
    /// What stage failed.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Context records, innermost first (for tracebacks: top frame first).
    pub records: Vec<ErrorRecord>,
    /// The error that led to this one.
    pub cause: Option<Box<Error>>,
}

impl Error {
    /// Creates an error with no records.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            records: Vec::new(),
            cause: None,
        }
    }

    /// Creates an error with a single record.
    #[must_use]
    pub fn with_record(
        kind: ErrorKind,
        message: impl Into<String>,
        filename: impl Into<String>,
        location: LocRange,
    ) -> Self {
        let message = message.into();
        let record = ErrorRecord {
            filename: filename.into(),
            location,
            message: message.clone(),
        };
        Self {
            kind,
            message,
            records: vec![record],
            cause: None,
        }
    }

    /// Attaches a causing error, returning `self`.
    #[must_use]
    pub fn caused_by(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Walks to the deepest cause in the chain.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut err = self;
        while let Some(cause) = &err.cause {
            err = cause;
        }
        err
    }
}

fn write_one(f: &mut fmt::Formatter<'_>, err: &Error, first: bool) -> fmt::Result {
    writeln!(
        f,
        "{}: {}.",
        if first { "Error" } else { "caused by" },
        err.message
    )?;
    for record in &err.records {
        if record.location.is_nowhere() {
            writeln!(f, "  {}: {}.", record.filename, record.message)?;
        } else {
            writeln!(
                f,
                "  {}:{}: {}.",
                record.filename, record.location, record.message
            )?;
        }
    }
    if let Some(cause) = &err.cause {
        write_one(f, cause, false)?;
    }
    Ok(())
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_one(f, self, true)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}
