//! An embeddable Lisp: a source-to-bytecode compiler paired with a
//! stack-based virtual machine, organized as a library with a host-facing
//! API for loading, calling, and extending programs.
//!
//! # Pipeline
//!
//! Source flows through the lexer, parser, quote preprocessor, AST
//! translator and compiler into a position-independent [`FunctionImage`];
//! linking resolves imports through the runtime's symbol table, and the
//! [`Vm`] executes the result on three stacks (operands, environment,
//! frames) with proper tail calls.
//!
//! # Quick start
//!
//! ```
//! use lip::{Context, Runtime, RuntimeConfig, Value, load_builtins};
//! use lip::io::VecInput;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let mut ctx = Context::new(runtime);
//! load_builtins(&mut ctx);
//!
//! let src = "(letrec ((fact (fn (n) (if (== n 0) 1 (* n (fact (- n 1)))))))
//!              (fact 5))";
//! let mut script = ctx
//!     .load_script("fact.lip", Some(Box::new(VecInput::new(src.into()))), true)
//!     .expect("compiles and links");
//! let mut vm = ctx.create_vm(None);
//! let result = ctx.exec_script(&mut vm, &mut script).expect("runs");
//! assert_eq!(result, Value::Number(120.0));
//! ```
//!
//! # Concurrency
//!
//! A [`Runtime`] is shared; its committed symbol table sits behind a
//! reader-writer lock. A [`Context`] belongs to one thread, and each [`Vm`]
//! runs synchronously. Distinct contexts in distinct threads may execute
//! concurrently against the same runtime.

#![expect(clippy::missing_panics_doc, reason = "internal invariants use expect")]
#![expect(clippy::must_use_candidate, reason = "plain accessors are not annotated")]
#![expect(clippy::unused_self, reason = "method shapes stay API-consistent")]

mod arena;
mod asm;
pub mod ast;
pub mod binder;
mod builtins;
mod compiler;
pub mod error;
pub mod hook;
pub mod image;
pub mod io;
pub mod lexer;
pub mod loc;
mod memblock;
pub mod op;
pub mod parser;
pub mod preprocess;
mod prim;
pub mod repl;
mod runtime;
mod script;
pub mod sexp;
mod symtab;
pub mod value;
pub mod vm;

pub use crate::{
    ast::{Ast, SyntaxError},
    binder::{Args, TypeTag},
    builtins::load_builtins,
    error::{Error, ErrorKind, ErrorRecord},
    hook::{CountingHook, HookCounters, VmHook},
    image::FunctionImage,
    io::{FileSystem, Input, MemoryFs, Output},
    lexer::{LexError, Lexer, Token, TokenKind},
    loc::{Loc, LocRange, NOWHERE},
    op::Opcode,
    parser::{ParseError, Parser},
    repl::{ReplHandler, repl},
    runtime::{Context, NsContext, Runtime, RuntimeConfig},
    script::Script,
    sexp::Sexp,
    value::{Closure, List, NativeFn, NativeResult, Value},
    vm::{Vm, VmConfig},
};
