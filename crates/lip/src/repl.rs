//! Read-eval-print driver.
//!
//! The host supplies a [`ReplHandler`] with a `read` behaving like the
//! stream contract (0 = end of input) and a `print` receiving each
//! top-level result or error. Line editing, prompts and history are the
//! host's business.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::translate;
use crate::compiler::Compiler;
use crate::error::{Error, ErrorKind};
use crate::io::Input;
use crate::parser::{ParseErrorKind, Parser};
use crate::preprocess::preprocess;
use crate::runtime::Context;
use crate::value::Value;
use crate::vm::Vm;

/// Host interface for a REPL session.
pub trait ReplHandler {
    /// Reads more input; 0 ends the session.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Receives one top-level result or error.
    fn print(&mut self, result: Result<Value, Error>);
}

struct HandlerInput<H>(Rc<RefCell<H>>);

impl<H: ReplHandler> Input for HandlerInput<H> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.0.borrow_mut().read(buf)
    }
}

/// Reads top-level forms from the handler, compiling and executing each on
/// `vm`, until the input ends. Each form is its own compilation unit, so a
/// failed form does not poison the next one.
pub fn repl<H: ReplHandler>(ctx: &mut Context, vm: &mut Vm, source_name: &str, handler: H) {
    let handler = Rc::new(RefCell::new(handler));
    let mut parser = Parser::new(HandlerInput(Rc::clone(&handler)));
    let mut compiler = Compiler::new();

    loop {
        match parser.next_sexp() {
            Ok(Some(sexp)) => {
                let result = eval_form(ctx, vm, &mut compiler, source_name, sexp);
                if result.is_err() {
                    vm.reset();
                }
                handler.borrow_mut().print(result);
            }
            Ok(None) => return,
            Err(err) => {
                let kind = match err.kind {
                    ParseErrorKind::Lex(_) => ErrorKind::Lex,
                    _ => ErrorKind::Parse,
                };
                let error =
                    Error::with_record(kind, err.to_string(), source_name, err.location);
                handler.borrow_mut().print(Err(error));
            }
        }
    }
}

fn eval_form(
    ctx: &mut Context,
    vm: &mut Vm,
    compiler: &mut Compiler,
    source_name: &str,
    sexp: crate::sexp::Sexp,
) -> Result<Value, Error> {
    let sexp = preprocess(sexp).map_err(|err| {
        Error::with_record(ErrorKind::Syntax, err.message, source_name, err.location)
    })?;
    let ast = translate(&sexp).map_err(|err| {
        Error::with_record(ErrorKind::Syntax, err.message, source_name, err.location)
    })?;

    compiler.begin(source_name);
    compiler.add(&ast);
    let image = std::sync::Arc::new(compiler.end());

    ctx.begin_load();
    let links = ctx.link_function(&image, source_name);
    ctx.end_load(links.is_ok());
    let links = links?;

    let fun = crate::value::ScriptFn {
        image,
        offset: 0,
        links: std::sync::Arc::new(links),
    };
    let closure = Value::Function(std::sync::Arc::new(crate::value::Closure::script(
        fun,
        Vec::new(),
    )));
    vm.call(&closure, &[])
        .map_err(|error_value| ctx.traceback(vm, &error_value))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::builtins::load_builtins;
    use crate::runtime::{Runtime, RuntimeConfig};

    use super::*;

    struct ScriptedRepl {
        input: Vec<u8>,
        pos: usize,
        results: Vec<Result<Value, Error>>,
    }

    impl ScriptedRepl {
        fn new(input: &str) -> Self {
            Self {
                input: input.as_bytes().to_vec(),
                pos: 0,
                results: Vec::new(),
            }
        }
    }

    impl ReplHandler for Rc<RefCell<ScriptedRepl>> {
        fn read(&mut self, buf: &mut [u8]) -> usize {
            let mut handler = self.borrow_mut();
            let n = buf.len().min(handler.input.len() - handler.pos);
            let pos = handler.pos;
            buf[..n].copy_from_slice(&handler.input[pos..pos + n]);
            handler.pos += n;
            n
        }

        fn print(&mut self, result: Result<Value, Error>) {
            self.borrow_mut().results.push(result);
        }
    }

    #[test]
    fn evaluates_each_form_and_reports_errors_individually() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let mut ctx = Context::new(runtime);
        load_builtins(&mut ctx);
        let mut vm = ctx.create_vm(None);

        let handler = Rc::new(RefCell::new(ScriptedRepl::new(
            "(+ 1 2) (undefined-fn) (* 2 3)",
        )));
        repl(&mut ctx, &mut vm, "<repl>", Rc::clone(&handler));

        let handler = handler.borrow();
        assert_eq!(handler.results.len(), 3);
        assert_eq!(
            handler.results[0].as_ref().ok(),
            Some(&Value::Number(3.0))
        );
        let err = handler.results[1].as_ref().expect_err("undefined symbol");
        assert_eq!(err.message, "Undefined symbol: undefined-fn");
        assert_eq!(
            handler.results[2].as_ref().ok(),
            Some(&Value::Number(6.0))
        );
    }
}
