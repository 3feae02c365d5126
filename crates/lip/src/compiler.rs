//! AST to bytecode.
//!
//! The compiler keeps a stack of scopes, one per function being compiled;
//! each scope owns its assembler and a variable table mapping names to an
//! addressing mode (`LARG`, `LDLV` or `LDCV`) and slot index. Nested
//! function images are stored in the compile arena until the enclosing
//! assembler packs them; the arena is reset at the start of every
//! compilation.
//!
//! Tail calls are not tracked here; the assembler finds them by pattern.

use indexmap::IndexSet;

use crate::arena::Arena;
use crate::asm::Assembler;
use crate::ast::{Ast, Binding};
use crate::image::FunctionImage;
use crate::loc::{LocRange, NOWHERE};
use crate::op::{LDI_MAX, LDI_MIN, Opcode};

type NameSet = IndexSet<String, ahash::RandomState>;

#[derive(Debug, Clone)]
struct Var {
    name: String,
    load_op: Opcode,
    index: u32,
}

struct Scope {
    asm: Assembler,
    vars: Vec<Var>,
    num_args: u16,
    is_vararg: bool,
    current_num_locals: u16,
    max_num_locals: u16,
}

impl Scope {
    fn new(asm: Assembler, num_args: u16, is_vararg: bool) -> Self {
        Self {
            asm,
            vars: Vec::new(),
            num_args,
            is_vararg,
            current_num_locals: 0,
            max_num_locals: 0,
        }
    }

    /// Innermost binding of `name`, honoring shadowing.
    fn find_var(&self, name: &str) -> Option<Var> {
        self.vars.iter().rev().find(|var| var.name == name).cloned()
    }
}

/// Single-pass bytecode compiler.
pub(crate) struct Compiler {
    source_name: String,
    scopes: Vec<Scope>,
    arena: Arena,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            source_name: String::new(),
            scopes: Vec::new(),
            arena: Arena::new(1024, false),
        }
    }

    /// Starts compiling a unit named `source_name`. A leading `NIL` gives
    /// the first expression's `POP` something to drop and makes an empty
    /// unit return nil.
    pub fn begin(&mut self, source_name: &str) {
        self.source_name = source_name.to_owned();
        self.scopes.clear();
        self.arena.reset();
        self.scopes
            .push(Scope::new(Assembler::new(source_name, NOWHERE), 0, false));
        self.emit(Opcode::Nil, 0, NOWHERE);
    }

    /// Appends a top-level expression.
    pub fn add(&mut self, ast: &Ast) {
        self.emit(Opcode::Pop, 1, NOWHERE);
        self.compile_exp(ast);
    }

    /// Finishes the unit and packs the image.
    pub fn end(&mut self) -> FunctionImage {
        self.emit(Opcode::Ret, 0, NOWHERE);
        self.end_scope()
    }

    fn scope(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    fn emit(&mut self, opcode: Opcode, operand: i32, location: LocRange) {
        self.scope().asm.add(opcode, operand, location);
    }

    fn end_scope(&mut self) -> FunctionImage {
        let scope = self.scopes.pop().expect("scope stack is never empty");
        scope.asm.end(
            scope.num_args,
            scope.is_vararg,
            scope.max_num_locals,
            &self.arena,
        )
    }

    fn compile_exp(&mut self, ast: &Ast) {
        match ast {
            Ast::Number { value, location } => self.compile_number(*value, *location),
            Ast::String { value, location } => {
                let index = self.scope().asm.alloc_string_constant(value);
                self.emit(Opcode::Ldk, index.cast_signed(), *location);
            }
            Ast::Symbol { name, location } => {
                let index = self.scope().asm.alloc_symbol(name);
                self.emit(Opcode::Ldk, index.cast_signed(), *location);
            }
            Ast::Identifier { name, location } => self.compile_identifier(name, *location),
            Ast::Application {
                function,
                arguments,
                location,
            } => {
                for argument in arguments.iter().rev() {
                    self.compile_exp(argument);
                }
                self.compile_exp(function);
                let argc = i32::try_from(arguments.len()).expect("argument count exceeds i32");
                self.emit(Opcode::Call, argc, *location);
            }
            Ast::If {
                condition,
                then,
                else_,
                ..
            } => self.compile_if(condition, then, else_.as_deref()),
            Ast::Let { bindings, body, .. } => self.compile_let(bindings, body),
            Ast::LetRec { bindings, body, .. } => self.compile_letrec(bindings, body),
            Ast::Lambda { .. } => self.compile_lambda(ast),
            Ast::Do { body, .. } => self.compile_block(body),
        }
    }

    fn compile_number(&mut self, value: f64, location: LocRange) {
        let as_int = value as i32;
        if f64::from(as_int) == value && (LDI_MIN..=LDI_MAX).contains(&as_int) {
            self.emit(Opcode::Ldi, as_int, location);
        } else {
            let index = self.scope().asm.alloc_numeric_constant(value);
            self.emit(Opcode::Ldk, index.cast_signed(), location);
        }
    }

    fn compile_identifier(&mut self, name: &str, location: LocRange) {
        if let Some(var) = self.scope().find_var(name) {
            self.emit(var.load_op, var.index.cast_signed(), location);
        } else {
            match name {
                "true" => self.emit(Opcode::Ldb, 1, location),
                "false" => self.emit(Opcode::Ldb, 0, location),
                "nil" => self.emit(Opcode::Nil, 0, location),
                _ => {
                    let index = self.scope().asm.alloc_import(name);
                    self.emit(Opcode::Imp, index.cast_signed(), location);
                }
            }
        }
    }

    fn compile_if(&mut self, condition: &Ast, then: &Ast, else_: Option<&Ast>) {
        self.compile_exp(condition);
        let else_label = self.scope().asm.new_label();
        let done_label = self.scope().asm.new_label();
        self.emit(Opcode::Jof, else_label.0.cast_signed(), NOWHERE);
        self.compile_exp(then);
        self.emit(Opcode::Jmp, done_label.0.cast_signed(), NOWHERE);
        self.scope().asm.add_label(else_label, NOWHERE);
        match else_ {
            Some(else_) => self.compile_exp(else_),
            None => self.emit(Opcode::Nil, 0, NOWHERE),
        }
        self.scope().asm.add_label(done_label, NOWHERE);
    }

    /// Emits a body sequence, dropping every result but the last.
    fn compile_block(&mut self, block: &[Ast]) {
        match block {
            [] => self.emit(Opcode::Nil, 0, NOWHERE),
            [only] => self.compile_exp(only),
            [init @ .., last] => {
                for exp in init {
                    self.compile_exp(exp);
                }
                let n = i32::try_from(init.len()).expect("block length exceeds i32");
                self.emit(Opcode::Pop, n, NOWHERE);
                self.compile_exp(last);
            }
        }
    }

    fn alloc_local(&mut self, name: &str) -> u32 {
        let scope = self.scope();
        let index = u32::from(scope.current_num_locals);
        scope.current_num_locals += 1;
        scope.max_num_locals = scope.max_num_locals.max(scope.current_num_locals);
        scope.vars.push(Var {
            name: name.to_owned(),
            load_op: Opcode::Ldlv,
            index,
        });
        index
    }

    fn compile_let(&mut self, bindings: &[Binding], body: &[Ast]) {
        let saved_vars = self.scope().vars.len();
        let saved_locals = self.scope().current_num_locals;

        for binding in bindings {
            self.compile_exp(&binding.value);
            let local = self.alloc_local(&binding.name);
            self.emit(Opcode::Set, local.cast_signed(), binding.location);
        }

        self.compile_block(body);

        self.scope().vars.truncate(saved_vars);
        self.scope().current_num_locals = saved_locals;
    }

    fn compile_letrec(&mut self, bindings: &[Binding], body: &[Ast]) {
        let saved_vars = self.scope().vars.len();
        let saved_locals = self.scope().current_num_locals;

        // Every binding gets a placeholder slot before any value runs.
        let mut locals = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let local = self.alloc_local(&binding.name);
            self.emit(Opcode::Plhr, local.cast_signed(), NOWHERE);
            locals.push(local);
        }

        for (binding, &local) in bindings.iter().zip(&locals) {
            self.compile_exp(&binding.value);
            self.emit(Opcode::Set, local.cast_signed(), binding.location);
        }

        // Patch captured placeholders now that every sibling is bound.
        for &local in &locals {
            self.emit(Opcode::Rcls, local.cast_signed(), NOWHERE);
        }

        self.compile_block(body);

        self.scope().vars.truncate(saved_vars);
        self.scope().current_num_locals = saved_locals;
    }

    fn compile_lambda(&mut self, ast: &Ast) {
        let Ast::Lambda {
            parameters,
            is_vararg,
            body,
            location,
        } = ast
        else {
            return;
        };

        let num_args = u16::try_from(parameters.len()).expect("parameter count exceeds u16");
        let mut scope = Scope::new(
            Assembler::new(self.source_name.clone(), *location),
            num_args,
            *is_vararg,
        );
        for (index, parameter) in parameters.iter().enumerate() {
            scope.vars.push(Var {
                name: parameter.clone(),
                load_op: Opcode::Larg,
                index: u32::try_from(index).expect("parameter count exceeds u32"),
            });
        }

        // Free variables resolvable in the enclosing scope become captures;
        // anything else compiles to an import at its reference site.
        let mut free_names = NameSet::default();
        find_free_vars(ast, &mut free_names);
        let mut captures = Vec::new();
        for name in &free_names {
            let Some(outer) = self.scope().find_var(name) else {
                continue;
            };
            let capture_index = u32::try_from(captures.len()).expect("capture count exceeds u32");
            scope.vars.push(Var {
                name: name.clone(),
                load_op: Opcode::Ldcv,
                index: capture_index,
            });
            captures.push(outer);
        }

        self.scopes.push(scope);
        self.compile_block(body);
        self.emit(Opcode::Ret, 0, NOWHERE);
        let image = self.end_scope();

        let fn_index = {
            let arena = &mut self.arena;
            let scope = self.scopes.last_mut().expect("scope stack is never empty");
            scope.asm.new_function(&image, arena)
        };
        let operand =
            (fn_index.cast_signed() & 0xFFF) | ((i32::try_from(captures.len()).expect("capture count exceeds i32") & 0xFFF) << 12);
        self.emit(Opcode::Cls, operand, *location);
        // Mode-tagged pseudo-instructions the VM reads to source each
        // capture from the creating frame.
        for capture in &captures {
            self.emit(capture.load_op, capture.index.cast_signed(), NOWHERE);
        }
    }
}

/// Collects identifiers referenced by `ast` that no binder inside `ast`
/// resolves, in first-reference order.
fn find_free_vars(ast: &Ast, out: &mut NameSet) {
    match ast {
        Ast::Identifier { name, .. } => {
            out.insert(name.clone());
        }
        Ast::If {
            condition,
            then,
            else_,
            ..
        } => {
            find_free_vars(condition, out);
            find_free_vars(then, out);
            if let Some(else_) = else_ {
                find_free_vars(else_, out);
            }
        }
        Ast::Application {
            function,
            arguments,
            ..
        } => {
            for argument in arguments {
                find_free_vars(argument, out);
            }
            find_free_vars(function, out);
        }
        Ast::Lambda {
            parameters, body, ..
        } => {
            for exp in body {
                find_free_vars(exp, out);
            }
            for parameter in parameters {
                out.shift_remove(parameter);
            }
        }
        Ast::Do { body, .. } => {
            for exp in body {
                find_free_vars(exp, out);
            }
        }
        Ast::Let { bindings, body, .. } => {
            for exp in body {
                find_free_vars(exp, out);
            }
            for binding in bindings.iter().rev() {
                out.shift_remove(&binding.name);
                find_free_vars(&binding.value, out);
            }
        }
        Ast::LetRec { bindings, body, .. } => {
            for exp in body {
                find_free_vars(exp, out);
            }
            for binding in bindings.iter().rev() {
                find_free_vars(&binding.value, out);
            }
            for binding in bindings.iter().rev() {
                out.shift_remove(&binding.name);
            }
        }
        Ast::Number { .. } | Ast::String { .. } | Ast::Symbol { .. } => {}
    }
}
