//! Runtime and context.
//!
//! A [`Runtime`] owns the committed symbol table behind a reader-writer
//! lock; lookups take a read lock, namespace commits take the write lock.
//! A [`Context`] belongs to one thread and carries everything transient:
//! the staged (loading) symbol table, the set of modules currently being
//! loaded (for cycle detection), the last error, and a lazily-created
//! default VM used to execute module top-level code.
//!
//! Module loading is transactional: every namespace a load produces is
//! staged in the context and merged into the runtime only when the
//! outermost load finishes successfully. A failed load leaves the
//! committed table untouched.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::ast::translate;
use crate::compiler::Compiler;
use crate::error::{Error, ErrorKind};
use crate::image::FunctionImage;
use crate::io::{FileSystem, Input, MemoryFs};
use crate::loc::NOWHERE;
use crate::parser::{ParseErrorKind, Parser};
use crate::preprocess::preprocess;
use crate::sexp::Sexp;
use crate::symtab::{SymbolTable, split_symbol};
use crate::value::{Closure, Links, NativeFn, Value, write_value};
use crate::vm::{OutputHandle, Vm, VmConfig};

/// Internal namespace holding the module loader's `declare` binding.
const MODULE_NS: &str = "(*module*)";

/// Runtime configuration.
pub struct RuntimeConfig {
    /// Filesystem the runtime reads modules through.
    pub fs: Arc<dyn FileSystem>,
    /// Module search patterns; `?` expands to the module path with `.`
    /// replaced by `/`, `!` to the literal module name.
    pub module_search_patterns: Vec<String>,
    /// Configuration for VMs created without an explicit one.
    pub default_vm_config: VmConfig,
    /// Output stream handed to VMs (the `print` builtin writes here).
    pub stdout: OutputHandle,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fs: Arc::new(MemoryFs::new()),
            module_search_patterns: [
                "?.lip", "?.lipc", "!.lip", "!.lipc", "?/init.lip", "?/init.lipc", "!/init.lip",
                "!/init.lipc",
            ]
            .map(str::to_owned)
            .to_vec(),
            default_vm_config: VmConfig::default(),
            stdout: Arc::new(Mutex::new(crate::io::StdOutput)),
        }
    }
}

/// A shared runtime. An application typically needs only one; contexts in
/// different threads may load and execute concurrently against it.
pub struct Runtime {
    config: RuntimeConfig,
    symtab: RwLock<SymbolTable>,
}

impl Runtime {
    /// Creates a runtime.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            symtab: RwLock::new(SymbolTable::default()),
        })
    }

    /// The runtime's configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Looks up a committed symbol.
    #[must_use]
    pub fn lookup(&self, namespace: &str, name: &str) -> Option<Value> {
        self.symtab
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(namespace, name)
    }

    fn has_namespace(&self, namespace: &str) -> bool {
        self.symtab
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .has_namespace(namespace)
    }

    fn commit(&self, staged: IndexMap<String, AHashMap<String, Value>>) {
        let mut symtab = self.symtab.write().unwrap_or_else(PoisonError::into_inner);
        for (namespace, content) in staged {
            symtab.merge_namespace(namespace, content);
        }
    }
}

/// An open namespace definition, committed by [`Context::end_ns`] or
/// thrown away by [`Context::discard_ns`].
pub struct NsContext {
    name: String,
    content: AHashMap<String, Value>,
}

impl NsContext {
    /// Defines a native function under `name`.
    pub fn declare_function(&mut self, name: &str, function: impl NativeFn + 'static) {
        let closure = Closure::native(Arc::new(function), Some(Arc::from(name)), Vec::new());
        self.content
            .insert(name.to_owned(), Value::Function(Arc::new(closure)));
    }

    /// Defines an arbitrary value under `name`.
    pub fn declare_value(&mut self, name: &str, value: Value) {
        self.content.insert(name.to_owned(), value);
    }
}

/// State shared with the module loader's `declare` native.
#[derive(Default)]
struct LoadingState {
    /// Staged namespaces, committed together at the outermost load end.
    symtab: IndexMap<String, AHashMap<String, Value>>,
    /// Modules currently being loaded, for cycle detection.
    modules: AHashSet<String>,
    /// The module whose top-level code is executing.
    current_module: Option<String>,
}

/// The `declare` native handed to module top-level code. Registers a
/// closure into the loading namespace under the module being loaded.
struct DeclareFn {
    loading: Arc<Mutex<LoadingState>>,
}

impl NativeFn for DeclareFn {
    fn call(&self, vm: &mut Vm) -> Result<Value, Value> {
        let args = crate::binder::Args::from_vm(vm);
        args.exactly(2)?;
        let Value::Symbol(name) = args.any(0)? else {
            return Err(Value::string("Bad argument #1 (symbol expected)"));
        };
        let Value::Function(function) = args.function(1)? else {
            return Err(Value::string("Bad argument #2 (function expected)"));
        };

        let mut loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(module) = loading.current_module.clone() else {
            return Err(Value::string("`declare` is only valid while loading a module"));
        };
        let named = function.with_debug_name(&name);
        loading
            .symtab
            .entry(module)
            .or_default()
            .insert(name.to_string(), Value::Function(Arc::new(named)));
        Ok(Value::Nil)
    }
}

/// A per-thread context.
pub struct Context {
    runtime: Arc<Runtime>,
    loading: Arc<Mutex<LoadingState>>,
    load_depth: u32,
    declare_fn: Value,
    last_error: Option<Error>,
    default_vm: Option<Vm>,
}

impl Context {
    /// Creates a context on `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let loading = Arc::new(Mutex::new(LoadingState::default()));
        let declare_fn = Value::Function(Arc::new(Closure::native(
            Arc::new(DeclareFn {
                loading: Arc::clone(&loading),
            }),
            Some(Arc::from("declare")),
            Vec::new(),
        )));
        Self {
            runtime,
            loading,
            load_depth: 0,
            declare_fn,
            last_error: None,
            default_vm: None,
        }
    }

    /// The runtime this context belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The last error reported by this context.
    #[must_use]
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub(crate) fn record_error(&mut self, error: Error) -> Error {
        self.last_error = Some(error.clone());
        error
    }

    /// Creates a VM; `None` uses the runtime's default configuration.
    #[must_use]
    pub fn create_vm(&self, config: Option<VmConfig>) -> Vm {
        let config = config.unwrap_or(self.runtime.config.default_vm_config);
        Vm::with_output(config, Arc::clone(&self.runtime.config.stdout))
    }

    /// Runs `body` with the context's default VM, creating it on first use.
    pub(crate) fn with_default_vm<R>(&mut self, body: impl FnOnce(&mut Self, &mut Vm) -> R) -> R {
        let mut vm = self
            .default_vm
            .take()
            .unwrap_or_else(|| self.create_vm(None));
        let result = body(self, &mut vm);
        self.default_vm = Some(vm);
        result
    }

    /// Opens a namespace definition.
    #[must_use]
    pub fn begin_ns(&mut self, name: &str) -> NsContext {
        NsContext {
            name: name.to_owned(),
            content: AHashMap::new(),
        }
    }

    /// Commits a namespace definition; after this returns the symbols are
    /// visible to every VM in the runtime.
    pub fn end_ns(&mut self, ns: NsContext) {
        let mut staged = IndexMap::new();
        staged.insert(ns.name, ns.content);
        self.runtime.commit(staged);
    }

    /// Discards a namespace definition without committing anything.
    pub fn discard_ns(&mut self, ns: NsContext) {
        drop(ns);
    }

    /// Looks up a fully-qualified symbol, checking staged namespaces first
    /// during a load.
    #[must_use]
    pub fn lookup_symbol(&self, symbol: &str) -> Option<Value> {
        let (namespace, name) = split_symbol(symbol);
        {
            let loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(value) = loading.symtab.get(namespace).and_then(|ns| ns.get(name)) {
                return Some(value.clone());
            }
        }
        self.runtime.lookup(namespace, name)
    }

    /// Resolves an import during linking: staged and committed tables
    /// first, then an attempt to load the namespace as a module.
    fn lookup_or_load(&mut self, symbol: &str) -> Result<Value, Error> {
        if symbol == declare_symbol() {
            return Ok(self.declare_fn.clone());
        }
        if let Some(value) = self.lookup_symbol(symbol) {
            return Ok(value);
        }

        let (namespace, _) = split_symbol(symbol);
        let namespace_known = {
            let loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
            loading.symtab.contains_key(namespace)
        } || self.runtime.has_namespace(namespace);

        if namespace.is_empty() || namespace == MODULE_NS || namespace_known {
            return Err(Error::new(
                ErrorKind::Link,
                format!("Undefined symbol: {symbol}"),
            ));
        }

        let load_result = self.do_load_module(namespace);
        match load_result {
            Ok(()) => self.lookup_symbol(symbol).ok_or_else(|| {
                Error::new(ErrorKind::Link, format!("Undefined symbol: {symbol}"))
            }),
            Err(cause) => Err(Error::new(
                ErrorKind::Link,
                format!("Undefined symbol: {symbol}"),
            )
            .caused_by(cause)),
        }
    }

    /// Resolves the imports of the given functions into `links`.
    fn link_offsets(
        &mut self,
        image: &Arc<FunctionImage>,
        links: &Links,
        offsets: &[u32],
        filename: &str,
    ) -> Result<(), Error> {
        for &offset in offsets {
            if links.is_linked(offset) {
                continue;
            }
            let header = image.header(offset);
            let mut values = Vec::with_capacity(header.num_imports as usize);
            for index in 0..header.num_imports as usize {
                let name = image
                    .import_name(offset, index)
                    .unwrap_or_else(|| "?".to_owned());
                let value = self.lookup_or_load(&name).map_err(|mut err| {
                    err.records.push(crate::error::ErrorRecord {
                        filename: filename.to_owned(),
                        location: NOWHERE,
                        message: err.message.clone(),
                    });
                    err
                })?;
                values.push(value);
            }
            links.insert(offset, values.into_boxed_slice());
        }
        Ok(())
    }

    /// Resolves every import of every function in `image`.
    pub(crate) fn link_function(
        &mut self,
        image: &Arc<FunctionImage>,
        filename: &str,
    ) -> Result<Links, Error> {
        let links = Links::default();
        let offsets = image.all_function_offsets();
        self.link_offsets(image, &links, &offsets, filename)?;
        Ok(links)
    }

    /// Brackets a load; loads nest, and only the outermost end commits.
    pub(crate) fn begin_load(&mut self) {
        self.load_depth += 1;
    }

    pub(crate) fn end_load(&mut self, success: bool) {
        self.load_depth -= 1;
        if self.load_depth > 0 {
            return;
        }
        let mut loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        let staged = std::mem::take(&mut loading.symtab);
        loading.modules.clear();
        loading.current_module = None;
        drop(loading);
        if success {
            self.runtime.commit(staged);
        }
    }

    /// Loads a module and all its dependencies. On failure nothing is
    /// committed and the committed table is exactly as before.
    pub fn load_module(&mut self, name: &str) -> Result<(), Error> {
        self.begin_load();
        let result = self.do_load_module(name);
        self.end_load(result.is_ok());
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.record_error(err)),
        }
    }

    fn do_load_module(&mut self, name: &str) -> Result<(), Error> {
        {
            let mut loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
            if !loading.modules.insert(name.to_owned()) {
                return Err(Error::new(
                    ErrorKind::Module,
                    format!("Circular module reference: {name}"),
                ));
            }
        }

        let result = self.do_load_module_inner(name);

        let mut loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        loading.modules.remove(name);
        drop(loading);
        result
    }

    fn do_load_module_inner(&mut self, name: &str) -> Result<(), Error> {
        let (path, mut input) = self.find_module_file(name)?;

        let previous_module = {
            let mut loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
            loading.current_module.replace(name.to_owned())
        };

        let result = self.run_module_source(&path, input.as_mut());

        let mut loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        loading.current_module = previous_module;
        drop(loading);

        self.runtime.config.fs.end_read(input);
        result
    }

    fn find_module_file(&self, name: &str) -> Result<(String, Box<dyn Input + Send>), Error> {
        let as_path = name.replace('.', "/");
        for pattern in &self.runtime.config.module_search_patterns {
            let path = pattern.replace('?', &as_path).replace('!', name);
            if let Ok(input) = self.runtime.config.fs.begin_read(&path) {
                return Ok((path, input));
            }
        }
        Err(Error::new(
            ErrorKind::Module,
            format!("Cannot find module: {name}"),
        ))
    }

    /// Compiles and runs one module file. The root function is linked
    /// before execution so `declare` and top-level references resolve; the
    /// declared functions' bodies are linked afterwards, once the loading
    /// namespace is populated, so declarations can reference each other.
    fn run_module_source(&mut self, path: &str, input: &mut dyn Input) -> Result<(), Error> {
        let image = Arc::new(compile_source(input, path, true)?);
        let links = Arc::new(Links::default());

        self.link_offsets(&image, &links, &[0], path)?;

        let fun = crate::value::ScriptFn {
            image: Arc::clone(&image),
            offset: 0,
            links: Arc::clone(&links),
        };
        let closure = Value::Function(Arc::new(Closure::script(fun, Vec::new())));

        self.with_default_vm(|ctx, vm| match vm.call(&closure, &[]) {
            Ok(_) => Ok(()),
            Err(error_value) => {
                let err = ctx.traceback(vm, &error_value);
                vm.reset();
                Err(err)
            }
        })?;

        let offsets = image.all_function_offsets();
        self.link_offsets(&image, &links, &offsets, path)
    }

    /// Expands a runtime error value into a full traceback error.
    #[must_use]
    pub fn traceback(&self, vm: &Vm, error_value: &Value) -> Error {
        let message = match error_value {
            Value::String(text) => text.to_string(),
            other => {
                let mut text = String::new();
                let _ = write_value(&mut text, other, 3);
                text
            }
        };
        Error {
            kind: ErrorKind::Runtime,
            message,
            records: vm.traceback_records(),
            cause: None,
        }
    }
}

/// Name the module loader rewrites a `declare` head to.
fn declare_symbol() -> &'static str {
    "(*module*)/declare"
}

/// Compiles a stream of source text into a function image. With
/// `module_mode` set, top-level `declare` forms are rewritten into
/// registration calls and nested `declare`s are rejected.
pub(crate) fn compile_source(
    input: &mut dyn Input,
    filename: &str,
    module_mode: bool,
) -> Result<FunctionImage, Error> {
    let mut parser = Parser::new(input);
    let mut compiler = Compiler::new();
    compiler.begin(filename);

    loop {
        match parser.next_sexp() {
            Ok(Some(sexp)) => {
                let sexp = if module_mode {
                    rewrite_declare(sexp, filename)?
                } else {
                    sexp
                };
                let sexp = preprocess(sexp).map_err(|err| {
                    Error::with_record(ErrorKind::Syntax, err.message, filename, err.location)
                })?;
                let ast = translate(&sexp).map_err(|err| {
                    Error::with_record(ErrorKind::Syntax, err.message, filename, err.location)
                })?;
                compiler.add(&ast);
            }
            Ok(None) => return Ok(compiler.end()),
            Err(err) => {
                let kind = match err.kind {
                    ParseErrorKind::Lex(_) => ErrorKind::Lex,
                    _ => ErrorKind::Parse,
                };
                return Err(Error::with_record(
                    kind,
                    err.to_string(),
                    filename,
                    err.location,
                ));
            }
        }
    }
}

/// Rewrites a top-level `(declare (name args…) body…)` form into a call of
/// the module loader's registration native.
fn rewrite_declare(sexp: Sexp, filename: &str) -> Result<Sexp, Error> {
    if sexp.head_symbol() != Some("declare") {
        return Ok(sexp);
    }
    let location = sexp.location();
    let Sexp::List { items, .. } = sexp else {
        unreachable!("a declare head implies a list");
    };

    let shape_error = || {
        Error::with_record(
            ErrorKind::Module,
            "'declare' must have the form: (declare (<name> <arguments>...) <exp...>)",
            filename,
            location,
        )
    };

    if items.len() < 3 {
        return Err(shape_error());
    }
    let Some(signature) = items[1].as_list() else {
        return Err(shape_error());
    };
    let Some(name) = signature.first().and_then(Sexp::as_symbol) else {
        return Err(shape_error());
    };

    for form in &items[2..] {
        if contains_declare(form) {
            return Err(Error::with_record(
                ErrorKind::Module,
                "Cannot use `declare` inside a `declare`-d function",
                filename,
                form.location(),
            ));
        }
    }

    let name_sexp = Sexp::symbol(name, items[1].location());
    let params = signature[1..].to_vec();
    let params_location = items[1].location();

    let mut lambda = vec![
        Sexp::symbol("fn", params_location),
        Sexp::list(params, params_location),
    ];
    lambda.extend_from_slice(&items[2..]);

    Ok(Sexp::list(
        vec![
            Sexp::symbol(declare_symbol(), location),
            Sexp::list(
                vec![Sexp::symbol("quote", params_location), name_sexp],
                params_location,
            ),
            Sexp::list(lambda, location),
        ],
        location,
    ))
}

fn contains_declare(sexp: &Sexp) -> bool {
    match sexp {
        Sexp::List { items, .. } => {
            sexp.head_symbol() == Some("declare") || items.iter().any(contains_declare)
        }
        _ => false,
    }
}
