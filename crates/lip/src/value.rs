//! Runtime values.
//!
//! Values are self-contained: strings, symbols, lists, functions and opaque
//! native data are all reference-counted, so any value can be pushed on a
//! VM stack, captured by a closure or committed to the shared symbol table.
//! Lists share backing storage when sliced, so `list/tail` never copies
//! element ranges.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use ahash::AHashMap;

use crate::image::FunctionImage;
use crate::vm::Vm;

/// Outcome of a native function: a result value, or an error value
/// (typically a string) that unwinds the VM.
pub type NativeResult = Result<Value, Value>;

/// A host function callable from scripts.
///
/// The function reads its arguments and bound environment through the
/// [`Vm`] it is handed; see [`Vm::args`] and [`Vm::env`].
pub trait NativeFn: Send + Sync {
    /// Invokes the function.
    fn call(&self, vm: &mut Vm) -> NativeResult;

    /// Host-side source position attached to traceback records.
    fn location(&self) -> Option<(&'static str, u32)> {
        None
    }
}

impl<F> NativeFn for F
where
    F: Fn(&mut Vm) -> NativeResult + Send + Sync,
{
    fn call(&self, vm: &mut Vm) -> NativeResult {
        self(vm)
    }
}

/// A runtime value.
#[derive(Clone, Default)]
pub enum Value {
    /// The null value.
    #[default]
    Nil,
    /// A boolean.
    Boolean(bool),
    /// A double precision number.
    Number(f64),
    /// An immutable string.
    String(Arc<str>),
    /// A symbol; same representation as a string, distinct identity.
    Symbol(Arc<str>),
    /// An immutable list.
    List(List),
    /// A script or native closure.
    Function(Arc<Closure>),
    /// Letrec initialization sentinel carrying its local slot index.
    Placeholder(u32),
    /// Opaque host data.
    Native(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Creates a string value.
    #[must_use]
    pub fn string(text: impl AsRef<str>) -> Self {
        Self::String(Arc::from(text.as_ref()))
    }

    /// Creates a symbol value.
    #[must_use]
    pub fn symbol(text: impl AsRef<str>) -> Self {
        Self::Symbol(Arc::from(text.as_ref()))
    }

    /// Creates a list value owning `items`.
    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(List::from_vec(items))
    }

    /// Creates an anonymous native function with a bound environment.
    #[must_use]
    pub fn native_fn(function: impl NativeFn + 'static, env: Vec<Self>) -> Self {
        Self::Function(Arc::new(Closure::native(Arc::new(function), None, env)))
    }

    /// The value's type name, as used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::List(_) => "list",
            Self::Function(_) => "function",
            Self::Placeholder(_) => "placeholder",
            Self::Native(_) => "native",
        }
    }

    /// `true` only for nil and `false`; everything else is truthy.
    #[must_use]
    pub fn is_falsy(&self) -> bool {
        matches!(self, Self::Nil | Self::Boolean(false))
    }

    /// Discriminant used when ordering values of unequal types.
    fn tag(&self) -> u8 {
        match self {
            Self::Nil => 0,
            Self::Number(_) => 1,
            Self::Boolean(_) => 2,
            Self::String(_) => 3,
            Self::Symbol(_) => 4,
            Self::List(_) => 5,
            Self::Function(_) => 6,
            Self::Placeholder(_) => 7,
            Self::Native(_) => 8,
        }
    }
}

/// The total-but-arbitrary ordering behind `cmp` and the comparison
/// opcodes. Identical tags compare within the type: numbers numerically,
/// strings and symbols by bytes, placeholders by index, lists, functions
/// and native data by reference identity. Unequal tags compare by tag.
#[must_use]
pub fn generic_cmp(lhs: &Value, rhs: &Value) -> Ordering {
    let tag_order = lhs.tag().cmp(&rhs.tag());
    if tag_order != Ordering::Equal {
        return tag_order;
    }
    match (lhs, rhs) {
        (Value::Nil, Value::Nil) => Ordering::Equal,
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) | (Value::Symbol(a), Value::Symbol(b)) => {
            a.as_bytes().cmp(b.as_bytes())
        }
        (Value::Placeholder(a), Value::Placeholder(b)) => a.cmp(b),
        (Value::List(a), Value::List(b)) => a.identity().cmp(&b.identity()),
        (Value::Function(a), Value::Function(b)) => {
            (Arc::as_ptr(a) as usize).cmp(&(Arc::as_ptr(b) as usize))
        }
        (Value::Native(a), Value::Native(b)) => {
            (Arc::as_ptr(a).cast::<()>() as usize).cmp(&(Arc::as_ptr(b).cast::<()>() as usize))
        }
        _ => Ordering::Equal,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        generic_cmp(self, other) == Ordering::Equal
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("Nil"),
            Self::Boolean(b) => write!(f, "Boolean({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Symbol(s) => write!(f, "Symbol({s})"),
            Self::List(l) => write!(f, "List({:?})", l.elements()),
            Self::Function(c) => write!(f, "Function({c:?})"),
            Self::Placeholder(i) => write!(f, "Placeholder({i})"),
            Self::Native(_) => f.write_str("Native(..)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, 3)
    }
}

/// Writes `value` with lists truncated below `max_depth`.
pub fn write_value(out: &mut dyn fmt::Write, value: &Value, max_depth: u32) -> fmt::Result {
    match value {
        Value::Nil => out.write_str("nil"),
        Value::Boolean(true) => out.write_str("true"),
        Value::Boolean(false) => out.write_str("false"),
        Value::Number(n) => write!(out, "{n}"),
        Value::String(s) => write!(out, "\"{s}\""),
        Value::Symbol(s) => out.write_str(s),
        Value::List(list) => {
            if max_depth == 0 {
                return out.write_str("(...)");
            }
            out.write_str("(")?;
            for (i, item) in list.elements().iter().enumerate() {
                if i > 0 {
                    out.write_str(" ")?;
                }
                write_value(out, item, max_depth - 1)?;
            }
            out.write_str(")")
        }
        Value::Function(closure) => match &closure.debug_name {
            Some(name) => write!(out, "<function: {name}>"),
            None => out.write_str("<function>"),
        },
        Value::Placeholder(index) => write!(out, "<placeholder: #{index}>"),
        Value::Native(_) => out.write_str("<native>"),
    }
}

/// An immutable list. Slicing shares the backing storage, so `tail` is
/// O(1) and keeps the parent elements alive.
#[derive(Clone)]
pub struct List(Arc<ListData>);

struct ListData {
    backing: Arc<[Value]>,
    start: usize,
    len: usize,
}

impl List {
    /// Creates a list owning `items`.
    #[must_use]
    pub fn from_vec(items: Vec<Value>) -> Self {
        let len = items.len();
        Self(Arc::new(ListData {
            backing: items.into(),
            start: 0,
            len,
        }))
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len
    }

    /// Whether the list has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// The elements as a contiguous slice.
    #[must_use]
    pub fn elements(&self) -> &[Value] {
        &self.0.backing[self.0.start..self.0.start + self.0.len]
    }

    /// Element `index`, if in range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.elements().get(index)
    }

    /// Everything but the first element, sharing the backing storage.
    /// `None` on an empty list.
    #[must_use]
    pub fn tail(&self) -> Option<Self> {
        if self.0.len == 0 {
            return None;
        }
        Some(Self(Arc::new(ListData {
            backing: Arc::clone(&self.0.backing),
            start: self.0.start + 1,
            len: self.0.len - 1,
        })))
    }

    /// `true` when both lists view the same backing storage.
    #[must_use]
    pub fn shares_backing_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0.backing, &other.0.backing)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.elements()).finish()
    }
}

/// Resolved import values of a linked script, keyed by function offset.
///
/// Module loading links in two phases — the root function before the module
/// body runs, the nested functions afterwards — so the table accepts late
/// insertions behind a read-write lock; the image itself is never mutated.
#[derive(Debug, Default)]
pub(crate) struct Links {
    by_offset: RwLock<AHashMap<u32, Box<[Value]>>>,
}

impl Links {
    pub fn insert(&self, fn_offset: u32, values: Box<[Value]>) {
        self.by_offset
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fn_offset, values);
    }

    pub fn get(&self, fn_offset: u32, index: usize) -> Option<Value> {
        self.by_offset
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fn_offset)?
            .get(index)
            .cloned()
    }

    pub fn is_linked(&self, fn_offset: u32) -> bool {
        self.by_offset
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&fn_offset)
    }
}

/// A compiled function inside a linked image.
#[derive(Clone)]
pub(crate) struct ScriptFn {
    /// The image holding the bytecode.
    pub image: Arc<FunctionImage>,
    /// Byte offset of this function within the image.
    pub offset: u32,
    /// Resolved imports for every function of the image.
    pub links: Arc<Links>,
}

impl ScriptFn {
    pub fn instruction(&self, pc: usize) -> Option<u32> {
        self.image.instruction(self.offset, pc)
    }
}

impl fmt::Debug for ScriptFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFn")
            .field("offset", &self.offset)
            .field("source", &self.image.source_name(self.offset))
            .finish()
    }
}

pub(crate) enum ClosureKind {
    /// Bytecode function plus captured environment.
    Script(ScriptFn),
    /// Host function plus bound environment.
    Native(Arc<dyn NativeFn>),
}

/// A callable value: a script function or a native function, either way
/// carrying an environment array.
///
/// The environment sits behind a mutex because `RCLS` patches sibling
/// placeholders after the closure is constructed and possibly already
/// captured by other closures.
pub struct Closure {
    pub(crate) kind: ClosureKind,
    pub(crate) debug_name: Option<Arc<str>>,
    pub(crate) env: Mutex<Box<[Value]>>,
}

impl Closure {
    pub(crate) fn script(fun: ScriptFn, env: Vec<Value>) -> Self {
        Self {
            kind: ClosureKind::Script(fun),
            debug_name: None,
            env: Mutex::new(env.into_boxed_slice()),
        }
    }

    pub(crate) fn native(
        function: Arc<dyn NativeFn>,
        debug_name: Option<Arc<str>>,
        env: Vec<Value>,
    ) -> Self {
        Self {
            kind: ClosureKind::Native(function),
            debug_name,
            env: Mutex::new(env.into_boxed_slice()),
        }
    }

    /// Whether this is a native closure.
    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self.kind, ClosureKind::Native(_))
    }

    /// The closure's debug name, when one was declared.
    #[must_use]
    pub fn debug_name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }

    /// Clones this closure with a debug name attached.
    pub(crate) fn with_debug_name(&self, name: &str) -> Self {
        Self {
            kind: match &self.kind {
                ClosureKind::Script(fun) => ClosureKind::Script(fun.clone()),
                ClosureKind::Native(fun) => ClosureKind::Native(Arc::clone(fun)),
            },
            debug_name: Some(Arc::from(name)),
            env: Mutex::new(self.env_snapshot().into_boxed_slice()),
        }
    }

    /// Copies the captured environment out.
    #[must_use]
    pub fn env_snapshot(&self) -> Vec<Value> {
        self.env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_vec()
    }

    pub(crate) fn env_get(&self, index: usize) -> Option<Value> {
        self.env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    pub(crate) fn env_len(&self) -> usize {
        self.env.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Replaces every placeholder in the environment using `resolve`, which
    /// maps a placeholder's local index to its current value.
    pub(crate) fn patch_placeholders(&self, resolve: impl Fn(u32) -> Option<Value>) {
        let mut env = self.env.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in env.iter_mut() {
            if let Value::Placeholder(index) = slot
                && let Some(value) = resolve(*index)
            {
                *slot = value;
            }
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ClosureKind::Script(fun) => format!("{fun:?}"),
            ClosureKind::Native(_) => "Native".to_owned(),
        };
        f.debug_struct("Closure")
            .field("kind", &kind)
            .field("debug_name", &self.debug_name)
            .finish()
    }
}
