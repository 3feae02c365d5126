//! Typed argument access for native functions.
//!
//! A native grabs its operands as an [`Args`] snapshot and reads them
//! through arity- and type-checked accessors; failures produce the error
//! values the rest of the system raises for bad calls, so hand-written
//! bindings and primitives report identically.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::value::{List, Value};
use crate::vm::Vm;

/// The closed set of argument types a binding can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    /// Any value.
    Any,
    /// A number.
    Number,
    /// A string.
    String,
    /// A list.
    List,
    /// A callable function.
    Function,
}

impl TypeTag {
    fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Number => "number",
            Self::String => "string",
            Self::List => "list",
            Self::Function => "function",
        }
    }
}

/// Snapshot of the current native frame's arguments.
pub struct Args {
    values: SmallVec<[Value; 8]>,
}

impl Args {
    /// Captures the arguments of the native frame currently executing.
    #[must_use]
    pub fn from_vm(vm: &Vm) -> Self {
        Self {
            values: vm.args().iter().cloned().collect(),
        }
    }

    /// Builds an argument pack directly; used by the VM's own callers.
    #[must_use]
    pub fn from_values(values: &[Value]) -> Self {
        Self {
            values: values.iter().cloned().collect(),
        }
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All arguments, in call order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Demands exactly `n` arguments.
    pub fn exactly(&self, n: usize) -> Result<(), Value> {
        if self.values.len() == n {
            Ok(())
        } else {
            Err(Value::string(format!(
                "Bad number of arguments (exactly {n} expected, got {})",
                self.values.len()
            )))
        }
    }

    /// Demands at least `n` arguments.
    pub fn at_least(&self, n: usize) -> Result<(), Value> {
        if self.values.len() >= n {
            Ok(())
        } else {
            Err(Value::string(format!(
                "Bad number of arguments (at least {n} expected, got {})",
                self.values.len()
            )))
        }
    }

    /// Demands at most `n` arguments.
    pub fn at_most(&self, n: usize) -> Result<(), Value> {
        if self.values.len() <= n {
            Ok(())
        } else {
            Err(Value::string(format!(
                "Bad number of arguments (at most {n} expected, got {})",
                self.values.len()
            )))
        }
    }

    fn get(&self, index: usize, tag: TypeTag) -> Result<&Value, Value> {
        let Some(value) = self.values.get(index) else {
            return Err(Value::string(format!(
                "Bad argument #{} ({} expected, got none)",
                index + 1,
                tag.name()
            )));
        };
        let ok = match tag {
            TypeTag::Any => true,
            TypeTag::Number => matches!(value, Value::Number(_)),
            TypeTag::String => matches!(value, Value::String(_)),
            TypeTag::List => matches!(value, Value::List(_)),
            TypeTag::Function => matches!(value, Value::Function(_)),
        };
        if ok {
            Ok(value)
        } else {
            Err(Value::string(format!(
                "Bad argument #{} ({} expected, got {})",
                index + 1,
                tag.name(),
                value.type_name()
            )))
        }
    }

    /// Argument `index`, any type.
    pub fn any(&self, index: usize) -> Result<Value, Value> {
        self.get(index, TypeTag::Any).cloned()
    }

    /// Argument `index` as a number.
    pub fn number(&self, index: usize) -> Result<f64, Value> {
        match self.get(index, TypeTag::Number)? {
            Value::Number(n) => Ok(*n),
            _ => unreachable!("checked by get"),
        }
    }

    /// Argument `index` as a number, defaulting when absent.
    pub fn number_or(&self, index: usize, default: f64) -> Result<f64, Value> {
        if index < self.values.len() {
            self.number(index)
        } else {
            Ok(default)
        }
    }

    /// Argument `index` as a string.
    pub fn string(&self, index: usize) -> Result<Arc<str>, Value> {
        match self.get(index, TypeTag::String)? {
            Value::String(s) => Ok(Arc::clone(s)),
            _ => unreachable!("checked by get"),
        }
    }

    /// Argument `index` as a list.
    pub fn list(&self, index: usize) -> Result<List, Value> {
        match self.get(index, TypeTag::List)? {
            Value::List(list) => Ok(list.clone()),
            _ => unreachable!("checked by get"),
        }
    }

    /// Argument `index` as a callable value.
    pub fn function(&self, index: usize) -> Result<Value, Value> {
        self.get(index, TypeTag::Function).cloned()
    }
}
