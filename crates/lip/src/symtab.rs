//! The symbol table: namespace name to symbol name to value.

use ahash::AHashMap;

use crate::value::Value;

/// Splits a fully-qualified symbol at its first `/`. A bare name lives in
/// the empty namespace; a leading `/` forces the empty namespace even when
/// a local variable shadows the bare name.
#[must_use]
pub(crate) fn split_symbol(symbol: &str) -> (&str, &str) {
    match symbol.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => ("", symbol),
    }
}

/// A two-level map of committed (or staged) symbols.
#[derive(Debug, Default)]
pub(crate) struct SymbolTable {
    namespaces: AHashMap<String, AHashMap<String, Value>>,
}

impl SymbolTable {
    /// Looks up `name` in `namespace`.
    pub fn lookup(&self, namespace: &str, name: &str) -> Option<Value> {
        self.namespaces.get(namespace)?.get(name).cloned()
    }

    /// Whether `namespace` exists at all.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Defines (or redefines) one symbol.
    pub fn define(&mut self, namespace: &str, name: impl Into<String>, value: Value) {
        self.namespaces
            .entry(namespace.to_owned())
            .or_default()
            .insert(name.into(), value);
    }

    /// Merges a whole namespace, overwriting existing keys.
    pub fn merge_namespace(&mut self, namespace: String, content: AHashMap<String, Value>) {
        self.namespaces.entry(namespace).or_default().extend(content);
    }
}
