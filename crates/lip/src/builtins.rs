//! Builtin functions.
//!
//! [`load_builtins`] registers the root namespace — identity and type
//! predicates, `print`, `throw`, `list`, and native wrappers around the
//! primitive operators the assembler inlines — plus the `list` namespace of
//! list utilities. `list/tail` shares storage with its argument;
//! `list/map`, `list/foldl` and `list/foldr` re-enter the VM through the
//! native-to-script call path.

use crate::binder::Args;
use crate::prim;
use crate::runtime::Context;
use crate::value::{NativeResult, Value, write_value};
use crate::vm::Vm;

fn wrap_prim(op: fn(&[Value]) -> Result<Value, String>) -> impl Fn(&mut Vm) -> NativeResult {
    move |vm: &mut Vm| {
        let args = Args::from_vm(vm);
        op(args.values()).map_err(Value::string)
    }
}

fn type_predicate(test: fn(&Value) -> bool) -> impl Fn(&mut Vm) -> NativeResult {
    move |vm: &mut Vm| {
        let args = Args::from_vm(vm);
        args.exactly(1)?;
        Ok(Value::Boolean(test(&args.any(0)?)))
    }
}

fn builtin_nop(_vm: &mut Vm) -> NativeResult {
    Ok(Value::Nil)
}

fn builtin_identity(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(1)?;
    args.any(0)
}

fn builtin_print(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.at_least(1)?;
    args.at_most(3)?;
    let value = args.any(0)?;
    let depth = args.number_or(1, 3.0)?;
    let indent = args.number_or(2, 0.0)?;

    let mut text = String::new();
    for _ in 0..indent.max(0.0) as u32 {
        text.push_str("  ");
    }
    let _ = write_value(&mut text, &value, depth.max(0.0) as u32);
    text.push('\n');
    vm.write_out(text.as_bytes());
    Ok(Value::Nil)
}

fn builtin_throw(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(1)?;
    let message = args.string(0)?;
    Err(Value::String(message))
}

fn builtin_list(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    Ok(Value::list(args.values().to_vec()))
}

fn builtin_head(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(1)?;
    let list = args.list(0)?;
    list.get(0)
        .cloned()
        .ok_or_else(|| Value::string("List must have at least one element"))
}

fn builtin_tail(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(1)?;
    let list = args.list(0)?;
    match list.tail() {
        Some(tail) => Ok(Value::List(tail)),
        None => Err(Value::string("List must have at least one element")),
    }
}

fn builtin_len(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(1)?;
    Ok(Value::Number(args.list(0)?.len() as f64))
}

fn builtin_nth(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(2)?;
    let index = args.number(0)?;
    let list = args.list(1)?;
    if index < 0.0 || index >= list.len() as f64 {
        return Err(Value::string("List index out of bound"));
    }
    list.get(index as usize)
        .cloned()
        .ok_or_else(|| Value::string("List index out of bound"))
}

fn builtin_append(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(2)?;
    let list = args.list(0)?;
    let item = args.any(1)?;
    let mut items = list.elements().to_vec();
    items.push(item);
    Ok(Value::list(items))
}

fn builtin_concat(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    let mut items = Vec::new();
    for index in 0..args.len() {
        items.extend_from_slice(args.list(index)?.elements());
    }
    Ok(Value::list(items))
}

fn builtin_map(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(2)?;
    let function = args.function(0)?;
    let list = args.list(1)?;
    let mut mapped = Vec::with_capacity(list.len());
    for element in list.elements().to_vec() {
        mapped.push(vm.call(&function, &[element])?);
    }
    Ok(Value::list(mapped))
}

fn builtin_foldl(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(3)?;
    let function = args.function(0)?;
    let list = args.list(1)?;
    let mut acc = args.any(2)?;
    for element in list.elements().to_vec() {
        acc = vm.call(&function, &[element, acc])?;
    }
    Ok(acc)
}

fn builtin_foldr(vm: &mut Vm) -> NativeResult {
    let args = Args::from_vm(vm);
    args.exactly(3)?;
    let function = args.function(0)?;
    let list = args.list(1)?;
    let mut acc = args.any(2)?;
    for element in list.elements().to_vec().into_iter().rev() {
        acc = vm.call(&function, &[element, acc])?;
    }
    Ok(acc)
}

/// Registers the builtin namespaces into the runtime.
pub fn load_builtins(ctx: &mut Context) {
    let mut ns = ctx.begin_ns("");
    ns.declare_function("nop", builtin_nop);
    ns.declare_function("identity", builtin_identity);
    ns.declare_function("print", builtin_print);
    ns.declare_function("throw", builtin_throw);
    ns.declare_function("list", builtin_list);

    ns.declare_function("nil?", type_predicate(|v| matches!(v, Value::Nil)));
    ns.declare_function("bool?", type_predicate(|v| matches!(v, Value::Boolean(_))));
    ns.declare_function("number?", type_predicate(|v| matches!(v, Value::Number(_))));
    ns.declare_function("string?", type_predicate(|v| matches!(v, Value::String(_))));
    ns.declare_function("symbol?", type_predicate(|v| matches!(v, Value::Symbol(_))));
    ns.declare_function("list?", type_predicate(|v| matches!(v, Value::List(_))));
    ns.declare_function("fn?", type_predicate(|v| matches!(v, Value::Function(_))));

    ns.declare_function("+", wrap_prim(prim::add));
    ns.declare_function("-", wrap_prim(prim::sub));
    ns.declare_function("*", wrap_prim(prim::mul));
    ns.declare_function("/", wrap_prim(prim::fdiv));
    ns.declare_function("!", wrap_prim(prim::not));
    ns.declare_function("cmp", wrap_prim(prim::cmp));
    ns.declare_function("==", wrap_prim(prim::eq));
    ns.declare_function("!=", wrap_prim(prim::neq));
    ns.declare_function(">", wrap_prim(prim::gt));
    ns.declare_function("<", wrap_prim(prim::lt));
    ns.declare_function(">=", wrap_prim(prim::gte));
    ns.declare_function("<=", wrap_prim(prim::lte));
    ctx.end_ns(ns);

    let mut ns = ctx.begin_ns("list");
    ns.declare_function("head", builtin_head);
    ns.declare_function("tail", builtin_tail);
    ns.declare_function("len", builtin_len);
    ns.declare_function("nth", builtin_nth);
    ns.declare_function("append", builtin_append);
    ns.declare_function("concat", builtin_concat);
    ns.declare_function("map", builtin_map);
    ns.declare_function("foldl", builtin_foldl);
    ns.declare_function("foldr", builtin_foldr);
    ctx.end_ns(ns);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::runtime::{Runtime, RuntimeConfig};

    use super::*;

    fn context() -> Context {
        let mut ctx = Context::new(Runtime::new(RuntimeConfig::default()));
        load_builtins(&mut ctx);
        ctx
    }

    fn call(ctx: &mut Context, name: &str, args: &[Value]) -> Result<Value, Value> {
        let function = ctx.lookup_symbol(name).expect("builtin exists");
        let mut vm = ctx.create_vm(None);
        vm.call(&function, args)
    }

    #[test]
    fn registration_covers_both_namespaces() {
        let ctx = context();
        for name in ["nop", "identity", "print", "throw", "list", "+", "<="] {
            assert!(ctx.lookup_symbol(name).is_some(), "missing builtin {name}");
        }
        for name in [
            "list/head",
            "list/tail",
            "list/len",
            "list/nth",
            "list/append",
            "list/concat",
            "list/map",
            "list/foldl",
            "list/foldr",
        ] {
            assert!(ctx.lookup_symbol(name).is_some(), "missing builtin {name}");
        }
    }

    #[test]
    fn identity_returns_its_argument() {
        let mut ctx = context();
        assert_eq!(
            call(&mut ctx, "identity", &[Value::Number(7.0)]),
            Ok(Value::Number(7.0))
        );
    }

    #[test]
    fn throw_raises_its_message() {
        let mut ctx = context();
        assert_eq!(
            call(&mut ctx, "throw", &[Value::string("boom")]),
            Err(Value::string("boom"))
        );
        // Non-string arguments are a type error, not a throw.
        assert_eq!(
            call(&mut ctx, "throw", &[Value::Number(1.0)]),
            Err(Value::string(
                "Bad argument #1 (string expected, got number)"
            ))
        );
    }

    #[test]
    fn type_predicates_answer() {
        let mut ctx = context();
        assert_eq!(
            call(&mut ctx, "nil?", &[Value::Nil]),
            Ok(Value::Boolean(true))
        );
        assert_eq!(
            call(&mut ctx, "number?", &[Value::string("x")]),
            Ok(Value::Boolean(false))
        );
        assert_eq!(
            call(&mut ctx, "symbol?", &[Value::symbol("x")]),
            Ok(Value::Boolean(true))
        );
    }

    #[test]
    fn list_tail_shares_backing() {
        let mut ctx = context();
        let list = call(
            &mut ctx,
            "list",
            &[Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
        )
        .expect("list builds");
        let tail = call(&mut ctx, "list/tail", std::slice::from_ref(&list)).expect("tail");
        let (Value::List(original), Value::List(tail)) = (&list, &tail) else {
            panic!("expected lists");
        };
        assert!(tail.shares_backing_with(original));
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn nth_checks_bounds() {
        let mut ctx = context();
        let list = Value::list(vec![Value::Number(10.0), Value::Number(20.0)]);
        assert_eq!(
            call(&mut ctx, "list/nth", &[Value::Number(1.0), list.clone()]),
            Ok(Value::Number(20.0))
        );
        assert_eq!(
            call(&mut ctx, "list/nth", &[Value::Number(2.0), list]),
            Err(Value::string("List index out of bound"))
        );
    }

    #[test]
    fn concat_joins_lists() {
        let mut ctx = context();
        let a = Value::list(vec![Value::Number(1.0)]);
        let b = Value::list(vec![Value::Number(2.0), Value::Number(3.0)]);
        let joined = call(&mut ctx, "list/concat", &[a, b]).expect("concat");
        let Value::List(joined) = joined else {
            panic!("expected a list");
        };
        assert_eq!(joined.len(), 3);
    }

    #[test]
    fn map_reenters_the_vm() {
        let mut ctx = context();
        let double = Value::native_fn(
            |vm: &mut Vm| {
                let args = Args::from_vm(vm);
                Ok(Value::Number(args.number(0)? * 2.0))
            },
            Vec::new(),
        );
        let list = Value::list(vec![Value::Number(1.0), Value::Number(2.0)]);
        let mapped = call(&mut ctx, "list/map", &[double, list]).expect("map");
        let Value::List(mapped) = mapped else {
            panic!("expected a list");
        };
        assert_eq!(mapped.get(0), Some(&Value::Number(2.0)));
        assert_eq!(mapped.get(1), Some(&Value::Number(4.0)));
    }

    #[test]
    fn folds_thread_the_accumulator() {
        let mut ctx = context();
        let subtract = Value::native_fn(
            |vm: &mut Vm| {
                let args = Args::from_vm(vm);
                Ok(Value::Number(args.number(0)? - args.number(1)?))
            },
            Vec::new(),
        );
        let list = Value::list(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(3.0),
        ]);
        // foldl: 3 - (2 - (1 - 0)) = 2
        assert_eq!(
            call(
                &mut ctx,
                "list/foldl",
                &[subtract.clone(), list.clone(), Value::Number(0.0)]
            ),
            Ok(Value::Number(2.0))
        );
        // foldr: 1 - (2 - (3 - 0)) = 2
        assert_eq!(
            call(&mut ctx, "list/foldr", &[subtract, list, Value::Number(0.0)]),
            Ok(Value::Number(2.0))
        );
    }

    #[test]
    fn print_writes_to_the_vm_output() {
        use crate::io::VecOutput;
        use std::sync::Mutex;

        let out = Arc::new(Mutex::new(VecOutput::new()));
        let runtime = Runtime::new(RuntimeConfig {
            stdout: Arc::<Mutex<VecOutput>>::clone(&out),
            ..RuntimeConfig::default()
        });
        let mut ctx = Context::new(runtime);
        load_builtins(&mut ctx);
        let print = ctx.lookup_symbol("print").expect("print exists");
        let mut vm = ctx.create_vm(None);
        vm.call(&print, &[Value::list(vec![Value::Number(1.0)])])
            .expect("prints");
        let collected = out.lock().expect("collector lock");
        assert_eq!(collected.bytes(), b"(1)\n");
    }
}
