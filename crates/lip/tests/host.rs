//! Host-embedding surface: native bindings, namespaces, hooks, threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use lip::io::VecInput;
use lip::{
    Args, Context, NativeResult, Runtime, RuntimeConfig, Value, Vm, load_builtins,
};

fn eval_in(ctx: &mut Context, src: &str) -> Value {
    let mut script = ctx
        .load_script(
            "host.lip",
            Some(Box::new(VecInput::new(src.as_bytes().to_vec()))),
            true,
        )
        .expect("compiles and links");
    let mut vm = ctx.create_vm(None);
    ctx.exec_script(&mut vm, &mut script).expect("runs")
}

#[test]
fn hosts_register_native_functions_per_namespace() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let mut ctx = Context::new(runtime);
    load_builtins(&mut ctx);

    let mut ns = ctx.begin_ns("host");
    ns.declare_function("add-tax", |vm: &mut Vm| -> NativeResult {
        let args = Args::from_vm(vm);
        args.exactly(1)?;
        Ok(Value::Number(args.number(0)? * 1.25))
    });
    ctx.end_ns(ns);

    assert_eq!(eval_in(&mut ctx, "(host/add-tax 100)"), Value::Number(125.0));
}

#[test]
fn discarded_namespaces_never_become_visible() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let mut ctx = Context::new(runtime);

    let mut ns = ctx.begin_ns("temp");
    ns.declare_value("x", Value::Number(1.0));
    ctx.discard_ns(ns);
    assert!(ctx.lookup_symbol("temp/x").is_none());
}

#[test]
fn natives_call_back_into_scripts() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let mut ctx = Context::new(runtime);
    load_builtins(&mut ctx);

    let mut ns = ctx.begin_ns("host");
    ns.declare_function("twice", |vm: &mut Vm| -> NativeResult {
        let args = Args::from_vm(vm);
        args.exactly(2)?;
        let f = args.function(0)?;
        let x = args.any(1)?;
        let once = vm.call(&f, &[x])?;
        vm.call(&f, &[once])
    });
    ctx.end_ns(ns);

    assert_eq!(
        eval_in(&mut ctx, "(host/twice (fn (n) (* n 3)) 2)"),
        Value::Number(18.0)
    );
}

#[test]
fn native_closures_carry_bound_environments() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let mut ctx = Context::new(runtime);
    load_builtins(&mut ctx);

    let counter = Value::native_fn(
        |vm: &mut Vm| -> NativeResult {
            let env = vm.env();
            Ok(env.first().cloned().unwrap_or(Value::Nil))
        },
        vec![Value::string("bound-data")],
    );
    let mut ns = ctx.begin_ns("host");
    ns.declare_value("bound", counter);
    ctx.end_ns(ns);

    assert_eq!(eval_in(&mut ctx, "(host/bound)"), Value::string("bound-data"));
}

#[test]
fn opaque_native_data_round_trips_through_scripts() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let mut ctx = Context::new(runtime);
    load_builtins(&mut ctx);

    #[derive(Debug)]
    struct HostHandle(u32);

    let handle = Value::Native(Arc::new(HostHandle(7)));
    let mut ns = ctx.begin_ns("host");
    ns.declare_value("handle", handle);
    ns.declare_function("deref", |vm: &mut Vm| -> NativeResult {
        let args = Args::from_vm(vm);
        args.exactly(1)?;
        let Value::Native(data) = args.any(0)? else {
            return Err(Value::string("Bad argument #1 (native expected)"));
        };
        let handle = data
            .downcast_ref::<HostHandle>()
            .ok_or_else(|| Value::string("Unknown native handle"))?;
        Ok(Value::Number(f64::from(handle.0)))
    });
    ctx.end_ns(ns);

    assert_eq!(
        eval_in(&mut ctx, "(host/deref (identity host/handle))"),
        Value::Number(7.0)
    );
}

#[test]
fn hooks_observe_every_instruction() {
    use lip::CountingHook;

    let runtime = Runtime::new(RuntimeConfig::default());
    let mut ctx = Context::new(runtime);
    load_builtins(&mut ctx);

    let mut script = ctx
        .load_script(
            "host.lip",
            Some(Box::new(VecInput::new(b"(+ 1 2)".to_vec()))),
            true,
        )
        .expect("compiles");
    let mut vm = ctx.create_vm(None);
    let hook = CountingHook::new();
    let counters = hook.counters();
    vm.set_hook(Some(Box::new(hook)));
    ctx.exec_script(&mut vm, &mut script).expect("runs");
    assert!(counters.steps() >= 4, "saw {} steps", counters.steps());
    assert_eq!(counters.errors(), 0);
}

#[test]
fn contexts_on_threads_share_one_runtime() {
    let runtime = Runtime::new(RuntimeConfig::default());
    {
        let mut ctx = Context::new(Arc::clone(&runtime));
        load_builtins(&mut ctx);
    }

    let calls = Arc::new(AtomicU32::new(0));
    {
        let mut ctx = Context::new(Arc::clone(&runtime));
        let calls = Arc::clone(&calls);
        let mut ns = ctx.begin_ns("shared");
        ns.declare_function("tick", move |_vm: &mut Vm| -> NativeResult {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(Value::Nil)
        });
        ctx.end_ns(ns);
    }

    let mut workers = Vec::new();
    for _ in 0..4 {
        let runtime = Arc::clone(&runtime);
        workers.push(std::thread::spawn(move || {
            let mut ctx = Context::new(runtime);
            for _ in 0..10 {
                eval_in(&mut ctx, "(shared/tick)");
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker finishes");
    }
    assert_eq!(calls.load(Ordering::Relaxed), 40);
}

#[test]
fn set_native_location_reaches_tracebacks() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let mut ctx = Context::new(runtime);
    load_builtins(&mut ctx);

    let throw = ctx.lookup_symbol("throw").expect("builtin");
    let mut vm = ctx.create_vm(None);
    vm.set_native_location("embedding_test", "host.rs", 123);
    let err = vm
        .call(&throw, &[Value::string("kaput")])
        .expect_err("throws");
    let traceback = ctx.traceback(&vm, &err);
    assert_eq!(traceback.message, "kaput");
    assert!(
        traceback
            .records
            .iter()
            .any(|r| r.filename == "host.rs" && r.message == "embedding_test"),
        "records: {:?}",
        traceback.records
    );
}
