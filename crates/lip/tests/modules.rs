//! Module loading through the public API and an in-memory filesystem.

use std::sync::Arc;

use lip::io::VecInput;
use lip::{
    Context, Error, ErrorKind, MemoryFs, Runtime, RuntimeConfig, Value, load_builtins,
};

fn runtime_with_files(files: &[(&str, &str)]) -> Arc<Runtime> {
    let fs = MemoryFs::new();
    for (path, contents) in files {
        fs.add_file(*path, *contents);
    }
    Runtime::new(RuntimeConfig {
        fs: Arc::new(fs),
        ..RuntimeConfig::default()
    })
}

fn context_with_files(files: &[(&str, &str)]) -> Context {
    let mut ctx = Context::new(runtime_with_files(files));
    load_builtins(&mut ctx);
    ctx
}

fn eval_in(ctx: &mut Context, src: &str) -> Result<Value, Error> {
    let mut script = ctx.load_script(
        "main.lip",
        Some(Box::new(VecInput::new(src.as_bytes().to_vec()))),
        true,
    )?;
    let mut vm = ctx.create_vm(None);
    ctx.exec_script(&mut vm, &mut script)
}

#[test]
fn scripts_pull_modules_in_through_linking() {
    let mut ctx = context_with_files(&[("m.lip", "(declare (double x) (* x 2))")]);
    let result = eval_in(&mut ctx, "(m/double 21)").expect("runs");
    assert_eq!(result, Value::Number(42.0));
}

#[test]
fn modules_load_once_and_commit_to_the_runtime() {
    let runtime = runtime_with_files(&[("m.lip", "(declare (one) 1)")]);
    let mut ctx = Context::new(Arc::clone(&runtime));
    load_builtins(&mut ctx);
    ctx.load_module("m").expect("loads");

    // Visible from a second context on the same runtime without reloading.
    let ctx2 = Context::new(runtime);
    assert!(ctx2.lookup_symbol("m/one").is_some());
}

#[test]
fn module_functions_call_their_siblings() {
    let mut ctx = context_with_files(&[(
        "m.lip",
        "(declare (helper x) (+ x 1))
         (declare (api x) (m/helper (m/helper x)))",
    )]);
    let result = eval_in(&mut ctx, "(m/api 40)").expect("runs");
    assert_eq!(result, Value::Number(42.0));
}

#[test]
fn modules_may_depend_on_other_modules() {
    let mut ctx = context_with_files(&[
        ("base.lip", "(declare (inc x) (+ x 1))"),
        ("top.lip", "(declare (inc2 x) (base/inc (base/inc x)))"),
    ]);
    let result = eval_in(&mut ctx, "(top/inc2 1)").expect("runs");
    assert_eq!(result, Value::Number(3.0));
}

#[test]
fn a_failed_load_changes_nothing() {
    let mut ctx = context_with_files(&[(
        "bad.lip",
        "(declare (ok) 1) (declare (broken) (missing-symbol))",
    )]);
    let err = ctx.load_module("bad").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Link);

    // Exactly as before the attempt: every symbol of the module is absent.
    assert!(ctx.lookup_symbol("bad/ok").is_none());
    assert!(ctx.lookup_symbol("bad/broken").is_none());

    // And a script that needs the module reports the failure as its cause.
    let err = eval_in(&mut ctx, "(bad/ok)").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Link);
    assert_eq!(err.message, "Undefined symbol: bad/ok");
}

#[test]
fn missing_modules_are_module_errors() {
    let mut ctx = context_with_files(&[]);
    let err = ctx.load_module("ghost").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Module);
    assert_eq!(err.message, "Cannot find module: ghost");
}

#[test]
fn declare_inside_declare_is_refused_with_the_exact_message() {
    let mut ctx = context_with_files(&[(
        "mod7.lip",
        "(declare (b x) (declare (inner) 1) x)",
    )]);
    let err = ctx.load_module("mod7").expect_err("must fail");
    assert_eq!(
        err.root_cause().message,
        "Cannot use `declare` inside a `declare`-d function"
    );
    assert!(ctx.lookup_symbol("mod7/b").is_none());
}

#[test]
fn search_patterns_try_dotted_paths_then_literal_names() {
    // `?` expands dots to directory separators; `!` keeps the name.
    let mut ctx = context_with_files(&[("a/b.lip", "(declare (f) 1)")]);
    ctx.load_module("a.b").expect("found via ? pattern");
    assert!(ctx.lookup_symbol("a.b/f").is_some());

    let mut ctx = context_with_files(&[("c.d.lip", "(declare (g) 2)")]);
    ctx.load_module("c.d").expect("found via ! pattern");
    assert!(ctx.lookup_symbol("c.d/g").is_some());
}

#[test]
fn module_toplevel_code_runs_during_load() {
    // Non-declare top-level forms execute; their results are discarded.
    let mut ctx = context_with_files(&[(
        "m.lip",
        "(+ 1 2) (declare (f) 7)",
    )]);
    ctx.load_module("m").expect("loads");
    assert!(ctx.lookup_symbol("m/f").is_some());
}

#[test]
fn runtime_errors_during_module_execution_fail_the_load() {
    let mut ctx = context_with_files(&[("m.lip", "(throw \"setup failed\")")]);
    let err = ctx.load_module("m").expect_err("must fail");
    assert_eq!(err.root_cause().message, "setup failed");
    assert!(ctx.last_error().is_some());
}

#[test]
fn dumped_modules_reload_as_bytecode() {
    use lip::Output;

    let mut ctx = context_with_files(&[]);
    let script = ctx
        .load_script(
            "m.lip",
            Some(Box::new(VecInput::new(b"(* 6 7)".to_vec()))),
            false,
        )
        .expect("compiles");

    struct Collector(Arc<std::sync::Mutex<Vec<u8>>>);
    impl Output for Collector {
        fn write(&mut self, buf: &[u8]) -> usize {
            self.0.lock().expect("collector lock").extend_from_slice(buf);
            buf.len()
        }
    }

    let buffer = Arc::new(std::sync::Mutex::new(Vec::new()));
    ctx.dump_script(
        &script,
        "m.lipc",
        Some(Box::new(Collector(Arc::clone(&buffer)))),
    )
    .expect("dumps");
    let bytes = buffer.lock().expect("collector lock").clone();
    assert_eq!(&bytes[..4], b"LIP\0");

    let mut reloaded = ctx
        .load_script("m.lipc", Some(Box::new(VecInput::new(bytes))), true)
        .expect("reloads");
    let mut vm = ctx.create_vm(None);
    assert_eq!(
        ctx.exec_script(&mut vm, &mut reloaded).expect("runs"),
        Value::Number(42.0)
    );
}
