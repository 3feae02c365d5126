//! End-to-end evaluation through the public API.

use lip::io::VecInput;
use lip::{
    Context, CountingHook, Error, ErrorKind, Runtime, RuntimeConfig, Value, VmConfig,
    load_builtins,
};

fn new_context() -> Context {
    let runtime = Runtime::new(RuntimeConfig::default());
    let mut ctx = Context::new(runtime);
    load_builtins(&mut ctx);
    ctx
}

fn eval(src: &str) -> Result<Value, Error> {
    let mut ctx = new_context();
    let mut script = ctx.load_script(
        "test.lip",
        Some(Box::new(VecInput::new(src.as_bytes().to_vec()))),
        true,
    )?;
    let mut vm = ctx.create_vm(None);
    ctx.exec_script(&mut vm, &mut script)
}

fn eval_ok(src: &str) -> Value {
    eval(src).expect("evaluates cleanly")
}

#[test]
fn a_number_evaluates_to_itself() {
    assert_eq!(eval_ok("2"), Value::Number(2.0));
}

#[test]
fn higher_order_application() {
    assert_eq!(
        eval_ok("((fn (x y) (x y)) (fn (x) x) 3.5)"),
        Value::Number(3.5)
    );
}

#[test]
fn closures_capture_lexically_not_dynamically() {
    assert_eq!(
        eval_ok("(let ((x 1.6) (y 2.5)) (let ((test (fn () x))) (let ((x 4)) (test))))"),
        Value::Number(1.6)
    );
}

#[test]
fn letrec_supports_mutual_recursion() {
    assert_eq!(
        eval_ok(
            "(letrec ((even? (fn (n) (if (== n 0) true (odd? (- n 1)))))
                      (odd? (fn (n) (if (== n 0) false (even? (- n 1))))))
               (even? 10))"
        ),
        Value::Boolean(true)
    );
}

#[test]
fn letrec_placeholders_are_resolved_before_the_body_runs() {
    assert_eq!(
        eval_ok("(letrec ((f (fn () g)) (g 5)) (f))"),
        Value::Number(5.0)
    );
}

#[test]
fn quasiquote_builds_lists_with_splicing() {
    let result = eval_ok("`(1 ,(+ 1 1) ,@(list 3 4) 5)");
    let Value::List(list) = result else {
        panic!("expected a list, got {result:?}");
    };
    let elements: Vec<_> = list.elements().to_vec();
    assert_eq!(
        elements,
        vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(3.0),
            Value::Number(4.0),
            Value::Number(5.0),
        ]
    );
}

#[test]
fn quoted_data_nests() {
    let result = eval_ok("'(1 a (2 b))");
    let Value::List(list) = result else {
        panic!("expected a list");
    };
    assert_eq!(list.get(0), Some(&Value::Number(1.0)));
    assert_eq!(list.get(1), Some(&Value::symbol("a")));
    let Some(Value::List(inner)) = list.get(2) else {
        panic!("expected a nested list");
    };
    assert_eq!(inner.get(1), Some(&Value::symbol("b")));
}

#[test]
fn a_bare_ampersand_parameter_is_rejected() {
    // `&name` declares a vararg; a lone `&` is refused outright.
    let err = eval("(fn (&))").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Syntax);
    assert_eq!(err.message, "A lone '&' is not a valid argument name");

    let err = eval("(fn (& x))").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Syntax);
    assert_eq!(err.message, "Only last argument can be prefixed with '&'");
}

#[test]
fn vararg_functions_collect_extra_arguments() {
    assert_eq!(
        eval_ok("((fn (x &rest) (list/len rest)) 1 2 3 4)"),
        Value::Number(3.0)
    );
    assert_eq!(eval_ok("((fn (&all) (list/len all)))"), Value::Number(0.0));
}

#[test]
fn tail_recursion_runs_in_constant_frame_depth() {
    let mut ctx = new_context();
    let src = "(letrec ((loop (fn (n) (if (> n 0) (loop (- n 1)) n)))) (loop 1000000))";
    let mut script = ctx
        .load_script(
            "loop.lip",
            Some(Box::new(VecInput::new(src.as_bytes().to_vec()))),
            true,
        )
        .expect("compiles");

    let mut vm = ctx.create_vm(Some(VmConfig::default()));
    let hook = CountingHook::new();
    let counters = hook.counters();
    vm.set_hook(Some(Box::new(hook)));

    let result = ctx.exec_script(&mut vm, &mut script).expect("runs");
    assert_eq!(result, Value::Number(0.0));
    // The caller contributes one suspended frame; the loop itself reuses
    // its frame on every iteration.
    assert!(
        counters.max_frame_depth() <= 2,
        "tail calls must not grow the call stack (saw depth {})",
        counters.max_frame_depth()
    );
    assert!(counters.steps() > 1_000_000);
}

#[test]
fn do_sequences_and_returns_the_last_value() {
    assert_eq!(eval_ok("(do 1 2 3)"), Value::Number(3.0));
    assert_eq!(eval_ok("(do)"), Value::Nil);
}

#[test]
fn an_empty_program_returns_nil() {
    assert_eq!(eval_ok(""), Value::Nil);
    assert_eq!(eval_ok("  ; just a comment\n"), Value::Nil);
}

#[test]
fn if_without_else_returns_nil() {
    assert_eq!(eval_ok("(if false 1)"), Value::Nil);
    assert_eq!(eval_ok("(if nil 1 2)"), Value::Number(2.0));
    assert_eq!(eval_ok("(if 0 1 2)"), Value::Number(1.0));
}

#[test]
fn string_escapes_decode_at_translation() {
    assert_eq!(eval_ok(r#""a\nb""#), Value::string("a\nb"));
    assert_eq!(eval_ok(r#""\x41""#), Value::string("A"));
}

#[test]
fn symbols_compare_by_content_strings_by_content() {
    assert_eq!(eval_ok("(== 'a 'a)"), Value::Boolean(true));
    assert_eq!(eval_ok("(== \"s\" \"s\")"), Value::Boolean(true));
    assert_eq!(eval_ok("(== 'a \"a\")"), Value::Boolean(false));
}

#[test]
fn arithmetic_is_variadic() {
    assert_eq!(eval_ok("(+ 1 2 3 4)"), Value::Number(10.0));
    assert_eq!(eval_ok("(+)"), Value::Number(0.0));
    assert_eq!(eval_ok("(*)"), Value::Number(1.0));
    assert_eq!(eval_ok("(- 5)"), Value::Number(-5.0));
    assert_eq!(eval_ok("(/ 4)"), Value::Number(0.25));
}

#[test]
fn primitives_work_as_first_class_values_too() {
    // Passed as an argument, `+` is the native wrapper, not the inlined
    // opcode.
    assert_eq!(
        eval_ok("(list/foldl + (list 1 2 3) 0)"),
        Value::Number(6.0)
    );
}

#[test]
fn throw_surfaces_as_a_runtime_error_with_a_traceback() {
    // Keep the throw out of tail position so the script frame survives
    // into the traceback.
    let err = eval("(do (throw \"boom\") 1)").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "boom");
    assert!(!err.records.is_empty());
    assert!(err.records.iter().any(|r| r.filename == "test.lip"));

    // In tail position the frame is reused; the error still surfaces.
    let err = eval("(throw \"boom\")").expect_err("must fail");
    assert_eq!(err.message, "boom");
}

#[test]
fn runtime_type_errors_name_the_operands() {
    let err = eval("(+ 1 \"x\")").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "Bad argument #2 (number expected, got string)");
}

#[test]
fn calling_a_non_function_fails() {
    let err = eval("(3 4)").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "Expected function, got number");
}

#[test]
fn unresolved_symbols_fail_at_link_time() {
    let err = eval("(no-such-function 1)").expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Link);
    assert_eq!(err.message, "Undefined symbol: no-such-function");
}

#[test]
fn deep_non_tail_recursion_overflows_the_call_stack() {
    let err = eval(
        "(letrec ((sum (fn (n) (if (== n 0) 0 (+ n (sum (- n 1)))))))
           (sum 100000))",
    )
    .expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(
        err.message == "Call stack overflow"
            || err.message == "Environment stack overflow"
            || err.message == "Operand stack overflow",
        "unexpected overflow message: {}",
        err.message
    );
}

#[test]
fn list_builtins_compose() {
    assert_eq!(
        eval_ok("(list/head (list/tail (list 1 2 3)))"),
        Value::Number(2.0)
    );
    assert_eq!(
        eval_ok("(list/nth 2 (list/concat (list 1) (list 2 3)))"),
        Value::Number(3.0)
    );
    assert_eq!(
        eval_ok("(list/len (list/append (list 1 2) 3))"),
        Value::Number(3.0)
    );
    assert_eq!(
        eval_ok("(list/head (list/map (fn (x) (* x x)) (list 7)))"),
        Value::Number(49.0)
    );
}

#[test]
fn shadowing_respects_the_innermost_binding() {
    assert_eq!(
        eval_ok("(let ((x 1)) (let ((x 2)) x))"),
        Value::Number(2.0)
    );
    assert_eq!(
        eval_ok("(let ((x 1)) (do (let ((x 2)) x) x))"),
        Value::Number(1.0)
    );
}

#[test]
fn comparison_chains() {
    assert_eq!(eval_ok("(< 1 2)"), Value::Boolean(true));
    assert_eq!(eval_ok("(>= 2 2)"), Value::Boolean(true));
    assert_eq!(eval_ok("(!= 1 2)"), Value::Boolean(true));
    assert_eq!(eval_ok("(cmp 1 2)"), Value::Number(-1.0));
    assert_eq!(eval_ok("(! nil)"), Value::Boolean(true));
    assert_eq!(eval_ok("(! 0)"), Value::Boolean(false));
}
