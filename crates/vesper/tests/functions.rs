//! End-to-end tests for functions, closures, upvalues, and natives.

use pretty_assertions::assert_eq;
use vesper::{CollectStringPrint, InterpretError, Vm};

fn run(source: &str) -> String {
    let mut vm = Vm::new();
    let mut print = CollectStringPrint::new();
    vm.interpret(source, &mut print).expect("script should run");
    print.into_output()
}

fn runtime_message(source: &str) -> String {
    let mut vm = Vm::new();
    let mut print = CollectStringPrint::new();
    match vm.interpret(source, &mut print) {
        Err(InterpretError::Runtime(error)) => error.message,
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[test]
fn declaration_call_and_return() {
    let source = r"
        fun add(a, b) { return a + b; }
        print add(1, 2);
    ";
    assert_eq!(run(source), "3\n");
}

#[test]
fn implicit_return_is_nil() {
    assert_eq!(run("fun f() {} print f();"), "nil\n");
    assert_eq!(run("fun f() { return; } print f();"), "nil\n");
}

#[test]
fn functions_print_by_name() {
    assert_eq!(run("fun f() {} print f;"), "<fn f>\n");
    assert_eq!(run("print clock;"), "<native fn>\n");
}

#[test]
fn recursion() {
    let source = r"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    ";
    assert_eq!(run(source), "55\n");
}

#[test]
fn closure_captures_argument_after_function_returns() {
    let source = r"
        fun make(x) {
            fun inner() { return x; }
            return inner;
        }
        var f = make(42);
        print f();
    ";
    assert_eq!(run(source), "42\n");
}

#[test]
fn counter_closure_keeps_private_state() {
    let source = r"
        fun makeCounter() {
            var count = 0;
            fun increment() {
                count = count + 1;
                return count;
            }
            return increment;
        }
        var counter = makeCounter();
        print counter();
        print counter();
        var fresh = makeCounter();
        print fresh();
    ";
    assert_eq!(run(source), "1\n2\n1\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let source = r"
        fun make() {
            var shared = 0;
            fun inc() { shared = shared + 1; }
            fun get() { return shared; }
            inc();
            inc();
            return get;
        }
        print make()();
    ";
    assert_eq!(run(source), "2\n");
}

#[test]
fn upvalue_chains_through_nested_functions() {
    let source = r#"
        fun outer() {
            var x = "outer";
            fun middle() {
                fun inner() { return x; }
                return inner;
            }
            return middle();
        }
        print outer()();
    "#;
    assert_eq!(run(source), "outer\n");
}

#[test]
fn block_locals_close_when_scope_exits() {
    let source = r#"
        var f;
        {
            var captured = "before";
            fun read() { return captured; }
            f = read;
            captured = "after";
        }
        print f();
    "#;
    assert_eq!(run(source), "after\n");
}

#[test]
fn arity_is_checked() {
    assert_eq!(runtime_message("fun f(a) {} f();"), "Expected 1 arguments but got 0.");
    assert_eq!(runtime_message("fun f() {} f(1, 2);"), "Expected 0 arguments but got 2.");
}

#[test]
fn runtime_error_in_callee_reports_full_trace() {
    let mut vm = Vm::new();
    let mut print = CollectStringPrint::new();
    let source = "fun boom() { return 1 + nil; }\nboom();";
    let Err(InterpretError::Runtime(error)) = vm.interpret(source, &mut print) else {
        panic!("expected runtime error");
    };
    let rendered = error.to_string();
    assert!(rendered.contains("[line 1] in boom()"), "got: {rendered}");
    assert!(rendered.contains("[line 2] in script"), "got: {rendered}");
}

#[test]
fn clock_native_is_monotonic_enough() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
}

#[test]
fn printf_native_concatenates_without_newline() {
    assert_eq!(run("printf(1, \" \", true, \" \", \"x\");"), "1 true x");
    assert_eq!(run("printf(\"a\"); printf(\"b\");"), "ab");
}

#[test]
fn printf_requires_an_argument() {
    assert_eq!(runtime_message("printf();"), "printf(...) needs at least one argument.");
}

#[test]
fn typeof_native_reports_type_names() {
    assert_eq!(run("print typeof(1);"), "number\n");
    assert_eq!(run("print typeof(true);"), "bool\n");
    assert_eq!(run("print typeof(nil);"), "nil\n");
    assert_eq!(run("print typeof(\"s\");"), "string\n");
    assert_eq!(run("print typeof([1]);"), "array\n");
    assert_eq!(run("fun f() {} print typeof(f);"), "fun\n");
    assert_eq!(run("class A {} print typeof(A());"), "A\n");
    assert_eq!(run("print typeof({});"), "object\n");
}

#[test]
fn floor_native() {
    assert_eq!(run("print floor(2.9);"), "2\n");
    assert_eq!(run("print floor(0 - 2.1);"), "-3\n");
    assert_eq!(runtime_message("floor(\"x\");"), "'floor()' can only round numbers.");
}
