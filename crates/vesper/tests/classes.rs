//! End-to-end tests for classes, instances, methods, `this`, inheritance,
//! and `super`.

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
fn classes_and_instances_print() {
    assert_eq!(run("class Pie {} print Pie;"), "Pie\n");
    assert_eq!(run("class Pie {} print Pie();"), "Pie instance\n");
}

#[test]
fn fields_are_created_on_assignment() {
    let source = r"
        class Box {}
        var box = Box();
        box.contents = 7;
        print box.contents;
    ";
    assert_eq!(run(source), "7\n");
}

#[test]
fn setting_a_field_evaluates_to_the_value() {
    let source = r"
        class Box {}
        var box = Box();
        print box.contents = 3;
    ";
    assert_eq!(run(source), "3\n");
}

#[test]
fn methods_bind_this() {
    let source = r#"
        class Greeter {
            greet() { return "hi, " + this.name; }
        }
        var g = Greeter();
        g.name = "ada";
        print g.greet();
    "#;
    assert_eq!(run(source), "hi, ada\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let source = r#"
        class Greeter {
            greet() { return this.name; }
        }
        var g = Greeter();
        g.name = "ada";
        var method = g.greet;
        print method();
    "#;
    assert_eq!(run(source), "ada\n");
}

#[test]
fn initializer_runs_and_returns_the_instance() {
    let source = r"
        class Counter {
            init(n) { this.n = n; }
            bump() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter(10);
        print c.bump();
        print c.bump();
    ";
    assert_eq!(run(source), "11\n12\n");
}

#[test]
fn early_return_from_initializer_still_yields_the_instance() {
    let source = r"
        class Short {
            init() {
                this.x = 1;
                return;
            }
        }
        print Short().x;
    ";
    assert_eq!(run(source), "1\n");
}

#[test]
fn calling_class_without_init_rejects_arguments() {
    assert_eq!(
        runtime_message("class Empty {} Empty(1);"),
        "Expected 0 arguments but got 1."
    );
}

#[test]
fn initializer_arity_is_checked() {
    assert_eq!(
        runtime_message("class P { init(a, b) { } } P(1);"),
        "Expected 2 arguments but got 1."
    );
}

#[test]
fn fields_shadow_methods() {
    let source = r#"
        class Thing {
            label() { return "method"; }
        }
        fun replacement() { return "field"; }
        var thing = Thing();
        thing.label = replacement;
        print thing.label();
    "#;
    assert_eq!(run(source), "field\n");
}

#[test]
fn methods_are_inherited() {
    let source = r#"
        class A { greet() { return "hi"; } }
        class B < A {}
        print B().greet();
    "#;
    assert_eq!(run(source), "hi\n");
}

#[test]
fn subclasses_override_methods() {
    let source = r#"
        class A { speak() { return "a"; } }
        class B < A { speak() { return "b"; } }
        print B().speak();
        print A().speak();
    "#;
    assert_eq!(run(source), "b\na\n");
}

#[test]
fn super_calls_the_superclass_method() {
    let source = r#"
        class A { speak() { return "a"; } }
        class B < A {
            speak() { return "b+" + super.speak(); }
        }
        print B().speak();
    "#;
    assert_eq!(run(source), "b+a\n");
}

#[test]
fn super_works_through_two_levels() {
    let source = r#"
        class A { name() { return "A"; } }
        class B < A { name() { return super.name() + "B"; } }
        class C < B { name() { return super.name() + "C"; } }
        print C().name();
    "#;
    assert_eq!(run(source), "ABC\n");
}

#[test]
fn super_as_a_value_binds_the_current_receiver() {
    let source = r#"
        class A {
            who() { return this.tag; }
        }
        class B < A {
            grab() { return super.who; }
        }
        var b = B();
        b.tag = "b";
        var method = b.grab();
        print method();
    "#;
    assert_eq!(run(source), "b\n");
}

#[test]
fn inherited_initializer_runs_for_subclass() {
    let source = r"
        class A { init(n) { this.n = n; } }
        class B < A {}
        print B(5).n;
    ";
    assert_eq!(run(source), "5\n");
}

#[test]
fn undefined_property_errors() {
    assert_eq!(
        runtime_message("class A {} print A().missing;"),
        "Undefined property 'missing'."
    );
    assert_eq!(
        runtime_message("class A {} A().missing();"),
        "Undefined property 'missing'."
    );
}

#[test]
fn methods_close_over_surrounding_scope() {
    let source = r#"
        var f;
        {
            var outside = "captured";
            class Holder {
                read() { return outside; }
            }
            f = Holder().read;
        }
        print f();
    "#;
    assert_eq!(run(source), "captured\n");
}

#[test]
fn invoking_method_on_non_instance_errors() {
    assert_eq!(runtime_message("var s = \"str\"; s.length();"), "Only instances have methods.");
}
