//! End-to-end tests for array and map literals, indexing, and the container
//! natives.

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
fn array_literals_index_in_order() {
    assert_eq!(run("var a = [10, 20, 30]; print a[0]; print a[1]; print a[2];"), "10\n20\n30\n");
    assert_eq!(run("print [];"), "[]\n");
    assert_eq!(run("print [1, \"x\", true];"), "[1, x, true]\n");
    // Trailing comma is allowed.
    assert_eq!(run("print [1, 2,];"), "[1, 2]\n");
}

#[test]
fn array_writes_and_reads() {
    assert_eq!(run("var a = [10,20,30]; a[1] = 99; print a[0]+a[1]+a[2];"), "139\n");
}

#[test]
fn array_index_writes_evaluate_to_the_value() {
    assert_eq!(run("var a = [0]; print a[0] = 5;"), "5\n");
}

#[test]
fn nested_arrays() {
    assert_eq!(run("var a = [[1, 2], [3]]; print a[0][1]; print a[1][0];"), "2\n3\n");
}

#[test]
fn array_elements_can_be_expressions() {
    assert_eq!(run("var x = 2; print [x, x * 2, x + 1][1];"), "4\n");
}

#[test]
fn array_index_must_be_a_number() {
    assert_eq!(runtime_message("var a = [1]; a[\"x\"];"), "Array index must be a number.");
}

#[test]
fn array_index_out_of_range() {
    assert_eq!(
        runtime_message("var a = [1, 2]; a[2];"),
        "Array index=2 out of range. Current len()=2."
    );
    assert_eq!(
        runtime_message("var a = [1]; a[0 - 1];"),
        "Array index=-1 out of range. Current len()=1."
    );
    assert_eq!(runtime_message("var a = [1]; a[3] = 0;"), "Invalid index to array.");
}

#[test]
fn fractional_indexes_truncate() {
    assert_eq!(run("var a = [1, 2]; print a[1.5];"), "2\n");
}

#[test]
fn indexing_non_containers_errors() {
    assert_eq!(runtime_message("var x = 1; x[0];"), "Can only index into an array or map.");
    assert_eq!(runtime_message("var x = 1; x[0] = 2;"), "Can only store into an array or map.");
}

#[test]
fn map_literals_and_reads() {
    assert_eq!(run("var m = {\"k\": 1}; print m[\"k\"];"), "1\n");
    assert_eq!(run("print {};"), "{}\n");
    assert_eq!(run("print {\"a\": 1};"), "{a: 1}\n");
    assert_eq!(run("var m = {\"a\": 1, \"b\": 2,}; print m[\"a\"] + m[\"b\"];"), "3\n");
}

#[test]
fn map_miss_reads_nil() {
    assert_eq!(run("var m = {}; print m[\"missing\"];"), "nil\n");
}

#[test]
fn map_writes_and_overwrites() {
    assert_eq!(run("var m = {}; m[\"k\"] = 1; m[\"k\"] = 2; print m[\"k\"];"), "2\n");
    assert_eq!(run("var m = {}; print m[\"k\"] = 9;"), "9\n");
}

#[test]
fn writing_nil_deletes_a_map_key() {
    assert_eq!(run("var m = {\"k\": 1}; m[\"k\"] = nil; print m[\"k\"];"), "nil\n");
}

#[test]
fn map_keys_must_be_strings() {
    assert_eq!(runtime_message("var m = {}; m[1];"), "Map key must be a string.");
    assert_eq!(runtime_message("var m = {}; m[1] = 2;"), "Map key must be a string.");
}

#[test]
fn map_values_can_be_containers() {
    assert_eq!(run("var m = {\"k\": [1, 2]}; print m[\"k\"][1];"), "2\n");
}

#[test]
fn len_reports_array_and_string_lengths() {
    assert_eq!(run("print len([1, 2, 3]);"), "3\n");
    assert_eq!(run("print len([]);"), "0\n");
    assert_eq!(run("print len(\"hello\");"), "5\n");
    assert_eq!(runtime_message("len(1);"), "'len()' can only get length from array or string.");
}

#[test]
fn push_appends_and_pop_removes() {
    let source = r"
        var a = [1];
        push(a, 2);
        print len(a);
        print pop(a);
        print len(a);
    ";
    assert_eq!(run(source), "2\n2\n1\n");
}

#[test]
fn push_then_pop_returns_the_pushed_value_and_restores_length() {
    let source = r"
        var a = [1, 2];
        push(a, 42);
        print pop(a);
        print len(a);
    ";
    assert_eq!(run(source), "42\n2\n");
}

#[test]
fn pop_on_empty_array_errors() {
    assert_eq!(runtime_message("pop([]);"), "can't pop empty array.");
}

#[test]
fn delete_removes_by_index() {
    let source = r"
        var a = [10, 20, 30];
        delete(a, 1);
        print a[0];
        print a[1];
        print len(a);
    ";
    assert_eq!(run(source), "10\n30\n2\n");
}

#[test]
fn delete_bounds_are_checked() {
    assert_eq!(
        runtime_message("delete([1], 5);"),
        "index out of bounds for: 'delete(array, index)'."
    );
}

#[test]
fn arrays_hold_heterogeneous_values() {
    let source = r#"
        fun f() { return "fn"; }
        var a = [f, nil, {"k": 1}];
        print a[0]();
        print a[1];
        print a[2]["k"];
    "#;
    assert_eq!(run(source), "fn\nnil\n1\n");
}

#[test]
fn long_array_survives_gc_pressure() {
    let source = r#"
        var a = [];
        for (var i = 0; i < 200; i = i + 1) {
            push(a, "item" + "!");
        }
        print len(a);
    "#;
    assert_eq!(run(source), "200\n");
}
