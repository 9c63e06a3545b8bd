//! End-to-end tests for the basic expression and statement surface, driving
//! the public `Vm` API and capturing output with `CollectStringPrint`.

use pretty_assertions::assert_eq;
use vesper::{CollectStringPrint, InterpretError, Vm};

fn run(source: &str) -> String {
    let mut vm = Vm::new();
    let mut print = CollectStringPrint::new();
    vm.interpret(source, &mut print).expect("script should run");
    print.into_output()
}

fn run_err(source: &str) -> InterpretError {
    let mut vm = Vm::new();
    let mut print = CollectStringPrint::new();
    vm.interpret(source, &mut print).expect_err("script should fail")
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1+2*3;"), "7\n");
    assert_eq!(run("print (1+2)*3;"), "9\n");
    assert_eq!(run("print 10 - 4 / 2;"), "8\n");
    assert_eq!(run("print -3 + 1;"), "-2\n");
    assert_eq!(run("print 2 * 3 % 4;"), "2\n");
}

#[test]
fn number_printing() {
    assert_eq!(run("print 0.5;"), "0.5\n");
    assert_eq!(run("print 100;"), "100\n");
    assert_eq!(run("print 10 / 4;"), "2.5\n");
    assert_eq!(run("print 1 / 0;"), "inf\n");
}

#[test]
fn modulo() {
    assert_eq!(run("print 10 % 3;"), "1\n");
    assert_eq!(run("print 7.5 % 2;"), "1.5\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run("var a=\"foo\"; var b=\"bar\"; print a+b;"), "foobar\n");
    assert_eq!(run("print \"\" + \"x\";"), "x\n");
}

#[test]
fn string_escapes() {
    assert_eq!(run(r#"print "a\nb";"#), "a\nb\n");
    assert_eq!(run(r#"print "col\tumn";"#), "col\tumn\n");
    assert_eq!(run(r#"print "say \"hi\"";"#), "say \"hi\"\n");
    assert_eq!(run(r#"print "back\\slash";"#), "back\\slash\n");
    assert_eq!(run("print \"one\\\ntwo\";"), "onetwo\n");
}

#[test]
fn equality_and_comparison() {
    assert_eq!(run("print 1 == 1;"), "true\n");
    assert_eq!(run("print 1 != 2;"), "true\n");
    assert_eq!(run("print \"a\" == \"a\";"), "true\n");
    assert_eq!(run("print \"a\" == \"b\";"), "false\n");
    assert_eq!(run("print nil == nil;"), "true\n");
    assert_eq!(run("print nil == false;"), "false\n");
    assert_eq!(run("print 2 < 3;"), "true\n");
    assert_eq!(run("print 2 <= 2;"), "true\n");
    assert_eq!(run("print 3 > 3;"), "false\n");
    assert_eq!(run("print 3 >= 3;"), "true\n");
}

#[test]
fn truthiness() {
    assert_eq!(run("print !nil;"), "true\n");
    assert_eq!(run("print !false;"), "true\n");
    assert_eq!(run("print !0;"), "false\n");
    assert_eq!(run("print !\"\";"), "false\n");
}

#[test]
fn literals_print() {
    assert_eq!(run("print true; print false; print nil;"), "true\nfalse\nnil\n");
}

#[test]
fn global_variables() {
    assert_eq!(run("var a = 1; a = a + 1; print a;"), "2\n");
    assert_eq!(run("var a; print a;"), "nil\n");
    assert_eq!(run("var a = 1; var b = a = 5; print b;"), "5\n");
}

#[test]
fn local_scoping_and_shadowing() {
    let source = r#"
        var a = "global";
        {
            var a = "local";
            print a;
        }
        print a;
    "#;
    assert_eq!(run(source), "local\nglobal\n");
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(run("var a; var b; a = b = 3; print a; print b;"), "3\n3\n");
}

#[test]
fn comments_are_ignored() {
    assert_eq!(run("// nothing\nprint 1; // trailing\n"), "1\n");
}

#[test]
fn adding_string_and_number_is_a_runtime_error() {
    let error = run_err("print \"a\" + 1;");
    match &error {
        InterpretError::Runtime(runtime) => {
            assert_eq!(runtime.message, "Operands must be two numbers or two strings.");
        }
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
    assert_eq!(error.exit_code(), 70);
}

#[test]
fn compile_errors_report_line_and_lexeme() {
    let error = run_err("print 1");
    assert_eq!(error.exit_code(), 65);
    assert_eq!(error.to_string(), "[line 1] Error at end: Expect ';' after value.");

    let error = run_err("var x = ;\nvar y = ;");
    let InterpretError::Compile(errors) = &error else {
        panic!("expected compile errors");
    };
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].to_string(), "[line 1] Error at ';': Expect expression.");
    assert_eq!(errors[1].line, 2);
}

#[test]
fn scanner_errors_surface_as_compile_errors() {
    let error = run_err("print @;");
    assert_eq!(error.to_string(), "[line 1] Error: Unexpected character.");

    let error = run_err("print \"oops;");
    assert_eq!(error.to_string(), "[line 1] Error: Unterminated string.");
}
