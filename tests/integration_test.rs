use std::{cell::RefCell, rc::Rc};

use comet::{
    bytecode::{Chunk, OpCode},
    object::{Function, Strings},
    InterpretError, RuntimeError, SourceFile, Vm,
};

fn run(source: &str) -> (Vm, Result<(), InterpretError>, String) {
    let output = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::new(output.clone());
    let result = vm.interpret(&SourceFile::new("test.cmt", source));
    let output = String::from_utf8(output.take()).expect("Output should be valid UTF-8");
    (vm, result, output)
}

fn test_valid_program(source: &str, expected_output: &str) {
    let (_, result, output) = run(source);
    result.expect("Interpret should work on valid program");
    assert_eq!(output, expected_output);
}

fn runtime_error(source: &str) -> RuntimeError {
    match run(source).1 {
        Err(InterpretError::Runtime { error, .. }) => error,
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn test_fib() {
    let source = r#"
function fib(n) {
    if (n <= 1) return n
    return fib(n - 1) + fib(n - 2)
}

for (var i = 0; i < 10; i += 1) {
    print(fib(i))
}
"#;
    let expected_output = "0\n1\n1\n2\n3\n5\n8\n13\n21\n34\n";
    test_valid_program(source, expected_output);
}

#[test]
fn test_closure() {
    let source = r#"
function make_counter() {
    var count = 0
    function increment() {
        count += 1
        return count
    }
    return increment
}

var counter = make_counter()
var other = make_counter()
print(counter())
print(counter())
print(other())
"#;
    let expected_output = "1\n2\n1\n";
    test_valid_program(source, expected_output);
}

#[test]
fn test_closed_upvalues_are_shared() {
    let source = r#"
var get
var set
{
    var value = 'before'
    get = (||) {
        return value
    }
    set = (|v|) {
        value = v
    }
}
set('after')
print(get())
"#;
    test_valid_program(source, "after\n");
}

#[test]
fn test_assigning_open_upvalue_updates_enclosing_local() {
    let source = r#"
function outer() {
    var value = 1
    function bump() {
        value = value + 10
    }
    bump()
    bump()
    return value
}
print(outer())
"#;
    test_valid_program(source, "21
");
}

#[test]
fn test_loop_closures_capture_each_iteration() {
    let source = r#"
var first
var second
for (var i = 0; i < 2; i += 1) {
    var captured = i
    if (i == 0) first = (||) {
        return captured
    }
    else second = (||) {
        return captured
    }
}
print(first(), ' ', second())
"#;
    test_valid_program(source, "0 1\n");
}

#[test]
fn test_functions_cant_break_scope() {
    let source = r#"
var a = 'global'
{
    function show_a() {
        print(a)
    }
    show_a()
    var a = 'block'
    show_a()
}
"#;
    test_valid_program(source, "global\nglobal\n");
}

#[test]
fn test_strings_and_values() {
    let source = r#"
print('con' + "cat")
print(1 / 2, ' ', 10 % 4, ' ', 0x1F, ' ', 1_000)
print(nil, ' ', true, ' ', !nil)
print('it\'s', '\ttab')
print(1 == 1, ' ', 'a' == 'a', ' ', 'a' != 'b', ' ', nil == false)
"#;
    let expected_output = "concat\n0.5 2 31 1000\nnil true true\nit's\ttab\ntrue true true false\n";
    test_valid_program(source, expected_output);
}

#[test]
fn test_logic_and_ternary() {
    let source = r#"
var x = 3
print(x > 1 ? 'big' : 'small')
print(x > 5 ? 'big' : x > 2 ? 'medium' : 'small')
print(nil || 'fallback', ' ', false && 'never')
"#;
    test_valid_program(source, "big\nmedium\nfallback false\n");
}

#[test]
fn test_compound_assignment() {
    let source = r#"
var n = 10
n += 5
n -= 3
n *= 2
n /= 4
n %= 4
print(n)
"#;
    test_valid_program(source, "2\n");
}

#[test]
fn test_bitwise_operators() {
    test_valid_program("print(5 & 3, ' ', 5 | 3, ' ', 5 ^ 3, ' ', 1 << 3, ' ', ~5)", "1 7 6 8 -6\n");
}

#[test]
fn test_while_next_and_break() {
    let source = r#"
var i = 0
var odd = 0
while (true) {
    i += 1
    if (i > 9) break
    if (i % 2 == 0) next
    odd += i
}
print(odd)
"#;
    test_valid_program(source, "25\n");
}

#[test]
fn test_classes() {
    let source = r#"
class Counter {
    init() {
        self.count = 0
    }
    increment() {
        self.count += 1
        return self.count
    }
}

var counter = Counter()
counter.increment()
print(counter.increment())
print(counter)
print(Counter)
"#;
    test_valid_program(source, "2\n<Counter instance>\nCounter\n");
}

#[test]
fn test_inheritance() {
    let source = r#"
class Counter {
    init() {
        self.count = 0
    }
    step() {
        return 1
    }
    increment() {
        self.count += self.step()
        return self.count
    }
}

class DoubleCounter : Counter {
    init() {
        super.init()
    }
    step() {
        return super.step() * 2
    }
}

var counter = DoubleCounter()
counter.increment()
print(counter.increment())
print(counter is Counter, ' ', counter is DoubleCounter, ' ', Counter() is DoubleCounter)
"#;
    test_valid_program(source, "4\ntrue true false\n");
}

#[test]
fn test_bound_methods_and_fields() {
    let source = r#"
class Greeter {
    init(name) {
        self.name = name
    }
    greet() {
        return 'hello ' + self.name
    }
}

var greeter = Greeter('comet')
var greet = greeter.greet
greeter.name = 'world'
print(greet())
greeter.shout = (||) {
    return 'HEY'
}
print(greeter.shout())
"#;
    test_valid_program(source, "hello world\nHEY\n");
}

#[test]
fn test_static_methods_and_modifiers() {
    let source = r#"
class Math {
    public static square(n) {
        return n * n
    }
    private static name() {
        return self
    }
}
print(Math.square(7))
var name = Math.name
print(name())
"#;
    test_valid_program(source, "49\nMath\n");
}

#[test]
fn test_operator_overloading() {
    let source = r#"
class Vec {
    init(x, y) {
        self.x = x
        self.y = y
    }
    operator + (other) {
        return Vec(self.x + other.x, self.y + other.y)
    }
    operator == (other) {
        return self.x == other.x && self.y == other.y
    }
}

var sum = Vec(1, 2) + Vec(3, 4)
print(sum.x, ',', sum.y)
print(sum == Vec(4, 6), ' ', sum != Vec(0, 0))
"#;
    test_valid_program(source, "4,6\ntrue true\n");
}

#[test]
fn test_final_class_cannot_be_inherited() {
    let source = "class final Base {\n}\nclass Derived : Base {\n}";
    assert!(matches!(
        runtime_error(source),
        RuntimeError::FinalSuperclass(name) if &*name == "Base"
    ));
}

#[test]
fn test_enums() {
    let source = r#"
enum Color {
    Red,
    Green = 5,
    Blue
}
print(Color.Red, ' ', Color.Green, ' ', Color.Blue)
print(Color)
"#;
    test_valid_program(source, "0 5 6\n<enum Color>\n");
}

#[test]
fn test_foreach() {
    let source = r#"
class Range {
    init(n) {
        self.n = n
    }
    iterator() {
        return RangeIterator(self.n)
    }
}

class RangeIterator {
    init(n) {
        self.i = 0
        self.n = n
    }
    has_next?() {
        return self.i < self.n
    }
    get_next() {
        self.i += 1
        return self.i - 1
    }
}

foreach (var x in Range(5)) {
    if (x == 1) next
    if (x == 3) break
    print(x)
}
"#;
    test_valid_program(source, "0\n2\n");
}

#[test]
fn test_try_catch_finally() {
    let source = r#"
class Error {
    init(message) {
        self.message = message
    }
}
class IoError : Error {
}

try {
    throw IoError('disk')
} catch (Error as e) {
    print('caught ', e.message)
} finally {
    print('cleanup')
}

try {
    print('fine')
}
finally {
    var note = 'always'
    print(note)
}
"#;
    test_valid_program(source, "caught disk\ncleanup\nfine\nalways\n");
}

#[test]
fn test_catch_instance_by_builtin_type_name() {
    let source = r#"
class Oops {
}
try {
    throw Oops()
} catch (Instance as e) {
    print('caught ', e)
}
"#;
    test_valid_program(source, "caught <Oops instance>\n");
}

#[test]
fn test_exception_unwinds_frames() {
    let source = r#"
function risky(n) {
    if (n > 2) {
        throw 'too big'
    }
    return n
}

var total = 0
for (var i = 0; i < 5; i += 1) {
    try {
        total += risky(i)
    } catch (String as message) {
        print(message)
        break
    }
}
print(total)
"#;
    test_valid_program(source, "too big\n3\n");
}

#[test]
fn test_finally_runs_before_propagating() {
    let source = r#"
function f() {
    try {
        throw 'boom'
    } finally {
        print('finally')
    }
}

try {
    f()
} catch (String as e) {
    print('outer ', e)
}
"#;
    test_valid_program(source, "finally\nouter boom\n");
}

#[test]
fn test_uncaught_exception() {
    let source = r#"
try {
    throw 42
} catch (String) {
    print('not a string')
}
"#;
    assert!(matches!(
        runtime_error(source),
        RuntimeError::Uncaught(description) if description == "42"
    ));
}

#[test]
fn test_assert() {
    test_valid_program("assert(1 < 2)\nprint('ok')", "ok\n");
    assert!(matches!(
        runtime_error("assert(false)"),
        RuntimeError::AssertionFailed(message) if message == "Assertion failed."
    ));
    assert!(matches!(
        runtime_error("assert()"),
        RuntimeError::NativeArgument { name: "assert", .. }
    ));
}

#[test]
fn test_filename() {
    test_valid_program("print(__FILE__)", "test.cmt\n");
}

#[test]
fn test_stack_overflow() {
    let (vm, result, _) = run("function f(n) {\n f(n + 1)\n}\nf(0)");
    let Err(InterpretError::Runtime { error, trace }) = result else {
        panic!("expected a runtime error");
    };
    assert!(matches!(error, RuntimeError::StackOverflow));
    assert_eq!(vm.frame_count(), 64);
    assert_eq!(vm.stack_depth(), 129);
    assert_eq!(trace.lines().count(), 64);
    assert_eq!(trace.lines().last(), Some("test.cmt:4 - script()"));
}

#[test]
fn test_arity_mismatch() {
    let source = "function pair(a, b) {\nreturn a\n}\npair(1)";
    assert!(matches!(
        runtime_error(source),
        RuntimeError::ArityMismatch {
            expected: 2,
            got: 1
        }
    ));
    assert!(matches!(
        runtime_error("class Empty {\n}\nEmpty(1)"),
        RuntimeError::ArityMismatch {
            expected: 0,
            got: 1
        }
    ));
}

#[test]
fn test_undefined_things() {
    assert!(matches!(
        runtime_error("print(nope)"),
        RuntimeError::UndefinedVariable(name) if &*name == "nope"
    ));
    assert!(matches!(
        runtime_error("class A {\n}\nA().missing"),
        RuntimeError::UndefinedProperty(name) if &*name == "missing"
    ));
    assert!(matches!(
        runtime_error("var n = 1\nn.field = 2"),
        RuntimeError::OnlyInstancesHaveFields
    ));
    assert!(matches!(
        runtime_error("'text'.length()"),
        RuntimeError::OnlyInstancesHaveMethods
    ));
    assert!(matches!(
        runtime_error("print(1 is 2)"),
        RuntimeError::IsRequiresClass
    ));
}

#[test]
fn test_compile_error_is_reported() {
    let (_, result, output) = run("print('never')\nvar = 3");
    let Err(InterpretError::Compile(error)) = result else {
        panic!("expected a compile error");
    };
    assert_eq!(
        error.to_string(),
        "[test.cmt:2] at '=': Expect variable name."
    );
    assert!(output.is_empty());
}

#[test]
fn test_invalid_opcode() {
    let mut strings = Strings::new();
    let mut chunk = Chunk::new();
    chunk.add_bytecode(OpCode::Nil, 1);
    chunk.add_bytecode(0xFFu8, 1);
    let function = Rc::new(Function::new(
        None,
        0,
        chunk,
        Vec::new(),
        strings.intern("handmade"),
    ));

    let mut vm = Vm::new(Rc::new(RefCell::new(Vec::new())));
    let Err(InterpretError::Runtime { error, trace }) = vm.execute(function) else {
        panic!("expected a runtime error");
    };
    assert!(matches!(error, RuntimeError::InvalidOpCode(_)));
    assert_eq!(trace, "handmade:1 - script()");
    assert_eq!(vm.stack_depth(), 2);
}

#[test]
fn test_globals_persist_between_runs() {
    let output = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::new(output.clone());
    vm.interpret(&SourceFile::new("first", "var shared = 'kept'"))
        .unwrap();
    vm.interpret(&SourceFile::new("second", "print(shared)"))
        .unwrap();
    assert_eq!(String::from_utf8(output.take()).unwrap(), "kept\n");
}
