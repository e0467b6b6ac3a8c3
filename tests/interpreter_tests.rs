// Integration tests for the Ruff bytecode VM.
//
// Each test compiles a complete source program against a fresh `Heap` and
// runs it through `Vm::interpret`, checking either the unhandled-exception
// path or the value of a module-level variable the program assigns its
// result to (module-level code always returns `None`, same as a Python
// module body, so there's nothing useful to read off `interpret`'s `Ok`
// value itself). Tests cover variable scoping, control flow, functions/
// closures, classes, exceptions, generators, and built-ins.

use ruff::compiler::compile;
use ruff::value::Value;
use ruff::vm::Vm;

fn run(source: &str) -> Result<Value, Value> {
    let mut vm = Vm::new();
    let function = compile(source, "<test>", &mut vm.heap).expect("compile error");
    vm.interpret(function)
}

fn run_ok(source: &str) -> Value {
    match run(source) {
        Ok(v) => v,
        Err(e) => panic!("unexpected exception: {e:?}"),
    }
}

/// Runs `source`, then reads back the module-level global `name` (the
/// idiom every test below uses in place of a trailing bare expression,
/// since module execution itself always yields `None`).
fn run_global(source: &str, name: &str) -> Value {
    let mut vm = Vm::new();
    let function = compile(source, "<test>", &mut vm.heap).expect("compile error");
    vm.interpret(function).expect("unexpected exception");
    let module = vm.main_module();
    let key = Value::Obj(vm.heap.intern(name));
    vm.heap
        .instance_field_get(module, key)
        .unwrap_or_else(|| panic!("no such global: {name}"))
}

fn global_int(source: &str, name: &str) -> i64 {
    as_int(run_global(source, name))
}

fn as_int(v: Value) -> i64 {
    match v {
        Value::Int(i) => i,
        other => panic!("expected int, got {other:?}"),
    }
}

fn as_str(vm: &Vm, v: Value) -> String {
    match v {
        Value::Obj(r) => vm.heap.as_str(r).expect("expected a string value").to_string(),
        other => panic!("expected str, got {other:?}"),
    }
}

#[test]
fn arithmetic_and_precedence() {
    let v = global_int("result = 2 + 3 * 4 - 1", "result");
    assert_eq!(v, 13);
}

#[test]
fn variable_assignment_and_scoping() {
    let source = "
x = 1
if True:
    x = 2
    y = 10
result = x + y
";
    assert_eq!(global_int(source, "result"), 12);
}

#[test]
fn while_loop_accumulates() {
    let source = "
total = 0
i = 0
while i < 5:
    total = total + i
    i = i + 1
";
    assert_eq!(global_int(source, "total"), 10);
}

#[test]
fn for_loop_over_range() {
    let source = "
total = 0
for i in range(5):
    total = total + i
";
    assert_eq!(global_int(source, "total"), 10);
}

#[test]
fn function_call_and_closures() {
    let source = "
def make_adder(n):
    def add(x):
        return x + n
    return add

add5 = make_adder(5)
result = add5(10)
";
    assert_eq!(global_int(source, "result"), 15);
}

#[test]
fn recursive_function() {
    let source = "
def fib(n):
    if n < 2:
        return n
    return fib(n - 1) + fib(n - 2)

result = fib(10)
";
    assert_eq!(global_int(source, "result"), 55);
}

#[test]
fn class_instantiation_and_methods() {
    let source = "
class Counter:
    def __init__(self, start):
        self.value = start

    def increment(self):
        self.value = self.value + 1
        return self.value

c = Counter(10)
c.increment()
result = c.increment()
";
    assert_eq!(global_int(source, "result"), 12);
}

#[test]
fn class_inheritance_and_super() {
    let source = "
class Animal:
    def __init__(self, name):
        self.name = name

    def speak(self):
        return self.name

class Dog(Animal):
    def speak(self):
        return super().speak() + \"!\"

d = Dog(\"Rex\")
result = d.speak()
";
    let mut vm = Vm::new();
    let function = compile(source, "<test>", &mut vm.heap).expect("compile error");
    vm.interpret(function).expect("unexpected exception");
    let module = vm.main_module();
    let key = Value::Obj(vm.heap.intern("result"));
    let result = vm.heap.instance_field_get(module, key).expect("no such global: result");
    assert_eq!(as_str(&vm, result), "Rex!");
}

#[test]
fn list_building_and_indexing() {
    let source = "
xs = [1, 2, 3]
xs.append(4)
result = xs[0] + xs[3]
";
    assert_eq!(global_int(source, "result"), 5);
}

#[test]
fn dict_literal_and_lookup() {
    let source = "
d = {\"a\": 1, \"b\": 2}
result = d[\"a\"] + d[\"b\"]
";
    assert_eq!(global_int(source, "result"), 3);
}

#[test]
fn try_except_catches_raised_exception() {
    let source = "
caught = 0
try:
    raise ValueError(\"boom\")
except ValueError:
    caught = 1
";
    assert_eq!(global_int(source, "caught"), 1);
}

#[test]
fn uncaught_exception_propagates_as_err() {
    let source = "
def fail():
    raise TypeError(\"nope\")

fail()
";
    let mut vm = Vm::new();
    let function = compile(source, "<test>", &mut vm.heap).expect("compile error");
    let err = vm.interpret(function).expect_err("expected an unhandled exception");
    let rendered = ruff::builtins::display_repr(&mut vm, err).unwrap();
    assert!(rendered.contains("nope"), "rendered exception was: {rendered}");
}

#[test]
fn generator_yields_sequence() {
    let source = "
def counter(n):
    i = 0
    while i < n:
        yield i
        i = i + 1

g = counter(3)
a = next(g)
b = next(g)
c = next(g)
result = a + b + c
";
    assert_eq!(global_int(source, "result"), 3);
}

#[test]
fn with_statement_runs_exit_on_normal_exit() {
    let source = "
class Ctx:
    def __enter__(self):
        return self

    def __exit__(self, exc_type, exc, tb):
        ran = 1

ran = 0
with Ctx():
    pass
";
    assert_eq!(global_int(source, "ran"), 1);
}

#[test]
fn string_length_and_equality() {
    let source = "result = len(\"hello\") == 5";
    let v = run_global(source, "result");
    assert!(matches!(v, Value::Bool(true)));
}

#[test]
fn sum_builtin_over_range() {
    let source = "result = sum(range(1, 5))";
    assert_eq!(global_int(source, "result"), 10);
}
