//! End-to-end tests driving `Vm::interpret` with captured output.

use kuroko::{CollectStringPrint, CollectedOutput, NoopTracer, Value, Vm, VmOptions};
use pretty_assertions::assert_eq;

fn vm_with_output() -> (Vm, CollectedOutput) {
    let (writer, handle) = CollectStringPrint::new();
    let vm = Vm::with_io(VmOptions::default(), Box::new(writer), Box::new(NoopTracer));
    (vm, handle)
}

fn run(source: &str) -> String {
    let (mut vm, out) = vm_with_output();
    match vm.interpret(source, "test.krk") {
        Ok(_) => out.take(),
        Err(err) => panic!("script failed: {err}\npartial output: {}", out.take()),
    }
}

fn run_error(source: &str) -> kuroko::Exception {
    let (mut vm, _out) = vm_with_output();
    vm.interpret(source, "test.krk").expect_err("script should raise")
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(run("print(1 + 2 * 3)\n"), "7\n");
    assert_eq!(run("print((1 + 2) * 3)\n"), "9\n");
    assert_eq!(run("print(2 ** 3 ** 2)\n"), "512\n");
    assert_eq!(run("print(7 // 2, 7 % 2, -7 // 2, -7 % 2)\n"), "3 1 -4 1\n");
    assert_eq!(run("print(1 / 2)\n"), "0.5\n");
}

#[test]
fn string_operations() {
    assert_eq!(run("print('a' + 'b' * 3)\n"), "abbb\n");
    assert_eq!(run("print('hello'.upper(), 'A,B'.split(','))\n"), "HELLO ['A', 'B']\n");
    assert_eq!(run("print('abc'[1], 'abcdef'[1:4])\n"), "b bcd\n");
    assert_eq!(run("print(len('\\u3042bc'))\n"), "3\n");
}

#[test]
fn let_and_globals() {
    assert_eq!(run("let x = 10\nx += 5\nprint(x)\n"), "15\n");
    // Unqualified assignment at module scope creates a global.
    assert_eq!(run("y = 3\nprint(y)\n"), "3\n");
    assert_eq!(run("let a, b = [1, 2]\nprint(a, b)\n"), "1 2\n");
}

#[test]
fn default_arguments() {
    let out = run("def f(x=10): return x\nprint(f(), f(3))\n");
    assert_eq!(out, "10 3\n");
}

#[test]
fn keyword_defaults_evaluate_left_to_right() {
    let out = run(concat!(
        "let order = []\n",
        "def note(tag):\n",
        "    order.append(tag)\n",
        "    return tag\n",
        "def f(a=note('a'), b=note('b')):\n",
        "    return a + b\n",
        "f()\n",
        "print(order)\n",
    ));
    assert_eq!(out, "['a', 'b']\n");
}

#[test]
fn keyword_arguments_and_collectors() {
    assert_eq!(run("def f(a, b=2): return a + b\nprint(f(1), f(1, b=10), f(b=1, a=1))\n"), "3 11 2\n");
    let out = run(concat!(
        "def g(*args, **kwargs):\n",
        "    return len(args) + len(kwargs)\n",
        "print(g(1, 2, 3, x=1, y=2))\n",
    ));
    assert_eq!(out, "5\n");
    assert_eq!(run("def h(a, b, c): return a * 100 + b * 10 + c\nprint(h(*[1, 2], 3))\n"), "123\n");
}

#[test]
fn classes_init_and_repr() {
    let out = run(concat!(
        "class A:\n",
        "    def __init__(self, n):\n",
        "        self.n = n\n",
        "    def __repr__(self):\n",
        "        return f\"A({self.n})\"\n",
        "print(A(5))\n",
    ));
    assert_eq!(out, "A(5)\n");
}

#[test]
fn inheritance_and_super() {
    let out = run(concat!(
        "class Base:\n",
        "    def __init__(self, n):\n",
        "        self.n = n\n",
        "    def describe(self):\n",
        "        return 'base'\n",
        "class Child(Base):\n",
        "    def __init__(self, n):\n",
        "        super.__init__(self, n * 2)\n",
        "    def describe(self):\n",
        "        return 'child of ' + super.describe(self)\n",
        "let c = Child(4)\n",
        "print(c.n, c.describe())\n",
    ));
    assert_eq!(out, "8 child of base\n");
}

#[test]
fn properties_and_statics() {
    let out = run(concat!(
        "class Box:\n",
        "    kind = 'box'\n",
        "    def __init__(self, w):\n",
        "        self.w = w\n",
        "    @property\n",
        "    def double(self):\n",
        "        return self.w * 2\n",
        "    @staticmethod\n",
        "    def greeting():\n",
        "        return 'hi'\n",
        "let b = Box(21)\n",
        "print(b.double, Box.kind, Box.greeting())\n",
    ));
    assert_eq!(out, "42 box hi\n");
}

#[test]
fn generator_expressions() {
    let out = run("g = (x*x for x in [1, 2, 3])\nprint([x for x in g])\n");
    assert_eq!(out, "[1, 4, 9]\n");
}

#[test]
fn generators_yield_and_exhaust() {
    let out = run(concat!(
        "def gen():\n",
        "    yield 1\n",
        "    yield 2\n",
        "it = gen()\n",
        "print(next(it), next(it))\n",
    ));
    assert_eq!(out, "1 2\n");

    let err = run_error(concat!(
        "def gen():\n",
        "    yield 1\n",
        "it = gen()\n",
        "next(it)\n",
        "next(it)\n",
        "next(it)\n",
    ));
    assert_eq!(err.exc_type, "StopIteration");
}

#[test]
fn generator_send_protocol() {
    let out = run(concat!(
        "def echo():\n",
        "    let got = yield 1\n",
        "    yield got\n",
        "it = echo()\n",
        "print(next(it))\n",
        "print(it.send(42))\n",
    ));
    assert_eq!(out, "1\n42\n");

    let err = run_error(concat!(
        "def gen():\n",
        "    yield 1\n",
        "gen().send(5)\n",
    ));
    assert_eq!(err.exc_type, "TypeError");
}

#[test]
fn with_suppresses_on_truthy_exit() {
    let out = run(concat!(
        "class C:\n",
        "    def __enter__(self):\n",
        "        return 1\n",
        "    def __exit__(self, *a):\n",
        "        print(\"x\")\n",
        "        return True\n",
        "with C() as v:\n",
        "    raise ValueError(\"boom\")\n",
        "print(\"ok\")\n",
    ));
    assert_eq!(out, "x\nok\n");
}

#[test]
fn with_propagates_when_exit_is_falsey() {
    let out = run(concat!(
        "class C:\n",
        "    def __enter__(self):\n",
        "        return 1\n",
        "    def __exit__(self, *a):\n",
        "        print('exit')\n",
        "        return False\n",
        "try:\n",
        "    with C() as v:\n",
        "        raise ValueError('boom')\n",
        "except ValueError as e:\n",
        "    print('caught')\n",
    ));
    assert_eq!(out, "exit\ncaught\n");
}

#[test]
fn with_runs_exit_on_normal_paths() {
    let out = run(concat!(
        "class C:\n",
        "    def __enter__(self):\n",
        "        return self\n",
        "    def __exit__(self, *a):\n",
        "        print('exit')\n",
        "def f():\n",
        "    with C():\n",
        "        return 'r'\n",
        "print(f())\n",
    ));
    assert_eq!(out, "exit\nr\n");
}

#[test]
fn set_operators() {
    assert_eq!(run("print({1, 2, 3} & {2, 3, 4})\n"), "{2, 3}\n");
    assert_eq!(run("print({1, 2} | {2, 3}, {1, 2} - {2}, {1, 2} ^ {2, 3})\n"), "{1, 2, 3} {1} {1, 3}\n");
}

#[test]
fn try_except_filters_by_class() {
    let out = run(concat!(
        "try:\n",
        "    raise KeyError('k')\n",
        "except ValueError:\n",
        "    print('wrong')\n",
        "except KeyError as e:\n",
        "    print('caught', e.arg)\n",
        "print('after')\n",
    ));
    assert_eq!(out, "caught k\nafter\n");
}

#[test]
fn uncaught_exceptions_reach_the_embedder() {
    let err = run_error("def f():\n    raise ValueError('deep')\nf()\n");
    assert_eq!(err.exc_type, "ValueError");
    assert_eq!(err.message, "deep");
    assert_eq!(err.traceback.len(), 2);
    assert_eq!(err.traceback[0].func, "<module>");
    assert_eq!(err.traceback[1].func, "f");
}

#[test]
fn user_exception_classes() {
    let out = run(concat!(
        "class MyError(ValueError):\n",
        "    pass\n",
        "try:\n",
        "    raise MyError('custom')\n",
        "except ValueError as e:\n",
        "    print('caught', e.arg)\n",
    ));
    assert_eq!(out, "caught custom\n");
}

#[test]
fn closures_capture_and_close() {
    let out = run(concat!(
        "def counter():\n",
        "    let n = 0\n",
        "    def bump():\n",
        "        n += 1\n",
        "        return n\n",
        "    return bump\n",
        "let c = counter()\n",
        "print(c(), c(), c())\n",
    ));
    assert_eq!(out, "1 2 3\n");
}

#[test]
fn loops_and_control_flow() {
    assert_eq!(run("let t = 0\nfor x in [1, 2, 3, 4]:\n    if x == 3:\n        continue\n    t += x\nprint(t)\n"), "7\n");
    assert_eq!(run("let t = 0\nwhile True:\n    t += 1\n    if t == 5:\n        break\nprint(t)\n"), "5\n");
    assert_eq!(run("let t = 0\nfor i = 0; i < 4; i++:\n    t += i\nprint(t)\n"), "6\n");
    assert_eq!(run("let t = 0\nfor x in range(5):\n    t += x\nprint(t)\n"), "10\n");
}

#[test]
fn comprehensions_match_iterative_form() {
    let comprehension = run("print([x * x for x in [1, 2, 3, 4] if x % 2 == 0])\n");
    let iterative = run(concat!(
        "let acc = []\n",
        "for x in [1, 2, 3, 4]:\n",
        "    if x % 2 == 0:\n",
        "        acc.append(x * x)\n",
        "print(acc)\n",
    ));
    assert_eq!(comprehension, iterative);
    assert_eq!(run("print({x: x * 2 for x in [1, 2]})\n"), "{1: 2, 2: 4}\n");
    assert_eq!(run("print({x % 3 for x in [3, 4, 6]})\n"), "{0, 1}\n");
    assert_eq!(run("print([x + y for x in [1, 2] for y in [10, 20]])\n"), "[11, 21, 12, 22]\n");
}

#[test]
fn ternary_evaluates_condition_first() {
    let out = run(concat!(
        "let log = []\n",
        "def probe(tag, result):\n",
        "    log.append(tag)\n",
        "    return result\n",
        "let r = probe('value', 'yes') if probe('cond', True) else probe('other', 'no')\n",
        "print(r, log)\n",
    ));
    assert_eq!(out, "yes ['cond', 'value']\n");
    assert_eq!(run("print(1 if False else 2)\n"), "2\n");
}

#[test]
fn dicts_and_subscripts() {
    assert_eq!(run("let d = {'a': 1}\nd['b'] = 2\nprint(d['a'] + d['b'], len(d))\n"), "3 2\n");
    assert_eq!(run("let d = {'a': 1}\ndel d['a']\nprint(len(d), d.get('a', 'gone'))\n"), "0 gone\n");
    let err = run_error("let d = {}\nd[1]\n");
    assert_eq!(err.exc_type, "KeyError");
}

#[test]
fn eval_repr_round_trip() {
    // repr output re-parses to an equal value for plain data.
    let out = run(concat!(
        "let values = [None, True, 42, 2.5, 'a\\nb', [1, [2, 3]], {'k': (1, 2)}]\n",
        "print(repr(values))\n",
    ));
    assert_eq!(out, "[None, True, 42, 2.5, 'a\\nb', [1, [2, 3]], {'k': (1, 2)}]\n");
    let round = run(&format!("print(repr({}))\n", out.trim_end()));
    assert_eq!(round, out);
}

#[test]
fn is_identity_and_interning() {
    assert_eq!(run("print('abc' is 'ab' + 'c')\n"), "True\n");
    assert_eq!(run("let a = []\nlet b = []\nprint(a is b, a is a)\n"), "False True\n");
    assert_eq!(run("print(None is None, 1 is 1.0)\n"), "True False\n");
}

#[test]
fn fstrings_interpolate_and_repr() {
    assert_eq!(run("let n = 5\nprint(f'n={n} next={n + 1}')\n"), "n=5 next=6\n");
    assert_eq!(run("let s = 'hi'\nprint(f'{s!r}')\n"), "'hi'\n");
    assert_eq!(run("print(f'{{literal}}')\n"), "{literal}\n");
}

#[test]
fn not_in_and_is_not() {
    assert_eq!(run("print(3 not in [1, 2], 1 not in [1])\n"), "True False\n");
    assert_eq!(run("let a = []\nprint(a is not [])\n"), "True\n");
}

#[test]
fn recursion_limit_is_enforced() {
    let err = run_error("def f(): return f()\nf()\n");
    assert_eq!(err.exc_type, "Exception");
    assert!(err.message.contains("recursion"));
}

#[test]
fn cross_type_numeric_equality() {
    assert_eq!(run("print(1 == 1.0, True == 1, {1: 'x'}[1.0])\n"), "True True x\n");
}

#[test]
fn del_and_attribute_errors() {
    let err = run_error("let o = object()\no.missing\n");
    assert_eq!(err.exc_type, "AttributeError");
    let out = run(concat!(
        "class P:\n",
        "    def __init__(self):\n",
        "        self.x = 1\n",
        "let p = P()\n",
        "del p.x\n",
        "print(hasattr(p, 'x'))\n",
    ));
    assert_eq!(out, "False\n");
}

#[test]
fn lambda_and_higher_order_builtins() {
    assert_eq!(run("let add = lambda a, b: a + b\nprint(add(2, 3))\n"), "5\n");
    assert_eq!(run("print(sorted([3, 1, 2]), sum([1, 2, 3]), min(4, 2), max([5, 9]))\n"), "[1, 2, 3] 6 2 9\n");
    assert_eq!(run("print(list(map(lambda x: x + 1, [1, 2])), list(filter(lambda x: x > 1, [1, 2, 3])))\n"), "[2, 3] [2, 3]\n");
    assert_eq!(run("for i, x in enumerate(['a', 'b']):\n    print(i, x)\n"), "0 a\n1 b\n");
}

#[test]
fn gc_preserves_reachable_objects() {
    let (mut vm, out) = vm_with_output();
    let source = concat!(
        "let keep = []\n",
        "for i in range(100):\n",
        "    keep.append('string number ' + str(i))\n",
        "let waste = None\n",
        "for i in range(100):\n",
        "    waste = [str(i), [str(i * 2)]]\n",
        "print(len(keep), keep[99])\n",
    );
    vm.interpret(source, "gc.krk").expect("script runs");
    let live_before = vm.heap.stats().live_objects;
    vm.collect_garbage();
    vm.collect_garbage();
    let live_after = vm.heap.stats().live_objects;
    assert!(live_after <= live_before);
    assert_eq!(out.take(), "100 string number 99\n");
    // Reachable values survive further collections.
    vm.interpret("print(keep[0])\n", "gc2.krk").expect_err("fresh module has no keep");
}

#[test]
fn gc_stress_mode_matches_normal_output() {
    let source = concat!(
        "let acc = []\n",
        "for x in [1, 2, 3]:\n",
        "    acc.append(str(x * 7))\n",
        "print(acc)\n",
    );
    let normal = run(source);
    let (writer, handle) = CollectStringPrint::new();
    let mut options = VmOptions::default();
    options.gc_stress = true;
    let mut vm = Vm::with_io(options, Box::new(writer), Box::new(NoopTracer));
    vm.interpret(source, "stress.krk").expect("stressed run succeeds");
    assert_eq!(handle.take(), normal);
}

#[test]
fn interpret_returns_module_result() {
    let (mut vm, _out) = vm_with_output();
    let value = vm.interpret("1 + 2\n", "expr.krk").expect("expression runs");
    // Module bodies return None; the expression value is popped.
    assert!(matches!(value, Value::None));
}

fn vm_with_module_path(path: &str) -> (Vm, CollectedOutput) {
    let (writer, handle) = CollectStringPrint::new();
    let mut options = VmOptions::default();
    options.module_paths = vec![path.to_owned()];
    let vm = Vm::with_io(options, Box::new(writer), Box::new(NoopTracer));
    (vm, handle)
}

#[test]
fn imports_resolve_through_module_paths() {
    let (mut vm, out) = vm_with_module_path("tests/modules");
    vm.interpret("import helper\nprint(helper.bump(helper.value))\n", "imp.krk")
        .expect("import runs");
    assert_eq!(out.take(), "42\n");
}

#[test]
fn from_imports_bind_names_and_aliases() {
    let (mut vm, out) = vm_with_module_path("tests/modules");
    vm.interpret("from helper import bump as b, value\nprint(b(value))\n", "imp.krk")
        .expect("from-import runs");
    assert_eq!(out.take(), "42\n");
}

#[test]
fn missing_modules_raise_import_error() {
    let (mut vm, _out) = vm_with_module_path("tests/modules");
    let err = vm
        .interpret("import nonexistent\n", "imp.krk")
        .expect_err("module should be missing");
    assert_eq!(err.exc_type, "ImportError");
}

#[test]
fn builtin_kuroko_module_exposes_paths() {
    let out = run("import kuroko\nprint(len(kuroko.module_paths) > 0, kuroko.version)\n");
    assert_eq!(out, "True 1.0.0\n");
}

#[test]
fn syntax_errors_render_with_location() {
    let err = run_error("def (:\n");
    assert_eq!(err.exc_type, "SyntaxError");
    assert!(err.message.contains("line 1"));
}
