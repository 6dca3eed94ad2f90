// Integration tests for the Panda scripting language.
//
// These tests drive complete programs through the embedding facade and check
// the resulting values. Coverage:
// - Arithmetic, logic, and operator precedence
// - Closures and upvalue capture
// - Classes, inheritance, and super dispatch
// - Exceptions (try/catch/finally ordering, re-raise)
// - Iterators and for-in loops
// - Modules, exports, and the loader hook
// - Bytecode serialization round-trips
// - Resource bounds (frame cap)

use panda::engine::Engine;
use panda::errors::PandaError;
use panda::value::Value;

fn run(source: &str) -> Value {
    Engine::new()
        .run(source, None, false)
        .unwrap_or_else(|e| panic!("script failed: {}\n{}", e.message, source))
}

fn run_err(source: &str) -> PandaError {
    match Engine::new().run(source, None, false) {
        Ok(value) => panic!("expected error, got {:?}", value),
        Err(err) => err,
    }
}

fn num(value: &Value) -> f64 {
    value
        .as_number()
        .unwrap_or_else(|| panic!("expected number, got {:?}", value))
}

fn text(value: &Value) -> String {
    match value {
        Value::Str(s) => s.as_ref().clone(),
        other => panic!("expected string, got {:?}", other),
    }
}

// --- arithmetic & operators ---

#[test]
fn arithmetic_precedence() {
    assert_eq!(num(&run("return 2 + 3 * 4")), 14.0);
    assert_eq!(num(&run("return (2 + 3) * 4")), 20.0);
    assert_eq!(num(&run("return 10 % 3")), 1.0);
    assert_eq!(num(&run("return -10 % 3")), -1.0);
}

#[test]
fn division_by_zero_yields_infinity() {
    let result = run("var zero = 0\nreturn 1 / zero");
    assert!(num(&result).is_infinite() && num(&result) > 0.0);
}

#[test]
fn bitwise_and_shift_operators() {
    assert_eq!(num(&run("var a = 6\nreturn a & 3")), 2.0);
    assert_eq!(num(&run("var a = 6\nreturn a | 9")), 15.0);
    assert_eq!(num(&run("var a = 6\nreturn a ^ 3")), 5.0);
    assert_eq!(num(&run("var a = 1\nreturn a << 4")), 16.0);
    assert_eq!(num(&run("var a = 32\nreturn a >> 2")), 8.0);
    assert_eq!(num(&run("var a = 0\nreturn ~a")), -1.0);
}

#[test]
fn string_concatenation_coerces_numbers() {
    assert_eq!(text(&run("return \"n=\" + 14")), "n=14");
    assert_eq!(text(&run("return 3.5 + \"!\"")), "3.5!");
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(num(&run("return false || 2")), 2.0);
    assert_eq!(num(&run("return 1 && 2")), 2.0);
    assert!(matches!(run("return false && boom()"), Value::Bool(false)));
    assert_eq!(num(&run("return null ?? 3")), 3.0);
    assert_eq!(num(&run("return 0 ?? 3")), 0.0);
    assert_eq!(num(&run("return true and 5")), 5.0);
    assert_eq!(num(&run("return false or 7")), 7.0);
}

#[test]
fn ternary_expression() {
    assert_eq!(num(&run("var t = true\nreturn t ? 1 : 2")), 1.0);
    assert_eq!(num(&run("var t = false\nreturn t ? 1 : 2")), 2.0);
}

#[test]
fn compound_assignment_and_inc_dec() {
    assert_eq!(num(&run("var x = 5\nx += 3\nreturn x")), 8.0);
    assert_eq!(num(&run("var x = 5\nx *= 2\nx -= 1\nreturn x")), 9.0);
    assert_eq!(num(&run("var a = [1, 2, 3]\na[1] += 10\nreturn a[1]")), 12.0);
    assert_eq!(num(&run("var o = {n: 1}\no.n += 4\nreturn o.n")), 5.0);
    assert_eq!(num(&run("var x = 5\nreturn ++x")), 6.0);
    assert_eq!(num(&run("var x = 5\nvar old = x++\nreturn old * 10 + x")), 56.0);
    assert_eq!(num(&run("var o = {n: 1}\no.n++\nreturn o.n")), 2.0);
    assert_eq!(num(&run("var o = {n: 1}\nvar old = o.n++\nreturn old")), 1.0);
    assert_eq!(num(&run("var a = [5]\nvar old = a[0]--\nreturn old + a[0]")), 9.0);
    assert_eq!(num(&run("var a = [5]\nreturn --a[0] + a[0]")), 8.0);
}

// --- closures ---

#[test]
fn closure_counter_scenario() {
    let source = "func makeCounter(){ var c=0; return ()=> { c=c+1; return c } }\nvar f=makeCounter(); f(); f(); return f()";
    assert_eq!(num(&run(source)), 3.0);
}

#[test]
fn closures_capture_the_variable_not_its_value() {
    let source = "func make() {\nvar v = 1\nvar set = (n) => { v = n }\nvar get = () => v\nset(41)\nv = v + 1\nreturn get()\n}\nreturn make()";
    assert_eq!(num(&run(source)), 42.0);
}

#[test]
fn counters_are_independent() {
    let source = "func makeCounter(){ var c=0; return ()=> { c=c+1; return c } }\nvar a=makeCounter()\nvar b=makeCounter()\na(); a()\nreturn a() * 10 + b()";
    assert_eq!(num(&run(source)), 31.0);
}

#[test]
fn pure_functions_are_repeatable() {
    let source = "func square(n) { return n * n }\nreturn square(9) == square(9)";
    assert!(matches!(run(source), Value::Bool(true)));
}

// --- classes ---

#[test]
fn inheritance_dispatch_scenario() {
    let source = "class Animal { Animal(n){this.name=n} func speak(){return this.name+\" says hello\"} }\nclass Dog : Animal { Dog(n,b){super.Animal(n); this.breed=b} func speak(){return this.name+\" barks\"} }\nreturn Dog(\"Buddy\",\"Lab\").speak()";
    assert_eq!(text(&run(source)), "Buddy barks");
}

#[test]
fn inherited_methods_are_callable_on_subclasses() {
    let source = "class Animal { Animal(n){this.name=n} func speak(){return this.name+\" says hello\"} }\nclass Cat : Animal { Cat(n){super.Animal(n)} }\nreturn Cat(\"Mia\").speak()";
    assert_eq!(text(&run(source)), "Mia says hello");
}

#[test]
fn field_initializers_run_in_synthesized_constructors() {
    let source = "class Point { var x = 3\nvar y = 4 }\nvar p = Point()\nreturn p.x + p.y";
    assert_eq!(num(&run(source)), 7.0);
}

#[test]
fn field_initializers_run_after_the_super_call() {
    let source = "class Base { Base() { this.v = 1 } }\nclass Derived : Base { var v = 2 }\nreturn Derived().v";
    assert_eq!(num(&run(source)), 2.0);
}

#[test]
fn static_members() {
    let source = "class Counter {\nstatic var count = 0\nstatic func bump() { Counter.count += 1\nreturn Counter.count }\n}\nCounter.bump()\nreturn Counter.bump()";
    assert_eq!(num(&run(source)), 2.0);
}

#[test]
fn constructors_implicitly_return_this() {
    let source = "class A { A() { this.x = 1 } }\nvar a = A()\nreturn type(a)";
    assert_eq!(text(&run(source)), "instance");
}

#[test]
fn bound_methods_carry_their_receiver() {
    let source = "class Greeter { Greeter(n) { this.n = n } func hi() { return \"hi \" + this.n } }\nvar m = Greeter(\"bob\").hi\nreturn m()";
    assert_eq!(text(&run(source)), "hi bob");
}

#[test]
fn this_is_captured_by_lambdas_in_methods() {
    let source = "class A { A() { this.n = 5 } func getter() { return () => this.n } }\nreturn A().getter()()";
    assert_eq!(num(&run(source)), 5.0);
}

// --- functions, defaults, rest ---

#[test]
fn default_parameters_fill_missing_and_null_arguments() {
    let source = "func f(a, b = a + 1) { return a * 10 + b }\nreturn f(1)";
    assert_eq!(num(&run(source)), 12.0);
    let source = "func f(a, b = a + 1) { return a * 10 + b }\nreturn f(1, null)";
    assert_eq!(num(&run(source)), 12.0);
    let source = "func f(a, b = a + 1) { return a * 10 + b }\nreturn f(1, 7)";
    assert_eq!(num(&run(source)), 17.0);
}

#[test]
fn rest_parameters_collect_extras() {
    let source = "func f(first, ...rest) { return \"{first}:{join(rest, \"-\")}\" }\nreturn f(1, 2, 3, 4)";
    assert_eq!(text(&run(source)), "1:2-3-4");
}

#[test]
fn functions_implicitly_return_null() {
    let source = "func f() { var x = 1 }\nreturn f()";
    assert!(matches!(run(source), Value::Null));
}

#[test]
fn lambdas_are_first_class() {
    let source = "func apply(f, x) { return f(x) }\nreturn apply((n) => n * n, 6)";
    assert_eq!(num(&run(source)), 36.0);
}

// --- control flow ---

#[test]
fn while_loops() {
    let source = "var n = 5\nvar acc = 1\nwhile n > 1 { acc = acc * n\nn = n - 1 }\nreturn acc";
    assert_eq!(num(&run(source)), 120.0);
}

#[test]
fn for_in_with_break_scenario() {
    let source = "var sum=0\nfor i in range(10){ if i==5 break; sum=sum+i }\nreturn sum";
    assert_eq!(num(&run(source)), 10.0);
}

#[test]
fn continue_keeps_the_stack_balanced() {
    // Imbalance anywhere in this loop would overflow the 256-slot stack long
    // before 200 iterations complete.
    let source = "var total = 0\nfor i in range(200) { if i % 2 == 0 continue; total = total + i }\nreturn total";
    assert_eq!(num(&run(source)), 10000.0);
}

#[test]
fn for_in_over_arrays_strings_and_objects() {
    assert_eq!(
        num(&run("var s = 0\nfor v in [1, 2, 3] { s = s + v }\nreturn s")),
        6.0
    );
    assert_eq!(
        text(&run("var out = \"\"\nfor c in \"abc\" { out = out + c }\nreturn out")),
        "abc"
    );
    let source = "var o = {a: 1, b: 2}\nvar out = []\nfor k, v in o { push(out, \"{k}={v}\") }\nreturn join(out, \",\")";
    assert_eq!(text(&run(source)), "a=1,b=2");
}

#[test]
fn for_kv_over_arrays_yields_indices() {
    let source = "var out = []\nfor i, v in [\"x\", \"y\"] { push(out, \"{i}:{v}\") }\nreturn join(out, \" \")";
    assert_eq!(text(&run(source)), "0:x 1:y");
}

#[test]
fn nested_loops_with_break() {
    let source = "var hits = 0\nfor i in range(3) {\nfor j in range(3) {\nif j > i break\nhits = hits + 1\n}\n}\nreturn hits";
    assert_eq!(num(&run(source)), 6.0);
}

// --- exceptions ---

#[test]
fn try_catch_finally_ordering_scenario() {
    let source = "var x=0\ntry { throw 5 } catch(e) { x=e } finally { x=x+10 }\nreturn x";
    assert_eq!(num(&run(source)), 15.0);
}

#[test]
fn finally_runs_exactly_once_without_a_throw() {
    let source = "var log = []\ntry { push(log, \"t\") } finally { push(log, \"f\") }\nreturn join(log, \",\")";
    assert_eq!(text(&run(source)), "t,f");
}

#[test]
fn pending_exception_reraises_after_finally() {
    let source = "var log = []\ntry {\ntry { throw \"x\" } finally { push(log, \"f\") }\n} catch(e) { push(log, e) }\nreturn join(log, \",\")";
    assert_eq!(text(&run(source)), "f,x");
}

#[test]
fn throw_from_catch_still_runs_finally() {
    let source = "var log = []\ntry {\ntry { throw \"a\" } catch(e) { throw \"b\" } finally { push(log, \"fin\") }\n} catch(e) { push(log, e) }\nreturn join(log, \",\")";
    assert_eq!(text(&run(source)), "fin,b");
}

#[test]
fn runtime_errors_are_catchable() {
    let source = "try { return missing } catch(e) { return \"caught: \" + e }";
    assert!(text(&run(source)).starts_with("caught: Undefined variable"));
}

#[test]
fn exceptions_unwind_call_frames() {
    let source = "func inner() { throw \"deep\" }\nfunc outer() { inner()\nreturn \"unreached\" }\ntry { outer() } catch(e) { return e }";
    assert_eq!(text(&run(source)), "deep");
}

#[test]
fn uncaught_throw_escapes_with_a_trace() {
    let err = run_err("func f() { throw \"boom\" }\nf()");
    assert_eq!(err.message, "boom");
    assert!(!err.trace.is_empty());
    assert_eq!(err.trace[0].function, "f");
}

#[test]
fn thrown_objects_are_delivered_intact() {
    let source = "try { throw {code: 42} } catch(e) { return e.code }";
    assert_eq!(num(&run(source)), 42.0);
}

#[test]
fn catch_without_a_variable() {
    let source = "var hit = false\ntry { throw 1 } catch { hit = true }\nreturn hit";
    assert!(matches!(run(source), Value::Bool(true)));
}

// --- data structures ---

#[test]
fn arrays_and_objects() {
    assert_eq!(num(&run("var a = [1, 2, 3]\nreturn a.length")), 3.0);
    assert_eq!(num(&run("var a = [1, 2, 3]\nreturn len(a)")), 3.0);
    assert_eq!(num(&run("var a = [1, 2]\npush(a, 9)\nreturn a[2]")), 9.0);
    assert_eq!(num(&run("var a = [1, 2]\nreturn pop(a) + len(a)")), 3.0);
    assert_eq!(num(&run("var o = {x: 1, y: 2}\nreturn o.x + o[\"y\"]")), 3.0);
    assert_eq!(
        text(&run("var o = {b: 1, a: 2}\nreturn join(keys(o), \",\")")),
        "b,a"
    );
}

#[test]
fn array_index_out_of_range_is_an_error() {
    let err = run_err("var a = [1]\nreturn a[3]");
    assert!(err.message.contains("out of range"));
}

#[test]
fn string_builtins() {
    assert_eq!(num(&run("return len(\"hello\")")), 5.0);
    assert_eq!(text(&run("return slice(\"hello\", 1, 3)")), "el");
    assert_eq!(
        text(&run("return join(split(\"a-b-c\", \"-\"), \"+\")")),
        "a+b+c"
    );
    assert!(matches!(
        run("return contains(\"hello\", \"ell\")"),
        Value::Bool(true)
    ));
    assert_eq!(text(&run("return \"abc\"[1]")), "b");
}

#[test]
fn string_interpolation() {
    let source = "var name = \"World\"\nreturn \"Hello {name}! {1 + 1}\"";
    assert_eq!(text(&run(source)), "Hello World! 2");
    assert_eq!(text(&run("return \"\\{literal}\"")), "{literal}");
    let source = "var items = [1, 2]\nreturn \"first={items[0]} len={len(items)}\"";
    assert_eq!(text(&run(source)), "first=1 len=2");
}

#[test]
fn enums_auto_increment() {
    let source = "enum Color { Red, Green = 5, Blue }\nreturn Color.Red * 100 + Color.Green * 10 + Color.Blue";
    assert_eq!(num(&run(source)), 56.0);
    let source = "enum Mode { Name = \"n\", Other = 3 }\nreturn Mode.Name + Mode.Other";
    assert_eq!(text(&run(source)), "n3");
}

#[test]
fn optional_chaining() {
    assert!(matches!(run("var o = null\nreturn o?.field"), Value::Null));
    assert!(matches!(run("var o = null\nreturn o?.m(1, 2)"), Value::Null));
    assert!(matches!(run("var o = null\nreturn o?[0]"), Value::Null));
    assert_eq!(num(&run("var o = {a: 5}\nreturn o?.a")), 5.0);
    assert_eq!(num(&run("var a = [7]\nreturn a?[0]")), 7.0);
}

// --- globals ---

#[test]
fn global_declarations_reach_the_root_scope() {
    let source = "func setup() { global var g = 99 }\nsetup()\nreturn g";
    assert_eq!(num(&run(source)), 99.0);
}

#[test]
fn globals_proxy_reads_and_writes_the_root() {
    let source = "global var g = 1\nglobals.g = 5\nreturn globals.g + g";
    assert_eq!(num(&run(source)), 10.0);
}

// --- builtins ---

#[test]
fn conversion_builtins() {
    assert_eq!(text(&run("return str(14)")), "14");
    assert_eq!(text(&run("return str(3.14159)")), "3.14159");
    assert_eq!(num(&run("return num(\" 42 \")")), 42.0);
    assert!(matches!(run("return num(\"nope\")"), Value::Null));
    assert!(matches!(run("return bool(0)"), Value::Bool(true)));
    assert!(matches!(run("return bool(null)"), Value::Bool(false)));
    assert_eq!(text(&run("return type([])")), "array");
    assert_eq!(text(&run("return type(print)")), "function");
}

#[test]
fn math_builtins() {
    assert_eq!(num(&run("return abs(-3) + floor(2.9) + ceil(2.1)")), 8.0);
    assert_eq!(num(&run("return pow(2, 10)")), 1024.0);
    assert_eq!(num(&run("return min(2, 5) + max(2, 5)")), 7.0);
    assert_eq!(num(&run("return sqrt(81)")), 9.0);
    assert_eq!(num(&run("return round(2.5)")), 3.0);
}

#[test]
fn random_builtins_stay_in_range() {
    let source = "var v = random()\nreturn v >= 0 && v < 1";
    assert!(matches!(run(source), Value::Bool(true)));
    let source = "var v = randomInt(3, 5)\nreturn v >= 3 && v <= 5";
    assert!(matches!(run(source), Value::Bool(true)));
}

#[test]
fn assert_throws_catchable_errors() {
    let source = "try { assert(false, \"nope\") } catch(e) { return e }";
    assert_eq!(text(&run(source)), "nope");
    assert!(matches!(run("return assert(true)"), Value::Null));
}

#[test]
fn stacktrace_builtin_reports_frames() {
    let source = "func g() { return stacktrace() }\nfunc f() { return g() }\nreturn f()";
    let result = run(source);
    match result {
        Value::Array(items) => {
            let items = items.borrow();
            assert!(items.len() >= 3);
            assert!(items[0].to_display_string().contains('g'));
        }
        other => panic!("expected array, got {:?}", other),
    }
}

#[test]
fn json_builtins_round_trip() {
    assert_eq!(num(&run("return json.parse(\"[1, 2, 3]\")[1]")), 2.0);
    // Braces in the literal are escaped so they read as text, not
    // interpolation.
    assert_eq!(num(&run("return json.parse(\"\\{\\\"a\\\": 7}\").a")), 7.0);
    let source = "return json.parse(json.stringify({a: [true, null]})).a[0]";
    assert!(matches!(run(source), Value::Bool(true)));
}

#[test]
fn regex_builtins() {
    assert!(matches!(
        run("return regex.test(\"^a+$\", \"aaa\")"),
        Value::Bool(true)
    ));
    assert_eq!(text(&run("return regex.match(\"[0-9]+\", \"ab123cd\")")), "123");
    assert_eq!(
        text(&run("return regex.replace(\"[0-9]\", \"a1b2\", \"#\")")),
        "a#b#"
    );
}

#[test]
fn date_builtins_decode_timestamps() {
    // 2001-09-09T01:46:40Z.
    let source = "var ts = 1000000000000\nreturn \"{date.year(ts)}-{date.month(ts)}-{date.day(ts)}\"";
    assert_eq!(text(&run(source)), "2001-9-9");
    let source = "return time() > 0 && now() > 0";
    assert!(matches!(run(source), Value::Bool(true)));
}

// --- modules ---

fn engine_with_modules(modules: &[(&str, &str)]) -> Engine {
    let table: Vec<(String, Vec<u8>)> = modules
        .iter()
        .map(|(name, source)| (name.to_string(), source.as_bytes().to_vec()))
        .collect();
    let mut engine = Engine::new();
    engine.set_loader(Box::new(move |path| {
        table
            .iter()
            .find(|(name, _)| name == path)
            .map(|(name, bytes)| (bytes.clone(), format!("{}.panda", name)))
    }));
    engine
}

#[test]
fn module_export_visibility_scenario() {
    let mut engine = engine_with_modules(&[("math", "export var PI=3.14159\nvar SECRET=42")]);
    let result = engine
        .run("import \"math\" as m\nreturn m.PI", None, false)
        .unwrap();
    assert_eq!(result.as_number(), Some(3.14159));
    let result = engine
        .run("import \"math\" as m\nreturn m.SECRET", None, false)
        .unwrap();
    assert!(matches!(result, Value::Null));
}

#[test]
fn modules_without_exports_expose_everything() {
    let mut engine = engine_with_modules(&[("util", "var answer = 42\nfunc get() { return answer }")]);
    let result = engine
        .run("import \"util\"\nreturn util.get() + util.answer", None, false)
        .unwrap();
    assert_eq!(result.as_number(), Some(84.0));
}

#[test]
fn module_bodies_execute_once() {
    let mut engine = engine_with_modules(&[("m", "count = count + 1")]);
    let source = "global var count = 0\nimport \"m\" as a\nimport \"m\" as b\nreturn count";
    let result = engine.run(source, None, false).unwrap();
    assert_eq!(result.as_number(), Some(1.0));

    // A second script in the same engine still sees the cached module.
    let result = engine
        .run("import \"m\" as c\nreturn count", None, false)
        .unwrap();
    assert_eq!(result.as_number(), Some(1.0));

    // Clearing the cache lets the body run again.
    engine.clear_modules();
    let result = engine
        .run("import \"m\" as d\nreturn count", None, false)
        .unwrap();
    assert_eq!(result.as_number(), Some(2.0));
}

#[test]
fn circular_imports_are_detected() {
    let mut engine = engine_with_modules(&[("a", "import \"b\""), ("b", "import \"a\"")]);
    let err = engine.run("import \"a\"", None, false).unwrap_err();
    assert!(err.message.contains("Circular import"));
}

#[test]
fn missing_modules_are_runtime_errors() {
    let mut engine = engine_with_modules(&[]);
    let err = engine.run("import \"ghost\"", None, false).unwrap_err();
    assert!(err.message.contains("Module not found"));
}

#[test]
fn global_imports_bind_into_the_root_scope() {
    let mut engine = engine_with_modules(&[("cfg", "export var debug = true")]);
    engine
        .run("global import \"cfg\"", None, false)
        .unwrap();
    let result = engine.run("return cfg.debug", None, false).unwrap();
    assert!(matches!(result, Value::Bool(true)));
}

#[test]
fn preloaded_modules_skip_the_loader() {
    let mut engine = Engine::new();
    engine
        .load_module(b"export var version = 7", "info", "info.panda")
        .unwrap();
    let result = engine
        .run("import \"info\"\nreturn info.version", None, false)
        .unwrap();
    assert_eq!(result.as_number(), Some(7.0));
}

#[test]
fn module_functions_see_their_module_scope() {
    let mut engine = engine_with_modules(&[(
        "counter",
        "var n = 0\nexport func bump() { n = n + 1\nreturn n }",
    )]);
    let source = "import \"counter\" as c\nc.bump()\nreturn c.bump()";
    let result = engine.run(source, None, false).unwrap();
    assert_eq!(result.as_number(), Some(2.0));
}

// --- serialization ---

#[test]
fn compiled_bytecode_runs_like_source() {
    let sources = [
        "return 2 + 3 * 4",
        "func makeCounter(){ var c=0; return ()=> { c=c+1; return c } }\nvar f=makeCounter(); f(); f(); return f()",
        "class A { A() { this.v = 6 } func double() { return this.v * 2 } }\nreturn A().double()",
        "var x=0\ntry { throw 5 } catch(e) { x=e } finally { x=x+10 }\nreturn x",
    ];
    for source in sources {
        let mut engine = Engine::new();
        let direct = engine.run(source, None, false).unwrap();
        let compiled = engine.compile(source).unwrap();
        let mut engine = Engine::new();
        let via_bytecode = engine.run_bytes(&compiled.to_bytes(), None, false).unwrap();
        assert!(
            direct.equals(&via_bytecode)
                || direct.to_display_string() == via_bytecode.to_display_string(),
            "mismatch for {}",
            source
        );
    }
}

#[test]
fn serialization_round_trip_is_byte_identical() {
    let source = "class A : B { A() { super.B() } }\nclass B { B() { this.x = 1 } }\nfunc f(a, b = 2, ...rest) { try { return a } finally { } }\nexport var marker = \"m\"";
    let engine = Engine::new();
    let compiled = engine.compile(source).unwrap();
    let first = compiled.to_bytes();
    let restored = panda::bytecode::FunctionProto::deserialize(&first).unwrap();
    let second = restored.serialize();
    assert_eq!(first, second);
}

// --- resource bounds ---

#[test]
fn recursion_up_to_the_frame_cap_succeeds() {
    let source = "func f(n) { if n == 0 { return 0 }\nreturn f(n - 1) }\nreturn f(62)";
    assert_eq!(num(&run(source)), 0.0);
}

#[test]
fn recursion_past_the_frame_cap_overflows() {
    let source = "func f(n) { if n == 0 { return 0 }\nreturn f(n - 1) }\nreturn f(63)";
    let err = run_err(source);
    assert!(err.message.contains("Stack overflow"));
}

#[test]
fn deep_iteration_does_not_leak_stack() {
    // Every loop iteration rents and returns iterator state; a leak in
    // either direction would trip the operand-stack bound.
    let source = "var total = 0\nfor i in range(50) {\nfor j in range(50) { total = total + 1 }\n}\nreturn total";
    assert_eq!(num(&run(source)), 2500.0);
}

#[test]
fn too_many_nested_tries_is_an_error() {
    // The seventeenth SetupTry trips the handler bound; the error lands in
    // the innermost still-active catch.
    let mut source = String::new();
    for _ in 0..17 {
        source.push_str("try {\n");
    }
    source.push_str("var x = 1\n");
    for _ in 0..17 {
        source.push_str("} catch(e) { return e }\n");
    }
    assert_eq!(text(&run(&source)), "Too many nested try blocks");
}

// --- error surfaces ---

#[test]
fn parse_errors_carry_positions() {
    let err = run_err("var = 1");
    assert_eq!(err.kind, panda::errors::ErrorKind::Parse);
    assert_eq!(err.line, 1);
    assert!(err.column > 0);
}

#[test]
fn runtime_errors_carry_file_and_line() {
    let err = run_err("var a = 1\nreturn missing");
    assert_eq!(err.kind, panda::errors::ErrorKind::Runtime);
    assert_eq!(err.line, 2);
    assert!(err.file.is_some());
}

#[test]
fn calling_non_callables_fails() {
    let err = run_err("var x = 5\nreturn x()");
    assert!(err.message.contains("Cannot call"));
}
