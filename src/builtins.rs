// File: src/builtins.rs
//
// Built-in native functions for the Panda standard library surface.
// Registration installs plain globals plus the `date`, `json`, and `regex`
// sub-objects into a root scope; the VM itself only knows the registration
// path.

use crate::environment::Environment;
use crate::errors::PandaError;
use crate::iterator::{RangeIter, ValueIter};
use crate::value::{NativeFn, ObjectMap, Value};
use crate::vm::Vm;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::cell::RefCell;
use std::rc::Rc;

/// All plain builtin globals, in registration order.
static BUILTINS: Lazy<Vec<(&'static str, NativeFn)>> = Lazy::new(|| {
    vec![
        ("print", native_print as NativeFn),
        ("type", native_type),
        ("str", native_str),
        ("num", native_num),
        ("bool", native_bool),
        ("len", native_len),
        ("push", native_push),
        ("pop", native_pop),
        ("range", native_range),
        ("keys", native_keys),
        ("values", native_values),
        ("contains", native_contains),
        ("slice", native_slice),
        ("join", native_join),
        ("split", native_split),
        ("abs", native_abs),
        ("floor", native_floor),
        ("ceil", native_ceil),
        ("round", native_round),
        ("sqrt", native_sqrt),
        ("pow", native_pow),
        ("min", native_min),
        ("max", native_max),
        ("random", native_random),
        ("randomInt", native_random_int),
        ("time", native_time),
        ("now", native_now),
        ("trace", native_trace),
        ("debug", native_debug),
        ("stacktrace", native_stacktrace),
        ("assert", native_assert),
    ]
});

/// Register every builtin into the given root scope.
pub fn install(root: &Rc<RefCell<Environment>>) {
    let mut env = root.borrow_mut();
    for (name, func) in BUILTINS.iter() {
        env.define(*name, Value::native(name, *func));
    }
    env.define("globals", Value::Globals(root.clone()));
    env.define("date", date_object());
    env.define("json", json_object());
    env.define("regex", regex_object());
}

// --- argument helpers ---

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

fn num_arg(name: &str, args: &[Value], index: usize) -> Result<f64, PandaError> {
    arg(args, index).as_number().ok_or_else(|| {
        PandaError::runtime(format!(
            "{}() expects a number as argument {}",
            name,
            index + 1
        ))
    })
}

fn str_arg(name: &str, args: &[Value], index: usize) -> Result<String, PandaError> {
    match arg(args, index) {
        Value::Str(s) => Ok(s.as_ref().clone()),
        other => Err(PandaError::runtime(format!(
            "{}() expects a string as argument {}, got {}",
            name,
            index + 1,
            other.type_name()
        ))),
    }
}

fn joined(args: &[Value], separator: &str) -> String {
    args.iter()
        .map(Value::to_display_string)
        .collect::<Vec<_>>()
        .join(separator)
}

// --- core builtins ---

fn native_print(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    println!("{}", joined(args, " "));
    Ok(Value::Null)
}

fn native_type(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::str(arg(args, 0).type_name()))
}

fn native_str(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::str(arg(args, 0).to_display_string()))
}

fn native_num(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    match arg(args, 0) {
        Value::Number(n) => Ok(Value::Number(n)),
        Value::Bool(b) => Ok(Value::Number(if b { 1.0 } else { 0.0 })),
        Value::Str(s) => Ok(s
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn native_bool(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Bool(arg(args, 0).is_truthy()))
}

fn native_len(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    match arg(args, 0) {
        Value::Str(s) => Ok(Value::Number(s.chars().count() as f64)),
        Value::Array(items) => Ok(Value::Number(items.borrow().len() as f64)),
        Value::Object(map) => Ok(Value::Number(map.borrow().len() as f64)),
        other => Err(PandaError::runtime(format!(
            "len() does not support {}",
            other.type_name()
        ))),
    }
}

fn native_push(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    match arg(args, 0) {
        Value::Array(items) => {
            for value in &args[1..] {
                items.borrow_mut().push(value.clone());
            }
            Ok(Value::Array(items))
        }
        other => Err(PandaError::runtime(format!(
            "push() expects an array, got {}",
            other.type_name()
        ))),
    }
}

fn native_pop(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    match arg(args, 0) {
        Value::Array(items) => {
            let popped = items.borrow_mut().pop();
            Ok(popped.unwrap_or(Value::Null))
        }
        other => Err(PandaError::runtime(format!(
            "pop() expects an array, got {}",
            other.type_name()
        ))),
    }
}

fn native_range(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let (start, end, step) = match args.len() {
        1 => (0.0, num_arg("range", args, 0)?, 1.0),
        2 => (num_arg("range", args, 0)?, num_arg("range", args, 1)?, 1.0),
        _ => (
            num_arg("range", args, 0)?,
            num_arg("range", args, 1)?,
            num_arg("range", args, 2)?,
        ),
    };
    if step == 0.0 {
        return Err(PandaError::runtime("range() step must not be zero"));
    }
    Ok(Value::Iterator(Rc::new(RefCell::new(ValueIter::Range(
        RangeIter::new(start, end, step),
    )))))
}

fn native_keys(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    match arg(args, 0) {
        Value::Object(map) => Ok(Value::array(
            map.borrow().keys().map(|k| Value::str(k.clone())).collect(),
        )),
        Value::Instance(instance) => Ok(Value::array(
            instance
                .borrow()
                .fields
                .keys()
                .map(|k| Value::str(k.clone()))
                .collect(),
        )),
        other => Err(PandaError::runtime(format!(
            "keys() does not support {}",
            other.type_name()
        ))),
    }
}

fn native_values(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    match arg(args, 0) {
        Value::Object(map) => Ok(Value::array(map.borrow().values().cloned().collect())),
        Value::Instance(instance) => Ok(Value::array(
            instance.borrow().fields.values().cloned().collect(),
        )),
        other => Err(PandaError::runtime(format!(
            "values() does not support {}",
            other.type_name()
        ))),
    }
}

fn native_contains(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let haystack = arg(args, 0);
    let needle = arg(args, 1);
    let result = match (&haystack, &needle) {
        (Value::Str(s), Value::Str(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), _) => items.borrow().iter().any(|v| v.equals(&needle)),
        (Value::Object(map), Value::Str(key)) => map.borrow().contains_key(key.as_str()),
        _ => {
            return Err(PandaError::runtime(format!(
                "contains() does not support {} and {}",
                haystack.type_name(),
                needle.type_name()
            )));
        }
    };
    Ok(Value::Bool(result))
}

/// Negative bounds count from the end; out-of-range bounds clamp.
fn slice_bounds(len: usize, start: f64, end: Option<f64>) -> (usize, usize) {
    let resolve = |raw: f64| -> usize {
        if raw < 0.0 {
            len.saturating_sub((-raw) as usize)
        } else {
            (raw as usize).min(len)
        }
    };
    let start = resolve(start);
    let end = end.map_or(len, resolve);
    (start, end.max(start))
}

fn native_slice(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let start = num_arg("slice", args, 1)?;
    let end = args.get(2).and_then(Value::as_number);
    match arg(args, 0) {
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (from, to) = slice_bounds(chars.len(), start, end);
            Ok(Value::str(chars[from..to].iter().collect::<String>()))
        }
        Value::Array(items) => {
            let items = items.borrow();
            let (from, to) = slice_bounds(items.len(), start, end);
            Ok(Value::array(items[from..to].to_vec()))
        }
        other => Err(PandaError::runtime(format!(
            "slice() does not support {}",
            other.type_name()
        ))),
    }
}

fn native_join(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let separator = match args.get(1) {
        Some(Value::Str(s)) => s.as_ref().clone(),
        _ => String::new(),
    };
    match arg(args, 0) {
        Value::Array(items) => Ok(Value::str(joined(&items.borrow(), &separator))),
        other => Err(PandaError::runtime(format!(
            "join() expects an array, got {}",
            other.type_name()
        ))),
    }
}

fn native_split(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let text = str_arg("split", args, 0)?;
    let separator = str_arg("split", args, 1)?;
    let parts: Vec<Value> = if separator.is_empty() {
        text.chars().map(|c| Value::str(c.to_string())).collect()
    } else {
        text.split(&separator).map(Value::str).collect()
    };
    Ok(Value::array(parts))
}

// --- math ---

fn native_abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(num_arg("abs", args, 0)?.abs()))
}

fn native_floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(num_arg("floor", args, 0)?.floor()))
}

fn native_ceil(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(num_arg("ceil", args, 0)?.ceil()))
}

fn native_round(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(num_arg("round", args, 0)?.round()))
}

fn native_sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(num_arg("sqrt", args, 0)?.sqrt()))
}

fn native_pow(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(
        num_arg("pow", args, 0)?.powf(num_arg("pow", args, 1)?),
    ))
}

fn native_min(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(
        num_arg("min", args, 0)?.min(num_arg("min", args, 1)?),
    ))
}

fn native_max(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(
        num_arg("max", args, 0)?.max(num_arg("max", args, 1)?),
    ))
}

fn native_random(_vm: &mut Vm, _args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(rand::thread_rng().gen::<f64>()))
}

fn native_random_int(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let low = num_arg("randomInt", args, 0)? as i64;
    let high = num_arg("randomInt", args, 1)? as i64;
    if low > high {
        return Err(PandaError::runtime("randomInt() expects min <= max"));
    }
    Ok(Value::Number(
        rand::thread_rng().gen_range(low..=high) as f64
    ))
}

// --- time ---

fn native_time(_vm: &mut Vm, _args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(Utc::now().timestamp() as f64))
}

fn native_now(_vm: &mut Vm, _args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(Utc::now().timestamp_millis() as f64))
}

// --- diagnostics ---

fn native_trace(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    eprintln!("[trace] {}", joined(args, " "));
    Ok(Value::Null)
}

fn native_debug(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let parts: Vec<String> = args.iter().map(|v| format!("{:?}", v)).collect();
    eprintln!("[debug] {}", parts.join(" "));
    Ok(Value::Null)
}

fn native_stacktrace(vm: &mut Vm, _args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::array(
        vm.stack_trace()
            .iter()
            .map(|frame| Value::str(frame.to_string()))
            .collect(),
    ))
}

fn native_assert(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    if arg(args, 0).is_truthy() {
        return Ok(Value::Null);
    }
    let message = match args.get(1) {
        Some(v) => v.to_display_string(),
        None => "Assertion failed".to_string(),
    };
    Err(PandaError::runtime(message))
}

// --- date sub-object ---

fn date_object() -> Value {
    let mut map = ObjectMap::new();
    map.insert("now".to_string(), Value::native("date.now", native_now));
    map.insert(
        "year".to_string(),
        Value::native("date.year", date_year as NativeFn),
    );
    map.insert("month".to_string(), Value::native("date.month", date_month));
    map.insert("day".to_string(), Value::native("date.day", date_day));
    map.insert("hour".to_string(), Value::native("date.hour", date_hour));
    map.insert(
        "minute".to_string(),
        Value::native("date.minute", date_minute),
    );
    map.insert(
        "second".to_string(),
        Value::native("date.second", date_second),
    );
    map.insert(
        "format".to_string(),
        Value::native("date.format", date_format),
    );
    Value::object(map)
}

fn date_from_millis(name: &str, args: &[Value]) -> Result<chrono::DateTime<Utc>, PandaError> {
    let millis = num_arg(name, args, 0)? as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PandaError::runtime(format!("{}() received an invalid timestamp", name)))
}

fn date_year(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(
        date_from_millis("date.year", args)?.year() as f64
    ))
}

fn date_month(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(
        date_from_millis("date.month", args)?.month() as f64
    ))
}

fn date_day(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(date_from_millis("date.day", args)?.day() as f64))
}

fn date_hour(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(
        date_from_millis("date.hour", args)?.hour() as f64
    ))
}

fn date_minute(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(
        date_from_millis("date.minute", args)?.minute() as f64,
    ))
}

fn date_second(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    Ok(Value::Number(
        date_from_millis("date.second", args)?.second() as f64,
    ))
}

fn date_format(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let timestamp = date_from_millis("date.format", args)?;
    let format = str_arg("date.format", args, 1)?;
    Ok(Value::str(timestamp.format(&format).to_string()))
}

// --- json sub-object ---

fn json_object() -> Value {
    let mut map = ObjectMap::new();
    map.insert(
        "parse".to_string(),
        Value::native("json.parse", json_parse as NativeFn),
    );
    map.insert(
        "stringify".to_string(),
        Value::native("json.stringify", json_stringify),
    );
    Value::object(map)
}

fn json_parse(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let text = str_arg("json.parse", args, 0)?;
    let parsed: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| PandaError::runtime(format!("json.parse: {}", e)))?;
    Ok(json_to_value(parsed))
}

fn json_stringify(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let json = value_to_json(&arg(args, 0))?;
    serde_json::to_string(&json)
        .map(Value::str)
        .map_err(|e| PandaError::runtime(format!("json.stringify: {}", e)))
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::str(s),
        serde_json::Value::Array(items) => {
            Value::array(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(entries) => {
            let mut map = ObjectMap::new();
            for (key, value) in entries {
                map.insert(key, json_to_value(value));
            }
            Value::object(map)
        }
    }
}

fn value_to_json(value: &Value) -> Result<serde_json::Value, PandaError> {
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => Ok(serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        Value::Str(s) => Ok(serde_json::Value::String(s.as_ref().clone())),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.borrow().len());
            for item in items.borrow().iter() {
                out.push(value_to_json(item)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map.borrow().iter() {
                out.insert(key.clone(), value_to_json(value)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::Instance(instance) => {
            let mut out = serde_json::Map::new();
            for (key, value) in instance.borrow().fields.iter() {
                out.insert(key.clone(), value_to_json(value)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Err(PandaError::runtime(format!(
            "json.stringify: cannot serialize {}",
            other.type_name()
        ))),
    }
}

// --- regex sub-object ---

fn regex_object() -> Value {
    let mut map = ObjectMap::new();
    map.insert(
        "test".to_string(),
        Value::native("regex.test", regex_test as NativeFn),
    );
    map.insert(
        "match".to_string(),
        Value::native("regex.match", regex_match),
    );
    map.insert(
        "replace".to_string(),
        Value::native("regex.replace", regex_replace),
    );
    map.insert(
        "split".to_string(),
        Value::native("regex.split", regex_split),
    );
    Value::object(map)
}

fn compile_regex(name: &str, args: &[Value]) -> Result<Regex, PandaError> {
    let pattern = str_arg(name, args, 0)?;
    Regex::new(&pattern).map_err(|e| PandaError::runtime(format!("{}: {}", name, e)))
}

fn regex_test(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let re = compile_regex("regex.test", args)?;
    let text = str_arg("regex.test", args, 1)?;
    Ok(Value::Bool(re.is_match(&text)))
}

fn regex_match(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let re = compile_regex("regex.match", args)?;
    let text = str_arg("regex.match", args, 1)?;
    Ok(re
        .find(&text)
        .map(|m| Value::str(m.as_str()))
        .unwrap_or(Value::Null))
}

fn regex_replace(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let re = compile_regex("regex.replace", args)?;
    let text = str_arg("regex.replace", args, 1)?;
    let replacement = str_arg("regex.replace", args, 2)?;
    Ok(Value::str(
        re.replace_all(&text, replacement.as_str()).into_owned(),
    ))
}

fn regex_split(_vm: &mut Vm, args: &[Value]) -> Result<Value, PandaError> {
    let re = compile_regex("regex.split", args)?;
    let text = str_arg("regex.split", args, 1)?;
    Ok(Value::array(re.split(&text).map(Value::str).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn builtin_names_cover_the_registration_contract() {
        let names: HashSet<&str> = BUILTINS.iter().map(|(name, _)| *name).collect();
        let required = [
            "print",
            "type",
            "str",
            "num",
            "bool",
            "len",
            "push",
            "pop",
            "range",
            "keys",
            "values",
            "contains",
            "slice",
            "join",
            "split",
            "abs",
            "floor",
            "ceil",
            "round",
            "sqrt",
            "pow",
            "min",
            "max",
            "random",
            "randomInt",
            "time",
            "now",
            "trace",
            "debug",
            "stacktrace",
            "assert",
        ];
        for name in required {
            assert!(names.contains(name), "missing builtin: {}", name);
        }
    }

    #[test]
    fn builtin_names_have_no_duplicates() {
        let names: Vec<&str> = BUILTINS.iter().map(|(name, _)| *name).collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
    }

    #[test]
    fn install_defines_sub_objects() {
        let root = Rc::new(RefCell::new(Environment::new()));
        install(&root);
        for name in ["date", "json", "regex", "globals", "print"] {
            assert!(root.borrow().get(name).is_some(), "missing global: {}", name);
        }
    }

    #[test]
    fn slice_bounds_clamp_and_count_from_end() {
        assert_eq!(slice_bounds(5, 1.0, Some(3.0)), (1, 3));
        assert_eq!(slice_bounds(5, -2.0, None), (3, 5));
        assert_eq!(slice_bounds(5, 0.0, Some(99.0)), (0, 5));
        assert_eq!(slice_bounds(5, 4.0, Some(1.0)), (4, 4));
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let parsed = json_to_value(serde_json::from_str("{\"a\": [1, true, null]}").unwrap());
        let json = value_to_json(&parsed).unwrap();
        assert_eq!(serde_json::to_string(&json).unwrap(), "{\"a\":[1.0,true,null]}");
    }
}
