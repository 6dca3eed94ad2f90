// File: src/value.rs
//
// Runtime value types for the Panda VM.
// Defines the tagged Value union and the heap object kinds it can reference.

use crate::bytecode::FunctionProto;
use crate::environment::Environment;
use crate::errors::PandaError;
use crate::iterator::ValueIter;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Insertion-preserving field map used by objects and instances.
pub type ObjectMap = IndexMap<String, Value>;

/// Signature of a host-provided native function.
pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> Result<Value, PandaError>;

/// Runtime values in the Panda VM.
///
/// Values are cheap to copy; heap kinds share ownership through `Rc`.
/// Equality is structural for null/bool/number and string contents, and
/// reference identity for every other heap kind.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// All Panda numbers are 64-bit floats.
    Number(f64),
    Str(Rc<String>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<ObjectMap>>),
    Function(Rc<Closure>),
    Native(Rc<NativeFunction>),
    Class(Rc<RefCell<Class>>),
    Instance(Rc<RefCell<Instance>>),
    BoundMethod(Rc<BoundMethod>),
    Module(Rc<RefCell<ModuleObject>>),
    /// Proxy giving scripts property-style access to the root scope.
    Globals(Rc<RefCell<Environment>>),
    Iterator(Rc<RefCell<ValueIter>>),
}

/// A function prototype paired with its captured upvalues and the globals
/// scope that was in force when the `Closure` instruction ran.
pub struct Closure {
    pub proto: Rc<FunctionProto>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
    pub globals: Rc<RefCell<Environment>>,
    /// Set when the closure is attached to a class; `super` resolves through it.
    pub defining_class: RefCell<Option<Rc<RefCell<Class>>>>,
}

impl Closure {
    pub fn new(proto: Rc<FunctionProto>, globals: Rc<RefCell<Environment>>) -> Self {
        Self {
            proto,
            upvalues: Vec::new(),
            globals,
            defining_class: RefCell::new(None),
        }
    }
}

/// A captured variable. Open upvalues point at a live operand-stack slot;
/// closing copies the value out so closures outlive the frame.
#[derive(Debug, Clone)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A host function callable from scripts.
pub struct NativeFunction {
    pub name: String,
    pub func: NativeFn,
}

pub struct Class {
    pub name: String,
    pub methods: IndexMap<String, Value>,
    pub static_fields: IndexMap<String, Value>,
    pub static_methods: IndexMap<String, Value>,
    pub superclass: Option<Rc<RefCell<Class>>>,
}

impl Class {
    pub fn new(name: String) -> Self {
        Self {
            name,
            methods: IndexMap::new(),
            static_fields: IndexMap::new(),
            static_methods: IndexMap::new(),
            superclass: None,
        }
    }
}

pub struct Instance {
    pub class: Rc<RefCell<Class>>,
    pub fields: ObjectMap,
}

/// An instance method plucked off its receiver; calling it restores the
/// receiver into slot 0.
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

/// A loaded module: its path, the scope its body executed in, and the names
/// it exports. An empty export list exposes every top-level binding.
pub struct ModuleObject {
    pub path: String,
    pub scope: Rc<RefCell<Environment>>,
    pub exports: Vec<String>,
}

impl ModuleObject {
    /// Resolve a member access against the export rules.
    pub fn member(&self, name: &str) -> Option<Value> {
        if !self.exports.is_empty() && !self.exports.iter().any(|e| e == name) {
            return None;
        }
        self.scope.borrow().get(name)
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(Rc::new(s.into()))
    }

    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(values)))
    }

    pub fn object(map: ObjectMap) -> Self {
        Value::Object(Rc::new(RefCell::new(map)))
    }

    pub fn native(name: &str, func: NativeFn) -> Self {
        Value::Native(Rc::new(NativeFunction {
            name: name.to_string(),
            func,
        }))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) | Value::Native(_) | Value::BoundMethod(_) => "function",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::Module(_) => "module",
            Value::Globals(_) => "globals",
            Value::Iterator(_) => "iterator",
        }
    }

    /// Only `null` and `false` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Structural equality for primitives and strings, identity elsewhere.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::Globals(a), Value::Globals(b)) => Rc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The deterministic string form shared by `str()`, `print`, string
    /// concatenation, and `BuildString`.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.as_ref().clone(),
            Value::Array(items) => {
                let parts: Vec<String> =
                    items.borrow().iter().map(Value::to_display_string).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Object(map) => {
                let parts: Vec<String> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.to_display_string()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Function(c) => format!("<func {}>", c.proto.trace_name()),
            Value::Native(n) => format!("<native {}>", n.name),
            Value::Class(c) => format!("<class {}>", c.borrow().name),
            Value::Instance(i) => format!("<instance {}>", i.borrow().class.borrow().name),
            Value::BoundMethod(b) => format!("<func {}>", b.method.proto.trace_name()),
            Value::Module(m) => format!("<module {}>", m.borrow().path),
            Value::Globals(_) => "<globals>".to_string(),
            Value::Iterator(_) => "<iterator>".to_string(),
        }
    }
}

/// Numbers print in their shortest round-trip form, so whole values lose the
/// trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{}", n)
    }
}

/// Conversion used by the bitwise and shift instructions.
pub fn number_to_int(n: f64) -> i64 {
    n as i64
}

pub fn int_to_number(i: i64) -> f64 {
    i as f64
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::Str(s) => write!(f, "Str({:?})", s.as_ref()),
            Value::Array(items) => write!(f, "Array[{}]", items.borrow().len()),
            Value::Object(map) => write!(f, "Object{{{} keys}}", map.borrow().len()),
            Value::Function(c) => write!(
                f,
                "Function({}, {} upvalues)",
                c.proto.trace_name(),
                c.upvalues.len()
            ),
            Value::Native(n) => write!(f, "Native({})", n.name),
            Value::Class(c) => write!(f, "Class({})", c.borrow().name),
            Value::Instance(i) => {
                let i = i.borrow();
                let class_name = i.class.borrow().name.clone();
                write!(f, "Instance({}, {} fields)", class_name, i.fields.len())
            }
            Value::BoundMethod(b) => write!(f, "BoundMethod({})", b.method.proto.trace_name()),
            Value::Module(m) => write!(f, "Module({})", m.borrow().path),
            Value::Globals(_) => write!(f, "Globals"),
            Value::Iterator(_) => write!(f, "Iterator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_print_without_trailing_zeros() {
        assert_eq!(format_number(14.0), "14");
        assert_eq!(format_number(3.14159), "3.14159");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(format_number(f64::INFINITY), "inf");
    }

    #[test]
    fn string_equality_is_structural() {
        let a = Value::str("hello");
        let b = Value::str("hello");
        assert!(a.equals(&b));
    }

    #[test]
    fn array_equality_is_identity() {
        let a = Value::array(vec![Value::Number(1.0)]);
        let b = Value::array(vec![Value::Number(1.0)]);
        assert!(!a.equals(&b));
        assert!(a.equals(&a.clone()));
    }

    #[test]
    fn truthiness_follows_null_and_false_only() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::str("").is_truthy());
    }

    #[test]
    fn display_nests_arrays_and_objects() {
        let mut map = ObjectMap::new();
        map.insert("a".to_string(), Value::Number(1.0));
        map.insert("b".to_string(), Value::array(vec![Value::Bool(true), Value::Null]));
        let v = Value::object(map);
        assert_eq!(v.to_display_string(), "{a: 1, b: [true, null]}");
    }
}
