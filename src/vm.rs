// File: src/vm.rs
//
// The Panda virtual machine: a stack-based bytecode interpreter with call
// frames, upvalue capture, iterators, structured exception handling, and a
// cached module loader. One VM instance is single-threaded; hosts may run
// several instances in parallel, each owning all of its state.

use crate::bytecode::{Constant, FunctionProto, OpCode, NO_CATCH_SLOT, NO_FINALLY};
use crate::environment::Environment;
use crate::errors::{ErrorKind, PandaError, TraceFrame};
use crate::iterator::IteratorPool;
use crate::module::{LoaderHook, ModuleLoader};
use crate::value::{
    int_to_number, number_to_int, BoundMethod, Class, Closure, Instance, ModuleObject, ObjectMap,
    Upvalue, Value,
};
use ahash::{AHashMap, AHashSet};
use std::cell::RefCell;
use std::rc::Rc;

/// Operand stack bound.
pub const STACK_MAX: usize = 256;

/// Call frame bound.
pub const FRAMES_MAX: usize = 64;

/// Exception handler bound.
pub const HANDLERS_MAX: usize = 16;

/// Debugger contract: the interpreter consults the hook whenever the current
/// source line changes, and polls `is_paused` while the hook holds execution.
pub trait DebugHook {
    /// Return a stop reason to pause at this line.
    fn should_stop(&self, file: &str, line: u32, frame_depth: usize) -> Option<String>;
    fn on_stopped(&self, reason: &str, file: &str, line: u32);
    fn is_paused(&self) -> bool;
}

/// An executing function: its closure, instruction pointer, and the operand
/// stack index where its locals begin (slot 0 holds the callee or receiver).
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

/// A registered `try` region. `catch`/`finally` are absolute code offsets in
/// the owning frame; the watermarks restore the stacks before control moves.
struct Handler {
    catch: Option<usize>,
    finally: Option<usize>,
    #[allow(dead_code)] // carried for debuggers; the catch body manages the slot
    catch_slot: Option<u8>,
    stack_depth: usize,
    frame_count: usize,
}

enum Flow {
    Continue,
    Finished,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    handlers: Vec<Handler>,
    /// Open upvalues ordered by descending stack index.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    /// Exception stored while a finally block runs.
    pending_exception: Option<Value>,
    /// path -> Value::Module. Bodies run at most once per VM lifetime.
    modules: AHashMap<String, Value>,
    /// path -> compiled prototype, including hosts' pre-seeded entries.
    compiled: AHashMap<String, Rc<FunctionProto>>,
    /// Paths whose bodies are currently executing (cycle detection).
    loading: AHashSet<String>,
    loader: ModuleLoader,
    pools: IteratorPool,
    root: Rc<RefCell<Environment>>,
    hook: Option<Rc<dyn DebugHook>>,
    last_line: u32,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            handlers: Vec::new(),
            open_upvalues: Vec::new(),
            pending_exception: None,
            modules: AHashMap::new(),
            compiled: AHashMap::new(),
            loading: AHashSet::new(),
            loader: ModuleLoader::new(),
            pools: IteratorPool::new(),
            root: Rc::new(RefCell::new(Environment::new())),
            hook: None,
            last_line: 0,
        }
    }

    /// The shared root scope (`global` declarations live here).
    pub fn root_scope(&self) -> Rc<RefCell<Environment>> {
        self.root.clone()
    }

    pub fn set_loader(&mut self, hook: LoaderHook) {
        self.loader.set_hook(hook);
    }

    pub fn set_debug_hook(&mut self, hook: Rc<dyn DebugHook>) {
        self.hook = Some(hook);
    }

    pub fn clear_debug_hook(&mut self) {
        self.hook = None;
    }

    /// Seed the compiled-script cache so `import` finds a module without
    /// touching the loader.
    pub fn preload_module(&mut self, name: &str, proto: Rc<FunctionProto>) {
        self.compiled.insert(name.to_string(), proto);
    }

    /// Drop every cached module so their bodies may run again.
    pub fn clear_modules(&mut self) {
        self.modules.clear();
    }

    /// Resolve module bytes the way `import` would.
    pub fn load_module_bytes(&mut self, path: &str) -> Result<(Vec<u8>, String), PandaError> {
        self.loader.load(path)
    }

    /// The current stack trace, innermost frame first.
    pub fn stack_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| TraceFrame {
                function: f.closure.proto.trace_name(),
                file: f.closure.proto.chunk.file.clone(),
                line: f.closure.proto.chunk.line_at(f.ip.saturating_sub(1)),
            })
            .collect()
    }

    /// Execute a top-level prototype against the given globals scope.
    pub fn run_proto(
        &mut self,
        proto: Rc<FunctionProto>,
        scope: Rc<RefCell<Environment>>,
    ) -> Result<Value, PandaError> {
        self.reset();
        let closure = Rc::new(Closure::new(proto, scope));
        self.push(Value::Function(closure))?;
        self.call_value(0)?;
        match self.run(0) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    /// Call a script or native function with prepared arguments.
    pub fn call_function(&mut self, callee: Value, args: &[Value]) -> Result<Value, PandaError> {
        let depth = self.frames.len();
        let base_stack = self.stack.len();
        self.push(callee)?;
        for arg in args {
            self.push(arg.clone())?;
        }
        let result = match self.call_value(args.len() as u8) {
            Ok(()) => {
                if self.frames.len() > depth {
                    self.run(depth)
                } else {
                    Ok(self.pop())
                }
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.frames.truncate(depth);
                while self.handlers.last().map_or(false, |h| h.frame_count > depth) {
                    self.handlers.pop();
                }
                self.drain_stack_to(base_stack);
                Err(err)
            }
        }
    }

    /// Clear all execution state; caches and the root scope survive.
    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.handlers.clear();
        self.open_upvalues.clear();
        self.pending_exception = None;
        self.last_line = 0;
    }

    // --- the dispatch loop ---

    /// Run until the frame count drops back to `min_depth`; the returned
    /// value is whatever the final `Return` produced. Runtime errors unwind
    /// through handlers registered above `min_depth` first.
    fn run(&mut self, min_depth: usize) -> Result<Value, PandaError> {
        loop {
            match self.execute_instruction(min_depth) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => return Ok(self.pop()),
                Err(err) => {
                    if err.kind == ErrorKind::Runtime && self.has_eligible_handler(min_depth) {
                        let exc = Value::str(err.message.clone());
                        self.throw_value(exc, min_depth)?;
                    } else {
                        return Err(self.enrich_error(err));
                    }
                }
            }
        }
    }

    /// Attach the current location and trace to an escaping runtime error.
    fn enrich_error(&self, mut err: PandaError) -> PandaError {
        if err.kind == ErrorKind::Runtime && err.trace.is_empty() && !self.frames.is_empty() {
            let (file, line) = self.current_location();
            if err.file.is_none() {
                err = err.with_file(file);
            }
            if err.line == 0 {
                err.line = line;
            }
            err.trace = self.stack_trace();
        }
        err
    }

    fn execute_instruction(&mut self, min_depth: usize) -> Result<Flow, PandaError> {
        if self.hook.is_some() {
            self.consult_debug_hook();
        }

        let op_byte = self.read_byte();
        let op = OpCode::try_from(op_byte)
            .map_err(|_| PandaError::runtime(format!("Unknown opcode {}", op_byte)))?;

        match op {
            // === Constants ===
            OpCode::Const => {
                let constant = self.read_constant();
                let value = self.constant_to_value(constant)?;
                self.push(value)?;
            }
            OpCode::Null => self.push(Value::Null)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,

            // === Stack ===
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                let top = self.peek(0)?;
                self.push(top)?;
            }
            OpCode::Dup2 => {
                let b = self.peek(0)?;
                let a = self.peek(1)?;
                self.push(a)?;
                self.push(b)?;
            }
            OpCode::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(PandaError::runtime("Stack underflow in Swap"));
                }
                self.stack.swap(len - 1, len - 2);
            }
            OpCode::SwapUnder => {
                let len = self.stack.len();
                if len < 3 {
                    return Err(PandaError::runtime("Stack underflow in SwapUnder"));
                }
                self.stack.swap(len - 2, len - 3);
            }
            OpCode::Rot3Under => {
                let len = self.stack.len();
                if len < 3 {
                    return Err(PandaError::runtime("Stack underflow in Rot3Under"));
                }
                let top = self.stack.remove(len - 1);
                self.stack.insert(len - 3, top);
            }

            // === Locals ===
            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame_base();
                let value = self.stack[base + slot].clone();
                self.push(value)?;
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame_base();
                let value = self.peek(0)?;
                self.stack[base + slot] = value;
            }

            // === Upvalues ===
            OpCode::GetUpvalue => {
                let index = self.read_byte() as usize;
                let cell = self.current_frame().closure.upvalues[index].clone();
                let value = match &*cell.borrow() {
                    Upvalue::Open(slot) => self.stack[*slot].clone(),
                    Upvalue::Closed(value) => value.clone(),
                };
                self.push(value)?;
            }
            OpCode::SetUpvalue => {
                let index = self.read_byte() as usize;
                let value = self.peek(0)?;
                let cell = self.current_frame().closure.upvalues[index].clone();
                let open_slot = match &*cell.borrow() {
                    Upvalue::Open(slot) => Some(*slot),
                    Upvalue::Closed(_) => None,
                };
                match open_slot {
                    Some(slot) => self.stack[slot] = value,
                    None => *cell.borrow_mut() = Upvalue::Closed(value),
                }
            }
            OpCode::CloseUpvalue => {
                self.close_upvalues(self.stack.len() - 1);
                self.pop();
            }

            // === Globals ===
            OpCode::GetGlobal => {
                let name = self.read_name()?;
                let globals = self.current_frame().closure.globals.clone();
                let value = globals.borrow().get(&name).ok_or_else(|| {
                    PandaError::runtime(format!("Undefined variable '{}'", name))
                })?;
                self.push(value)?;
            }
            OpCode::SetGlobal => {
                let name = self.read_name()?;
                let value = self.peek(0)?;
                let globals = self.current_frame().closure.globals.clone();
                globals.borrow_mut().set(&name, value);
            }
            OpCode::DefineGlobal => {
                let name = self.read_name()?;
                let value = self.pop();
                let globals = self.current_frame().closure.globals.clone();
                globals.borrow_mut().define(name, value);
            }
            OpCode::DefineRootGlobal => {
                let name = self.read_name()?;
                let value = self.pop();
                self.root.borrow_mut().define(name, value);
            }

            // === Arithmetic ===
            OpCode::Add => {
                let b = self.pop();
                let a = self.pop();
                let result = match (&a, &b) {
                    (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
                    // `+` is string concatenation whenever either side is a string.
                    (Value::Str(_), _) | (_, Value::Str(_)) => Value::str(format!(
                        "{}{}",
                        a.to_display_string(),
                        b.to_display_string()
                    )),
                    _ => {
                        return Err(PandaError::runtime(format!(
                            "Cannot add {} and {}",
                            a.type_name(),
                            b.type_name()
                        )));
                    }
                };
                self.push(result)?;
            }
            OpCode::Subtract => {
                let (a, b) = self.pop_numbers("-")?;
                self.push(Value::Number(a - b))?;
            }
            OpCode::Multiply => {
                let (a, b) = self.pop_numbers("*")?;
                self.push(Value::Number(a * b))?;
            }
            OpCode::Divide => {
                // Division by zero follows IEEE 754 and yields an infinity.
                let (a, b) = self.pop_numbers("/")?;
                self.push(Value::Number(a / b))?;
            }
            OpCode::Modulo => {
                let (a, b) = self.pop_numbers("%")?;
                self.push(Value::Number(a % b))?;
            }
            OpCode::Negate => {
                let value = self.pop();
                match value.as_number() {
                    Some(n) => self.push(Value::Number(-n))?,
                    None => {
                        return Err(PandaError::runtime(format!(
                            "Cannot negate a value of type {}",
                            value.type_name()
                        )));
                    }
                }
            }

            // === Logic & comparison ===
            OpCode::Not => {
                let value = self.pop();
                self.push(Value::Bool(!value.is_truthy()))?;
            }
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.equals(&b)))?;
            }
            OpCode::NotEqual => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(!a.equals(&b)))?;
            }
            OpCode::Less | OpCode::LessEqual | OpCode::Greater | OpCode::GreaterEqual => {
                self.binary_compare(op)?;
            }

            // === Bitwise ===
            OpCode::BitAnd => {
                let (a, b) = self.pop_numbers("&")?;
                self.push(Value::Number(int_to_number(
                    number_to_int(a) & number_to_int(b),
                )))?;
            }
            OpCode::BitOr => {
                let (a, b) = self.pop_numbers("|")?;
                self.push(Value::Number(int_to_number(
                    number_to_int(a) | number_to_int(b),
                )))?;
            }
            OpCode::BitXor => {
                let (a, b) = self.pop_numbers("^")?;
                self.push(Value::Number(int_to_number(
                    number_to_int(a) ^ number_to_int(b),
                )))?;
            }
            OpCode::BitNot => {
                let value = self.pop();
                match value.as_number() {
                    Some(n) => self.push(Value::Number(int_to_number(!number_to_int(n))))?,
                    None => {
                        return Err(PandaError::runtime("Operand of '~' must be a number"));
                    }
                }
            }
            OpCode::ShiftLeft => {
                let (a, b) = self.pop_numbers("<<")?;
                self.push(Value::Number(int_to_number(
                    number_to_int(a) << (number_to_int(b) & 63),
                )))?;
            }
            OpCode::ShiftRight => {
                let (a, b) = self.pop_numbers(">>")?;
                self.push(Value::Number(int_to_number(
                    number_to_int(a) >> (number_to_int(b) & 63),
                )))?;
            }

            // === Jumps ===
            OpCode::Jump => {
                let offset = self.read_u16() as usize;
                self.current_frame_mut().ip += offset;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                if !self.peek(0)?.is_truthy() {
                    self.current_frame_mut().ip += offset;
                }
            }
            OpCode::JumpIfTrue => {
                let offset = self.read_u16() as usize;
                if self.peek(0)?.is_truthy() {
                    self.current_frame_mut().ip += offset;
                }
            }
            OpCode::JumpIfNotNull => {
                let offset = self.read_u16() as usize;
                if !matches!(self.peek(0)?, Value::Null) {
                    self.current_frame_mut().ip += offset;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16() as usize;
                self.current_frame_mut().ip -= offset;
            }

            // === Calls ===
            OpCode::Call => {
                let argc = self.read_byte();
                self.call_value(argc)?;
            }
            OpCode::Invoke => {
                let name = self.read_name()?;
                let argc = self.read_byte();
                self.invoke(&name, argc)?;
            }
            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("call frame underflow");
                self.close_upvalues(frame.base);
                // Handlers registered by the finished frame die with it.
                while self
                    .handlers
                    .last()
                    .map_or(false, |h| h.frame_count > self.frames.len())
                {
                    self.handlers.pop();
                }
                self.drain_stack_to(frame.base);
                self.push(result)?;
                if self.frames.len() == min_depth {
                    return Ok(Flow::Finished);
                }
            }

            // === Closures ===
            OpCode::Closure => {
                let constant = self.read_constant();
                let proto = match constant {
                    Constant::Function(proto) => proto,
                    _ => return Err(PandaError::runtime("Invalid closure constant")),
                };
                let count = proto.upvalue_count as usize;
                let globals = self.current_frame().closure.globals.clone();
                let base = self.frame_base();
                let mut upvalues = Vec::with_capacity(count);
                for _ in 0..count {
                    let is_local = self.read_byte() == 1;
                    let index = self.read_byte() as usize;
                    if is_local {
                        upvalues.push(self.capture_upvalue(base + index));
                    } else {
                        upvalues.push(self.current_frame().closure.upvalues[index].clone());
                    }
                }
                let closure = Closure {
                    proto,
                    upvalues,
                    globals,
                    defining_class: RefCell::new(None),
                };
                self.push(Value::Function(Rc::new(closure)))?;
            }

            // === Aggregates ===
            OpCode::NewArray => {
                let count = self.read_u16() as usize;
                let elements = self.stack.split_off(self.stack.len() - count);
                self.push(Value::array(elements))?;
            }
            OpCode::NewObject => {
                self.push(Value::object(ObjectMap::new()))?;
            }
            OpCode::GetField | OpCode::GetProperty => {
                let name = self.read_name()?;
                let receiver = self.pop();
                let value = self.get_property(receiver, &name)?;
                self.push(value)?;
            }
            OpCode::SetField | OpCode::SetProperty => {
                let name = self.read_name()?;
                let value = self.pop();
                let receiver = self.pop();
                self.set_property(receiver, &name, value.clone())?;
                self.push(value)?;
            }
            OpCode::GetIndex => {
                let index = self.pop();
                let receiver = self.pop();
                let value = self.get_index(receiver, index)?;
                self.push(value)?;
            }
            OpCode::SetIndex => {
                let value = self.pop();
                let index = self.pop();
                let receiver = self.pop();
                self.set_index(receiver, index, value.clone())?;
                self.push(value)?;
            }

            // === Classes ===
            OpCode::Class => {
                let constant = self.read_constant();
                let proto = match constant {
                    Constant::Class(proto) => proto,
                    _ => return Err(PandaError::runtime("Invalid class constant")),
                };
                self.push(Value::Class(Rc::new(RefCell::new(Class::new(
                    proto.name.clone(),
                )))))?;
            }
            OpCode::Inherit => {
                let superclass = self.pop();
                let subclass = self.peek(0)?;
                match (&superclass, &subclass) {
                    (Value::Class(sup), Value::Class(sub)) => {
                        // Copy before Method ops run, so the subclass's own
                        // definitions override the copies.
                        let inherited: Vec<(String, Value)> = sup
                            .borrow()
                            .methods
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        let mut sub = sub.borrow_mut();
                        for (name, method) in inherited {
                            if !sub.methods.contains_key(&name) {
                                sub.methods.insert(name, method);
                            }
                        }
                        sub.superclass = Some(sup.clone());
                    }
                    _ => return Err(PandaError::runtime("Superclass must be a class")),
                }
            }
            OpCode::Method => {
                let name = self.read_name()?;
                let method = self.pop();
                let class_value = self.peek(0)?;
                match (&method, &class_value) {
                    (Value::Function(closure), Value::Class(class)) => {
                        closure.defining_class.replace(Some(class.clone()));
                        class.borrow_mut().methods.insert(name, method.clone());
                    }
                    _ => return Err(PandaError::runtime("Invalid method attachment")),
                }
            }
            OpCode::StaticMethod => {
                let name = self.read_name()?;
                let method = self.pop();
                let class_value = self.peek(0)?;
                match (&method, &class_value) {
                    (Value::Function(closure), Value::Class(class)) => {
                        closure.defining_class.replace(Some(class.clone()));
                        class.borrow_mut().static_methods.insert(name, method.clone());
                    }
                    _ => return Err(PandaError::runtime("Invalid static method attachment")),
                }
            }
            OpCode::StaticField => {
                let name = self.read_name()?;
                let value = self.pop();
                match self.peek(0)? {
                    Value::Class(class) => {
                        class.borrow_mut().static_fields.insert(name, value);
                    }
                    _ => return Err(PandaError::runtime("Invalid static field attachment")),
                }
            }
            OpCode::This => {
                let base = self.frame_base();
                let receiver = self.stack[base].clone();
                self.push(receiver)?;
            }
            OpCode::GetSuper => {
                let name = self.read_name()?;
                let receiver = self.pop();
                let defining = self.current_frame().closure.defining_class.borrow().clone();
                let class = defining
                    .ok_or_else(|| PandaError::runtime("'super' used outside of a method"))?;
                let superclass = class.borrow().superclass.clone().ok_or_else(|| {
                    PandaError::runtime("Class has no superclass")
                })?;
                let method = superclass.borrow().methods.get(&name).cloned();
                match method {
                    Some(Value::Function(method)) => {
                        self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })))?;
                    }
                    _ => {
                        return Err(PandaError::runtime(format!(
                            "Undefined method '{}' in superclass",
                            name
                        )));
                    }
                }
            }

            // === Strings ===
            OpCode::BuildString => {
                let count = self.read_u16() as usize;
                let parts = self.stack.split_off(self.stack.len() - count);
                let mut result = String::new();
                for part in parts {
                    result.push_str(&part.to_display_string());
                }
                self.push(Value::str(result))?;
            }

            // === Iterators ===
            OpCode::GetIter => {
                let value = self.pop();
                let iter = match value {
                    Value::Array(items) => self.pools.rent_array(items),
                    Value::Object(map) => self.pools.rent_object(map),
                    Value::Str(s) => self.pools.rent_string(&s),
                    Value::Iterator(iter) => iter,
                    other => {
                        return Err(PandaError::runtime(format!(
                            "Value of type {} is not iterable",
                            other.type_name()
                        )));
                    }
                };
                self.push(Value::Iterator(iter))?;
            }
            OpCode::ForIterLocal => {
                let slot = self.read_byte() as usize;
                let offset = self.read_u16() as usize;
                let base = self.frame_base();
                match self.stack[base + slot].clone() {
                    Value::Iterator(iter) => {
                        if iter.borrow().has_next() {
                            let value = iter.borrow_mut().next();
                            self.stack[base + slot + 1] = value;
                        } else {
                            self.stack[base + slot] = Value::Null;
                            self.pools.give_back(iter);
                            self.current_frame_mut().ip += offset;
                        }
                    }
                    _ => return Err(PandaError::runtime("Expected an iterator in loop slot")),
                }
            }
            OpCode::ForIterKVLocal => {
                let slot = self.read_byte() as usize;
                let offset = self.read_u16() as usize;
                let base = self.frame_base();
                match self.stack[base + slot].clone() {
                    Value::Iterator(iter) => {
                        if iter.borrow().has_next() {
                            let (key, value) = iter.borrow_mut().next_kv();
                            self.stack[base + slot + 1] = key;
                            self.stack[base + slot + 2] = value;
                        } else {
                            self.stack[base + slot] = Value::Null;
                            self.pools.give_back(iter);
                            self.current_frame_mut().ip += offset;
                        }
                    }
                    _ => return Err(PandaError::runtime("Expected an iterator in loop slot")),
                }
            }
            OpCode::CloseIter => {
                let slot = self.read_byte() as usize;
                let base = self.frame_base();
                if let Value::Iterator(iter) = self.stack[base + slot].clone() {
                    self.stack[base + slot] = Value::Null;
                    self.pools.give_back(iter);
                }
            }

            // === Imports ===
            OpCode::Import => {
                let path = self.read_name()?;
                let alias = self.read_name()?;
                let is_global = self.read_byte() == 1;
                let module = self.import_module(&path)?;
                if is_global {
                    self.root.borrow_mut().define(alias, module.clone());
                }
                self.push(module)?;
            }

            // === Exceptions ===
            OpCode::SetupTry => {
                let raw_catch = self.read_u16() as usize;
                let catch_base = self.current_frame().ip;
                let raw_finally = self.read_u16();
                let finally_base = self.current_frame().ip;
                let raw_slot = self.read_byte();

                if self.handlers.len() >= HANDLERS_MAX {
                    return Err(PandaError::runtime("Too many nested try blocks"));
                }

                let catch_abs = catch_base + raw_catch;
                let finally_abs = if raw_finally == NO_FINALLY {
                    None
                } else {
                    Some(finally_base + raw_finally as usize)
                };
                // Equal catch and finally addresses mean there is no catch
                // block, only a finally.
                let (catch, finally) = match finally_abs {
                    Some(f) if f == catch_abs => (None, Some(f)),
                    Some(f) => (Some(catch_abs), Some(f)),
                    None => (Some(catch_abs), None),
                };
                self.handlers.push(Handler {
                    catch,
                    finally,
                    catch_slot: (raw_slot != NO_CATCH_SLOT).then_some(raw_slot),
                    stack_depth: self.stack.len(),
                    frame_count: self.frames.len(),
                });
            }
            OpCode::EndTry => {
                if self.handlers.pop().is_none() {
                    return Err(PandaError::runtime("Mismatched exception handler"));
                }
            }
            OpCode::Throw => {
                let exc = self.pop();
                self.throw_value(exc, min_depth)?;
            }
            OpCode::EndFinally => {
                if let Some(exc) = self.pending_exception.take() {
                    self.throw_value(exc, min_depth)?;
                }
            }
        }

        Ok(Flow::Continue)
    }

    // --- frame and stack plumbing ---

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn frame_base(&self) -> usize {
        self.current_frame().base
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = frame
            .closure
            .proto
            .chunk
            .code
            .get(frame.ip)
            .copied()
            .unwrap_or(0);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self) -> Constant {
        let index = self.read_u16() as usize;
        let frame = self.frames.last().expect("no active call frame");
        frame
            .closure
            .proto
            .chunk
            .constants
            .get(index)
            .cloned()
            .unwrap_or(Constant::Null)
    }

    fn read_name(&mut self) -> Result<String, PandaError> {
        match self.read_constant() {
            Constant::Str(name) => Ok(name),
            _ => Err(PandaError::runtime("Expected a name constant")),
        }
    }

    fn constant_to_value(&self, constant: Constant) -> Result<Value, PandaError> {
        match constant {
            Constant::Null => Ok(Value::Null),
            Constant::Bool(b) => Ok(Value::Bool(b)),
            Constant::Number(n) => Ok(Value::Number(n)),
            Constant::Str(s) => Ok(Value::str(s)),
            Constant::Function(_) | Constant::Class(_) => {
                Err(PandaError::runtime("Invalid constant in value position"))
            }
        }
    }

    fn push(&mut self, value: Value) -> Result<(), PandaError> {
        if self.stack.len() >= STACK_MAX {
            return Err(PandaError::runtime("Stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, distance: usize) -> Result<Value, PandaError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(PandaError::runtime("Stack underflow"));
        }
        Ok(self.stack[len - 1 - distance].clone())
    }

    fn pop_numbers(&mut self, op: &str) -> Result<(f64, f64), PandaError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(PandaError::runtime(format!(
                "Operands of '{}' must be numbers (got {} and {})",
                op,
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn binary_compare(&mut self, op: OpCode) -> Result<(), PandaError> {
        let b = self.pop();
        let a = self.pop();
        let result = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => match op {
                OpCode::Less => x < y,
                OpCode::LessEqual => x <= y,
                OpCode::Greater => x > y,
                _ => x >= y,
            },
            (Value::Str(x), Value::Str(y)) => match op {
                OpCode::Less => x < y,
                OpCode::LessEqual => x <= y,
                OpCode::Greater => x > y,
                _ => x >= y,
            },
            _ => {
                return Err(PandaError::runtime(format!(
                    "Cannot compare {} and {}",
                    a.type_name(),
                    b.type_name()
                )));
            }
        };
        self.push(Value::Bool(result))
    }

    /// Pop values above `depth`, returning any iterators to their pools.
    fn drain_stack_to(&mut self, depth: usize) {
        let drained = self.stack.split_off(depth);
        for value in drained {
            if let Value::Iterator(iter) = value {
                self.pools.give_back(iter);
            }
        }
    }

    // --- calls ---

    /// Dispatch a call. The callee sits below `arg_count` arguments.
    fn call_value(&mut self, arg_count: u8) -> Result<(), PandaError> {
        let argc = arg_count as usize;
        let callee_index = self.stack.len() - argc - 1;
        let callee = self.stack[callee_index].clone();
        match callee {
            Value::Function(closure) => self.call_closure(closure, argc),
            Value::BoundMethod(bound) => {
                self.stack[callee_index] = bound.receiver.clone();
                self.call_closure(bound.method.clone(), argc)
            }
            Value::Class(class) => {
                let name = class.borrow().name.clone();
                let instance = Value::Instance(Rc::new(RefCell::new(Instance {
                    class: class.clone(),
                    fields: ObjectMap::new(),
                })));
                self.stack[callee_index] = instance;
                let initializer = class.borrow().methods.get(&name).cloned();
                match initializer {
                    Some(Value::Function(init)) => self.call_closure(init, argc),
                    _ => {
                        if argc > 0 {
                            return Err(PandaError::runtime(format!(
                                "Class '{}' has no constructor taking arguments",
                                name
                            )));
                        }
                        Ok(())
                    }
                }
            }
            Value::Native(native) => {
                let args = self.stack.split_off(self.stack.len() - argc);
                self.stack.pop();
                let result = (native.func)(self, &args)?;
                self.push(result)
            }
            other => Err(PandaError::runtime(format!(
                "Cannot call a value of type {}",
                other.type_name()
            ))),
        }
    }

    /// Push a frame for a script function. Missing arguments become nulls
    /// (defaults run in the callee); extras collect into the rest parameter.
    fn call_closure(&mut self, closure: Rc<Closure>, mut argc: usize) -> Result<(), PandaError> {
        let arity = closure.proto.arity as usize;
        while argc < arity {
            self.push(Value::Null)?;
            argc += 1;
        }
        let has_rest = closure.proto.rest_param.is_some();
        if has_rest {
            let extras = self.stack.split_off(self.stack.len() - (argc - arity));
            self.push(Value::array(extras))?;
        } else if argc > arity {
            return Err(PandaError::runtime(format!(
                "Expected {} arguments but got {} calling '{}'",
                arity,
                argc,
                closure.proto.trace_name()
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(PandaError::runtime("Stack overflow"));
        }
        let slots = arity + if has_rest { 1 } else { 0 };
        let base = self.stack.len() - slots - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// Fused property call: dispatch by receiver kind without materializing
    /// a bound method.
    fn invoke(&mut self, name: &str, arg_count: u8) -> Result<(), PandaError> {
        let argc = arg_count as usize;
        let receiver_index = self.stack.len() - argc - 1;
        let receiver = self.stack[receiver_index].clone();
        match receiver {
            Value::Instance(instance) => {
                // A field holding a callable shadows class methods.
                let field = instance.borrow().fields.get(name).cloned();
                if let Some(value) = field {
                    self.stack[receiver_index] = value;
                    return self.call_value(arg_count);
                }
                let method = instance.borrow().class.borrow().methods.get(name).cloned();
                match method {
                    Some(Value::Function(method)) => self.call_closure(method, argc),
                    _ => Err(PandaError::runtime(format!(
                        "Undefined method '{}' on instance of '{}'",
                        name,
                        instance.borrow().class.borrow().name
                    ))),
                }
            }
            Value::Class(class) => {
                let member = {
                    let class = class.borrow();
                    class
                        .static_methods
                        .get(name)
                        .or_else(|| class.static_fields.get(name))
                        .cloned()
                };
                match member {
                    Some(value) => {
                        self.stack[receiver_index] = value;
                        self.call_value(arg_count)
                    }
                    None => Err(PandaError::runtime(format!(
                        "Undefined static method '{}' on class '{}'",
                        name,
                        class.borrow().name
                    ))),
                }
            }
            Value::Module(module) => {
                let member = module.borrow().member(name);
                match member {
                    Some(value) => {
                        self.stack[receiver_index] = value;
                        self.call_value(arg_count)
                    }
                    None => Err(PandaError::runtime(format!(
                        "Module '{}' has no member '{}'",
                        module.borrow().path,
                        name
                    ))),
                }
            }
            Value::Object(map) => {
                let member = map.borrow().get(name).cloned();
                match member {
                    Some(value) => {
                        self.stack[receiver_index] = value;
                        self.call_value(arg_count)
                    }
                    None => Err(PandaError::runtime(format!(
                        "Object has no member '{}'",
                        name
                    ))),
                }
            }
            Value::Globals(env) => {
                let member = env.borrow().get(name);
                match member {
                    Some(value) => {
                        self.stack[receiver_index] = value;
                        self.call_value(arg_count)
                    }
                    None => Err(PandaError::runtime(format!(
                        "Undefined global '{}'",
                        name
                    ))),
                }
            }
            other => Err(PandaError::runtime(format!(
                "Undefined method '{}' on {}",
                name,
                other.type_name()
            ))),
        }
    }

    // --- properties and indexing ---

    fn get_property(&mut self, receiver: Value, name: &str) -> Result<Value, PandaError> {
        match receiver {
            Value::Instance(instance) => {
                if let Some(value) = instance.borrow().fields.get(name) {
                    return Ok(value.clone());
                }
                let method = instance.borrow().class.borrow().methods.get(name).cloned();
                if let Some(Value::Function(method)) = method {
                    return Ok(Value::BoundMethod(Rc::new(BoundMethod {
                        receiver: Value::Instance(instance.clone()),
                        method,
                    })));
                }
                Ok(Value::Null)
            }
            Value::Class(class) => {
                let class = class.borrow();
                Ok(class
                    .static_fields
                    .get(name)
                    .or_else(|| class.static_methods.get(name))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            Value::Module(module) => Ok(module.borrow().member(name).unwrap_or(Value::Null)),
            Value::Object(map) => Ok(map.borrow().get(name).cloned().unwrap_or(Value::Null)),
            Value::Globals(env) => Ok(env.borrow().get(name).unwrap_or(Value::Null)),
            Value::Array(items) => {
                if name == "length" {
                    Ok(Value::Number(items.borrow().len() as f64))
                } else {
                    Ok(Value::Null)
                }
            }
            Value::Str(s) => {
                if name == "length" {
                    Ok(Value::Number(s.chars().count() as f64))
                } else {
                    Ok(Value::Null)
                }
            }
            other => Err(PandaError::runtime(format!(
                "Cannot read property '{}' of {}",
                name,
                other.type_name()
            ))),
        }
    }

    fn set_property(
        &mut self,
        receiver: Value,
        name: &str,
        value: Value,
    ) -> Result<(), PandaError> {
        match receiver {
            Value::Instance(instance) => {
                instance.borrow_mut().fields.insert(name.to_string(), value);
                Ok(())
            }
            Value::Object(map) => {
                map.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Class(class) => {
                class
                    .borrow_mut()
                    .static_fields
                    .insert(name.to_string(), value);
                Ok(())
            }
            Value::Globals(env) => {
                env.borrow_mut().set(name, value);
                Ok(())
            }
            other => Err(PandaError::runtime(format!(
                "Cannot set property '{}' on {}",
                name,
                other.type_name()
            ))),
        }
    }

    fn get_index(&mut self, receiver: Value, index: Value) -> Result<Value, PandaError> {
        match (&receiver, &index) {
            (Value::Array(items), Value::Number(n)) => {
                let items = items.borrow();
                let i = *n as i64;
                if i < 0 || i as usize >= items.len() {
                    return Err(PandaError::runtime(format!(
                        "Array index {} out of range (length {})",
                        crate::value::format_number(*n),
                        items.len()
                    )));
                }
                Ok(items[i as usize].clone())
            }
            (Value::Str(s), Value::Number(n)) => {
                let i = *n as i64;
                let ch = if i >= 0 {
                    s.chars().nth(i as usize)
                } else {
                    None
                };
                match ch {
                    Some(c) => Ok(Value::str(c.to_string())),
                    None => Err(PandaError::runtime(format!(
                        "String index {} out of range",
                        crate::value::format_number(*n)
                    ))),
                }
            }
            (Value::Object(map), Value::Str(key)) => {
                Ok(map.borrow().get(key.as_str()).cloned().unwrap_or(Value::Null))
            }
            (Value::Instance(instance), Value::Str(key)) => Ok(instance
                .borrow()
                .fields
                .get(key.as_str())
                .cloned()
                .unwrap_or(Value::Null)),
            (Value::Module(module), Value::Str(key)) => {
                Ok(module.borrow().member(key).unwrap_or(Value::Null))
            }
            (Value::Globals(env), Value::Str(key)) => {
                Ok(env.borrow().get(key).unwrap_or(Value::Null))
            }
            _ => Err(PandaError::runtime(format!(
                "Cannot index {} with {}",
                receiver.type_name(),
                index.type_name()
            ))),
        }
    }

    fn set_index(
        &mut self,
        receiver: Value,
        index: Value,
        value: Value,
    ) -> Result<(), PandaError> {
        match (&receiver, &index) {
            (Value::Array(items), Value::Number(n)) => {
                let mut items = items.borrow_mut();
                let i = *n as i64;
                if i < 0 || i as usize >= items.len() {
                    return Err(PandaError::runtime(format!(
                        "Array index {} out of range (length {})",
                        crate::value::format_number(*n),
                        items.len()
                    )));
                }
                items[i as usize] = value;
                Ok(())
            }
            (Value::Object(map), Value::Str(key)) => {
                map.borrow_mut().insert(key.as_ref().clone(), value);
                Ok(())
            }
            (Value::Instance(instance), Value::Str(key)) => {
                instance
                    .borrow_mut()
                    .fields
                    .insert(key.as_ref().clone(), value);
                Ok(())
            }
            (Value::Globals(env), Value::Str(key)) => {
                env.borrow_mut().set(key, value);
                Ok(())
            }
            _ => Err(PandaError::runtime(format!(
                "Cannot index {} with {}",
                receiver.type_name(),
                index.type_name()
            ))),
        }
    }

    // --- upvalues ---

    /// Reuse an existing open upvalue for the slot or insert a new one,
    /// keeping the list ordered by descending stack index.
    fn capture_upvalue(&mut self, index: usize) -> Rc<RefCell<Upvalue>> {
        let mut insert_at = self.open_upvalues.len();
        for (i, cell) in self.open_upvalues.iter().enumerate() {
            if let Upvalue::Open(existing) = *cell.borrow() {
                if existing == index {
                    return cell.clone();
                }
                if existing < index {
                    insert_at = i;
                    break;
                }
            }
        }
        let created = Rc::new(RefCell::new(Upvalue::Open(index)));
        self.open_upvalues.insert(insert_at, created.clone());
        created
    }

    /// Close every open upvalue at or above the threshold slot, copying the
    /// stack value into the cell. Each upvalue is closed exactly once.
    fn close_upvalues(&mut self, threshold: usize) {
        loop {
            let Some(head) = self.open_upvalues.first().cloned() else {
                break;
            };
            let index = match *head.borrow() {
                Upvalue::Open(index) => index,
                Upvalue::Closed(_) => {
                    self.open_upvalues.remove(0);
                    continue;
                }
            };
            if index < threshold {
                break;
            }
            let value = self.stack.get(index).cloned().unwrap_or(Value::Null);
            *head.borrow_mut() = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // --- exceptions ---

    fn has_eligible_handler(&self, min_depth: usize) -> bool {
        self.handlers
            .last()
            .map_or(false, |h| h.frame_count > min_depth)
    }

    /// Unwind to the innermost handler: restore the stack and frame
    /// watermarks, then enter the catch block (exception pushed) or the
    /// finally block (exception pended). With no handler left the exception
    /// escapes as a runtime error carrying the stack trace.
    ///
    /// A handler stays registered while its catch block runs (`EndTry` in the
    /// catch discards it on normal exit). Entering a catch therefore degrades
    /// the handler in place: to finally-only when a finally block exists, or
    /// to a transparent marker that throws pass straight through.
    fn throw_value(&mut self, exc: Value, min_depth: usize) -> Result<(), PandaError> {
        loop {
            let eligible = self
                .handlers
                .last()
                .map_or(false, |h| h.frame_count > min_depth);
            if !eligible {
                let trace = self.stack_trace();
                let (file, line) = self.current_location();
                let mut err = PandaError::runtime(exc.to_display_string()).with_trace(trace);
                if !file.is_empty() {
                    err = err.with_file(file).with_line(line);
                }
                return Err(err);
            }

            let handler = self.handlers.pop().expect("eligible handler");
            match (handler.catch, handler.finally) {
                // Transparent marker left by an entered catch-only block.
                (None, None) => continue,
                (Some(catch_addr), finally) => {
                    self.close_upvalues(handler.stack_depth);
                    self.frames.truncate(handler.frame_count);
                    self.drain_stack_to(handler.stack_depth);
                    self.current_frame_mut().ip = catch_addr;
                    self.handlers.push(Handler {
                        catch: None,
                        finally,
                        catch_slot: None,
                        stack_depth: handler.stack_depth,
                        frame_count: handler.frame_count,
                    });
                    self.push(exc)?;
                    return Ok(());
                }
                (None, Some(finally_addr)) => {
                    self.close_upvalues(handler.stack_depth);
                    self.frames.truncate(handler.frame_count);
                    self.drain_stack_to(handler.stack_depth);
                    self.current_frame_mut().ip = finally_addr;
                    self.pending_exception = Some(exc);
                    return Ok(());
                }
            }
        }
    }

    fn current_location(&self) -> (String, u32) {
        match self.frames.last() {
            Some(frame) => (
                frame.closure.proto.chunk.file.clone(),
                frame.closure.proto.chunk.line_at(frame.ip.saturating_sub(1)),
            ),
            None => (String::new(), 0),
        }
    }

    // --- modules ---

    /// Resolve an import: cached module, cached compiled script, or loader.
    /// The module object is registered before its body runs so the cache can
    /// satisfy later lookups; re-entering a path mid-execution is an error.
    fn import_module(&mut self, path: &str) -> Result<Value, PandaError> {
        if self.loading.contains(path) {
            return Err(PandaError::runtime(format!(
                "Circular import of module '{}'",
                path
            )));
        }
        if let Some(module) = self.modules.get(path) {
            return Ok(module.clone());
        }

        let proto = match self.compiled.get(path) {
            Some(proto) => proto.clone(),
            None => {
                let (bytes, full_path) = self.loader.load(path)?;
                let proto = if crate::bytecode::is_bytecode(&bytes) {
                    FunctionProto::deserialize(&bytes)?
                } else {
                    let source = String::from_utf8(bytes).map_err(|_| {
                        PandaError::runtime(format!(
                            "Module '{}' is not valid UTF-8 source",
                            path
                        ))
                    })?;
                    crate::compiler::compile_source(&source, &full_path)?
                };
                self.compiled.insert(path.to_string(), proto.clone());
                proto
            }
        };

        let scope = Rc::new(RefCell::new(Environment::with_parent(self.root.clone())));
        let module = Value::Module(Rc::new(RefCell::new(ModuleObject {
            path: path.to_string(),
            scope: scope.clone(),
            exports: proto.chunk.exports.clone(),
        })));
        self.modules.insert(path.to_string(), module.clone());
        self.loading.insert(path.to_string());

        let result = self.execute_nested(proto, scope);
        self.loading.remove(path);
        match result {
            Ok(_) => Ok(module),
            Err(err) => {
                // A failed body leaves no cached module, so a later import
                // retries.
                self.modules.remove(path);
                Err(err)
            }
        }
    }

    /// Run a prototype nested inside the current execution, preserving the
    /// caller's stack and frames.
    fn execute_nested(
        &mut self,
        proto: Rc<FunctionProto>,
        scope: Rc<RefCell<Environment>>,
    ) -> Result<Value, PandaError> {
        let min_depth = self.frames.len();
        let base_stack = self.stack.len();
        let closure = Rc::new(Closure::new(proto, scope));
        self.push(Value::Function(closure))?;
        self.call_value(0)?;
        match self.run(min_depth) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.frames.truncate(min_depth);
                while self
                    .handlers
                    .last()
                    .map_or(false, |h| h.frame_count > min_depth)
                {
                    self.handlers.pop();
                }
                self.drain_stack_to(base_stack);
                Err(err)
            }
        }
    }

    // --- debugger ---

    fn consult_debug_hook(&mut self) {
        let Some(hook) = self.hook.clone() else {
            return;
        };
        let Some(frame) = self.frames.last() else {
            return;
        };
        let line = frame.closure.proto.chunk.line_at(frame.ip);
        if line == 0 || line == self.last_line {
            return;
        }
        self.last_line = line;
        let file = frame.closure.proto.chunk.file.clone();
        let depth = self.frames.len();
        if let Some(reason) = hook.should_stop(&file, line, depth) {
            hook.on_stopped(&reason, &file, line);
            while hook.is_paused() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;
    use crate::compiler::compile_source;

    fn run_source(source: &str) -> Result<Value, PandaError> {
        let proto = compile_source(source, "test.panda")?;
        let mut vm = Vm::new();
        let scope = Rc::new(RefCell::new(Environment::with_parent(vm.root_scope())));
        vm.run_proto(proto, scope)
    }

    fn run_chunk(chunk: Chunk) -> Result<Value, PandaError> {
        let proto = Rc::new(FunctionProto {
            name: String::new(),
            class_name: None,
            arity: 0,
            rest_param: None,
            upvalue_count: 0,
            is_initializer: false,
            local_names: Vec::new(),
            chunk,
        });
        let mut vm = Vm::new();
        let scope = vm.root_scope();
        vm.run_proto(proto, scope)
    }

    fn chunk_with_numbers(numbers: &[f64]) -> Chunk {
        let mut chunk = Chunk::new("stack.panda");
        for &n in numbers {
            let idx = chunk.add_constant(Constant::Number(n)) as u16;
            chunk.write_op(OpCode::Const, 1);
            chunk.write_u16(idx, 1);
        }
        chunk
    }

    #[test]
    fn swap_exchanges_the_top_two() {
        let mut chunk = chunk_with_numbers(&[1.0, 2.0]);
        chunk.write_op(OpCode::Swap, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run_chunk(chunk).unwrap();
        assert_eq!(result.as_number(), Some(1.0));
    }

    #[test]
    fn swap_under_exchanges_beneath_the_top() {
        // [1, 2, 3] -> [2, 1, 3]; popping the top exposes the swapped pair.
        let mut chunk = chunk_with_numbers(&[1.0, 2.0, 3.0]);
        chunk.write_op(OpCode::SwapUnder, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run_chunk(chunk).unwrap();
        assert_eq!(result.as_number(), Some(1.0));
    }

    #[test]
    fn rot3_under_buries_the_top() {
        // [1, 2, 3] -> [3, 1, 2].
        let mut chunk = chunk_with_numbers(&[1.0, 2.0, 3.0]);
        chunk.write_op(OpCode::Rot3Under, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run_chunk(chunk).unwrap();
        assert_eq!(result.as_number(), Some(2.0));
    }

    #[test]
    fn dup2_duplicates_the_top_pair() {
        // [1, 2] -> [1, 2, 1, 2] -> Add -> [1, 2, 3].
        let mut chunk = chunk_with_numbers(&[1.0, 2.0]);
        chunk.write_op(OpCode::Dup2, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run_chunk(chunk).unwrap();
        assert_eq!(result.as_number(), Some(3.0));
    }

    #[test]
    fn null_padding_supplies_missing_arguments() {
        let result = run_source("func f(a, b) { return b }\nreturn f(1)").unwrap();
        assert!(matches!(result, Value::Null));
    }

    #[test]
    fn default_parameters_replace_null_arguments() {
        let result = run_source("func f(a, b = 7) { return a + b }\nreturn f(1)").unwrap();
        assert_eq!(result.as_number(), Some(8.0));
        let result = run_source("func f(a, b = 7) { return a + b }\nreturn f(1, 2)").unwrap();
        assert_eq!(result.as_number(), Some(3.0));
    }

    #[test]
    fn rest_parameter_collects_extras() {
        let result =
            run_source("func f(a, ...rest) { return rest.length }\nreturn f(1, 2, 3, 4)").unwrap();
        assert_eq!(result.as_number(), Some(3.0));
    }

    #[test]
    fn arity_mismatch_without_rest_is_an_error() {
        let err = run_source("func f(a) { return a }\nreturn f(1, 2)").unwrap_err();
        assert!(err.message.contains("Expected 1 arguments but got 2"));
    }

    #[test]
    fn frame_overflow_reports_stack_overflow() {
        let err = run_source("func f() { return f() }\nreturn f()").unwrap_err();
        assert!(err.message.contains("Stack overflow"));
        assert!(!err.trace.is_empty());
    }

    #[test]
    fn closures_capture_variables_not_values() {
        let result = run_source(
            "func make() {\nvar c = 0\nvar inc = () => { c = c + 1; return c }\nvar get = () => c\nreturn [inc, get]\n}\nvar pair = make()\npair[0]()\npair[0]()\nreturn pair[1]()",
        )
        .unwrap();
        assert_eq!(result.as_number(), Some(2.0));
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let err = run_source("return missing").unwrap_err();
        assert!(err.message.contains("Undefined variable 'missing'"));
    }

    #[test]
    fn debug_hook_sees_line_transitions() {
        struct Recorder {
            lines: RefCell<Vec<u32>>,
        }
        impl DebugHook for Recorder {
            fn should_stop(&self, _file: &str, line: u32, _depth: usize) -> Option<String> {
                self.lines.borrow_mut().push(line);
                None
            }
            fn on_stopped(&self, _reason: &str, _file: &str, _line: u32) {}
            fn is_paused(&self) -> bool {
                false
            }
        }

        let proto = compile_source("var a = 1\nvar b = 2\nreturn a + b", "dbg.panda").unwrap();
        let mut vm = Vm::new();
        let hook = Rc::new(Recorder {
            lines: RefCell::new(Vec::new()),
        });
        vm.set_debug_hook(hook.clone());
        let scope = vm.root_scope();
        let result = vm.run_proto(proto, scope).unwrap();
        assert_eq!(result.as_number(), Some(3.0));

        let lines = hook.lines.borrow();
        assert!(lines.contains(&1));
        assert!(lines.contains(&2));
        assert!(lines.contains(&3));
        // Consulted only on transitions, not per instruction.
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn vm_is_reusable_after_an_error() {
        let proto_bad = compile_source("return missing", "a.panda").unwrap();
        let proto_good = compile_source("return 5", "b.panda").unwrap();
        let mut vm = Vm::new();
        let scope = vm.root_scope();
        assert!(vm.run_proto(proto_bad, scope.clone()).is_err());
        let result = vm.run_proto(proto_good, scope).unwrap();
        assert_eq!(result.as_number(), Some(5.0));
    }
}
