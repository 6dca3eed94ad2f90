// File: src/engine.rs
//
// Embedding façade for the Panda scripting language.
// Wraps the compile pipeline and the VM behind the host-facing surface:
// compile, run, eval, call, global accessors, module pre-seeding, and the
// loader hook. Named scopes isolate repeated runs from each other while
// still seeing the root scope's builtins and globals.

use crate::builtins;
use crate::bytecode::{is_bytecode, FunctionProto};
use crate::compiler::compile_source;
use crate::environment::{EnvProvider, Environment};
use crate::errors::PandaError;
use crate::module::LoaderHook;
use crate::value::Value;
use crate::vm::{DebugHook, Vm};
use ahash::AHashMap;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::rc::Rc;

/// A compiled script: its prototype plus a content hash of the source.
pub struct CompiledScript {
    pub proto: Rc<FunctionProto>,
    pub hash: String,
}

impl CompiledScript {
    /// Serialize into the MPBC envelope.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.proto.serialize()
    }
}

/// Environment argument accepted by `eval`.
pub enum EvalEnv {
    /// Name -> value bindings defined in a one-shot child scope.
    Map(Vec<(String, Value)>),
    /// An existing scope used as-is.
    Scope(Rc<RefCell<Environment>>),
    /// A read-only provider attached to a one-shot child scope.
    Provider(Rc<dyn EnvProvider>),
}

pub struct Engine {
    vm: Vm,
    scopes: AHashMap<String, Rc<RefCell<Environment>>>,
}

impl Engine {
    /// A fresh engine with the builtin globals registered in its root scope.
    pub fn new() -> Self {
        let vm = Vm::new();
        builtins::install(&vm.root_scope());
        Self {
            vm,
            scopes: AHashMap::new(),
        }
    }

    /// Parse and compile without executing.
    pub fn compile(&self, source: &str) -> Result<CompiledScript, PandaError> {
        let proto = compile_source(source, "<script>")?;
        let hash = format!("{:x}", Sha256::digest(source.as_bytes()));
        Ok(CompiledScript { proto, hash })
    }

    /// Compile and run source text.
    pub fn run(
        &mut self,
        source: &str,
        scope_name: Option<&str>,
        clear_scope: bool,
    ) -> Result<Value, PandaError> {
        let proto = compile_source(source, "<script>")?;
        let scope = self.scope_for(scope_name, clear_scope);
        self.vm.run_proto(proto, scope)
    }

    /// Run either an MPBC envelope or UTF-8 source, sniffed by magic.
    pub fn run_bytes(
        &mut self,
        bytes: &[u8],
        scope_name: Option<&str>,
        clear_scope: bool,
    ) -> Result<Value, PandaError> {
        self.run_bytes_labeled(bytes, "<script>", scope_name, clear_scope)
    }

    /// `run_bytes` with an explicit source-file label for diagnostics.
    pub fn run_bytes_labeled(
        &mut self,
        bytes: &[u8],
        file: &str,
        scope_name: Option<&str>,
        clear_scope: bool,
    ) -> Result<Value, PandaError> {
        let proto = if is_bytecode(bytes) {
            FunctionProto::deserialize(bytes)?
        } else {
            let source = std::str::from_utf8(bytes)
                .map_err(|_| PandaError::compile("Script is not valid UTF-8", 0).with_file(file))?;
            compile_source(source, file)?
        };
        let scope = self.scope_for(scope_name, clear_scope);
        self.vm.run_proto(proto, scope)
    }

    /// Evaluate a single expression and return its value.
    pub fn eval(&mut self, expr: &str) -> Result<Value, PandaError> {
        self.eval_in(expr, None, None, false)
    }

    /// Evaluate an expression, optionally against extra bindings and a named
    /// scope. The expression is wrapped in a `return`.
    pub fn eval_in(
        &mut self,
        expr: &str,
        env: Option<EvalEnv>,
        scope_name: Option<&str>,
        clear_scope: bool,
    ) -> Result<Value, PandaError> {
        let wrapped = format!("return ({})", expr);
        let proto = compile_source(&wrapped, "<eval>")?;
        let base = self.scope_for(scope_name, clear_scope);
        let scope = match env {
            None => base,
            Some(EvalEnv::Scope(scope)) => scope,
            Some(EvalEnv::Map(entries)) => {
                let child = Rc::new(RefCell::new(Environment::with_parent(base)));
                for (name, value) in entries {
                    child.borrow_mut().define(name, value);
                }
                child
            }
            Some(EvalEnv::Provider(provider)) => {
                let child = Rc::new(RefCell::new(Environment::with_parent(base)));
                child.borrow_mut().set_provider(provider);
                child
            }
        };
        self.vm.run_proto(proto, scope)
    }

    /// Invoke a global function by name.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, PandaError> {
        let callee = self
            .vm
            .root_scope()
            .borrow()
            .get(name)
            .ok_or_else(|| PandaError::runtime(format!("Undefined function '{}'", name)))?;
        self.vm.call_function(callee, args)
    }

    /// Invoke a function resolved through a one-shot child environment.
    pub fn call_in(
        &mut self,
        env: &[(String, Value)],
        name: &str,
        args: &[Value],
    ) -> Result<Value, PandaError> {
        let child = Rc::new(RefCell::new(Environment::with_parent(self.vm.root_scope())));
        for (binding, value) in env {
            child.borrow_mut().define(binding.clone(), value.clone());
        }
        let callee = child
            .borrow()
            .get(name)
            .ok_or_else(|| PandaError::runtime(format!("Undefined function '{}'", name)))?;
        self.vm.call_function(callee, args)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.vm.root_scope().borrow_mut().define(name, value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.vm.root_scope().borrow().get(name)
    }

    /// Pre-seed the module cache: `import name` will use these bytes (MPBC
    /// envelope or source) without consulting the loader.
    pub fn load_module(
        &mut self,
        bytes: &[u8],
        name: &str,
        source_path: &str,
    ) -> Result<(), PandaError> {
        let proto = if is_bytecode(bytes) {
            FunctionProto::deserialize(bytes)?
        } else {
            let source = std::str::from_utf8(bytes).map_err(|_| {
                PandaError::compile("Module is not valid UTF-8", 0).with_file(source_path)
            })?;
            compile_source(source, source_path)?
        };
        self.vm.preload_module(name, proto);
        Ok(())
    }

    /// Resolve a path through the module loader and run it.
    pub fn run_file(&mut self, path: &str) -> Result<Value, PandaError> {
        let module_path = path
            .trim_end_matches(".panda")
            .trim_end_matches(".mpbc")
            .to_string();
        let (bytes, full_path) = self.vm.load_module_bytes(&module_path)?;
        self.run_bytes_labeled(&bytes, &full_path, None, false)
    }

    pub fn set_loader(&mut self, hook: LoaderHook) {
        self.vm.set_loader(hook);
    }

    pub fn set_debug_hook(&mut self, hook: Rc<dyn DebugHook>) {
        self.vm.set_debug_hook(hook);
    }

    pub fn clear_debug_hook(&mut self) {
        self.vm.clear_debug_hook();
    }

    /// Drop cached modules so their bodies may execute again.
    pub fn clear_modules(&mut self) {
        self.vm.clear_modules();
    }

    /// Named scopes are children of the root, created on demand; `None`
    /// executes directly against the root scope.
    fn scope_for(&mut self, name: Option<&str>, clear: bool) -> Rc<RefCell<Environment>> {
        match name {
            None => self.vm.root_scope(),
            Some(name) => {
                let root = self.vm.root_scope();
                let scope = self
                    .scopes
                    .entry(name.to_string())
                    .or_insert_with(|| Rc::new(RefCell::new(Environment::with_parent(root))))
                    .clone();
                if clear {
                    scope.borrow_mut().clear();
                }
                scope
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_produces_a_stable_content_hash() {
        let engine = Engine::new();
        let a = engine.compile("return 1 + 2").unwrap();
        let b = engine.compile("return 1 + 2").unwrap();
        let c = engine.compile("return 1 + 3").unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn eval_wraps_expressions() {
        let mut engine = Engine::new();
        let result = engine.eval("2 + 3 * 4").unwrap();
        assert_eq!(result.as_number(), Some(14.0));
    }

    #[test]
    fn eval_env_map_provides_bindings() {
        let mut engine = Engine::new();
        let result = engine
            .eval_in(
                "width * height",
                Some(EvalEnv::Map(vec![
                    ("width".to_string(), Value::Number(6.0)),
                    ("height".to_string(), Value::Number(7.0)),
                ])),
                None,
                false,
            )
            .unwrap();
        assert_eq!(result.as_number(), Some(42.0));
    }

    #[test]
    fn named_scopes_isolate_and_persist() {
        let mut engine = Engine::new();
        engine.run("var counter = 10", Some("a"), false).unwrap();
        let result = engine
            .eval_in("counter", None, Some("a"), false)
            .unwrap();
        assert_eq!(result.as_number(), Some(10.0));

        // Another scope does not see it.
        let err = engine.eval_in("counter", None, Some("b"), false).unwrap_err();
        assert!(err.message.contains("Undefined variable"));

        // Clearing resets the scope.
        let err = engine.eval_in("counter", None, Some("a"), true).unwrap_err();
        assert!(err.message.contains("Undefined variable"));
    }

    #[test]
    fn call_invokes_global_functions() {
        let mut engine = Engine::new();
        engine
            .run("func double(x) { return x * 2 }", None, false)
            .unwrap();
        let result = engine.call("double", &[Value::Number(21.0)]).unwrap();
        assert_eq!(result.as_number(), Some(42.0));
    }

    #[test]
    fn globals_round_trip_through_the_facade() {
        let mut engine = Engine::new();
        engine.set_global("flag", Value::Bool(true));
        assert!(matches!(engine.get_global("flag"), Some(Value::Bool(true))));
        let result = engine.eval("flag").unwrap();
        assert!(matches!(result, Value::Bool(true)));
    }

    #[test]
    fn eval_env_provider_supplies_read_only_bindings() {
        struct SizeProvider;
        impl EnvProvider for SizeProvider {
            fn get(&self, name: &str) -> Option<Value> {
                (name == "size").then(|| Value::Number(12.0))
            }
        }

        let mut engine = Engine::new();
        let result = engine
            .eval_in(
                "size / 4",
                Some(EvalEnv::Provider(Rc::new(SizeProvider))),
                None,
                false,
            )
            .unwrap();
        assert_eq!(result.as_number(), Some(3.0));
    }

    #[test]
    fn call_in_resolves_through_a_one_shot_environment() {
        let mut engine = Engine::new();
        engine
            .run("func scaled(x) { return x * factor }", None, false)
            .unwrap();
        // `factor` is not a global; the one-shot environment can't inject it
        // into the closure's scope chain, but it can resolve the callee.
        let helper = engine.get_global("scaled").unwrap();
        let result = engine
            .call_in(
                &[("alias".to_string(), helper)],
                "alias",
                &[Value::Number(3.0)],
            )
            .unwrap_err();
        assert!(result.message.contains("Undefined variable 'factor'"));

        engine.set_global("factor", Value::Number(5.0));
        let helper = engine.get_global("scaled").unwrap();
        let result = engine
            .call_in(
                &[("alias".to_string(), helper)],
                "alias",
                &[Value::Number(3.0)],
            )
            .unwrap();
        assert_eq!(result.as_number(), Some(15.0));
    }

    #[test]
    fn run_bytes_sniffs_the_envelope() {
        let mut engine = Engine::new();
        let compiled = engine.compile("return 7 * 6").unwrap();
        let bytes = compiled.to_bytes();
        let result = engine.run_bytes(&bytes, None, false).unwrap();
        assert_eq!(result.as_number(), Some(42.0));

        let result = engine.run_bytes(b"return 40 + 2", None, false).unwrap();
        assert_eq!(result.as_number(), Some(42.0));
    }
}
