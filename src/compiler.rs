// File: src/compiler.rs
//
// Single-pass bytecode compiler for the Panda scripting language.
// Walks the AST and emits bytecode while resolving locals, upvalues, and
// globals. Nested functions compile through a stack of function states so
// upvalue capture can chain through enclosing compilers.

use crate::ast::{
    BinaryOp, ClassDecl, DeclModifier, EnumValue, Expr, FuncDecl, LambdaBody, LogicalOp, Stmt,
    StrPart, UnaryOp,
};
use crate::bytecode::{
    Chunk, ClassProto, Constant, FunctionProto, OpCode, MAX_JUMP, NO_CATCH_SLOT, NO_FINALLY,
};
use crate::errors::PandaError;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::value::{int_to_number, number_to_int};
use std::rc::Rc;

/// A function may have at most 255 user locals (slot 0 is reserved).
pub const MAX_LOCALS: usize = 255;

/// A function may capture at most 255 upvalues.
pub const MAX_UPVALUES: usize = 255;

/// Lex, parse, and compile a source string into a top-level prototype.
pub fn compile_source(source: &str, file: &str) -> Result<Rc<FunctionProto>, PandaError> {
    let tokens = Lexer::new(source)
        .tokenize()
        .map_err(|e| attach_file(e, file))?;
    let program = Parser::new(tokens)
        .parse()
        .map_err(|e| attach_file(e, file))?;
    compile_program(&program, file)
}

/// Compile a parsed program into a top-level prototype.
pub fn compile_program(program: &[Stmt], file: &str) -> Result<Rc<FunctionProto>, PandaError> {
    let mut compiler = Compiler::new(file);
    compiler.push_func(FunctionKind::Script, "", None);
    let result: Result<(), PandaError> = (|| {
        for stmt in program {
            compiler.compile_stmt(stmt)?;
        }
        Ok(())
    })();
    result.map_err(|e| attach_file(e, file))?;
    compiler.emit(OpCode::Null);
    compiler.emit(OpCode::Return);
    let (proto, _) = compiler.pop_func(false);
    Ok(Rc::new(proto))
}

fn attach_file(err: PandaError, file: &str) -> PandaError {
    if err.file.is_none() {
        err.with_file(file)
    } else {
        err
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: usize,
    captured: bool,
}

#[derive(Debug, Clone)]
struct LoopInfo {
    /// Byte offset `continue` loops back to.
    start: usize,
    /// Scope depth of the loop construct itself; `break`/`continue` pop
    /// locals deeper than this.
    scope_depth: usize,
    break_jumps: Vec<usize>,
    /// Hidden iterator slot for for-in loops, closed by `break`.
    iter_slot: Option<u8>,
}

struct FuncState {
    kind: FunctionKind,
    name: String,
    class_name: Option<String>,
    chunk: Chunk,
    arity: u8,
    rest_param: Option<String>,
    locals: Vec<Local>,
    /// Every local ever declared, for the prototype's debug table.
    all_local_names: Vec<String>,
    scope_depth: usize,
    /// (is_local, index) capture records, in declaration order.
    upvalues: Vec<(bool, u8)>,
    loops: Vec<LoopInfo>,
    exports: Vec<String>,
}

struct ClassCtx {
    has_superclass: bool,
}

pub struct Compiler {
    funcs: Vec<FuncState>,
    classes: Vec<ClassCtx>,
    file: String,
    line: u32,
}

/// Result of compile-time constant evaluation.
enum Folded {
    Number(f64),
    Bool(bool),
    Str(String),
}

impl Compiler {
    fn new(file: &str) -> Self {
        Self {
            funcs: Vec::new(),
            classes: Vec::new(),
            file: file.to_string(),
            line: 1,
        }
    }

    // --- function state plumbing ---

    fn push_func(&mut self, kind: FunctionKind, name: &str, class_name: Option<&str>) {
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        self.funcs.push(FuncState {
            kind,
            name: name.to_string(),
            class_name: class_name.map(|s| s.to_string()),
            chunk: Chunk::new(&self.file),
            arity: 0,
            rest_param: None,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                captured: false,
            }],
            all_local_names: Vec::new(),
            scope_depth: if kind == FunctionKind::Script { 0 } else { 1 },
            upvalues: Vec::new(),
            loops: Vec::new(),
            exports: Vec::new(),
        });
    }

    fn pop_func(&mut self, is_initializer: bool) -> (FunctionProto, Vec<(bool, u8)>) {
        let mut state = self.funcs.pop().expect("function state underflow");
        state.chunk.exports = std::mem::take(&mut state.exports);
        let proto = FunctionProto {
            name: state.name,
            class_name: state.class_name,
            arity: state.arity,
            rest_param: state.rest_param,
            upvalue_count: state.upvalues.len() as u8,
            is_initializer,
            local_names: state.all_local_names,
            chunk: state.chunk,
        };
        (proto, state.upvalues)
    }

    fn func(&self) -> &FuncState {
        self.funcs.last().expect("no active function")
    }

    fn func_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("no active function")
    }

    /// True when a plain declaration should become a local rather than a
    /// module-scope global.
    fn is_local_context(&self) -> bool {
        self.funcs.len() > 1 || self.func().scope_depth > 0
    }

    fn err(&self, message: impl Into<String>) -> PandaError {
        PandaError::compile(message, self.line).with_file(&self.file)
    }

    // --- emission helpers ---

    fn emit(&mut self, op: OpCode) {
        let line = self.line;
        self.func_mut().chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line;
        self.func_mut().chunk.write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.line;
        self.func_mut().chunk.write_u16(value, line);
    }

    fn chunk_len(&self) -> usize {
        self.func().chunk.code.len()
    }

    fn make_constant(&mut self, constant: Constant) -> Result<u16, PandaError> {
        let index = self.func_mut().chunk.add_constant(constant);
        if index > u16::MAX as usize {
            return Err(self.err("Too many constants in one chunk"));
        }
        Ok(index as u16)
    }

    fn name_constant(&mut self, name: &str) -> Result<u16, PandaError> {
        self.make_constant(Constant::Str(name.to_string()))
    }

    fn emit_constant(&mut self, constant: Constant) -> Result<(), PandaError> {
        let index = self.make_constant(constant)?;
        self.emit(OpCode::Const);
        self.emit_u16(index);
        Ok(())
    }

    /// Emit a jump and return the position of its 16-bit operand for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        let pos = self.chunk_len();
        self.emit_u16(0xffff);
        pos
    }

    /// Point a previously emitted jump operand at the current position.
    fn patch_jump(&mut self, operand_pos: usize) -> Result<(), PandaError> {
        let jump = self.chunk_len() - operand_pos - 2;
        if jump > MAX_JUMP {
            return Err(self.err("Too much code to jump over"));
        }
        self.func_mut().chunk.patch_u16(operand_pos, jump as u16);
        Ok(())
    }

    fn emit_loop(&mut self, start: usize) -> Result<(), PandaError> {
        self.emit(OpCode::Loop);
        let offset = self.chunk_len() + 2 - start;
        if offset > MAX_JUMP {
            return Err(self.err("Loop body too large"));
        }
        self.emit_u16(offset as u16);
        Ok(())
    }

    // --- scopes and name resolution ---

    fn begin_scope(&mut self) {
        self.func_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = self.func().scope_depth - 1;
        self.func_mut().scope_depth = depth;
        loop {
            let captured = match self.func().locals.last() {
                Some(local) if local.depth > depth => local.captured,
                _ => break,
            };
            if captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
            self.func_mut().locals.pop();
        }
    }

    /// Emit pops for locals deeper than `target_depth` without discarding
    /// them from the table (used by break/continue, which jump out of the
    /// scope rather than ending it).
    fn emit_scope_pops(&mut self, target_depth: usize) {
        let flags: Vec<bool> = self
            .func()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > target_depth)
            .map(|l| l.captured)
            .collect();
        for captured in flags {
            if captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
        }
    }

    /// Reserve the next stack slot for a named local. The value currently on
    /// top of the stack (or about to be pushed there) becomes the local.
    fn declare_local(&mut self, name: &str) -> Result<u8, PandaError> {
        let state = self.func();
        if state
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == state.scope_depth)
            .any(|l| l.name == name)
        {
            return Err(self.err(format!(
                "Variable '{}' is already declared in this scope",
                name
            )));
        }
        if state.locals.len() > MAX_LOCALS {
            return Err(self.err("Too many local variables in function"));
        }
        let depth = state.scope_depth;
        let state = self.func_mut();
        state.locals.push(Local {
            name: name.to_string(),
            depth,
            captured: false,
        });
        state.all_local_names.push(name.to_string());
        Ok((state.locals.len() - 1) as u8)
    }

    fn resolve_local_in(&self, func: usize, name: &str) -> Option<u8> {
        self.funcs[func]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i as u8)
    }

    fn resolve_upvalue_in(&mut self, func: usize, name: &str) -> Result<Option<u8>, PandaError> {
        if func == 0 {
            return Ok(None);
        }
        let parent = func - 1;
        if let Some(slot) = self.resolve_local_in(parent, name) {
            self.funcs[parent].locals[slot as usize].captured = true;
            return Ok(Some(self.add_upvalue(func, true, slot)?));
        }
        if let Some(index) = self.resolve_upvalue_in(parent, name)? {
            return Ok(Some(self.add_upvalue(func, false, index)?));
        }
        Ok(None)
    }

    /// Coalesces duplicate captures of the same source.
    fn add_upvalue(&mut self, func: usize, is_local: bool, index: u8) -> Result<u8, PandaError> {
        if let Some(existing) = self.funcs[func]
            .upvalues
            .iter()
            .position(|&(l, i)| l == is_local && i == index)
        {
            return Ok(existing as u8);
        }
        if self.funcs[func].upvalues.len() >= MAX_UPVALUES {
            return Err(self.err("Too many captured variables in function"));
        }
        self.funcs[func].upvalues.push((is_local, index));
        Ok((self.funcs[func].upvalues.len() - 1) as u8)
    }

    fn emit_variable_get(&mut self, name: &str) -> Result<(), PandaError> {
        let current = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local_in(current, name) {
            self.emit(OpCode::GetLocal);
            self.emit_byte(slot);
        } else if let Some(index) = self.resolve_upvalue_in(current, name)? {
            self.emit(OpCode::GetUpvalue);
            self.emit_byte(index);
        } else {
            let idx = self.name_constant(name)?;
            self.emit(OpCode::GetGlobal);
            self.emit_u16(idx);
        }
        Ok(())
    }

    fn emit_variable_set(&mut self, name: &str) -> Result<(), PandaError> {
        let current = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local_in(current, name) {
            self.emit(OpCode::SetLocal);
            self.emit_byte(slot);
        } else if let Some(index) = self.resolve_upvalue_in(current, name)? {
            self.emit(OpCode::SetUpvalue);
            self.emit_byte(index);
        } else {
            let idx = self.name_constant(name)?;
            self.emit(OpCode::SetGlobal);
            self.emit_u16(idx);
        }
        Ok(())
    }

    /// Bind a declaration whose value sits on top of the stack.
    fn define_variable(&mut self, name: &str, modifier: DeclModifier) -> Result<(), PandaError> {
        match modifier {
            DeclModifier::Global => {
                let idx = self.name_constant(name)?;
                self.emit(OpCode::DefineRootGlobal);
                self.emit_u16(idx);
            }
            DeclModifier::Export => {
                if self.funcs.len() != 1 || self.func().scope_depth != 0 {
                    return Err(self.err("'export' is only allowed at the top level"));
                }
                if !self.func().exports.iter().any(|e| e == name) {
                    self.func_mut().exports.push(name.to_string());
                }
                let idx = self.name_constant(name)?;
                self.emit(OpCode::DefineGlobal);
                self.emit_u16(idx);
            }
            DeclModifier::None => {
                if self.is_local_context() {
                    self.declare_local(name)?;
                } else {
                    let idx = self.name_constant(name)?;
                    self.emit(OpCode::DefineGlobal);
                    self.emit_u16(idx);
                }
            }
        }
        Ok(())
    }

    // --- statements ---

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), PandaError> {
        match stmt {
            Stmt::Var {
                name,
                initializer,
                modifier,
                line,
            } => {
                self.line = *line;
                match initializer {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit(OpCode::Null),
                }
                self.define_variable(name, *modifier)
            }

            Stmt::Func { decl, modifier } => {
                self.line = decl.line;
                let local = *modifier == DeclModifier::None && self.is_local_context();
                if local {
                    // Declared before the body compiles so the function can
                    // recurse through its own slot.
                    self.declare_local(&decl.name)?;
                    self.compile_function(decl, FunctionKind::Function, None)?;
                } else {
                    self.compile_function(decl, FunctionKind::Function, None)?;
                    self.define_variable(&decl.name, *modifier)?;
                }
                Ok(())
            }

            Stmt::Class { decl, modifier } => self.compile_class(decl, *modifier),

            Stmt::Enum {
                name,
                members,
                modifier,
                line,
            } => {
                self.line = *line;
                self.compile_enum(name, members)?;
                self.define_variable(name, *modifier)
            }

            Stmt::Import {
                path,
                alias,
                is_global,
                line,
            } => {
                self.line = *line;
                let alias = alias.clone().unwrap_or_else(|| {
                    path.rsplit('.').next().unwrap_or(path.as_str()).to_string()
                });
                let path_idx = self.make_constant(Constant::Str(path.clone()))?;
                let alias_idx = self.make_constant(Constant::Str(alias.clone()))?;
                self.emit(OpCode::Import);
                self.emit_u16(path_idx);
                self.emit_u16(alias_idx);
                self.emit_byte(*is_global as u8);
                if *is_global {
                    self.emit(OpCode::Pop);
                } else if self.is_local_context() {
                    self.declare_local(&alias)?;
                } else {
                    self.emit(OpCode::DefineGlobal);
                    self.emit_u16(alias_idx);
                }
                Ok(())
            }

            Stmt::If {
                condition,
                then_branch,
                else_branch,
                line,
            } => {
                self.line = *line;
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit(OpCode::Pop);
                self.compile_stmt(then_branch)?;
                let end_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump)?;
                self.emit(OpCode::Pop);
                if let Some(else_branch) = else_branch {
                    self.compile_stmt(else_branch)?;
                }
                self.patch_jump(end_jump)
            }

            Stmt::While {
                condition,
                body,
                line,
            } => {
                self.line = *line;
                let start = self.chunk_len();
                let scope_depth = self.func().scope_depth;
                self.func_mut().loops.push(LoopInfo {
                    start,
                    scope_depth,
                    break_jumps: Vec::new(),
                    iter_slot: None,
                });
                self.compile_expr(condition)?;
                let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit(OpCode::Pop);
                self.compile_stmt(body)?;
                self.emit_loop(start)?;
                self.patch_jump(exit_jump)?;
                self.emit(OpCode::Pop);
                let info = self.func_mut().loops.pop().expect("loop info");
                for jump in info.break_jumps {
                    self.patch_jump(jump)?;
                }
                Ok(())
            }

            Stmt::ForIn {
                key_var,
                value_var,
                iterable,
                body,
                line,
            } => self.compile_for_in(key_var.as_deref(), value_var, iterable, body, *line),

            Stmt::Return { value, line } => {
                self.line = *line;
                if self.func().kind == FunctionKind::Initializer {
                    if value.is_some() {
                        return Err(self.err("Cannot return a value from a constructor"));
                    }
                    self.emit(OpCode::This);
                } else {
                    match value {
                        Some(expr) => self.compile_expr(expr)?,
                        None => self.emit(OpCode::Null),
                    }
                }
                self.emit(OpCode::Return);
                Ok(())
            }

            Stmt::Break { line } => {
                self.line = *line;
                let (scope_depth, iter_slot) = match self.func().loops.last() {
                    Some(info) => (info.scope_depth, info.iter_slot),
                    None => return Err(self.err("Cannot use 'break' outside of a loop")),
                };
                if let Some(slot) = iter_slot {
                    self.emit(OpCode::CloseIter);
                    self.emit_byte(slot);
                }
                self.emit_scope_pops(scope_depth);
                let jump = self.emit_jump(OpCode::Jump);
                self.func_mut()
                    .loops
                    .last_mut()
                    .expect("loop info")
                    .break_jumps
                    .push(jump);
                Ok(())
            }

            Stmt::Continue { line } => {
                self.line = *line;
                let (scope_depth, start) = match self.func().loops.last() {
                    Some(info) => (info.scope_depth, info.start),
                    None => return Err(self.err("Cannot use 'continue' outside of a loop")),
                };
                self.emit_scope_pops(scope_depth);
                self.emit_loop(start)
            }

            Stmt::Try {
                body,
                catch,
                finally,
                line,
            } => self.compile_try(body, catch.as_ref(), finally.as_deref(), *line),

            Stmt::Throw { value, line } => {
                self.line = *line;
                self.compile_expr(value)?;
                self.emit(OpCode::Throw);
                Ok(())
            }

            Stmt::Block(stmts) => {
                self.begin_scope();
                for stmt in stmts {
                    self.compile_stmt(stmt)?;
                }
                self.end_scope();
                Ok(())
            }

            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(OpCode::Pop);
                Ok(())
            }
        }
    }

    fn compile_for_in(
        &mut self,
        key_var: Option<&str>,
        value_var: &str,
        iterable: &Expr,
        body: &Stmt,
        line: u32,
    ) -> Result<(), PandaError> {
        self.line = line;
        self.begin_scope();

        self.compile_expr(iterable)?;
        self.emit(OpCode::GetIter);
        // The parenthesized name keeps the slot invisible to user code.
        let iter_slot = self.declare_local("(iter)")?;

        if let Some(key) = key_var {
            self.emit(OpCode::Null);
            self.declare_local(key)?;
        }
        self.emit(OpCode::Null);
        self.declare_local(value_var)?;

        let start = self.chunk_len();
        let scope_depth = self.func().scope_depth;
        self.func_mut().loops.push(LoopInfo {
            start,
            scope_depth,
            break_jumps: Vec::new(),
            iter_slot: Some(iter_slot),
        });

        self.emit(if key_var.is_some() {
            OpCode::ForIterKVLocal
        } else {
            OpCode::ForIterLocal
        });
        self.emit_byte(iter_slot);
        let exit_operand = self.chunk_len();
        self.emit_u16(0xffff);

        self.compile_stmt(body)?;
        self.emit_loop(start)?;
        self.patch_jump(exit_operand)?;

        let info = self.func_mut().loops.pop().expect("loop info");
        for jump in info.break_jumps {
            self.patch_jump(jump)?;
        }

        self.end_scope();
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &[Stmt],
        catch: Option<&crate::ast::CatchClause>,
        finally: Option<&[Stmt]>,
        line: u32,
    ) -> Result<(), PandaError> {
        self.line = line;

        let catch_slot = match catch {
            Some(clause) if clause.variable.is_some() => self.func().locals.len() as u8,
            _ => NO_CATCH_SLOT,
        };

        self.emit(OpCode::SetupTry);
        let catch_operand = self.chunk_len();
        self.emit_u16(0xffff);
        let finally_operand = self.chunk_len();
        self.emit_u16(NO_FINALLY);
        self.emit_byte(catch_slot);

        self.begin_scope();
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.end_scope();
        self.emit(OpCode::EndTry);
        let after_try = self.emit_jump(OpCode::Jump);

        let mut after_catch = None;
        if let Some(clause) = catch {
            self.patch_jump(catch_operand)?;
            self.begin_scope();
            match &clause.variable {
                // The thrown value pushed by the VM occupies the new slot.
                Some(name) => {
                    self.declare_local(name)?;
                }
                None => self.emit(OpCode::Pop),
            }
            for stmt in &clause.body {
                self.compile_stmt(stmt)?;
            }
            self.end_scope();
            self.emit(OpCode::EndTry);
            after_catch = Some(self.emit_jump(OpCode::Jump));
        }

        if let Some(finally_body) = finally {
            self.patch_jump(finally_operand)?;
            if catch.is_none() {
                // Equal catch/finally addresses mark a finally-only handler.
                self.patch_jump(catch_operand)?;
            }
            self.patch_jump(after_try)?;
            if let Some(jump) = after_catch {
                self.patch_jump(jump)?;
            }
            self.begin_scope();
            for stmt in finally_body {
                self.compile_stmt(stmt)?;
            }
            self.end_scope();
            self.emit(OpCode::EndFinally);
        } else {
            self.patch_jump(after_try)?;
            if let Some(jump) = after_catch {
                self.patch_jump(jump)?;
            }
        }
        Ok(())
    }

    fn compile_class(&mut self, decl: &ClassDecl, modifier: DeclModifier) -> Result<(), PandaError> {
        self.line = decl.line;
        if decl.superclass.as_deref() == Some(decl.name.as_str()) {
            return Err(self.err("A class cannot inherit from itself"));
        }

        let local = modifier == DeclModifier::None && self.is_local_context();
        if local {
            self.declare_local(&decl.name)?;
        }

        let proto_idx = self.make_constant(Constant::Class(Rc::new(ClassProto {
            name: decl.name.clone(),
        })))?;
        self.emit(OpCode::Class);
        self.emit_u16(proto_idx);

        self.classes.push(ClassCtx {
            has_superclass: decl.superclass.is_some(),
        });

        let result: Result<(), PandaError> = (|| {
            if let Some(superclass) = &decl.superclass {
                self.emit_variable_get(superclass)?;
                self.emit(OpCode::Inherit);
            }

            let has_ctor = decl.methods.iter().any(|m| m.name == decl.name);
            for method in &decl.methods {
                let kind = if method.name == decl.name {
                    FunctionKind::Initializer
                } else {
                    FunctionKind::Method
                };
                self.compile_function(method, kind, Some(decl))?;
                let name_idx = self.name_constant(&method.name)?;
                self.emit(OpCode::Method);
                self.emit_u16(name_idx);
            }

            // A subclass (or a class with field initializers) with no
            // explicit constructor gets a synthesized zero-parameter one so
            // the superclass constructor and field initializers still run.
            if !has_ctor && (decl.superclass.is_some() || !decl.fields.is_empty()) {
                let synthesized = FuncDecl {
                    name: decl.name.clone(),
                    params: Vec::new(),
                    rest_param: None,
                    body: Vec::new(),
                    line: decl.line,
                };
                self.compile_function(&synthesized, FunctionKind::Initializer, Some(decl))?;
                let name_idx = self.name_constant(&decl.name)?;
                self.emit(OpCode::Method);
                self.emit_u16(name_idx);
            }

            for (field, value) in &decl.static_fields {
                self.compile_expr(value)?;
                let name_idx = self.name_constant(field)?;
                self.emit(OpCode::StaticField);
                self.emit_u16(name_idx);
            }

            for method in &decl.static_methods {
                self.compile_function(method, FunctionKind::Function, Some(decl))?;
                let name_idx = self.name_constant(&method.name)?;
                self.emit(OpCode::StaticMethod);
                self.emit_u16(name_idx);
            }
            Ok(())
        })();
        self.classes.pop();
        result?;

        if !local {
            self.define_variable(&decl.name, modifier)?;
        }
        Ok(())
    }

    fn compile_enum(
        &mut self,
        name: &str,
        members: &[(String, EnumValue)],
    ) -> Result<(), PandaError> {
        self.emit(OpCode::NewObject);
        let mut last_numeric = Some(-1.0f64);
        for (member, value) in members {
            let constant = match value {
                EnumValue::Number(n) => {
                    last_numeric = Some(*n);
                    Constant::Number(*n)
                }
                EnumValue::Str(s) => {
                    last_numeric = None;
                    Constant::Str(s.clone())
                }
                EnumValue::Auto => match last_numeric {
                    Some(previous) => {
                        let next = previous + 1.0;
                        last_numeric = Some(next);
                        Constant::Number(next)
                    }
                    None => {
                        return Err(self.err(format!(
                            "Enum member '{}.{}' requires an explicit value after a string member",
                            name, member
                        )));
                    }
                },
            };
            self.emit(OpCode::Dup);
            self.emit_constant(constant)?;
            let name_idx = self.name_constant(member)?;
            self.emit(OpCode::SetField);
            self.emit_u16(name_idx);
            self.emit(OpCode::Pop);
        }
        Ok(())
    }

    /// Compile a function body in a fresh child state and emit the `Closure`
    /// instruction (with its upvalue descriptor pairs) in the parent.
    fn compile_function(
        &mut self,
        decl: &FuncDecl,
        kind: FunctionKind,
        class: Option<&ClassDecl>,
    ) -> Result<(), PandaError> {
        self.line = decl.line;
        if decl.params.len() > MAX_LOCALS - 1 {
            return Err(self.err("Too many parameters"));
        }

        self.push_func(kind, &decl.name, class.map(|c| c.name.as_str()));
        let result: Result<(), PandaError> = (|| {
            for param in &decl.params {
                self.declare_local(&param.name)?;
            }
            self.func_mut().arity = decl.params.len() as u8;
            if let Some(rest) = &decl.rest_param {
                self.declare_local(rest)?;
                self.func_mut().rest_param = Some(rest.clone());
            }
            self.begin_scope();

            // Null arguments take the parameter's default value.
            for (i, param) in decl.params.iter().enumerate() {
                if let Some(default) = &param.default {
                    let slot = (i + 1) as u8;
                    self.emit(OpCode::GetLocal);
                    self.emit_byte(slot);
                    let skip = self.emit_jump(OpCode::JumpIfNotNull);
                    self.emit(OpCode::Pop);
                    self.compile_expr(default)?;
                    self.emit(OpCode::SetLocal);
                    self.emit_byte(slot);
                    self.patch_jump(skip)?;
                    self.emit(OpCode::Pop);
                }
            }

            if kind == FunctionKind::Initializer {
                self.compile_initializer_body(decl, class.expect("initializer outside class"))?;
            } else {
                for stmt in &decl.body {
                    self.compile_stmt(stmt)?;
                }
            }

            // Implicit return.
            if kind == FunctionKind::Initializer {
                self.emit(OpCode::This);
            } else {
                self.emit(OpCode::Null);
            }
            self.emit(OpCode::Return);
            Ok(())
        })();

        if let Err(err) = result {
            self.funcs.pop();
            return Err(err);
        }

        let (proto, upvalues) = self.pop_func(kind == FunctionKind::Initializer);
        let proto_idx = self.make_constant(Constant::Function(Rc::new(proto)))?;
        self.emit(OpCode::Closure);
        self.emit_u16(proto_idx);
        for (is_local, index) in upvalues {
            self.emit_byte(is_local as u8);
            self.emit_byte(index);
        }
        Ok(())
    }

    /// Constructors run, in order: the superclass call (explicit first
    /// statement or a synthesized zero-argument one), the class's field
    /// initializers, then the remaining body.
    fn compile_initializer_body(
        &mut self,
        decl: &FuncDecl,
        class: &ClassDecl,
    ) -> Result<(), PandaError> {
        let explicit_super = matches!(
            decl.body.first(),
            Some(Stmt::Expr(Expr::Call { callee, .. })) if matches!(**callee, Expr::Super { .. })
        );

        let mut body = decl.body.iter();
        if explicit_super {
            self.compile_stmt(body.next().expect("super call statement"))?;
        } else if let Some(superclass) = &class.superclass {
            self.emit(OpCode::This);
            let super_idx = self.name_constant(superclass)?;
            self.emit(OpCode::GetSuper);
            self.emit_u16(super_idx);
            self.emit(OpCode::Call);
            self.emit_byte(0);
            self.emit(OpCode::Pop);
        }

        for (field, value) in &class.fields {
            self.emit(OpCode::This);
            self.compile_expr(value)?;
            let field_idx = self.name_constant(field)?;
            self.emit(OpCode::SetField);
            self.emit_u16(field_idx);
            self.emit(OpCode::Pop);
        }

        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    // --- expressions ---

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), PandaError> {
        if expr.line() != 0 {
            self.line = expr.line();
        }

        // Literal-reducible subtrees collapse at compile time.
        if matches!(expr, Expr::Binary { .. } | Expr::Unary { .. }) {
            if let Some(folded) = fold_expr(expr) {
                return self.emit_folded(folded);
            }
        }

        match expr {
            Expr::Number(n) => self.emit_constant(Constant::Number(*n)),
            Expr::Bool(true) => {
                self.emit(OpCode::True);
                Ok(())
            }
            Expr::Bool(false) => {
                self.emit(OpCode::False);
                Ok(())
            }
            Expr::Null => {
                self.emit(OpCode::Null);
                Ok(())
            }
            Expr::Str(parts) => self.compile_string(parts),

            Expr::Array { elements, line } => {
                self.line = *line;
                if elements.len() > u16::MAX as usize {
                    return Err(self.err("Too many elements in array literal"));
                }
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(OpCode::NewArray);
                self.emit_u16(elements.len() as u16);
                Ok(())
            }

            Expr::Object { entries, line } => {
                self.line = *line;
                self.emit(OpCode::NewObject);
                for (key, value) in entries {
                    self.emit(OpCode::Dup);
                    self.compile_expr(value)?;
                    let key_idx = self.name_constant(key)?;
                    self.emit(OpCode::SetField);
                    self.emit_u16(key_idx);
                    self.emit(OpCode::Pop);
                }
                Ok(())
            }

            Expr::Variable { name, .. } => self.emit_variable_get(name),

            Expr::Assign {
                target, value, op, ..
            } => self.compile_assignment(target, value, *op),

            Expr::Binary {
                left, op, right, ..
            } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit_binary_op(*op);
                Ok(())
            }

            Expr::Logical {
                left, op, right, ..
            } => {
                self.compile_expr(left)?;
                let jump_op = match op {
                    LogicalOp::And => OpCode::JumpIfFalse,
                    LogicalOp::Or => OpCode::JumpIfTrue,
                    LogicalOp::Coalesce => OpCode::JumpIfNotNull,
                };
                let end = self.emit_jump(jump_op);
                self.emit(OpCode::Pop);
                self.compile_expr(right)?;
                self.patch_jump(end)
            }

            Expr::Unary { op, operand, .. } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Negate => self.emit(OpCode::Negate),
                    UnaryOp::Not => self.emit(OpCode::Not),
                    UnaryOp::BitNot => self.emit(OpCode::BitNot),
                }
                Ok(())
            }

            Expr::IncDec {
                target,
                increment,
                prefix,
                ..
            } => self.compile_inc_dec(target, *increment, *prefix),

            Expr::Ternary {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit(OpCode::Pop);
                self.compile_expr(then_branch)?;
                let end_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump)?;
                self.emit(OpCode::Pop);
                self.compile_expr(else_branch)?;
                self.patch_jump(end_jump)
            }

            Expr::Call { callee, args, line } => self.compile_call(callee, args, *line),

            Expr::Property {
                object,
                name,
                optional,
                ..
            } => {
                if *optional {
                    self.compile_expr(object)?;
                    let not_null = self.emit_jump(OpCode::JumpIfNotNull);
                    let end = self.emit_jump(OpCode::Jump);
                    self.patch_jump(not_null)?;
                    self.emit_property_get(object, name)?;
                    self.patch_jump(end)
                } else {
                    self.compile_expr(object)?;
                    self.emit_property_get(object, name)
                }
            }

            Expr::Index {
                object,
                index,
                optional,
                ..
            } => {
                self.compile_expr(object)?;
                if *optional {
                    let not_null = self.emit_jump(OpCode::JumpIfNotNull);
                    let end = self.emit_jump(OpCode::Jump);
                    self.patch_jump(not_null)?;
                    self.compile_expr(index)?;
                    self.emit(OpCode::GetIndex);
                    self.patch_jump(end)
                } else {
                    self.compile_expr(index)?;
                    self.emit(OpCode::GetIndex);
                    Ok(())
                }
            }

            Expr::This { line } => {
                self.line = *line;
                self.compile_this()
            }

            Expr::Super { method, line } => {
                self.line = *line;
                self.compile_super_access(method)
            }

            Expr::Lambda {
                params,
                rest_param,
                body,
                line,
            } => {
                let body_stmts = match body {
                    LambdaBody::Expr(expr) => vec![Stmt::Return {
                        value: Some((**expr).clone()),
                        line: *line,
                    }],
                    LambdaBody::Block(stmts) => stmts.clone(),
                };
                let decl = FuncDecl {
                    name: "<lambda>".to_string(),
                    params: params.clone(),
                    rest_param: rest_param.clone(),
                    body: body_stmts,
                    line: *line,
                };
                self.compile_function(&decl, FunctionKind::Function, None)
            }
        }
    }

    /// `this.x` reads and writes use the direct field opcodes; everything
    /// else goes through the polymorphic property pair.
    fn emit_property_get(&mut self, object: &Expr, name: &str) -> Result<(), PandaError> {
        let idx = self.name_constant(name)?;
        if matches!(object, Expr::This { .. }) {
            self.emit(OpCode::GetField);
        } else {
            self.emit(OpCode::GetProperty);
        }
        self.emit_u16(idx);
        Ok(())
    }

    fn emit_property_set(&mut self, object: &Expr, name: &str) -> Result<(), PandaError> {
        let idx = self.name_constant(name)?;
        if matches!(object, Expr::This { .. }) {
            self.emit(OpCode::SetField);
        } else {
            self.emit(OpCode::SetProperty);
        }
        self.emit_u16(idx);
        Ok(())
    }

    fn compile_assignment(
        &mut self,
        target: &Expr,
        value: &Expr,
        op: Option<BinaryOp>,
    ) -> Result<(), PandaError> {
        match target {
            Expr::Variable { name, .. } => {
                if let Some(op) = op {
                    self.emit_variable_get(name)?;
                    self.compile_expr(value)?;
                    self.emit_binary_op(op);
                } else {
                    self.compile_expr(value)?;
                }
                self.emit_variable_set(name)
            }
            Expr::Property { object, name, .. } => {
                self.compile_expr(object)?;
                if let Some(op) = op {
                    self.emit(OpCode::Dup);
                    self.emit_property_get(object, name)?;
                    self.compile_expr(value)?;
                    self.emit_binary_op(op);
                } else {
                    self.compile_expr(value)?;
                }
                self.emit_property_set(object, name)
            }
            Expr::Index { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                if let Some(op) = op {
                    self.emit(OpCode::Dup2);
                    self.emit(OpCode::GetIndex);
                    self.compile_expr(value)?;
                    self.emit_binary_op(op);
                } else {
                    self.compile_expr(value)?;
                }
                self.emit(OpCode::SetIndex);
                Ok(())
            }
            _ => Err(self.err("Invalid assignment target")),
        }
    }

    fn compile_inc_dec(
        &mut self,
        target: &Expr,
        increment: bool,
        prefix: bool,
    ) -> Result<(), PandaError> {
        let step_op = if increment {
            OpCode::Add
        } else {
            OpCode::Subtract
        };
        let one = Constant::Number(1.0);

        match target {
            Expr::Variable { name, .. } => {
                self.emit_variable_get(name)?;
                if prefix {
                    self.emit_constant(one)?;
                    self.emit(step_op);
                    self.emit_variable_set(name)
                } else {
                    self.emit(OpCode::Dup);
                    self.emit_constant(one)?;
                    self.emit(step_op);
                    self.emit_variable_set(name)?;
                    self.emit(OpCode::Pop);
                    Ok(())
                }
            }
            Expr::Property { object, name, .. } => {
                self.compile_expr(object)?;
                self.emit(OpCode::Dup);
                self.emit_property_get(object, name)?;
                if prefix {
                    self.emit_constant(one)?;
                    self.emit(step_op);
                    self.emit_property_set(object, name)
                } else {
                    // [obj, old] -> [old, obj, new], keeping the old value as
                    // the expression result.
                    self.emit(OpCode::Dup);
                    self.emit(OpCode::SwapUnder);
                    self.emit_constant(one)?;
                    self.emit(step_op);
                    self.emit_property_set(object, name)?;
                    self.emit(OpCode::Pop);
                    Ok(())
                }
            }
            Expr::Index { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(OpCode::Dup2);
                self.emit(OpCode::GetIndex);
                if prefix {
                    self.emit_constant(one)?;
                    self.emit(step_op);
                    self.emit(OpCode::SetIndex);
                    Ok(())
                } else {
                    // Bury the old value, then re-read the element to update it.
                    self.emit(OpCode::Rot3Under);
                    self.emit(OpCode::Dup2);
                    self.emit(OpCode::GetIndex);
                    self.emit_constant(one)?;
                    self.emit(step_op);
                    self.emit(OpCode::SetIndex);
                    self.emit(OpCode::Pop);
                    Ok(())
                }
            }
            _ => Err(self.err("Invalid increment/decrement target")),
        }
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr], line: u32) -> Result<(), PandaError> {
        self.line = line;
        if args.len() > 255 {
            return Err(self.err("Too many arguments"));
        }

        match callee {
            // obj.name(args) fuses into a single Invoke dispatch.
            Expr::Property {
                object,
                name,
                optional,
                ..
            } => {
                self.compile_expr(object)?;
                let name_idx = self.name_constant(name)?;
                if *optional {
                    let not_null = self.emit_jump(OpCode::JumpIfNotNull);
                    let end = self.emit_jump(OpCode::Jump);
                    self.patch_jump(not_null)?;
                    for arg in args {
                        self.compile_expr(arg)?;
                    }
                    self.emit(OpCode::Invoke);
                    self.emit_u16(name_idx);
                    self.emit_byte(args.len() as u8);
                    self.patch_jump(end)
                } else {
                    for arg in args {
                        self.compile_expr(arg)?;
                    }
                    self.emit(OpCode::Invoke);
                    self.emit_u16(name_idx);
                    self.emit_byte(args.len() as u8);
                    Ok(())
                }
            }
            Expr::Super { method, line } => {
                self.line = *line;
                self.compile_super_access(method)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(OpCode::Call);
                self.emit_byte(args.len() as u8);
                Ok(())
            }
            _ => {
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(OpCode::Call);
                self.emit_byte(args.len() as u8);
                Ok(())
            }
        }
    }

    fn compile_this(&mut self) -> Result<(), PandaError> {
        match self.func().kind {
            FunctionKind::Method | FunctionKind::Initializer => {
                self.emit(OpCode::This);
                Ok(())
            }
            _ => {
                // A lambda nested inside a method captures the receiver.
                let current = self.funcs.len() - 1;
                if let Some(index) = self.resolve_upvalue_in(current, "this")? {
                    self.emit(OpCode::GetUpvalue);
                    self.emit_byte(index);
                    Ok(())
                } else {
                    Err(self.err("Cannot use 'this' outside of a class method"))
                }
            }
        }
    }

    fn compile_super_access(&mut self, method: &str) -> Result<(), PandaError> {
        match self.classes.last() {
            None => return Err(self.err("Cannot use 'super' outside of a class")),
            Some(ctx) if !ctx.has_superclass => {
                return Err(self.err("Cannot use 'super' in a class with no superclass"));
            }
            Some(_) => {}
        }
        self.compile_this()?;
        let idx = self.name_constant(method)?;
        self.emit(OpCode::GetSuper);
        self.emit_u16(idx);
        Ok(())
    }

    fn compile_string(&mut self, parts: &[StrPart]) -> Result<(), PandaError> {
        if let [StrPart::Text(text)] = parts {
            return self.emit_constant(Constant::Str(text.clone()));
        }
        for part in parts {
            match part {
                StrPart::Text(text) => self.emit_constant(Constant::Str(text.clone()))?,
                StrPart::Interp(expr) => self.compile_expr(expr)?,
            }
        }
        self.emit(OpCode::BuildString);
        self.emit_u16(parts.len() as u16);
        Ok(())
    }

    fn emit_binary_op(&mut self, op: BinaryOp) {
        let opcode = match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Subtract => OpCode::Subtract,
            BinaryOp::Multiply => OpCode::Multiply,
            BinaryOp::Divide => OpCode::Divide,
            BinaryOp::Modulo => OpCode::Modulo,
            BinaryOp::Equal => OpCode::Equal,
            BinaryOp::NotEqual => OpCode::NotEqual,
            BinaryOp::Less => OpCode::Less,
            BinaryOp::LessEqual => OpCode::LessEqual,
            BinaryOp::Greater => OpCode::Greater,
            BinaryOp::GreaterEqual => OpCode::GreaterEqual,
            BinaryOp::BitAnd => OpCode::BitAnd,
            BinaryOp::BitOr => OpCode::BitOr,
            BinaryOp::BitXor => OpCode::BitXor,
            BinaryOp::ShiftLeft => OpCode::ShiftLeft,
            BinaryOp::ShiftRight => OpCode::ShiftRight,
        };
        self.emit(opcode);
    }

    fn emit_folded(&mut self, folded: Folded) -> Result<(), PandaError> {
        match folded {
            Folded::Number(n) => self.emit_constant(Constant::Number(n)),
            Folded::Bool(true) => {
                self.emit(OpCode::True);
                Ok(())
            }
            Folded::Bool(false) => {
                self.emit(OpCode::False);
                Ok(())
            }
            Folded::Str(s) => self.emit_constant(Constant::Str(s)),
        }
    }
}

/// Recursively reduce an expression to a literal where both operands do.
fn fold_expr(expr: &Expr) -> Option<Folded> {
    match expr {
        Expr::Number(n) => Some(Folded::Number(*n)),
        Expr::Bool(b) => Some(Folded::Bool(*b)),
        Expr::Str(parts) => match parts.as_slice() {
            [StrPart::Text(text)] => Some(Folded::Str(text.clone())),
            _ => None,
        },
        Expr::Unary { op, operand, .. } => match (op, fold_expr(operand)?) {
            (UnaryOp::Negate, Folded::Number(n)) => Some(Folded::Number(-n)),
            (UnaryOp::Not, Folded::Bool(b)) => Some(Folded::Bool(!b)),
            (UnaryOp::BitNot, Folded::Number(n)) => {
                Some(Folded::Number(int_to_number(!number_to_int(n))))
            }
            _ => None,
        },
        Expr::Binary {
            left, op, right, ..
        } => {
            let left = fold_expr(left)?;
            let right = fold_expr(right)?;
            match (left, right) {
                (Folded::Number(a), Folded::Number(b)) => fold_numbers(a, *op, b),
                (Folded::Str(a), Folded::Str(b)) if *op == BinaryOp::Add => {
                    Some(Folded::Str(format!("{}{}", a, b)))
                }
                (Folded::Bool(a), Folded::Bool(b)) => match op {
                    BinaryOp::Equal => Some(Folded::Bool(a == b)),
                    BinaryOp::NotEqual => Some(Folded::Bool(a != b)),
                    _ => None,
                },
                _ => None,
            }
        }
        _ => None,
    }
}

fn fold_numbers(a: f64, op: BinaryOp, b: f64) -> Option<Folded> {
    let result = match op {
        BinaryOp::Add => Folded::Number(a + b),
        BinaryOp::Subtract => Folded::Number(a - b),
        BinaryOp::Multiply => Folded::Number(a * b),
        BinaryOp::Divide => Folded::Number(a / b),
        BinaryOp::Modulo => Folded::Number(a % b),
        BinaryOp::Less => Folded::Bool(a < b),
        BinaryOp::LessEqual => Folded::Bool(a <= b),
        BinaryOp::Greater => Folded::Bool(a > b),
        BinaryOp::GreaterEqual => Folded::Bool(a >= b),
        BinaryOp::Equal => Folded::Bool(a == b),
        BinaryOp::NotEqual => Folded::Bool(a != b),
        BinaryOp::BitAnd => Folded::Number(int_to_number(number_to_int(a) & number_to_int(b))),
        BinaryOp::BitOr => Folded::Number(int_to_number(number_to_int(a) | number_to_int(b))),
        BinaryOp::BitXor => Folded::Number(int_to_number(number_to_int(a) ^ number_to_int(b))),
        BinaryOp::ShiftLeft => {
            Folded::Number(int_to_number(number_to_int(a) << (number_to_int(b) & 63)))
        }
        BinaryOp::ShiftRight => {
            Folded::Number(int_to_number(number_to_int(a) >> (number_to_int(b) & 63)))
        }
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<Rc<FunctionProto>, PandaError> {
        compile_source(source, "test.panda")
    }

    #[test]
    fn constant_folding_collapses_arithmetic() {
        let proto = compile("return 2 + 3 * 4").unwrap();
        assert!(matches!(
            proto.chunk.constants.as_slice(),
            [Constant::Number(n)] if *n == 14.0
        ));
    }

    #[test]
    fn constant_folding_handles_strings_and_unary() {
        let proto = compile("return \"a\" + \"b\"").unwrap();
        assert!(matches!(
            proto.chunk.constants.as_slice(),
            [Constant::Str(s)] if s == "ab"
        ));

        let proto = compile("return -(1 + 2)").unwrap();
        assert!(matches!(
            proto.chunk.constants.as_slice(),
            [Constant::Number(n)] if *n == -3.0
        ));
    }

    #[test]
    fn division_by_zero_folds_to_infinity() {
        let proto = compile("return 1 / 0").unwrap();
        assert!(matches!(
            proto.chunk.constants.as_slice(),
            [Constant::Number(n)] if n.is_infinite() && *n > 0.0
        ));
    }

    #[test]
    fn locals_are_capped_at_255() {
        let mut ok_source = String::from("func f() {\n");
        for i in 0..255 {
            ok_source.push_str(&format!("var v{} = {}\n", i, i));
        }
        ok_source.push_str("}\n");
        assert!(compile(&ok_source).is_ok());

        let mut bad_source = String::from("func f() {\n");
        for i in 0..256 {
            bad_source.push_str(&format!("var v{} = {}\n", i, i));
        }
        bad_source.push_str("}\n");
        let err = compile(&bad_source).unwrap_err();
        assert!(err.message.contains("Too many local variables"));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = compile("break").unwrap_err();
        assert!(err.message.contains("'break' outside of a loop"));
    }

    #[test]
    fn continue_outside_loop_is_rejected() {
        let err = compile("continue").unwrap_err();
        assert!(err.message.contains("'continue' outside of a loop"));
    }

    #[test]
    fn export_inside_function_is_rejected() {
        let err = compile("func f() { export var x = 1 }").unwrap_err();
        assert!(err.message.contains("top level"));
    }

    #[test]
    fn exported_names_are_recorded() {
        let proto = compile("export var pi = 3.14\nexport func area(r) { return pi * r * r }\nvar hidden = 1")
            .unwrap();
        assert_eq!(proto.chunk.exports, vec!["pi", "area"]);
    }

    #[test]
    fn jump_offsets_are_bounded_at_u16() {
        // Each iteration of the filler emits the same handful of bytes, so
        // enough of them pushes the if-body over the 16-bit jump limit.
        let mut source = String::from("func f(x) {\nif x {\n");
        for _ in 0..9000 {
            source.push_str("x = x + 1\n");
        }
        source.push_str("}\n}\n");
        let err = compile(&source).unwrap_err();
        assert!(err.message.contains("Too much code to jump over"));
    }

    #[test]
    fn finally_offset_cannot_collide_with_the_sentinel() {
        // A try body large enough to push the finally offset to the 0xFFFF
        // sentinel must fail to compile instead of decoding as "no finally".
        let mut source = String::from("func f(x) {\ntry {\n");
        for _ in 0..7300 {
            source.push_str("x = x + 1\n");
        }
        source.push_str("} finally { x = 0 }\n}\n");
        let err = compile(&source).unwrap_err();
        assert!(err.message.contains("Too much code to jump over"));
    }

    #[test]
    fn constructor_cannot_return_a_value() {
        let err = compile("class A { A() { return 1 } }").unwrap_err();
        assert!(err.message.contains("Cannot return a value from a constructor"));
    }

    #[test]
    fn this_outside_method_is_rejected() {
        let err = compile("return this").unwrap_err();
        assert!(err.message.contains("'this' outside"));
    }

    #[test]
    fn super_without_superclass_is_rejected() {
        let err = compile("class A { func m() { return super.m() } }").unwrap_err();
        assert!(err.message.contains("no superclass"));
    }

    #[test]
    fn enum_auto_increment_after_string_is_rejected() {
        let err = compile("enum E { A = \"s\", B }").unwrap_err();
        assert!(err.message.contains("requires an explicit value"));
    }

    #[test]
    fn enum_values_auto_increment_from_last_numeric() {
        let proto = compile("enum E { A, B = 5, C }").unwrap();
        let numbers: Vec<f64> = proto
            .chunk
            .constants
            .iter()
            .filter_map(|c| match c {
                Constant::Number(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(numbers, vec![0.0, 5.0, 6.0]);
    }

    #[test]
    fn upvalues_are_capped_at_255() {
        // One outer function with 255 locals, all captured by a lambda.
        let mut source = String::from("func outer() {\n");
        for i in 0..255 {
            source.push_str(&format!("var v{} = {}\n", i, i));
        }
        source.push_str("return () => ");
        let sum: Vec<String> = (0..255).map(|i| format!("v{}", i)).collect();
        source.push_str(&sum.join(" + "));
        source.push_str("\n}\n");
        assert!(compile(&source).is_ok());
    }

    #[test]
    fn capturing_a_256th_upvalue_is_rejected() {
        // No single function may hold 256 locals, so the 256th capture is
        // reached by chaining: the lambda pulls 128 locals out of each of two
        // enclosing functions, and its own upvalue table overflows.
        let mut source = String::from("func outer() {\n");
        for i in 0..128 {
            source.push_str(&format!("var a{} = {}\n", i, i));
        }
        source.push_str("func middle() {\n");
        for i in 0..128 {
            source.push_str(&format!("var b{} = {}\n", i, i));
        }
        source.push_str("return () => ");
        let names: Vec<String> = (0..128)
            .map(|i| format!("a{}", i))
            .chain((0..128).map(|i| format!("b{}", i)))
            .collect();
        source.push_str(&names.join(" + "));
        source.push_str("\n}\nreturn middle()\n}\n");
        let err = compile(&source).unwrap_err();
        assert!(err.message.contains("Too many captured variables"));
    }

    #[test]
    fn duplicate_locals_in_one_scope_are_rejected() {
        let err = compile("func f() { var a = 1\nvar a = 2 }").unwrap_err();
        assert!(err.message.contains("already declared"));
    }

    #[test]
    fn invoke_fusion_emits_invoke() {
        let proto = compile("var o = null\no.m(1, 2)").unwrap();
        let listing = proto.chunk.disassemble("test");
        assert!(listing.contains("Invoke"));
        assert!(!listing.contains("GetProperty"));
    }
}
