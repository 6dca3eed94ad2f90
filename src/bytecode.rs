// File: src/bytecode.rs
//
// Bytecode definitions for the Panda VM: the opcode set, the chunk container
// (code bytes, constant pool, line table, exports), function and class
// prototypes, and the MPBC serialization envelope.

use crate::errors::PandaError;
use num_enum::TryFromPrimitive;
use std::fmt::Write as _;
use std::rc::Rc;

/// Magic bytes at the start of a serialized bytecode file.
pub const BYTECODE_MAGIC: [u8; 4] = *b"MPBC";

/// Current serialization format version.
pub const BYTECODE_VERSION: u8 = 1;

/// Jump operands are 16-bit, with 0xFFFF reserved as the `SetupTry`
/// no-finally sentinel; any forward or backward distance beyond this is a
/// compile error, so a patched offset can never alias the sentinel.
pub const MAX_JUMP: usize = u16::MAX as usize - 1;

/// Sentinel operand meaning "no finally block" in `SetupTry`. Reserved
/// outside the legal jump range.
pub const NO_FINALLY: u16 = u16::MAX;

/// Sentinel operand meaning "no catch variable" in `SetupTry`.
pub const NO_CATCH_SLOT: u8 = u8::MAX;

/// Bytecode instruction opcodes for the Panda VM.
///
/// Operands follow the opcode byte: `u16` values are big-endian. Forward jump
/// offsets are relative to the byte after the operand; `Loop` offsets are
/// subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // === Constants ===
    /// Push a constant. Operand: u16 pool index.
    Const = 0,
    Null,
    True,
    False,

    // === Stack ===
    Pop,
    Dup,
    /// Duplicate the top two values: [a, b] -> [a, b, a, b].
    Dup2,
    /// Swap the top two values.
    Swap,
    /// Swap the two values beneath the top: [x, y, t] -> [y, x, t].
    SwapUnder,
    /// Move the top value beneath the next two: [x, y, z] -> [z, x, y].
    Rot3Under,

    // === Locals ===
    /// Operand: u8 slot (relative to the frame base; slot 0 is the receiver).
    GetLocal,
    /// Operand: u8 slot. Peeks the value (assignment is an expression).
    SetLocal,

    // === Upvalues ===
    /// Operand: u8 upvalue index.
    GetUpvalue,
    /// Operand: u8 upvalue index. Peeks the value.
    SetUpvalue,
    /// Close the upvalue referencing the top stack slot, then pop it.
    CloseUpvalue,

    // === Globals ===
    /// Operand: u16 name constant. Resolved against the closure's scope chain.
    GetGlobal,
    /// Operand: u16 name constant. Peeks the value.
    SetGlobal,
    /// Operand: u16 name constant. Pops the value, defines in the closure's scope.
    DefineGlobal,
    /// Operand: u16 name constant. Pops the value, defines in the shared root scope.
    DefineRootGlobal,

    // === Arithmetic ===
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Negate,

    // === Logic & comparison ===
    Not,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // === Bitwise (operands converted to i64 and back) ===
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    ShiftLeft,
    ShiftRight,

    // === Jumps ===
    /// Operand: u16 forward offset.
    Jump,
    /// Operand: u16 forward offset. Peeks the condition.
    JumpIfFalse,
    /// Operand: u16 forward offset. Peeks the condition.
    JumpIfTrue,
    /// Operand: u16 forward offset. Peeks; jumps when the top is not null.
    JumpIfNotNull,
    /// Operand: u16 backward offset.
    Loop,

    // === Calls ===
    /// Operand: u8 argument count. Callee sits below the arguments.
    Call,
    /// Fused property call. Operands: u16 name constant, u8 argument count.
    Invoke,
    Return,

    // === Closures ===
    /// Operand: u16 prototype constant, then one (is_local, index) byte pair
    /// per declared upvalue.
    Closure,

    // === Aggregates ===
    /// Operand: u16 element count. Pops the elements, pushes an array.
    NewArray,
    /// Push a fresh empty object.
    NewObject,
    /// Direct field read where the receiver shape is known. Operand: u16 name.
    GetField,
    /// Direct field write. Operand: u16 name. Pops value and receiver, pushes value.
    SetField,
    /// Pops index and receiver, pushes the element.
    GetIndex,
    /// Pops value, index, and receiver; pushes the value.
    SetIndex,
    /// Polymorphic property read. Operand: u16 name constant.
    GetProperty,
    /// Polymorphic property write. Operand: u16 name. Pops value and receiver,
    /// pushes the value.
    SetProperty,

    // === Classes ===
    /// Operand: u16 class prototype constant. Pushes a new class.
    Class,
    /// Pops the superclass, records it on the class beneath, and copies its
    /// method table into the (still empty) subclass table.
    Inherit,
    /// Operand: u16 name constant. Pops a closure, attaches it as a method.
    Method,
    /// Operand: u16 name constant. Pops a closure, attaches it as a static method.
    StaticMethod,
    /// Operand: u16 name constant. Pops a value, attaches it as a static field.
    StaticField,
    /// Push the receiver (frame slot 0).
    This,
    /// Operand: u16 method name constant. Pops the receiver, pushes the method
    /// of the defining class's superclass bound to it.
    GetSuper,

    // === Strings ===
    /// Operand: u16 part count. Pops the parts and concatenates their string forms.
    BuildString,

    // === Iterators ===
    /// Pop a value and push an iterator over it.
    GetIter,
    /// Operands: u8 iterator slot, u16 exit offset. Advances the iterator in
    /// the slot, writing the next value into slot+1, or returns the iterator
    /// to the pool, nulls the slot, and jumps to the exit.
    ForIterLocal,
    /// Operands: u8 iterator slot, u16 exit offset. Writes key into slot+1 and
    /// value into slot+2.
    ForIterKVLocal,
    /// Operand: u8 iterator slot. Returns the iterator to the pool and nulls
    /// the slot (emitted by `break`).
    CloseIter,

    // === Imports ===
    /// Operands: u16 path constant, u16 alias constant, u8 is_global.
    /// Pushes the module value; for a global import also binds the alias in
    /// the root scope.
    Import,

    // === Exceptions ===
    /// Operands: u16 catch offset, u16 finally offset (0xFFFF = none),
    /// u8 catch variable slot (0xFF = none). Offsets are forward, relative to
    /// the byte after the operands. A catch block is present iff the resolved
    /// catch and finally addresses differ.
    SetupTry,
    /// Discard the active handler on normal exit from a try or catch block.
    EndTry,
    /// Pop a value and unwind to the nearest handler.
    Throw,
    /// Re-raise a pending exception, or continue after the finally block.
    EndFinally,
}

/// Constants that can be stored in the constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Function(Rc<FunctionProto>),
    Class(Rc<ClassProto>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Null, Constant::Null) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Function(a), Constant::Function(b)) => Rc::ptr_eq(a, b),
            (Constant::Class(a), Constant::Class(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A compiled class shell; methods and statics are attached at runtime by the
/// `Method`/`StaticMethod`/`StaticField` instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassProto {
    pub name: String,
}

/// A compiled function: metadata plus its bytecode chunk.
#[derive(Debug, Clone)]
pub struct FunctionProto {
    pub name: String,
    /// Set for methods and initializers; used in stack traces.
    pub class_name: Option<String>,
    /// Named parameter count. Parameters occupy slots 1..=arity.
    pub arity: u8,
    /// Rest parameter name; occupies the slot after the last named parameter.
    pub rest_param: Option<String>,
    pub upvalue_count: u8,
    /// Initializers implicitly return `this`.
    pub is_initializer: bool,
    /// Local names in declaration order, for debugging.
    pub local_names: Vec<String>,
    pub chunk: Chunk,
}

impl FunctionProto {
    /// Display name used in stack traces and the disassembler.
    pub fn trace_name(&self) -> String {
        match &self.class_name {
            Some(class) => format!("{}.{}", class, self.name),
            None if self.name.is_empty() => "<script>".to_string(),
            None => self.name.clone(),
        }
    }
}

/// A compiled bytecode chunk: code bytes, constant pool, a per-byte line
/// table, the module's exported names, and the source-file label.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    /// Parallel to `code`: the source line of the instruction each byte
    /// belongs to.
    pub lines: Vec<u32>,
    /// Names made visible when this chunk is imported as a module. Only
    /// populated on top-level chunks.
    pub exports: Vec<String>,
    pub file: String,
}

impl Chunk {
    pub fn new(file: &str) -> Self {
        Self {
            file: file.to_string(),
            ..Self::default()
        }
    }

    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_byte(op as u8, line);
    }

    pub fn write_u16(&mut self, value: u16, line: u32) {
        self.write_byte((value >> 8) as u8, line);
        self.write_byte((value & 0xff) as u8, line);
    }

    /// Add a constant to the pool, reusing an existing equal entry.
    pub fn add_constant(&mut self, constant: Constant) -> usize {
        if let Some(index) = self.constants.iter().position(|c| c == &constant) {
            return index;
        }
        self.constants.push(constant);
        self.constants.len() - 1
    }

    /// Overwrite a previously emitted 16-bit operand.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.code[offset] = (value >> 8) as u8;
        self.code[offset + 1] = (value & 0xff) as u8;
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | self.code[offset + 1] as u16
    }

    /// Source line of the instruction at the given byte offset.
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Serialization ("MPBC" envelope)
// ---------------------------------------------------------------------------

/// Returns true when the byte slice carries the MPBC envelope magic.
pub fn is_bytecode(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == BYTECODE_MAGIC
}

impl FunctionProto {
    /// Serialize this prototype (and, recursively, any function-prototype
    /// constants) into an MPBC envelope.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&BYTECODE_MAGIC);
        buf.push(BYTECODE_VERSION);
        write_proto(&mut buf, self);
        buf
    }

    /// Deserialize an MPBC envelope. Fails on wrong magic, unsupported
    /// version, or an unknown constant-kind tag.
    pub fn deserialize(bytes: &[u8]) -> Result<Rc<FunctionProto>, PandaError> {
        if !is_bytecode(bytes) {
            return Err(PandaError::compile("Invalid bytecode: bad magic", 0));
        }
        let mut reader = Reader {
            bytes,
            pos: BYTECODE_MAGIC.len(),
        };
        let version = reader.read_u8()?;
        if version != BYTECODE_VERSION {
            return Err(PandaError::compile(
                format!("Unsupported bytecode version {}", version),
                0,
            ));
        }
        let proto = read_proto(&mut reader)?;
        Ok(Rc::new(proto))
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn write_opt_str(buf: &mut Vec<u8>, s: &Option<String>) {
    match s {
        Some(s) => {
            buf.push(1);
            write_str(buf, s);
        }
        None => buf.push(0),
    }
}

fn write_proto(buf: &mut Vec<u8>, proto: &FunctionProto) {
    write_str(buf, &proto.name);
    write_opt_str(buf, &proto.class_name);
    buf.push(proto.arity);
    write_opt_str(buf, &proto.rest_param);
    buf.push(proto.upvalue_count);
    buf.push(proto.is_initializer as u8);

    buf.extend_from_slice(&(proto.local_names.len() as u32).to_be_bytes());
    for name in &proto.local_names {
        write_str(buf, name);
    }

    let chunk = &proto.chunk;
    buf.extend_from_slice(&(chunk.code.len() as u32).to_be_bytes());
    buf.extend_from_slice(&chunk.code);

    // Line table, run-length encoded.
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &line in &chunk.lines {
        match runs.last_mut() {
            Some((count, last)) if *last == line => *count += 1,
            _ => runs.push((1, line)),
        }
    }
    buf.extend_from_slice(&(runs.len() as u32).to_be_bytes());
    for (count, line) in runs {
        buf.extend_from_slice(&count.to_be_bytes());
        buf.extend_from_slice(&line.to_be_bytes());
    }

    buf.extend_from_slice(&(chunk.constants.len() as u32).to_be_bytes());
    for constant in &chunk.constants {
        match constant {
            Constant::Null => buf.push(0),
            Constant::Bool(b) => {
                buf.push(1);
                buf.push(*b as u8);
            }
            Constant::Number(n) => {
                buf.push(2);
                buf.extend_from_slice(&n.to_bits().to_be_bytes());
            }
            Constant::Str(s) => {
                buf.push(3);
                write_str(buf, s);
            }
            Constant::Function(f) => {
                buf.push(4);
                write_proto(buf, f);
            }
            Constant::Class(c) => {
                buf.push(5);
                write_str(buf, &c.name);
            }
        }
    }

    buf.extend_from_slice(&(chunk.exports.len() as u32).to_be_bytes());
    for name in &chunk.exports {
        write_str(buf, name);
    }

    write_str(buf, &chunk.file);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PandaError> {
        if self.pos + n > self.bytes.len() {
            return Err(PandaError::compile("Invalid bytecode: truncated data", 0));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, PandaError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, PandaError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, PandaError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_str(&mut self) -> Result<String, PandaError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| PandaError::compile("Invalid bytecode: bad string data", 0))
    }

    fn read_opt_str(&mut self) -> Result<Option<String>, PandaError> {
        if self.read_u8()? == 1 {
            Ok(Some(self.read_str()?))
        } else {
            Ok(None)
        }
    }
}

fn read_proto(reader: &mut Reader) -> Result<FunctionProto, PandaError> {
    let name = reader.read_str()?;
    let class_name = reader.read_opt_str()?;
    let arity = reader.read_u8()?;
    let rest_param = reader.read_opt_str()?;
    let upvalue_count = reader.read_u8()?;
    let is_initializer = reader.read_u8()? != 0;

    let local_count = reader.read_u32()? as usize;
    let mut local_names = Vec::with_capacity(local_count);
    for _ in 0..local_count {
        local_names.push(reader.read_str()?);
    }

    let code_len = reader.read_u32()? as usize;
    let code = reader.take(code_len)?.to_vec();

    let run_count = reader.read_u32()? as usize;
    let mut lines = Vec::with_capacity(code_len);
    for _ in 0..run_count {
        let count = reader.read_u32()?;
        let line = reader.read_u32()?;
        for _ in 0..count {
            lines.push(line);
        }
    }

    let constant_count = reader.read_u32()? as usize;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        let tag = reader.read_u8()?;
        let constant = match tag {
            0 => Constant::Null,
            1 => Constant::Bool(reader.read_u8()? != 0),
            2 => Constant::Number(f64::from_bits(reader.read_u64()?)),
            3 => Constant::Str(reader.read_str()?),
            4 => Constant::Function(Rc::new(read_proto(reader)?)),
            5 => Constant::Class(Rc::new(ClassProto {
                name: reader.read_str()?,
            })),
            _ => {
                return Err(PandaError::compile(
                    format!("Invalid bytecode: unknown constant tag {}", tag),
                    0,
                ))
            }
        };
        constants.push(constant);
    }

    let export_count = reader.read_u32()? as usize;
    let mut exports = Vec::with_capacity(export_count);
    for _ in 0..export_count {
        exports.push(reader.read_str()?);
    }

    let file = reader.read_str()?;

    Ok(FunctionProto {
        name,
        class_name,
        arity,
        rest_param,
        upvalue_count,
        is_initializer,
        local_names,
        chunk: Chunk {
            code,
            constants,
            lines,
            exports,
            file,
        },
    })
}

// ---------------------------------------------------------------------------
// Disassembler
// ---------------------------------------------------------------------------

impl Chunk {
    /// Render a human-readable instruction listing.
    pub fn disassemble(&self, name: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "== {} ==", name);
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(&mut out, offset);
        }
        out
    }

    fn disassemble_instruction(&self, out: &mut String, offset: usize) -> usize {
        let _ = write!(out, "{:04} ", offset);
        if offset > 0 && self.line_at(offset) == self.line_at(offset - 1) {
            let _ = write!(out, "   | ");
        } else {
            let _ = write!(out, "{:4} ", self.line_at(offset));
        }

        let op = match OpCode::try_from(self.code[offset]) {
            Ok(op) => op,
            Err(_) => {
                let _ = writeln!(out, "Unknown opcode {}", self.code[offset]);
                return offset + 1;
            }
        };

        match op {
            OpCode::Const => self.constant_instruction(out, "Const", offset),
            OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::DefineGlobal
            | OpCode::DefineRootGlobal
            | OpCode::GetField
            | OpCode::SetField
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::Class
            | OpCode::Method
            | OpCode::StaticMethod
            | OpCode::StaticField
            | OpCode::GetSuper => self.constant_instruction(out, &format!("{:?}", op), offset),
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call
            | OpCode::CloseIter => {
                let operand = self.code[offset + 1];
                let _ = writeln!(out, "{:<16} {}", format!("{:?}", op), operand);
                offset + 2
            }
            OpCode::NewArray | OpCode::BuildString => {
                let operand = self.read_u16(offset + 1);
                let _ = writeln!(out, "{:<16} {}", format!("{:?}", op), operand);
                offset + 3
            }
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue | OpCode::JumpIfNotNull => {
                let jump = self.read_u16(offset + 1) as usize;
                let _ = writeln!(
                    out,
                    "{:<16} {} -> {}",
                    format!("{:?}", op),
                    offset,
                    offset + 3 + jump
                );
                offset + 3
            }
            OpCode::Loop => {
                let jump = self.read_u16(offset + 1) as usize;
                let _ = writeln!(out, "{:<16} {} -> {}", "Loop", offset, offset + 3 - jump);
                offset + 3
            }
            OpCode::Invoke => {
                let index = self.read_u16(offset + 1);
                let argc = self.code[offset + 3];
                let _ = writeln!(
                    out,
                    "{:<16} {} ({} args)",
                    "Invoke",
                    self.constant_name(index),
                    argc
                );
                offset + 4
            }
            OpCode::Closure => {
                let index = self.read_u16(offset + 1);
                let mut next = offset + 3;
                let _ = writeln!(out, "{:<16} {}", "Closure", self.constant_name(index));
                if let Some(Constant::Function(proto)) = self.constants.get(index as usize) {
                    for _ in 0..proto.upvalue_count {
                        let is_local = self.code[next];
                        let slot = self.code[next + 1];
                        let _ = writeln!(
                            out,
                            "{:04}    |   {} {}",
                            next,
                            if is_local == 1 { "local" } else { "upvalue" },
                            slot
                        );
                        next += 2;
                    }
                }
                next
            }
            OpCode::ForIterLocal | OpCode::ForIterKVLocal => {
                let slot = self.code[offset + 1];
                let jump = self.read_u16(offset + 2) as usize;
                let _ = writeln!(
                    out,
                    "{:<16} slot {} exit -> {}",
                    format!("{:?}", op),
                    slot,
                    offset + 4 + jump
                );
                offset + 4
            }
            OpCode::Import => {
                let path = self.read_u16(offset + 1);
                let alias = self.read_u16(offset + 3);
                let is_global = self.code[offset + 5];
                let _ = writeln!(
                    out,
                    "{:<16} {} as {} (global: {})",
                    "Import",
                    self.constant_name(path),
                    self.constant_name(alias),
                    is_global
                );
                offset + 6
            }
            OpCode::SetupTry => {
                let catch = self.read_u16(offset + 1);
                let finally = self.read_u16(offset + 3);
                let slot = self.code[offset + 5];
                let _ = writeln!(
                    out,
                    "{:<16} catch +{} finally {} var {}",
                    "SetupTry",
                    catch,
                    if finally == NO_FINALLY {
                        "-".to_string()
                    } else {
                        format!("+{}", finally)
                    },
                    if slot == NO_CATCH_SLOT {
                        "-".to_string()
                    } else {
                        slot.to_string()
                    }
                );
                offset + 6
            }
            _ => {
                let _ = writeln!(out, "{:?}", op);
                offset + 1
            }
        }
    }

    fn constant_instruction(&self, out: &mut String, name: &str, offset: usize) -> usize {
        let index = self.read_u16(offset + 1);
        let _ = writeln!(out, "{:<16} {}", name, self.constant_name(index));
        offset + 3
    }

    fn constant_name(&self, index: u16) -> String {
        match self.constants.get(index as usize) {
            Some(Constant::Str(s)) => format!("'{}'", s),
            Some(Constant::Number(n)) => format!("{}", n),
            Some(Constant::Bool(b)) => format!("{}", b),
            Some(Constant::Null) => "null".to_string(),
            Some(Constant::Function(f)) => format!("<func {}>", f.trace_name()),
            Some(Constant::Class(c)) => format!("<class {}>", c.name),
            None => format!("<bad constant {}>", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proto() -> FunctionProto {
        let mut inner = Chunk::new("lib.panda");
        inner.write_op(OpCode::Null, 1);
        inner.write_op(OpCode::Return, 1);
        let inner_proto = FunctionProto {
            name: "helper".to_string(),
            class_name: None,
            arity: 2,
            rest_param: Some("rest".to_string()),
            upvalue_count: 1,
            is_initializer: false,
            local_names: vec!["a".to_string(), "b".to_string()],
            chunk: inner,
        };

        let mut chunk = Chunk::new("lib.panda");
        let idx = chunk.add_constant(Constant::Number(3.5));
        chunk.write_op(OpCode::Const, 1);
        chunk.write_u16(idx as u16, 1);
        chunk.add_constant(Constant::Str("greeting".to_string()));
        chunk.add_constant(Constant::Bool(true));
        chunk.add_constant(Constant::Null);
        chunk.add_constant(Constant::Function(Rc::new(inner_proto)));
        chunk.add_constant(Constant::Class(Rc::new(ClassProto {
            name: "Point".to_string(),
        })));
        chunk.write_op(OpCode::Return, 2);
        chunk.exports.push("helper".to_string());

        FunctionProto {
            name: String::new(),
            class_name: None,
            arity: 0,
            rest_param: None,
            upvalue_count: 0,
            is_initializer: false,
            local_names: Vec::new(),
            chunk,
        }
    }

    #[test]
    fn serialization_round_trips_byte_identically() {
        let proto = sample_proto();
        let first = proto.serialize();
        let restored = FunctionProto::deserialize(&first).unwrap();
        let second = restored.serialize();
        assert_eq!(first, second);
    }

    #[test]
    fn round_trip_preserves_structure() {
        let proto = sample_proto();
        let restored = FunctionProto::deserialize(&proto.serialize()).unwrap();
        assert_eq!(restored.chunk.code, proto.chunk.code);
        assert_eq!(restored.chunk.lines, proto.chunk.lines);
        assert_eq!(restored.chunk.exports, proto.chunk.exports);
        assert_eq!(restored.chunk.file, proto.chunk.file);
        match &restored.chunk.constants[4] {
            Constant::Function(f) => {
                assert_eq!(f.name, "helper");
                assert_eq!(f.arity, 2);
                assert_eq!(f.rest_param.as_deref(), Some("rest"));
                assert_eq!(f.local_names, vec!["a", "b"]);
            }
            other => panic!("expected function constant, got {:?}", other),
        }
    }

    #[test]
    fn deserialize_rejects_bad_magic() {
        let err = FunctionProto::deserialize(b"XXXX\x01rest").unwrap_err();
        assert!(err.message.contains("magic"));
    }

    #[test]
    fn deserialize_rejects_unknown_version() {
        let mut bytes = sample_proto().serialize();
        bytes[4] = 99;
        let err = FunctionProto::deserialize(&bytes).unwrap_err();
        assert!(err.message.contains("version"));
    }

    #[test]
    fn deserialize_rejects_unknown_constant_tag() {
        let mut chunk = Chunk::new("x.panda");
        chunk.add_constant(Constant::Number(1.0));
        let proto = FunctionProto {
            name: String::new(),
            class_name: None,
            arity: 0,
            rest_param: None,
            upvalue_count: 0,
            is_initializer: false,
            local_names: Vec::new(),
            chunk,
        };
        let mut bytes = proto.serialize();
        // The first constant tag follows the (empty) code and line sections;
        // find it by locating the number payload and stomping its tag byte.
        let needle = 2u8;
        let pos = bytes
            .iter()
            .rposition(|&b| b == needle)
            .expect("constant tag present");
        bytes[pos] = 200;
        let err = FunctionProto::deserialize(&bytes).unwrap_err();
        assert!(err.message.contains("constant tag") || err.message.contains("truncated"));
    }

    #[test]
    fn constants_are_deduplicated() {
        let mut chunk = Chunk::new("x.panda");
        let a = chunk.add_constant(Constant::Str("hi".to_string()));
        let b = chunk.add_constant(Constant::Str("hi".to_string()));
        let c = chunk.add_constant(Constant::Number(2.0));
        let d = chunk.add_constant(Constant::Number(2.0));
        assert_eq!(a, b);
        assert_eq!(c, d);
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn no_finally_sentinel_is_outside_the_jump_range() {
        // If a legal offset could equal the sentinel, a finally block sitting
        // exactly at the boundary would silently never run.
        assert!(MAX_JUMP < NO_FINALLY as usize);
    }

    #[test]
    fn is_bytecode_sniffs_the_magic() {
        assert!(is_bytecode(b"MPBC\x01"));
        assert!(!is_bytecode(b"MPB"));
        assert!(!is_bytecode(b"var x = 1"));
    }
}
