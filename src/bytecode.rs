use std::{cell::Cell, fmt::Write};

use crate::object::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Constant,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Not,
    Negate,
    BitwiseNot,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitShiftLeft,
    BitShiftRight,
    Is,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
    StaticMethod,
    DefineOperator,
    Enum,
    EnumValue,
    Throw,
    PushExceptionHandler,
    PopExceptionHandler,
    PropagateException,
    DupTop,
    Sentinel,
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> u8 {
        value as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error(
    "Invalid byte {0} found when expecting OpCode value between 0 and {}",
    OpCode::Sentinel as u8
)]
pub struct OpCodeFromU8Error(pub u8);

impl TryFrom<u8> for OpCode {
    type Error = OpCodeFromU8Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value < OpCode::Sentinel as u8 {
            Ok(unsafe { std::mem::transmute::<u8, OpCode>(value) })
        } else {
            Err(OpCodeFromU8Error(value))
        }
    }
}

/// Constant pool capacity: operands are a single byte.
pub const MAX_CONSTANTS: usize = u8::MAX as usize + 1;

/// Marks an absent address in a `PushExceptionHandler` operand.
pub const NO_ADDRESS: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Too many constants in one chunk.")]
pub struct TooManyConstants;

#[derive(Debug, Default)]
pub struct Chunk {
    code: Vec<u8>,
    lines: Vec<usize>,
    constants: Vec<Value>,
    execution_counts: Vec<Cell<u32>>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn get_bytecode(&self, offset: usize) -> u8 {
        *self
            .code
            .get(offset)
            .expect("VM should only request valid offsets")
    }

    pub fn add_bytecode(&mut self, byte: impl Into<u8>, line: usize) {
        self.code.push(byte.into());
        self.lines.push(line);
        self.execution_counts.push(Cell::new(0));
    }

    /// Overwrites an already emitted byte, used to back-patch jump operands.
    pub fn patch(&mut self, offset: usize, byte: u8) {
        self.code[offset] = byte;
    }

    pub fn line(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or_default()
    }

    pub fn get_constant(&self, index: u8) -> Value {
        self.constants
            .get(index as usize)
            .cloned()
            .expect("VM should only request valid constants")
    }

    /// Adds `value` to the pool, reusing the slot of an identical constant.
    pub fn add_constant(&mut self, value: Value) -> Result<u8, TooManyConstants> {
        if let Some(index) = self
            .constants
            .iter()
            .position(|existing| same_constant(existing, &value))
        {
            return Ok(index as u8);
        }
        if self.constants.len() >= MAX_CONSTANTS {
            return Err(TooManyConstants);
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }

    pub fn record_execution(&self, offset: usize) {
        if let Some(count) = self.execution_counts.get(offset) {
            count.set(count.get().saturating_add(1));
        }
    }

    pub fn execution_count(&self, offset: usize) -> u32 {
        self.execution_counts
            .get(offset)
            .map(Cell::get)
            .unwrap_or_default()
    }

    pub fn disassemble(&self, name: &str) -> String {
        let mut out = format!("== {} ==\n", name);

        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(offset, &mut out);
        }
        out
    }

    /// Lists every instruction that ran at least once with its hit count.
    pub fn profile(&self, name: &str) -> String {
        let mut out = format!("== {} profile ==\n", name);

        let mut offset = 0;
        while offset < self.code.len() {
            let count = self.execution_count(offset);
            let mut line = String::new();
            let next = self.disassemble_instruction(offset, &mut line);
            if count > 0 {
                let _ = write!(out, "{:>10} {}", count, line);
            }
            offset = next;
        }
        out
    }

    pub fn disassemble_instruction(&self, offset: usize, out: &mut String) -> usize {
        let _ = write!(out, "{:04} ", offset);

        if offset > 0 && self.lines[offset] == self.lines[offset - 1] {
            out.push_str("   | ");
        } else {
            let _ = write!(out, "{:4} ", self.lines[offset]);
        }

        let instruction = self.code[offset];
        let Ok(opcode) = OpCode::try_from(instruction) else {
            let _ = writeln!(out, "Unknown opcode {}", instruction);
            return offset + 1;
        };

        match opcode {
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Method
            | OpCode::StaticMethod
            | OpCode::Enum
            | OpCode::EnumValue => self.constant_instruction(opcode, offset, out),
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call
            | OpCode::DefineOperator => self.byte_instruction(opcode, offset, out),
            OpCode::Jump | OpCode::JumpIfFalse => self.jump_instruction(opcode, 1, offset, out),
            OpCode::Loop => self.jump_instruction(opcode, -1, offset, out),
            OpCode::Invoke | OpCode::SuperInvoke => self.invoke_instruction(opcode, offset, out),
            OpCode::Class => {
                let constant = self.code[offset + 1];
                let is_final = self.code[offset + 2];
                let _ = writeln!(
                    out,
                    "{:<16} {:4} '{}'{}",
                    format!("{:?}", opcode),
                    constant,
                    self.constants[constant as usize],
                    if is_final != 0 { " final" } else { "" }
                );
                offset + 3
            }
            OpCode::Closure => {
                let constant = self.code[offset + 1];
                let function = &self.constants[constant as usize];
                let _ = writeln!(out, "{:<16} {:4} {}", "Closure", constant, function);

                let upvalue_count = match function {
                    Value::Function(function) => function.upvalues.len(),
                    _ => 0,
                };
                let mut offset = offset + 2;
                for _ in 0..upvalue_count {
                    let is_local = self.code[offset];
                    let index = self.code[offset + 1];
                    let _ = writeln!(
                        out,
                        "{:04}    |                     {} {}",
                        offset,
                        if is_local != 0 { "local" } else { "upvalue" },
                        index
                    );
                    offset += 2;
                }
                offset
            }
            OpCode::PushExceptionHandler => {
                let type_constant = self.code[offset + 1];
                let handler = self.read_short(offset + 2);
                let finally = self.read_short(offset + 4);
                let _ = write!(out, "{:<16}", "PushExceptionHandler");
                if handler != NO_ADDRESS {
                    let _ = write!(
                        out,
                        " catch '{}' -> {}",
                        self.constants[type_constant as usize], handler
                    );
                }
                if finally != NO_ADDRESS {
                    let _ = write!(out, " finally -> {}", finally);
                }
                out.push('\n');
                offset + 6
            }
            OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::Pop
            | OpCode::Equal
            | OpCode::Greater
            | OpCode::GreaterEqual
            | OpCode::Less
            | OpCode::LessEqual
            | OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Modulo
            | OpCode::Not
            | OpCode::Negate
            | OpCode::BitwiseNot
            | OpCode::BitwiseAnd
            | OpCode::BitwiseOr
            | OpCode::BitwiseXor
            | OpCode::BitShiftLeft
            | OpCode::BitShiftRight
            | OpCode::Is
            | OpCode::CloseUpvalue
            | OpCode::Return
            | OpCode::Inherit
            | OpCode::Throw
            | OpCode::PopExceptionHandler
            | OpCode::PropagateException
            | OpCode::DupTop => simple_instruction(opcode, offset, out),
            OpCode::Sentinel => panic!("Sentinel opcode should not be present in bytecode"),
        }
    }

    fn read_short(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    fn constant_instruction(&self, opcode: OpCode, offset: usize, out: &mut String) -> usize {
        let constant = self.code[offset + 1];
        let _ = writeln!(
            out,
            "{:<16} {:4} '{}'",
            format!("{:?}", opcode),
            constant,
            self.constants[constant as usize]
        );
        offset + 2
    }

    fn byte_instruction(&self, opcode: OpCode, offset: usize, out: &mut String) -> usize {
        let slot = self.code[offset + 1];
        let _ = writeln!(out, "{:<16} {:4}", format!("{:?}", opcode), slot);
        offset + 2
    }

    fn jump_instruction(&self, opcode: OpCode, sign: i64, offset: usize, out: &mut String) -> usize {
        let jump = self.read_short(offset + 1) as i64;
        let target = offset as i64 + 3 + sign * jump;
        let _ = writeln!(
            out,
            "{:<16} {:4} -> {}",
            format!("{:?}", opcode),
            offset,
            target
        );
        offset + 3
    }

    fn invoke_instruction(&self, opcode: OpCode, offset: usize, out: &mut String) -> usize {
        let constant = self.code[offset + 1];
        let arg_count = self.code[offset + 2];
        let _ = writeln!(
            out,
            "{:<16} ({} args) {:4} '{}'",
            format!("{:?}", opcode),
            arg_count,
            constant,
            self.constants[constant as usize]
        );
        offset + 3
    }
}

fn same_constant(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
        _ => a == b,
    }
}

fn simple_instruction(opcode: OpCode, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{:?}", opcode);
    offset + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Strings;

    #[test]
    fn test_opcode_round_trip_and_invalid_byte() {
        assert_eq!(OpCode::try_from(OpCode::Return as u8), Ok(OpCode::Return));
        assert_eq!(
            OpCode::try_from(OpCode::Sentinel as u8),
            Err(OpCodeFromU8Error(OpCode::Sentinel as u8))
        );
        assert_eq!(OpCode::try_from(0xEE), Err(OpCodeFromU8Error(0xEE)));
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let mut strings = Strings::new();
        let mut chunk = Chunk::new();

        let a = chunk.add_constant(Value::String(strings.intern("name"))).unwrap();
        let b = chunk.add_constant(Value::Number(1.5)).unwrap();
        let c = chunk.add_constant(Value::String(strings.intern("name"))).unwrap();
        let d = chunk.add_constant(Value::Number(1.5)).unwrap();

        assert_eq!(a, c);
        assert_eq!(b, d);
        assert_ne!(a, b);
        assert_eq!(chunk.constants().len(), 2);
    }

    #[test]
    fn test_constant_pool_limit() {
        let mut chunk = Chunk::new();
        for i in 0..MAX_CONSTANTS {
            assert_eq!(chunk.add_constant(Value::Number(i as f64)), Ok(i as u8));
        }
        assert_eq!(
            chunk.add_constant(Value::Number(MAX_CONSTANTS as f64)),
            Err(TooManyConstants)
        );
        // An existing constant is still found once the pool is full.
        assert_eq!(chunk.add_constant(Value::Number(7.0)), Ok(7));
    }

    #[test]
    fn test_disassemble() {
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::Number(1.2)).unwrap();
        chunk.add_bytecode(OpCode::Constant, 123);
        chunk.add_bytecode(constant, 123);
        chunk.add_bytecode(OpCode::Jump, 124);
        chunk.add_bytecode(0, 124);
        chunk.add_bytecode(1, 124);
        chunk.add_bytecode(OpCode::Nil, 124);
        chunk.add_bytecode(OpCode::Return, 125);

        let expected = "== test chunk ==\n\
                        0000  123 Constant            0 '1.2'\n\
                        0002  124 Jump                2 -> 6\n\
                        0005    | Nil\n\
                        0006  125 Return\n";
        assert_eq!(chunk.disassemble("test chunk"), expected);
    }

    #[test]
    fn test_execution_counts() {
        let mut chunk = Chunk::new();
        chunk.add_bytecode(OpCode::Nil, 1);
        chunk.add_bytecode(OpCode::Return, 1);

        chunk.record_execution(0);
        chunk.record_execution(0);
        chunk.record_execution(1);
        assert_eq!(chunk.execution_count(0), 2);
        assert_eq!(chunk.execution_count(1), 1);
        assert_eq!(chunk.execution_count(5), 0);

        let profile = chunk.profile("counts");
        assert!(profile.contains("         2 0000    1 Nil"));
    }
}
