use std::rc::Rc;

use crate::{bytecode::Chunk, object::Closure, object::Value};

/// One active function invocation.
#[derive(Debug)]
pub struct CallFrame {
    pub closure: Rc<Closure>,
    pub ip: usize,
    /// Stack index of the frame's slot zero.
    pub slots: usize,
}

impl CallFrame {
    pub fn new(closure: Rc<Closure>, slots: usize) -> Self {
        Self {
            closure,
            ip: 0,
            slots,
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.closure.function.chunk
    }

    pub fn read_byte(&mut self) -> u8 {
        let byte = self.closure.function.chunk.get_bytecode(self.ip);
        self.ip += 1;
        byte
    }

    pub fn read_short(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from_be_bytes([high, low])
    }

    pub fn read_constant(&mut self) -> Value {
        let index = self.read_byte();
        self.closure.function.chunk.get_constant(index)
    }

    /// Source line of the instruction currently executing.
    pub fn line(&self) -> usize {
        self.chunk().line(self.ip.saturating_sub(1))
    }
}
