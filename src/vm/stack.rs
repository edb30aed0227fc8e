use std::fmt::Display;

use crate::object::Value;

use super::RuntimeError;

pub const MAX_STACK_SIZE: usize = super::FRAMES_MAX * 256;

#[derive(Debug)]
pub struct Stack {
    storage: Vec<Value>,
}

impl Stack {
    pub fn new() -> Self {
        Stack {
            storage: Vec::with_capacity(256),
        }
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.storage.len() >= MAX_STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        self.storage.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.storage
            .pop()
            .expect("VM shouldn't underflow the Stack")
    }

    pub fn peek(&self, distance: usize) -> &Value {
        &self.storage[self.storage.len() - 1 - distance]
    }

    /// Replaces the value `distance` slots below the top.
    pub fn set_from_top(&mut self, distance: usize, value: Value) {
        let index = self.storage.len() - 1 - distance;
        self.storage[index] = value;
    }

    pub fn get(&self, slot: usize) -> &Value {
        &self.storage[slot]
    }

    pub fn set(&mut self, slot: usize, value: Value) {
        self.storage[slot] = value;
    }

    /// The topmost `count` values, deepest first.
    pub fn top(&self, count: usize) -> &[Value] {
        &self.storage[self.storage.len() - count..]
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn truncate(&mut self, len: usize) {
        self.storage.truncate(len);
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }
}

impl Display for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "          ")?;
        for value in self.storage.iter() {
            write!(f, "[ {} ]", value)?;
        }
        Ok(())
    }
}
