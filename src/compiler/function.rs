use std::borrow::Cow;

use crate::{
    bytecode::{Chunk, OpCode},
    object::{Function, Str, UpvalueDescriptor},
};

/// Slot and upvalue indices are single bytes.
pub(super) const MAX_LOCALS: usize = u8::MAX as usize + 1;
pub(super) const MAX_UPVALUES: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FunctionKind {
    Script,
    Function,
    Lambda,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(super) enum ScopeError {
    #[error("Too many local variables in function.")]
    TooManyLocals,
    #[error("Too many closure variables in the function.")]
    TooManyUpvalues,
    #[error("Variable with this name already declared in this scope.")]
    AlreadyDeclared,
    #[error("Cannot read local variable in its own initializer.")]
    OwnInitializer,
}

#[derive(Debug)]
pub(super) struct Local<'src> {
    pub name: Cow<'src, str>,
    /// `None` while the variable's initializer is still being compiled.
    pub depth: Option<usize>,
    pub is_captured: bool,
}

#[derive(Debug)]
pub(super) struct LoopContext {
    /// Where `next` jumps back to.
    pub start: usize,
    pub scope_depth: usize,
    /// Handlers installed inside the function when the loop was entered.
    pub handler_depth: usize,
    /// Forward jumps emitted by `break`, patched once the loop ends.
    pub breaks: Vec<usize>,
}

/// Per-function compilation state. The compiler keeps these on a stack,
/// innermost function last.
#[derive(Debug)]
pub(super) struct FunctionCompiler<'src> {
    pub kind: FunctionKind,
    pub name: Option<Str>,
    pub arity: usize,
    pub chunk: Chunk,
    pub locals: Vec<Local<'src>>,
    pub upvalues: Vec<UpvalueDescriptor>,
    pub scope_depth: usize,
    pub loops: Vec<LoopContext>,
    /// Exception handlers the VM will have installed at this point of the body.
    pub handler_depth: usize,
}

impl<'src> FunctionCompiler<'src> {
    pub fn new(kind: FunctionKind, name: Option<Str>) -> Self {
        // Slot zero holds the callee, or the receiver inside methods.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "self",
            _ => "",
        };

        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: Cow::Borrowed(slot_zero),
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            handler_depth: 0,
        }
    }

    pub fn emit(&mut self, byte: impl Into<u8>, line: usize) {
        self.chunk.add_bytecode(byte, line);
    }

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    /// Closes the innermost scope, unwinding its locals from the last
    /// declared to the first.
    pub fn end_scope(&mut self, line: usize) {
        self.scope_depth -= 1;

        while let Some(local) = self.locals.last() {
            if local.depth.is_some_and(|depth| depth <= self.scope_depth) {
                break;
            }
            let op = if local.is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            self.emit(op, line);
            self.locals.pop();
        }
    }

    /// Closes the innermost scope without emitting anything, for locals an
    /// instruction has already consumed.
    pub fn forget_scope(&mut self) {
        self.scope_depth -= 1;
        let depth = self.scope_depth;
        while self
            .locals
            .last()
            .is_some_and(|local| local.depth.map_or(true, |d| d > depth))
        {
            self.locals.pop();
        }
    }

    /// Emits the unwinding for every local deeper than `depth` without
    /// forgetting them, for jumps that leave scopes early.
    pub fn discard_locals(&mut self, depth: usize, line: usize) {
        let ops: Vec<OpCode> = self
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d > depth))
            .map(|local| {
                if local.is_captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit(op, line);
        }
    }

    pub fn add_local(&mut self, name: Cow<'src, str>) -> Result<(), ScopeError> {
        if self.locals.len() == MAX_LOCALS {
            return Err(ScopeError::TooManyLocals);
        }
        self.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
        Ok(())
    }

    /// Adds a local for `name` unless the innermost scope already has one.
    pub fn declare_local(&mut self, name: Cow<'src, str>) -> Result<(), ScopeError> {
        for local in self.locals.iter().rev() {
            if local.depth.is_some_and(|depth| depth < self.scope_depth) {
                break;
            }
            if local.name == name {
                return Err(ScopeError::AlreadyDeclared);
            }
        }
        self.add_local(name)
    }

    pub fn mark_initialized(&mut self) {
        if self.scope_depth == 0 {
            return;
        }
        let depth = self.scope_depth;
        if let Some(local) = self.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    pub fn resolve_local(&self, name: &str) -> Result<Option<u8>, ScopeError> {
        for (slot, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    return Err(ScopeError::OwnInitializer);
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    pub fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, ScopeError> {
        let upvalue = UpvalueDescriptor { is_local, index };
        if let Some(existing) = self.upvalues.iter().position(|u| *u == upvalue) {
            return Ok(existing as u8);
        }
        if self.upvalues.len() == MAX_UPVALUES {
            return Err(ScopeError::TooManyUpvalues);
        }
        self.upvalues.push(upvalue);
        Ok((self.upvalues.len() - 1) as u8)
    }

    pub fn finish(self, origin: Str) -> Function {
        Function::new(
            self.name,
            self.arity as u8,
            self.chunk,
            self.upvalues,
            origin,
        )
    }
}

/// Resolves `name` as an upvalue of the innermost function in `chain`,
/// threading it through every intermediate function.
pub(super) fn resolve_upvalue(
    chain: &mut [FunctionCompiler<'_>],
    name: &str,
) -> Result<Option<u8>, ScopeError> {
    let Some((current, enclosing)) = chain.split_last_mut() else {
        return Ok(None);
    };
    let Some(parent) = enclosing.last_mut() else {
        return Ok(None);
    };

    if let Some(local) = parent.resolve_local(name)? {
        parent.locals[local as usize].is_captured = true;
        return current.add_upvalue(local, true).map(Some);
    }

    match resolve_upvalue(enclosing, name)? {
        Some(upvalue) => current.add_upvalue(upvalue, false).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_named(compiler: &mut FunctionCompiler<'static>, name: &'static str) {
        compiler.declare_local(Cow::Borrowed(name)).unwrap();
        compiler.mark_initialized();
    }

    #[test]
    fn test_slot_zero_is_reserved() {
        let script = FunctionCompiler::new(FunctionKind::Script, None);
        assert_eq!(script.locals.len(), 1);
        assert_eq!(script.locals[0].name, "");

        let method = FunctionCompiler::new(FunctionKind::Method, None);
        assert_eq!(method.resolve_local("self"), Ok(Some(0)));
    }

    #[test]
    fn test_end_scope_unwinds_in_reverse_order() {
        let mut compiler = FunctionCompiler::new(FunctionKind::Script, None);
        compiler.begin_scope();
        local_named(&mut compiler, "a");
        local_named(&mut compiler, "b");
        local_named(&mut compiler, "c");
        compiler.locals[1].is_captured = true;

        compiler.end_scope(1);

        assert_eq!(
            compiler.chunk.code(),
            &[
                OpCode::Pop as u8,
                OpCode::Pop as u8,
                OpCode::CloseUpvalue as u8
            ]
        );
        assert_eq!(compiler.scope_depth, 0);
        assert_eq!(compiler.locals.len(), 1);
    }

    #[test]
    fn test_discard_locals_keeps_locals_declared() {
        let mut compiler = FunctionCompiler::new(FunctionKind::Function, None);
        compiler.begin_scope();
        local_named(&mut compiler, "outer");
        compiler.begin_scope();
        local_named(&mut compiler, "inner");
        local_named(&mut compiler, "other");

        compiler.discard_locals(1, 1);

        assert_eq!(compiler.chunk.code(), &[OpCode::Pop as u8, OpCode::Pop as u8]);
        assert_eq!(compiler.locals.len(), 4);
    }

    #[test]
    fn test_forget_scope_emits_nothing() {
        let mut compiler = FunctionCompiler::new(FunctionKind::Function, None);
        compiler.begin_scope();
        local_named(&mut compiler, "kept");
        compiler.begin_scope();
        local_named(&mut compiler, "consumed");

        compiler.forget_scope();

        assert!(compiler.chunk.is_empty());
        assert_eq!(compiler.scope_depth, 1);
        assert_eq!(compiler.locals.len(), 2);
        assert_eq!(compiler.locals[1].name, "kept");
    }

    #[test]
    fn test_redeclaration_in_same_scope() {
        let mut compiler = FunctionCompiler::new(FunctionKind::Function, None);
        compiler.begin_scope();
        local_named(&mut compiler, "a");
        assert_eq!(
            compiler.declare_local(Cow::Borrowed("a")),
            Err(ScopeError::AlreadyDeclared)
        );

        compiler.begin_scope();
        assert_eq!(compiler.declare_local(Cow::Borrowed("a")), Ok(()));
    }

    #[test]
    fn test_reading_uninitialized_local() {
        let mut compiler = FunctionCompiler::new(FunctionKind::Function, None);
        compiler.begin_scope();
        compiler.declare_local(Cow::Borrowed("a")).unwrap();
        assert_eq!(compiler.resolve_local("a"), Err(ScopeError::OwnInitializer));
        compiler.mark_initialized();
        assert_eq!(compiler.resolve_local("a"), Ok(Some(1)));
    }

    #[test]
    fn test_too_many_locals() {
        let mut compiler = FunctionCompiler::new(FunctionKind::Function, None);
        compiler.begin_scope();
        for _ in 1..MAX_LOCALS {
            compiler.add_local(Cow::Borrowed("x")).unwrap();
        }
        assert_eq!(
            compiler.add_local(Cow::Borrowed("x")),
            Err(ScopeError::TooManyLocals)
        );
    }

    #[test]
    fn test_upvalues_thread_through_enclosing_functions() {
        let mut outer = FunctionCompiler::new(FunctionKind::Function, None);
        outer.begin_scope();
        local_named(&mut outer, "captured");
        let middle = FunctionCompiler::new(FunctionKind::Function, None);
        let inner = FunctionCompiler::new(FunctionKind::Function, None);
        let mut chain = vec![outer, middle, inner];

        assert_eq!(resolve_upvalue(&mut chain, "captured"), Ok(Some(0)));
        // Resolving again reuses the same upvalue.
        assert_eq!(resolve_upvalue(&mut chain, "captured"), Ok(Some(0)));
        assert_eq!(resolve_upvalue(&mut chain, "missing"), Ok(None));

        assert!(chain[0].locals[1].is_captured);
        assert_eq!(
            chain[1].upvalues,
            vec![UpvalueDescriptor {
                is_local: true,
                index: 1
            }]
        );
        assert_eq!(
            chain[2].upvalues,
            vec![UpvalueDescriptor {
                is_local: false,
                index: 0
            }]
        );
    }
}
