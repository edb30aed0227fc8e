mod expressions;
mod function;
mod rules;
mod statements;

use std::{borrow::Cow, fmt::Display, rc::Rc};

use crate::{
    bytecode::{OpCode, NO_ADDRESS},
    object::{Function, Str, Strings, Value},
    source::SourceFile,
    tokenizer::{Token, TokenType, Tokenizer},
};

use self::function::{resolve_upvalue, FunctionCompiler, FunctionKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    End,
    Lexeme(String),
    None,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::End => write!(f, " at end"),
            Location::Lexeme(lexeme) => write!(f, " at '{}'", lexeme.escape_debug()),
            Location::None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{origin}:{line}]{location}: {message}")]
pub struct Diagnostic {
    pub origin: String,
    pub line: usize,
    pub location: Location,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl std::error::Error for CompileError {}

impl Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut diagnostics = self.diagnostics.iter();
        if let Some(first) = diagnostics.next() {
            write!(f, "{}", first)?;
        }
        for diagnostic in diagnostics {
            write!(f, "\n{}", diagnostic)?;
        }
        Ok(())
    }
}

/// Compiles a whole source unit into its top-level function.
///
/// Every error is recorded and compilation carries on to find the next one;
/// if any diagnostic was recorded the result is the complete list instead of
/// a function.
pub fn compile(source: &SourceFile, strings: &mut Strings) -> Result<Rc<Function>, CompileError> {
    log::debug!(
        "Compiling {} ({} bytes)",
        source.origin(),
        source.content().len()
    );
    let origin = strings.intern(source.origin());
    let mut compiler = Compiler::new(source.content(), origin, strings);

    compiler.advance();
    while !compiler.matches(TokenType::Eof) {
        compiler.declaration();
    }
    let function = compiler.end_function();

    if compiler.diagnostics.is_empty() {
        log::debug!("Compiled {} ({} bytes of code)", source.origin(), function.chunk.len());
        Ok(Rc::new(function))
    } else {
        log::debug!(
            "Compiling {} failed with {} diagnostics",
            source.origin(),
            compiler.diagnostics.len()
        );
        Err(CompileError {
            diagnostics: compiler.diagnostics,
        })
    }
}

#[derive(Debug)]
struct ClassCompiler {
    has_superclass: bool,
}

pub(crate) struct Compiler<'src, 's> {
    tokenizer: Tokenizer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    panic_mode: bool,
    origin: Str,
    strings: &'s mut Strings,
    functions: Vec<FunctionCompiler<'src>>,
    classes: Vec<ClassCompiler>,
    diagnostics: Vec<Diagnostic>,
}

impl<'src, 's> Compiler<'src, 's> {
    fn new(source: &'src str, origin: Str, strings: &'s mut Strings) -> Self {
        Self {
            tokenizer: Tokenizer::new(source),
            current: Token::synthetic("", 1),
            previous: Token::synthetic("", 1),
            panic_mode: false,
            origin,
            strings,
            functions: vec![FunctionCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn current(&mut self) -> &mut FunctionCompiler<'src> {
        self.functions
            .last_mut()
            .expect("compiler function stack should never be empty")
    }

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, self.tokenizer.token());

        while self.current.token_type == TokenType::Error {
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
            self.current = self.tokenizer.token();
        }
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn matches(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    /// Whether the current token is a newline and the first token after the
    /// run of newlines is `token_type`.
    fn newlines_then(&self, token_type: TokenType) -> bool {
        if !self.check(TokenType::Eol) {
            return false;
        }
        let mut lookahead = self.tokenizer.clone();
        loop {
            let token = lookahead.token();
            if token.token_type != TokenType::Eol {
                return token.token_type == token_type;
            }
        }
    }

    fn skip_newlines_before(&mut self, token_type: TokenType) {
        if self.newlines_then(token_type) {
            while self.matches(TokenType::Eol) {}
        }
    }

    fn end_statement(&mut self) {
        if !self.check(TokenType::Eof) {
            self.consume(TokenType::Eol, "Only one statement per line allowed");
        }
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token<'_>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let location = match token.token_type {
            TokenType::Eof => Location::End,
            TokenType::Error => Location::None,
            _ => Location::Lexeme(token.lexeme.to_string()),
        };
        let diagnostic = Diagnostic {
            origin: self.origin.to_string(),
            line: token.line,
            location,
            message: message.to_string(),
        };
        log::debug!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    /// Leaves panic mode, skipping tokens up to a likely statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Eol {
                return;
            }
            match self.current.token_type {
                TokenType::Class
                | TokenType::Function
                | TokenType::Var
                | TokenType::Operator
                | TokenType::For
                | TokenType::Foreach
                | TokenType::If
                | TokenType::While
                | TokenType::Throw
                | TokenType::Return
                | TokenType::Static
                | TokenType::Try
                | TokenType::Import
                | TokenType::Enum => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn emit_byte(&mut self, byte: impl Into<u8>) {
        let line = self.previous.line;
        self.current().emit(byte, line);
    }

    /// Appends raw bytes in order, all attributed to the previous token's line.
    fn emit_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.emit_byte(byte);
        }
    }

    fn emit_with_operand(&mut self, op: OpCode, operand: u8) {
        self.emit_bytes(&[op.into(), operand]);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_bytes(&[op.into(), 0xff, 0xff]);
        self.current().chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current().chunk.len() - offset - 2;
        let Ok(jump) = u16::try_from(jump) else {
            self.error("Too much code to jump over.");
            return;
        };
        let [high, low] = jump.to_be_bytes();
        let chunk = &mut self.current().chunk;
        chunk.patch(offset, high);
        chunk.patch(offset + 1, low);
    }

    /// Writes the current end of the chunk as an absolute address at `offset`.
    fn patch_address(&mut self, offset: usize) {
        let address = self.current().chunk.len();
        let address = match u16::try_from(address) {
            Ok(address) if address != NO_ADDRESS => address,
            _ => {
                self.error("Too much code to jump over.");
                return;
            }
        };
        let [high, low] = address.to_be_bytes();
        let chunk = &mut self.current().chunk;
        chunk.patch(offset, high);
        chunk.patch(offset + 1, low);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop);

        let offset = self.current().chunk.len() - loop_start + 2;
        let Ok(offset) = u16::try_from(offset) else {
            self.error("Loop body too large.");
            return;
        };
        self.emit_bytes(&offset.to_be_bytes());
    }

    fn emit_return(&mut self) {
        if self.current().kind == FunctionKind::Initializer {
            self.emit_with_operand(OpCode::GetLocal, 0);
        } else {
            self.emit_byte(OpCode::Nil);
        }
        self.emit_byte(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current().chunk.add_constant(value) {
            Ok(index) => index,
            Err(e) => {
                self.error(&e.to_string());
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_with_operand(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let name = self.strings.intern(name);
        self.make_constant(Value::String(name))
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);

        self.declare_variable();
        if self.current().scope_depth > 0 {
            return 0;
        }

        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    fn declare_variable(&mut self) {
        if self.current().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme.clone();
        if let Err(e) = self.current().declare_local(name) {
            self.error(&e.to_string());
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current().scope_depth > 0 {
            self.current().mark_initialized();
            return;
        }
        self.emit_with_operand(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: Cow<'src, str>, can_assign: bool) {
        let resolved = match self.current().resolve_local(&name) {
            Ok(Some(slot)) => Ok((OpCode::GetLocal, OpCode::SetLocal, slot)),
            Ok(None) => match resolve_upvalue(&mut self.functions, &name) {
                Ok(Some(index)) => Ok((OpCode::GetUpvalue, OpCode::SetUpvalue, index)),
                Ok(None) => {
                    let constant = self.identifier_constant(&name);
                    Ok((OpCode::GetGlobal, OpCode::SetGlobal, constant))
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let (get_op, set_op, operand) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                self.error(&e.to_string());
                return;
            }
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_with_operand(set_op, operand);
        } else if let Some(op) = can_assign.then(|| self.compound_assignment()).flatten() {
            self.emit_with_operand(get_op, operand);
            self.expression();
            self.emit_byte(op);
            self.emit_with_operand(set_op, operand);
        } else {
            self.emit_with_operand(get_op, operand);
        }
    }

    /// Consumes a compound assignment operator, returning the arithmetic it
    /// applies.
    fn compound_assignment(&mut self) -> Option<OpCode> {
        let op = match self.current.token_type {
            TokenType::PlusEqual => OpCode::Add,
            TokenType::MinusEqual => OpCode::Subtract,
            TokenType::StarEqual => OpCode::Multiply,
            TokenType::SlashEqual => OpCode::Divide,
            TokenType::PercentEqual => OpCode::Modulo,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    /// Compiles a parameter list and body into a new function, leaving a
    /// closure over it on the stack.
    fn function(&mut self, kind: FunctionKind) {
        let name = match kind {
            FunctionKind::Lambda => self.strings.intern("lambda"),
            _ => {
                let lexeme = self.previous.lexeme.clone();
                self.strings.intern(&lexeme)
            }
        };
        self.functions.push(FunctionCompiler::new(kind, Some(name)));
        self.current().begin_scope();

        let close = if kind == FunctionKind::Lambda {
            TokenType::LambdaArgsClose
        } else {
            self.consume(TokenType::LeftParen, "Expect '(' after function name.");
            TokenType::RightParen
        };
        if !self.check(close) {
            loop {
                self.matches(TokenType::Eol);
                self.current().arity += 1;
                if self.current().arity > u8::MAX as usize {
                    self.error_at_current("Cannot have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.matches(TokenType::Eol);
        self.consume(close, "Expect ')' after parameters.");
        self.matches(TokenType::Eol);
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let function = self.end_function();
        let upvalues = function.upvalues.clone();
        let constant = self.make_constant(Value::Function(Rc::new(function)));
        self.emit_with_operand(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_bytes(&[upvalue.is_local.into(), upvalue.index]);
        }
    }

    fn end_function(&mut self) -> Function {
        self.emit_return();
        let compiler = self
            .functions
            .pop()
            .expect("compiler function stack should never be empty");
        compiler.finish(self.origin.clone())
    }
}
