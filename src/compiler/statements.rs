use std::borrow::Cow;

use crate::{
    bytecode::OpCode,
    object::{Operator, Value},
    tokenizer::TokenType,
};

use super::{
    expressions::parse_number,
    function::{FunctionKind, LoopContext},
    ClassCompiler, Compiler,
};

impl<'src, 's> Compiler<'src, 's> {
    pub(super) fn declaration(&mut self) {
        if self.matches(TokenType::Eol) {
            // Blank line.
        } else if self.matches(TokenType::Class) {
            self.class_declaration();
        } else if self.matches(TokenType::Function) {
            self.function_declaration();
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
            self.end_statement();
        } else if self.matches(TokenType::Enum) {
            self.enum_declaration();
        } else if self.matches(TokenType::Semicolon) {
            self.error("Unexpected ';'");
        } else if self.matches(TokenType::Import) {
            self.error("Module imports are not supported.");
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::Foreach) {
            self.foreach_statement();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::Try) {
            self.try_statement();
        } else if self.matches(TokenType::Throw) {
            self.throw_statement();
        } else if self.matches(TokenType::Next) {
            self.next_statement();
        } else if self.matches(TokenType::Break) {
            self.break_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.current().begin_scope();
            self.block();
            let line = self.previous.line;
            self.current().end_scope(line);
        } else {
            self.expression_statement();
        }
    }

    pub(super) fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn end_scope(&mut self) {
        let line = self.previous.line;
        self.current().end_scope(line);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil);
        }

        self.define_variable(global);
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.current().mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        let is_final = self.matches(TokenType::Final);
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_bytes(&[OpCode::Class.into(), name_constant, is_final.into()]);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.matches(TokenType::Colon) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);

            if class_name == self.previous.lexeme {
                self.error("A class cannot inherit from itself.");
            }

            self.current().begin_scope();
            if let Err(e) = self.current().add_local(Cow::Borrowed("super")) {
                self.error(&e.to_string());
            }
            self.define_variable(0);

            self.named_variable(class_name.clone(), false);
            self.emit_byte(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.matches(TokenType::Eol);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if self.matches(TokenType::Eol) {
                continue;
            }
            if self.matches(TokenType::Operator) {
                self.operator_declaration();
            } else {
                self.method();
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop);

        if self
            .classes
            .pop()
            .is_some_and(|class| class.has_superclass)
        {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        let mut is_static = false;
        loop {
            match self.current.token_type {
                TokenType::Public | TokenType::Private | TokenType::Protected => self.advance(),
                TokenType::Static => {
                    is_static = true;
                    self.advance();
                }
                _ => break,
            }
        }

        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&name);

        let kind = if name == "init" {
            if is_static {
                self.error("Initializer cannot be static.");
            }
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        let op = if is_static {
            OpCode::StaticMethod
        } else {
            OpCode::Method
        };
        self.emit_with_operand(op, constant);
    }

    fn operator_declaration(&mut self) {
        let operator = match self.current.token_type {
            TokenType::Plus => Operator::Add,
            TokenType::Minus => Operator::Subtract,
            TokenType::Star => Operator::Multiply,
            TokenType::Slash => Operator::Divide,
            TokenType::Percent => Operator::Modulo,
            TokenType::EqualEqual => Operator::Equal,
            TokenType::Less => Operator::Less,
            TokenType::LessEqual => Operator::LessEqual,
            TokenType::Greater => Operator::Greater,
            TokenType::GreaterEqual => Operator::GreaterEqual,
            _ => {
                self.error_at_current("Expect overloadable operator after 'operator'.");
                return;
            }
        };
        self.advance();

        self.function(FunctionKind::Method);
        self.emit_with_operand(OpCode::DefineOperator, operator as u8);
    }

    fn enum_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect enum name.");
        let name = self.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&name);
        self.declare_variable();

        self.emit_with_operand(OpCode::Enum, name_constant);
        self.matches(TokenType::Eol);
        self.consume(TokenType::LeftBrace, "Expect '{' before enum body.");

        let mut value: f64 = -1.0;
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if self.matches(TokenType::Eol) {
                continue;
            }

            self.consume(TokenType::Identifier, "Expect enum value name.");
            let member = self.previous.lexeme.clone();
            let member = self.identifier_constant(&member);

            if self.matches(TokenType::Equal) {
                let negative = self.matches(TokenType::Minus);
                self.consume(TokenType::Number, "Expect an integer enum value.");
                match parse_number(&self.previous.lexeme) {
                    Some(number) if number.fract() == 0.0 => {
                        value = if negative { -number } else { number };
                    }
                    _ => self.error("Expect an integer enum value."),
                }
            } else {
                value += 1.0;
            }
            self.emit_constant(Value::Number(value));
            self.emit_with_operand(OpCode::EnumValue, member);

            self.matches(TokenType::Eol);
            if !self.matches(TokenType::Comma) && !self.check(TokenType::RightBrace) {
                self.error_at_current("Expect ',' between enum values.");
                break;
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after enum body.");

        self.define_variable(name_constant);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit_byte(OpCode::Pop);
        self.end_statement();
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop);

        self.skip_newlines_before(TokenType::Else);
        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current().chunk.len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop);

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.current().begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenType::Semicolon) {
            // No initializer.
        } else {
            if self.matches(TokenType::Var) {
                self.var_declaration();
            } else {
                self.expression();
                self.emit_byte(OpCode::Pop);
            }
            self.consume(TokenType::Semicolon, "Expect ';' after loop initializer.");
        }

        let mut loop_start = self.current().chunk.len();
        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_byte(OpCode::Pop);
        }

        if !self.matches(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current().chunk.len();
            self.expression();
            self.emit_byte(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_byte(OpCode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    /// `foreach (var x in items) body` drives the iterator protocol:
    /// `items.iterator()`, then `has_next?()` and `get_next()` on the result.
    fn foreach_statement(&mut self) {
        self.current().begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'foreach'.");
        self.consume(TokenType::Var, "Expect 'var' after '('.");
        self.parse_variable("Expect loop variable name.");
        self.emit_byte(OpCode::Nil);
        self.define_variable(0);
        let variable_slot = (self.current().locals.len() - 1) as u8;

        self.consume(TokenType::In, "Expect 'in' after loop variable.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after foreach clauses.");

        let iterator = self.identifier_constant("iterator");
        self.emit_bytes(&[OpCode::Invoke.into(), iterator, 0]);
        if let Err(e) = self.current().add_local(Cow::Borrowed("")) {
            self.error(&e.to_string());
        }
        self.current().mark_initialized();
        let iterator_slot = (self.current().locals.len() - 1) as u8;

        let loop_start = self.current().chunk.len();
        let has_next = self.identifier_constant("has_next?");
        self.emit_with_operand(OpCode::GetLocal, iterator_slot);
        self.emit_bytes(&[OpCode::Invoke.into(), has_next, 0]);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop);

        let get_next = self.identifier_constant("get_next");
        self.emit_with_operand(OpCode::GetLocal, iterator_slot);
        self.emit_bytes(&[OpCode::Invoke.into(), get_next, 0]);
        self.emit_with_operand(OpCode::SetLocal, variable_slot);
        self.emit_byte(OpCode::Pop);

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop);
        self.end_loop();
        self.end_scope();
    }

    fn begin_loop(&mut self, start: usize) {
        let current = self.current();
        let context = LoopContext {
            start,
            scope_depth: current.scope_depth,
            handler_depth: current.handler_depth,
            breaks: Vec::new(),
        };
        current.loops.push(context);
    }

    fn end_loop(&mut self) {
        if let Some(context) = self.current().loops.pop() {
            for jump in context.breaks {
                self.patch_jump(jump);
            }
        }
    }

    /// Unwinds everything the innermost loop's body installed, returning
    /// where `next` should jump to.
    fn exit_loop_body(&mut self, keyword: &str) -> Option<usize> {
        let Some(context) = self.current().loops.last() else {
            self.error(&format!("Can't use '{}' outside of a loop.", keyword));
            return None;
        };
        let (start, scope_depth, handler_depth) =
            (context.start, context.scope_depth, context.handler_depth);

        let line = self.previous.line;
        let current = self.current();
        for _ in handler_depth..current.handler_depth {
            current.emit(OpCode::PopExceptionHandler, line);
        }
        current.discard_locals(scope_depth, line);
        Some(start)
    }

    fn next_statement(&mut self) {
        if let Some(start) = self.exit_loop_body("next") {
            self.emit_loop(start);
        }
        self.end_statement();
    }

    fn break_statement(&mut self) {
        if self.exit_loop_body("break").is_some() {
            let jump = self.emit_jump(OpCode::Jump);
            if let Some(context) = self.current().loops.last_mut() {
                context.breaks.push(jump);
            }
        }
        self.end_statement();
    }

    fn return_statement(&mut self) {
        if self.current().kind == FunctionKind::Script {
            self.error("Cannot return from top-level code.");
        }

        if self.check(TokenType::Eol)
            || self.check(TokenType::Eof)
            || self.check(TokenType::RightBrace)
        {
            self.emit_return();
        } else {
            if self.current().kind == FunctionKind::Initializer {
                self.error("Cannot return a value from an initializer.");
            }
            self.expression();
            self.emit_byte(OpCode::Return);
        }
        if !self.check(TokenType::RightBrace) {
            self.end_statement();
        }
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.emit_byte(OpCode::Throw);
        self.end_statement();
    }

    /// `try body [catch (Type [as name]) handler] [finally cleanup]`.
    ///
    /// The handler record carries the catch type, the catch address and the
    /// finally address. The finally block expects two values on the stack: a
    /// pending exception and a flag saying whether it must be rethrown.
    fn try_statement(&mut self) {
        self.emit_byte(OpCode::PushExceptionHandler);
        let operands = self.current().chunk.len();
        self.emit_bytes(&[0, 0xff, 0xff, 0xff, 0xff]);

        self.current().handler_depth += 1;
        self.statement();
        self.current().handler_depth -= 1;
        self.emit_byte(OpCode::PopExceptionHandler);
        let success_jump = self.emit_jump(OpCode::Jump);

        self.skip_newlines_before(TokenType::Catch);
        let has_catch = self.matches(TokenType::Catch);
        if has_catch {
            self.current().begin_scope();
            self.consume(TokenType::LeftParen, "Expect '(' after 'catch'.");
            self.consume(TokenType::Identifier, "Expect type name to catch.");
            let type_name = self.previous.lexeme.clone();
            let type_constant = self.identifier_constant(&type_name);
            self.current().chunk.patch(operands, type_constant);
            self.patch_address(operands + 1);

            // The VM pushes the exception before jumping here.
            let name = if self.matches(TokenType::As) {
                self.consume(TokenType::Identifier, "Expect exception variable name.");
                self.previous.lexeme.clone()
            } else {
                Cow::Borrowed("")
            };
            if let Err(e) = self.current().declare_local(name) {
                self.error(&e.to_string());
            }
            self.current().mark_initialized();
            self.consume(TokenType::RightParen, "Expect ')' after catch clause.");

            self.current().handler_depth += 1;
            self.statement();
            self.current().handler_depth -= 1;
            self.emit_byte(OpCode::PopExceptionHandler);
            self.end_scope();
        }
        self.patch_jump(success_jump);

        self.skip_newlines_before(TokenType::Finally);
        if self.matches(TokenType::Finally) {
            self.emit_bytes(&[OpCode::Nil.into(), OpCode::False.into()]);
            self.patch_address(operands + 3);

            // The pending exception and whether to rethrow it.
            self.current().begin_scope();
            for _ in 0..2 {
                if let Err(e) = self.current().add_local(Cow::Borrowed("")) {
                    self.error(&e.to_string());
                }
                self.current().mark_initialized();
            }
            self.statement();
            self.emit_byte(OpCode::PropagateException);
            self.current().forget_scope();
        } else if !has_catch {
            self.error("Expect 'catch' or 'finally' after 'try' block.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::{
        compiler::{compile, CompileError},
        object::{Function, Strings},
        source::SourceFile,
    };

    use super::*;

    fn compile_str(source: &str) -> Result<Rc<Function>, CompileError> {
        let mut strings = Strings::new();
        compile(&SourceFile::new("test.cmt", source), &mut strings)
    }

    #[test]
    fn test_control_flow_compiles() {
        let source = r#"
var total = 0
for (var i = 0; i < 10; i += 1) {
    if (i % 2 == 0) {
        next
    }
    else {
        total += i
    }
    if (total > 20) break
}
while (total > 0) total -= 1
"#;
        assert!(compile_str(source).is_ok());
    }

    #[test]
    fn test_while_loop_shape() {
        let function = compile_str("while (false) {\n}").unwrap();
        assert_eq!(
            function.chunk.code(),
            &[
                OpCode::False as u8,
                OpCode::JumpIfFalse as u8,
                0,
                4,
                OpCode::Pop as u8,
                OpCode::Loop as u8,
                0,
                8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn test_break_pops_loop_locals() {
        let function = compile_str("while (true) {\nvar a = 1\nbreak\n}").unwrap();
        let code = function.chunk.code();
        // True, JumpIfFalse, Pop, then `var a` and the `break` popping it.
        assert_eq!(code[5], OpCode::Constant as u8);
        assert_eq!(code[7], OpCode::Pop as u8);
        assert_eq!(code[8], OpCode::Jump as u8);
    }

    #[test]
    fn test_try_handler_operands() {
        let function = compile_str("try {\n} catch (Error as e) {\n} finally {\n}").unwrap();
        let code = function.chunk.code();
        assert_eq!(code[0], OpCode::PushExceptionHandler as u8);
        let catch_address = u16::from_be_bytes([code[2], code[3]]) as usize;
        let finally_address = u16::from_be_bytes([code[4], code[5]]) as usize;
        assert!(catch_address < finally_address);
        assert_eq!(code[finally_address - 2], OpCode::Nil as u8);
        assert_eq!(code[finally_address - 1], OpCode::False as u8);
        assert_eq!(
            function.chunk.get_constant(code[1]).to_string(),
            "Error"
        );
    }

    #[test]
    fn test_enum_and_class_declarations_compile() {
        let source = r#"
enum Color {
    Red,
    Green = 5,
    Blue
}
class final Point : Base {
    init(x, y) {
        self.x = x
        self.y = y
    }
    public static origin() {
        return Point(0, 0)
    }
    operator + (other) {
        return Point(self.x + other.x, self.y + other.y)
    }
}
"#;
        assert!(compile_str(source).is_ok());
    }

    #[test]
    fn test_synchronize_stops_at_statement_keyword() {
        // Recovery skips to `var`, which then parses cleanly.
        let error = compile_str("1 + ) var a = 1").unwrap_err();
        assert_eq!(error.diagnostics.len(), 1);
        assert_eq!(error.diagnostics[0].message, "Expect expression.");
    }
}
