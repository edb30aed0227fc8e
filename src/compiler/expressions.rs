use std::borrow::Cow;

use crate::{bytecode::OpCode, object::Value, tokenizer::TokenType};

use super::{function::FunctionKind, rules::Precedence, Compiler};

impl<'src, 's> Compiler<'src, 's> {
    pub(super) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    pub(super) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.token_type).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.token_type).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.token_type).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && (self.matches(TokenType::Equal) || self.compound_assignment().is_some()) {
            self.error("Invalid assignment target.");
        }
    }

    pub(super) fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    pub(super) fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_with_operand(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.matches(TokenType::Eol);
                self.expression();
                if arg_count == u8::MAX as usize {
                    self.error("Cannot have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.matches(TokenType::Eol);
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        arg_count as u8
    }

    pub(super) fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let name = self.identifier_constant(&name);

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_with_operand(OpCode::SetProperty, name);
        } else if let Some(op) = can_assign.then(|| self.compound_assignment()).flatten() {
            self.emit_byte(OpCode::DupTop);
            self.emit_with_operand(OpCode::GetProperty, name);
            self.expression();
            self.emit_byte(op);
            self.emit_with_operand(OpCode::SetProperty, name);
        } else if self.matches(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_bytes(&[OpCode::Invoke.into(), name, arg_count]);
        } else {
            self.emit_with_operand(OpCode::GetProperty, name);
        }
    }

    pub(super) fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.token_type;
        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenType::Minus => self.emit_byte(OpCode::Negate),
            TokenType::Bang => self.emit_byte(OpCode::Not),
            TokenType::BitwiseNot => self.emit_byte(OpCode::BitwiseNot),
            _ => unreachable!(),
        }
    }

    pub(super) fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.token_type;
        let rule = Self::rule(operator);
        self.parse_precedence(rule.precedence.higher());

        match operator {
            TokenType::BangEqual => self.emit_bytes(&[OpCode::Equal.into(), OpCode::Not.into()]),
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal),
            TokenType::Greater => self.emit_byte(OpCode::Greater),
            TokenType::GreaterEqual => self.emit_byte(OpCode::GreaterEqual),
            TokenType::Less => self.emit_byte(OpCode::Less),
            TokenType::LessEqual => self.emit_byte(OpCode::LessEqual),
            TokenType::Plus => self.emit_byte(OpCode::Add),
            TokenType::Minus => self.emit_byte(OpCode::Subtract),
            TokenType::Star => self.emit_byte(OpCode::Multiply),
            TokenType::Slash => self.emit_byte(OpCode::Divide),
            TokenType::Percent => self.emit_byte(OpCode::Modulo),
            TokenType::VBar => self.emit_byte(OpCode::BitwiseOr),
            TokenType::BitwiseAnd => self.emit_byte(OpCode::BitwiseAnd),
            TokenType::BitwiseXor => self.emit_byte(OpCode::BitwiseXor),
            TokenType::BitShiftLeft => self.emit_byte(OpCode::BitShiftLeft),
            TokenType::BitShiftRight => self.emit_byte(OpCode::BitShiftRight),
            _ => unreachable!(),
        }
    }

    pub(super) fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_byte(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    pub(super) fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_byte(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    pub(super) fn ternary(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.consume(TokenType::Colon, "Expect ':' after then branch of conditional operator.");

        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_byte(OpCode::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    pub(super) fn is(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Is.higher());
        self.emit_byte(OpCode::Is);
    }

    pub(super) fn number(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme.clone();
        match parse_number(&lexeme) {
            Some(number) => self.emit_constant(Value::Number(number)),
            None => self.error("Invalid number literal."),
        }
    }

    pub(super) fn string(&mut self, _can_assign: bool) {
        let content = unescape(&self.previous.lexeme);
        let string = self.strings.intern(&content);
        self.emit_constant(Value::String(string));
    }

    pub(super) fn filename(&mut self, _can_assign: bool) {
        self.emit_constant(Value::String(self.origin.clone()));
    }

    pub(super) fn literal(&mut self, _can_assign: bool) {
        match self.previous.token_type {
            TokenType::False => self.emit_byte(OpCode::False),
            TokenType::True => self.emit_byte(OpCode::True),
            TokenType::Nil => self.emit_byte(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    pub(super) fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(name, can_assign);
    }

    pub(super) fn self_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Cannot use 'self' outside of a class.");
            return;
        }
        self.named_variable(Cow::Borrowed("self"), false);
    }

    pub(super) fn super_(&mut self, _can_assign: bool) {
        match self.classes.last().map(|class| class.has_superclass) {
            None => self.error("Cannot use 'super' outside of a class."),
            Some(false) => self.error("Cannot use 'super' in a class with no superclass."),
            Some(true) => {}
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.clone();
        let name = self.identifier_constant(&name);

        self.named_variable(Cow::Borrowed("self"), false);
        if self.matches(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Cow::Borrowed("super"), false);
            self.emit_bytes(&[OpCode::SuperInvoke.into(), name, arg_count]);
        } else {
            self.named_variable(Cow::Borrowed("super"), false);
            self.emit_with_operand(OpCode::GetSuper, name);
        }
    }

    pub(super) fn lambda(&mut self, _can_assign: bool) {
        self.function(FunctionKind::Lambda);
    }
}

/// Parses a number lexeme: decimal with optional `_` separators, or `0x` hex.
pub(super) fn parse_number(lexeme: &str) -> Option<f64> {
    let digits: String = lexeme.chars().filter(|&c| c != '_').collect();
    if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    digits.parse().ok()
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42"), Some(42.0));
        assert_eq!(parse_number("3.25"), Some(3.25));
        assert_eq!(parse_number("1_000_000"), Some(1_000_000.0));
        assert_eq!(parse_number("0xff"), Some(255.0));
        assert_eq!(parse_number("0XFF"), Some(255.0));
        assert_eq!(parse_number("0x"), None);
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"plain"), "plain");
        assert_eq!(unescape(r"a\nb\tc"), "a\nb\tc");
        assert_eq!(unescape(r#"say \"hi\" it\'s"#), "say \"hi\" it's");
        assert_eq!(unescape(r"back\\slash"), "back\\slash");
        assert_eq!(unescape(r"\q"), "\\q");
    }
}
