use crate::tokenizer::TokenType;

use super::Compiler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Precedence {
    None,
    Assignment, // = += -= *= /= %=
    Ternary,    // ?:
    Or,         // ||
    And,        // &&
    Equality,   // == !=
    BitShift,   // << >>
    Xor,        // ^
    BitwiseOr,  // |
    BitwiseAnd, // &
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! - ~
    Is,         // is
    Call,       // . ()
    Primary,
}

impl Precedence {
    pub fn higher(&self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::BitShift,
            Precedence::BitShift => Precedence::Xor,
            Precedence::Xor => Precedence::BitwiseOr,
            Precedence::BitwiseOr => Precedence::BitwiseAnd,
            Precedence::BitwiseAnd => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Is,
            Precedence::Is => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

pub(super) type ParseFn<'src, 's> = fn(&mut Compiler<'src, 's>, bool);

pub(super) struct ParseRule<'src, 's> {
    pub prefix: Option<ParseFn<'src, 's>>,
    pub infix: Option<ParseFn<'src, 's>>,
    pub precedence: Precedence,
}

impl<'src, 's> ParseRule<'src, 's> {
    fn new(
        prefix: Option<ParseFn<'src, 's>>,
        infix: Option<ParseFn<'src, 's>>,
        precedence: Precedence,
    ) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

impl<'src, 's> Compiler<'src, 's> {
    pub(super) fn rule(token_type: TokenType) -> ParseRule<'src, 's> {
        use Precedence as P;

        match token_type {
            TokenType::LeftParen => {
                ParseRule::new(Some(Self::grouping), Some(Self::call), P::Call)
            }
            TokenType::LambdaArgsOpen => ParseRule::new(Some(Self::lambda), None, P::None),
            TokenType::Dot => ParseRule::new(None, Some(Self::dot), P::Call),
            TokenType::Minus => ParseRule::new(Some(Self::unary), Some(Self::binary), P::Term),
            TokenType::Plus => ParseRule::new(None, Some(Self::binary), P::Term),
            TokenType::Slash | TokenType::Star | TokenType::Percent => {
                ParseRule::new(None, Some(Self::binary), P::Factor)
            }
            TokenType::Bang | TokenType::BitwiseNot => {
                ParseRule::new(Some(Self::unary), None, P::None)
            }
            TokenType::BangEqual | TokenType::EqualEqual => {
                ParseRule::new(None, Some(Self::binary), P::Equality)
            }
            TokenType::Greater
            | TokenType::GreaterEqual
            | TokenType::Less
            | TokenType::LessEqual => ParseRule::new(None, Some(Self::binary), P::Comparison),
            TokenType::BitShiftLeft | TokenType::BitShiftRight => {
                ParseRule::new(None, Some(Self::binary), P::BitShift)
            }
            TokenType::BitwiseXor => ParseRule::new(None, Some(Self::binary), P::Xor),
            TokenType::VBar => ParseRule::new(None, Some(Self::binary), P::BitwiseOr),
            TokenType::BitwiseAnd => ParseRule::new(None, Some(Self::binary), P::BitwiseAnd),
            TokenType::LogicalOr => ParseRule::new(None, Some(Self::or), P::Or),
            TokenType::LogicalAnd => ParseRule::new(None, Some(Self::and), P::And),
            TokenType::QuestionMark => ParseRule::new(None, Some(Self::ternary), P::Ternary),
            TokenType::Is => ParseRule::new(None, Some(Self::is), P::Is),
            TokenType::Identifier => ParseRule::new(Some(Self::variable), None, P::None),
            TokenType::String => ParseRule::new(Some(Self::string), None, P::None),
            TokenType::Number => ParseRule::new(Some(Self::number), None, P::None),
            TokenType::Filename => ParseRule::new(Some(Self::filename), None, P::None),
            TokenType::False | TokenType::True | TokenType::Nil => {
                ParseRule::new(Some(Self::literal), None, P::None)
            }
            TokenType::SelfKeyword => ParseRule::new(Some(Self::self_), None, P::None),
            TokenType::Super => ParseRule::new(Some(Self::super_), None, P::None),
            _ => ParseRule::new(None, None, P::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_ladder_is_ordered() {
        let mut precedence = Precedence::None;
        while precedence != Precedence::Primary {
            let next = precedence.higher();
            assert!(next > precedence, "{:?} should be above {:?}", next, precedence);
            precedence = next;
        }
        assert_eq!(Precedence::Primary.higher(), Precedence::Primary);
    }

    #[test]
    fn test_rule_table() {
        let rule = Compiler::rule(TokenType::Minus);
        assert!(rule.prefix.is_some());
        assert!(rule.infix.is_some());
        assert_eq!(rule.precedence, Precedence::Term);

        let rule = Compiler::rule(TokenType::QuestionMark);
        assert!(rule.prefix.is_none());
        assert_eq!(rule.precedence, Precedence::Ternary);

        let rule = Compiler::rule(TokenType::Semicolon);
        assert!(rule.prefix.is_none());
        assert!(rule.infix.is_none());
        assert_eq!(rule.precedence, Precedence::None);
    }
}
