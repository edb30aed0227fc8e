use super::TokenType;

/// Classifies an identifier lexeme, returning its keyword kind or
/// [`TokenType::Identifier`] when it is not reserved.
pub fn identifier_type(lexeme: &str) -> TokenType {
    match lexeme {
        "as" => TokenType::As,
        "break" => TokenType::Break,
        "catch" => TokenType::Catch,
        "class" => TokenType::Class,
        "else" => TokenType::Else,
        "enum" => TokenType::Enum,
        "false" => TokenType::False,
        "final" => TokenType::Final,
        "finally" => TokenType::Finally,
        "for" => TokenType::For,
        "foreach" => TokenType::Foreach,
        "from" => TokenType::From,
        "function" => TokenType::Function,
        "if" => TokenType::If,
        "import" => TokenType::Import,
        "in" => TokenType::In,
        "is" => TokenType::Is,
        "next" => TokenType::Next,
        "nil" => TokenType::Nil,
        "operator" => TokenType::Operator,
        "private" => TokenType::Private,
        "protected" => TokenType::Protected,
        "public" => TokenType::Public,
        "rethrow" => TokenType::Rethrow,
        "return" => TokenType::Return,
        "self" => TokenType::SelfKeyword,
        "static" => TokenType::Static,
        "super" => TokenType::Super,
        "throw" => TokenType::Throw,
        "true" => TokenType::True,
        "try" => TokenType::Try,
        "var" => TokenType::Var,
        "while" => TokenType::While,
        "__FILE__" => TokenType::Filename,
        _ => TokenType::Identifier,
    }
}
