mod keywords;

use std::borrow::Cow;

pub use keywords::identifier_type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    // Single-character tokens
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    Colon,
    Eol,
    VBar,
    Percent,
    QuestionMark,
    At,

    // One or two character tokens
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    PlusEqual,
    MinusEqual,
    SlashEqual,
    StarEqual,
    PercentEqual,
    LogicalOr,
    LogicalAnd,
    BitwiseAnd,
    BitwiseXor,
    BitwiseNot,
    BitShiftLeft,
    BitShiftRight,
    LambdaArgsOpen,
    LambdaArgsClose,

    // Literals
    Identifier,
    String,
    Number,
    Filename,

    // Keywords
    As,
    Break,
    Catch,
    Class,
    Else,
    Enum,
    False,
    Final,
    Finally,
    For,
    Foreach,
    From,
    Function,
    If,
    Import,
    In,
    Is,
    Next,
    Nil,
    Operator,
    Rethrow,
    Return,
    SelfKeyword,
    Super,
    Throw,
    True,
    Try,
    Var,
    While,

    // Access modifiers
    Private,
    Protected,
    Public,
    Static,

    Error,
    Eof,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub token_type: TokenType,
    /// Source text of the token. String literals exclude their delimiters and
    /// error tokens carry the diagnostic message instead.
    pub lexeme: Cow<'a, str>,
    pub line: usize,
}

impl<'a> Token<'a> {
    /// A token that never came from the source, such as the compiler's
    /// placeholder before the first token is read.
    pub fn synthetic(lexeme: &'static str, line: usize) -> Self {
        Self {
            token_type: TokenType::Identifier,
            lexeme: Cow::Borrowed(lexeme),
            line,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tokenizer<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    line: usize,
    finished: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
            finished: false,
        }
    }

    pub fn token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        let Some(c) = self.advance() else {
            return self.make_token(TokenType::Eof);
        };

        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number(c);
        }

        match c {
            '(' => {
                let token_type = if self.matches('|') {
                    TokenType::LambdaArgsOpen
                } else {
                    TokenType::LeftParen
                };
                self.make_token(token_type)
            }
            ')' => self.make_token(TokenType::RightParen),
            '{' => self.make_token(TokenType::LeftBrace),
            '}' => self.make_token(TokenType::RightBrace),
            '[' => self.make_token(TokenType::LeftBracket),
            ']' => self.make_token(TokenType::RightBracket),
            ';' => self.make_token(TokenType::Semicolon),
            ',' => self.make_token(TokenType::Comma),
            '.' => self.make_token(TokenType::Dot),
            ':' => self.make_token(TokenType::Colon),
            '?' => self.make_token(TokenType::QuestionMark),
            '@' => self.make_token(TokenType::At),
            '~' => self.make_token(TokenType::BitwiseNot),
            '^' => self.make_token(TokenType::BitwiseXor),
            '\n' => {
                let token = self.make_token(TokenType::Eol);
                self.line += 1;
                token
            }
            '-' => self.with_equal(TokenType::MinusEqual, TokenType::Minus),
            '+' => self.with_equal(TokenType::PlusEqual, TokenType::Plus),
            '/' => self.with_equal(TokenType::SlashEqual, TokenType::Slash),
            '*' => self.with_equal(TokenType::StarEqual, TokenType::Star),
            '%' => self.with_equal(TokenType::PercentEqual, TokenType::Percent),
            '!' => self.with_equal(TokenType::BangEqual, TokenType::Bang),
            '=' => self.with_equal(TokenType::EqualEqual, TokenType::Equal),
            '|' => {
                let token_type = if self.matches('|') {
                    TokenType::LogicalOr
                } else if self.matches(')') {
                    TokenType::LambdaArgsClose
                } else {
                    TokenType::VBar
                };
                self.make_token(token_type)
            }
            '&' => {
                let token_type = if self.matches('&') {
                    TokenType::LogicalAnd
                } else {
                    TokenType::BitwiseAnd
                };
                self.make_token(token_type)
            }
            '<' => {
                let token_type = if self.matches('=') {
                    TokenType::LessEqual
                } else if self.matches('<') {
                    TokenType::BitShiftLeft
                } else {
                    TokenType::Less
                };
                self.make_token(token_type)
            }
            '>' => {
                let token_type = if self.matches('=') {
                    TokenType::GreaterEqual
                } else if self.matches('>') {
                    TokenType::BitShiftRight
                } else {
                    TokenType::Greater
                };
                self.make_token(token_type)
            }
            '"' | '\'' => self.string(c),
            c => self.error_token(format!("Unexpected character '{}'.", c)),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn identifier(&mut self) -> Token<'a> {
        while self.peek().is_some_and(|c| is_alpha(c) || c.is_ascii_digit()) {
            self.advance();
        }

        // `empty?` and `sort!` are plain identifiers, but `a!=b` is not `a!`.
        match self.peek() {
            Some('?') => {
                self.advance();
            }
            Some('!') if self.peek_next() != Some('=') => {
                self.advance();
            }
            _ => {}
        }

        let token_type = identifier_type(&self.source[self.start..self.current]);
        self.make_token(token_type)
    }

    fn number(&mut self, first: char) -> Token<'a> {
        if first == '0' && matches!(self.peek(), Some('x' | 'X')) {
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
        } else {
            self.digits();

            if self.peek() == Some('.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
                self.digits();
            }
        }

        self.make_token(TokenType::Number)
    }

    fn digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.advance();
        }
    }

    fn string(&mut self, terminator: char) -> Token<'a> {
        let line = self.line;
        while let Some(c) = self.peek() {
            if c == terminator {
                break;
            }
            if c == '\n' {
                self.line += 1;
            }
            if c == '\\' && self.peek_next() == Some(terminator) {
                self.advance();
            }
            self.advance();
        }

        if self.peek().is_none() {
            return self.error_token("Unterminated string.".to_string());
        }

        // The terminator.
        self.advance();
        Token {
            token_type: TokenType::String,
            lexeme: Cow::Borrowed(&self.source[self.start + 1..self.current - 1]),
            line,
        }
    }

    fn with_equal(&mut self, matched: TokenType, otherwise: TokenType) -> Token<'a> {
        let token_type = if self.matches('=') { matched } else { otherwise };
        self.make_token(token_type)
    }

    fn make_token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            lexeme: Cow::Borrowed(&self.source[self.start..self.current]),
            line: self.line,
        }
    }

    fn error_token(&self, message: String) -> Token<'a> {
        Token {
            token_type: TokenType::Error,
            lexeme: Cow::Owned(message),
            line: self.line,
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.current..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.source[self.current..].chars();
        chars.next()?;
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.current += c.len_utf8();
        Some(c)
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.current += expected.len_utf8();
            true
        } else {
            false
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    /// Yields every token up to and including the first `Eof`.
    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let token = self.token();
        if token.token_type == TokenType::Eof {
            self.finished = true;
        }
        Some(token)
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || (!c.is_ascii() && c.is_alphabetic())
}
