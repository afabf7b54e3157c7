use std::fmt;
use std::sync::Arc;

use crate::error::SyntaxError;
use crate::node::SourceContext;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Text,
    BlockStart,
    BlockEnd,
    VarStart,
    VarEnd,
    Name,
    Number,
    String,
    Operator,
    Punctuation,
    InterpolationStart,
    InterpolationEnd,
    Arrow,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Text => "text",
            Self::BlockStart => "begin of statement block",
            Self::BlockEnd => "end of statement block",
            Self::VarStart => "begin of print statement",
            Self::VarEnd => "end of print statement",
            Self::Name => "name",
            Self::Number => "number",
            Self::String => "string",
            Self::Operator => "operator",
            Self::Punctuation => "punctuation",
            Self::InterpolationStart => "begin of string interpolation",
            Self::InterpolationEnd => "end of string interpolation",
            Self::Arrow => "arrow",
            Self::Eof => "end of template",
        };
        f.write_str(label)
    }
}

/// One lexed token. Immutable once created.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub line: usize,
}

impl Token {
    pub fn new<V: Into<String>>(kind: TokenKind, value: V, line: usize) -> Self {
        Self {
            kind,
            value: value.into(),
            line,
        }
    }

    pub fn test(&self, kind: TokenKind, value: Option<&str>) -> bool {
        self.kind == kind && value.is_none_or(|v| self.value == v)
    }

    /// Shorthand for testing a NAME token against a keyword.
    pub fn test_name(&self, value: &str) -> bool {
        self.test(TokenKind::Name, Some(value))
    }

    fn describe(&self) -> String {
        if self.value.is_empty() {
            self.kind.to_string()
        } else {
            format!("{} \"{}\"", self.kind, self.value)
        }
    }
}

/// A cursor over the token list produced by the lexer. Never mutates tokens.
#[derive(Debug, Clone)]
pub struct TokenStream {
    tokens: Vec<Token>,
    cursor: usize,
    source: Arc<SourceContext>,
}

impl TokenStream {
    pub fn new(tokens: Vec<Token>, source: Arc<SourceContext>) -> Self {
        debug_assert!(
            tokens.last().is_some_and(|t| t.kind == TokenKind::Eof),
            "token stream must end with EOF"
        );
        Self {
            tokens,
            cursor: 0,
            source,
        }
    }

    pub fn source(&self) -> &Arc<SourceContext> {
        &self.source
    }

    pub fn source_name(&self) -> &str {
        &self.source.name
    }

    /// The token under the cursor. The trailing EOF token is sticky, so this
    /// is always valid.
    pub fn current(&self) -> &Token {
        self.tokens
            .get(self.cursor)
            .unwrap_or_else(|| &self.tokens[self.tokens.len() - 1])
    }

    /// Lookahead by `n` tokens without advancing (0 is the current token).
    pub fn look(&self, n: usize) -> &Token {
        self.tokens
            .get(self.cursor + n)
            .unwrap_or_else(|| &self.tokens[self.tokens.len() - 1])
    }

    /// Advances past the current token and returns it.
    pub fn next_token(&mut self) -> Token {
        let token = self.current().clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        token
    }

    /// True when the current token matches, without advancing.
    pub fn test(&self, kind: TokenKind, value: Option<&str>) -> bool {
        self.current().test(kind, value)
    }

    /// Consumes the current token when it matches; returns whether it did.
    pub fn next_if(&mut self, kind: TokenKind, value: Option<&str>) -> bool {
        if self.test(kind, value) {
            self.next_token();
            true
        } else {
            false
        }
    }

    /// Match-or-fail: consumes and returns the current token, or raises a
    /// `SyntaxError` naming what was found instead.
    pub fn expect(&mut self, kind: TokenKind, value: Option<&str>) -> Result<Token, SyntaxError> {
        if self.test(kind, value) {
            Ok(self.next_token())
        } else {
            let current = self.current();
            let expected = match value {
                Some(v) => format!("{kind} \"{v}\""),
                None => kind.to_string(),
            };
            Err(SyntaxError::new(
                format!("Expected {expected}, found {}", current.describe()),
                current.line,
                self.source.name.clone(),
            ))
        }
    }

    pub fn is_eof(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(tokens: Vec<Token>) -> TokenStream {
        let mut tokens = tokens;
        tokens.push(Token::new(TokenKind::Eof, "", 1));
        TokenStream::new(tokens, Arc::new(SourceContext::new("test", "")))
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_cursor_and_lookahead() {
        let mut s = stream(vec![
            Token::new(TokenKind::Name, "a", 1),
            Token::new(TokenKind::Operator, "+", 1),
            Token::new(TokenKind::Name, "b", 1),
        ]);
        assert!(s.current().test_name("a"));
        assert!(s.look(1).test(TokenKind::Operator, Some("+")));
        assert_eq!(s.next_token().value, "a");
        assert!(s.current().test(TokenKind::Operator, Some("+")));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_eof_is_sticky() {
        let mut s = stream(vec![Token::new(TokenKind::Name, "a", 1)]);
        s.next_token();
        assert!(s.is_eof());
        s.next_token();
        assert!(s.is_eof());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_expect_error_message() {
        let mut s = stream(vec![Token::new(TokenKind::Name, "endfor", 2)]);
        let err = s.expect(TokenKind::BlockEnd, None).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("end of statement block"));
        assert!(err.message.contains("endfor"));
        assert_eq!(err.source_name, "test");
    }
}
