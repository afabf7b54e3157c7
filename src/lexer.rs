use std::sync::Arc;

use crate::environment::Environment;
use crate::error::SyntaxError;
use crate::node::SourceContext;
use crate::token::{Token, TokenKind, TokenStream};

const VAR_START: &str = "{{";
const VAR_END: &str = "}}";
const BLOCK_START: &str = "{%";
const BLOCK_END: &str = "%}";
const COMMENT_START: &str = "{#";
const COMMENT_END: &str = "#}";

/// Whitespace trimming requested by a `-`/`~` modifier, applied to the text
/// token on the other side of the delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trim {
    None,
    /// `-`: remove all adjacent whitespace.
    Full,
    /// `~`: remove adjacent spaces and tabs, keep newlines.
    Line,
}

/// Converts raw template text into a stream of typed tokens.
///
/// Operates in two nested modes: raw text scanning for the next delimiter,
/// and a code sub-lexer for the content of a `{{ ... }}` / `{% ... %}` pair.
/// Never returns a partial stream; the first malformed construct fails with a
/// [`SyntaxError`] carrying the offending line.
pub struct Lexer<'e> {
    env: &'e Environment,
}

struct LexState<'s> {
    code: String,
    source: Arc<SourceContext>,
    cursor: usize,
    line: usize,
    /// Open brackets (and interpolation markers) with their opening lines.
    brackets: Vec<(&'static str, usize)>,
    tokens: Vec<Token>,
    pending_trim: Trim,
    ops: &'s [String],
}

impl<'e> Lexer<'e> {
    pub fn new(env: &'e Environment) -> Self {
        Self { env }
    }

    /// Tokenizes a template source into a [`TokenStream`].
    pub fn tokenize(&self, code: &str, name: &str) -> Result<TokenStream, SyntaxError> {
        log::debug!("tokenizing template \"{name}\" ({} bytes)", code.len());

        // Normalize line endings so line counting only ever sees \n.
        let normalized = code.replace("\r\n", "\n").replace('\r', "\n");
        let source = Arc::new(SourceContext::new(name, normalized.clone()));
        let mut state = LexState {
            code: normalized,
            source: Arc::clone(&source),
            cursor: 0,
            line: 1,
            brackets: Vec::new(),
            tokens: Vec::new(),
            pending_trim: Trim::None,
            ops: self.env.operator_lexemes(),
        };
        state.lex_data()?;
        state.tokens.push(Token::new(TokenKind::Eof, "", state.line));
        Ok(TokenStream::new(state.tokens, source))
    }
}

impl LexState<'_> {
    fn rest(&self) -> &str {
        &self.code[self.cursor..]
    }

    fn at_end(&self) -> bool {
        self.cursor >= self.code.len()
    }

    fn error<M: Into<String>>(&self, message: M) -> SyntaxError {
        SyntaxError::new(message, self.line, self.source.name.clone())
    }

    fn error_at<M: Into<String>>(&self, message: M, line: usize) -> SyntaxError {
        SyntaxError::new(message, line, self.source.name.clone())
    }

    /// Advances over `len` bytes, keeping the line count exact.
    fn advance(&mut self, len: usize) {
        let consumed = &self.code[self.cursor..self.cursor + len];
        self.line += consumed.matches('\n').count();
        self.cursor += len;
    }

    fn push_text(&mut self, text: &str, line: usize) {
        let text = match self.pending_trim {
            Trim::None => text,
            Trim::Full => text.trim_start(),
            Trim::Line => text.trim_start_matches([' ', '\t']),
        };
        self.pending_trim = Trim::None;
        if !text.is_empty() {
            self.tokens.push(Token::new(TokenKind::Text, text, line));
        }
    }

    /// Raw-text mode: scan for the next delimiter, emitting text tokens in
    /// between and dispatching to the code sub-lexer.
    fn lex_data(&mut self) -> Result<(), SyntaxError> {
        while !self.at_end() {
            let rest = self.rest();
            let next = ["{{", "{%", "{#"]
                .iter()
                .filter_map(|d| rest.find(d).map(|i| (i, *d)))
                .min();

            let Some((offset, delim)) = next else {
                let (text, line) = (rest.to_string(), self.line);
                self.advance(rest.len());
                self.push_text(&text, line);
                break;
            };

            let mut text = &rest[..offset];
            let modifier = rest[offset + 2..].chars().next();
            let trim = match modifier {
                Some('-') => Trim::Full,
                Some('~') => Trim::Line,
                _ => Trim::None,
            };
            match trim {
                Trim::Full => text = text.trim_end(),
                Trim::Line => text = text.trim_end_matches([' ', '\t']),
                Trim::None => {}
            }

            let text_line = self.line;
            let text = text.to_string();
            self.advance(offset);
            self.push_text(&text, text_line);

            let delim_len = if trim == Trim::None { 2 } else { 3 };
            match delim {
                COMMENT_START => {
                    self.advance(delim_len);
                    self.lex_comment()?;
                }
                BLOCK_START => {
                    let tag_line = self.line;
                    self.advance(delim_len);
                    if self.try_lex_verbatim()? {
                        continue;
                    }
                    self.tokens
                        .push(Token::new(TokenKind::BlockStart, "", tag_line));
                    self.lex_code(TokenKind::BlockEnd)?;
                }
                _ => {
                    let tag_line = self.line;
                    self.advance(delim_len);
                    self.tokens
                        .push(Token::new(TokenKind::VarStart, "", tag_line));
                    self.lex_code(TokenKind::VarEnd)?;
                }
            }
        }
        Ok(())
    }

    /// Comments are scanned and discarded without producing tokens.
    fn lex_comment(&mut self) -> Result<(), SyntaxError> {
        let Some(end) = self.rest().find(COMMENT_END) else {
            return Err(self.error("Unclosed comment"));
        };
        let body = &self.rest()[..end];
        self.pending_trim = match body.chars().last() {
            Some('-') => Trim::Full,
            Some('~') => Trim::Line,
            _ => Trim::None,
        };
        self.advance(end + COMMENT_END.len());
        Ok(())
    }

    /// Verbatim blocks suspend delimiter recognition entirely until their
    /// matching end tag. Returns true when one was consumed.
    fn try_lex_verbatim(&mut self) -> Result<bool, SyntaxError> {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        if !trimmed.starts_with("verbatim") {
            return Ok(false);
        }
        let after_kw = &trimmed["verbatim".len()..];
        let after_kw = after_kw.trim_start();
        let (inner_trim, after_mod) = match after_kw.chars().next() {
            Some('-') => (Trim::Full, &after_kw[1..]),
            Some('~') => (Trim::Line, &after_kw[1..]),
            _ => (Trim::None, after_kw),
        };
        if !after_mod.starts_with(BLOCK_END) {
            return Ok(false);
        }
        // Consume up to and including the opening tag's %}.
        let opening_len = rest.len() - after_mod.len() + BLOCK_END.len();
        let open_line = self.line;
        self.advance(opening_len);
        self.pending_trim = inner_trim;

        // Scan for {% endverbatim %}, honoring modifiers on both sides.
        let mut search = 0;
        loop {
            let rest = self.rest();
            let Some(offset) = rest[search..].find(BLOCK_START).map(|i| i + search) else {
                return Err(
                    self.error_at("Unexpected end of file: unclosed \"verbatim\" block", open_line)
                );
            };
            let mut tag = &rest[offset + BLOCK_START.len()..];
            let text_trim = match tag.chars().next() {
                Some('-') => {
                    tag = &tag[1..];
                    Trim::Full
                }
                Some('~') => {
                    tag = &tag[1..];
                    Trim::Line
                }
                _ => Trim::None,
            };
            let tag = tag.trim_start();
            if let Some(tag) = tag.strip_prefix("endverbatim") {
                let tag = tag.trim_start();
                let (close_trim, tag) = match tag.chars().next() {
                    Some('-') => (Trim::Full, &tag[1..]),
                    Some('~') => (Trim::Line, &tag[1..]),
                    _ => (Trim::None, tag),
                };
                if tag.starts_with(BLOCK_END) {
                    let mut text = &rest[..offset];
                    match text_trim {
                        Trim::Full => text = text.trim_end(),
                        Trim::Line => text = text.trim_end_matches([' ', '\t']),
                        Trim::None => {}
                    }
                    let text = text.to_string();
                    let text_line = self.line;
                    let total = rest.len() - tag.len() + BLOCK_END.len();
                    self.advance(total);
                    self.push_text(&text, text_line);
                    self.pending_trim = close_trim;
                    return Ok(true);
                }
            }
            search = offset + BLOCK_START.len();
        }
    }

    /// Code mode: tokenizes the content between a start/end delimiter pair.
    fn lex_code(&mut self, end_kind: TokenKind) -> Result<(), SyntaxError> {
        loop {
            self.skip_whitespace();
            if self.at_end() {
                let what = if end_kind == TokenKind::BlockEnd {
                    "block"
                } else {
                    "variable"
                };
                return Err(self.error(format!("Unclosed \"{what}\"")));
            }

            if self.brackets.is_empty() {
                let end_delim = if end_kind == TokenKind::BlockEnd {
                    BLOCK_END
                } else {
                    VAR_END
                };
                let rest = self.rest();
                let (trim, skip) = match rest.chars().next() {
                    Some('-') if rest[1..].starts_with(end_delim) => (Trim::Full, 1),
                    Some('~') if rest[1..].starts_with(end_delim) => (Trim::Line, 1),
                    _ => (Trim::None, 0),
                };
                if rest[skip..].starts_with(end_delim) {
                    let line = self.line;
                    self.advance(skip + end_delim.len());
                    self.tokens.push(Token::new(end_kind, "", line));
                    self.pending_trim = trim;
                    return Ok(());
                }
            }

            self.lex_expr_token()?;
        }
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let len = rest.len() - rest.trim_start().len();
        if len > 0 {
            self.advance(len);
        }
    }

    /// Lexes exactly one expression token: operator, name, number, string,
    /// or punctuation.
    fn lex_expr_token(&mut self) -> Result<(), SyntaxError> {
        let line = self.line;

        // Operators first (longest match, including word operators).
        if let Some((canonical, len)) = self.match_operator() {
            self.advance(len);
            if canonical == "=>" {
                self.tokens.push(Token::new(TokenKind::Arrow, "=>", line));
            } else {
                self.tokens
                    .push(Token::new(TokenKind::Operator, canonical, line));
            }
            return Ok(());
        }

        let c = self.rest().chars().next().unwrap_or_default();

        if c.is_ascii_alphabetic() || c == '_' {
            let rest = self.rest();
            let len = rest
                .find(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
                .unwrap_or(rest.len());
            let name = rest[..len].to_string();
            self.advance(len);
            self.tokens.push(Token::new(TokenKind::Name, name, line));
            return Ok(());
        }

        if c.is_ascii_digit() {
            return self.lex_number();
        }

        if c == '"' {
            self.advance(1);
            return self.lex_double_quoted();
        }
        if c == '\'' {
            self.advance(1);
            return self.lex_single_quoted();
        }

        if "([{".contains(c) {
            let expect = match c {
                '(' => "(",
                '[' => "[",
                _ => "{",
            };
            self.brackets.push((expect, line));
            self.advance(1);
            self.tokens
                .push(Token::new(TokenKind::Punctuation, expect, line));
            return Ok(());
        }
        if ")]}".contains(c) {
            let opening = match c {
                ')' => "(",
                ']' => "[",
                _ => "{",
            };
            match self.brackets.pop() {
                Some((open, _)) if open == opening => {}
                Some((_, open_line)) => {
                    return Err(self.error_at(format!("Unexpected \"{c}\""), open_line.max(line)));
                }
                None => return Err(self.error(format!("Unexpected \"{c}\""))),
            }
            self.advance(1);
            self.tokens
                .push(Token::new(TokenKind::Punctuation, c.to_string(), line));
            return Ok(());
        }

        if "?:.,|=".contains(c) {
            self.advance(1);
            self.tokens
                .push(Token::new(TokenKind::Punctuation, c.to_string(), line));
            return Ok(());
        }

        Err(self.error(format!("Unexpected character \"{c}\"")))
    }

    /// Longest-match against the registered operator set. Word operators
    /// require a boundary and allow arbitrary whitespace between their words.
    fn match_operator(&self) -> Option<(String, usize)> {
        let rest = self.rest();
        // Arrow is lexed here too so that "=>" wins over "=" punctuation.
        if rest.starts_with("=>") {
            return Some(("=>".to_string(), 2));
        }
        for op in self.ops {
            if let Some(len) = match_one_operator(rest, op) {
                return Some((op.clone(), len));
            }
        }
        None
    }

    fn lex_number(&mut self) -> Result<(), SyntaxError> {
        let line = self.line;
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut len = 0;
        while len < bytes.len() && (bytes[len].is_ascii_digit() || bytes[len] == b'_') {
            len += 1;
        }
        // A '.' only belongs to the number when a digit follows; ".." stays a
        // range operator.
        if len < bytes.len()
            && bytes[len] == b'.'
            && bytes.get(len + 1).is_some_and(u8::is_ascii_digit)
        {
            len += 1;
            while len < bytes.len() && (bytes[len].is_ascii_digit() || bytes[len] == b'_') {
                len += 1;
            }
        }
        let literal: String = rest[..len].chars().filter(|c| *c != '_').collect();
        self.advance(len);
        self.tokens.push(Token::new(TokenKind::Number, literal, line));
        Ok(())
    }

    fn lex_single_quoted(&mut self) -> Result<(), SyntaxError> {
        let line = self.line;
        let mut out = String::new();
        loop {
            let Some(c) = self.rest().chars().next() else {
                return Err(self.error_at("Unclosed string", line));
            };
            match c {
                '\'' => {
                    self.advance(1);
                    self.tokens.push(Token::new(TokenKind::String, out, line));
                    return Ok(());
                }
                '\\' => {
                    self.advance(1);
                    let Some(escaped) = self.rest().chars().next() else {
                        return Err(self.error_at("Unclosed string", line));
                    };
                    out.push(unescape(escaped));
                    self.advance(escaped.len_utf8());
                }
                _ => {
                    out.push(c);
                    self.advance(c.len_utf8());
                }
            }
        }
    }

    /// Double-quoted strings support `#{...}` interpolation, which re-enters
    /// code mode recursively.
    fn lex_double_quoted(&mut self) -> Result<(), SyntaxError> {
        let mut part = String::new();
        let mut part_line = self.line;
        let open_line = self.line;
        loop {
            let Some(c) = self.rest().chars().next() else {
                return Err(self.error_at("Unclosed string", open_line));
            };
            match c {
                '"' => {
                    self.advance(1);
                    // Always emit at least one string part so an empty
                    // literal still produces a token.
                    if !part.is_empty() || self.tokens.last().is_none_or(|t| {
                        t.kind != TokenKind::InterpolationEnd
                    }) {
                        self.tokens
                            .push(Token::new(TokenKind::String, part, part_line));
                    }
                    return Ok(());
                }
                '\\' => {
                    self.advance(1);
                    let Some(escaped) = self.rest().chars().next() else {
                        return Err(self.error_at("Unclosed string", open_line));
                    };
                    part.push(unescape(escaped));
                    self.advance(escaped.len_utf8());
                }
                '#' if self.rest()[1..].starts_with('{') => {
                    if !part.is_empty() {
                        self.tokens.push(Token::new(
                            TokenKind::String,
                            std::mem::take(&mut part),
                            part_line,
                        ));
                    }
                    let line = self.line;
                    self.advance(2);
                    self.tokens
                        .push(Token::new(TokenKind::InterpolationStart, "", line));
                    self.brackets.push(("#{", line));
                    self.lex_interpolation()?;
                    part_line = self.line;
                }
                _ => {
                    part.push(c);
                    self.advance(c.len_utf8());
                }
            }
        }
    }

    /// Code mode inside `#{...}`, terminated by the matching `}`.
    fn lex_interpolation(&mut self) -> Result<(), SyntaxError> {
        let depth = self.brackets.len();
        loop {
            self.skip_whitespace();
            if self.at_end() {
                return Err(self.error("Unclosed \"interpolation\""));
            }
            if self.brackets.len() == depth && self.rest().starts_with('}') {
                let line = self.line;
                self.brackets.pop();
                self.advance(1);
                self.tokens
                    .push(Token::new(TokenKind::InterpolationEnd, "", line));
                return Ok(());
            }
            self.lex_expr_token()?;
        }
    }
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        other => other,
    }
}

/// Attempts to match one operator lexeme at the start of `rest`, returning
/// the number of source bytes it spans.
fn match_one_operator(rest: &str, op: &str) -> Option<usize> {
    let ends_wordy = op.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if let Some((first, tail)) = op.split_once(' ') {
        // Word operators like "not in": arbitrary whitespace between words.
        let mut pos = match_word(rest, first)?;
        for word in tail.split(' ') {
            let ws = rest[pos..].len() - rest[pos..].trim_start().len();
            if ws == 0 {
                return None;
            }
            pos += ws;
            pos += match_word(&rest[pos..], word)?;
        }
        Some(pos)
    } else if ends_wordy {
        let len = match_word(rest, op)?;
        Some(len)
    } else {
        rest.starts_with(op).then(|| op.len())
    }
}

/// Matches a whole word (no identifier character may follow).
fn match_word(rest: &str, word: &str) -> Option<usize> {
    if !rest.starts_with(word) {
        return None;
    }
    let next = rest[word.len()..].chars().next();
    if next.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
        None
    } else {
        Some(word.len())
    }
}
