use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::{CompilateResult, SyntaxError};
use crate::node::{EscapeMode, Expr, MacroDef, MacroParam, ModuleNode, Node};
use crate::token::{Token, TokenKind, TokenStream};

/// A statement tag sub-parser. Receives the parser positioned right after the
/// tag name and the tag's line; returns the produced node, or `None` for tags
/// that only record state on the module (like `extends`).
pub type TagParserFn = fn(&mut Parser<'_>, usize) -> CompilateResult<Option<Node>>;

const BUILTIN_TAGS: &[&str] = &[
    "autoescape", "block", "break", "continue", "do", "extends", "for", "from", "if", "import",
    "include", "macro", "sandbox", "set", "verbatim", "with",
];

const END_TAGS: &[&str] = &[
    "elseif",
    "else",
    "endautoescape",
    "endblock",
    "endfor",
    "endif",
    "endmacro",
    "endsandbox",
    "endset",
    "endverbatim",
    "endwith",
];

/// Recursive-descent statement parser. Consumes a [`TokenStream`] and builds
/// a [`ModuleNode`]; expression parsing lives in the `expr` module as further
/// methods on this type.
pub struct Parser<'e> {
    pub(crate) env: &'e Environment,
    pub(crate) stream: TokenStream,
    blocks: BTreeMap<String, Vec<Node>>,
    macros: BTreeMap<String, MacroDef>,
    parent: Option<Expr>,
    /// Names bound by `import`/`from import` and local macro definitions;
    /// calls to these bypass the function registry.
    pub(crate) imported_names: BTreeSet<String>,
    loop_depth: usize,
    block_stack: Vec<String>,
}

impl<'e> Parser<'e> {
    pub fn new(env: &'e Environment, stream: TokenStream) -> Self {
        Self {
            env,
            stream,
            blocks: BTreeMap::new(),
            macros: BTreeMap::new(),
            parent: None,
            imported_names: BTreeSet::new(),
            loop_depth: 0,
            block_stack: Vec::new(),
        }
    }

    pub fn error<M: Into<String>>(&self, message: M, line: usize) -> SyntaxError {
        SyntaxError::new(message, line, self.stream.source_name())
    }

    /// Parses one expression at the current position. The entry point for
    /// registered tag parsers.
    pub fn expression(&mut self) -> CompilateResult<Expr> {
        self.parse_expression(0)
    }

    /// Consumes the `%}` closing the tag currently being parsed.
    pub fn expect_block_end(&mut self) -> CompilateResult<()> {
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(())
    }

    pub fn parse(mut self) -> CompilateResult<ModuleNode> {
        let source = Arc::clone(self.stream.source());
        let (body, _) = self.subparse(&[])?;

        if self.parent.is_some() {
            for node in &body {
                let allowed = node.is_blank_text()
                    || matches!(
                        node,
                        Node::BlockCall { .. }
                            | Node::Set { .. }
                            | Node::Import { .. }
                            | Node::FromImport { .. }
                    );
                if !allowed {
                    return Err(self
                        .error(
                            "A template that extends another one cannot include content outside blocks",
                            node.line(),
                        )
                        .into());
                }
            }
        }

        let mut module = ModuleNode::new(source);
        module.body = body;
        module.parent = self.parent;
        module.blocks = self.blocks;
        module.macros = self.macros;
        Ok(module)
    }

    /// Parses statements until one of the `stop` tags opens (returning its
    /// name token, already consumed) or, with an empty `stop` list, until the
    /// end of the template.
    fn subparse(&mut self, stop: &[&str]) -> CompilateResult<(Vec<Node>, Token)> {
        let mut nodes = Vec::new();
        loop {
            match self.stream.current().kind {
                TokenKind::Text => {
                    let token = self.stream.next_token();
                    nodes.push(Node::Text {
                        data: token.value,
                        line: token.line,
                    });
                }
                TokenKind::VarStart => {
                    let line = self.stream.next_token().line;
                    let expr = self.parse_expression(0)?;
                    self.stream.expect(TokenKind::VarEnd, None)?;
                    nodes.push(Node::Print { expr, line });
                }
                TokenKind::BlockStart => {
                    self.stream.next_token();
                    let token = self.stream.current().clone();
                    if token.kind != TokenKind::Name {
                        return Err(self
                            .error("A block must start with a tag name", token.line)
                            .into());
                    }
                    if stop.contains(&token.value.as_str()) {
                        self.stream.next_token();
                        return Ok((nodes, token));
                    }
                    self.stream.next_token();
                    if let Some(node) = self.parse_statement(&token)? {
                        nodes.push(node);
                    }
                }
                TokenKind::Eof => {
                    if stop.is_empty() {
                        let token = self.stream.current().clone();
                        return Ok((nodes, token));
                    }
                    let expected: Vec<String> = stop.iter().map(|t| format!("\"{t}\"")).collect();
                    return Err(self
                        .error(
                            format!(
                                "Unexpected end of template: expected one of {}",
                                expected.join(", ")
                            ),
                            self.stream.current().line,
                        )
                        .into());
                }
                _ => {
                    let token = self.stream.current().clone();
                    return Err(self
                        .error(format!("Unexpected token {}", token.kind), token.line)
                        .into());
                }
            }
        }
    }

    fn parse_statement(&mut self, tag: &Token) -> CompilateResult<Option<Node>> {
        let line = tag.line;
        match tag.value.as_str() {
            "if" => self.parse_if(line),
            "for" => self.parse_for(line),
            "set" => self.parse_set(line),
            "block" => self.parse_block(line),
            "extends" => self.parse_extends(line),
            "include" => self.parse_include(line),
            "import" => self.parse_import(line),
            "from" => self.parse_from(line),
            "macro" => self.parse_macro(line),
            "autoescape" => self.parse_autoescape(line),
            "sandbox" => self.parse_sandbox(line),
            "with" => self.parse_with(line),
            "do" => self.parse_do(line),
            "break" => self.parse_loop_exit("break", line),
            "continue" => self.parse_loop_exit("continue", line),
            name => {
                if let Some(custom) = self.env.get_tag_parser(name) {
                    return custom(self, line);
                }
                if END_TAGS.contains(&name) {
                    return Err(self
                        .error(format!("Unexpected \"{name}\" tag"), line)
                        .into());
                }
                let candidates: Vec<&str> = BUILTIN_TAGS
                    .iter()
                    .copied()
                    .chain(self.env.tag_names())
                    .collect();
                Err(self
                    .error(unknown_message("tag", name, &candidates), line)
                    .into())
            }
        }
    }

    fn parse_if(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let cond = self.parse_expression(0)?;
        self.stream.expect(TokenKind::BlockEnd, None)?;
        let mut arms = Vec::new();
        let mut else_body = None;

        let (body, mut token) = self.subparse(&["elseif", "else", "endif"])?;
        arms.push((cond, body));
        loop {
            match token.value.as_str() {
                "elseif" => {
                    let cond = self.parse_expression(0)?;
                    self.stream.expect(TokenKind::BlockEnd, None)?;
                    let (body, next) = self.subparse(&["elseif", "else", "endif"])?;
                    arms.push((cond, body));
                    token = next;
                }
                "else" => {
                    self.stream.expect(TokenKind::BlockEnd, None)?;
                    let (body, next) = self.subparse(&["endif"])?;
                    else_body = Some(body);
                    token = next;
                }
                _ => {
                    self.stream.expect(TokenKind::BlockEnd, None)?;
                    break;
                }
            }
        }
        Ok(Some(Node::If {
            arms,
            else_body,
            line,
        }))
    }

    fn parse_for(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let first = self.stream.expect(TokenKind::Name, None)?.value;
        let (key_target, value_target) = if self.stream.next_if(TokenKind::Punctuation, Some(","))
        {
            let value = self.stream.expect(TokenKind::Name, None)?.value;
            (Some(first), value)
        } else {
            (None, first)
        };
        self.stream.expect(TokenKind::Operator, Some("in"))?;
        let seq = self.parse_expression(0)?;
        self.stream.expect(TokenKind::BlockEnd, None)?;

        self.loop_depth += 1;
        let result = self.subparse(&["else", "endfor"]);
        self.loop_depth -= 1;
        let (body, token) = result?;

        let else_body = if token.value == "else" {
            self.stream.expect(TokenKind::BlockEnd, None)?;
            let (body, _) = self.subparse(&["endfor"])?;
            Some(body)
        } else {
            None
        };
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(Some(Node::For {
            key_target,
            value_target,
            seq,
            body,
            else_body,
            with_loop: true,
            line,
        }))
    }

    fn parse_set(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let mut targets = vec![self.stream.expect(TokenKind::Name, None)?.value];
        while self.stream.next_if(TokenKind::Punctuation, Some(",")) {
            targets.push(self.stream.expect(TokenKind::Name, None)?.value);
        }

        if self.stream.next_if(TokenKind::Punctuation, Some("=")) {
            let mut values = vec![self.parse_expression(0)?];
            while self.stream.next_if(TokenKind::Punctuation, Some(",")) {
                values.push(self.parse_expression(0)?);
            }
            if targets.len() != values.len() {
                return Err(self
                    .error(
                        "When using set with multiple targets, you must have the same number of targets and values",
                        line,
                    )
                    .into());
            }
            self.stream.expect(TokenKind::BlockEnd, None)?;
            return Ok(Some(Node::Set {
                targets,
                values,
                capture: None,
                line,
            }));
        }

        if targets.len() != 1 {
            return Err(self
                .error(
                    "When using set with a block, you cannot have a multi-target",
                    line,
                )
                .into());
        }
        self.stream.expect(TokenKind::BlockEnd, None)?;
        let (body, _) = self.subparse(&["endset"])?;
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(Some(Node::Set {
            targets,
            values: Vec::new(),
            capture: Some(body),
            line,
        }))
    }

    fn parse_block(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let name = self.stream.expect(TokenKind::Name, None)?.value;
        if self.blocks.contains_key(&name) {
            return Err(self
                .error(format!("The block \"{name}\" has already been defined"), line)
                .into());
        }
        self.block_stack.push(name.clone());
        self.stream.expect(TokenKind::BlockEnd, None)?;
        let (body, _) = self.subparse(&["endblock"])?;
        if self.stream.test(TokenKind::Name, None) {
            let trailer = self.stream.next_token();
            if trailer.value != name {
                return Err(self
                    .error(
                        format!(
                            "Expected endblock for block \"{name}\" (but \"{}\" given)",
                            trailer.value
                        ),
                        trailer.line,
                    )
                    .into());
            }
        }
        self.stream.expect(TokenKind::BlockEnd, None)?;
        self.block_stack.pop();
        self.blocks.insert(name.clone(), body);
        Ok(Some(Node::BlockCall { name, line }))
    }

    fn parse_extends(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        if self.parent.is_some() {
            return Err(self.error("Multiple extends tags are forbidden", line).into());
        }
        if !self.block_stack.is_empty() {
            return Err(self.error("Cannot use \"extends\" in a block", line).into());
        }
        self.parent = Some(self.parse_expression(0)?);
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(None)
    }

    fn parse_include(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let template = self.parse_expression(0)?;
        let mut variables = None;
        let mut only = false;
        let mut ignore_missing = false;
        loop {
            if self.stream.current().test_name("ignore") {
                self.stream.next_token();
                self.stream.expect(TokenKind::Name, Some("missing"))?;
                ignore_missing = true;
            } else if self.stream.current().test_name("with") {
                self.stream.next_token();
                variables = Some(self.parse_expression(0)?);
            } else if self.stream.current().test_name("only") {
                self.stream.next_token();
                only = true;
            } else {
                break;
            }
        }
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(Some(Node::Include {
            template,
            variables,
            only,
            ignore_missing,
            line,
        }))
    }

    fn parse_import(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let template = self.parse_expression(0)?;
        self.stream.expect(TokenKind::Name, Some("as"))?;
        let target = self.stream.expect(TokenKind::Name, None)?.value;
        self.stream.expect(TokenKind::BlockEnd, None)?;
        self.imported_names.insert(target.clone());
        Ok(Some(Node::Import {
            template,
            target,
            line,
        }))
    }

    fn parse_from(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let template = self.parse_expression(0)?;
        self.stream.expect(TokenKind::Name, Some("import"))?;
        let mut names = Vec::new();
        loop {
            let name = self.stream.expect(TokenKind::Name, None)?.value;
            let alias = if self.stream.current().test_name("as") {
                self.stream.next_token();
                self.stream.expect(TokenKind::Name, None)?.value
            } else {
                name.clone()
            };
            self.imported_names.insert(alias.clone());
            names.push((name, alias));
            if !self.stream.next_if(TokenKind::Punctuation, Some(",")) {
                break;
            }
        }
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(Some(Node::FromImport {
            template,
            names,
            line,
        }))
    }

    fn parse_macro(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let name = self.stream.expect(TokenKind::Name, None)?.value;
        self.stream.expect(TokenKind::Punctuation, Some("("))?;
        let mut params = Vec::new();
        if !self.stream.test(TokenKind::Punctuation, Some(")")) {
            loop {
                let pname = self.stream.expect(TokenKind::Name, None)?.value;
                let default = if self.stream.next_if(TokenKind::Punctuation, Some("=")) {
                    let expr = self.parse_expression(0)?;
                    if !expr.is_constant() {
                        return Err(self
                            .error(
                                "A default value for a macro argument must be a constant",
                                expr.line(),
                            )
                            .into());
                    }
                    Some(expr)
                } else {
                    None
                };
                params.push(MacroParam {
                    name: pname,
                    default,
                });
                if !self.stream.next_if(TokenKind::Punctuation, Some(",")) {
                    break;
                }
            }
        }
        self.stream.expect(TokenKind::Punctuation, Some(")"))?;
        self.stream.expect(TokenKind::BlockEnd, None)?;

        let (body, _) = self.subparse(&["endmacro"])?;
        if self.stream.test(TokenKind::Name, None) {
            let trailer = self.stream.next_token();
            if trailer.value != name {
                return Err(self
                    .error(
                        format!(
                            "Expected endmacro for macro \"{name}\" (but \"{}\" given)",
                            trailer.value
                        ),
                        trailer.line,
                    )
                    .into());
            }
        }
        self.stream.expect(TokenKind::BlockEnd, None)?;
        self.imported_names.insert(name.clone());
        self.macros.insert(
            name.clone(),
            MacroDef {
                name,
                params,
                body,
                line,
            },
        );
        Ok(None)
    }

    fn parse_autoescape(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let mode = if self.stream.test(TokenKind::BlockEnd, None) {
            EscapeMode::Strategy("html".to_string())
        } else {
            let expr = self.parse_expression(0)?;
            match expr {
                Expr::Constant {
                    value: crate::value::Value::Bool(false),
                    ..
                } => EscapeMode::Off,
                Expr::Constant {
                    value: crate::value::Value::Bool(true),
                    ..
                } => EscapeMode::Strategy("html".to_string()),
                Expr::Constant {
                    value: crate::value::Value::Str(s),
                    ..
                } => EscapeMode::Strategy(s),
                other => {
                    return Err(self
                        .error(
                            "An escaping strategy must be a string or false",
                            other.line(),
                        )
                        .into());
                }
            }
        };
        self.stream.expect(TokenKind::BlockEnd, None)?;
        let (body, _) = self.subparse(&["endautoescape"])?;
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(Some(Node::AutoEscape { mode, body, line }))
    }

    fn parse_sandbox(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        self.stream.expect(TokenKind::BlockEnd, None)?;
        let (body, _) = self.subparse(&["endsandbox"])?;
        self.stream.expect(TokenKind::BlockEnd, None)?;
        for node in &body {
            if !node.is_blank_text() && !matches!(node, Node::Include { .. }) {
                return Err(self
                    .error(
                        "Only \"include\" tags are allowed within a \"sandbox\" section",
                        node.line(),
                    )
                    .into());
            }
        }
        Ok(Some(Node::Sandbox { body, line }))
    }

    fn parse_with(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let variables = if !self.stream.test(TokenKind::BlockEnd, None)
            && !self.stream.current().test_name("only")
        {
            Some(self.parse_expression(0)?)
        } else {
            None
        };
        let only = if self.stream.current().test_name("only") {
            self.stream.next_token();
            true
        } else {
            false
        };
        self.stream.expect(TokenKind::BlockEnd, None)?;
        let (body, _) = self.subparse(&["endwith"])?;
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(Some(Node::With {
            variables,
            only,
            body,
            line,
        }))
    }

    fn parse_do(&mut self, line: usize) -> CompilateResult<Option<Node>> {
        let expr = self.parse_expression(0)?;
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(Some(Node::Do { expr, line }))
    }

    fn parse_loop_exit(&mut self, kind: &str, line: usize) -> CompilateResult<Option<Node>> {
        let depth = if self.stream.test(TokenKind::Number, None) {
            let token = self.stream.next_token();
            token.value.parse::<usize>().map_err(|_| {
                self.error(format!("\"{kind}\" depth must be a positive integer"), line)
            })?
        } else {
            1
        };
        if self.loop_depth == 0 {
            return Err(self
                .error(format!("Cannot use \"{kind}\" outside of a loop"), line)
                .into());
        }
        if depth == 0 {
            return Err(self
                .error(format!("\"{kind}\" depth must be a positive integer"), line)
                .into());
        }
        if depth > self.loop_depth {
            return Err(self
                .error(
                    format!(
                        "Cannot \"{kind}\" {depth} loops as only {} are open",
                        self.loop_depth
                    ),
                    line,
                )
                .into());
        }
        self.stream.expect(TokenKind::BlockEnd, None)?;
        Ok(Some(if kind == "break" {
            Node::Break { depth, line }
        } else {
            Node::Continue { depth, line }
        }))
    }
}

/// Builds an `Unknown "x" <kind>` message with a "Did you mean" suggestion
/// when a registered name is close enough.
pub(crate) fn unknown_message(kind: &str, name: &str, candidates: &[&str]) -> String {
    match suggest(name, candidates) {
        Some(best) => format!("Unknown \"{name}\" {kind}. Did you mean \"{best}\"?"),
        None => format!("Unknown \"{name}\" {kind}"),
    }
}

fn suggest<'a>(name: &str, candidates: &[&'a str]) -> Option<&'a str> {
    let cutoff = (name.len() / 3).max(1);
    candidates
        .iter()
        .map(|c| (levenshtein(name, c), *c))
        .filter(|(d, _)| *d <= cutoff)
        .min()
        .map(|(_, c)| c)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            row[j + 1] = sub.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(code: &str) -> ModuleNode {
        try_parse(code).unwrap()
    }

    fn try_parse(code: &str) -> CompilateResult<ModuleNode> {
        let env = Environment::new();
        let stream = Lexer::new(&env).tokenize(code, "test")?;
        Parser::new(&env, stream).parse()
    }

    fn parse_err(code: &str) -> String {
        try_parse(code).unwrap_err().to_string()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_text_and_print() {
        let module = parse("a{{ b }}c");
        assert_eq!(module.body.len(), 3);
        assert!(matches!(&module.body[1], Node::Print { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_elseif_else() {
        let module = parse("{% if a %}1{% elseif b %}2{% else %}3{% endif %}");
        let Node::If {
            arms, else_body, ..
        } = &module.body[0]
        else {
            panic!("expected if node");
        };
        assert_eq!(arms.len(), 2);
        assert!(else_body.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_with_key_and_else() {
        let module = parse("{% for k, v in items %}x{% else %}y{% endfor %}");
        let Node::For {
            key_target,
            value_target,
            else_body,
            with_loop,
            ..
        } = &module.body[0]
        else {
            panic!("expected for node");
        };
        assert_eq!(key_target.as_deref(), Some("k"));
        assert_eq!(value_target, "v");
        assert!(else_body.is_some());
        assert!(with_loop);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_multi_target_mismatch() {
        let err = parse_err("{% set a, b = 1 %}");
        assert!(err.contains("same number of targets and values"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_capture() {
        let module = parse("{% set x %}body{% endset %}");
        let Node::Set { capture, .. } = &module.body[0] else {
            panic!("expected set node");
        };
        assert!(capture.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_registered_and_called() {
        let module = parse("{% block title %}hi{% endblock %}");
        assert!(module.has_block("title"));
        assert!(matches!(&module.body[0], Node::BlockCall { name, .. } if name == "title"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_duplicate_block_rejected() {
        let err = parse_err("{% block a %}{% endblock %}{% block a %}{% endblock %}");
        assert!(err.contains("has already been defined"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_endblock_name_mismatch() {
        let err = parse_err("{% block a %}{% endblock b %}");
        assert!(err.contains("Expected endblock for block \"a\""));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_extends_recorded() {
        let module = parse("{% extends 'base.html' %}{% block a %}{% endblock %}");
        assert!(module.parent.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_multiple_extends_rejected() {
        let err = parse_err("{% extends 'a' %}{% extends 'b' %}");
        assert!(err.contains("Multiple extends tags are forbidden"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_extends_forbids_loose_content() {
        let err = parse_err("{% extends 'a' %}loose text");
        assert!(err.contains("cannot include content outside blocks"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_include_modifiers() {
        let module = parse("{% include 'p' ignore missing with {'a': 1} only %}");
        let Node::Include {
            only,
            ignore_missing,
            variables,
            ..
        } = &module.body[0]
        else {
            panic!("expected include node");
        };
        assert!(only);
        assert!(ignore_missing);
        assert!(variables.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_macro_with_defaults() {
        let module = parse("{% macro input(name, type = 'text') %}x{% endmacro %}");
        let def = module.macros.get("input").unwrap();
        assert_eq!(def.params.len(), 2);
        assert!(def.params[1].default.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_macro_default_must_be_constant() {
        let err = parse_err("{% macro input(type = a ~ 'x') %}{% endmacro %}");
        assert!(err.contains("must be a constant"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_autoescape_modes() {
        let module = parse("{% autoescape false %}{{ a }}{% endautoescape %}");
        assert!(matches!(
            &module.body[0],
            Node::AutoEscape {
                mode: EscapeMode::Off,
                ..
            }
        ));
        let module = parse("{% autoescape 'js' %}{% endautoescape %}");
        assert!(matches!(
            &module.body[0],
            Node::AutoEscape { mode: EscapeMode::Strategy(s), .. } if s == "js"
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_sandbox_allows_only_includes() {
        let err = parse_err("{% sandbox %}{{ a }}{% endsandbox %}");
        assert!(err.contains("Only \"include\" tags are allowed"));
        parse("{% sandbox %} {% include 'p' %} {% endsandbox %}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_break_outside_loop_rejected() {
        let err = parse_err("{% break %}");
        assert!(err.contains("Cannot use \"break\" outside of a loop"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_break_depth_validated() {
        let err = parse_err("{% for a in b %}{% break 2 %}{% endfor %}");
        assert!(err.contains("only 1 are open"));
        parse("{% for a in b %}{% for c in d %}{% break 2 %}{% endfor %}{% endfor %}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_tag_suggestion() {
        let err = parse_err("{% fro 'a' import b %}");
        assert!(err.contains("Unknown \"fro\" tag"));
        assert!(err.contains("Did you mean"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_stray_end_tag() {
        let err = parse_err("{% endif %}");
        assert!(err.contains("Unexpected \"endif\" tag"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_tag_reports_expected() {
        let err = parse_err("{% if a %}body");
        assert!(err.contains("Unexpected end of template"));
        assert!(err.contains("\"endif\""));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
