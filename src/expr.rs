//! Expression grammar: precedence climbing over the environment's operator
//! tables, plus the postfix chain (attribute access, subscripts, filters,
//! tests) and call-argument parsing.

use crate::args::{self};
use crate::environment::Assoc;
use crate::error::CompilateResult;
use crate::node::{AccessKind, Arg, Expr};
use crate::parser::{unknown_message, Parser};
use crate::token::TokenKind;
use crate::value::Value;

impl Parser<'_> {
    /// Parses an expression whose operators all bind at least as tightly as
    /// `min_prec`. The ternary conditional is only considered at the top
    /// level (`min_prec == 0`).
    pub(crate) fn parse_expression(&mut self, min_prec: u32) -> CompilateResult<Expr> {
        let mut expr = self.parse_unary()?;
        loop {
            let token = self.stream.current().clone();
            if token.kind != TokenKind::Operator {
                break;
            }
            let Some(op) = self.env.binary_op(&token.value) else {
                break;
            };
            if op.precedence < min_prec {
                break;
            }
            self.stream.next_token();
            let line = token.line;
            match token.value.as_str() {
                "is" => expr = self.parse_test(expr, false, line)?,
                "is not" => expr = self.parse_test(expr, true, line)?,
                ".." => {
                    // Ranges are sugar for the range() function, so they go
                    // through the same registry as an explicit call.
                    let right = self.parse_expression(op.precedence + 1)?;
                    expr = self.build_function_call(
                        "range",
                        vec![Arg::positional(expr), Arg::positional(right)],
                        line,
                    )?;
                }
                _ => {
                    let next_min = match op.assoc {
                        Assoc::Left => op.precedence + 1,
                        Assoc::Right => op.precedence,
                    };
                    let right = self.parse_expression(next_min)?;
                    expr = Expr::Binary {
                        op: token.value,
                        left: Box::new(expr),
                        right: Box::new(right),
                        line,
                    };
                }
            }
        }
        if min_prec == 0 {
            expr = self.parse_ternary(expr)?;
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> CompilateResult<Expr> {
        let token = self.stream.current().clone();
        if token.kind == TokenKind::Operator {
            if let Some(prec) = self.env.unary_op(&token.value) {
                self.stream.next_token();
                let operand = self.parse_expression(prec)?;
                return Ok(Expr::Unary {
                    op: token.value,
                    expr: Box::new(operand),
                    line: token.line,
                });
            }
        }
        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    fn parse_primary(&mut self) -> CompilateResult<Expr> {
        let token = self.stream.current().clone();
        let line = token.line;
        match token.kind {
            TokenKind::Number => {
                self.stream.next_token();
                let value = if token.value.contains('.') {
                    token.value.parse::<f64>().map(Value::Float).ok()
                } else {
                    token.value.parse::<i64>().map(Value::Int).ok()
                };
                match value {
                    Some(value) => Ok(Expr::Constant { value, line }),
                    None => {
                        Err(self.error(format!("Invalid number \"{}\"", token.value), line).into())
                    }
                }
            }
            TokenKind::String | TokenKind::InterpolationStart => self.parse_string(),
            TokenKind::Name => {
                match token.value.as_str() {
                    "true" => {
                        self.stream.next_token();
                        return Ok(Expr::constant(true, line));
                    }
                    "false" => {
                        self.stream.next_token();
                        return Ok(Expr::constant(false, line));
                    }
                    "none" | "null" => {
                        self.stream.next_token();
                        return Ok(Expr::Constant {
                            value: Value::None,
                            line,
                        });
                    }
                    _ => {}
                }
                if self.stream.look(1).kind == TokenKind::Arrow {
                    self.stream.next_token();
                    self.stream.next_token();
                    let body = self.parse_expression(0)?;
                    return Ok(Expr::Arrow {
                        params: vec![token.value],
                        body: Box::new(body),
                        line,
                    });
                }
                self.stream.next_token();
                if self.stream.test(TokenKind::Punctuation, Some("(")) {
                    return self.parse_call(&token.value, line);
                }
                Ok(Expr::Name {
                    name: token.value,
                    line,
                })
            }
            TokenKind::Punctuation => match token.value.as_str() {
                "(" => {
                    if self.arrow_ahead() {
                        return self.parse_arrow(line);
                    }
                    self.stream.next_token();
                    let expr = self.parse_expression(0)?;
                    self.stream.expect(TokenKind::Punctuation, Some(")"))?;
                    Ok(expr)
                }
                "[" => self.parse_array(line),
                "{" => self.parse_hash(line),
                _ => Err(self
                    .error(format!("Unexpected token punctuation \"{}\"", token.value), line)
                    .into()),
            },
            _ => Err(self
                .error(format!("Unexpected token {}", token.kind), line)
                .into()),
        }
    }

    /// String literal, possibly with `#{...}` interpolations; interpolated
    /// parts fold into a concatenation chain.
    fn parse_string(&mut self) -> CompilateResult<Expr> {
        let mut parts: Vec<Expr> = Vec::new();
        loop {
            let token = self.stream.current().clone();
            match token.kind {
                TokenKind::String => {
                    self.stream.next_token();
                    parts.push(Expr::constant(token.value, token.line));
                }
                TokenKind::InterpolationStart => {
                    self.stream.next_token();
                    let expr = self.parse_expression(0)?;
                    self.stream.expect(TokenKind::InterpolationEnd, None)?;
                    parts.push(expr);
                }
                _ => break,
            }
        }
        let mut iter = parts.into_iter();
        let first = iter.next().unwrap_or_else(|| Expr::constant("", 1));
        Ok(iter.fold(first, |left, right| {
            let line = left.line();
            Expr::Binary {
                op: "~".to_string(),
                left: Box::new(left),
                right: Box::new(right),
                line,
            }
        }))
    }

    fn parse_array(&mut self, line: usize) -> CompilateResult<Expr> {
        self.stream.expect(TokenKind::Punctuation, Some("["))?;
        let mut items = Vec::new();
        while !self.stream.test(TokenKind::Punctuation, Some("]")) {
            items.push(self.parse_expression(0)?);
            if !self.stream.next_if(TokenKind::Punctuation, Some(",")) {
                break;
            }
        }
        self.stream.expect(TokenKind::Punctuation, Some("]"))?;
        Ok(Expr::Array { items, line })
    }

    fn parse_hash(&mut self, line: usize) -> CompilateResult<Expr> {
        self.stream.expect(TokenKind::Punctuation, Some("{"))?;
        let mut entries = Vec::new();
        while !self.stream.test(TokenKind::Punctuation, Some("}")) {
            let token = self.stream.current().clone();
            let key = match token.kind {
                TokenKind::String | TokenKind::Name => {
                    self.stream.next_token();
                    Expr::constant(token.value, token.line)
                }
                TokenKind::Number => {
                    self.stream.next_token();
                    Expr::constant(token.value, token.line)
                }
                TokenKind::Punctuation if token.value == "(" => {
                    self.stream.next_token();
                    let key = self.parse_expression(0)?;
                    self.stream.expect(TokenKind::Punctuation, Some(")"))?;
                    key
                }
                _ => {
                    return Err(self
                        .error(
                            "A hash key must be a quoted string, a number, a name, or an expression enclosed in parentheses",
                            token.line,
                        )
                        .into());
                }
            };
            self.stream.expect(TokenKind::Punctuation, Some(":"))?;
            let value = self.parse_expression(0)?;
            entries.push((key, value));
            if !self.stream.next_if(TokenKind::Punctuation, Some(",")) {
                break;
            }
        }
        self.stream.expect(TokenKind::Punctuation, Some("}"))?;
        Ok(Expr::Hash { entries, line })
    }

    /// True when the upcoming tokens read `( name, ... ) =>`.
    fn arrow_ahead(&self) -> bool {
        if self.stream.look(1).test(TokenKind::Punctuation, Some(")")) {
            return self.stream.look(2).kind == TokenKind::Arrow;
        }
        let mut n = 1;
        loop {
            if self.stream.look(n).kind != TokenKind::Name {
                return false;
            }
            n += 1;
            let sep = self.stream.look(n);
            if sep.test(TokenKind::Punctuation, Some(")")) {
                return self.stream.look(n + 1).kind == TokenKind::Arrow;
            }
            if !sep.test(TokenKind::Punctuation, Some(",")) {
                return false;
            }
            n += 1;
        }
    }

    fn parse_arrow(&mut self, line: usize) -> CompilateResult<Expr> {
        self.stream.expect(TokenKind::Punctuation, Some("("))?;
        let mut params = Vec::new();
        while !self.stream.test(TokenKind::Punctuation, Some(")")) {
            params.push(self.stream.expect(TokenKind::Name, None)?.value);
            if !self.stream.next_if(TokenKind::Punctuation, Some(",")) {
                break;
            }
        }
        self.stream.expect(TokenKind::Punctuation, Some(")"))?;
        self.stream.expect(TokenKind::Arrow, None)?;
        let body = self.parse_expression(0)?;
        Ok(Expr::Arrow {
            params,
            body: Box::new(body),
            line,
        })
    }

    /// A name followed by `(`: block/parent references, a registered
    /// function, or an imported macro.
    fn parse_call(&mut self, name: &str, line: usize) -> CompilateResult<Expr> {
        match name {
            "block" => {
                self.stream.expect(TokenKind::Punctuation, Some("("))?;
                let target = self.parse_expression(0)?;
                self.stream.expect(TokenKind::Punctuation, Some(")"))?;
                Ok(Expr::BlockRef {
                    name: Box::new(target),
                    line,
                })
            }
            "parent" => {
                self.stream.expect(TokenKind::Punctuation, Some("("))?;
                self.stream.expect(TokenKind::Punctuation, Some(")"))?;
                Ok(Expr::Parent { line })
            }
            _ => {
                let call_args = self.parse_args()?;
                self.build_function_call(name, call_args, line)
            }
        }
    }

    pub(crate) fn build_function_call(
        &mut self,
        name: &str,
        call_args: Vec<Arg>,
        line: usize,
    ) -> CompilateResult<Expr> {
        if let Some(spec) = self.env.get_function(name) {
            let bound = args::bind_arguments(
                "function",
                name,
                &spec.params,
                call_args,
                line,
                self.stream.source_name(),
            )?;
            return Ok(Expr::Function {
                name: name.to_string(),
                args: bound.into_iter().map(Arg::positional).collect(),
                line,
            });
        }
        // Imported macros bind lazily at call time against their own
        // parameter list, so their arguments stay as written.
        if self.imported_names.contains(name) {
            return Ok(Expr::Function {
                name: name.to_string(),
                args: call_args,
                line,
            });
        }
        let candidates: Vec<&str> = self.env.function_names().collect();
        Err(self
            .error(unknown_message("function", name, &candidates), line)
            .into())
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> CompilateResult<Expr> {
        loop {
            let token = self.stream.current().clone();
            if token.kind != TokenKind::Punctuation {
                break;
            }
            match token.value.as_str() {
                "." => {
                    self.stream.next_token();
                    let attr = self.stream.current().clone();
                    if attr.kind != TokenKind::Name && attr.kind != TokenKind::Number {
                        return Err(self
                            .error("Expected name or number after \".\"", attr.line)
                            .into());
                    }
                    self.stream.next_token();
                    let (call_args, kind) = if self.stream.test(TokenKind::Punctuation, Some("("))
                    {
                        (self.parse_args()?, AccessKind::Method)
                    } else {
                        (Vec::new(), AccessKind::Any)
                    };
                    expr = Expr::GetAttr {
                        node: Box::new(expr),
                        attr: Box::new(Expr::constant(attr.value, attr.line)),
                        args: call_args,
                        kind,
                        line: token.line,
                    };
                }
                "[" => {
                    self.stream.next_token();
                    let index = self.parse_expression(0)?;
                    self.stream.expect(TokenKind::Punctuation, Some("]"))?;
                    expr = Expr::GetAttr {
                        node: Box::new(expr),
                        attr: Box::new(index),
                        args: Vec::new(),
                        kind: AccessKind::Item,
                        line: token.line,
                    };
                }
                "|" => {
                    self.stream.next_token();
                    let name = self.stream.expect(TokenKind::Name, None)?;
                    let call_args = if self.stream.test(TokenKind::Punctuation, Some("(")) {
                        self.parse_args()?
                    } else {
                        Vec::new()
                    };
                    expr = self.build_filter(expr, &name.value, call_args, name.line)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    pub(crate) fn build_filter(
        &mut self,
        node: Expr,
        name: &str,
        call_args: Vec<Arg>,
        line: usize,
    ) -> CompilateResult<Expr> {
        let Some(spec) = self.env.get_filter(name) else {
            let candidates: Vec<&str> = self.env.filter_names().collect();
            return Err(self
                .error(unknown_message("filter", name, &candidates), line)
                .into());
        };
        let bound = args::bind_arguments(
            "filter",
            name,
            &spec.params,
            call_args,
            line,
            self.stream.source_name(),
        )?;
        Ok(Expr::Filter {
            node: Box::new(node),
            name: name.to_string(),
            args: bound.into_iter().map(Arg::positional).collect(),
            line,
        })
    }

    fn parse_test(&mut self, node: Expr, negated: bool, line: usize) -> CompilateResult<Expr> {
        let first = self.stream.expect(TokenKind::Name, None)?;
        let mut name = first.value;
        // Two-word tests ("divisible by", "same as") are registered under
        // their joined name.
        if self.stream.test(TokenKind::Name, None) {
            let joined = format!("{name} {}", self.stream.current().value);
            if self.env.get_test(&joined).is_some() {
                self.stream.next_token();
                name = joined;
            }
        }
        let call_args = if self.stream.test(TokenKind::Punctuation, Some("(")) {
            self.parse_args()?
        } else {
            Vec::new()
        };
        let Some(spec) = self.env.get_test(&name) else {
            let candidates: Vec<&str> = self.env.test_names().collect();
            return Err(self
                .error(unknown_message("test", &name, &candidates), line)
                .into());
        };
        let bound = args::bind_arguments(
            "test",
            &name,
            &spec.params,
            call_args,
            line,
            self.stream.source_name(),
        )?;
        let test = Expr::Test {
            node: Box::new(node),
            name,
            args: bound.into_iter().map(Arg::positional).collect(),
            line,
        };
        Ok(if negated {
            Expr::Unary {
                op: "not".to_string(),
                expr: Box::new(test),
                line,
            }
        } else {
            test
        })
    }

    fn parse_ternary(&mut self, cond: Expr) -> CompilateResult<Expr> {
        if !self.stream.next_if(TokenKind::Punctuation, Some("?")) {
            return Ok(cond);
        }
        let line = cond.line();
        if self.stream.next_if(TokenKind::Punctuation, Some(":")) {
            // Elvis form: `a ?: b` yields a itself when truthy.
            let else_expr = self.parse_expression(0)?;
            return Ok(Expr::Conditional {
                then_expr: Box::new(cond.clone()),
                cond: Box::new(cond),
                else_expr: Box::new(else_expr),
                line,
            });
        }
        let then_expr = self.parse_expression(0)?;
        let else_expr = if self.stream.next_if(TokenKind::Punctuation, Some(":")) {
            self.parse_expression(0)?
        } else {
            Expr::constant("", line)
        };
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
            line,
        })
    }

    /// Parenthesized call arguments, positional and named. Positional
    /// arguments must come first.
    pub(crate) fn parse_args(&mut self) -> CompilateResult<Vec<Arg>> {
        self.stream.expect(TokenKind::Punctuation, Some("("))?;
        let mut call_args = Vec::new();
        let mut seen_named = false;
        while !self.stream.test(TokenKind::Punctuation, Some(")")) {
            let named = self.stream.current().kind == TokenKind::Name
                && (self.stream.look(1).test(TokenKind::Punctuation, Some(":"))
                    || self.stream.look(1).test(TokenKind::Punctuation, Some("=")));
            if named {
                let name = self.stream.next_token().value;
                self.stream.next_token();
                let value = self.parse_expression(0)?;
                seen_named = true;
                call_args.push(Arg::named(name, value));
            } else {
                if seen_named {
                    let line = self.stream.current().line;
                    return Err(self
                        .error(
                            "Positional arguments cannot be used after named arguments",
                            line,
                        )
                        .into());
                }
                call_args.push(Arg::positional(self.parse_expression(0)?));
            }
            if !self.stream.next_if(TokenKind::Punctuation, Some(",")) {
                break;
            }
        }
        self.stream.expect(TokenKind::Punctuation, Some(")"))?;
        Ok(call_args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::lexer::Lexer;
    use crate::node::{ModuleNode, Node};

    fn parse_expr(code: &str) -> Expr {
        try_parse_expr(code).unwrap()
    }

    fn try_parse_expr(code: &str) -> CompilateResult<Expr> {
        let env = Environment::new();
        let source = format!("{{{{ {code} }}}}");
        let stream = Lexer::new(&env).tokenize(&source, "test")?;
        let module: ModuleNode = Parser::new(&env, stream).parse()?;
        let Node::Print { expr, .. } = module.body.into_iter().next().unwrap() else {
            panic!("expected print node");
        };
        Ok(expr)
    }

    fn expr_err(code: &str) -> String {
        try_parse_expr(code).unwrap_err().to_string()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_number_literals() {
        assert_eq!(parse_expr("42"), Expr::constant(42i64, 1));
        assert_eq!(parse_expr("2.5"), Expr::constant(2.5f64, 1));
        assert_eq!(parse_expr("1_000"), Expr::constant(1000i64, 1));
        let err = expr_err("99999999999999999999");
        assert!(err.contains("Invalid number"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_precedence() {
        let expr = parse_expr("1 + 2 * 3");
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, "+");
        assert!(matches!(*right, Expr::Binary { ref op, .. } if op == "*"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_power_right_assoc() {
        let expr = parse_expr("2 ** 3 ** 2");
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, "**");
        assert!(matches!(*right, Expr::Binary { ref op, .. } if op == "**"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unary_binds_tighter_than_and() {
        let expr = parse_expr("not a and b");
        assert!(matches!(expr, Expr::Binary { ref op, .. } if op == "and"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_range_desugars_to_function() {
        let expr = parse_expr("1..5");
        assert!(matches!(expr, Expr::Function { ref name, .. } if name == "range"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_null_coalesce() {
        let expr = parse_expr("a ?? 'fallback'");
        assert!(matches!(expr, Expr::Binary { ref op, .. } if op == "??"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_ternary_and_elvis() {
        let expr = parse_expr("a ? 'y' : 'n'");
        assert!(matches!(expr, Expr::Conditional { .. }));
        let expr = parse_expr("a ?: 'n'");
        let Expr::Conditional { cond, then_expr, .. } = expr else {
            panic!("expected conditional");
        };
        assert_eq!(cond, then_expr);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_attribute_chain() {
        let expr = parse_expr("user.name");
        let Expr::GetAttr { kind, attr, .. } = expr else {
            panic!("expected getattr");
        };
        assert_eq!(kind, AccessKind::Any);
        assert_eq!(*attr, Expr::constant("name", 1));

        let expr = parse_expr("user['name']");
        assert!(matches!(
            expr,
            Expr::GetAttr {
                kind: AccessKind::Item,
                ..
            }
        ));

        let expr = parse_expr("user.rank(3)");
        assert!(matches!(
            expr,
            Expr::GetAttr {
                kind: AccessKind::Method,
                ..
            }
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_filter_with_bound_args() {
        let expr = parse_expr("items|join(', ')");
        let Expr::Filter { name, args, .. } = expr else {
            panic!("expected filter");
        };
        assert_eq!(name, "join");
        assert_eq!(args.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_filter_default_filled() {
        // join's separator defaults to the empty string.
        let expr = parse_expr("items|join");
        let Expr::Filter { args, .. } = expr else {
            panic!("expected filter");
        };
        assert_eq!(args[0].value, Expr::constant("", 1));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_filter_suggestion() {
        let err = expr_err("a|uppr");
        assert!(err.contains("Unknown \"uppr\" filter"));
        assert!(err.contains("Did you mean \"upper\"?"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_function_suggestion() {
        let err = expr_err("cycl(['a'], 1)");
        assert!(err.contains("Unknown \"cycl\" function"));
        assert!(err.contains("Did you mean \"cycle\"?"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tests() {
        let expr = parse_expr("a is defined");
        assert!(matches!(expr, Expr::Test { ref name, .. } if name == "defined"));
        let expr = parse_expr("a is not defined");
        let Expr::Unary { op, expr, .. } = expr else {
            panic!("expected negated test");
        };
        assert_eq!(op, "not");
        assert!(matches!(*expr, Expr::Test { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_test_with_args() {
        let expr = parse_expr("a is divisible by(3)");
        assert!(matches!(expr, Expr::Test { ref name, .. } if name == "divisible by"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_test_suggestion() {
        let err = expr_err("a is defned");
        assert!(err.contains("Unknown \"defned\" test"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_array_and_hash_literals() {
        let expr = parse_expr("[1, 2, 3,]");
        assert!(matches!(expr, Expr::Array { ref items, .. } if items.len() == 3));
        let expr = parse_expr("{'a': 1, b: 2, 3: 'c'}");
        assert!(matches!(expr, Expr::Hash { ref entries, .. } if entries.len() == 3));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_bad_hash_key() {
        let err = expr_err("{[1]: 'a'}");
        assert!(err.contains("A hash key must be"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arrow_functions() {
        let expr = parse_expr("items|map(v => v * 2)");
        let Expr::Filter { args, .. } = expr else {
            panic!("expected filter");
        };
        assert!(matches!(
            &args[0].value,
            Expr::Arrow { params, .. } if params == &["v".to_string()]
        ));

        let expr = parse_expr("items|map((k, v) => v)");
        let Expr::Filter { args, .. } = expr else {
            panic!("expected filter");
        };
        assert!(matches!(
            &args[0].value,
            Expr::Arrow { params, .. } if params.len() == 2
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_parenthesized_not_arrow() {
        let expr = parse_expr("(a) ~ 'x'");
        assert!(matches!(expr, Expr::Binary { ref op, .. } if op == "~"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_and_parent_references() {
        let expr = parse_expr("block('title')");
        assert!(matches!(expr, Expr::BlockRef { .. }));
        let expr = parse_expr("parent()");
        assert!(matches!(expr, Expr::Parent { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_named_args() {
        let expr = parse_expr("range(low: 1, high: 5)");
        let Expr::Function { args, .. } = expr else {
            panic!("expected function");
        };
        // low, high, step (defaulted)
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].value, Expr::constant(1i64, 1));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_positional_after_named_in_call() {
        let err = expr_err("range(low: 1, 5)");
        assert!(err.contains("Positional arguments cannot be used after named arguments"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_interpolation_concat() {
        let expr = parse_expr("\"a#{b}c\"");
        // ("a" ~ b) ~ "c"
        let Expr::Binary { op, left, .. } = expr else {
            panic!("expected concat chain");
        };
        assert_eq!(op, "~");
        assert!(matches!(*left, Expr::Binary { ref op, .. } if op == "~"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comparison_chain_words() {
        let expr = parse_expr("name starts with 'a' and name ends with 'z'");
        assert!(matches!(expr, Expr::Binary { ref op, .. } if op == "and"));
        let expr = parse_expr("x not in [1, 2]");
        assert!(matches!(expr, Expr::Binary { ref op, .. } if op == "not in"));
    }
}
