//! Output escaping: the strategy-tracking visitor pass that wraps unsafe
//! print expressions in the `escape` filter, the safety analysis it relies
//! on, and the escaper implementations for each strategy.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::environment::Environment;
use crate::error::{CompilateResult, RuntimeError};
use crate::node::{Arg, EscapeMode, Expr, ModuleNode, Node};
use crate::value::Value;
use crate::visit::NodeVisitor;

/// Wraps every print of an unsafe expression in `escape(strategy)`.
///
/// The active strategy follows a stack: the environment default at the
/// module root, pushed and popped by `{% autoescape %}` sections. Blocks are
/// walked separately from the body, so the strategy in force where a block
/// is referenced is recorded and re-applied when its stored body is walked.
///
/// Wrapping happens when a print is entered, before its expression is
/// walked, so later passes observe the injected filter and the safety
/// evidence (like a `raw` filter) is still intact when it is inspected.
#[derive(Default)]
pub struct EscaperPass {
    status_stack: Vec<Option<String>>,
    block_statuses: BTreeMap<String, Option<String>>,
    default_status: Option<String>,
}

impl EscaperPass {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Option<&String> {
        self.status_stack.last().and_then(Option::as_ref)
    }

    fn wrap_unsafe(env: &Environment, expr: &mut Expr, strategy: &str) {
        if let Expr::Conditional {
            then_expr,
            else_expr,
            ..
        } = expr
        {
            // Escape per branch; a branch that is already safe stays as is.
            Self::wrap_unsafe(env, then_expr, strategy);
            Self::wrap_unsafe(env, else_expr, strategy);
            return;
        }
        if is_safe_for(env, expr, strategy) {
            return;
        }
        let line = expr.line();
        let inner = std::mem::replace(expr, Expr::constant("", line));
        *expr = Expr::Filter {
            node: Box::new(inner),
            name: "escape".to_string(),
            args: vec![Arg::positional(Expr::constant(strategy, line))],
            line,
        };
    }
}

impl NodeVisitor for EscaperPass {
    fn priority(&self) -> i32 {
        10
    }

    fn enter_module(&mut self, env: &Environment, module: &mut ModuleNode) -> CompilateResult<()> {
        self.default_status = env.autoescape.strategy_for(&module.source.name);
        self.status_stack = vec![self.default_status.clone()];
        Ok(())
    }

    fn enter_node(&mut self, env: &Environment, node: &mut Node) -> CompilateResult<()> {
        match node {
            Node::AutoEscape { mode, .. } => {
                let status = match mode {
                    EscapeMode::Off => None,
                    EscapeMode::Strategy(s) => Some(s.clone()),
                };
                self.status_stack.push(status);
            }
            Node::Print { expr, .. } => {
                if let Some(strategy) = self.current().cloned() {
                    Self::wrap_unsafe(env, expr, &strategy);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn leave_node(&mut self, _env: &Environment, node: &mut Node) -> CompilateResult<bool> {
        match node {
            Node::AutoEscape { .. } => {
                self.status_stack.pop();
            }
            Node::BlockCall { name, .. } => {
                let status = self.status_stack.last().cloned().unwrap_or_default();
                self.block_statuses.insert(name.clone(), status);
            }
            _ => {}
        }
        Ok(true)
    }

    fn enter_block_def(
        &mut self,
        _env: &Environment,
        name: &str,
        _body: &mut Vec<Node>,
    ) -> CompilateResult<()> {
        let status = self
            .block_statuses
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_status.clone());
        self.status_stack.push(status);
        Ok(())
    }

    fn leave_block_def(
        &mut self,
        _env: &Environment,
        _name: &str,
        _body: &mut Vec<Node>,
    ) -> CompilateResult<()> {
        self.status_stack.pop();
        Ok(())
    }
}

/// Static safety analysis: whether an expression's value needs no escaping
/// under the given strategy.
pub fn is_safe_for(env: &Environment, expr: &Expr, strategy: &str) -> bool {
    match expr {
        Expr::Constant { .. } | Expr::BlockRef { .. } | Expr::Parent { .. } => true,
        Expr::Conditional {
            then_expr,
            else_expr,
            ..
        } => is_safe_for(env, then_expr, strategy) && is_safe_for(env, else_expr, strategy),
        Expr::Filter { name, args, .. } => {
            if name == "escape" {
                // Safe only for the strategy it escaped for.
                return matches!(
                    args.first().map(|a| &a.value),
                    Some(Expr::Constant {
                        value: Value::Str(s),
                        ..
                    }) if s == strategy
                );
            }
            env.get_filter(name).is_some_and(|spec| {
                spec.safe.iter().any(|s| s == "all" || s == strategy)
            })
        }
        _ => false,
    }
}

/// Applies one escaping strategy to a string.
pub fn escape(strategy: &str, input: &str) -> Result<String, RuntimeError> {
    match strategy {
        "html" => Ok(escape_html(input)),
        "js" => Ok(escape_js(input)),
        "css" => Ok(escape_css(input)),
        "url" => Ok(escape_url(input)),
        other => Err(RuntimeError::new(format!(
            "Invalid escaping strategy \"{other}\""
        ))),
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn escape_js(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '_') {
            out.push(c);
        } else {
            let code = c as u32;
            if code <= 0xFFFF {
                let _ = write!(out, "\\u{code:04X}");
            } else {
                // Astral characters as a surrogate pair.
                let code = code - 0x10000;
                let high = 0xD800 + (code >> 10);
                let low = 0xDC00 + (code & 0x3FF);
                let _ = write!(out, "\\u{high:04X}\\u{low:04X}");
            }
        }
    }
    out
}

pub fn escape_css(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            let _ = write!(out, "\\{:X} ", c as u32);
        }
    }
    out
}

pub fn escape_url(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}
