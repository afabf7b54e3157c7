//! Lowers a transformed module into a textual artifact: a flat, readable
//! program listing with a line table back to the template source. The
//! artifact is what lands in the artifact cache and what tests inspect to
//! assert on pass output.

use crate::error::CompilateResult;
use crate::node::{Arg, Expr, MacroDef, ModuleNode, Node};
use crate::value::Value;

/// The generated artifact plus its debug line table: pairs of
/// (artifact line, template line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSource {
    pub source: String,
    pub debug_info: Vec<(usize, usize)>,
}

impl CompiledSource {
    /// The template line a given artifact line was generated from.
    pub fn template_line(&self, artifact_line: usize) -> Option<usize> {
        self.debug_info
            .iter()
            .take_while(|(a, _)| *a <= artifact_line)
            .last()
            .map(|(_, t)| *t)
    }
}

#[derive(Default)]
pub struct Compiler {
    out: String,
    indent: usize,
    temp_count: usize,
    debug_info: Vec<(usize, usize)>,
    last_line: usize,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(mut self, module: &ModuleNode) -> CompilateResult<CompiledSource> {
        self.line(format!("template {}", quote(&module.source.name)));
        if let Some(parent) = &module.parent {
            self.line(format!("extends {}", expr_text(parent)));
        }
        self.line("routine display:".to_string());
        self.indent += 1;
        self.nodes(&module.body);
        self.indent -= 1;

        for (name, body) in &module.blocks {
            self.line(format!("routine block {name}:"));
            self.indent += 1;
            self.nodes(body);
            self.indent -= 1;
        }
        for def in module.macros.values() {
            self.compile_macro(def);
        }

        Ok(CompiledSource {
            source: self.out,
            debug_info: self.debug_info,
        })
    }

    fn compile_macro(&mut self, def: &MacroDef) {
        let params: Vec<String> = def
            .params
            .iter()
            .map(|p| match &p.default {
                Some(default) => format!("{} = {}", p.name, expr_text(default)),
                None => p.name.clone(),
            })
            .collect();
        self.line(format!("routine macro {}({}):", def.name, params.join(", ")));
        self.indent += 1;
        self.nodes(&def.body);
        self.indent -= 1;
    }

    fn temp_name(&mut self) -> String {
        let name = format!("tmp_{}", self.temp_count);
        self.temp_count += 1;
        name
    }

    /// Appends one artifact line at the current indent.
    fn line(&mut self, text: String) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(&text);
        self.out.push('\n');
    }

    /// Records the source line a statement came from, once per change.
    fn mark(&mut self, template_line: usize) {
        if template_line != self.last_line {
            let artifact_line = self.out.matches('\n').count() + 1;
            self.debug_info.push((artifact_line, template_line));
            self.last_line = template_line;
            self.line(format!("# line {template_line}"));
        }
    }

    fn nodes(&mut self, nodes: &[Node]) {
        for node in nodes {
            self.node(node);
        }
    }

    fn node(&mut self, node: &Node) {
        self.mark(node.line());
        match node {
            Node::Text { data, .. } => self.line(format!("write {}", quote(data))),
            Node::Print { expr, .. } => {
                let e = expr_text(expr);
                self.line(format!("print {e}"));
            }
            Node::CheckedPrint { expr, .. } => {
                let e = expr_text(expr);
                self.line(format!("print_checked {e}"));
            }
            Node::DisplayBlock { name, .. } => {
                let e = expr_text(name);
                self.line(format!("display_block {e}"));
            }
            Node::DisplayParent { .. } => self.line("display_parent".to_string()),
            Node::If {
                arms, else_body, ..
            } => {
                for (i, (cond, body)) in arms.iter().enumerate() {
                    let kw = if i == 0 { "if" } else { "elif" };
                    let c = expr_text(cond);
                    self.line(format!("{kw} {c}:"));
                    self.indent += 1;
                    self.nodes(body);
                    self.indent -= 1;
                }
                if let Some(body) = else_body {
                    self.line("else:".to_string());
                    self.indent += 1;
                    self.nodes(body);
                    self.indent -= 1;
                }
                self.line("end if".to_string());
            }
            Node::For {
                key_target,
                value_target,
                seq,
                body,
                else_body,
                with_loop,
                ..
            } => {
                let iter = self.temp_name();
                let s = expr_text(seq);
                self.line(format!("{iter} = {s}"));
                let target = match key_target {
                    Some(key) => format!("{key}, {value_target}"),
                    None => value_target.clone(),
                };
                let suffix = if *with_loop { " with loop" } else { "" };
                self.line(format!("for {target} in {iter}{suffix}:"));
                self.indent += 1;
                self.nodes(body);
                self.indent -= 1;
                if let Some(body) = else_body {
                    self.line("for else:".to_string());
                    self.indent += 1;
                    self.nodes(body);
                    self.indent -= 1;
                }
                self.line("end for".to_string());
            }
            Node::Set {
                targets,
                values,
                capture,
                ..
            } => match capture {
                Some(body) => {
                    self.line(format!("capture {}:", targets.join(", ")));
                    self.indent += 1;
                    self.nodes(body);
                    self.indent -= 1;
                    self.line("end capture".to_string());
                }
                None => {
                    let values: Vec<String> = values.iter().map(|v| expr_text(v)).collect();
                    self.line(format!("set {} = {}", targets.join(", "), values.join(", ")));
                }
            },
            Node::BlockCall { name, .. } => self.line(format!("call block {name}")),
            Node::Include {
                template,
                variables,
                only,
                ignore_missing,
                ..
            } => {
                let mut text = format!("include {}", expr_text(template));
                if let Some(variables) = variables {
                    text.push_str(&format!(" with {}", expr_text(variables)));
                }
                if *only {
                    text.push_str(" only");
                }
                if *ignore_missing {
                    text.push_str(" ignore_missing");
                }
                self.line(text);
            }
            Node::Import {
                template, target, ..
            } => {
                let t = expr_text(template);
                self.line(format!("import {t} as {target}"));
            }
            Node::FromImport {
                template, names, ..
            } => {
                let t = expr_text(template);
                let names: Vec<String> = names
                    .iter()
                    .map(|(name, alias)| {
                        if name == alias {
                            name.clone()
                        } else {
                            format!("{name} as {alias}")
                        }
                    })
                    .collect();
                self.line(format!("from {t} import {}", names.join(", ")));
            }
            Node::AutoEscape { body, .. } => self.nodes(body),
            Node::Sandbox { body, .. } => {
                self.line("sandbox:".to_string());
                self.indent += 1;
                self.nodes(body);
                self.indent -= 1;
                self.line("end sandbox".to_string());
            }
            Node::With {
                variables,
                only,
                body,
                ..
            } => {
                let mut head = "with".to_string();
                if let Some(variables) = variables {
                    head.push_str(&format!(" {}", expr_text(variables)));
                }
                if *only {
                    head.push_str(" only");
                }
                head.push(':');
                self.line(head);
                self.indent += 1;
                self.nodes(body);
                self.indent -= 1;
                self.line("end with".to_string());
            }
            Node::Do { expr, .. } => {
                let e = expr_text(expr);
                self.line(format!("do {e}"));
            }
            Node::Break { depth, .. } => self.line(format!("break {depth}")),
            Node::Continue { depth, .. } => self.line(format!("continue {depth}")),
            Node::CheckSecurity {
                tags,
                filters,
                functions,
                ..
            } => {
                self.line(format!(
                    "check_security tags=[{}] filters=[{}] functions=[{}]",
                    tags.join(", "),
                    filters.join(", "),
                    functions.join(", ")
                ));
            }
        }
    }
}

fn expr_text(expr: &Expr) -> String {
    match expr {
        Expr::Constant { value, .. } => repr(value),
        Expr::Name { name, .. } => format!("name({name})"),
        Expr::Array { items, .. } => {
            let items: Vec<String> = items.iter().map(expr_text).collect();
            format!("[{}]", items.join(", "))
        }
        Expr::Hash { entries, .. } => {
            let entries: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}: {}", expr_text(k), expr_text(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        Expr::Unary { op, expr, .. } => format!("({op} {})", expr_text(expr)),
        Expr::Binary {
            op, left, right, ..
        } => format!("({} {op} {})", expr_text(left), expr_text(right)),
        Expr::Conditional {
            cond,
            then_expr,
            else_expr,
            ..
        } => format!(
            "({} ? {} : {})",
            expr_text(cond),
            expr_text(then_expr),
            expr_text(else_expr)
        ),
        Expr::GetAttr {
            node, attr, args, ..
        } => {
            if args.is_empty() {
                format!("attr({}, {})", expr_text(node), expr_text(attr))
            } else {
                format!(
                    "call_method({}, {}, {})",
                    expr_text(node),
                    expr_text(attr),
                    args_text(args)
                )
            }
        }
        Expr::Filter {
            node, name, args, ..
        } => format!("filter({name}, {}, {})", expr_text(node), args_text(args)),
        Expr::Function { name, args, .. } => format!("func({name}, {})", args_text(args)),
        Expr::Test {
            node, name, args, ..
        } => format!("test({name}, {}, {})", expr_text(node), args_text(args)),
        Expr::Arrow { params, body, .. } => {
            format!("arrow(({}) => {})", params.join(", "), expr_text(body))
        }
        Expr::BlockRef { name, .. } => format!("block_ref({})", expr_text(name)),
        Expr::Parent { .. } => "parent_ref()".to_string(),
    }
}

fn args_text(args: &[Arg]) -> String {
    let parts: Vec<String> = args
        .iter()
        .map(|arg| match &arg.name {
            Some(name) => format!("{name}={}", expr_text(&arg.value)),
            None => expr_text(&arg.value),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

fn quote(s: &str) -> String {
    format!("{s:?}")
}

fn repr(value: &Value) -> String {
    match value {
        Value::None => "none".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Str(s) | Value::Safe(s) => quote(s),
        Value::Seq(items) => format!("seq[{}]", items.len()),
        Value::Map(entries) => format!("map[{}]", entries.len()),
        Value::Func(_) => "func".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;

    fn artifact(code: &str) -> CompiledSource {
        let env = Environment::new();
        let template = env.compile_source(code, "test").unwrap();
        template.artifact().clone()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_artifact_header_and_text() {
        let art = artifact("hello");
        assert!(art.source.starts_with("template \"test\""));
        assert!(art.source.contains("write \"hello\""));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_materialization_visible() {
        let art = artifact("{% for i in items %}{{ loop.index }}{% endfor %}");
        assert!(art.source.contains("with loop:"));
        let art = artifact("{% for i in items %}{{ i }}{% endfor %}");
        assert!(!art.source.contains("with loop:"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escape_filter_in_artifact() {
        let art = artifact("{{ v }}");
        assert!(art.source.contains("filter(escape"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_blocks_become_routines() {
        let art = artifact("{% block title %}x{% endblock %}");
        assert!(art.source.contains("routine block title:"));
        assert!(art.source.contains("call block title"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_debug_line_table() {
        let art = artifact("a\nb\n{{ v }}");
        let print_line = art
            .source
            .lines()
            .position(|l| l.contains("print"))
            .unwrap()
            + 1;
        assert_eq!(art.template_line(print_line), Some(3));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_temp_names_unique() {
        let art = artifact("{% for i in a %}x{% endfor %}{% for j in b %}y{% endfor %}");
        assert!(art.source.contains("tmp_0 ="));
        assert!(art.source.contains("tmp_1 ="));
    }
}
