//! Early structural checks that need the whole module: `parent()` placement
//! and references to blocks that cannot exist.

use std::collections::BTreeSet;

use crate::environment::Environment;
use crate::error::CompilateResult;
use crate::node::{Expr, ModuleNode, Node};
use crate::value::Value;
use crate::visit::NodeVisitor;

/// Runs before every other pass so broken templates fail before any rewrite
/// touches them.
#[derive(Default)]
pub struct CorrectnessPass {
    source_name: String,
    has_parent: bool,
    block_names: BTreeSet<String>,
    block_depth: usize,
    capture_depth: usize,
}

impl CorrectnessPass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeVisitor for CorrectnessPass {
    fn priority(&self) -> i32 {
        -10
    }

    fn enter_module(&mut self, _env: &Environment, module: &mut ModuleNode) -> CompilateResult<()> {
        self.source_name = module.source.name.clone();
        self.has_parent = module.parent.is_some();
        self.block_names = module.blocks.keys().cloned().collect();
        Ok(())
    }

    fn enter_block_def(
        &mut self,
        _env: &Environment,
        _name: &str,
        _body: &mut Vec<Node>,
    ) -> CompilateResult<()> {
        self.block_depth += 1;
        Ok(())
    }

    fn leave_block_def(
        &mut self,
        _env: &Environment,
        _name: &str,
        _body: &mut Vec<Node>,
    ) -> CompilateResult<()> {
        self.block_depth -= 1;
        Ok(())
    }

    fn enter_node(&mut self, _env: &Environment, node: &mut Node) -> CompilateResult<()> {
        match node {
            Node::Set {
                capture: Some(_), ..
            } => self.capture_depth += 1,
            Node::BlockCall { name, line } => {
                // A block body lives on the module, so capturing it into a
                // variable would also leak it as an overridable block.
                if self.capture_depth > 0 {
                    return Err(crate::error::SyntaxError::new(
                        format!("Defining block \"{name}\" inside a capturing tag is forbidden"),
                        *line,
                        self.source_name.clone(),
                    )
                    .into());
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn leave_node(&mut self, _env: &Environment, node: &mut Node) -> CompilateResult<bool> {
        if matches!(
            node,
            Node::Set {
                capture: Some(_),
                ..
            }
        ) {
            self.capture_depth -= 1;
        }
        Ok(true)
    }

    fn enter_expr(&mut self, _env: &Environment, expr: &mut Expr) -> CompilateResult<()> {
        match expr {
            Expr::Parent { line } => {
                if self.block_depth == 0 {
                    return Err(crate::error::SyntaxError::new(
                        "Calling \"parent\" outside a block is forbidden",
                        *line,
                        self.source_name.clone(),
                    )
                    .into());
                }
                if !self.has_parent {
                    return Err(crate::error::SyntaxError::new(
                        "Calling \"parent\" on a template that does not extend another template is forbidden",
                        *line,
                        self.source_name.clone(),
                    )
                    .into());
                }
            }
            Expr::BlockRef { name, line } => {
                // Without inheritance the referenced block must exist here.
                if !self.has_parent {
                    if let Expr::Constant {
                        value: Value::Str(target),
                        ..
                    } = &**name
                    {
                        if !self.block_names.contains(target) {
                            return Err(crate::error::SyntaxError::new(
                                format!("Block \"{target}\" is not defined in this template"),
                                *line,
                                self.source_name.clone(),
                            )
                            .into());
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::visit::NodeTraverser;

    fn check(code: &str) -> CompilateResult<()> {
        let env = Environment::new();
        let stream = Lexer::new(&env).tokenize(code, "test")?;
        let mut module = Parser::new(&env, stream).parse()?;
        let mut traverser = NodeTraverser::new();
        traverser.add_visitor(Box::new(CorrectnessPass::new()));
        traverser.traverse(&env, &mut module)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_parent_outside_block_rejected() {
        let err = check("{{ parent() }}").unwrap_err();
        assert!(err.to_string().contains("outside a block"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_parent_without_extends_rejected() {
        let err = check("{% block b %}{{ parent() }}{% endblock %}").unwrap_err();
        assert!(err.to_string().contains("does not extend"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_parent_in_extending_block_allowed() {
        check("{% extends 'base' %}{% block b %}{{ parent() }}{% endblock %}").unwrap();
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_block_ref_rejected() {
        let err = check("{{ block('missing') }}").unwrap_err();
        assert!(err.to_string().contains("Block \"missing\" is not defined"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_known_block_ref_allowed() {
        check("{% block b %}x{% endblock %}{{ block('b') }}").unwrap();
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dynamic_block_ref_allowed() {
        check("{% set n = 'b' %}{% block b %}x{% endblock %}{{ block(n) }}").unwrap();
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_inside_capture_rejected() {
        let err = check("{% set x %}{% block b %}B{% endblock %}{% endset %}{{ x }}").unwrap_err();
        assert!(
            err.to_string()
                .contains("Defining block \"b\" inside a capturing tag is forbidden")
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_after_capture_allowed() {
        check("{% set x %}plain{% endset %}{% block b %}B{% endblock %}").unwrap();
    }
}
