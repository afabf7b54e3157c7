//! AST transformation pipeline. Passes implement [`NodeVisitor`]; the
//! [`NodeTraverser`] runs all of them in one depth-first walk, calling enter
//! hooks in ascending priority order and leave hooks in descending order.

use crate::environment::Environment;
use crate::error::CompilateResult;
use crate::node::{Expr, ModuleNode, Node};

/// One transformation pass over a parsed module. All hooks default to no-ops
/// so passes only implement the shapes they care about.
#[allow(unused_variables, reason = "default hooks ignore their arguments")]
pub trait NodeVisitor {
    /// Hook ordering within the shared walk. Lower runs first on enter, last
    /// on leave.
    fn priority(&self) -> i32 {
        0
    }

    fn enter_module(&mut self, env: &Environment, module: &mut ModuleNode) -> CompilateResult<()> {
        Ok(())
    }

    fn leave_module(&mut self, env: &Environment, module: &mut ModuleNode) -> CompilateResult<()> {
        Ok(())
    }

    fn enter_node(&mut self, env: &Environment, node: &mut Node) -> CompilateResult<()> {
        Ok(())
    }

    /// Returns false to delete the node from its parent.
    fn leave_node(&mut self, env: &Environment, node: &mut Node) -> CompilateResult<bool> {
        Ok(true)
    }

    fn enter_expr(&mut self, env: &Environment, expr: &mut Expr) -> CompilateResult<()> {
        Ok(())
    }

    fn leave_expr(&mut self, env: &Environment, expr: &mut Expr) -> CompilateResult<()> {
        Ok(())
    }

    /// Called before walking a block's stored body (blocks live on the
    /// module, not inline in the tree).
    fn enter_block_def(
        &mut self,
        env: &Environment,
        name: &str,
        body: &mut Vec<Node>,
    ) -> CompilateResult<()> {
        Ok(())
    }

    fn leave_block_def(
        &mut self,
        env: &Environment,
        name: &str,
        body: &mut Vec<Node>,
    ) -> CompilateResult<()> {
        Ok(())
    }
}

/// Runs registered visitors over a module in a single walk.
#[derive(Default)]
pub struct NodeTraverser {
    visitors: Vec<Box<dyn NodeVisitor>>,
}

impl NodeTraverser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_visitor(&mut self, visitor: Box<dyn NodeVisitor>) {
        self.visitors.push(visitor);
        self.visitors.sort_by_key(|v| v.priority());
    }

    pub fn traverse(&mut self, env: &Environment, module: &mut ModuleNode) -> CompilateResult<()> {
        for visitor in self.visitors.iter_mut() {
            visitor.enter_module(env, module)?;
        }

        self.walk_nodes(env, &mut module.body)?;

        let block_names: Vec<String> = module.blocks.keys().cloned().collect();
        for name in block_names {
            // Take the body out so visitors can observe it without aliasing
            // the module.
            let mut body = module.blocks.remove(&name).unwrap_or_default();
            for visitor in self.visitors.iter_mut() {
                visitor.enter_block_def(env, &name, &mut body)?;
            }
            self.walk_nodes(env, &mut body)?;
            for visitor in self.visitors.iter_mut().rev() {
                visitor.leave_block_def(env, &name, &mut body)?;
            }
            module.blocks.insert(name, body);
        }

        let macro_names: Vec<String> = module.macros.keys().cloned().collect();
        for name in macro_names {
            let Some(mut def) = module.macros.remove(&name) else {
                continue;
            };
            self.walk_nodes(env, &mut def.body)?;
            module.macros.insert(name, def);
        }

        for visitor in self.visitors.iter_mut().rev() {
            visitor.leave_module(env, module)?;
        }
        Ok(())
    }

    fn walk_nodes(&mut self, env: &Environment, nodes: &mut Vec<Node>) -> CompilateResult<()> {
        let mut i = 0;
        while i < nodes.len() {
            for visitor in self.visitors.iter_mut() {
                visitor.enter_node(env, &mut nodes[i])?;
            }
            self.walk_children(env, &mut nodes[i])?;
            let mut keep = true;
            for visitor in self.visitors.iter_mut().rev() {
                if !visitor.leave_node(env, &mut nodes[i])? {
                    keep = false;
                }
            }
            if keep {
                i += 1;
            } else {
                nodes.remove(i);
            }
        }
        Ok(())
    }

    fn walk_children(&mut self, env: &Environment, node: &mut Node) -> CompilateResult<()> {
        match node {
            Node::Print { expr, .. }
            | Node::CheckedPrint { expr, .. }
            | Node::Do { expr, .. } => self.walk_expr(env, expr),
            Node::DisplayBlock { name, .. } => self.walk_expr(env, name),
            Node::If {
                arms, else_body, ..
            } => {
                for (cond, body) in arms.iter_mut() {
                    self.walk_expr(env, cond)?;
                    self.walk_nodes(env, body)?;
                }
                if let Some(body) = else_body {
                    self.walk_nodes(env, body)?;
                }
                Ok(())
            }
            Node::For {
                seq,
                body,
                else_body,
                ..
            } => {
                self.walk_expr(env, seq)?;
                self.walk_nodes(env, body)?;
                if let Some(body) = else_body {
                    self.walk_nodes(env, body)?;
                }
                Ok(())
            }
            Node::Set {
                values, capture, ..
            } => {
                for value in values.iter_mut() {
                    self.walk_expr(env, value)?;
                }
                if let Some(body) = capture {
                    self.walk_nodes(env, body)?;
                }
                Ok(())
            }
            Node::Include {
                template,
                variables,
                ..
            } => {
                self.walk_expr(env, template)?;
                if let Some(variables) = variables {
                    self.walk_expr(env, variables)?;
                }
                Ok(())
            }
            Node::Import { template, .. } | Node::FromImport { template, .. } => {
                self.walk_expr(env, template)
            }
            Node::AutoEscape { body, .. } | Node::Sandbox { body, .. } => {
                self.walk_nodes(env, body)
            }
            Node::With {
                variables, body, ..
            } => {
                if let Some(variables) = variables {
                    self.walk_expr(env, variables)?;
                }
                self.walk_nodes(env, body)
            }
            Node::Text { .. }
            | Node::BlockCall { .. }
            | Node::DisplayParent { .. }
            | Node::Break { .. }
            | Node::Continue { .. }
            | Node::CheckSecurity { .. } => Ok(()),
        }
    }

    fn walk_expr(&mut self, env: &Environment, expr: &mut Expr) -> CompilateResult<()> {
        for visitor in self.visitors.iter_mut() {
            visitor.enter_expr(env, expr)?;
        }
        match expr {
            Expr::Unary { expr, .. } | Expr::Arrow { body: expr, .. } => {
                self.walk_expr(env, expr)?;
            }
            Expr::Binary { left, right, .. } => {
                self.walk_expr(env, left)?;
                self.walk_expr(env, right)?;
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
                ..
            } => {
                self.walk_expr(env, cond)?;
                self.walk_expr(env, then_expr)?;
                self.walk_expr(env, else_expr)?;
            }
            Expr::GetAttr {
                node, attr, args, ..
            } => {
                self.walk_expr(env, node)?;
                self.walk_expr(env, attr)?;
                for arg in args.iter_mut() {
                    self.walk_expr(env, &mut arg.value)?;
                }
            }
            Expr::Filter { node, args, .. } | Expr::Test { node, args, .. } => {
                self.walk_expr(env, node)?;
                for arg in args.iter_mut() {
                    self.walk_expr(env, &mut arg.value)?;
                }
            }
            Expr::Function { args, .. } => {
                for arg in args.iter_mut() {
                    self.walk_expr(env, &mut arg.value)?;
                }
            }
            Expr::Array { items, .. } => {
                for item in items.iter_mut() {
                    self.walk_expr(env, item)?;
                }
            }
            Expr::Hash { entries, .. } => {
                for (key, value) in entries.iter_mut() {
                    self.walk_expr(env, key)?;
                    self.walk_expr(env, value)?;
                }
            }
            Expr::BlockRef { name, .. } => {
                self.walk_expr(env, name)?;
            }
            Expr::Constant { .. } | Expr::Name { .. } | Expr::Parent { .. } => {}
        }
        for visitor in self.visitors.iter_mut().rev() {
            visitor.leave_expr(env, expr)?;
        }
        Ok(())
    }
}
