//! The optimizer pass: removes `raw` filters, turns printed block/parent
//! references into direct display nodes, and elides the `loop` helper
//! variable for loops that provably never observe it.

use crate::environment::Environment;
use crate::error::CompilateResult;
use crate::node::{Expr, Node};
use crate::value::Value;
use crate::visit::NodeVisitor;

pub const OPTIMIZE_NONE: u8 = 0;
pub const OPTIMIZE_FOR: u8 = 2;
pub const OPTIMIZE_RAW_FILTER: u8 = 4;
pub const OPTIMIZE_ALL: u8 = u8::MAX;

/// Runs last on enter and first on leave, so it sees the tree every other
/// pass has finished shaping. All rewrites are idempotent.
pub struct OptimizerPass {
    optimizations: u8,
    /// One flag per open `for` loop: true once that loop must materialize
    /// its `loop` variable.
    loop_stack: Vec<bool>,
}

impl OptimizerPass {
    pub fn new(optimizations: u8) -> Self {
        Self {
            optimizations,
            loop_stack: Vec::new(),
        }
    }

    fn enabled(&self, flag: u8) -> bool {
        self.optimizations & flag != 0
    }

    fn mark_current(&mut self) {
        if let Some(flag) = self.loop_stack.last_mut() {
            *flag = true;
        }
    }

    fn mark_all(&mut self) {
        for flag in self.loop_stack.iter_mut() {
            *flag = true;
        }
    }
}

impl NodeVisitor for OptimizerPass {
    fn priority(&self) -> i32 {
        255
    }

    fn enter_node(&mut self, _env: &Environment, node: &mut Node) -> CompilateResult<()> {
        if !self.enabled(OPTIMIZE_FOR) {
            return Ok(());
        }
        match node {
            Node::For { .. } => self.loop_stack.push(false),
            // A block rendered inside the loop can reach `loop` through its
            // own scope.
            Node::BlockCall { .. } | Node::DisplayBlock { .. } => self.mark_current(),
            // An include without `only` passes the whole scope along,
            // including every enclosing loop's variable.
            Node::Include { only: false, .. } => self.mark_all(),
            _ => {}
        }
        Ok(())
    }

    fn leave_node(&mut self, _env: &Environment, node: &mut Node) -> CompilateResult<bool> {
        match node {
            Node::For { with_loop, .. } if self.enabled(OPTIMIZE_FOR) => {
                *with_loop = self.loop_stack.pop().unwrap_or(true);
            }
            Node::Print { expr, line } => match expr {
                Expr::BlockRef { name, .. } => {
                    let name = std::mem::replace(
                        &mut **name,
                        Expr::constant("", *line),
                    );
                    *node = Node::DisplayBlock { name, line: *line };
                }
                Expr::Parent { .. } => {
                    *node = Node::DisplayParent { line: *line };
                }
                _ => {}
            },
            _ => {}
        }
        Ok(true)
    }

    fn enter_expr(&mut self, _env: &Environment, expr: &mut Expr) -> CompilateResult<()> {
        if !self.enabled(OPTIMIZE_FOR) || self.loop_stack.is_empty() {
            return Ok(());
        }
        match expr {
            Expr::Name { name, .. } if name == "loop" => self.mark_current(),
            Expr::BlockRef { .. } => self.mark_current(),
            Expr::GetAttr { node, attr, .. } => {
                let dynamic_attr = match &**attr {
                    Expr::Constant {
                        value: Value::Str(s),
                        ..
                    } => s == "parent",
                    Expr::Constant { .. } => false,
                    _ => true,
                };
                let reaches_loop = self.loop_stack.last().copied().unwrap_or(false)
                    || matches!(&**node, Expr::Name { name, .. } if name == "loop");
                // loop.parent (or a computed attribute on loop) exposes the
                // outer loop's variable too.
                if dynamic_attr && reaches_loop {
                    self.mark_all();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn leave_expr(&mut self, _env: &Environment, expr: &mut Expr) -> CompilateResult<()> {
        if !self.enabled(OPTIMIZE_RAW_FILTER) {
            return Ok(());
        }
        if let Expr::Filter { node, name, .. } = expr {
            if name == "raw" {
                let inner = std::mem::replace(&mut **node, Expr::constant("", 1));
                *expr = inner;
            }
        }
        Ok(())
    }
}
