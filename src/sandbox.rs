//! Sandboxing: a [`SecurityPolicy`] of allow-lists plus the visitor pass
//! that records every tag, filter, and function a template uses and plants a
//! [`Node::CheckSecurity`] guard ahead of any output.

use std::collections::{BTreeMap, BTreeSet};

use crate::environment::Environment;
use crate::error::{CompilateResult, SecurityError};
use crate::node::{Expr, ModuleNode, Node};
use crate::visit::NodeVisitor;

/// Allow-lists consulted when rendering untrusted templates. Everything not
/// explicitly allowed is rejected.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    tags: BTreeSet<String>,
    filters: BTreeSet<String>,
    functions: BTreeSet<String>,
    /// value kind -> allowed method names
    methods: BTreeMap<String, BTreeSet<String>>,
    /// value kind -> allowed property names
    properties: BTreeMap<String, BTreeSet<String>>,
}

impl SecurityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_tag<N: Into<String>>(&mut self, name: N) -> &mut Self {
        self.tags.insert(name.into());
        self
    }

    pub fn allow_filter<N: Into<String>>(&mut self, name: N) -> &mut Self {
        self.filters.insert(name.into());
        self
    }

    pub fn allow_function<N: Into<String>>(&mut self, name: N) -> &mut Self {
        self.functions.insert(name.into());
        self
    }

    pub fn allow_method<K: Into<String>, M: Into<String>>(&mut self, kind: K, method: M) -> &mut Self {
        self.methods.entry(kind.into()).or_default().insert(method.into());
        self
    }

    pub fn allow_property<K: Into<String>, P: Into<String>>(
        &mut self,
        kind: K,
        property: P,
    ) -> &mut Self {
        self.properties
            .entry(kind.into())
            .or_default()
            .insert(property.into());
        self
    }

    pub fn check_tag(&self, name: &str) -> Result<(), SecurityError> {
        if self.tags.contains(name) {
            Ok(())
        } else {
            Err(SecurityError::NotAllowedTag(name.to_string()))
        }
    }

    pub fn check_filter(&self, name: &str) -> Result<(), SecurityError> {
        if self.filters.contains(name) {
            Ok(())
        } else {
            Err(SecurityError::NotAllowedFilter(name.to_string()))
        }
    }

    pub fn check_function(&self, name: &str) -> Result<(), SecurityError> {
        if self.functions.contains(name) {
            Ok(())
        } else {
            Err(SecurityError::NotAllowedFunction(name.to_string()))
        }
    }

    pub fn check_method(&self, kind: &str, method: &str) -> Result<(), SecurityError> {
        let allowed = self
            .methods
            .get(kind)
            .is_some_and(|set| set.contains(method));
        if allowed {
            Ok(())
        } else {
            Err(SecurityError::NotAllowedMethod {
                kind: kind.to_string(),
                method: method.to_string(),
            })
        }
    }

    pub fn check_property(&self, kind: &str, property: &str) -> Result<(), SecurityError> {
        let allowed = self
            .properties
            .get(kind)
            .is_some_and(|set| set.contains(property));
        if allowed {
            Ok(())
        } else {
            Err(SecurityError::NotAllowedProperty {
                kind: kind.to_string(),
                property: property.to_string(),
            })
        }
    }

    /// Batch form used by the injected security guard.
    pub fn check_security(
        &self,
        tags: &[String],
        filters: &[String],
        functions: &[String],
    ) -> Result<(), SecurityError> {
        for tag in tags {
            self.check_tag(tag)?;
        }
        for filter in filters {
            self.check_filter(filter)?;
        }
        for function in functions {
            self.check_function(function)?;
        }
        Ok(())
    }
}

/// Collects used tag/filter/function names during the shared walk and, on
/// module leave, prepends a `CheckSecurity` node so the policy is enforced
/// before the first byte of output. Prints become `CheckedPrint` so the
/// runtime re-validates printed values.
#[derive(Default)]
pub struct SandboxPass {
    tags: BTreeSet<String>,
    filters: BTreeSet<String>,
    functions: BTreeSet<String>,
}

impl SandboxPass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeVisitor for SandboxPass {
    fn priority(&self) -> i32 {
        0
    }

    fn leave_node(&mut self, _env: &Environment, node: &mut Node) -> CompilateResult<bool> {
        if let Some(tag) = node.tag() {
            self.tags.insert(tag.to_string());
        }
        if let Node::Print { expr, line } = node {
            let line = *line;
            let expr = std::mem::replace(expr, Expr::constant("", line));
            *node = Node::CheckedPrint { expr, line };
        }
        Ok(true)
    }

    fn leave_expr(&mut self, _env: &Environment, expr: &mut Expr) -> CompilateResult<()> {
        match expr {
            // The escape filter is planted by auto-escaping, not by template
            // authors, so it is exempt from the allow-list.
            Expr::Filter { name, .. } if name != "escape" => {
                self.filters.insert(name.clone());
            }
            Expr::Function { name, .. } => {
                self.functions.insert(name.clone());
            }
            _ => {}
        }
        Ok(())
    }

    fn leave_module(&mut self, _env: &Environment, module: &mut ModuleNode) -> CompilateResult<()> {
        let check = Node::CheckSecurity {
            tags: self.tags.iter().cloned().collect(),
            filters: self.filters.iter().cloned().collect(),
            functions: self.functions.iter().cloned().collect(),
            line: 1,
        };
        module.body.insert(0, check);
        Ok(())
    }
}
