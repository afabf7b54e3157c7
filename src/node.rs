use std::collections::BTreeMap;
use std::sync::Arc;

use crate::value::Value;

/// Identifies a template's origin for error reporting. Shared by reference
/// among every node of one parse.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceContext {
    pub name: String,
    pub code: String,
    pub path: Option<String>,
}

impl SourceContext {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, code: C) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            path: None,
        }
    }
}

/// One parsed call-site argument, optionally named (`name: value`).
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

impl Arg {
    pub fn positional(value: Expr) -> Self {
        Self { name: None, value }
    }

    pub fn named<N: Into<String>>(name: N, value: Expr) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }
}

/// How a subscript was written in the source; drives both runtime lookup
/// order and sandbox method checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// `foo.bar` - attribute first, then item.
    Any,
    /// `foo["bar"]` - item access only.
    Item,
    /// `foo.bar(...)` - a method-style call.
    Method,
}

/// Expression sub-tree. A closed variant: node behavior is dispatched by
/// matching, extension happens through the operator/filter/function
/// registries rather than new variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant {
        value: Value,
        line: usize,
    },
    Name {
        name: String,
        line: usize,
    },
    Array {
        items: Vec<Expr>,
        line: usize,
    },
    Hash {
        entries: Vec<(Expr, Expr)>,
        line: usize,
    },
    Unary {
        op: String,
        expr: Box<Expr>,
        line: usize,
    },
    Binary {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
        line: usize,
    },
    Conditional {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        line: usize,
    },
    GetAttr {
        node: Box<Expr>,
        attr: Box<Expr>,
        args: Vec<Arg>,
        kind: AccessKind,
        line: usize,
    },
    /// `value|name(args)`; chains nest, the outermost filter is applied last.
    Filter {
        node: Box<Expr>,
        name: String,
        args: Vec<Arg>,
        line: usize,
    },
    Function {
        name: String,
        args: Vec<Arg>,
        line: usize,
    },
    /// `value is name(args)`; negation is wrapped in a `not` unary.
    Test {
        node: Box<Expr>,
        name: String,
        args: Vec<Arg>,
        line: usize,
    },
    Arrow {
        params: Vec<String>,
        body: Box<Expr>,
        line: usize,
    },
    /// `block("name")` - renders a block to a string.
    BlockRef {
        name: Box<Expr>,
        line: usize,
    },
    /// `parent()` - renders the overridden block of the parent template.
    Parent {
        line: usize,
    },
}

impl Expr {
    pub fn line(&self) -> usize {
        match self {
            Self::Constant { line, .. }
            | Self::Name { line, .. }
            | Self::Array { line, .. }
            | Self::Hash { line, .. }
            | Self::Unary { line, .. }
            | Self::Binary { line, .. }
            | Self::Conditional { line, .. }
            | Self::GetAttr { line, .. }
            | Self::Filter { line, .. }
            | Self::Function { line, .. }
            | Self::Test { line, .. }
            | Self::Arrow { line, .. }
            | Self::BlockRef { line, .. }
            | Self::Parent { line } => *line,
        }
    }

    pub fn constant<V: Into<Value>>(value: V, line: usize) -> Self {
        Self::Constant {
            value: value.into(),
            line,
        }
    }

    /// True when the expression is a plain constant value.
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant { .. })
    }
}

/// A macro parameter: name plus optional default expression.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroParam {
    pub name: String,
    pub default: Option<Expr>,
}

/// A template-defined, parameterized rendering function. Stored on the module
/// rather than inline in the body.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<MacroParam>,
    pub body: Vec<Node>,
    pub line: usize,
}

/// The auto-escape state selected by an `{% autoescape %}` tag or the
/// environment default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeMode {
    Off,
    Strategy(String),
}

/// Statement-level AST node. The tree is acyclic and single-owner: children
/// are plain owned vectors, a node removed from its parent is gone.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text {
        data: String,
        line: usize,
    },
    Print {
        expr: Expr,
        line: usize,
    },
    /// A sandboxed print; the runtime re-checks the printed value.
    CheckedPrint {
        expr: Expr,
        line: usize,
    },
    /// Optimizer rewrite of `{{ block("x") }}`: display directly, skipping
    /// the intermediate string buffer.
    DisplayBlock {
        name: Expr,
        line: usize,
    },
    /// Optimizer rewrite of `{{ parent() }}`.
    DisplayParent {
        line: usize,
    },
    If {
        arms: Vec<(Expr, Vec<Node>)>,
        else_body: Option<Vec<Node>>,
        line: usize,
    },
    For {
        key_target: Option<String>,
        value_target: String,
        seq: Expr,
        body: Vec<Node>,
        else_body: Option<Vec<Node>>,
        /// Whether the `loop` helper variable must be materialized; decided
        /// by the optimizer pass, defaults to true until it runs.
        with_loop: bool,
        line: usize,
    },
    Set {
        targets: Vec<String>,
        values: Vec<Expr>,
        /// `{% set x %}...{% endset %}` captures its body instead.
        capture: Option<Vec<Node>>,
        line: usize,
    },
    /// Marks where a block renders in the body; the body itself lives in the
    /// module's block table.
    BlockCall {
        name: String,
        line: usize,
    },
    Include {
        template: Expr,
        variables: Option<Expr>,
        only: bool,
        ignore_missing: bool,
        line: usize,
    },
    /// `{% import "t" as alias %}`.
    Import {
        template: Expr,
        target: String,
        line: usize,
    },
    /// `{% from "t" import a as b, c %}`.
    FromImport {
        template: Expr,
        names: Vec<(String, String)>,
        line: usize,
    },
    AutoEscape {
        mode: EscapeMode,
        body: Vec<Node>,
        line: usize,
    },
    Sandbox {
        body: Vec<Node>,
        line: usize,
    },
    With {
        variables: Option<Expr>,
        only: bool,
        body: Vec<Node>,
        line: usize,
    },
    Do {
        expr: Expr,
        line: usize,
    },
    Break {
        depth: usize,
        line: usize,
    },
    Continue {
        depth: usize,
        line: usize,
    },
    /// Injected by the sandbox pass at the head of the module body; validates
    /// collected names against the policy before any output is produced.
    CheckSecurity {
        tags: Vec<String>,
        filters: Vec<String>,
        functions: Vec<String>,
        line: usize,
    },
}

impl Node {
    pub fn line(&self) -> usize {
        match self {
            Self::Text { line, .. }
            | Self::Print { line, .. }
            | Self::CheckedPrint { line, .. }
            | Self::DisplayBlock { line, .. }
            | Self::DisplayParent { line }
            | Self::If { line, .. }
            | Self::For { line, .. }
            | Self::Set { line, .. }
            | Self::BlockCall { line, .. }
            | Self::Include { line, .. }
            | Self::Import { line, .. }
            | Self::FromImport { line, .. }
            | Self::AutoEscape { line, .. }
            | Self::Sandbox { line, .. }
            | Self::With { line, .. }
            | Self::Do { line, .. }
            | Self::Break { line, .. }
            | Self::Continue { line, .. }
            | Self::CheckSecurity { line, .. } => *line,
        }
    }

    /// The template tag the node was produced by, for security tracking.
    /// Expression-only constructs have none.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Self::If { .. } => Some("if"),
            Self::For { .. } => Some("for"),
            Self::Set { .. } => Some("set"),
            Self::BlockCall { .. } => Some("block"),
            Self::Include { .. } => Some("include"),
            Self::Import { .. } => Some("import"),
            Self::FromImport { .. } => Some("from"),
            Self::AutoEscape { .. } => Some("autoescape"),
            Self::Sandbox { .. } => Some("sandbox"),
            Self::With { .. } => Some("with"),
            Self::Do { .. } => Some("do"),
            Self::Break { .. } => Some("break"),
            Self::Continue { .. } => Some("continue"),
            Self::Text { .. }
            | Self::Print { .. }
            | Self::CheckedPrint { .. }
            | Self::DisplayBlock { .. }
            | Self::DisplayParent { .. }
            | Self::CheckSecurity { .. } => None,
        }
    }

    /// True for text nodes that are empty or whitespace only.
    pub fn is_blank_text(&self) -> bool {
        match self {
            Self::Text { data, .. } => data.trim().is_empty(),
            _ => false,
        }
    }
}

/// The AST root for one parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleNode {
    pub body: Vec<Node>,
    pub parent: Option<Expr>,
    pub blocks: BTreeMap<String, Vec<Node>>,
    pub macros: BTreeMap<String, MacroDef>,
    pub source: Arc<SourceContext>,
}

impl ModuleNode {
    pub fn new(source: Arc<SourceContext>) -> Self {
        Self {
            body: Vec::new(),
            parent: None,
            blocks: BTreeMap::new(),
            macros: BTreeMap::new(),
            source,
        }
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_node_tag() {
        let node = Node::If {
            arms: vec![],
            else_body: None,
            line: 1,
        };
        assert_eq!(node.tag(), Some("if"));
        let node = Node::Print {
            expr: Expr::constant(1i64, 1),
            line: 1,
        };
        assert_eq!(node.tag(), None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_blank_text() {
        assert!(Node::Text { data: "  \n\t".to_string(), line: 1 }.is_blank_text());
        assert!(!Node::Text { data: " x ".to_string(), line: 1 }.is_blank_text());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_expr_line() {
        let expr = Expr::Binary {
            op: "+".to_string(),
            left: Box::new(Expr::constant(1i64, 3)),
            right: Box::new(Expr::constant(2i64, 3)),
            line: 3,
        };
        assert_eq!(expr.line(), 3);
    }
}
