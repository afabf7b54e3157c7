use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::args::{self, ParamSpec};
use crate::builtins;
use crate::compiler::Compiler;
use crate::correctness::CorrectnessPass;
use crate::error::{CompilateError, CompilateResult, LogicError};
use crate::escaper::EscaperPass;
use crate::lexer::Lexer;
use crate::loader::{ArtifactCache, Loader};
use crate::optimizer::OptimizerPass;
use crate::parser::{Parser, TagParserFn};
use crate::sandbox::{SandboxPass, SecurityPolicy};
use crate::runtime::CompiledTemplate;
use crate::value::Value;
use crate::visit::NodeTraverser;

/// Signature shared by filter, function, and test implementations. Arguments
/// arrive already bound to the declared parameter order.
pub type Callable = fn(&Environment, &[Value]) -> CompilateResult<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryOp {
    pub precedence: u32,
    pub assoc: Assoc,
}

/// A registered filter. `safe` lists the escaping strategies whose output the
/// filter is trusted for ("all" trusts every strategy).
#[derive(Clone)]
pub struct FilterSpec {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub callable: Callable,
    pub safe: Vec<String>,
}

#[derive(Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub callable: Callable,
    pub safe: Vec<String>,
}

#[derive(Clone)]
pub struct TestSpec {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub callable: Callable,
}

/// The environment-wide auto-escaping default. Individual templates override
/// it with `{% autoescape %}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoEscape {
    Off,
    Strategy(String),
    /// Pick the strategy from the template's file extension.
    FromName,
}

impl AutoEscape {
    /// Resolves the strategy for a template. `FromName` maps well-known
    /// extensions, defaulting to html for anything unrecognized.
    pub fn strategy_for(&self, template_name: &str) -> Option<String> {
        match self {
            Self::Off => None,
            Self::Strategy(s) => Some(s.clone()),
            Self::FromName => {
                let name = template_name.strip_suffix(".twig").unwrap_or(template_name);
                if name.ends_with(".txt") {
                    None
                } else if name.ends_with(".js") {
                    Some("js".to_string())
                } else if name.ends_with(".css") {
                    Some("css".to_string())
                } else {
                    Some("html".to_string())
                }
            }
        }
    }
}

/// Holds every extension point and configuration knob, and drives the
/// lex/parse/visit/compile pipeline. Compiled templates are cached per
/// environment.
pub struct Environment {
    filters: BTreeMap<String, FilterSpec>,
    functions: BTreeMap<String, FunctionSpec>,
    tests: BTreeMap<String, TestSpec>,
    tag_parsers: BTreeMap<String, TagParserFn>,
    unary_ops: BTreeMap<String, u32>,
    binary_ops: BTreeMap<String, BinaryOp>,
    /// All operator lexemes, longest first, for the lexer's longest-match scan.
    op_lexemes: Vec<String>,

    pub autoescape: AutoEscape,
    pub strict_variables: bool,
    pub sandboxed: bool,
    pub policy: SecurityPolicy,
    /// Bitfield of enabled optimizations; 0 disables the optimizer pass.
    pub optimizations: u8,

    loader: Option<Box<dyn Loader>>,
    artifact_cache: Option<Box<dyn ArtifactCache>>,
    templates: RefCell<BTreeMap<String, Rc<CompiledTemplate>>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        let mut env = Self {
            filters: BTreeMap::new(),
            functions: BTreeMap::new(),
            tests: BTreeMap::new(),
            tag_parsers: BTreeMap::new(),
            unary_ops: BTreeMap::new(),
            binary_ops: BTreeMap::new(),
            op_lexemes: Vec::new(),
            autoescape: AutoEscape::Strategy("html".to_string()),
            strict_variables: false,
            sandboxed: false,
            policy: SecurityPolicy::default(),
            optimizations: u8::MAX,
            loader: None,
            artifact_cache: None,
            templates: RefCell::new(BTreeMap::new()),
        };
        builtins::register(&mut env).unwrap_or_else(|err| {
            unreachable!("builtin registration is statically valid: {err}")
        });
        env
    }

    pub fn set_loader(&mut self, loader: Box<dyn Loader>) {
        self.loader = Some(loader);
    }

    pub fn set_artifact_cache(&mut self, cache: Box<dyn ArtifactCache>) {
        self.artifact_cache = Some(cache);
    }

    pub fn add_filter(&mut self, filter: FilterSpec) -> Result<(), LogicError> {
        args::validate_params("filter", &filter.name, &filter.params)?;
        self.filters.insert(filter.name.clone(), filter);
        Ok(())
    }

    pub fn add_function(&mut self, function: FunctionSpec) -> Result<(), LogicError> {
        args::validate_params("function", &function.name, &function.params)?;
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    pub fn add_test(&mut self, test: TestSpec) -> Result<(), LogicError> {
        args::validate_params("test", &test.name, &test.params)?;
        self.tests.insert(test.name.clone(), test);
        Ok(())
    }

    /// Registers a statement tag. The parser dispatches `{% name ... %}` to
    /// the given sub-parser.
    pub fn add_tag_parser<N: Into<String>>(&mut self, name: N, parser: TagParserFn) {
        self.tag_parsers.insert(name.into(), parser);
    }

    pub fn add_unary_operator<N: Into<String>>(&mut self, name: N, precedence: u32) {
        self.unary_ops.insert(name.into(), precedence);
        self.rebuild_op_lexemes();
    }

    pub fn add_binary_operator<N: Into<String>>(
        &mut self,
        name: N,
        precedence: u32,
        assoc: Assoc,
    ) {
        self.binary_ops.insert(name.into(), BinaryOp { precedence, assoc });
        self.rebuild_op_lexemes();
    }

    fn rebuild_op_lexemes(&mut self) {
        let mut lexemes: Vec<String> = self
            .unary_ops
            .keys()
            .chain(self.binary_ops.keys())
            .cloned()
            .collect();
        lexemes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        lexemes.dedup();
        self.op_lexemes = lexemes;
    }

    pub fn get_filter(&self, name: &str) -> Option<&FilterSpec> {
        self.filters.get(name)
    }

    pub fn get_function(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.get(name)
    }

    pub fn get_test(&self, name: &str) -> Option<&TestSpec> {
        self.tests.get(name)
    }

    pub fn get_tag_parser(&self, name: &str) -> Option<TagParserFn> {
        self.tag_parsers.get(name).copied()
    }

    pub fn unary_op(&self, name: &str) -> Option<u32> {
        self.unary_ops.get(name).copied()
    }

    pub fn binary_op(&self, name: &str) -> Option<BinaryOp> {
        self.binary_ops.get(name).copied()
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn test_names(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tag_parsers.keys().map(String::as_str)
    }

    /// Operator lexemes ordered longest first; the lexer consumes these with
    /// a longest-match scan.
    pub fn operator_lexemes(&self) -> &[String] {
        &self.op_lexemes
    }

    /// Runs the full pipeline on one source: lex, parse, visitor passes, and
    /// artifact generation.
    pub fn compile_source(&self, code: &str, name: &str) -> CompilateResult<Rc<CompiledTemplate>> {
        log::debug!("compiling template \"{name}\"");
        let stream = Lexer::new(self).tokenize(code, name)?;
        let mut module = Parser::new(self, stream).parse()?;

        let mut traverser = NodeTraverser::new();
        traverser.add_visitor(Box::new(CorrectnessPass::new()));
        if self.sandboxed {
            traverser.add_visitor(Box::new(SandboxPass::new()));
        }
        traverser.add_visitor(Box::new(EscaperPass::new()));
        if self.optimizations != 0 {
            traverser.add_visitor(Box::new(OptimizerPass::new(self.optimizations)));
        }
        traverser.traverse(self, &mut module)?;

        let artifact = Compiler::new().compile(&module)?;
        Ok(Rc::new(CompiledTemplate::new(module, artifact)))
    }

    /// Loads, compiles, and caches a template by name. Compilation happens at
    /// most once per name and environment; the artifact cache, when present,
    /// receives the generated source for external reuse.
    pub fn get_template(&self, name: &str) -> CompilateResult<Rc<CompiledTemplate>> {
        if let Some(template) = self.templates.borrow().get(name) {
            return Ok(Rc::clone(template));
        }
        let Some(loader) = &self.loader else {
            return Err(CompilateError::MissingTemplate {
                template_name: name.to_string(),
            });
        };
        let source = loader.resolve(name)?;
        let template = self.compile_source(&source.code, name)?;
        if let Some(cache) = &self.artifact_cache {
            let key = loader.cache_key(name)?;
            cache.write(&key, &template.artifact().source);
        }
        self.templates
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&template));
        Ok(template)
    }

    /// Convenience shortcut: compile an inline source and render it.
    pub fn render_str(
        &self,
        code: &str,
        name: &str,
        context: &crate::value::Context,
    ) -> CompilateResult<String> {
        self.compile_source(code, name)?.render(self, context)
    }

    /// Render a named template through the loader.
    pub fn render(&self, name: &str, context: &crate::value::Context) -> CompilateResult<String> {
        self.get_template(name)?.render(self, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_default_operators_registered() {
        let env = Environment::new();
        assert!(env.binary_op("+").is_some());
        assert!(env.binary_op("not in").is_some());
        assert!(env.unary_op("not").is_some());
        assert_eq!(env.binary_op("**").unwrap().assoc, Assoc::Right);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_lexemes_sorted_longest_first() {
        let env = Environment::new();
        let lexemes = env.operator_lexemes();
        for pair in lexemes.windows(2) {
            assert!(pair[0].len() >= pair[1].len());
        }
        assert!(lexemes.iter().any(|l| l == "starts with"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_autoescape_from_name() {
        let auto = AutoEscape::FromName;
        assert_eq!(auto.strategy_for("page.html"), Some("html".to_string()));
        assert_eq!(auto.strategy_for("app.js.twig"), Some("js".to_string()));
        assert_eq!(auto.strategy_for("style.css"), Some("css".to_string()));
        assert_eq!(auto.strategy_for("mail.txt"), None);
        assert_eq!(auto.strategy_for("noext"), Some("html".to_string()));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_bad_variadic_filter_rejected() {
        let mut env = Environment::new();
        let err = env
            .add_filter(FilterSpec {
                name: "bad".to_string(),
                params: vec![ParamSpec::variadic("rest"), ParamSpec::required("x")],
                callable: |_, _| Ok(Value::None),
                safe: vec![],
            })
            .unwrap_err();
        assert!(err.0.contains("must be the last one"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_loader_reports_missing_template() {
        let env = Environment::new();
        let err = env.get_template("nope.html").unwrap_err();
        assert!(matches!(err, CompilateError::MissingTemplate { .. }));
    }
}
