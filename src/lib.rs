mod args;
mod builtins;
mod compiler;
mod correctness;
mod environment;
mod error;
mod escaper;
mod expr;
mod lexer;
mod loader;
mod node;
mod optimizer;
mod parser;
mod runtime;
mod sandbox;
mod token;
mod value;
mod visit;

// Public exports.
pub use args::ParamSpec;
pub use compiler::{CompiledSource, Compiler};
pub use environment::{
    Assoc, AutoEscape, BinaryOp, Callable, Environment, FilterSpec, FunctionSpec, TestSpec,
};
pub use error::{
    CompilateError, CompilateResult, LogicError, RuntimeError, SecurityError, SyntaxError,
};
pub use escaper::{EscaperPass, escape, escape_css, escape_html, escape_js, escape_url};
pub use lexer::Lexer;
pub use loader::{ArrayLoader, ArtifactCache, Loader, MemoryCache};
pub use node::{
    AccessKind, Arg, EscapeMode, Expr, MacroDef, MacroParam, ModuleNode, Node, SourceContext,
};
pub use optimizer::{OPTIMIZE_ALL, OPTIMIZE_FOR, OPTIMIZE_NONE, OPTIMIZE_RAW_FILTER, OptimizerPass};
pub use parser::{Parser, TagParserFn};
pub use runtime::CompiledTemplate;
pub use sandbox::{SandboxPass, SecurityPolicy};
pub use token::{Token, TokenKind, TokenStream};
pub use value::{Context, Value, ValueFunc};
pub use visit::{NodeTraverser, NodeVisitor};
