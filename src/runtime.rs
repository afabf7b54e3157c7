//! Executes a compiled template: walks the frozen syntax tree with a scope
//! stack, resolving inheritance, blocks, macros, and includes through the
//! owning [`Environment`].

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use crate::compiler::CompiledSource;
use crate::environment::Environment;
use crate::error::{CompilateError, CompilateResult, RuntimeError};
use crate::node::{AccessKind, Arg, Expr, MacroDef, ModuleNode, Node, SourceContext};
use crate::value::{Context, Value, ValueFunc};

const MAX_INHERITANCE_DEPTH: usize = 64;
const MAX_CALL_DEPTH: usize = 256;

/// A template after the full pipeline: the rewritten syntax tree the runtime
/// walks, plus the generated artifact for caching and inspection.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    module: ModuleNode,
    artifact: CompiledSource,
}

impl CompiledTemplate {
    pub fn new(module: ModuleNode, artifact: CompiledSource) -> Self {
        Self { module, artifact }
    }

    pub fn module(&self) -> &ModuleNode {
        &self.module
    }

    pub fn artifact(&self) -> &CompiledSource {
        &self.artifact
    }

    pub fn source_name(&self) -> &str {
        &self.module.source.name
    }

    /// Renders with the given variables. The environment supplies filters,
    /// functions, the loader for inheritance and includes, and the policy.
    pub fn render(&self, env: &Environment, context: &Context) -> CompilateResult<String> {
        let mut scope = BTreeMap::new();
        for (name, value) in context.iter() {
            scope.insert(name.clone(), value.clone());
        }
        self.render_with(env, scope, env.sandboxed)
    }

    /// Entry point shared by [`Self::render`] and nested includes, which pass
    /// an already-built scope and the caller's sandbox state.
    pub(crate) fn render_with(
        &self,
        env: &Environment,
        scope: BTreeMap<String, Value>,
        sandboxed: bool,
    ) -> CompilateResult<String> {
        let mut state = State::new(scope, sandboxed);
        // A module compiled in a sandboxed environment carries a static
        // security guard. One pulled in by a `{% sandbox %}` include does
        // not, so its statements are checked as they execute.
        let statically_checked = matches!(self.module.body.first(), Some(Node::CheckSecurity { .. }));
        state.enforce_tags = sandboxed && !statically_checked;
        for (name, def) in &self.module.macros {
            state.macros.insert(name.clone(), def.clone());
        }

        // Resolve the extends chain before anything renders. Parent names may
        // be dynamic, so each one is evaluated in the child's scope.
        let shell = Renderer {
            env,
            root: &self.module,
            ancestors: Vec::new(),
        };
        let mut ancestors: Vec<Rc<CompiledTemplate>> = Vec::new();
        let mut next = self.module.parent.clone();
        while let Some(expr) = next {
            if ancestors.len() >= MAX_INHERITANCE_DEPTH {
                return Err(RuntimeError::new(format!(
                    "Template \"{}\" has an inheritance chain deeper than {MAX_INHERITANCE_DEPTH} levels",
                    self.source_name()
                ))
                .into());
            }
            let name = shell
                .eval(&mut state, &expr)?
                .to_display_string()
                .into_owned();
            let parent = env.get_template(&name)?;
            next = parent.module.parent.clone();
            for (macro_name, def) in &parent.module.macros {
                state
                    .macros
                    .entry(macro_name.clone())
                    .or_insert_with(|| def.clone());
            }
            ancestors.push(parent);
        }

        let renderer = Renderer {
            env,
            root: &self.module,
            ancestors,
        };
        renderer.display(&mut state)?;
        Ok(state.out)
    }
}

/// Control flow escaping a statement list.
enum Flow {
    Normal,
    Break(usize),
    Continue(usize),
}

/// Mutable render state: the scope stack, output buffer, macro tables, and
/// which block of which chain member is currently executing.
struct State {
    scopes: Vec<BTreeMap<String, Value>>,
    /// Directly callable macros: local definitions plus `from ... import`.
    macros: BTreeMap<String, MacroDef>,
    /// `import ... as alias` namespaces.
    namespaces: BTreeMap<String, BTreeMap<String, MacroDef>>,
    /// (block name, chain index) of each block currently rendering.
    block_stack: Vec<(String, usize)>,
    /// When non-zero, missing variables and attributes resolve to none even
    /// under strict mode. Raised around `??`, `default`, and `defined`.
    lenient: usize,
    sandboxed: bool,
    /// Check statement tags at execution time instead of through a static
    /// guard.
    enforce_tags: bool,
    call_depth: usize,
    out: String,
}

impl State {
    fn new(scope: BTreeMap<String, Value>, sandboxed: bool) -> Self {
        Self {
            scopes: vec![scope],
            macros: BTreeMap::new(),
            namespaces: BTreeMap::new(),
            block_stack: Vec::new(),
            lenient: 0,
            sandboxed,
            enforce_tags: false,
            call_depth: 0,
            out: String::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
    }

    fn set(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    /// The scope stack merged into one map, innermost bindings winning.
    fn flatten(&self) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        for scope in &self.scopes {
            merged.extend(scope.clone());
        }
        merged
    }
}

/// Immutable per-render context: the template chain and the environment. All
/// mutation goes through the [`State`] threaded alongside.
struct Renderer<'r> {
    env: &'r Environment,
    root: &'r ModuleNode,
    /// Parents in extension order, child-most first after `root`.
    ancestors: Vec<Rc<CompiledTemplate>>,
}

impl Renderer<'_> {
    fn chain_len(&self) -> usize {
        self.ancestors.len() + 1
    }

    fn module_at(&self, index: usize) -> &ModuleNode {
        if index == 0 {
            self.root
        } else {
            &self.ancestors[index - 1].module
        }
    }

    /// Top-level display: extending templates run their setup statements
    /// first, then the layout (the root-most ancestor) produces the output.
    fn display(&self, st: &mut State) -> CompilateResult<()> {
        let last = self.chain_len() - 1;
        for i in 0..=last {
            let module = self.module_at(i);
            if i == last {
                self.exec_nodes(st, &module.body)?;
            } else {
                for node in &module.body {
                    match node {
                        Node::Text { .. } | Node::BlockCall { .. } => {}
                        _ => {
                            self.exec_node(st, node)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Renders the child-most definition of a block at or below `from` in
    /// the chain.
    fn display_block(&self, st: &mut State, name: &str, from: usize) -> CompilateResult<Flow> {
        for i in from..self.chain_len() {
            if let Some(body) = self.module_at(i).blocks.get(name) {
                st.block_stack.push((name.to_string(), i));
                let flow = self.exec_nodes(st, body);
                st.block_stack.pop();
                return flow;
            }
        }
        Err(RuntimeError::new(format!("Block \"{name}\" does not exist")).into())
    }

    /// Renders the next definition up the chain of the block currently
    /// executing.
    fn display_parent_block(&self, st: &mut State) -> CompilateResult<Flow> {
        let Some((name, index)) = st.block_stack.last().cloned() else {
            return Err(RuntimeError::new("Calling \"parent\" outside a block is forbidden").into());
        };
        for i in (index + 1)..self.chain_len() {
            if self.module_at(i).has_block(&name) {
                let flow = self.display_block_at(st, &name, i)?;
                return Ok(flow);
            }
        }
        Err(RuntimeError::new(format!("Block \"{name}\" has no parent block")).into())
    }

    fn display_block_at(&self, st: &mut State, name: &str, index: usize) -> CompilateResult<Flow> {
        let Some(body) = self.module_at(index).blocks.get(name) else {
            return Err(RuntimeError::new(format!("Block \"{name}\" does not exist")).into());
        };
        st.block_stack.push((name.to_string(), index));
        let flow = self.exec_nodes(st, body);
        st.block_stack.pop();
        flow
    }

    fn exec_nodes(&self, st: &mut State, nodes: &[Node]) -> CompilateResult<Flow> {
        for node in nodes {
            match self.exec_node(st, node)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_node(&self, st: &mut State, node: &Node) -> CompilateResult<Flow> {
        if st.sandboxed && st.enforce_tags {
            if let Some(tag) = node.tag() {
                self.env.policy.check_tag(tag)?;
            }
        }
        match node {
            Node::Text { data, .. } => {
                st.out.push_str(data);
                Ok(Flow::Normal)
            }
            Node::Print { expr, .. } => {
                let value = self.eval(st, expr)?;
                st.out.push_str(&value.to_display_string());
                Ok(Flow::Normal)
            }
            Node::CheckedPrint { expr, .. } => {
                let value = self.eval(st, expr)?;
                // Displaying a callable would invoke host code, which the
                // policy must sign off on.
                if st.sandboxed && matches!(value, Value::Func(_)) {
                    self.env.policy.check_method(value.kind(), "to_string")?;
                }
                st.out.push_str(&value.to_display_string());
                Ok(Flow::Normal)
            }
            Node::DisplayBlock { name, .. } => {
                let name = self.eval(st, name)?.to_display_string().into_owned();
                self.display_block(st, &name, 0)
            }
            Node::DisplayParent { .. } => self.display_parent_block(st),
            Node::BlockCall { name, .. } => self.display_block(st, name, 0),
            Node::If {
                arms, else_body, ..
            } => {
                for (cond, body) in arms {
                    if self.eval(st, cond)?.is_true() {
                        return self.exec_nodes(st, body);
                    }
                }
                match else_body {
                    Some(body) => self.exec_nodes(st, body),
                    None => Ok(Flow::Normal),
                }
            }
            Node::For {
                key_target,
                value_target,
                seq,
                body,
                else_body,
                with_loop,
                ..
            } => self.exec_for(st, key_target.as_deref(), value_target, seq, body, else_body.as_deref(), *with_loop),
            Node::Set {
                targets,
                values,
                capture,
                ..
            } => {
                if let Some(body) = capture {
                    let saved = std::mem::take(&mut st.out);
                    let flow = self.exec_nodes(st, body)?;
                    let captured = std::mem::replace(&mut st.out, saved);
                    if let Some(target) = targets.first() {
                        st.set(target, Value::Safe(captured));
                    }
                    return Ok(flow);
                }
                for (target, value) in targets.iter().zip(values) {
                    let value = self.eval(st, value)?;
                    st.set(target, value);
                }
                Ok(Flow::Normal)
            }
            Node::Include {
                template,
                variables,
                only,
                ignore_missing,
                ..
            } => {
                let name = self.eval(st, template)?.to_display_string().into_owned();
                let included = match self.env.get_template(&name) {
                    Ok(template) => template,
                    Err(CompilateError::MissingTemplate { .. }) if *ignore_missing => {
                        return Ok(Flow::Normal);
                    }
                    Err(err) => return Err(err),
                };
                let mut scope = if *only { BTreeMap::new() } else { st.flatten() };
                if let Some(variables) = variables {
                    let variables = self.eval(st, variables)?;
                    let Value::Map(entries) = variables else {
                        return Err(RuntimeError::new(format!(
                            "Variables passed to the \"include\" tag must be a map, got a {}",
                            variables.kind()
                        ))
                        .into());
                    };
                    scope.extend(entries);
                }
                let rendered = included.render_with(self.env, scope, st.sandboxed)?;
                st.out.push_str(&rendered);
                Ok(Flow::Normal)
            }
            Node::Import {
                template, target, ..
            } => {
                let name = self.eval(st, template)?.to_display_string().into_owned();
                let imported = self.env.get_template(&name)?;
                st.namespaces
                    .insert(target.clone(), imported.module.macros.clone());
                Ok(Flow::Normal)
            }
            Node::FromImport {
                template, names, ..
            } => {
                let template_name = self.eval(st, template)?.to_display_string().into_owned();
                let imported = self.env.get_template(&template_name)?;
                for (name, alias) in names {
                    let Some(def) = imported.module.macros.get(name) else {
                        return Err(RuntimeError::new(format!(
                            "Macro \"{name}\" is not defined in template \"{template_name}\""
                        ))
                        .into());
                    };
                    st.macros.insert(alias.clone(), def.clone());
                }
                Ok(Flow::Normal)
            }
            Node::AutoEscape { body, .. } => self.exec_nodes(st, body),
            Node::Sandbox { body, .. } => {
                let was = st.sandboxed;
                st.sandboxed = true;
                let flow = self.exec_nodes(st, body);
                st.sandboxed = was;
                flow
            }
            Node::With {
                variables,
                only,
                body,
                ..
            } => {
                let vars = match variables {
                    Some(expr) => {
                        let value = self.eval(st, expr)?;
                        let Value::Map(entries) = value else {
                            return Err(RuntimeError::new(format!(
                                "Variables passed to the \"with\" tag must be a map, got a {}",
                                value.kind()
                            ))
                            .into());
                        };
                        entries
                    }
                    None => BTreeMap::new(),
                };
                if *only {
                    let saved = std::mem::replace(&mut st.scopes, vec![vars]);
                    let flow = self.exec_nodes(st, body);
                    st.scopes = saved;
                    flow
                } else {
                    st.scopes.push(vars);
                    let flow = self.exec_nodes(st, body);
                    st.scopes.pop();
                    flow
                }
            }
            Node::Do { expr, .. } => {
                self.eval(st, expr)?;
                Ok(Flow::Normal)
            }
            Node::Break { depth, .. } => Ok(Flow::Break(*depth)),
            Node::Continue { depth, .. } => Ok(Flow::Continue(*depth)),
            Node::CheckSecurity {
                tags,
                filters,
                functions,
                ..
            } => {
                if st.sandboxed {
                    self.env.policy.check_security(tags, filters, functions)?;
                }
                Ok(Flow::Normal)
            }
        }
    }

    fn exec_for(
        &self,
        st: &mut State,
        key_target: Option<&str>,
        value_target: &str,
        seq: &Expr,
        body: &[Node],
        else_body: Option<&[Node]>,
        with_loop: bool,
    ) -> CompilateResult<Flow> {
        let seq_value = self.eval(st, seq)?;
        let pairs = seq_value.iter_pairs();
        if pairs.is_empty() {
            return match else_body {
                Some(body) => self.exec_nodes(st, body),
                None => Ok(Flow::Normal),
            };
        }
        let numeric_keys = matches!(seq_value, Value::Seq(_));
        // loop.parent exposes the surrounding context, including any outer
        // loop variable.
        let parent_context = if with_loop {
            Some(Value::Map(st.flatten()))
        } else {
            None
        };
        let length = pairs.len();
        st.scopes.push(BTreeMap::new());
        let mut result = Flow::Normal;
        for (i, (key, value)) in pairs.into_iter().enumerate() {
            if let Some(target) = key_target {
                let key_value = if numeric_keys {
                    Value::Int(i as i64)
                } else {
                    Value::Str(key)
                };
                st.set(target, key_value);
            }
            st.set(value_target, value);
            if with_loop {
                let mut entries = BTreeMap::new();
                entries.insert("index".to_string(), Value::Int(i as i64 + 1));
                entries.insert("index0".to_string(), Value::Int(i as i64));
                entries.insert("revindex".to_string(), Value::Int((length - i) as i64));
                entries.insert("revindex0".to_string(), Value::Int((length - i - 1) as i64));
                entries.insert("first".to_string(), Value::Bool(i == 0));
                entries.insert("last".to_string(), Value::Bool(i + 1 == length));
                entries.insert("length".to_string(), Value::Int(length as i64));
                if let Some(parent) = &parent_context {
                    entries.insert("parent".to_string(), parent.clone());
                }
                st.set("loop", Value::Map(entries));
            }
            match self.exec_nodes(st, body)? {
                Flow::Normal | Flow::Continue(1) => {}
                Flow::Continue(depth) => {
                    result = Flow::Continue(depth - 1);
                    break;
                }
                Flow::Break(1) => break,
                Flow::Break(depth) => {
                    result = Flow::Break(depth - 1);
                    break;
                }
            }
        }
        st.scopes.pop();
        Ok(result)
    }

    /// Evaluates with missing names resolving to none regardless of strict
    /// mode.
    fn eval_lenient(&self, st: &mut State, expr: &Expr) -> CompilateResult<Value> {
        st.lenient += 1;
        let result = self.eval(st, expr);
        st.lenient -= 1;
        result
    }

    fn eval(&self, st: &mut State, expr: &Expr) -> CompilateResult<Value> {
        match expr {
            Expr::Constant { value, .. } => Ok(value.clone()),
            Expr::Name { name, .. } => match st.lookup(name) {
                Some(value) => Ok(value),
                None if self.env.strict_variables && st.lenient == 0 => Err(RuntimeError::new(
                    format!("Variable \"{name}\" does not exist"),
                )
                .into()),
                None => Ok(Value::None),
            },
            Expr::Array { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(st, item)?);
                }
                Ok(Value::Seq(values))
            }
            Expr::Hash { entries, .. } => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = self.eval(st, key)?.to_display_string().into_owned();
                    map.insert(key, self.eval(st, value)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Unary { op, expr, .. } => self.eval_unary(st, op, expr),
            Expr::Binary {
                op, left, right, ..
            } => self.eval_binary(st, op, left, right),
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
                ..
            } => {
                if self.eval(st, cond)?.is_true() {
                    self.eval(st, then_expr)
                } else {
                    self.eval(st, else_expr)
                }
            }
            Expr::GetAttr {
                node,
                attr,
                args,
                kind,
                ..
            } => self.eval_get_attr(st, node, attr, args, *kind),
            Expr::Filter {
                node, name, args, ..
            } => {
                if st.sandboxed && name != "escape" {
                    self.env.policy.check_filter(name)?;
                }
                // `default` tolerates a missing subject; that is its job.
                let value = if name == "default" {
                    self.eval_lenient(st, node)?
                } else {
                    self.eval(st, node)?
                };
                let mut call_args = vec![value];
                for arg in args {
                    call_args.push(self.eval(st, &arg.value)?);
                }
                let Some(spec) = self.env.get_filter(name) else {
                    return Err(RuntimeError::new(format!("Unknown filter \"{name}\"")).into());
                };
                (spec.callable)(self.env, &call_args)
            }
            Expr::Function { name, args, .. } => {
                if let Some(spec) = self.env.get_function(name) {
                    if st.sandboxed {
                        self.env.policy.check_function(name)?;
                    }
                    let mut call_args = Vec::with_capacity(args.len());
                    for arg in args {
                        call_args.push(self.eval(st, &arg.value)?);
                    }
                    return (spec.callable)(self.env, &call_args);
                }
                if let Some(def) = st.macros.get(name).cloned() {
                    return self.call_macro(st, &def, args);
                }
                Err(RuntimeError::new(format!("Unknown function \"{name}\"")).into())
            }
            Expr::Test {
                node, name, args, ..
            } => {
                if name == "defined" {
                    return Ok(Value::Bool(self.is_defined(st, node)?));
                }
                let mut call_args = vec![self.eval(st, node)?];
                for arg in args {
                    call_args.push(self.eval(st, &arg.value)?);
                }
                let Some(spec) = self.env.get_test(name) else {
                    return Err(RuntimeError::new(format!("Unknown test \"{name}\"")).into());
                };
                (spec.callable)(self.env, &call_args)
            }
            Expr::Arrow { params, body, .. } => {
                let params = params.clone();
                let body = (**body).clone();
                let snapshot = st.flatten();
                let sandboxed = st.sandboxed;
                Ok(Value::Func(ValueFunc::new(move |env, args| {
                    let source = Arc::new(SourceContext::new("closure", ""));
                    let module = ModuleNode::new(source);
                    let renderer = Renderer {
                        env,
                        root: &module,
                        ancestors: Vec::new(),
                    };
                    let mut scope = snapshot.clone();
                    for (i, param) in params.iter().enumerate() {
                        scope.insert(param.clone(), args.get(i).cloned().unwrap_or_default());
                    }
                    let mut state = State::new(scope, sandboxed);
                    renderer.eval(&mut state, &body)
                })))
            }
            Expr::BlockRef { name, .. } => {
                let name = self.eval(st, name)?.to_display_string().into_owned();
                let saved = std::mem::take(&mut st.out);
                let result = self.display_block(st, &name, 0);
                let captured = std::mem::replace(&mut st.out, saved);
                result?;
                Ok(Value::Safe(captured))
            }
            Expr::Parent { .. } => {
                let saved = std::mem::take(&mut st.out);
                let result = self.display_parent_block(st);
                let captured = std::mem::replace(&mut st.out, saved);
                result?;
                Ok(Value::Safe(captured))
            }
        }
    }

    fn eval_unary(&self, st: &mut State, op: &str, expr: &Expr) -> CompilateResult<Value> {
        let value = self.eval(st, expr)?;
        match op {
            "not" => Ok(Value::Bool(!value.is_true())),
            "-" => match value {
                Value::Int(n) => Ok(Value::Int(n.checked_neg().unwrap_or(i64::MAX))),
                Value::Float(n) => Ok(Value::Float(-n)),
                other => Ok(Value::Float(-other.as_number()?)),
            },
            "+" => match value {
                Value::Int(_) | Value::Float(_) => Ok(value),
                other => Ok(Value::Float(other.as_number()?)),
            },
            other => Err(RuntimeError::new(format!("Unknown unary operator \"{other}\"")).into()),
        }
    }

    fn eval_binary(
        &self,
        st: &mut State,
        op: &str,
        left: &Expr,
        right: &Expr,
    ) -> CompilateResult<Value> {
        // Short-circuiting operators evaluate their own operands.
        match op {
            "and" => {
                let l = self.eval(st, left)?;
                if !l.is_true() {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval(st, right)?.is_true()));
            }
            "or" => {
                let l = self.eval(st, left)?;
                if l.is_true() {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval(st, right)?.is_true()));
            }
            "??" => {
                let l = self.eval_lenient(st, left)?;
                return if l.is_none() {
                    self.eval(st, right)
                } else {
                    Ok(l)
                };
            }
            _ => {}
        }
        let l = self.eval(st, left)?;
        let r = self.eval(st, right)?;
        match op {
            "==" => Ok(Value::Bool(l.loose_eq(&r))),
            "!=" => Ok(Value::Bool(!l.loose_eq(&r))),
            "<" => Ok(Value::Bool(compare(&l, &r).is_lt())),
            "<=" => Ok(Value::Bool(compare(&l, &r).is_le())),
            ">" => Ok(Value::Bool(compare(&l, &r).is_gt())),
            ">=" => Ok(Value::Bool(compare(&l, &r).is_ge())),
            "in" => Ok(Value::Bool(r.contains(&l))),
            "not in" => Ok(Value::Bool(!r.contains(&l))),
            "starts with" => Ok(Value::Bool(
                l.to_display_string()
                    .starts_with(r.to_display_string().as_ref()),
            )),
            "ends with" => Ok(Value::Bool(
                l.to_display_string()
                    .ends_with(r.to_display_string().as_ref()),
            )),
            "~" => {
                let mut text = l.to_display_string().into_owned();
                text.push_str(&r.to_display_string());
                // Concatenating two safe strings cannot introduce unsafe
                // content.
                if matches!((&l, &r), (Value::Safe(_), Value::Safe(_))) {
                    Ok(Value::Safe(text))
                } else {
                    Ok(Value::Str(text))
                }
            }
            "b-and" => Ok(Value::Int((l.as_number()? as i64) & (r.as_number()? as i64))),
            "b-or" => Ok(Value::Int((l.as_number()? as i64) | (r.as_number()? as i64))),
            "b-xor" => Ok(Value::Int((l.as_number()? as i64) ^ (r.as_number()? as i64))),
            "+" | "-" | "*" | "/" | "//" | "%" | "**" => arith(op, &l, &r),
            other => Err(RuntimeError::new(format!("Unknown operator \"{other}\"")).into()),
        }
    }

    fn eval_get_attr(
        &self,
        st: &mut State,
        node: &Expr,
        attr: &Expr,
        args: &[Arg],
        kind: AccessKind,
    ) -> CompilateResult<Value> {
        // Macro namespaces shadow variables for method-style calls.
        if kind == AccessKind::Method {
            if let Expr::Name { name: namespace, .. } = node {
                if st.namespaces.contains_key(namespace) {
                    let macro_name = self.eval(st, attr)?.to_display_string().into_owned();
                    let def = st
                        .namespaces
                        .get(namespace)
                        .and_then(|space| space.get(&macro_name))
                        .cloned();
                    let Some(def) = def else {
                        return Err(RuntimeError::new(format!(
                            "Macro \"{macro_name}\" is not defined in \"{namespace}\""
                        ))
                        .into());
                    };
                    return self.call_macro(st, &def, args);
                }
            }
        }

        let obj = self.eval(st, node)?;
        let key = self.eval(st, attr)?;
        match kind {
            AccessKind::Item => match obj.get_item(&key) {
                Some(value) => Ok(value),
                None => self.missing_member(st, &obj, &key, "key"),
            },
            AccessKind::Any => {
                let name = key.to_display_string();
                match obj.get_attr(&name).or_else(|| obj.get_item(&key)) {
                    Some(value) => Ok(value),
                    None => self.missing_member(st, &obj, &key, "attribute"),
                }
            }
            AccessKind::Method => {
                let name = key.to_display_string().into_owned();
                match obj.get_attr(&name) {
                    Some(Value::Func(func)) => {
                        if st.sandboxed {
                            self.env.policy.check_method(obj.kind(), &name)?;
                        }
                        let mut call_args = Vec::with_capacity(args.len());
                        for arg in args {
                            call_args.push(self.eval(st, &arg.value)?);
                        }
                        func.call(self.env, &call_args)
                    }
                    Some(value) if args.is_empty() => Ok(value),
                    Some(_) => Err(RuntimeError::new(format!(
                        "\"{name}\" on a {} value is not callable",
                        obj.kind()
                    ))
                    .into()),
                    None if st.lenient > 0 => Ok(Value::None),
                    None => Err(RuntimeError::new(format!(
                        "Method \"{name}\" does not exist on a {} value",
                        obj.kind()
                    ))
                    .into()),
                }
            }
        }
    }

    fn missing_member(
        &self,
        st: &State,
        obj: &Value,
        key: &Value,
        what: &str,
    ) -> CompilateResult<Value> {
        if self.env.strict_variables && st.lenient == 0 {
            return Err(RuntimeError::new(format!(
                "Impossible to access {} (\"{}\") on a {} variable",
                if what == "key" { "a key" } else { "an attribute" },
                key.to_display_string(),
                obj.kind()
            ))
            .into());
        }
        Ok(Value::None)
    }

    fn is_defined(&self, st: &mut State, expr: &Expr) -> CompilateResult<bool> {
        match expr {
            Expr::Name { name, .. } => Ok(st.lookup(name).is_some()),
            Expr::GetAttr { .. } => Ok(!self.eval_lenient(st, expr)?.is_none()),
            _ => {
                self.eval_lenient(st, expr)?;
                Ok(true)
            }
        }
    }

    /// Invokes a macro: binds call arguments against its parameter list,
    /// executes the body in an isolated scope, and returns the output as
    /// already-safe markup.
    fn call_macro(&self, st: &mut State, def: &MacroDef, args: &[Arg]) -> CompilateResult<Value> {
        if st.call_depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::new(format!(
                "Macro \"{}\" exceeded the call depth limit of {MAX_CALL_DEPTH}",
                def.name
            ))
            .into());
        }

        let mut positional: VecDeque<Value> = VecDeque::new();
        let mut named: BTreeMap<String, Value> = BTreeMap::new();
        for arg in args {
            let value = self.eval(st, &arg.value)?;
            match &arg.name {
                Some(name) => {
                    named.insert(name.clone(), value);
                }
                None => positional.push_back(value),
            }
        }

        let mut scope = BTreeMap::new();
        for param in &def.params {
            let value = if let Some(value) = named.remove(&param.name) {
                value
            } else if let Some(value) = positional.pop_front() {
                value
            } else if let Some(default) = &param.default {
                self.eval(st, default)?
            } else {
                Value::None
            };
            scope.insert(param.name.clone(), value);
        }
        if let Some((name, _)) = named.iter().next() {
            return Err(RuntimeError::new(format!(
                "Unknown argument \"{name}\" for macro \"{}\"",
                def.name
            ))
            .into());
        }
        scope.insert(
            "varargs".to_string(),
            Value::Seq(positional.into_iter().collect()),
        );

        // Macros see nothing but their own arguments.
        let saved_scopes = std::mem::replace(&mut st.scopes, vec![scope]);
        let saved_out = std::mem::take(&mut st.out);
        st.call_depth += 1;
        let result = self.exec_nodes(st, &def.body);
        st.call_depth -= 1;
        let captured = std::mem::replace(&mut st.out, saved_out);
        st.scopes = saved_scopes;
        result?;
        Ok(Value::Safe(captured))
    }
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    crate::builtins::compare_values(a, b)
}

/// Arithmetic with int preservation: two int operands stay int except for
/// true division.
fn arith(op: &str, a: &Value, b: &Value) -> CompilateResult<Value> {
    let x = a.as_number()?;
    let y = b.as_number()?;
    if y == 0.0 && matches!(op, "/" | "//" | "%") {
        let what = if op == "%" { "Modulo" } else { "Division" };
        return Err(RuntimeError::new(format!("{what} by zero")).into());
    }
    let result = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => x / y,
        "//" => (x / y).floor(),
        "%" => x % y,
        "**" => x.powf(y),
        other => {
            return Err(RuntimeError::new(format!("Unknown operator \"{other}\"")).into());
        }
    };
    let both_int = matches!((a, b), (Value::Int(_), Value::Int(_)));
    if both_int && op != "/" && result.fract() == 0.0 && result.abs() <= i64::MAX as f64 {
        Ok(Value::Int(result as i64))
    } else {
        Ok(Value::Float(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ArrayLoader;

    fn render(code: &str, ctx: &Context) -> String {
        Environment::new().render_str(code, "test", ctx).unwrap()
    }

    fn render_plain(code: &str) -> String {
        render(code, &Context::new())
    }

    fn items_ctx() -> Context {
        let mut ctx = Context::new();
        ctx.insert("items", vec!["a", "b"]);
        ctx
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_text_and_print() {
        let mut ctx = Context::new();
        ctx.insert("name", "world");
        assert_eq!(render("hello {{ name }}!", &ctx), "hello world!");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_elseif_else() {
        let code = "{% if v > 2 %}big{% elseif v > 0 %}small{% else %}none{% endif %}";
        let mut ctx = Context::new();
        ctx.insert("v", 5i64);
        assert_eq!(render(code, &ctx), "big");
        ctx.insert("v", 1i64);
        assert_eq!(render(code, &ctx), "small");
        ctx.insert("v", 0i64);
        assert_eq!(render(code, &ctx), "none");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_with_loop_variable() {
        let code = "{% for i in items %}{{ loop.index }}:{{ i }} {% endfor %}";
        assert_eq!(render(code, &items_ctx()), "1:a 2:b ");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_loop_first_last_revindex() {
        let code = "{% for i in items %}{{ loop.first }}/{{ loop.last }}/{{ loop.revindex }} {% endfor %}";
        assert_eq!(render(code, &items_ctx()), "1//2 /1/1 ");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_key_value_over_map() {
        let mut ctx = Context::new();
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert("b".to_string(), Value::Int(2));
        ctx.insert("data", Value::Map(map));
        let code = "{% for k, v in data %}{{ k }}={{ v }};{% endfor %}";
        assert_eq!(render(code, &ctx), "a=1;b=2;");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_else_on_empty() {
        let mut ctx = Context::new();
        ctx.insert("items", Value::Seq(vec![]));
        let code = "{% for i in items %}x{% else %}empty{% endfor %}";
        assert_eq!(render(code, &ctx), "empty");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_break_and_continue() {
        let code = "{% for i in 1..5 %}{% if i == 2 %}{% continue %}{% endif %}{% if i == 4 %}{% break %}{% endif %}{{ i }}{% endfor %}";
        assert_eq!(render_plain(code), "13");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_break_out_of_two_loops() {
        let code = "{% for i in 1..3 %}{% for j in 1..3 %}{% if j == 2 %}{% break 2 %}{% endif %}{{ i }}.{{ j }} {% endfor %}{% endfor %}done";
        assert_eq!(render_plain(code), "1.1 done");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_loop_parent() {
        let mut ctx = Context::new();
        ctx.insert(
            "rows",
            Value::Seq(vec![Value::from(vec!["x", "y"])]),
        );
        let code = "{% for row in rows %}{% for cell in row %}{{ loop.parent.loop.index }}-{{ loop.index }} {% endfor %}{% endfor %}";
        assert_eq!(render(code, &ctx), "1-1 1-2 ");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_and_capture() {
        assert_eq!(render_plain("{% set x = 40 + 2 %}{{ x }}"), "42");
        assert_eq!(render_plain("{% set a, b = 1, 2 %}{{ a }}{{ b }}"), "12");
        // A captured body is markup, not re-escaped.
        assert_eq!(
            render_plain("{% set x %}<b>hi</b>{% endset %}{{ x }}"),
            "<b>hi</b>"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_strict_variables_error() {
        let mut env = Environment::new();
        env.strict_variables = true;
        let err = env
            .render_str("{{ missing }}", "test", &Context::new())
            .unwrap_err();
        assert!(err.to_string().contains("Variable \"missing\" does not exist"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_lenient_without_strict() {
        assert_eq!(render_plain("[{{ missing }}]"), "[]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_null_coalesce_and_default_under_strict() {
        let mut env = Environment::new();
        env.strict_variables = true;
        let ctx = Context::new();
        assert_eq!(
            env.render_str("{{ missing ?? 'fb' }}", "test", &ctx).unwrap(),
            "fb"
        );
        assert_eq!(
            env.render_str("{{ missing|default('fb') }}", "test", &ctx).unwrap(),
            "fb"
        );
        assert_eq!(
            env.render_str("{{ missing is defined ? 'y' : 'n' }}", "test", &ctx).unwrap(),
            "n"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_attribute_access() {
        let mut ctx = Context::new();
        let mut user = BTreeMap::new();
        user.insert("name".to_string(), Value::from("ana"));
        ctx.insert("user", Value::Map(user));
        assert_eq!(render("{{ user.name }}", &ctx), "ana");
        assert_eq!(render("{{ user['name'] }}", &ctx), "ana");
        let mut ctx = Context::new();
        ctx.insert("items", vec!["a", "b", "c"]);
        assert_eq!(render("{{ items[1] }}{{ items[-1] }}", &ctx), "bc");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arithmetic_and_concat() {
        assert_eq!(render_plain("{{ 1 + 2 * 3 }}"), "7");
        assert_eq!(render_plain("{{ 10 / 4 }}"), "2.5");
        assert_eq!(render_plain("{{ 10 // 4 }}"), "2");
        assert_eq!(render_plain("{{ 10 % 3 }}"), "1");
        assert_eq!(render_plain("{{ 2 ** 10 }}"), "1024");
        assert_eq!(render_plain("{{ 'a' ~ 1 ~ 'b' }}"), "a1b");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_division_by_zero() {
        let err = Environment::new()
            .render_str("{{ 1 / 0 }}", "test", &Context::new())
            .unwrap_err();
        assert!(err.to_string().contains("Division by zero"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comparisons_and_logic() {
        assert_eq!(render_plain("{{ 1 < 2 and 'x' in 'xyz' }}"), "1");
        assert_eq!(render_plain("{{ 1 == 1.0 }}"), "1");
        assert_eq!(render_plain("{{ 'hay' starts with 'h' }}"), "1");
        assert_eq!(render_plain("{{ not false or false }}"), "1");
        assert_eq!(render_plain("{{ 2 not in [1, 3] }}"), "1");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arrow_through_map_filter() {
        let mut ctx = Context::new();
        ctx.insert("items", vec![1i64, 2, 3]);
        assert_eq!(
            render("{{ items|map(v => v * 2)|join(',') }}", &ctx),
            "2,4,6"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arrow_captures_surrounding_scope() {
        let mut ctx = Context::new();
        ctx.insert("items", vec![1i64, 2]);
        ctx.insert("offset", 10i64);
        assert_eq!(
            render("{{ items|map(v => v + offset)|join(',') }}", &ctx),
            "11,12"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_macro_definition_and_call() {
        let code = "{% macro input(name, type = 'text') %}<input name=\"{{ name }}\" type=\"{{ type }}\">{% endmacro %}{{ input('user') }}";
        assert_eq!(
            render_plain(code),
            "<input name=\"user\" type=\"text\">"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_macro_named_arguments_and_varargs() {
        let code = "{% macro tag(name) %}{{ name }}/{{ varargs|join('-') }}{% endmacro %}{{ tag('a', 'b', 'c') }}";
        assert_eq!(render_plain(code), "a/b-c");
        let code = "{% macro f(a, b = 2) %}{{ a }}{{ b }}{% endmacro %}{{ f(b: 9, a: 1) }}";
        assert_eq!(render_plain(code), "19");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_macro_scope_is_isolated() {
        let code = "{% set secret = 'hidden' %}{% macro peek() %}[{{ secret }}]{% endmacro %}{{ peek() }}";
        assert_eq!(render_plain(code), "[]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_import_from_template() {
        let mut loader = ArrayLoader::new();
        loader.insert(
            "forms.html",
            "{% macro input(name) %}<input name=\"{{ name }}\">{% endmacro %}",
        );
        let mut env = Environment::new();
        env.set_loader(Box::new(loader));
        let out = env
            .render_str(
                "{% from 'forms.html' import input as field %}{{ field('q') }}",
                "test",
                &Context::new(),
            )
            .unwrap();
        assert_eq!(out, "<input name=\"q\">");

        let out = env
            .render_str(
                "{% import 'forms.html' as forms %}{{ forms.input('q') }}",
                "test2",
                &Context::new(),
            )
            .unwrap();
        assert_eq!(out, "<input name=\"q\">");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_include() {
        let mut loader = ArrayLoader::new();
        loader.insert("part.html", "[{{ v }}]");
        let mut env = Environment::new();
        env.set_loader(Box::new(loader));
        let mut ctx = Context::new();
        ctx.insert("v", "outer");
        assert_eq!(
            env.render_str("{% include 'part.html' %}", "test", &ctx).unwrap(),
            "[outer]"
        );
        assert_eq!(
            env.render_str(
                "{% include 'part.html' with {v: 'inner'} %}",
                "t2",
                &ctx
            )
            .unwrap(),
            "[inner]"
        );
        assert_eq!(
            env.render_str("{% include 'part.html' only %}", "t3", &ctx).unwrap(),
            "[]"
        );
        assert_eq!(
            env.render_str(
                "a{% include 'gone.html' ignore missing %}b",
                "t4",
                &ctx
            )
            .unwrap(),
            "ab"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_extends_block_override_and_parent() {
        let mut loader = ArrayLoader::new();
        loader.insert(
            "base.html",
            "<{% block title %}base{% endblock %}>",
        );
        loader.insert(
            "child.html",
            "{% extends 'base.html' %}{% block title %}{{ parent() }}+child{% endblock %}",
        );
        let mut env = Environment::new();
        env.set_loader(Box::new(loader));
        assert_eq!(env.render("base.html", &Context::new()).unwrap(), "<base>");
        assert_eq!(
            env.render("child.html", &Context::new()).unwrap(),
            "<base+child>"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_three_level_inheritance() {
        let mut loader = ArrayLoader::new();
        loader.insert("a.html", "{% block b %}A{% endblock %}");
        loader.insert(
            "b.html",
            "{% extends 'a.html' %}{% block b %}B{{ parent() }}{% endblock %}",
        );
        loader.insert(
            "c.html",
            "{% extends 'b.html' %}{% block b %}C{{ parent() }}{% endblock %}",
        );
        let mut env = Environment::new();
        env.set_loader(Box::new(loader));
        assert_eq!(env.render("c.html", &Context::new()).unwrap(), "CBA");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_function_renders_to_string() {
        let code = "{% block b %}x{% endblock %}|{{ block('b')|upper }}";
        assert_eq!(render_plain(code), "x|X");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_with_tag() {
        assert_eq!(
            render_plain("{% with {x: 1} %}{{ x }}{% endwith %}"),
            "1"
        );
        let mut ctx = Context::new();
        ctx.insert("y", "outer");
        assert_eq!(
            render("{% with {x: 1} only %}{{ x }}{{ y }}{% endwith %}{{ y }}", &ctx),
            "1outer"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_do_tag_produces_no_output() {
        assert_eq!(render_plain("a{% do 1 + 1 %}b"), "ab");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tests_and_ternary() {
        assert_eq!(render_plain("{{ 4 is even ? 'e' : 'o' }}"), "e");
        assert_eq!(render_plain("{{ 9 is divisible by(3) }}"), "1");
        assert_eq!(render_plain("{{ none is null }}"), "1");
        assert_eq!(render_plain("{{ '' ?: 'elvis' }}"), "elvis");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_recursive_macro_depth_limit() {
        let code = "{% macro f() %}{{ f() }}{% endmacro %}{{ f() }}";
        let err = Environment::new()
            .render_str(code, "test", &Context::new())
            .unwrap_err();
        assert!(err.to_string().contains("call depth"));
    }
}
