//! The default extension set: operator tables plus the built-in filters,
//! functions, and tests registered into every new environment.

use std::cmp::Ordering;

use crate::args::ParamSpec;
use crate::environment::{Assoc, Environment, FilterSpec, FunctionSpec, TestSpec};
use crate::error::{CompilateResult, LogicError, RuntimeError};
use crate::escaper;
use crate::value::Value;

pub fn register(env: &mut Environment) -> Result<(), LogicError> {
    register_operators(env);
    register_filters(env)?;
    register_functions(env)?;
    register_tests(env)?;
    Ok(())
}

fn register_operators(env: &mut Environment) {
    env.add_unary_operator("not", 50);
    env.add_unary_operator("-", 500);
    env.add_unary_operator("+", 500);

    let left = [
        ("or", 10),
        ("and", 15),
        ("b-or", 16),
        ("b-xor", 17),
        ("b-and", 18),
        ("==", 20),
        ("!=", 20),
        ("<", 20),
        (">", 20),
        (">=", 20),
        ("<=", 20),
        ("not in", 20),
        ("in", 20),
        ("starts with", 20),
        ("ends with", 20),
        ("..", 25),
        ("+", 30),
        ("-", 30),
        ("~", 40),
        ("*", 60),
        ("/", 60),
        ("//", 60),
        ("%", 60),
        ("is", 100),
        ("is not", 100),
    ];
    for (name, prec) in left {
        env.add_binary_operator(name, prec, Assoc::Left);
    }
    env.add_binary_operator("**", 200, Assoc::Right);
    env.add_binary_operator("??", 300, Assoc::Right);
}

fn register_filters(env: &mut Environment) -> Result<(), LogicError> {
    env.add_filter(FilterSpec {
        name: "escape".to_string(),
        params: vec![ParamSpec::optional("strategy", "html")],
        callable: filter_escape,
        // Safety for escape depends on its strategy argument and is decided
        // by the analysis, not by a static list.
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "raw".to_string(),
        params: vec![],
        callable: filter_raw,
        safe: vec!["all".to_string()],
    })?;
    env.add_filter(FilterSpec {
        name: "upper".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Str(args[0].to_display_string().to_uppercase())),
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "lower".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Str(args[0].to_display_string().to_lowercase())),
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "capitalize".to_string(),
        params: vec![],
        callable: |_, args| {
            let s = args[0].to_display_string().to_lowercase();
            let mut chars = s.chars();
            let capitalized = match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            };
            Ok(Value::Str(capitalized))
        },
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "trim".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Str(args[0].to_display_string().trim().to_string())),
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "join".to_string(),
        params: vec![ParamSpec::optional("glue", "")],
        callable: filter_join,
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "length".to_string(),
        params: vec![],
        callable: |_, args| {
            let len = args[0]
                .len()
                .unwrap_or_else(|| args[0].to_display_string().chars().count());
            Ok(Value::Int(len as i64))
        },
        safe: vec!["all".to_string()],
    })?;
    env.add_filter(FilterSpec {
        name: "default".to_string(),
        params: vec![ParamSpec::optional("default", "")],
        callable: |_, args| {
            let empty = args[0].is_empty() || args[0] == Value::Bool(false);
            Ok(if empty { args[1].clone() } else { args[0].clone() })
        },
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "first".to_string(),
        params: vec![],
        callable: |_, args| Ok(edge_item(&args[0], true)),
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "last".to_string(),
        params: vec![],
        callable: |_, args| Ok(edge_item(&args[0], false)),
        safe: vec![],
    })?;
    env.add_filter(FilterSpec {
        name: "map".to_string(),
        params: vec![ParamSpec::required("arrow")],
        callable: filter_map,
        safe: vec![],
    })?;
    Ok(())
}

fn filter_escape(_env: &Environment, args: &[Value]) -> CompilateResult<Value> {
    if let Value::Safe(s) = &args[0] {
        return Ok(Value::Safe(s.clone()));
    }
    let strategy = args[1].to_display_string();
    let escaped = escaper::escape(&strategy, &args[0].to_display_string())?;
    Ok(Value::Safe(escaped))
}

fn filter_raw(_env: &Environment, args: &[Value]) -> CompilateResult<Value> {
    Ok(match &args[0] {
        Value::Str(s) => Value::Safe(s.clone()),
        other => other.clone(),
    })
}

fn filter_join(_env: &Environment, args: &[Value]) -> CompilateResult<Value> {
    let glue = args[1].to_display_string();
    let parts: Vec<String> = args[0]
        .iter_pairs()
        .into_iter()
        .map(|(_, v)| v.to_display_string().into_owned())
        .collect();
    Ok(Value::Str(parts.join(&glue)))
}

fn filter_map(env: &Environment, args: &[Value]) -> CompilateResult<Value> {
    let Some(func) = args[1].as_func() else {
        return Err(RuntimeError::new(format!(
            "The map filter expects an arrow function, got a {}",
            args[1].kind()
        ))
        .into());
    };
    let mut out = Vec::new();
    for (key, value) in args[0].iter_pairs() {
        out.push(func.call(env, &[value, Value::Str(key)])?);
    }
    Ok(Value::Seq(out))
}

fn edge_item(value: &Value, first: bool) -> Value {
    match value {
        Value::Seq(items) => {
            let item = if first { items.first() } else { items.last() };
            item.cloned().unwrap_or_default()
        }
        Value::Map(entries) => {
            let entry = if first {
                entries.values().next()
            } else {
                entries.values().next_back()
            };
            entry.cloned().unwrap_or_default()
        }
        Value::Str(s) | Value::Safe(s) => {
            let c = if first { s.chars().next() } else { s.chars().last() };
            c.map(|c| Value::Str(c.to_string())).unwrap_or_default()
        }
        _ => Value::None,
    }
}

fn register_functions(env: &mut Environment) -> Result<(), LogicError> {
    env.add_function(FunctionSpec {
        name: "range".to_string(),
        params: vec![
            ParamSpec::required("low"),
            ParamSpec::required("high"),
            ParamSpec::optional("step", 1i64),
        ],
        callable: function_range,
        safe: vec![],
    })?;
    env.add_function(FunctionSpec {
        name: "cycle".to_string(),
        params: vec![ParamSpec::required("values"), ParamSpec::required("position")],
        callable: function_cycle,
        safe: vec![],
    })?;
    env.add_function(FunctionSpec {
        name: "max".to_string(),
        params: vec![ParamSpec::variadic("values")],
        callable: |_, args| pick_extreme(&args[0], Ordering::Greater),
        safe: vec![],
    })?;
    env.add_function(FunctionSpec {
        name: "min".to_string(),
        params: vec![ParamSpec::variadic("values")],
        callable: |_, args| pick_extreme(&args[0], Ordering::Less),
        safe: vec![],
    })?;
    Ok(())
}

fn function_range(_env: &Environment, args: &[Value]) -> CompilateResult<Value> {
    let low = args[0].as_number()? as i64;
    let high = args[1].as_number()? as i64;
    let step = args[2].as_number()? as i64;
    if step == 0 {
        return Err(RuntimeError::new("The range step must not be zero").into());
    }
    let step = step.abs();
    let mut out = Vec::new();
    if low <= high {
        let mut n = low;
        while n <= high {
            out.push(Value::Int(n));
            n += step;
        }
    } else {
        let mut n = low;
        while n >= high {
            out.push(Value::Int(n));
            n -= step;
        }
    }
    Ok(Value::Seq(out))
}

fn function_cycle(_env: &Environment, args: &[Value]) -> CompilateResult<Value> {
    let position = args[1].as_number()? as i64;
    match &args[0] {
        Value::Seq(items) if !items.is_empty() => {
            let idx = position.rem_euclid(items.len() as i64) as usize;
            Ok(items[idx].clone())
        }
        Value::Seq(_) => Err(RuntimeError::new("The cycle function needs a non-empty sequence").into()),
        other => Ok(other.clone()),
    }
}

/// Shared by max and min. A single iterable argument is compared element by
/// element; otherwise the arguments themselves compete.
fn pick_extreme(collected: &Value, keep: Ordering) -> CompilateResult<Value> {
    let candidates: Vec<Value> = match collected {
        Value::Seq(items) if items.len() == 1 && items[0].is_iterable() => items[0]
            .iter_pairs()
            .into_iter()
            .map(|(_, v)| v)
            .collect(),
        other => other.iter_pairs().into_iter().map(|(_, v)| v).collect(),
    };
    let mut iter = candidates.into_iter();
    let Some(mut best) = iter.next() else {
        return Err(RuntimeError::new("max/min needs at least one value").into());
    };
    for candidate in iter {
        if compare_values(&candidate, &best) == keep {
            best = candidate;
        }
    }
    Ok(best)
}

/// Numeric comparison when both sides are numeric, textual otherwise.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    if let (Ok(x), Ok(y)) = (a.as_number(), b.as_number()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    a.to_display_string().cmp(&b.to_display_string())
}

fn register_tests(env: &mut Environment) -> Result<(), LogicError> {
    // "defined" is answered by the evaluator itself (it needs to probe the
    // scope without raising); the callable only serves direct invocation.
    env.add_test(TestSpec {
        name: "defined".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Bool(!args[0].is_none())),
    })?;
    env.add_test(TestSpec {
        name: "none".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Bool(args[0].is_none())),
    })?;
    env.add_test(TestSpec {
        name: "null".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Bool(args[0].is_none())),
    })?;
    env.add_test(TestSpec {
        name: "even".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Bool(args[0].as_number()? as i64 % 2 == 0)),
    })?;
    env.add_test(TestSpec {
        name: "odd".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Bool(args[0].as_number()? as i64 % 2 != 0)),
    })?;
    env.add_test(TestSpec {
        name: "empty".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Bool(args[0].is_empty() || args[0] == Value::Bool(false))),
    })?;
    env.add_test(TestSpec {
        name: "iterable".to_string(),
        params: vec![],
        callable: |_, args| Ok(Value::Bool(args[0].is_iterable())),
    })?;
    env.add_test(TestSpec {
        name: "divisible by".to_string(),
        params: vec![ParamSpec::required("num")],
        callable: |_, args| {
            let num = args[1].as_number()? as i64;
            if num == 0 {
                return Err(RuntimeError::new("Cannot test divisibility by zero").into());
            }
            Ok(Value::Bool(args[0].as_number()? as i64 % num == 0))
        },
    })?;
    env.add_test(TestSpec {
        name: "same as".to_string(),
        params: vec![ParamSpec::required("other")],
        callable: |_, args| Ok(Value::Bool(args[0] == args[1])),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Context;

    fn render(code: &str, ctx: &Context) -> String {
        Environment::new().render_str(code, "test", ctx).unwrap()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_filters() {
        let ctx = Context::new();
        assert_eq!(render("{{ 'abc'|upper }}", &ctx), "ABC");
        assert_eq!(render("{{ 'ABC'|lower }}", &ctx), "abc");
        assert_eq!(render("{{ 'hELLO'|capitalize }}", &ctx), "Hello");
        assert_eq!(render("{{ '  x  '|trim }}", &ctx), "x");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_join_and_length() {
        let mut ctx = Context::new();
        ctx.insert("items", vec!["a", "b", "c"]);
        assert_eq!(render("{{ items|join(', ') }}", &ctx), "a, b, c");
        assert_eq!(render("{{ items|join }}", &ctx), "abc");
        assert_eq!(render("{{ items|length }}", &ctx), "3");
        assert_eq!(render("{{ 'hello'|length }}", &ctx), "5");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_default_filter() {
        let mut ctx = Context::new();
        ctx.insert("empty", "");
        ctx.insert("set", "v");
        assert_eq!(render("{{ empty|default('d') }}", &ctx), "d");
        assert_eq!(render("{{ set|default('d') }}", &ctx), "v");
        assert_eq!(render("{{ missing|default('d') }}", &ctx), "d");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_first_last() {
        let mut ctx = Context::new();
        ctx.insert("items", vec![10i64, 20, 30]);
        assert_eq!(render("{{ items|first }}", &ctx), "10");
        assert_eq!(render("{{ items|last }}", &ctx), "30");
        assert_eq!(render("{{ 'abc'|first }}", &ctx), "a");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_map_with_arrow() {
        let mut ctx = Context::new();
        ctx.insert("items", vec![1i64, 2, 3]);
        assert_eq!(
            render("{{ items|map(v => v * 2)|join(',') }}", &ctx),
            "2,4,6"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_range_function() {
        let ctx = Context::new();
        assert_eq!(render("{{ range(1, 5)|join(',') }}", &ctx), "1,2,3,4,5");
        assert_eq!(render("{{ range(0, 6, 2)|join(',') }}", &ctx), "0,2,4,6");
        assert_eq!(render("{{ range(3, 1)|join(',') }}", &ctx), "3,2,1");
        assert_eq!(render("{{ (1..3)|join(',') }}", &ctx), "1,2,3");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_cycle_function() {
        let ctx = Context::new();
        assert_eq!(render("{{ cycle(['a', 'b'], 0) }}", &ctx), "a");
        assert_eq!(render("{{ cycle(['a', 'b'], 3) }}", &ctx), "b");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_max_min() {
        let ctx = Context::new();
        assert_eq!(render("{{ max(1, 9, 4) }}", &ctx), "9");
        assert_eq!(render("{{ min([5, 2, 8]) }}", &ctx), "2");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_number_tests() {
        let ctx = Context::new();
        assert_eq!(render("{{ 4 is even ? 'y' : 'n' }}", &ctx), "y");
        assert_eq!(render("{{ 4 is odd ? 'y' : 'n' }}", &ctx), "n");
        assert_eq!(render("{{ 9 is divisible by(3) ? 'y' : 'n' }}", &ctx), "y");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_and_iterable_tests() {
        let mut ctx = Context::new();
        ctx.insert("items", Vec::<i64>::new());
        assert_eq!(render("{{ items is empty ? 'y' : 'n' }}", &ctx), "y");
        assert_eq!(render("{{ items is iterable ? 'y' : 'n' }}", &ctx), "y");
        assert_eq!(render("{{ 'x' is iterable ? 'y' : 'n' }}", &ctx), "n");
    }
}
