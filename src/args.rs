use crate::error::{LogicError, SyntaxError};
use crate::node::{Arg, Expr};
use crate::value::Value;

/// Declares one parameter of a filter, function, or test. Callables describe
/// their full signature up front so calls can be checked while parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<Value>,
    pub variadic: bool,
}

impl ParamSpec {
    pub fn required<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            default: None,
            variadic: false,
        }
    }

    pub fn optional<N: Into<String>, V: Into<Value>>(name: N, default: V) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
            variadic: false,
        }
    }

    pub fn variadic<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            default: None,
            variadic: true,
        }
    }
}

/// Validates a parameter list at registration time. A variadic parameter is
/// only legal in the final position and cannot carry a default.
pub fn validate_params(kind: &str, name: &str, params: &[ParamSpec]) -> Result<(), LogicError> {
    for (i, param) in params.iter().enumerate() {
        if !param.variadic {
            continue;
        }
        if i != params.len() - 1 {
            return Err(LogicError::new(format!(
                "The variadic parameter \"{}\" of {kind} \"{name}\" must be the last one",
                param.name
            )));
        }
        if param.default.is_some() {
            return Err(LogicError::new(format!(
                "The variadic parameter \"{}\" of {kind} \"{name}\" cannot have a default value",
                param.name
            )));
        }
    }
    Ok(())
}

/// Binds call-site arguments to a declared parameter list at parse time.
///
/// Returns one expression per declared parameter, in declaration order, with
/// defaults filled in for omitted optional parameters. When the signature is
/// variadic, the final expression collects the leftovers: an array when they
/// are all positional, a hash keyed by position or name otherwise.
pub fn bind_arguments(
    kind: &str,
    callable: &str,
    params: &[ParamSpec],
    args: Vec<Arg>,
    line: usize,
    source_name: &str,
) -> Result<Vec<Expr>, SyntaxError> {
    let err = |message: String| SyntaxError::new(message, line, source_name);

    let mut positional: Vec<Expr> = Vec::new();
    let mut named: Vec<(String, Expr)> = Vec::new();
    for arg in args {
        match arg.name {
            Some(name) => named.push((snake_case(&name), arg.value)),
            None => {
                if !named.is_empty() {
                    return Err(err(
                        "Positional arguments cannot be used after named arguments".to_string(),
                    ));
                }
                positional.push(arg.value);
            }
        }
    }

    for (i, (name, _)) in named.iter().enumerate() {
        if named[..i].iter().any(|(other, _)| other == name) {
            return Err(err(format!(
                "Argument \"{name}\" is defined twice for {kind} \"{callable}\""
            )));
        }
    }

    let (fixed, variadic) = match params.last() {
        Some(last) if last.variadic => (&params[..params.len() - 1], Some(last)),
        _ => (params, None),
    };

    let mut positional = positional.into_iter();
    let mut bound: Vec<Expr> = Vec::with_capacity(params.len());
    for param in fixed {
        let from_name = named
            .iter()
            .position(|(name, _)| name == &param.name)
            .map(|i| named.remove(i).1);
        let value = match (positional.next(), from_name) {
            (Some(_), Some(_)) => {
                return Err(err(format!(
                    "Argument \"{}\" is defined twice for {kind} \"{callable}\"",
                    param.name
                )));
            }
            (Some(value), None) | (None, Some(value)) => value,
            (None, None) => match &param.default {
                Some(default) => Expr::constant(default.clone(), line),
                None => {
                    return Err(err(format!(
                        "Value for argument \"{}\" is missing for {kind} \"{callable}\"",
                        param.name
                    )));
                }
            },
        };
        bound.push(value);
    }

    let leftover_positional: Vec<Expr> = positional.collect();
    match variadic {
        Some(_) => {
            if named.is_empty() {
                bound.push(Expr::Array {
                    items: leftover_positional,
                    line,
                });
            } else {
                // Mixed leftovers become a hash: positionals under their
                // numeric index, named under their name.
                let mut entries: Vec<(Expr, Expr)> = leftover_positional
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| (Expr::constant(i.to_string(), line), value))
                    .collect();
                for (name, value) in named {
                    entries.push((Expr::constant(name, line), value));
                }
                bound.push(Expr::Hash { entries, line });
            }
        }
        None => {
            if !leftover_positional.is_empty() {
                return Err(err(format!(
                    "Too many arguments for {kind} \"{callable}\": expected at most {}, got {}",
                    fixed.len(),
                    fixed.len() + leftover_positional.len()
                )));
            }
            if !named.is_empty() {
                let unknown: Vec<String> =
                    named.iter().map(|(name, _)| format!("\"{name}\"")).collect();
                let signature: Vec<&str> = fixed.iter().map(|p| p.name.as_str()).collect();
                let label = if unknown.len() == 1 {
                    "argument"
                } else {
                    "arguments"
                };
                return Err(err(format!(
                    "Unknown {label} {} for {kind} \"{callable}({})\"",
                    unknown.join(", "),
                    signature.join(", ")
                )));
            }
        }
    }

    Ok(bound)
}

/// Normalizes a camelCase argument name to snake_case so both spellings bind
/// to the same declared parameter.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("needle"),
            ParamSpec::optional("max_depth", 3i64),
        ]
    }

    fn name(n: &str) -> Expr {
        Expr::Name {
            name: n.to_string(),
            line: 1,
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_positional_binding() {
        let bound = bind_arguments(
            "filter",
            "find",
            &spec(),
            vec![Arg::positional(name("a")), Arg::positional(name("b"))],
            1,
            "test",
        )
        .unwrap();
        assert_eq!(bound, vec![name("a"), name("b")]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_default_filled_lazily() {
        let bound = bind_arguments(
            "filter",
            "find",
            &spec(),
            vec![Arg::positional(name("a"))],
            1,
            "test",
        )
        .unwrap();
        assert_eq!(bound[1], Expr::constant(3i64, 1));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_named_out_of_order() {
        let bound = bind_arguments(
            "filter",
            "find",
            &spec(),
            vec![
                Arg::named("max_depth", name("d")),
                Arg::named("needle", name("n")),
            ],
            1,
            "test",
        )
        .unwrap();
        assert_eq!(bound, vec![name("n"), name("d")]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_camel_case_normalized() {
        let bound = bind_arguments(
            "filter",
            "find",
            &spec(),
            vec![Arg::positional(name("n")), Arg::named("maxDepth", name("d"))],
            1,
            "test",
        )
        .unwrap();
        assert_eq!(bound[1], name("d"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_positional_after_named_rejected() {
        let err = bind_arguments(
            "filter",
            "find",
            &spec(),
            vec![Arg::named("needle", name("n")), Arg::positional(name("d"))],
            4,
            "test",
        )
        .unwrap_err();
        assert!(
            err.message
                .contains("Positional arguments cannot be used after named arguments")
        );
        assert_eq!(err.line, 4);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_duplicate_argument_rejected() {
        let err = bind_arguments(
            "filter",
            "find",
            &spec(),
            vec![Arg::positional(name("a")), Arg::named("needle", name("b"))],
            1,
            "test",
        )
        .unwrap_err();
        assert!(err.message.contains("defined twice"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_required_rejected() {
        let err = bind_arguments("filter", "find", &spec(), vec![], 1, "test").unwrap_err();
        assert!(err.message.contains("Value for argument \"needle\" is missing"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_named_rejected() {
        let err = bind_arguments(
            "filter",
            "find",
            &spec(),
            vec![
                Arg::positional(name("a")),
                Arg::named("bogus", name("b")),
                Arg::named("wrong", name("c")),
            ],
            1,
            "test",
        )
        .unwrap_err();
        assert_eq!(
            err.message,
            "Unknown arguments \"bogus\", \"wrong\" for filter \"find(needle, max_depth)\""
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_single_unknown_named_rejected() {
        let err = bind_arguments(
            "filter",
            "find",
            &spec(),
            vec![Arg::positional(name("a")), Arg::named("bogus", name("b"))],
            1,
            "test",
        )
        .unwrap_err();
        assert_eq!(
            err.message,
            "Unknown argument \"bogus\" for filter \"find(needle, max_depth)\""
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_variadic_collects_array() {
        let params = vec![ParamSpec::required("first"), ParamSpec::variadic("rest")];
        let bound = bind_arguments(
            "function",
            "max",
            &params,
            vec![
                Arg::positional(name("a")),
                Arg::positional(name("b")),
                Arg::positional(name("c")),
            ],
            1,
            "test",
        )
        .unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(
            bound[1],
            Expr::Array {
                items: vec![name("b"), name("c")],
                line: 1
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_variadic_with_named_collects_hash() {
        let params = vec![ParamSpec::required("first"), ParamSpec::variadic("rest")];
        let bound = bind_arguments(
            "function",
            "max",
            &params,
            vec![
                Arg::positional(name("a")),
                Arg::positional(name("b")),
                Arg::named("extra", name("c")),
            ],
            1,
            "test",
        )
        .unwrap();
        let Expr::Hash { entries, .. } = &bound[1] else {
            panic!("expected hash collector");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, Expr::constant("0", 1));
        assert_eq!(entries[1].0, Expr::constant("extra", 1));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_validate_variadic_must_be_last() {
        let params = vec![ParamSpec::variadic("rest"), ParamSpec::required("x")];
        let err = validate_params("filter", "bad", &params).unwrap_err();
        assert!(err.0.contains("must be the last one"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_snake_case() {
        assert_eq!(snake_case("maxDepth"), "max_depth");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }
}
