pub type CompilateResult<T> = std::result::Result<T, CompilateError>;

/// Raised during lexing or parsing for any input that cannot be turned into a
/// valid syntax tree. Always carries the offending source line and the name of
/// the template it came from.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("{message} at line {line} in \"{source_name}\"")]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub source_name: String,
}

impl SyntaxError {
    pub fn new<M: Into<String>, N: Into<String>>(message: M, line: usize, source_name: N) -> Self {
        Self {
            message: message.into(),
            line,
            source_name: source_name.into(),
        }
    }
}

/// Raised at render time when the sandbox is active and a security check
/// fails. Each variant identifies exactly which name triggered it.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SecurityError {
    #[error("Tag \"{0}\" is not allowed")]
    NotAllowedTag(String),
    #[error("Filter \"{0}\" is not allowed")]
    NotAllowedFilter(String),
    #[error("Function \"{0}\" is not allowed")]
    NotAllowedFunction(String),
    #[error("Calling \"{method}\" method on a \"{kind}\" value is not allowed")]
    NotAllowedMethod { kind: String, method: String },
    #[error("Accessing \"{property}\" property on a \"{kind}\" value is not allowed")]
    NotAllowedProperty { kind: String, property: String },
}

impl SecurityError {
    /// The offending tag/filter/function/method/property name.
    pub fn offender(&self) -> &str {
        match self {
            Self::NotAllowedTag(name)
            | Self::NotAllowedFilter(name)
            | Self::NotAllowedFunction(name) => name,
            Self::NotAllowedMethod { method, .. } => method,
            Self::NotAllowedProperty { property, .. } => property,
        }
    }
}

/// Raised while executing a compiled template for conditions only detectable
/// with real data, e.g. an undefined variable under strict mode.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("{0}")]
pub struct RuntimeError(pub String);

impl RuntimeError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self(message.into())
    }
}

/// A misconfigured registration (e.g. a variadic filter whose declared
/// parameter list has no legal variadic tail). These indicate a broken
/// extension, not a template-authoring mistake.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("{0}")]
pub struct LogicError(pub String);

impl LogicError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self(message.into())
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum CompilateError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Logic(#[from] LogicError),
    #[error("Template not found: {template_name}")]
    MissingTemplate { template_name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_syntax_error_display() {
        let err = SyntaxError::new("Unexpected character '&'", 3, "index.html");
        assert_eq!(
            err.to_string(),
            "Unexpected character '&' at line 3 in \"index.html\""
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_security_error_offender() {
        let err = SecurityError::NotAllowedFilter("upper".to_string());
        assert_eq!(err.offender(), "upper");
        assert_eq!(err.to_string(), "Filter \"upper\" is not allowed");

        let err = SecurityError::NotAllowedMethod {
            kind: "map".to_string(),
            method: "clear".to_string(),
        };
        assert_eq!(err.offender(), "clear");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_conversion() {
        let err: CompilateError = SyntaxError::new("oops", 1, "t").into();
        assert!(matches!(err, CompilateError::Syntax(_)));
        let err: CompilateError = RuntimeError::new("oops").into();
        assert!(matches!(err, CompilateError::Runtime(_)));
    }
}
