use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::environment::Environment;
use crate::error::{CompilateResult, RuntimeError};

/// A callable value, produced by evaluating an arrow function or by binding a
/// macro. Compared by identity; two closures are never equal.
#[derive(Clone)]
pub struct ValueFunc(Rc<dyn Fn(&Environment, &[Value]) -> CompilateResult<Value>>);

impl ValueFunc {
    pub fn new<F: Fn(&Environment, &[Value]) -> CompilateResult<Value> + 'static>(f: F) -> Self {
        Self(Rc::new(f))
    }

    pub fn call(&self, env: &Environment, args: &[Value]) -> CompilateResult<Value> {
        (self.0)(env, args)
    }
}

impl fmt::Debug for ValueFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueFunc(..)")
    }
}

impl PartialEq for ValueFunc {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A runtime value flowing through a rendered template.
///
/// `Safe` is a string that has already been escaped (or declared markup) and
/// must not be escaped again by the `escape` filter.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Safe(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Func(ValueFunc),
}

impl Value {
    /// The value's kind name, used in error messages and security checks.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) | Self::Safe(_) => "string",
            Self::Seq(_) => "sequence",
            Self::Map(_) => "map",
            Self::Func(_) => "function",
        }
    }

    /// Truthiness follows the usual template-language rules: empty strings,
    /// empty collections, zero and none are false.
    pub fn is_true(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Float(n) => *n != 0.0,
            Self::Str(s) | Self::Safe(s) => !s.is_empty(),
            Self::Seq(items) => !items.is_empty(),
            Self::Map(entries) => !entries.is_empty(),
            Self::Func(_) => true,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Str(s) | Self::Safe(s) => s.is_empty(),
            Self::Seq(items) => items.is_empty(),
            Self::Map(entries) => entries.is_empty(),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Func(_) => false,
        }
    }

    pub fn is_iterable(&self) -> bool {
        matches!(self, Self::Seq(_) | Self::Map(_))
    }

    /// Length of a string or collection, if the value has one.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s.chars().count()),
            Self::Seq(items) => Some(items.len()),
            Self::Map(entries) => Some(entries.len()),
            Self::None | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Func(_) => None,
        }
    }

    /// Renders the value the way a `{{ ... }}` print does.
    pub fn to_display_string(&self) -> Cow<'_, str> {
        match self {
            Self::None => Cow::Borrowed(""),
            Self::Bool(true) => Cow::Borrowed("1"),
            Self::Bool(false) => Cow::Borrowed(""),
            Self::Int(n) => Cow::Owned(n.to_string()),
            Self::Float(n) => Cow::Owned(format_float(*n)),
            Self::Str(s) | Self::Safe(s) => Cow::Borrowed(s),
            Self::Seq(_) => Cow::Borrowed("Sequence"),
            Self::Map(_) => Cow::Borrowed("Map"),
            Self::Func(_) => Cow::Borrowed("Function"),
        }
    }

    /// Attribute access by name: map entries first, then nothing. Sequence
    /// values answer numeric attributes as indices.
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        match self {
            Self::Map(entries) => entries.get(name).cloned(),
            Self::Seq(items) => name.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            Self::None
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::Str(_)
            | Self::Safe(_)
            | Self::Func(_) => None,
        }
    }

    /// Subscript access (`value[key]`).
    pub fn get_item(&self, key: &Value) -> Option<Value> {
        match (self, key) {
            (Self::Seq(items), Self::Int(i)) => {
                let idx = if *i < 0 { items.len() as i64 + *i } else { *i };
                usize::try_from(idx).ok().and_then(|i| items.get(i).cloned())
            }
            (Self::Map(entries), key) => entries.get(key.to_display_string().as_ref()).cloned(),
            (Self::Str(s) | Self::Safe(s), Self::Int(i)) => {
                usize::try_from(*i).ok().and_then(|i| s.chars().nth(i)).map(|c| Value::Str(c.to_string()))
            }
            _ => None,
        }
    }

    /// Iterate as a sequence of (key, value) pairs; sequences get numeric
    /// string keys. Non-iterables yield nothing.
    pub fn iter_pairs(&self) -> Vec<(String, Value)> {
        match self {
            Self::Seq(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect(),
            Self::Map(entries) => entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Self::None
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::Str(_)
            | Self::Safe(_)
            | Self::Func(_) => Vec::new(),
        }
    }

    pub fn as_func(&self) -> Option<&ValueFunc> {
        match self {
            Self::Func(f) => Some(f),
            _ => None,
        }
    }

    /// Numeric coercion used by arithmetic operators.
    pub fn as_number(&self) -> CompilateResult<f64> {
        match self {
            Self::Int(n) => Ok(*n as f64),
            Self::Float(n) => Ok(*n),
            Self::Bool(true) => Ok(1.0),
            Self::Bool(false) | Self::None => Ok(0.0),
            Self::Str(s) | Self::Safe(s) => s.trim().parse::<f64>().map_err(|_| {
                RuntimeError::new(format!("Cannot use string \"{s}\" as a number")).into()
            }),
            Self::Seq(_) | Self::Map(_) | Self::Func(_) => Err(RuntimeError::new(format!(
                "Cannot use a {} as a number",
                self.kind()
            ))
            .into()),
        }
    }

    /// Loose equality: ints and floats compare numerically, safe strings
    /// compare as their text.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Str(a) | Self::Safe(a), Self::Str(b) | Self::Safe(b)) => a == b,
            (a, b) => a == b,
        }
    }

    /// `in` operator containment.
    pub fn contains(&self, needle: &Value) -> bool {
        match self {
            Self::Seq(items) => items.iter().any(|v| v.loose_eq(needle)),
            Self::Map(entries) => entries.contains_key(needle.to_display_string().as_ref()),
            Self::Str(s) | Self::Safe(s) => s.contains(needle.to_display_string().as_ref()),
            Self::None
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::Func(_) => false,
        }
    }
}

/// Floats print without a trailing `.0` when they are whole, matching the way
/// template languages render `10 / 5`.
fn format_float(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Seq(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(entries: BTreeMap<String, T>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

/// The variable mapping handed to a compiled template's entry point.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    data: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: AsRef<str>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.data.insert(name.as_ref().to_string(), value.into());
        self
    }

    pub fn get<N: AsRef<str>>(&self, name: N) -> Option<&Value> {
        self.data.get(name.as_ref())
    }

    pub fn contains<N: AsRef<str>>(&self, name: N) -> bool {
        self.data.contains_key(name.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }
}
