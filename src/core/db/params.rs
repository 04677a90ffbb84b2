/// Parameter Module
///
/// Statement parameters, their normalization into driver bindings, and the
/// native bind kind inferred for each value.
use crate::core::db::driver::{BindTarget, BindValue, Binding};
use crate::core::db::value::Value;
use crate::core::error::{Result, SchemaDbError};

/// Parameters for one statement: positional (`?`) or named (`:name`).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Params {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Named parameters. Names may be given with or without the leading colon.
    pub fn named<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        Params::Named(
            values
                .into_iter()
                .map(|(k, v)| (placeholder_name(k.as_ref()), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::None => true,
            Params::Positional(v) => v.is_empty(),
            Params::Named(v) => v.is_empty(),
        }
    }

    /// Parameter names and values for diagnostics. Positional parameters are
    /// labelled by their 1-based index.
    pub fn labelled(&self) -> Vec<(String, Value)> {
        match self {
            Params::None => Vec::new(),
            Params::Positional(values) => values
                .iter()
                .enumerate()
                .map(|(i, v)| ((i + 1).to_string(), v.clone()))
                .collect(),
            Params::Named(values) => values.clone(),
        }
    }

    /// Converts every value to its native bind kind.
    pub fn to_bindings(&self) -> Result<Vec<Binding>> {
        match self {
            Params::None => Ok(Vec::new()),
            Params::Positional(values) => values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    Ok(Binding {
                        target: BindTarget::Position(i + 1),
                        value: bind_value(v)?,
                    })
                })
                .collect(),
            Params::Named(values) => values
                .iter()
                .map(|(name, v)| {
                    Ok(Binding {
                        target: BindTarget::Name(name.clone()),
                        value: bind_value(v)?,
                    })
                })
                .collect(),
        }
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

/// A single scalar becomes a one-element positional list.
impl From<Value> for Params {
    fn from(v: Value) -> Self {
        Params::Positional(vec![v])
    }
}

impl From<i32> for Params {
    fn from(v: i32) -> Self {
        Params::Positional(vec![Value::from(v)])
    }
}

impl From<i64> for Params {
    fn from(v: i64) -> Self {
        Params::Positional(vec![Value::Int(v)])
    }
}

impl From<&str> for Params {
    fn from(v: &str) -> Self {
        Params::Positional(vec![Value::from(v)])
    }
}

impl From<Vec<Value>> for Params {
    fn from(v: Vec<Value>) -> Self {
        Params::Positional(v)
    }
}

impl From<Vec<(String, Value)>> for Params {
    fn from(v: Vec<(String, Value)>) -> Self {
        Params::named(v)
    }
}

impl From<Vec<(&str, Value)>> for Params {
    fn from(v: Vec<(&str, Value)>) -> Self {
        Params::named(v)
    }
}

/// Builds positional [`Params`] from a list of expressions.
///
/// ```
/// use schemadb::params;
/// let p = params![1, "two", 3.0];
/// assert!(!p.is_empty());
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::Params::None
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Params::Positional(vec![$($crate::Value::from($value)),+])
    };
}

/// Normalizes a parameter name to its `:name` placeholder form.
pub fn placeholder_name(name: &str) -> String {
    if name.starts_with(':') {
        name.to_string()
    } else {
        format!(":{}", name)
    }
}

/// Infers the native bind kind for a value.
///
/// Floats bind as text so no precision is lost in transit; temporal values
/// bind as their formatted string. Composite values cannot be bound.
pub fn bind_value(value: &Value) -> Result<BindValue> {
    Ok(match value {
        Value::Null => BindValue::Null,
        Value::Bool(b) => BindValue::Bool(*b),
        Value::Int(i) => BindValue::Int(*i),
        Value::Float(f) => BindValue::Text(f.to_string()),
        Value::Text(s) => BindValue::Text(s.clone()),
        Value::Temporal(t) => BindValue::Text(t.format()),
        Value::Blob(b) => BindValue::Blob(b.clone()),
        Value::Structured(v) => {
            return Err(SchemaDbError::Type(format!(
                "cannot bind a structured value: {}",
                v
            )))
        }
    })
}

/// Rewrites `:name` placeholders to positional `?`, returning the new SQL and
/// the placeholder names in order of appearance.
///
/// Quoted strings and identifiers are left untouched, as are `::` casts.
pub fn rewrite_named_placeholders(sql: &str) -> (String, Vec<String>) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut names = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .map_or(false, |n| n.is_ascii_alphabetic() || *n == '_') =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                names.push(chars[start..i].iter().collect());
                out.push('?');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    (out, names)
}
