//! Call arguments and the coercion table.

use std::fmt;

use serde_json::Value;

/// A dynamically typed argument as supplied by a front end.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArgument {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<CallArgument>),
    /// Handle to a session, by id.
    Session(String),
}

impl CallArgument {
    /// Convert a script value. Objects are only accepted as session handles
    /// (`{"session_id": ".."}`).
    pub fn from_json(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64()?),
            },
            Value::String(s) => Self::Str(s.clone()),
            Value::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect::<Option<_>>()?)
            }
            Value::Object(_) => Self::Session(session_handle(value)?.to_string()),
        })
    }

    const fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Str(_) | Self::Int(_) | Self::Float(_) | Self::Bool(_)
        )
    }

    fn scalar_string(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Null | Self::List(_) | Self::Session(_) => None,
        }
    }
}

/// Session id carried by a `{"session_id": ".."}` object, if `value` is one.
pub fn session_handle(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get("session_id")?.as_str()
}

impl fmt::Display for CallArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Session(id) => write!(f, "<session {id}>"),
        }
    }
}

impl From<&str> for CallArgument {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for CallArgument {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for CallArgument {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for CallArgument {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for CallArgument {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Declared parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Int,
    Float,
    Bool,
    StrList,
    Session,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Str => "string",
            Self::Int => "integer",
            Self::Float => "number",
            Self::Bool => "boolean",
            Self::StrList => "list",
            Self::Session => "session",
        })
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    /// Filled in when a reduced-arity call omits this parameter.
    pub default: Option<CallArgument>,
}

impl Param {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind, default: CallArgument) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Some(default),
        }
    }
}

/// Failures while adapting front-end arguments to a declared signature.
/// All of them are raised before any network call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdaptationError {
    #[error("{function} expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("{function}: `{param}` expects {kind}, got {value}")]
    Type {
        function: String,
        param: String,
        kind: ParamKind,
        value: String,
    },

    #[error("{function}: unsupported argument value {value}")]
    UnsupportedValue { function: String, value: String },

    #[error("unterminated quote in command line")]
    UnterminatedQuote,

    #[error("invalid tool input: {0}")]
    ToolInput(String),

    #[error("{function}: {message}")]
    Binder { function: String, message: String },

    #[error("no bound argument named `{0}`")]
    Missing(String),
}

/// Coerce `arg` into `kind`, or return `None` when the table has no rule.
pub fn coerce(arg: &CallArgument, kind: ParamKind) -> Option<CallArgument> {
    use CallArgument as A;
    match (kind, arg) {
        (ParamKind::Str, a) if a.is_scalar() => a.scalar_string().map(A::Str),

        (ParamKind::Int, A::Int(i)) => Some(A::Int(*i)),
        #[allow(clippy::cast_possible_truncation)]
        (ParamKind::Int, A::Float(f))
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 =>
        {
            Some(A::Int(*f as i64))
        }
        (ParamKind::Int, A::Str(s)) => s.trim().parse().ok().map(A::Int),

        #[allow(clippy::cast_precision_loss)]
        (ParamKind::Float, A::Int(i)) => Some(A::Float(*i as f64)),
        (ParamKind::Float, A::Float(f)) => Some(A::Float(*f)),
        (ParamKind::Float, A::Str(s)) => s.trim().parse().ok().map(A::Float),

        (ParamKind::Bool, A::Bool(b)) => Some(A::Bool(*b)),
        (ParamKind::Bool, A::Int(0)) => Some(A::Bool(false)),
        (ParamKind::Bool, A::Int(1)) => Some(A::Bool(true)),
        (ParamKind::Bool, A::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(A::Bool(true)),
            "false" | "no" | "0" => Some(A::Bool(false)),
            _ => None,
        },

        (ParamKind::StrList, A::List(items)) => items
            .iter()
            .map(|item| item.scalar_string().map(A::Str))
            .collect::<Option<Vec<_>>>()
            .map(A::List),
        (ParamKind::StrList, A::Str(s)) => Some(A::List(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(A::from)
                .collect(),
        )),

        (ParamKind::Session, A::Session(id) | A::Str(id)) => Some(A::Session(id.clone())),

        _ => None,
    }
}

/// Arguments after adaptation: one typed value per declared parameter, in
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    values: Vec<(String, CallArgument)>,
}

impl BoundArgs {
    pub(crate) fn push(&mut self, name: impl Into<String>, value: CallArgument) {
        self.values.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&CallArgument> {
        self.values
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CallArgument)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    fn require(&self, name: &str) -> Result<&CallArgument, AdaptationError> {
        self.get(name)
            .ok_or_else(|| AdaptationError::Missing(name.to_string()))
    }

    pub fn str(&self, name: &str) -> Result<&str, AdaptationError> {
        match self.require(name)? {
            CallArgument::Str(s) => Ok(s),
            _ => Err(AdaptationError::Missing(name.to_string())),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, AdaptationError> {
        match self.require(name)? {
            CallArgument::Int(i) => Ok(*i),
            _ => Err(AdaptationError::Missing(name.to_string())),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, AdaptationError> {
        match self.require(name)? {
            CallArgument::Float(f) => Ok(*f),
            _ => Err(AdaptationError::Missing(name.to_string())),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool, AdaptationError> {
        match self.require(name)? {
            CallArgument::Bool(b) => Ok(*b),
            _ => Err(AdaptationError::Missing(name.to_string())),
        }
    }

    /// Id of a session-typed argument.
    pub fn session(&self, name: &str) -> Result<&str, AdaptationError> {
        match self.require(name)? {
            CallArgument::Session(id) => Ok(id),
            _ => Err(AdaptationError::Missing(name.to_string())),
        }
    }

    pub fn str_list(&self, name: &str) -> Result<Vec<String>, AdaptationError> {
        match self.require(name)? {
            CallArgument::List(items) => Ok(items
                .iter()
                .filter_map(|item| match item {
                    CallArgument::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()),
            _ => Err(AdaptationError::Missing(name.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn str_accepts_any_scalar() {
        assert_eq!(coerce(&7_i64.into(), ParamKind::Str), Some("7".into()));
        assert_eq!(coerce(&true.into(), ParamKind::Str), Some("true".into()));
        assert_eq!(coerce(&CallArgument::Null, ParamKind::Str), None);
        assert_eq!(
            coerce(&CallArgument::List(vec![]), ParamKind::Str),
            None
        );
    }

    #[test]
    fn int_accepts_integral_float_and_numeric_string() {
        assert_eq!(coerce(&3.0.into(), ParamKind::Int), Some(3_i64.into()));
        assert_eq!(coerce(&3.5.into(), ParamKind::Int), None);
        assert_eq!(coerce(&" 42 ".into(), ParamKind::Int), Some(42_i64.into()));
        assert_eq!(coerce(&"4x".into(), ParamKind::Int), None);
        assert_eq!(coerce(&true.into(), ParamKind::Int), None);
    }

    #[test]
    fn float_accepts_int_and_string() {
        assert_eq!(coerce(&2_i64.into(), ParamKind::Float), Some(2.0.into()));
        assert_eq!(coerce(&"0.25".into(), ParamKind::Float), Some(0.25.into()));
    }

    #[test]
    fn bool_table() {
        for (raw, want) in [
            ("true", true),
            ("YES", true),
            ("1", true),
            ("false", false),
            ("no", false),
            ("0", false),
        ] {
            assert_eq!(coerce(&raw.into(), ParamKind::Bool), Some(want.into()), "{raw}");
        }
        assert_eq!(coerce(&1_i64.into(), ParamKind::Bool), Some(true.into()));
        assert_eq!(coerce(&2_i64.into(), ParamKind::Bool), None);
        assert_eq!(coerce(&"maybe".into(), ParamKind::Bool), None);
    }

    #[test]
    fn str_list_from_list_or_comma_string() {
        let want = CallArgument::List(vec!["a".into(), "b".into()]);
        assert_eq!(coerce(&"a, b".into(), ParamKind::StrList), Some(want.clone()));
        assert_eq!(
            coerce(
                &CallArgument::List(vec!["a".into(), "b".into()]),
                ParamKind::StrList
            ),
            Some(want)
        );
        assert_eq!(
            coerce(&CallArgument::List(vec![1_i64.into()]), ParamKind::StrList),
            Some(CallArgument::List(vec!["1".into()]))
        );
    }

    #[test]
    fn session_from_handle_or_id() {
        let want = Some(CallArgument::Session("S1".into()));
        assert_eq!(coerce(&"S1".into(), ParamKind::Session), want);
        assert_eq!(
            coerce(&CallArgument::Session("S1".into()), ParamKind::Session),
            want
        );
    }

    #[test]
    fn json_values_convert() {
        assert_eq!(CallArgument::from_json(&json!(5)), Some(5_i64.into()));
        assert_eq!(CallArgument::from_json(&json!(0.5)), Some(0.5.into()));
        assert_eq!(
            CallArgument::from_json(&json!({"session_id": "S2"})),
            Some(CallArgument::Session("S2".into()))
        );
        assert_eq!(CallArgument::from_json(&json!({"other": 1})), None);
    }

    #[test]
    fn bound_args_typed_access() {
        let mut args = BoundArgs::default();
        args.push("path", "/etc/passwd".into());
        args.push("chunk", 4096_i64.into());
        assert_eq!(args.str("path").unwrap(), "/etc/passwd");
        assert_eq!(args.int("chunk").unwrap(), 4096);
        assert!(matches!(args.int("path"), Err(AdaptationError::Missing(_))));
        assert!(args.str("nope").is_err());
    }
}
