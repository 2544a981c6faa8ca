//! Payload values exchanged between host and worker.
//!
//! [`Value`] is generic over the handle representation so the same tree type is
//! used in all three places a payload lives:
//!
//! - on the wire, handles are bare [`HandleId`]s ([`WireValue`]),
//! - inside the worker, handles are live objects,
//! - on the host, handles are [`AccessHandle`](crate::access::AccessHandle)s.
//!
//! Moving between them is a single tree walk with [`Value::try_map_handles`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;

/// Caller-chosen identifier of an execution context.
pub type ContextId = u64;

/// Numeric id of a live object, minted by the registry that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A self-describing payload tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value<H> {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value<H>>),
    Map(BTreeMap<String, Value<H>>),
    Handle(H),
    Error(RemoteError),
}

/// Payload as it travels over the pipe.
pub type WireValue = Value<HandleId>;

/// Keyword arguments of a call.
pub type Kwargs<H> = BTreeMap<String, Value<H>>;

impl<H> Value<H> {
    /// Rewrite every handle in the tree, stopping at the first failure.
    pub fn try_map_handles<G, E>(
        self,
        f: &mut impl FnMut(H) -> Result<G, E>,
    ) -> Result<Value<G>, E> {
        Ok(match self {
            Value::Nil => Value::Nil,
            Value::Bool(b) => Value::Bool(b),
            Value::Int(i) => Value::Int(i),
            Value::Float(x) => Value::Float(x),
            Value::Str(s) => Value::Str(s),
            Value::Bytes(b) => Value::Bytes(b),
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| item.try_map_handles(f))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, v.try_map_handles(f)?)))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Handle(h) => Value::Handle(f(h)?),
            Value::Error(e) => Value::Error(e),
        })
    }

    /// Infallible variant of [`Value::try_map_handles`].
    pub fn map_handles<G>(self, f: &mut impl FnMut(H) -> G) -> Value<G> {
        match self.try_map_handles(&mut |h| Ok::<_, Infallible>(f(h))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Handle(_) => "handle",
            Value::Error(_) => "error",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value<H>]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value<H>>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&H> {
        match self {
            Value::Handle(h) => Some(h),
            _ => None,
        }
    }

    pub fn into_handle(self) -> Option<H> {
        match self {
            Value::Handle(h) => Some(h),
            _ => None,
        }
    }
}

impl<H> Default for Value<H> {
    fn default() -> Self {
        Value::Nil
    }
}

impl<H> From<bool> for Value<H> {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<H> From<i64> for Value<H> {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl<H> From<f64> for Value<H> {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl<H> From<&str> for Value<H> {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl<H> From<String> for Value<H> {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<H> From<Vec<Value<H>>> for Value<H> {
    fn from(items: Vec<Value<H>>) -> Self {
        Value::List(items)
    }
}

impl<H> From<RemoteError> for Value<H> {
    fn from(err: RemoteError) -> Self {
        Value::Error(err)
    }
}

/// Kind tag of an error raised inside a called function.
///
/// Serialized as a plain string so a host can receive tags it does not know
/// about; those land in [`ErrorKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    Value,
    Type,
    Key,
    Index,
    Attribute,
    Io,
    StaleHandle,
    Internal,
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::Value => "value",
            ErrorKind::Type => "type",
            ErrorKind::Key => "key",
            ErrorKind::Index => "index",
            ErrorKind::Attribute => "attribute",
            ErrorKind::Io => "io",
            ErrorKind::StaleHandle => "stale_handle",
            ErrorKind::Internal => "internal",
            ErrorKind::Other(tag) => tag,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "value" => ErrorKind::Value,
            "type" => ErrorKind::Type,
            "key" => ErrorKind::Key,
            "index" => ErrorKind::Index,
            "attribute" => ErrorKind::Attribute,
            "io" => ErrorKind::Io,
            "stale_handle" => ErrorKind::StaleHandle,
            "internal" => ErrorKind::Internal,
            _ => ErrorKind::Other(tag),
        }
    }
}

impl From<&str> for ErrorKind {
    fn from(tag: &str) -> Self {
        ErrorKind::from(tag.to_string())
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by a called function, carried as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub fields: BTreeMap<String, WireValue>,
    /// Human-readable trace captured where the error was raised.
    #[serde(default)]
    pub trace: Option<String>,
}

impl RemoteError {
    const HANDLE_ID_FIELD: &'static str = "handle_id";

    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fields: BTreeMap::new(),
            trace: None,
        }
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Attribute, message)
    }

    pub fn io(err: &std::io::Error, what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Io, format!("{}: {}", what, err))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// A lookup of `id` failed in the registry that should have minted it.
    pub fn stale_handle(id: HandleId) -> Self {
        Self::new(
            ErrorKind::StaleHandle,
            format!("handle {} is unknown to this context", id),
        )
        .with_field(Self::HANDLE_ID_FIELD, Value::Int(id.0 as i64))
    }

    pub fn with_field(mut self, name: impl Into<String>, value: WireValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Handle id attached by [`RemoteError::stale_handle`].
    pub fn handle_id(&self) -> Option<HandleId> {
        self.fields
            .get(Self::HANDLE_ID_FIELD)
            .and_then(Value::as_int)
            .and_then(|id| u64::try_from(id).ok())
            .map(HandleId)
    }
}
