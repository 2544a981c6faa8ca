//! Live objects owned by an execution context.

use crate::value::{RemoteError, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared reference to a live object. Identity is the `Arc` allocation.
pub type ObjectRef = Arc<DirectObject>;

/// Payload whose handles are live objects.
pub type LocalValue = Value<ObjectRef>;

/// An object that lives inside an execution context and is addressed from
/// the other side of the pipe by handle.
#[derive(Debug, PartialEq)]
pub enum DirectObject {
    /// A leaf value with no handles in it.
    Scalar(LocalValue),
    Sequence(Vec<ObjectRef>),
    Mapping(BTreeMap<String, ObjectRef>),
    Module(ModuleObject),
}

/// A source file loaded into a context.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleObject {
    pub name: String,
    pub path: PathBuf,
    pub source: String,
}

impl ModuleObject {
    /// Read the file at `path`. The module name is the file stem.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            path: path.to_path_buf(),
            source,
        })
    }
}

impl DirectObject {
    /// Wrap a value into a live object.
    ///
    /// Lists and maps become containers of child objects, so items are stable
    /// objects with their own identity. A handle is returned as-is.
    pub fn from_value(value: LocalValue) -> ObjectRef {
        match value {
            Value::Handle(object) => object,
            Value::List(items) => Arc::new(DirectObject::Sequence(
                items.into_iter().map(DirectObject::from_value).collect(),
            )),
            Value::Map(entries) => Arc::new(DirectObject::Mapping(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, DirectObject::from_value(v)))
                    .collect(),
            )),
            scalar => Arc::new(DirectObject::Scalar(scalar)),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DirectObject::Scalar(value) => value.type_name(),
            DirectObject::Sequence(_) => "list",
            DirectObject::Mapping(_) => "map",
            DirectObject::Module(_) => "module",
        }
    }

    /// Plain value of the object. Modules stay handles.
    pub fn to_value(this: &ObjectRef) -> LocalValue {
        match this.as_ref() {
            DirectObject::Scalar(value) => value.clone(),
            DirectObject::Sequence(items) => {
                Value::List(items.iter().map(DirectObject::to_value).collect())
            }
            DirectObject::Mapping(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), DirectObject::to_value(v)))
                    .collect(),
            ),
            DirectObject::Module(_) => Value::Handle(Arc::clone(this)),
        }
    }

    /// Run a named method on `this`.
    pub fn call_method(
        this: &ObjectRef,
        method: &str,
        args: &[LocalValue],
    ) -> Result<LocalValue, RemoteError> {
        match method {
            "type_name" => Ok(Value::Str(this.type_name().to_string())),
            "value" => Ok(DirectObject::to_value(this)),
            "repr" => Ok(Value::Str(this.repr())),
            "len" => this.len().map(|n| Value::Int(n as i64)),
            "get_item" => {
                let key = args.first().ok_or_else(|| {
                    RemoteError::type_error("get_item() missing required argument 'key'")
                })?;
                this.get_item(key).map(Value::Handle)
            }
            "keys" => match this.as_ref() {
                DirectObject::Mapping(entries) => Ok(Value::List(
                    entries.keys().map(|k| Value::Str(k.clone())).collect(),
                )),
                other => Err(RemoteError::type_error(format!(
                    "'{}' object has no keys",
                    other.type_name()
                ))),
            },
            "name" | "path" | "source" | "line_count" | "lines" => {
                let DirectObject::Module(module) = this.as_ref() else {
                    return Err(no_attribute(this, method));
                };
                Ok(match method {
                    "name" => Value::Str(module.name.clone()),
                    "path" => Value::Str(module.path.to_string_lossy().into_owned()),
                    "source" => Value::Str(module.source.clone()),
                    "line_count" => Value::Int(module.source.lines().count() as i64),
                    _ => Value::List(
                        module
                            .source
                            .lines()
                            .map(|line| Value::Str(line.to_string()))
                            .collect(),
                    ),
                })
            }
            _ => Err(no_attribute(this, method)),
        }
    }

    fn len(&self) -> Result<usize, RemoteError> {
        match self {
            DirectObject::Sequence(items) => Ok(items.len()),
            DirectObject::Mapping(entries) => Ok(entries.len()),
            DirectObject::Scalar(Value::Str(s)) => Ok(s.chars().count()),
            DirectObject::Scalar(Value::Bytes(b)) => Ok(b.len()),
            other => Err(RemoteError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        }
    }

    fn get_item(&self, key: &LocalValue) -> Result<ObjectRef, RemoteError> {
        match (self, key) {
            (DirectObject::Sequence(items), Value::Int(index)) => {
                let len = items.len() as i64;
                let resolved = if *index < 0 { len + index } else { *index };
                if resolved < 0 || resolved >= len {
                    return Err(RemoteError::index(format!(
                        "index {} out of range for length {}",
                        index, len
                    ))
                    .with_field("index", Value::Int(*index)));
                }
                Ok(Arc::clone(&items[resolved as usize]))
            }
            (DirectObject::Mapping(entries), Value::Str(name)) => {
                entries.get(name).cloned().ok_or_else(|| {
                    RemoteError::key(format!("'{}'", name))
                        .with_field("key", Value::Str(name.clone()))
                })
            }
            (object, key) => Err(RemoteError::type_error(format!(
                "'{}' object cannot be indexed by '{}'",
                object.type_name(),
                key.type_name()
            ))),
        }
    }

    /// Debug-style text of the object.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out);
        out
    }

    fn write_repr(&self, out: &mut String) {
        match self {
            DirectObject::Scalar(value) => write_scalar(value, out),
            DirectObject::Sequence(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out);
                }
                out.push(']');
            }
            DirectObject::Mapping(entries) => {
                out.push('{');
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{:?}: ", key);
                    item.write_repr(out);
                }
                out.push('}');
            }
            DirectObject::Module(module) => {
                let _ = write!(
                    out,
                    "<module '{}' from '{}'>",
                    module.name,
                    module.path.display()
                );
            }
        }
    }
}

fn write_scalar(value: &LocalValue, out: &mut String) {
    let _ = match value {
        Value::Nil => write!(out, "nil"),
        Value::Bool(b) => write!(out, "{}", b),
        Value::Int(i) => write!(out, "{}", i),
        Value::Float(x) => write!(out, "{:?}", x),
        Value::Str(s) => write!(out, "{:?}", s),
        Value::Bytes(b) => write!(out, "<{} bytes>", b.len()),
        Value::Error(err) => write!(out, "<{}>", err),
        Value::Handle(object) => {
            object.write_repr(out);
            Ok(())
        }
        Value::List(_) | Value::Map(_) => write!(out, "<{}>", value.type_name()),
    };
}

fn no_attribute(this: &ObjectRef, method: &str) -> RemoteError {
    RemoteError::attribute(format!(
        "'{}' object has no attribute '{}'",
        this.type_name(),
        method
    ))
    .with_field("name", Value::Str(method.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ErrorKind;

    fn sample() -> ObjectRef {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert("b".to_string(), Value::List(vec![Value::Bool(true)]));
        DirectObject::from_value(Value::List(vec![
            Value::Str("first".into()),
            Value::Map(map),
        ]))
    }

    #[test]
    fn test_from_value_builds_containers() {
        let object = sample();
        assert_eq!(object.type_name(), "list");
        assert_eq!(
            DirectObject::call_method(&object, "len", &[]).unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn test_get_item_returns_stable_children() {
        let object = sample();
        let first = DirectObject::call_method(&object, "get_item", &[Value::Int(1)]).unwrap();
        let second = DirectObject::call_method(&object, "get_item", &[Value::Int(-1)]).unwrap();

        let (Value::Handle(first), Value::Handle(second)) = (first, second) else {
            panic!("Expected handles from get_item");
        };
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            DirectObject::call_method(&first, "keys", &[]).unwrap(),
            Value::List(vec![Value::Str("a".into()), Value::Str("b".into())])
        );
    }

    #[test]
    fn test_get_item_errors() {
        let object = sample();
        let err = DirectObject::call_method(&object, "get_item", &[Value::Int(5)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Index);

        let err = DirectObject::call_method(&object, "get_item", &[Value::Str("x".into())])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);

        let Value::Handle(mapping) =
            DirectObject::call_method(&object, "get_item", &[Value::Int(1)]).unwrap()
        else {
            panic!("Expected handle");
        };
        let err = DirectObject::call_method(&mapping, "get_item", &[Value::Str("zz".into())])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Key);
    }

    #[test]
    fn test_value_and_repr() {
        let object = sample();
        assert_eq!(
            DirectObject::call_method(&object, "repr", &[]).unwrap(),
            Value::Str("[\"first\", {\"a\": 1, \"b\": [true]}]".into())
        );
        let value = DirectObject::call_method(&object, "value", &[]).unwrap();
        assert_eq!(value.as_list().unwrap()[0], Value::Str("first".into()));
    }

    #[test]
    fn test_unknown_method_is_attribute_error() {
        let object = DirectObject::from_value(Value::Int(3));
        let err = DirectObject::call_method(&object, "frobnicate", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Attribute);
        assert_eq!(err.fields["name"], Value::Str("frobnicate".into()));

        let err = DirectObject::call_method(&object, "source", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Attribute);
    }

    #[test]
    fn test_module_methods() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("helpers.py");
        std::fs::write(&path, "def f():\n    return 1\n").unwrap();

        let module = Arc::new(DirectObject::Module(ModuleObject::load(&path).unwrap()));
        assert_eq!(
            DirectObject::call_method(&module, "name", &[]).unwrap(),
            Value::Str("helpers".into())
        );
        assert_eq!(
            DirectObject::call_method(&module, "line_count", &[]).unwrap(),
            Value::Int(2)
        );
        assert!(matches!(
            DirectObject::call_method(&module, "value", &[]).unwrap(),
            Value::Handle(_)
        ));
    }
}
