//! Values that can cross a CapTP connection.
//!
//! Plain data (numbers, strings, lists, records, errors) is copied. Local
//! objects and promises are exported by reference; references imported from
//! a peer appear as [`RemoteRef`]s.

use crate::link::RemoteRef;
use crate::promise::LocalPromise;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// The eventual outcome of a method invocation: `Err` carries the rejection reason.
pub type Reply = BoxFuture<'static, Result<Value, Value>>;

/// A local object that peers may invoke methods on.
///
/// `invoke` is called synchronously, in the order deliveries arrive for this
/// object. Work that must wait (for example on another remote call) goes in
/// the returned future.
pub trait Remotable: Send + Sync + 'static {
    /// Interface name advertised next to the object's slot.
    fn interface(&self) -> &str {
        "Remotable"
    }

    fn invoke(&self, method: &str, args: Vec<Value>) -> Reply;
}

/// Wrap an already-known outcome as a [`Reply`].
pub fn reply(result: Result<Value, Value>) -> Reply {
    futures::future::ready(result).boxed()
}

/// A passable value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    /// A rejection reason or error report.
    Error(String),
    /// A local object, exported by reference.
    Object(Arc<dyn Remotable>),
    /// A local promise, exported by reference and resolved later.
    Promise(LocalPromise),
    /// A presence or promise imported from a peer.
    Remote(RemoteRef),
}

impl Value {
    pub fn error(message: impl Into<String>) -> Self {
        Value::Error(message.into())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn object<T: Remotable>(obj: T) -> Self {
        Value::Object(Arc::new(obj))
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteRef> {
        match self {
            Value::Remote(r) => Some(r),
            _ => None,
        }
    }

    /// Whether this value is passed by reference rather than copied.
    pub fn is_capability(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Promise(_) | Value::Remote(_))
    }

    /// True when the value holds no reference imported from any peer.
    pub fn is_only_local(&self) -> bool {
        match self {
            Value::Remote(_) => false,
            Value::List(items) => items.iter().all(Value::is_only_local),
            Value::Record(fields) => fields.values().all(Value::is_only_local),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Error(_) => "error",
            Value::Object(_) => "object",
            Value::Promise(_) => "promise",
            Value::Remote(r) if r.is_presence() => "presence",
            Value::Remote(_) => "remote promise",
        }
    }

    /// Human-readable form used when a value becomes a rejection message.
    pub fn describe(&self) -> String {
        match self {
            Value::Error(message) => message.clone(),
            Value::String(s) => s.clone(),
            other => format!("{other:?}"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Record(fields) => f.debug_map().entries(fields).finish(),
            Value::Error(message) => write!(f, "Error({message:?})"),
            Value::Object(obj) => write!(f, "Object({})", obj.interface()),
            Value::Promise(p) => write!(f, "{p:?}"),
            Value::Remote(r) => write!(f, "{r:?}"),
        }
    }
}

/// Structural equality for data, identity for references.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => object_key(a) == object_key(b),
            (Value::Promise(a), Value::Promise(b)) => a.id() == b.id(),
            (Value::Remote(a), Value::Remote(b)) => a.same_reference(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<RemoteRef> for Value {
    fn from(r: RemoteRef) -> Self {
        Value::Remote(r)
    }
}

impl From<LocalPromise> for Value {
    fn from(p: LocalPromise) -> Self {
        Value::Promise(p)
    }
}

/// Identity of a local object: the address of its shared allocation.
pub(crate) fn object_key(obj: &Arc<dyn Remotable>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

/// Invoke a local method, turning panics (before or after the first await)
/// into rejections so they never reach protocol machinery.
pub(crate) fn invoke_guarded(obj: &Arc<dyn Remotable>, method: &str, args: Vec<Value>) -> Reply {
    let started = std::panic::catch_unwind(AssertUnwindSafe(|| obj.invoke(method, args)));
    let method = method.to_string();
    match started {
        Ok(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .map(move |outcome| outcome.unwrap_or_else(|payload| Err(panic_reason(&method, payload))))
            .boxed(),
        Err(payload) => reply(Err(panic_reason(&method, payload))),
    }
}

fn panic_reason(method: &str, payload: Box<dyn Any + Send>) -> Value {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Value::error(format!("{method}() panicked: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    struct Echo;

    impl Remotable for Echo {
        fn interface(&self) -> &str {
            "Echo"
        }

        fn invoke(&self, method: &str, args: Vec<Value>) -> Reply {
            match method {
                "echo" => reply(Ok(Value::List(args))),
                "boom" => panic!("kaboom"),
                "late_boom" => {
                    let n = args.len();
                    async move {
                        if n == 0 {
                            panic!("later");
                        }
                        Ok(Value::Int(n as i64))
                    }
                    .boxed()
                }
                _ => reply(Err(Value::error(format!("no method {method}")))),
            }
        }
    }

    #[test]
    fn test_identity_equality_for_objects() {
        let a = Value::object(Echo);
        let b = a.clone();
        let c = Value::object(Echo);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_structural_equality_for_data() {
        let a = Value::record([("x", Value::Int(1)), ("y", Value::from("two"))]);
        let b = Value::record([("y", Value::from("two")), ("x", Value::Int(1))]);
        assert_eq!(a, b);
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_is_only_local() {
        let v = Value::List(vec![Value::Int(1), Value::object(Echo)]);
        assert!(v.is_only_local());
    }

    #[test]
    fn test_invoke_guarded_catches_sync_panic() {
        let obj: Arc<dyn Remotable> = Arc::new(Echo);
        let result = invoke_guarded(&obj, "boom", vec![]).now_or_never().unwrap();
        match result {
            Err(Value::Error(msg)) => assert!(msg.contains("kaboom"), "got {msg}"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_invoke_guarded_catches_async_panic() {
        let obj: Arc<dyn Remotable> = Arc::new(Echo);
        let result = invoke_guarded(&obj, "late_boom", vec![]).now_or_never().unwrap();
        assert!(matches!(result, Err(Value::Error(msg)) if msg.contains("later")));
    }

    #[test]
    fn test_invoke_guarded_passes_results() {
        let obj: Arc<dyn Remotable> = Arc::new(Echo);
        let result = invoke_guarded(&obj, "echo", vec![Value::Int(5)])
            .now_or_never()
            .unwrap();
        assert_eq!(result, Ok(Value::List(vec![Value::Int(5)])));
    }
}
