use serde::Serialize;

use crate::error::Error;

/// A single argument or result: a tensor, or one of the scalar kinds that may travel alongside
/// tensors in a flat argument list.
#[derive(Clone, Debug, PartialEq)]
pub enum Value<T> {
    Tensor(T),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ValueKind {
    Tensor,
    Int,
    Float,
    Bool,
    None,
}

impl<T> Value<T> {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Tensor(_) => ValueKind::Tensor,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::None => ValueKind::None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Tensor(_))
    }

    pub fn as_tensor(&self) -> Option<&T> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Value<U> {
        self.try_map(|t| Ok::<_, std::convert::Infallible>(f(t)))
            .unwrap_or_else(|never| match never {})
    }

    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Value<U>, E> {
        Ok(match self {
            Value::Tensor(t) => Value::Tensor(f(t)?),
            Value::Int(i) => Value::Int(i),
            Value::Float(x) => Value::Float(x),
            Value::Bool(b) => Value::Bool(b),
            Value::None => Value::None,
        })
    }

    /// The same scalar for any tensor type, or `None` if this is a tensor.
    pub fn scalar<U>(&self) -> Option<Value<U>> {
        match self {
            Value::Tensor(_) => None,
            Value::Int(i) => Some(Value::Int(*i)),
            Value::Float(x) => Some(Value::Float(*x)),
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::None => Some(Value::None),
        }
    }

    pub fn as_ref(&self) -> Value<&T> {
        match self {
            Value::Tensor(t) => Value::Tensor(t),
            Value::Int(i) => Value::Int(*i),
            Value::Float(x) => Value::Float(*x),
            Value::Bool(b) => Value::Bool(*b),
            Value::None => Value::None,
        }
    }
}

impl<T: Clone> Value<T> {
    pub fn tensor(&self) -> Result<T, Error> {
        match self {
            Value::Tensor(t) => Ok(t.clone()),
            other => Err(Error::Invariant(format!(
                "expected a tensor value, found {:?}",
                other.kind()
            ))),
        }
    }
}

impl<T: std::fmt::Display> std::fmt::Display for Value<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Tensor(t) => write!(f, "{}", t),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::None => write!(f, "None"),
        }
    }
}
