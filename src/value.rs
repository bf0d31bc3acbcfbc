//! The `Value` tagged union and the primitive arithmetic/comparison rules
//! that do not require heap dispatch.
//!
//! `Value` is `Copy`: heap variants carry a [`HeapId`] rather than owning
//! data directly, so copying a `Value` never allocates and never runs a
//! destructor. Ownership of the referenced heap object is tracked by the
//! collector through roots and the mark phase (see [`crate::heap`]), not by
//! `Value` itself.

use std::fmt;

use crate::heap::HeapId;

/// A size literal's component breakdown, as written in source (`2kb3b`).
/// Components are summed lazily via [`Size::total_bytes`]; the tuple form is
/// kept because the original surface syntax is a decreasing sequence of
/// unit suffixes and round-tripping the written form is occasionally useful
/// for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub gb: u64,
    pub mb: u64,
    pub kb: u64,
    pub b: u64,
}

impl Size {
    pub fn total_bytes(self) -> u64 {
        self.gb * 1024 * 1024 * 1024 + self.mb * 1024 * 1024 + self.kb * 1024 + self.b
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.total_bytes())
    }
}

/// A duration literal's component breakdown (`1h30min`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Duration {
    pub h: u64,
    pub min: u64,
    pub s: u64,
    pub ms: u64,
}

impl Duration {
    pub fn total_millis(self) -> u64 {
        self.h * 3_600_000 + self.min * 60_000 + self.s * 1000 + self.ms
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.total_millis())
    }
}

/// The VM's tagged value. Six primitive variants are inlined; the eleven
/// heap-object variants each carry a [`HeapId`] into the owning collector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i32),
    Real(f64),
    Bool(bool),
    Null,
    Size(Size),
    Duration(Duration),
    String(HeapId),
    Acl(HeapId),
    List(HeapId),
    Dict(HeapId),
    Function(HeapId),
    Extension(HeapId),
    Action(HeapId),
    Module(HeapId),
    SubRoutine(HeapId),
    Iterator(HeapId),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Real(_) => "real",
            Self::Bool(_) => "boolean",
            Self::Null => "null",
            Self::Size(_) => "size",
            Self::Duration(_) => "duration",
            Self::String(_) => "string",
            Self::Acl(_) => "acl",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Function(_) => "function",
            Self::Extension(_) => "extension",
            Self::Action(_) => "action",
            Self::Module(_) => "module",
            Self::SubRoutine(_) => "sub_routine",
            Self::Iterator(_) => "iterator",
        }
    }

    /// Is this variant one whose payload is a [`HeapId`]?
    pub fn heap_id(&self) -> Option<HeapId> {
        match *self {
            Self::String(id)
            | Self::Acl(id)
            | Self::List(id)
            | Self::Dict(id)
            | Self::Function(id)
            | Self::Extension(id)
            | Self::Action(id)
            | Self::Module(id)
            | Self::SubRoutine(id)
            | Self::Iterator(id) => Some(id),
            _ => None,
        }
    }

    /// `ToBoolean` for primitives that don't need heap dispatch. Matches the
    /// conventional VCL truthiness: `null`, `false`, integer `0`, and real
    /// `0.0` are falsy, everything else truthy, by design parity with the
    /// source implementation's `ConvertToBoolean`.
    pub fn to_bool_primitive(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Null => Some(false),
            Self::Int(i) => Some(*i != 0),
            Self::Real(r) => Some(*r != 0.0),
            _ => None,
        }
    }
}

/// The result of promoting two primitive operands for arithmetic, per the
/// promotion table: int⊕int→int, real⊕*→real, bool contributes 0/1.
#[derive(Debug, Clone, Copy)]
pub enum Promoted {
    Int(i32, i32),
    Real(f64, f64),
}

/// Failure reasons specific to primitive arithmetic; folded into
/// `RuntimeFailure` by callers in `runtime.rs` and `fold.rs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArithError {
    Unsupported,
    DivideByZero,
}

fn as_numeric(v: &Value) -> Option<Promoted> {
    match v {
        Value::Int(i) => Some(Promoted::Int(*i, 0)),
        Value::Real(r) => Some(Promoted::Real(*r, 0.0)),
        Value::Bool(b) => Some(Promoted::Int(i32::from(*b), 0)),
        _ => None,
    }
}

/// Promotes two primitive values for a binary arithmetic operator. Returns
/// `None` if either side is not a primitive numeric (heap dispatch or
/// "unsupported" happens one level up).
pub fn promote(lhs: &Value, rhs: &Value) -> Option<Promoted> {
    let l = as_numeric(lhs)?;
    let r = as_numeric(rhs)?;
    match (l, r) {
        (Promoted::Real(a, _), Promoted::Real(b, _)) => Some(Promoted::Real(a, b)),
        (Promoted::Real(a, _), Promoted::Int(b, _)) => Some(Promoted::Real(a, f64::from(b))),
        (Promoted::Int(a, _), Promoted::Real(b, _)) => Some(Promoted::Real(f64::from(a), b)),
        (Promoted::Int(a, _), Promoted::Int(b, _)) => Some(Promoted::Int(a, b)),
    }
}

pub fn add(lhs: &Value, rhs: &Value) -> Result<Value, ArithError> {
    match promote(lhs, rhs).ok_or(ArithError::Unsupported)? {
        Promoted::Int(a, b) => Ok(Value::Int(a.wrapping_add(b))),
        Promoted::Real(a, b) => Ok(Value::Real(a + b)),
    }
}

pub fn sub(lhs: &Value, rhs: &Value) -> Result<Value, ArithError> {
    match promote(lhs, rhs).ok_or(ArithError::Unsupported)? {
        Promoted::Int(a, b) => Ok(Value::Int(a.wrapping_sub(b))),
        Promoted::Real(a, b) => Ok(Value::Real(a - b)),
    }
}

pub fn mul(lhs: &Value, rhs: &Value) -> Result<Value, ArithError> {
    match promote(lhs, rhs).ok_or(ArithError::Unsupported)? {
        Promoted::Int(a, b) => Ok(Value::Int(a.wrapping_mul(b))),
        Promoted::Real(a, b) => Ok(Value::Real(a * b)),
    }
}

pub fn div(lhs: &Value, rhs: &Value) -> Result<Value, ArithError> {
    match promote(lhs, rhs).ok_or(ArithError::Unsupported)? {
        Promoted::Int(a, b) => {
            if b == 0 {
                Err(ArithError::DivideByZero)
            } else {
                Ok(Value::Int(a.wrapping_div(b)))
            }
        }
        Promoted::Real(a, b) => {
            if b == 0.0 {
                Err(ArithError::DivideByZero)
            } else {
                Ok(Value::Real(a / b))
            }
        }
    }
}

/// Modulo is defined only on integer operands (§4.7).
pub fn rem(lhs: &Value, rhs: &Value) -> Result<Value, ArithError> {
    match promote(lhs, rhs).ok_or(ArithError::Unsupported)? {
        Promoted::Int(a, b) => {
            if b == 0 {
                Err(ArithError::DivideByZero)
            } else {
                Ok(Value::Int(a.wrapping_rem(b)))
            }
        }
        Promoted::Real(_, _) => Err(ArithError::Unsupported),
    }
}

/// Primitive equality. Heap variants compare by calling into the object
/// protocol (`crate::object`); `None` means "ask the heap".
pub fn eq_primitive(lhs: &Value, rhs: &Value) -> Option<bool> {
    Some(match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Real(a), Value::Real(b)) => a == b,
        (Value::Int(a), Value::Real(b)) | (Value::Real(b), Value::Int(a)) => f64::from(*a) == *b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Size(a), Value::Size(b)) => a.total_bytes() == b.total_bytes(),
        (Value::Duration(a), Value::Duration(b)) => a.total_millis() == b.total_millis(),
        (Value::Null, _) | (_, Value::Null) => false,
        _ => return None,
    })
}

/// Primitive ordering for `<`,`<=`,`>`,`>=`. `None` means "ask the heap" or
/// "unsupported".
pub fn cmp_primitive(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match promote(lhs, rhs) {
        Some(Promoted::Int(a, b)) => a.partial_cmp(&b),
        Some(Promoted::Real(a, b)) => a.partial_cmp(&b),
        None => match (lhs, rhs) {
            (Value::Size(a), Value::Size(b)) => a.total_bytes().partial_cmp(&b.total_bytes()),
            (Value::Duration(a), Value::Duration(b)) => a.total_millis().partial_cmp(&b.total_millis()),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_int_stays_int() {
        assert_eq!(add(&Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(5));
    }

    #[test]
    fn real_contaminates() {
        assert_eq!(mul(&Value::Int(2), &Value::Real(1.5)).unwrap(), Value::Real(3.0));
    }

    #[test]
    fn bool_is_zero_or_one() {
        assert_eq!(add(&Value::Bool(true), &Value::Int(1)).unwrap(), Value::Int(2));
    }

    #[test]
    fn div_by_zero_is_an_error() {
        assert_eq!(div(&Value::Int(1), &Value::Int(0)), Err(ArithError::DivideByZero));
    }

    #[test]
    fn mod_rejects_reals() {
        assert_eq!(rem(&Value::Real(1.0), &Value::Int(2)), Err(ArithError::Unsupported));
    }

    #[test]
    fn size_orders_by_total_bytes() {
        let a = Value::Size(Size { kb: 2, ..Default::default() });
        let b = Value::Size(Size { b: 2048, ..Default::default() });
        assert_eq!(eq_primitive(&a, &b), Some(true));
    }
}
