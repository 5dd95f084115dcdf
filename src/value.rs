use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A host type token: the target of an `EXT_BIND` record. Carries the
/// zero-argument constructor the replay side invokes to rebuild an instance.
pub struct HostType {
    name: String,
    construct: Box<dyn Fn() -> Value + Send + Sync>,
}

impl HostType {
    pub fn new<F>(name: &str, construct: F) -> Arc<HostType>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Arc::new(HostType {
            name: name.to_string(),
            construct: Box::new(construct),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn construct(&self) -> Value {
        (self.construct)()
    }
}

impl fmt::Debug for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostType").field("name", &self.name).finish()
    }
}

/// A host object the codec cannot represent natively. It travels through the
/// writer's `serialize` fallback unless it (or its type) has been bound.
pub struct OpaqueValue {
    kind: Arc<HostType>,
    data: Box<dyn Any + Send + Sync>,
}

impl OpaqueValue {
    pub fn new<T: Any + Send + Sync>(kind: Arc<HostType>, data: T) -> Arc<OpaqueValue> {
        Arc::new(OpaqueValue {
            kind,
            data: Box::new(data),
        })
    }

    pub fn kind(&self) -> &Arc<HostType> {
        &self.kind
    }

    pub fn data(&self) -> &(dyn Any + Send + Sync) {
        self.data.as_ref()
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object at {:p}>", self.kind.name(), self as *const _)
    }
}

/// The abstract sum type the codec records and replays. One variant per wire
/// shape; replay-only markers (thread switch, stack delta, dropped, bind) are
/// produced through the reader's factory callbacks instead of variants.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Big-endian two's-complement byte string for integers past 64 bits.
    BigInt(Vec<u8>),
    Float(f64),
    Bytes(Vec<u8>),
    Str(Arc<str>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    /// A pre-serialized blob, fed to the host deserializer on replay.
    Pickled(Vec<u8>),
    /// Reference to a writer-allocated handle slot.
    HandleRef(u32),
    /// Reference to an out-of-band binding slot.
    BindingRef(u32),
    Type(Arc<HostType>),
    Opaque(Arc<OpaqueValue>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    /// Host-level identity, where the value has one. Interned-string dedup,
    /// bindings and free hooks all key on this.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(Arc::as_ptr(s) as *const u8 as usize),
            Value::Type(t) => Some(Arc::as_ptr(t) as usize),
            Value::Opaque(o) => Some(Arc::as_ptr(o) as usize),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Pickled(_) => "pickled",
            Value::HandleRef(_) => "handle",
            Value::BindingRef(_) => "binding",
            Value::Type(_) => "type",
            Value::Opaque(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (None, None) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (BigInt(a), BigInt(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Tuple(a), Tuple(b)) => a == b,
            (Dict(a), Dict(b)) => a == b,
            (Set(a), Set(b)) => a == b,
            (FrozenSet(a), FrozenSet(b)) => a == b,
            (Pickled(a), Pickled(b)) => a == b,
            (HandleRef(a), HandleRef(b)) => a == b,
            (BindingRef(a), BindingRef(b)) => a == b,
            (Type(a), Type(b)) => Arc::ptr_eq(a, b),
            (Opaque(a), Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_follows_the_allocation_not_the_contents() {
        let a = Value::str("abc");
        let b = Value::str("abc");
        assert_eq!(a, b);
        assert_ne!(a.identity(), b.identity());
        assert_eq!(a.identity(), a.clone().identity());
    }

    #[test]
    fn types_compare_by_pointer() {
        let t1 = HostType::new("Widget", || Value::None);
        let t2 = HostType::new("Widget", || Value::None);
        assert_eq!(Value::Type(t1.clone()), Value::Type(t1.clone()));
        assert_ne!(Value::Type(t1), Value::Type(t2));
    }

    #[test]
    fn opaque_carries_its_kind_and_payload() {
        let t = HostType::new("Conn", || Value::None);
        let o = OpaqueValue::new(t.clone(), 42u32);
        assert!(Arc::ptr_eq(o.kind(), &t));
        assert_eq!(o.data().downcast_ref::<u32>(), Some(&42));
    }
}
