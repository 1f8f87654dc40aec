//! Tern runtime values
//!
//! A `Value` is what Tern programs compute with: integers, strings, object
//! handles, and refcounted heap arrays and mappings. Strings carry value
//! semantics (deep-copied on assignment); arrays and mappings are shared
//! handles (`Rc<RefCell<..>>`) whose refcount is the `Rc` strong count.
//! Object handles are non-owning stable indices into the object table;
//! their lifetime is governed by the object store, not by the value.
//!
//! The engine is single-threaded, so `Rc` (not `Arc`) is the right
//! refcount: values never cross a thread boundary.

use crate::array::HeapArray;
use crate::mapping::HeapMapping;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Stable handle of an object in the object table.
///
/// Handles survive paging and checkpoint/restore; a destructed object's
/// slot is recycled through the free list, so a stale handle may later
/// name a different object. Callers that care check the GARBAGE flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type ArrayHandle = Rc<RefCell<HeapArray>>;
pub type MappingHandle = Rc<RefCell<HeapMapping>>;

/// A first-class Tern value.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(String),
    Obj(ObjRef),
    Array(ArrayHandle),
    Mapping(MappingHandle),
}

impl Value {
    /// The canonical "empty" value: integer 0. Cleared slots, failed
    /// lookups, and unwound calls all produce this.
    pub fn zero() -> Value {
        Value::Int(0)
    }

    /// Type name for diagnostics and `typeof()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Str(_) => "string",
            Value::Obj(_) => "object",
            Value::Array(_) => "array",
            Value::Mapping(_) => "mapping",
        }
    }

    /// Numeric type tag for the `typeof()` builtin. Matches the
    /// persisted tag order: integer 0, string 1, object 2, array 3,
    /// mapping 4.
    pub fn type_tag(&self) -> i64 {
        match self {
            Value::Int(_) => 0,
            Value::Str(_) => 1,
            Value::Obj(_) => 2,
            Value::Array(_) => 3,
            Value::Mapping(_) => 4,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Value::Int(0))
    }

    /// Truth for branches: integer 0 is false, everything else true.
    pub fn is_true(&self) -> bool {
        !self.is_zero()
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Value {
        Value::zero()
    }
}

// Structural equality for scalars, identity for heap containers. This is
// what `==` in the language and member_array() compare with.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Mapping(a), Value::Mapping(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Hashable subset of `Value` used as mapping keys: strings hash by
/// bytes, integers by a bit-mixing function, objects by handle identity.
/// Arrays and mappings are not valid keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    Int(i64),
    Str(String),
    Obj(ObjRef),
}

impl MapKey {
    /// Try to convert a value into a key. Returns None for array and
    /// mapping values.
    pub fn from_value(value: &Value) -> Option<MapKey> {
        match value {
            Value::Int(n) => Some(MapKey::Int(*n)),
            Value::Str(s) => Some(MapKey::Str(s.clone())),
            Value::Obj(r) => Some(MapKey::Obj(*r)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Int(n) => Value::Int(*n),
            MapKey::Str(s) => Value::Str(s.clone()),
            MapKey::Obj(r) => Value::Obj(*r),
        }
    }
}

/// djb2 over the key bytes.
fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(b as u32);
    }
    hash
}

/// Integer bit-mix (the 0x45d9f3b finalizer).
fn hash_int(value: i64) -> u32 {
    let mut hash = value as u32 ^ ((value >> 32) as u32);
    hash = ((hash >> 16) ^ hash).wrapping_mul(0x45d9_f3b);
    hash = ((hash >> 16) ^ hash).wrapping_mul(0x45d9_f3b);
    (hash >> 16) ^ hash
}

impl MapKey {
    /// Hash used by the mapping's bucket selection. Cached per entry so
    /// rehashing never recomputes it.
    pub fn hash(&self) -> u32 {
        match self {
            MapKey::Str(s) => hash_str(s),
            MapKey::Int(n) => hash_int(*n),
            MapKey::Obj(r) => hash_int(r.0 as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{HeapArray, MaxSize};

    #[test]
    fn test_zero_is_false() {
        assert!(!Value::zero().is_true());
        assert!(Value::Int(1).is_true());
        assert!(Value::Str("".into()).is_true());
    }

    #[test]
    fn test_scalar_equality() {
        assert_eq!(Value::Int(3), Value::Int(3));
        assert_ne!(Value::Int(3), Value::Int(4));
        assert_eq!(Value::Str("a".into()), Value::Str("a".into()));
        assert_ne!(Value::Str("a".into()), Value::Int(0));
        assert_eq!(Value::Obj(ObjRef(7)), Value::Obj(ObjRef(7)));
    }

    #[test]
    fn test_array_equality_is_identity() {
        let a = HeapArray::with_values(vec![Value::Int(1)], MaxSize::Unlimited);
        let b = HeapArray::with_values(vec![Value::Int(1)], MaxSize::Unlimited);
        assert_eq!(Value::Array(a.clone()), Value::Array(a.clone()));
        assert_ne!(Value::Array(a), Value::Array(b));
    }

    #[test]
    fn test_map_key_from_value() {
        assert_eq!(
            MapKey::from_value(&Value::Int(5)),
            Some(MapKey::Int(5))
        );
        assert_eq!(
            MapKey::from_value(&Value::Str("k".into())),
            Some(MapKey::Str("k".into()))
        );
        let arr = HeapArray::with_values(vec![], MaxSize::Unlimited);
        assert_eq!(MapKey::from_value(&Value::Array(arr)), None);
    }

    #[test]
    fn test_hash_stability() {
        // djb2("abc") is a fixed quantity; keep the persisted hash fn honest.
        assert_eq!(MapKey::Str("abc".into()).hash(), MapKey::Str("abc".into()).hash());
        assert_ne!(MapKey::Int(1).hash(), MapKey::Int(2).hash());
        // Object keys hash by handle, not by content.
        assert_eq!(MapKey::Obj(ObjRef(3)).hash(), MapKey::Int(3).hash());
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(Value::Int(0).type_tag(), 0);
        assert_eq!(Value::Str(String::new()).type_tag(), 1);
        assert_eq!(Value::Obj(ObjRef(0)).type_tag(), 2);
    }
}
