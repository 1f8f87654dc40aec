//! Heap mappings
//!
//! A hash table with separate chaining. Entries cache their hash so a
//! rehash never recomputes keys. Capacity is always a power of two; the
//! table doubles when the load factor crosses 0.75.
//!
//! Keys are the hashable value subset (`MapKey`): strings by bytes,
//! integers through a bit mix, objects by handle identity.

use crate::value::{MapKey, Value};
use std::cell::RefCell;
use std::rc::Rc;

const DEFAULT_CAPACITY: usize = 16;
const LOAD_FACTOR_NUM: usize = 3;
const LOAD_FACTOR_DEN: usize = 4;

struct Entry {
    key: MapKey,
    value: Value,
    hash: u32,
    next: Option<Box<Entry>>,
}

pub struct HeapMapping {
    buckets: Vec<Option<Box<Entry>>>,
    size: usize,
}

impl std::fmt::Debug for HeapMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapMapping")
            .field("size", &self.size)
            .field("capacity", &self.buckets.len())
            .finish()
    }
}

impl HeapMapping {
    pub fn new() -> Rc<RefCell<HeapMapping>> {
        Rc::new(RefCell::new(HeapMapping::with_capacity(DEFAULT_CAPACITY)))
    }

    fn with_capacity(capacity: usize) -> HeapMapping {
        debug_assert!(capacity.is_power_of_two());
        let mut buckets = Vec::with_capacity(capacity);
        buckets.resize_with(capacity, || None);
        HeapMapping { buckets, size: 0 }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, hash: u32) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    pub fn get(&self, key: &MapKey) -> Option<Value> {
        let hash = key.hash();
        let mut entry = self.buckets[self.bucket_of(hash)].as_deref();
        while let Some(e) = entry {
            if e.hash == hash && e.key == *key {
                return Some(e.value.clone());
            }
            entry = e.next.as_deref();
        }
        None
    }

    pub fn contains(&self, key: &MapKey) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite. Grows the table first when the new entry
    /// would breach the load factor.
    pub fn set(&mut self, key: MapKey, value: Value) {
        let hash = key.hash();
        let idx = self.bucket_of(hash);
        let mut entry = self.buckets[idx].as_deref_mut();
        while let Some(e) = entry {
            if e.hash == hash && e.key == key {
                e.value = value;
                return;
            }
            entry = e.next.as_deref_mut();
        }
        if (self.size + 1) * LOAD_FACTOR_DEN > self.buckets.len() * LOAD_FACTOR_NUM {
            self.rehash(self.buckets.len() * 2);
        }
        let idx = self.bucket_of(hash);
        let head = self.buckets[idx].take();
        self.buckets[idx] = Some(Box::new(Entry {
            key,
            value,
            hash,
            next: head,
        }));
        self.size += 1;
    }

    /// Remove an entry. Returns true when the key was present.
    pub fn delete(&mut self, key: &MapKey) -> bool {
        let hash = key.hash();
        let idx = self.bucket_of(hash);
        let mut slot = &mut self.buckets[idx];
        loop {
            match slot {
                None => return false,
                Some(e) if e.hash == hash && e.key == *key => {
                    let removed = slot.take().unwrap();
                    *slot = removed.next;
                    self.size -= 1;
                    return true;
                }
                Some(_) => {
                    slot = &mut slot.as_mut().unwrap().next;
                }
            }
        }
    }

    fn rehash(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.buckets, {
            let mut b = Vec::with_capacity(new_capacity);
            b.resize_with(new_capacity, || None);
            b
        });
        for head in old {
            let mut entry = head;
            while let Some(mut e) = entry {
                entry = e.next.take();
                let idx = (e.hash as usize) & (new_capacity - 1);
                e.next = self.buckets[idx].take();
                self.buckets[idx] = Some(e);
            }
        }
    }

    /// Visit every entry in bucket order. Used by keys()/values() and by
    /// the checkpoint writer, so the order is deterministic for a given
    /// insertion history.
    pub fn for_each<F: FnMut(&MapKey, &Value)>(&self, mut f: F) {
        for head in &self.buckets {
            let mut entry = head.as_deref();
            while let Some(e) = entry {
                f(&e.key, &e.value);
                entry = e.next.as_deref();
            }
        }
    }

    pub fn keys(&self) -> Vec<MapKey> {
        let mut out = Vec::with_capacity(self.size);
        self.for_each(|k, _| out.push(k.clone()));
        out
    }

    pub fn values(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.size);
        self.for_each(|_, v| out.push(v.clone()));
        out
    }

    /// Count of reachable entries across all buckets. Equal to `len()`
    /// by construction; exposed for the consistency tests.
    pub fn chained_count(&self) -> usize {
        let mut n = 0;
        self.for_each(|_, _| n += 1);
        n
    }
}

impl Default for HeapMapping {
    fn default() -> Self {
        HeapMapping::with_capacity(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjRef;

    #[test]
    fn test_set_get_delete() {
        let m = HeapMapping::new();
        let mut m = m.borrow_mut();
        m.set(MapKey::Str("a".into()), Value::Int(1));
        m.set(MapKey::Str("b".into()), Value::Int(2));
        assert_eq!(m.get(&MapKey::Str("a".into())), Some(Value::Int(1)));
        assert_eq!(m.len(), 2);
        m.set(MapKey::Str("a".into()), Value::Int(9));
        assert_eq!(m.get(&MapKey::Str("a".into())), Some(Value::Int(9)));
        assert_eq!(m.len(), 2);
        assert!(m.delete(&MapKey::Str("a".into())));
        assert!(!m.delete(&MapKey::Str("a".into())));
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&MapKey::Str("a".into())), None);
    }

    #[test]
    fn test_mixed_key_types() {
        let m = HeapMapping::new();
        let mut m = m.borrow_mut();
        m.set(MapKey::Int(3), Value::Str("three".into()));
        m.set(MapKey::Obj(ObjRef(3)), Value::Str("obj3".into()));
        // Integer 3 and object #3 are distinct keys even if they collide.
        assert_eq!(m.get(&MapKey::Int(3)), Some(Value::Str("three".into())));
        assert_eq!(m.get(&MapKey::Obj(ObjRef(3))), Some(Value::Str("obj3".into())));
    }

    #[test]
    fn test_growth_keeps_entries() {
        let m = HeapMapping::new();
        let mut m = m.borrow_mut();
        for i in 0..200 {
            m.set(MapKey::Int(i), Value::Int(i * 10));
        }
        assert!(m.capacity().is_power_of_two());
        assert!(m.capacity() >= 256);
        for i in 0..200 {
            assert_eq!(m.get(&MapKey::Int(i)), Some(Value::Int(i * 10)));
        }
        assert_eq!(m.len(), 200);
        assert_eq!(m.chained_count(), 200);
    }

    #[test]
    fn test_last_write_wins_after_churn() {
        let m = HeapMapping::new();
        let mut m = m.borrow_mut();
        for round in 0..5 {
            for i in 0..50 {
                m.set(MapKey::Int(i), Value::Int(round * 1000 + i));
            }
            for i in (0..50).step_by(2) {
                m.delete(&MapKey::Int(i));
            }
        }
        assert_eq!(m.get(&MapKey::Int(1)), Some(Value::Int(4001)));
        assert_eq!(m.get(&MapKey::Int(2)), None);
        assert_eq!(m.len(), m.chained_count());
    }

    #[test]
    fn test_keys_values_align() {
        let m = HeapMapping::new();
        let mut m = m.borrow_mut();
        m.set(MapKey::Str("x".into()), Value::Int(10));
        m.set(MapKey::Str("y".into()), Value::Int(20));
        let keys = m.keys();
        let values = m.values();
        assert_eq!(keys.len(), 2);
        for (k, v) in keys.iter().zip(values.iter()) {
            assert_eq!(m.get(k), Some(v.clone()));
        }
    }
}
