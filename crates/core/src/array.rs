//! Heap arrays
//!
//! A contiguous sequence of values with a logical size and a declared
//! upper bound. `int v[10]` fixes the bound at 10; the unsized forms
//! `int *v` and `int v[]` leave it unlimited. Reads are bounds-checked
//! against the current size; writes may grow the array up to the bound,
//! zero-filling any intermediate cells.

use crate::error::RuntimeError;
use crate::value::{ArrayHandle, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Declared upper bound of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSize {
    Bounded(u32),
    Unlimited,
}

impl MaxSize {
    pub fn admits(self, index: usize) -> bool {
        match self {
            MaxSize::Bounded(n) => index < n as usize,
            MaxSize::Unlimited => true,
        }
    }

    /// Encoding used in declarations and subscript instructions: 0 is
    /// reserved for mappings, 1 for scalars, so an unlimited array
    /// travels as the sentinel.
    pub fn to_marker(self) -> u32 {
        match self {
            MaxSize::Bounded(n) => n,
            MaxSize::Unlimited => u32::MAX,
        }
    }

    pub fn from_marker(marker: u32) -> MaxSize {
        if marker == u32::MAX {
            MaxSize::Unlimited
        } else {
            MaxSize::Bounded(marker)
        }
    }
}

#[derive(Debug)]
pub struct HeapArray {
    elems: Vec<Value>,
    max_size: MaxSize,
}

impl HeapArray {
    pub fn new(max_size: MaxSize) -> ArrayHandle {
        Rc::new(RefCell::new(HeapArray {
            elems: Vec::new(),
            max_size,
        }))
    }

    pub fn with_values(values: Vec<Value>, max_size: MaxSize) -> ArrayHandle {
        Rc::new(RefCell::new(HeapArray {
            elems: values,
            max_size,
        }))
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn max_size(&self) -> MaxSize {
        self.max_size
    }

    /// Bounds-checked read. Reading past the current size is an error
    /// even when the declared bound would admit the index.
    pub fn get(&self, index: i64) -> Result<Value, RuntimeError> {
        if index < 0 || index as usize >= self.elems.len() {
            return Err(RuntimeError::OutOfBounds {
                index,
                size: self.elems.len() as u32,
            });
        }
        Ok(self.elems[index as usize].clone())
    }

    /// Bounds-checked write. Growing is permitted up to the declared
    /// bound; intermediate cells are initialized to integer 0. A write
    /// at or past the bound fails without mutation.
    pub fn set(&mut self, index: i64, value: Value) -> Result<(), RuntimeError> {
        if index < 0 {
            return Err(RuntimeError::OutOfBounds {
                index,
                size: self.elems.len() as u32,
            });
        }
        let idx = index as usize;
        if !self.max_size.admits(idx) {
            return Err(RuntimeError::OutOfBounds {
                index,
                size: self.max_size.to_marker(),
            });
        }
        if idx >= self.elems.len() {
            self.elems.resize(idx + 1, Value::zero());
        }
        self.elems[idx] = value;
        Ok(())
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        let idx = self.elems.len() as i64;
        self.set(idx, value)
    }

    pub fn values(&self) -> &[Value] {
        &self.elems
    }

    pub fn values_mut(&mut self) -> &mut Vec<Value> {
        &mut self.elems
    }

    /// Reverse in place.
    pub fn reverse(&mut self) {
        self.elems.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_zero_fills() {
        let arr = HeapArray::with_values(vec![Value::Int(10), Value::Int(20), Value::Int(30)], MaxSize::Unlimited);
        arr.borrow_mut().set(5, Value::Int(99)).unwrap();
        let a = arr.borrow();
        assert_eq!(a.len(), 6);
        assert_eq!(a.get(3).unwrap(), Value::Int(0));
        assert_eq!(a.get(4).unwrap(), Value::Int(0));
        assert_eq!(a.get(5).unwrap(), Value::Int(99));
    }

    #[test]
    fn test_bounded_write_fails_without_mutation() {
        let arr = HeapArray::new(MaxSize::Bounded(4));
        arr.borrow_mut().set(3, Value::Int(1)).unwrap();
        let err = arr.borrow_mut().set(4, Value::Int(2));
        assert!(err.is_err());
        assert_eq!(arr.borrow().len(), 4);
    }

    #[test]
    fn test_read_past_size_fails() {
        let arr = HeapArray::new(MaxSize::Bounded(10));
        arr.borrow_mut().set(0, Value::Int(7)).unwrap();
        assert!(arr.borrow().get(1).is_err());
        assert!(arr.borrow().get(-1).is_err());
    }

    #[test]
    fn test_marker_roundtrip() {
        assert_eq!(MaxSize::from_marker(MaxSize::Unlimited.to_marker()), MaxSize::Unlimited);
        assert_eq!(MaxSize::from_marker(MaxSize::Bounded(12).to_marker()), MaxSize::Bounded(12));
    }
}
