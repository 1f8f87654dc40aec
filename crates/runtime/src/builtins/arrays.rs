//! Array builtins and the array-literal constructor

use super::{as_array, need};
use crate::engine::Engine;
use crate::interp::{pop_call_args, Ctx, StackCell};
use tern_core::array::{HeapArray, MaxSize};
use tern_core::{RuntimeError, Value};

/// `({ e1, e2, ... })`: the compiler pushed the elements and an
/// argument-count marker; build the heap array.
pub fn array_literal(
    engine: &mut Engine,
    ctx: &mut Ctx,
    stack: &mut Vec<StackCell>,
) -> Result<(), RuntimeError> {
    let elems = pop_call_args(engine, ctx, stack)?;
    stack.push(StackCell::Value(Value::Array(HeapArray::with_values(
        elems,
        MaxSize::Unlimited,
    ))));
    Ok(())
}

/// Logical size of a container: array or mapping length, string byte
/// length, 0 for anything else.
pub fn bi_sizeof(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "sizeof")?;
    let n = match &args[0] {
        Value::Array(a) => a.borrow().len() as i64,
        Value::Mapping(m) => m.borrow().len() as i64,
        Value::Str(s) => s.len() as i64,
        _ => 0,
    };
    Ok(Value::Int(n))
}

/// Index of the first structurally-equal element, or -1.
pub fn bi_member_array(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "member_array")?;
    let arr = as_array(&args[1])?;
    let arr = arr.borrow();
    let found = arr
        .values()
        .iter()
        .position(|v| *v == args[0])
        .map(|p| p as i64)
        .unwrap_or(-1);
    Ok(Value::Int(found))
}

fn sort_key(v: &Value) -> (i64, i64, String) {
    match v {
        Value::Int(n) => (0, *n, String::new()),
        Value::Str(s) => (1, 0, s.clone()),
        Value::Obj(r) => (2, r.0 as i64, String::new()),
        Value::Array(_) => (3, 0, String::new()),
        Value::Mapping(_) => (4, 0, String::new()),
    }
}

/// Sort in place: integers numerically, strings lexicographically,
/// mixed types grouped by kind. Returns the same array handle.
pub fn bi_sort_array(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "sort_array")?;
    let arr = as_array(&args[0])?;
    arr.borrow_mut().values_mut().sort_by_key(sort_key);
    Ok(args.into_iter().next().unwrap())
}

/// Reverse in place; returns the same handle.
pub fn bi_reverse(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "reverse")?;
    let arr = as_array(&args[0])?;
    arr.borrow_mut().reverse();
    Ok(args.into_iter().next().unwrap())
}

/// A new array with later duplicates removed (structural equality for
/// scalars, identity for containers).
pub fn bi_unique_array(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "unique_array")?;
    let arr = as_array(&args[0])?;
    let arr = arr.borrow();
    let mut out: Vec<Value> = Vec::with_capacity(arr.len());
    for v in arr.values() {
        if !out.iter().any(|seen| seen == v) {
            out.push(v.clone());
        }
    }
    Ok(Value::Array(HeapArray::with_values(out, MaxSize::Unlimited)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_key_groups_types() {
        let mut vals = vec![
            Value::Str("b".into()),
            Value::Int(3),
            Value::Int(1),
            Value::Str("a".into()),
        ];
        vals.sort_by_key(sort_key);
        assert_eq!(
            vals,
            vec![
                Value::Int(1),
                Value::Int(3),
                Value::Str("a".into()),
                Value::Str("b".into())
            ]
        );
    }
}
