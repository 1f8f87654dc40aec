//! Mapping builtins and the mapping-literal constructor

use super::{as_mapping, need};
use crate::engine::Engine;
use crate::interp::{pop_call_args, Ctx, StackCell};
use tern_core::array::{HeapArray, MaxSize};
use tern_core::mapping::HeapMapping;
use tern_core::{MapKey, RuntimeError, Value};

/// `([ k1 : v1, ... ])`: the compiler pushed alternating keys and
/// values with an even argument count.
pub fn mapping_literal(
    engine: &mut Engine,
    ctx: &mut Ctx,
    stack: &mut Vec<StackCell>,
) -> Result<(), RuntimeError> {
    let flat = pop_call_args(engine, ctx, stack)?;
    if flat.len() % 2 != 0 {
        return Err(RuntimeError::Other(
            "mapping literal with odd element count".to_string(),
        ));
    }
    let handle = HeapMapping::new();
    {
        let mut map = handle.borrow_mut();
        let mut it = flat.into_iter();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            let key = MapKey::from_value(&k).ok_or(RuntimeError::TypeMismatch {
                expected: "hashable key",
                found: k.type_name(),
            })?;
            map.set(key, v);
        }
    }
    stack.push(StackCell::Value(Value::Mapping(handle)));
    Ok(())
}

pub fn bi_keys(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "keys")?;
    let map = as_mapping(&args[0])?;
    let keys: Vec<Value> = map.borrow().keys().iter().map(|k| k.to_value()).collect();
    Ok(Value::Array(HeapArray::with_values(keys, MaxSize::Unlimited)))
}

pub fn bi_values(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "values")?;
    let map = as_mapping(&args[0])?;
    let values = map.borrow().values();
    Ok(Value::Array(HeapArray::with_values(
        values,
        MaxSize::Unlimited,
    )))
}

/// Remove a key; 1 when it was present.
pub fn bi_map_delete(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "map_delete")?;
    let map = as_mapping(&args[0])?;
    let key = MapKey::from_value(&args[1]).ok_or(RuntimeError::TypeMismatch {
        expected: "hashable key",
        found: args[1].type_name(),
    })?;
    let removed = map.borrow_mut().delete(&key);
    engine.dirty(ctx.obj);
    Ok(Value::Int(removed as i64))
}

pub fn bi_member(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "member")?;
    let map = as_mapping(&args[0])?;
    let key = MapKey::from_value(&args[1]).ok_or(RuntimeError::TypeMismatch {
        expected: "hashable key",
        found: args[1].type_name(),
    })?;
    let contains = map.borrow().contains(&key);
    Ok(Value::Int(contains as i64))
}
