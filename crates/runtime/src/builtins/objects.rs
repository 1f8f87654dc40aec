//! Object lifecycle and graph builtins

use super::{as_obj, as_str, need, need_at_least, obj_result};
use crate::engine::Engine;
use crate::interp::{self, Ctx};
use tern_core::array::{HeapArray, MaxSize};
use tern_core::{RuntimeError, Value};

/// call_other: the target and the function name ride under the
/// ordinary arguments.
pub fn bi_call_other(
    engine: &mut Engine,
    ctx: &mut Ctx,
    mut args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need_at_least(&args, 2, "call_other")?;
    let rest = args.split_off(2);
    let name = as_str(&args[1])?.to_string();
    let target = match &args[0] {
        Value::Obj(r) => *r,
        // A pathname names the prototype's object, loading it on demand.
        Value::Str(path) => match engine.protos.by_path(path) {
            Some(id) => engine.protos.get(id).unwrap().proto_obj,
            None => match engine.load_proto(path) {
                Ok(id) => engine.protos.get(id).unwrap().proto_obj,
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "call_other target failed to load");
                    return Ok(Value::zero());
                }
            },
        },
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "object",
                found: other.type_name(),
            })
        }
    };
    if !engine.store.is_live(target) {
        return Err(RuntimeError::MissingObject);
    }
    // External dispatch skips static functions; a missing function is a
    // result (0), not an error.
    let Some((func, definer)) = engine.find_function(target, &name, true) else {
        return Ok(Value::zero());
    };
    interp::call_function(
        engine,
        Some(ctx.obj),
        target,
        ctx.player,
        func,
        definer,
        rest,
    )
}

pub fn bi_clone_object(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "clone_object")?;
    let proto_id = match &args[0] {
        Value::Str(path) => match engine.load_proto(path) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "clone_object compile failed");
                if let Some(dev) = ctx.player.and_then(|p| engine.store.get(p)).and_then(|o| o.devnum) {
                    engine.conns.send(dev, &format!("{}: {}\n", path, e));
                }
                return Ok(Value::zero());
            }
        },
        Value::Obj(r) => {
            let o = engine.store.live(*r).ok_or(RuntimeError::MissingObject)?;
            o.proto.ok_or(RuntimeError::MissingObject)?
        }
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "object or string",
                found: other.type_name(),
            })
        }
    };
    let new = engine.clone_object(proto_id, ctx.player)?;
    Ok(Value::Obj(new))
}

/// Queues the target; `handle_destruct` drains after the current event.
/// Destroying somebody else's object needs PRIV.
pub fn bi_destruct(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "destruct")?;
    let target = as_obj(&args[0])?;
    if !engine.store.is_live(target) {
        return Ok(Value::Int(1));
    }
    if target != ctx.obj && !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    engine.queues.queue_for_destruct(target);
    Ok(Value::zero())
}

pub fn bi_contents(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "contents")?;
    let r = as_obj(&args[0])?;
    Ok(obj_result(engine.store.live(r).and_then(|o| o.contents)))
}

pub fn bi_next_object(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "next_object")?;
    let r = as_obj(&args[0])?;
    Ok(obj_result(engine.store.live(r).and_then(|o| o.next_object)))
}

pub fn bi_location(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "location")?;
    let r = as_obj(&args[0])?;
    Ok(obj_result(engine.store.live(r).and_then(|o| o.location)))
}

pub fn bi_next_child(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "next_child")?;
    let r = as_obj(&args[0])?;
    Ok(obj_result(engine.store.live(r).and_then(|o| o.next_child)))
}

/// A clone's parent is its prototype's object; a prototype's parent is
/// the object of its first inherit.
pub fn bi_parent(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "parent")?;
    let r = as_obj(&args[0])?;
    let Some(proto) = engine.proto_of(r) else {
        return Ok(Value::zero());
    };
    if proto.proto_obj != r {
        return Ok(Value::Obj(proto.proto_obj));
    }
    let parent = proto
        .program
        .inherits
        .first()
        .map(|e| e.path.clone())
        .and_then(|p| engine.protos.by_path(&p))
        .and_then(|id| engine.protos.get(id))
        .map(|p| p.proto_obj);
    Ok(obj_result(parent))
}

pub fn bi_next_proto(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "next_proto")?;
    let r = as_obj(&args[0])?;
    let id = engine.store.live(r).and_then(|o| o.proto);
    let next = engine
        .protos
        .next_after(id)
        .and_then(|n| engine.protos.get(n))
        .map(|p| p.proto_obj);
    Ok(obj_result(next))
}

/// Relocate an object, refusing containment cycles. Moving somebody
/// else's object from afar needs PRIV.
pub fn bi_move_object(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "move_object")?;
    let item = as_obj(&args[0])?;
    let dest = as_obj(&args[1])?;
    if !engine.store.is_live(item) || !engine.store.is_live(dest) {
        return Ok(Value::Int(1));
    }
    let item_loc = engine.store.get(item).and_then(|o| o.location);
    let allowed = engine.is_priv(ctx.obj)
        || item == ctx.obj
        || item_loc == Some(ctx.obj)
        || item_loc == engine.store.get(ctx.obj).and_then(|o| o.location);
    if !allowed {
        return Ok(Value::Int(1));
    }
    if engine.store.would_cycle(item, dest) {
        return Ok(Value::Int(1));
    }
    engine.store.link_location(item, dest);
    engine.dirty(item);
    engine.dirty(dest);
    Ok(Value::zero())
}

pub fn bi_this_object(
    _engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "this_object")?;
    Ok(Value::Obj(ctx.obj))
}

pub fn bi_this_player(
    _engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "this_player")?;
    Ok(obj_result(ctx.player))
}

pub fn bi_caller_object(
    _engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "caller_object")?;
    Ok(obj_result(ctx.caller))
}

pub fn bi_prototype(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "prototype")?;
    let r = as_obj(&args[0])?;
    Ok(obj_result(engine.proto_of(r).map(|p| p.proto_obj)))
}

/// Call a function on every object inside a container, passing any
/// extra arguments along. Returns the number of calls made.
pub fn bi_iterate(
    engine: &mut Engine,
    ctx: &mut Ctx,
    mut args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need_at_least(&args, 2, "iterate")?;
    let rest = args.split_off(2);
    let container = as_obj(&args[0])?;
    let func = as_str(&args[1])?.to_string();
    let mut count = 0i64;
    let mut cursor = engine.store.live(container).and_then(|o| o.contents);
    while let Some(item) = cursor {
        cursor = engine.store.get(item).and_then(|o| o.next_object);
        if let Some((f, definer)) = engine.find_function(item, &func, true) {
            interp::call_function(
                engine,
                Some(ctx.obj),
                item,
                ctx.player,
                f,
                definer,
                rest.clone(),
            )?;
            count += 1;
        }
    }
    Ok(Value::Int(count))
}

/// Attach this object as a component of `host`.
pub fn bi_attach(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "attach")?;
    let host = as_obj(&args[0])?;
    if !engine.store.is_live(host) || host == ctx.obj {
        return Ok(Value::Int(1));
    }
    engine.store.attach(ctx.obj, host);
    engine.dirty(ctx.obj);
    engine.dirty(host);
    Ok(Value::zero())
}

pub fn bi_this_component(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "this_component")?;
    Ok(obj_result(engine.store.live(ctx.obj).and_then(|o| o.attacher)))
}

/// Detach a component; with no argument, detach this object from its
/// attacher. Detaching somebody else's component needs PRIV.
pub fn bi_detach(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    let target = match args.first() {
        Some(v) if !v.is_zero() => as_obj(v)?,
        _ => ctx.obj,
    };
    if target != ctx.obj {
        let mine = engine
            .store
            .live(target)
            .map(|o| o.attacher == Some(ctx.obj))
            .unwrap_or(false);
        if !mine && !engine.is_priv(ctx.obj) {
            return Ok(Value::Int(1));
        }
    }
    engine.store.detach(target);
    engine.dirty(target);
    Ok(Value::zero())
}

/// All loaded prototypes' objects, as an array.
pub fn bi_objects(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "objects")?;
    let list: Vec<Value> = engine
        .protos
        .iter()
        .map(|(_, p)| Value::Obj(p.proto_obj))
        .collect();
    Ok(Value::Array(HeapArray::with_values(list, MaxSize::Unlimited)))
}

/// Every clone of a prototype, as an array.
pub fn bi_children(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "children")?;
    let r = as_obj(&args[0])?;
    let Some(proto) = engine.proto_of(r) else {
        return Ok(Value::Array(HeapArray::new(MaxSize::Unlimited)));
    };
    let head = proto.proto_obj;
    let mut out = Vec::new();
    let mut cursor = engine.store.live(head).and_then(|o| o.next_child);
    while let Some(c) = cursor {
        out.push(Value::Obj(c));
        cursor = engine.store.get(c).and_then(|o| o.next_child);
    }
    Ok(Value::Array(HeapArray::with_values(out, MaxSize::Unlimited)))
}

pub fn bi_all_inventory(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "all_inventory")?;
    let r = as_obj(&args[0])?;
    let mut out = Vec::new();
    let mut cursor = engine.store.live(r).and_then(|o| o.contents);
    while let Some(c) = cursor {
        out.push(Value::Obj(c));
        cursor = engine.store.get(c).and_then(|o| o.next_object);
    }
    Ok(Value::Array(HeapArray::with_values(out, MaxSize::Unlimited)))
}
